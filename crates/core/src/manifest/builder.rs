use realmgate_dsl::Condition;

use crate::manifest::{
  AclDoc, Manifest, PrincipalDoc, RealmDoc, ResourceDoc, ResourceTypeDoc, RoleDoc,
};
use crate::store::KeycloakConfig;

/// Fluent assembly of a realm [`Manifest`].
///
/// ```ignore
/// let manifest = ManifestBuilder::new("MyRealm")
///   .add_resource_type("document", false)
///   .add_action("view")
///   .add_role("editor", None)
///   .add_principal("alice").with_role("editor").end()
///   .add_acl("document", "view")
///   .for_role("editor")
///   .when(attr("status").eq("active"))
///   .end()
///   .build();
/// ```
#[derive(Clone, Debug)]
pub struct ManifestBuilder {
  manifest: Manifest,
}

impl ManifestBuilder {
  pub fn new(realm_name: impl Into<String>) -> Self {
    return Self {
      manifest: Manifest {
        realm: RealmDoc {
          name: realm_name.into(),
          description: None,
          keycloak_config: None,
        },
        ..Default::default()
      },
    };
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.manifest.realm.description = Some(description.into());
    return self;
  }

  pub fn set_keycloak_config(mut self, config: KeycloakConfig) -> Self {
    self.manifest.realm.keycloak_config = Some(config);
    return self;
  }

  pub fn add_resource_type(mut self, name: impl Into<String>, is_public: bool) -> Self {
    self.manifest.resource_types.push(ResourceTypeDoc {
      name: name.into(),
      is_public,
    });
    return self;
  }

  pub fn add_action(mut self, name: impl Into<String>) -> Self {
    self.manifest.actions.push(name.into());
    return self;
  }

  pub fn add_role(
    mut self,
    name: impl Into<String>,
    attributes: Option<serde_json::Value>,
  ) -> Self {
    self.manifest.roles.push(RoleDoc {
      name: name.into(),
      attributes,
    });
    return self;
  }

  pub fn add_principal(self, username: impl Into<String>) -> PrincipalBuilder {
    return PrincipalBuilder {
      parent: self,
      doc: PrincipalDoc {
        username: username.into(),
        roles: vec![],
        attributes: None,
      },
    };
  }

  pub fn add_resource(
    self,
    external_id: impl Into<String>,
    resource_type: impl Into<String>,
  ) -> ResourceBuilder {
    return ResourceBuilder {
      parent: self,
      doc: ResourceDoc {
        external_id: external_id.into(),
        resource_type: resource_type.into(),
        attributes: None,
        geometry: None,
        srid: None,
      },
    };
  }

  pub fn add_acl(
    self,
    resource_type: impl Into<String>,
    action: impl Into<String>,
  ) -> AclBuilder {
    return AclBuilder {
      parent: self,
      doc: AclDoc {
        resource_type: resource_type.into(),
        action: action.into(),
        role: None,
        principal: None,
        principal_id: None,
        resource_external_id: None,
        conditions: None,
      },
    };
  }

  pub fn build(self) -> Manifest {
    return self.manifest;
  }
}

/// Sub-builder returned by [`ManifestBuilder::add_principal`].
#[derive(Clone, Debug)]
pub struct PrincipalBuilder {
  parent: ManifestBuilder,
  doc: PrincipalDoc,
}

impl PrincipalBuilder {
  pub fn with_role(mut self, role: impl Into<String>) -> Self {
    self.doc.roles.push(role.into());
    return self;
  }

  pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    let attributes = self
      .doc
      .attributes
      .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
    if let serde_json::Value::Object(map) = attributes {
      map.insert(key.into(), value);
    }
    return self;
  }

  pub fn end(mut self) -> ManifestBuilder {
    self.parent.manifest.principals.push(self.doc);
    return self.parent;
  }
}

/// Sub-builder returned by [`ManifestBuilder::add_resource`].
#[derive(Clone, Debug)]
pub struct ResourceBuilder {
  parent: ManifestBuilder,
  doc: ResourceDoc,
}

impl ResourceBuilder {
  pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    let attributes = self
      .doc
      .attributes
      .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
    if let serde_json::Value::Object(map) = attributes {
      map.insert(key.into(), value);
    }
    return self;
  }

  /// Attach a geometry (GeoJSON value, EWKT or WKT text) with an optional
  /// source SRID hint.
  pub fn with_geometry(mut self, geometry: serde_json::Value, srid: Option<i32>) -> Self {
    self.doc.geometry = Some(geometry);
    self.doc.srid = srid;
    return self;
  }

  pub fn end(mut self) -> ManifestBuilder {
    self.parent.manifest.resources.push(self.doc);
    return self.parent;
  }
}

/// Sub-builder returned by [`ManifestBuilder::add_acl`].
#[derive(Clone, Debug)]
pub struct AclBuilder {
  parent: ManifestBuilder,
  doc: AclDoc,
}

impl AclBuilder {
  pub fn for_role(mut self, role: impl Into<String>) -> Self {
    self.doc.role = Some(role.into());
    return self;
  }

  pub fn for_principal(mut self, username: impl Into<String>) -> Self {
    self.doc.principal = Some(username.into());
    return self;
  }

  /// Grant by raw principal id; `0` is the anonymous "any principal" grant.
  pub fn for_principal_id(mut self, principal_id: i32) -> Self {
    self.doc.principal_id = Some(principal_id);
    return self;
  }

  /// Restrict the grant to a single resource by its external id.
  pub fn for_resource(mut self, external_id: impl Into<String>) -> Self {
    self.doc.resource_external_id = Some(external_id.into());
    return self;
  }

  pub fn when(mut self, conditions: Condition) -> Self {
    self.doc.conditions = Some(conditions);
    return self;
  }

  pub fn end(mut self) -> ManifestBuilder {
    self.parent.manifest.acls.push(self.doc);
    return self.parent;
  }
}
