use log::*;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;

use crate::acl::{NewAclRule, OnConflict, Subject, insert_acl};
use crate::manifest::{AclDoc, Manifest, ManifestError};
use crate::store::{
  GeometryInput, Store, insert_resource, provision_realm_partitions, upsert_keycloak_config,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
  pub realm_id: i32,
  pub actions: usize,
  pub roles: usize,
  pub principals: usize,
  pub resource_types: usize,
  pub resources: usize,
  pub acls: usize,
}

/// Apply a manifest in a single transaction.
///
/// Entities are upserted by name (resources by external id), so importing is
/// idempotent. ACL references are resolved against everything in the realm,
/// not just this manifest. Any unknown reference, ambiguous subject or
/// uncompilable condition rolls the whole import back.
pub async fn import_manifest(
  store: &Store,
  manifest: &Manifest,
) -> Result<ImportSummary, ManifestError> {
  let mut tx = store.pool().begin().await?;

  // Realm and its partitions.
  let realm_id: i32 = sqlx::query_scalar(
    "INSERT INTO realm (name, description) VALUES ($1, $2) \
     ON CONFLICT (name) DO UPDATE \
       SET description = COALESCE(EXCLUDED.description, realm.description) \
     RETURNING id",
  )
  .bind(&manifest.realm.name)
  .bind(&manifest.realm.description)
  .fetch_one(&mut *tx)
  .await?;
  provision_realm_partitions(&mut tx, realm_id, &manifest.realm.name).await?;

  if let Some(ref config) = manifest.realm.keycloak_config {
    upsert_keycloak_config(&mut *tx, realm_id, config).await?;
  }

  // Actions and resource types carry a (realm_id, name) unique key.
  for name in &manifest.actions {
    sqlx::query(
      "INSERT INTO action (realm_id, name) VALUES ($1, $2) \
       ON CONFLICT (realm_id, name) DO NOTHING",
    )
    .bind(realm_id)
    .bind(name)
    .execute(&mut *tx)
    .await?;
  }

  for rt in &manifest.resource_types {
    sqlx::query(
      "INSERT INTO resource_type (realm_id, name, is_public) VALUES ($1, $2, $3) \
       ON CONFLICT (realm_id, name) DO UPDATE SET is_public = EXCLUDED.is_public",
    )
    .bind(realm_id)
    .bind(&rt.name)
    .bind(rt.is_public)
    .execute(&mut *tx)
    .await?;
  }

  // Roles and principals have no name constraint, upsert by lookup.
  for role in &manifest.roles {
    let existing: Option<i32> =
      sqlx::query_scalar("SELECT id FROM auth_role WHERE realm_id = $1 AND name = $2")
        .bind(realm_id)
        .bind(&role.name)
        .fetch_optional(&mut *tx)
        .await?;

    match existing {
      Some(id) if role.attributes.is_some() => {
        sqlx::query("UPDATE auth_role SET attributes = $2 WHERE id = $1")
          .bind(id)
          .bind(&role.attributes)
          .execute(&mut *tx)
          .await?;
      }
      Some(_) => {}
      None => {
        sqlx::query("INSERT INTO auth_role (realm_id, name, attributes) VALUES ($1, $2, $3)")
          .bind(realm_id)
          .bind(&role.name)
          .bind(&role.attributes)
          .execute(&mut *tx)
          .await?;
      }
    }
  }

  let role_ids = name_to_id(&mut tx, "auth_role", realm_id).await?;

  for principal in &manifest.principals {
    let attributes = principal
      .attributes
      .clone()
      .unwrap_or_else(|| serde_json::json!({}));

    let existing: Option<i32> =
      sqlx::query_scalar("SELECT id FROM principal WHERE realm_id = $1 AND username = $2")
        .bind(realm_id)
        .bind(&principal.username)
        .fetch_optional(&mut *tx)
        .await?;

    let principal_id = match existing {
      Some(id) => {
        sqlx::query("UPDATE principal SET attributes = $2 WHERE id = $1")
          .bind(id)
          .bind(&attributes)
          .execute(&mut *tx)
          .await?;
        id
      }
      None => {
        sqlx::query_scalar(
          "INSERT INTO principal (realm_id, username, attributes) VALUES ($1, $2, $3) \
           RETURNING id",
        )
        .bind(realm_id)
        .bind(&principal.username)
        .bind(&attributes)
        .fetch_one(&mut *tx)
        .await?
      }
    };

    for role_name in &principal.roles {
      let Some(role_id) = role_ids.get(role_name) else {
        return Err(ManifestError::UnknownReference {
          kind: "role",
          name: role_name.clone(),
        });
      };
      sqlx::query(
        "INSERT INTO principal_roles (principal_id, role_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
      )
      .bind(principal_id)
      .bind(role_id)
      .execute(&mut *tx)
      .await?;
    }
  }

  // Resolution maps cover pre-existing realm entities as well.
  let action_ids = name_to_id(&mut tx, "action", realm_id).await?;
  let resource_type_ids = name_to_id(&mut tx, "resource_type", realm_id).await?;
  let principal_ids = username_to_id(&mut tx, realm_id).await?;

  for resource in &manifest.resources {
    let Some(&resource_type_id) = resource_type_ids.get(&resource.resource_type) else {
      return Err(ManifestError::UnknownReference {
        kind: "resource type",
        name: resource.resource_type.clone(),
      });
    };

    let attributes = resource
      .attributes
      .clone()
      .unwrap_or_else(|| serde_json::json!({}));
    let geometry = resource.geometry.clone().map(|value| GeometryInput {
      value,
      srid: resource.srid,
    });

    let existing: Option<i32> = sqlx::query_scalar(
      "SELECT resource_id FROM external_ids \
       WHERE realm_id = $1 AND resource_type_id = $2 AND external_id = $3",
    )
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(&resource.external_id)
    .fetch_optional(&mut *tx)
    .await?;

    match existing {
      Some(id) => {
        update_resource(&mut tx, realm_id, resource_type_id, id, &attributes, geometry.as_ref())
          .await?;
      }
      None => {
        let id =
          insert_resource(&mut tx, realm_id, resource_type_id, &attributes, geometry.as_ref())
            .await?;
        sqlx::query(
          "INSERT INTO external_ids (resource_id, realm_id, resource_type_id, external_id) \
           VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(realm_id)
        .bind(resource_type_id)
        .bind(&resource.external_id)
        .execute(&mut *tx)
        .await?;
      }
    }
  }

  for acl in &manifest.acls {
    let Some(&resource_type_id) = resource_type_ids.get(&acl.resource_type) else {
      return Err(ManifestError::UnknownReference {
        kind: "resource type",
        name: acl.resource_type.clone(),
      });
    };
    let Some(&action_id) = action_ids.get(&acl.action) else {
      return Err(ManifestError::UnknownReference {
        kind: "action",
        name: acl.action.clone(),
      });
    };

    let subject = resolve_subject(acl, &role_ids, &principal_ids)?;

    let resource_id = match &acl.resource_external_id {
      Some(external_id) => {
        let id: Option<i32> = sqlx::query_scalar(
          "SELECT resource_id FROM external_ids \
           WHERE realm_id = $1 AND resource_type_id = $2 AND external_id = $3",
        )
        .bind(realm_id)
        .bind(resource_type_id)
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
          return Err(ManifestError::UnknownReference {
            kind: "resource",
            name: external_id.clone(),
          });
        };
        Some(id)
      }
      None => None,
    };

    insert_acl(
      &mut tx,
      &NewAclRule {
        realm_id,
        resource_type_id,
        action_id,
        subject,
        resource_id,
        conditions: acl.conditions.clone(),
      },
      OnConflict::UpdateConditions,
    )
    .await?;
  }

  tx.commit().await?;

  let summary = ImportSummary {
    realm_id,
    actions: manifest.actions.len(),
    roles: manifest.roles.len(),
    principals: manifest.principals.len(),
    resource_types: manifest.resource_types.len(),
    resources: manifest.resources.len(),
    acls: manifest.acls.len(),
  };
  info!(
    "imported manifest for realm {:?}: {} resources, {} acls",
    manifest.realm.name, summary.resources, summary.acls
  );
  return Ok(summary);
}

fn resolve_subject(
  acl: &AclDoc,
  role_ids: &HashMap<String, i32>,
  principal_ids: &HashMap<String, i32>,
) -> Result<Subject, ManifestError> {
  let ambiguous = || ManifestError::AmbiguousSubject {
    resource_type: acl.resource_type.clone(),
    action: acl.action.clone(),
  };

  return match (&acl.role, &acl.principal, acl.principal_id) {
    (Some(role), None, None) => {
      let Some(&id) = role_ids.get(role) else {
        return Err(ManifestError::UnknownReference {
          kind: "role",
          name: role.clone(),
        });
      };
      Ok(Subject::Role(id))
    }
    (None, Some(username), None) => {
      let Some(&id) = principal_ids.get(username) else {
        return Err(ManifestError::UnknownReference {
          kind: "principal",
          name: username.clone(),
        });
      };
      Ok(Subject::Principal(id))
    }
    (None, None, Some(0)) => Ok(Subject::Anonymous),
    (None, None, Some(id)) => Ok(Subject::Principal(id)),
    _ => Err(ambiguous()),
  };
}

async fn update_resource(
  tx: &mut Transaction<'_, Postgres>,
  realm_id: i32,
  resource_type_id: i32,
  resource_id: i32,
  attributes: &serde_json::Value,
  geometry: Option<&GeometryInput>,
) -> Result<(), ManifestError> {
  let Some(geometry) = geometry else {
    sqlx::query(
      "UPDATE resource SET attributes = $4 \
       WHERE realm_id = $1 AND resource_type_id = $2 AND id = $3",
    )
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(resource_id)
    .bind(attributes)
    .execute(&mut **tx)
    .await?;
    return Ok(());
  };

  let sql = format!(
    "UPDATE resource SET attributes = $4, geometry = {geom} \
     WHERE realm_id = $1 AND resource_type_id = $2 AND id = $3",
    geom = geometry.sql_expr("$5").map_err(ManifestError::Store)?,
  );
  sqlx::query(&sql)
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(resource_id)
    .bind(attributes)
    .bind(geometry.as_text().map_err(ManifestError::Store)?)
    .execute(&mut **tx)
    .await?;
  return Ok(());
}

async fn name_to_id(
  tx: &mut Transaction<'_, Postgres>,
  table: &str,
  realm_id: i32,
) -> Result<HashMap<String, i32>, ManifestError> {
  let rows = sqlx::query_as::<_, (String, i32)>(&format!(
    "SELECT name, id FROM {table} WHERE realm_id = $1"
  ))
  .bind(realm_id)
  .fetch_all(&mut **tx)
  .await?;
  return Ok(rows.into_iter().collect());
}

async fn username_to_id(
  tx: &mut Transaction<'_, Postgres>,
  realm_id: i32,
) -> Result<HashMap<String, i32>, ManifestError> {
  let rows = sqlx::query_as::<_, (String, i32)>(
    "SELECT username, id FROM principal WHERE realm_id = $1",
  )
  .bind(realm_id)
  .fetch_all(&mut **tx)
  .await?;
  return Ok(rows.into_iter().collect());
}

#[cfg(test)]
mod tests {
  use super::*;

  fn acl_doc() -> AclDoc {
    return AclDoc {
      resource_type: "doc".to_string(),
      action: "view".to_string(),
      ..Default::default()
    };
  }

  #[test]
  fn test_resolve_subject() {
    let roles = HashMap::from([("editor".to_string(), 3)]);
    let principals = HashMap::from([("alice".to_string(), 7)]);

    let mut acl = acl_doc();
    acl.role = Some("editor".to_string());
    assert_eq!(resolve_subject(&acl, &roles, &principals).unwrap(), Subject::Role(3));

    let mut acl = acl_doc();
    acl.principal = Some("alice".to_string());
    assert_eq!(
      resolve_subject(&acl, &roles, &principals).unwrap(),
      Subject::Principal(7)
    );

    let mut acl = acl_doc();
    acl.principal_id = Some(0);
    assert_eq!(
      resolve_subject(&acl, &roles, &principals).unwrap(),
      Subject::Anonymous
    );
  }

  #[test]
  fn test_resolve_subject_rejects_ambiguity() {
    let roles = HashMap::from([("editor".to_string(), 3)]);
    let principals = HashMap::new();

    let acl = acl_doc();
    assert!(matches!(
      resolve_subject(&acl, &roles, &principals),
      Err(ManifestError::AmbiguousSubject { .. })
    ));

    let mut acl = acl_doc();
    acl.role = Some("editor".to_string());
    acl.principal_id = Some(4);
    assert!(matches!(
      resolve_subject(&acl, &roles, &principals),
      Err(ManifestError::AmbiguousSubject { .. })
    ));
  }

  #[test]
  fn test_resolve_subject_unknown_role() {
    let acl = {
      let mut acl = acl_doc();
      acl.role = Some("missing".to_string());
      acl
    };
    assert!(matches!(
      resolve_subject(&acl, &HashMap::new(), &HashMap::new()),
      Err(ManifestError::UnknownReference { kind: "role", .. })
    ));
  }
}
