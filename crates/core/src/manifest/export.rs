use itertools::Itertools;
use log::*;

use realmgate_dsl::Condition;

use crate::manifest::{
  AclDoc, Manifest, ManifestError, PrincipalDoc, RealmDoc, ResourceDoc, ResourceTypeDoc, RoleDoc,
};
use crate::store::Store;

/// Read a realm back into its manifest form.
///
/// Geometries export as EWKT (self-describing, so no `srid` member is
/// emitted); resources without an external id have no manifest identity and
/// are skipped. Build → import → export round-trips up to ordering.
pub async fn export_manifest(store: &Store, realm_name: &str) -> Result<Manifest, ManifestError> {
  let Some(realm) = store.realm_by_name(realm_name).await? else {
    return Err(ManifestError::UnknownRealm(realm_name.to_string()));
  };

  let keycloak_config = store.keycloak_config(realm.id).await?;

  let actions: Vec<String> =
    sqlx::query_scalar("SELECT name FROM action WHERE realm_id = $1 ORDER BY id")
      .bind(realm.id)
      .fetch_all(store.pool())
      .await?;

  let roles = sqlx::query_as::<_, (String, Option<serde_json::Value>)>(
    "SELECT name, attributes FROM auth_role WHERE realm_id = $1 ORDER BY id",
  )
  .bind(realm.id)
  .fetch_all(store.pool())
  .await?
  .into_iter()
  .map(|(name, attributes)| RoleDoc { name, attributes })
  .collect();

  let principal_rows = sqlx::query_as::<_, (i32, String, serde_json::Value)>(
    "SELECT id, username, attributes FROM principal WHERE realm_id = $1 ORDER BY id",
  )
  .bind(realm.id)
  .fetch_all(store.pool())
  .await?;

  let role_assignments: std::collections::HashMap<i32, Vec<String>> =
    sqlx::query_as::<_, (i32, String)>(
      "SELECT pr.principal_id, r.name FROM principal_roles pr \
       JOIN auth_role r ON r.id = pr.role_id \
       WHERE r.realm_id = $1 ORDER BY pr.role_id",
    )
    .bind(realm.id)
    .fetch_all(store.pool())
    .await?
    .into_iter()
    .into_group_map();

  let principals = principal_rows
    .into_iter()
    .map(|(id, username, attributes)| PrincipalDoc {
      username,
      roles: role_assignments.get(&id).cloned().unwrap_or_default(),
      attributes: if attributes == serde_json::json!({}) {
        None
      } else {
        Some(attributes)
      },
    })
    .collect();

  let resource_types = sqlx::query_as::<_, (String, bool)>(
    "SELECT name, is_public FROM resource_type WHERE realm_id = $1 ORDER BY id",
  )
  .bind(realm.id)
  .fetch_all(store.pool())
  .await?
  .into_iter()
  .map(|(name, is_public)| ResourceTypeDoc { name, is_public })
  .collect();

  let resources = sqlx::query_as::<_, (String, String, serde_json::Value, Option<String>)>(
    "SELECT e.external_id, rt.name, r.attributes, ST_AsEWKT(r.geometry) \
     FROM resource r \
     JOIN external_ids e \
       ON e.resource_id = r.id \
      AND e.realm_id = r.realm_id \
      AND e.resource_type_id = r.resource_type_id \
     JOIN resource_type rt ON rt.id = r.resource_type_id \
     WHERE r.realm_id = $1 ORDER BY r.id",
  )
  .bind(realm.id)
  .fetch_all(store.pool())
  .await?
  .into_iter()
  .map(|(external_id, resource_type, attributes, geometry)| ResourceDoc {
    external_id,
    resource_type,
    attributes: if attributes == serde_json::json!({}) {
      None
    } else {
      Some(attributes)
    },
    geometry: geometry.map(serde_json::Value::String),
    srid: None,
  })
  .collect();

  type AclRow = (
    i32,
    String,
    String,
    i32,
    i32,
    Option<String>,
    Option<String>,
    Option<serde_json::Value>,
  );
  let acl_rows = sqlx::query_as::<_, AclRow>(
    "SELECT a.id, rt.name, act.name, a.principal_id, a.role_id, ro.name, e.external_id, \
            a.conditions \
     FROM acl a \
     JOIN resource_type rt ON rt.id = a.resource_type_id \
     JOIN action act ON act.id = a.action_id \
     LEFT JOIN auth_role ro ON ro.id = a.role_id \
     LEFT JOIN external_ids e \
       ON e.resource_id = a.resource_id \
      AND e.realm_id = a.realm_id \
      AND e.resource_type_id = a.resource_type_id \
     WHERE a.realm_id = $1 ORDER BY a.id",
  )
  .bind(realm.id)
  .fetch_all(store.pool())
  .await?;

  let principal_names: std::collections::HashMap<i32, String> =
    sqlx::query_as::<_, (i32, String)>(
      "SELECT id, username FROM principal WHERE realm_id = $1",
    )
    .bind(realm.id)
    .fetch_all(store.pool())
    .await?
    .into_iter()
    .collect();

  let mut acls = Vec::with_capacity(acl_rows.len());
  for (id, resource_type, action, principal_id, role_id, role_name, external_id, stored) in
    acl_rows
  {
    let conditions = match stored {
      Some(value) => match Condition::from_value(&value) {
        Ok(cond) => cond,
        Err(err) => {
          warn!("skipping malformed stored condition on acl {id}: {err}");
          None
        }
      },
      None => None,
    };

    let mut doc = AclDoc {
      resource_type,
      action,
      resource_external_id: external_id,
      conditions,
      ..Default::default()
    };
    if role_id != 0 {
      doc.role = role_name;
    } else if principal_id != 0 {
      doc.principal = principal_names.get(&principal_id).cloned();
      if doc.principal.is_none() {
        doc.principal_id = Some(principal_id);
      }
    } else {
      doc.principal_id = Some(0);
    }
    acls.push(doc);
  }

  return Ok(Manifest {
    realm: RealmDoc {
      name: realm.name,
      description: realm.description,
      keycloak_config,
    },
    actions,
    roles,
    principals,
    resource_types,
    resources,
    acls,
  });
}
