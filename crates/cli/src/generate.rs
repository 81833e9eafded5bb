use log::*;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column as _, Row as _, TypeInfo as _};
use thiserror::Error;

use realmgate::manifest::{AclBuilder, Manifest, ManifestBuilder};

use crate::config::{AclEntry, ColumnMappings, QueryConfig, ResourceTypeConfig, SyncConfig};

#[derive(Debug, Error)]
pub enum GenerateError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Assembles a realm manifest from the configured source queries.
pub struct ManifestGenerator<'a> {
  config: &'a SyncConfig,
  pool: &'a PgPool,
}

impl<'a> ManifestGenerator<'a> {
  pub fn new(config: &'a SyncConfig, pool: &'a PgPool) -> Self {
    return Self { config, pool };
  }

  pub async fn generate(&self) -> Result<Manifest, GenerateError> {
    let mut builder = ManifestBuilder::new(&self.config.realm.name);
    if let Some(ref description) = self.config.realm.description {
      builder = builder.with_description(description);
    }
    if let Some(ref kc) = self.config.realm.keycloak_config {
      builder = builder.set_keycloak_config(kc.clone());
    }

    for action in &self.config.actions {
      builder = builder.add_action(action);
    }

    // With Keycloak group sync enabled, roles and principals are owned by
    // the sync and the queries are skipped.
    if !self.config.uses_keycloak_sync() {
      if let Some(ref roles) = self.config.roles {
        builder = self.add_roles(builder, roles).await?;
      }
      if let Some(ref principals) = self.config.principals {
        builder = self.add_principals(builder, principals).await?;
      }
    }

    let total = self.config.resource_types.len();
    for (i, rt) in self.config.resource_types.iter().enumerate() {
      info!("[{}/{total}] processing resource type {:?}", i + 1, rt.name);
      builder = self.add_resource_type(builder, rt).await?;
    }

    return Ok(builder.build());
  }

  async fn add_roles(
    &self,
    mut builder: ManifestBuilder,
    roles: &QueryConfig,
  ) -> Result<ManifestBuilder, GenerateError> {
    for row in self.query_rows(roles).await? {
      let Some(name) = row.get("name").and_then(|v| v.as_str()) else {
        continue;
      };
      builder = builder.add_role(name, row.get("attributes").filter(|v| !v.is_null()).cloned());
    }
    return Ok(builder);
  }

  async fn add_principals(
    &self,
    mut builder: ManifestBuilder,
    principals: &QueryConfig,
  ) -> Result<ManifestBuilder, GenerateError> {
    for row in self.query_rows(principals).await? {
      let Some(username) = row.get("username").and_then(|v| v.as_str()) else {
        continue;
      };

      let mut principal = builder.add_principal(username);
      for role in json_string_array(row.get("roles")) {
        principal = principal.with_role(role);
      }
      if let Some(serde_json::Value::Object(attributes)) = row.get("attributes") {
        for (key, value) in attributes {
          principal = principal.with_attribute(key, value.clone());
        }
      }
      builder = principal.end();
    }
    return Ok(builder);
  }

  async fn add_resource_type(
    &self,
    mut builder: ManifestBuilder,
    rt: &ResourceTypeConfig,
  ) -> Result<ManifestBuilder, GenerateError> {
    builder = builder.add_resource_type(&rt.name, rt.is_public);

    for acl in rt.acls.iter().flatten() {
      builder = add_acl_entry(builder, &rt.name, acl, None);
    }

    if let Some(ref resources) = rt.resources {
      builder = self.add_queried_resources(builder, rt, resources).await?;
    }

    for resource in rt.resource_list.iter().flatten() {
      let mut res = builder.add_resource(&resource.external_id, &rt.name);
      if let Some(serde_json::Value::Object(ref attributes)) = resource.attributes {
        for (key, value) in attributes {
          res = res.with_attribute(key, value.clone());
        }
      }
      if let Some(ref geometry) = resource.geometry {
        res = res.with_geometry(geometry.clone(), resource.srid);
      }
      builder = res.end();

      for acl in resource.acls.iter().flatten() {
        builder = add_acl_entry(builder, &rt.name, acl, Some(&resource.external_id));
      }
    }

    return Ok(builder);
  }

  async fn add_queried_resources(
    &self,
    mut builder: ManifestBuilder,
    rt: &ResourceTypeConfig,
    resources: &QueryConfig,
  ) -> Result<ManifestBuilder, GenerateError> {
    let rows = self.query_rows(resources).await?;
    info!("fetched {} rows for {:?}", rows.len(), rt.name);

    let default_srid = resources.mappings.as_ref().and_then(|m| m.srid);

    for row in rows {
      // External ids may come out of legacy schemas as numbers.
      let external_id = match row.get("external_id") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => continue,
      };

      let mut res = builder.add_resource(external_id, &rt.name);
      if let Some(serde_json::Value::Object(attributes)) = row.get("attributes") {
        for (key, value) in attributes {
          res = res.with_attribute(key, value.clone());
        }
      }
      if let Some(geometry) = row.get("geometry").filter(|v| !v.is_null()) {
        let srid = row
          .get("srid")
          .and_then(|v| v.as_i64())
          .map(|v| v as i32)
          .or(default_srid);
        res = res.with_geometry(geometry.clone(), srid);
      }
      builder = res.end();
    }
    return Ok(builder);
  }

  async fn query_rows(
    &self,
    query: &QueryConfig,
  ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, GenerateError> {
    let rows = sqlx::query(&query.query).fetch_all(self.pool).await?;

    return Ok(
      rows
        .iter()
        .map(|row| {
          let mut json = row_to_json(row);
          if let Some(ref mappings) = query.mappings {
            apply_mappings(&mut json, mappings);
          }
          return json;
        })
        .collect(),
    );
  }
}

fn add_acl_entry(
  builder: ManifestBuilder,
  resource_type: &str,
  acl: &AclEntry,
  inherited_external_id: Option<&str>,
) -> ManifestBuilder {
  let mut entry: AclBuilder = builder.add_acl(resource_type, &acl.action);

  if let Some(ref role) = acl.role {
    entry = entry.for_role(role);
  } else if let Some(ref principal) = acl.principal {
    entry = entry.for_principal(principal);
  } else if let Some(principal_id) = acl.principal_id {
    entry = entry.for_principal_id(principal_id);
  }

  if let Some(external_id) = acl.resource_external_id.as_deref().or(inherited_external_id) {
    entry = entry.for_resource(external_id);
  }
  if let Some(ref conditions) = acl.conditions {
    entry = entry.when(conditions.clone());
  }
  return entry.end();
}

fn json_string_array(value: Option<&serde_json::Value>) -> Vec<String> {
  let Some(serde_json::Value::Array(items)) = value else {
    return vec![];
  };
  return items
    .iter()
    .filter_map(|v| v.as_str().map(str::to_string))
    .collect();
}

/// Rename row keys according to the configured column mappings.
fn apply_mappings(
  row: &mut serde_json::Map<String, serde_json::Value>,
  mappings: &ColumnMappings,
) {
  for (target, source) in mappings.renames() {
    if let Some(value) = row.remove(source) {
      row.insert(target.to_string(), value);
    }
  }
}

/// Best-effort conversion of an arbitrary query row into JSON. Columns of
/// unsupported types decode as text when possible, otherwise null.
fn row_to_json(row: &PgRow) -> serde_json::Map<String, serde_json::Value> {
  use serde_json::Value;

  let mut out = serde_json::Map::with_capacity(row.columns().len());
  for (i, column) in row.columns().iter().enumerate() {
    let value = match column.type_info().name() {
      "INT2" => row
        .try_get::<Option<i16>, _>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from),
      "INT4" => row
        .try_get::<Option<i32>, _>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from),
      "INT8" => row
        .try_get::<Option<i64>, _>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from),
      "FLOAT4" => row
        .try_get::<Option<f32>, _>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from),
      "FLOAT8" => row
        .try_get::<Option<f64>, _>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from),
      "BOOL" => row
        .try_get::<Option<bool>, _>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from),
      "JSON" | "JSONB" => row
        .try_get::<Option<Value>, _>(i)
        .ok()
        .flatten()
        .unwrap_or(Value::Null),
      "TEXT[]" | "VARCHAR[]" => row
        .try_get::<Option<Vec<String>>, _>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::from),
      _ => match row.try_get::<Option<String>, _>(i) {
        Ok(v) => v.map_or(Value::Null, Value::from),
        Err(_) => {
          warn!(
            "cannot decode column {:?} of type {:?}, treating as null",
            column.name(),
            column.type_info().name()
          );
          Value::Null
        }
      },
    };
    out.insert(column.name().to_string(), value);
  }
  return out;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    let serde_json::Value::Object(map) = value else {
      panic!("expected object");
    };
    return map;
  }

  #[test]
  fn test_apply_mappings_renames_keys() {
    let mut row = map(json!({"parcel_no": "p-1", "geom": "POINT(0 0)", "other": 1}));
    let mappings = ColumnMappings {
      external_id: Some("parcel_no".to_string()),
      geometry: Some("geom".to_string()),
      ..Default::default()
    };

    apply_mappings(&mut row, &mappings);
    assert_eq!(
      serde_json::Value::Object(row),
      json!({"external_id": "p-1", "geometry": "POINT(0 0)", "other": 1})
    );
  }

  #[test]
  fn test_apply_mappings_missing_source_is_noop() {
    let mut row = map(json!({"name": "editor"}));
    let mappings = ColumnMappings {
      name: Some("role_name".to_string()),
      ..Default::default()
    };
    apply_mappings(&mut row, &mappings);
    assert_eq!(serde_json::Value::Object(row), json!({"name": "editor"}));
  }

  #[test]
  fn test_json_string_array() {
    assert_eq!(
      json_string_array(Some(&json!(["a", "b"]))),
      vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(json_string_array(Some(&json!("not an array"))), Vec::<String>::new());
    assert_eq!(json_string_array(None), Vec::<String>::new());
  }

  #[test]
  fn test_acl_entry_inherits_resource_external_id() {
    let builder = ManifestBuilder::new("R");
    let acl = AclEntry {
      action: "view".to_string(),
      role: Some("editor".to_string()),
      principal: None,
      principal_id: None,
      resource_external_id: None,
      conditions: None,
    };

    let manifest = add_acl_entry(builder, "doc", &acl, Some("doc-7")).build();
    assert_eq!(manifest.acls[0].resource_external_id.as_deref(), Some("doc-7"));

    // An explicit id on the entry wins over the inherited one.
    let builder = ManifestBuilder::new("R");
    let acl = AclEntry {
      resource_external_id: Some("doc-8".to_string()),
      ..acl
    };
    let manifest = add_acl_entry(builder, "doc", &acl, Some("doc-7")).build();
    assert_eq!(manifest.acls[0].resource_external_id.as_deref(), Some("doc-8"));
  }
}
