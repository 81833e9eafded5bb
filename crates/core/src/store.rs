use log::*;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, Transaction};
use std::collections::HashMap;
use thiserror::Error;

use realmgate_dsl::{CompileError, GeometryFormat};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
  #[error("condition compile error: {0}")]
  Compile(#[from] CompileError),
  #[error("invalid rule subject: {0}")]
  Subject(&'static str),
  #[error("invalid geometry value")]
  Geometry,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Realm {
  pub id: i32,
  pub name: String,
  pub description: Option<String>,
  pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ResourceType {
  pub id: i32,
  pub name: String,
  pub realm_id: i32,
  pub is_public: bool,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Action {
  pub id: i32,
  pub name: String,
  pub realm_id: i32,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Principal {
  pub id: i32,
  pub username: String,
  pub realm_id: i32,
  pub attributes: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Role {
  pub id: i32,
  pub name: String,
  pub realm_id: i32,
  pub attributes: Option<serde_json::Value>,
}

/// Keycloak connection settings attached to a realm. Stored only; group
/// synchronization is owned by an external collaborator.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, sqlx::FromRow)]
pub struct KeycloakConfig {
  pub server_url: String,
  pub keycloak_realm: String,
  pub client_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_secret: Option<String>,
  #[serde(default = "default_true")]
  pub verify_ssl: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub public_key: Option<String>,
  #[serde(default = "default_algorithm", skip_serializing_if = "is_default_algorithm")]
  pub algorithm: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub settings: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sync_cron: Option<String>,
  #[serde(default)]
  pub sync_groups: bool,
}

impl Default for KeycloakConfig {
  fn default() -> Self {
    return Self {
      server_url: String::new(),
      keycloak_realm: String::new(),
      client_id: String::new(),
      client_secret: None,
      verify_ssl: true,
      public_key: None,
      algorithm: default_algorithm(),
      settings: None,
      sync_cron: None,
      sync_groups: false,
    };
  }
}

fn default_true() -> bool {
  return true;
}

fn default_algorithm() -> String {
  return "RS256".to_string();
}

fn is_default_algorithm(algorithm: &str) -> bool {
  return algorithm == "RS256";
}

/// A geometry value on its way into the store: GeoJSON (object or string),
/// EWKT or WKT text, with an optional explicit source SRID.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryInput {
  pub value: serde_json::Value,
  pub srid: Option<i32>,
}

impl GeometryInput {
  pub(crate) fn as_text(&self) -> Result<String, StoreError> {
    return match &self.value {
      serde_json::Value::String(s) => Ok(s.clone()),
      value @ serde_json::Value::Object(_) => Ok(value.to_string()),
      _ => Err(StoreError::Geometry),
    };
  }

  /// SQL expression normalizing the bound geometry text (at `placeholder`) to
  /// SRID 3857. An explicit SRID overrides the format's assumed one; EWKT
  /// carries its own and wins over the hint.
  pub(crate) fn sql_expr(&self, placeholder: &str) -> Result<String, StoreError> {
    let text = self.as_text()?;
    let format = GeometryFormat::detect(&text);

    let Some(srid) = self.srid else {
      return Ok(format!("parse_geometry_to_3857({placeholder})"));
    };

    let from_expr = match format {
      GeometryFormat::GeoJson => format!("ST_GeomFromGeoJSON({placeholder})"),
      GeometryFormat::Ewkt { .. } => {
        return Ok(format.to_sql_expr(placeholder));
      }
      GeometryFormat::Wkt => format!("ST_GeomFromText({placeholder})"),
    };

    if srid == 3857 {
      return Ok(format!("ST_SetSRID({from_expr}, 3857)"));
    }
    return Ok(format!("ST_Transform(ST_SetSRID({from_expr}, {srid}), 3857)"));
  }
}

/// Handle on the rule store. Cheap to clone; all methods go through the
/// shared connection pool.
#[derive(Clone)]
pub struct Store {
  pool: PgPool,
}

impl Store {
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let pool = PgPoolOptions::new().connect(url).await?;
    return Ok(Self { pool });
  }

  pub fn from_pool(pool: PgPool) -> Self {
    return Self { pool };
  }

  #[inline]
  pub fn pool(&self) -> &PgPool {
    return &self.pool;
  }

  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    return Ok(());
  }

  /// Create a realm and provision its list partitions in one transaction.
  pub async fn create_realm(
    &self,
    name: &str,
    description: Option<&str>,
  ) -> Result<Realm, StoreError> {
    let mut tx = self.pool.begin().await?;
    let realm = sqlx::query_as::<_, Realm>(
      "INSERT INTO realm (name, description) VALUES ($1, $2) \
       RETURNING id, name, description, is_active",
    )
    .bind(name)
    .bind(description)
    .fetch_one(&mut *tx)
    .await?;

    provision_realm_partitions(&mut tx, realm.id, &realm.name).await?;

    tx.commit().await?;
    return Ok(realm);
  }

  pub async fn realm_by_name(&self, name: &str) -> Result<Option<Realm>, StoreError> {
    return Ok(
      sqlx::query_as::<_, Realm>(
        "SELECT id, name, description, is_active FROM realm WHERE name = $1",
      )
      .bind(name)
      .fetch_optional(&self.pool)
      .await?,
    );
  }

  pub async fn create_resource_type(
    &self,
    realm_id: i32,
    name: &str,
    is_public: bool,
  ) -> Result<ResourceType, StoreError> {
    return Ok(
      sqlx::query_as::<_, ResourceType>(
        "INSERT INTO resource_type (realm_id, name, is_public) VALUES ($1, $2, $3) \
         RETURNING id, name, realm_id, is_public",
      )
      .bind(realm_id)
      .bind(name)
      .bind(is_public)
      .fetch_one(&self.pool)
      .await?,
    );
  }

  pub async fn resource_type_by_name(
    &self,
    realm_id: i32,
    name: &str,
  ) -> Result<Option<ResourceType>, StoreError> {
    return Ok(
      sqlx::query_as::<_, ResourceType>(
        "SELECT id, name, realm_id, is_public FROM resource_type \
         WHERE realm_id = $1 AND name = $2",
      )
      .bind(realm_id)
      .bind(name)
      .fetch_optional(&self.pool)
      .await?,
    );
  }

  pub async fn create_action(&self, realm_id: i32, name: &str) -> Result<Action, StoreError> {
    return Ok(
      sqlx::query_as::<_, Action>(
        "INSERT INTO action (realm_id, name) VALUES ($1, $2) RETURNING id, name, realm_id",
      )
      .bind(realm_id)
      .bind(name)
      .fetch_one(&self.pool)
      .await?,
    );
  }

  pub async fn action_by_name(
    &self,
    realm_id: i32,
    name: &str,
  ) -> Result<Option<Action>, StoreError> {
    return Ok(
      sqlx::query_as::<_, Action>(
        "SELECT id, name, realm_id FROM action WHERE realm_id = $1 AND name = $2",
      )
      .bind(realm_id)
      .bind(name)
      .fetch_optional(&self.pool)
      .await?,
    );
  }

  pub async fn create_role(
    &self,
    realm_id: i32,
    name: &str,
    attributes: Option<&serde_json::Value>,
  ) -> Result<Role, StoreError> {
    return Ok(
      sqlx::query_as::<_, Role>(
        "INSERT INTO auth_role (realm_id, name, attributes) VALUES ($1, $2, $3) \
         RETURNING id, name, realm_id, attributes",
      )
      .bind(realm_id)
      .bind(name)
      .bind(attributes)
      .fetch_one(&self.pool)
      .await?,
    );
  }

  pub async fn create_principal(
    &self,
    realm_id: i32,
    username: &str,
    attributes: &serde_json::Value,
  ) -> Result<Principal, StoreError> {
    return Ok(
      sqlx::query_as::<_, Principal>(
        "INSERT INTO principal (realm_id, username, attributes) VALUES ($1, $2, $3) \
         RETURNING id, username, realm_id, attributes",
      )
      .bind(realm_id)
      .bind(username)
      .bind(attributes)
      .fetch_one(&self.pool)
      .await?,
    );
  }

  pub async fn assign_role(&self, principal_id: i32, role_id: i32) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO principal_roles (principal_id, role_id) VALUES ($1, $2) \
       ON CONFLICT DO NOTHING",
    )
    .bind(principal_id)
    .bind(role_id)
    .execute(&self.pool)
    .await?;
    return Ok(());
  }

  /// Role ids of a principal, for building authorization requests.
  pub async fn roles_of(&self, principal_id: i32) -> Result<Vec<i32>, StoreError> {
    return Ok(
      sqlx::query_scalar::<_, i32>(
        "SELECT role_id FROM principal_roles WHERE principal_id = $1 ORDER BY role_id",
      )
      .bind(principal_id)
      .fetch_all(&self.pool)
      .await?,
    );
  }

  /// Insert a resource, normalizing any geometry to SRID 3857 and recording
  /// the external-id mapping when given. Returns the internal resource id.
  pub async fn create_resource(
    &self,
    realm_id: i32,
    resource_type_id: i32,
    attributes: &serde_json::Value,
    geometry: Option<&GeometryInput>,
    external_id: Option<&str>,
  ) -> Result<i32, StoreError> {
    let mut tx = self.pool.begin().await?;
    let id = insert_resource(&mut tx, realm_id, resource_type_id, attributes, geometry).await?;

    if let Some(external_id) = external_id {
      sqlx::query(
        "INSERT INTO external_ids (resource_id, realm_id, resource_type_id, external_id) \
         VALUES ($1, $2, $3, $4)",
      )
      .bind(id)
      .bind(realm_id)
      .bind(resource_type_id)
      .bind(external_id)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    return Ok(id);
  }

  /// Forward mapping: external ids to internal resource ids. Unknown ids are
  /// simply absent from the result.
  pub async fn resolve_external_ids(
    &self,
    realm_id: i32,
    resource_type_id: i32,
    external_ids: &[String],
  ) -> Result<HashMap<String, i32>, StoreError> {
    let rows = sqlx::query_as::<_, (String, i32)>(
      "SELECT external_id, resource_id FROM external_ids \
       WHERE realm_id = $1 AND resource_type_id = $2 AND external_id = ANY($3)",
    )
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(external_ids)
    .fetch_all(&self.pool)
    .await?;

    return Ok(rows.into_iter().collect());
  }

  /// Reverse mapping: internal resource ids to external ids.
  pub async fn external_ids_for(
    &self,
    realm_id: i32,
    resource_type_id: i32,
    resource_ids: &[i32],
  ) -> Result<HashMap<i32, String>, StoreError> {
    let rows = sqlx::query_as::<_, (i32, String)>(
      "SELECT resource_id, external_id FROM external_ids \
       WHERE realm_id = $1 AND resource_type_id = $2 AND resource_id = ANY($3)",
    )
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(resource_ids)
    .fetch_all(&self.pool)
    .await?;

    return Ok(rows.into_iter().collect());
  }

  pub async fn set_keycloak_config(
    &self,
    realm_id: i32,
    config: &KeycloakConfig,
  ) -> Result<(), StoreError> {
    upsert_keycloak_config(&self.pool, realm_id, config).await?;
    return Ok(());
  }

  pub async fn keycloak_config(
    &self,
    realm_id: i32,
  ) -> Result<Option<KeycloakConfig>, StoreError> {
    return Ok(
      sqlx::query_as::<_, KeycloakConfig>(
        "SELECT server_url, keycloak_realm, client_id, client_secret, verify_ssl, public_key, \
                algorithm, settings, sync_cron, sync_groups \
         FROM realm_keycloak_config WHERE realm_id = $1",
      )
      .bind(realm_id)
      .fetch_optional(&self.pool)
      .await?,
    );
  }
}

pub(crate) async fn insert_resource(
  tx: &mut Transaction<'_, Postgres>,
  realm_id: i32,
  resource_type_id: i32,
  attributes: &serde_json::Value,
  geometry: Option<&GeometryInput>,
) -> Result<i32, StoreError> {
  let Some(geometry) = geometry else {
    return Ok(
      sqlx::query_scalar::<_, i32>(
        "INSERT INTO resource (realm_id, resource_type_id, attributes) \
         VALUES ($1, $2, $3) RETURNING id",
      )
      .bind(realm_id)
      .bind(resource_type_id)
      .bind(attributes)
      .fetch_one(&mut **tx)
      .await?,
    );
  };

  let sql = format!(
    "INSERT INTO resource (realm_id, resource_type_id, attributes, geometry) \
     VALUES ($1, $2, $3, {geom}) RETURNING id",
    geom = geometry.sql_expr("$4")?,
  );
  return Ok(
    sqlx::query_scalar::<_, i32>(&sql)
      .bind(realm_id)
      .bind(resource_type_id)
      .bind(attributes)
      .bind(geometry.as_text()?)
      .fetch_one(&mut **tx)
      .await?,
  );
}

pub(crate) async fn upsert_keycloak_config<'c, E: sqlx::PgExecutor<'c>>(
  executor: E,
  realm_id: i32,
  config: &KeycloakConfig,
) -> Result<(), StoreError> {
  sqlx::query(
    "INSERT INTO realm_keycloak_config \
       (realm_id, server_url, keycloak_realm, client_id, client_secret, verify_ssl, \
        public_key, algorithm, settings, sync_cron, sync_groups) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
     ON CONFLICT (realm_id) DO UPDATE SET \
       server_url = EXCLUDED.server_url, \
       keycloak_realm = EXCLUDED.keycloak_realm, \
       client_id = EXCLUDED.client_id, \
       client_secret = EXCLUDED.client_secret, \
       verify_ssl = EXCLUDED.verify_ssl, \
       public_key = EXCLUDED.public_key, \
       algorithm = EXCLUDED.algorithm, \
       settings = EXCLUDED.settings, \
       sync_cron = EXCLUDED.sync_cron, \
       sync_groups = EXCLUDED.sync_groups",
  )
  .bind(realm_id)
  .bind(&config.server_url)
  .bind(&config.keycloak_realm)
  .bind(&config.client_id)
  .bind(&config.client_secret)
  .bind(config.verify_ssl)
  .bind(&config.public_key)
  .bind(&config.algorithm)
  .bind(&config.settings)
  .bind(&config.sync_cron)
  .bind(config.sync_groups)
  .execute(executor)
  .await?;
  return Ok(());
}

/// Realms are the partition key: each realm gets its own list partition of
/// the partitioned tables, named after the sanitized realm name and id.
pub(crate) async fn provision_realm_partitions(
  conn: &mut PgConnection,
  realm_id: i32,
  realm_name: &str,
) -> Result<(), StoreError> {
  let safe_name = partition_safe_name(realm_name);

  for table in ["resource", "acl", "external_ids"] {
    let partition = format!("{table}_{safe_name}_{realm_id}");
    debug!("provisioning partition {partition} for realm {realm_id}");

    sqlx::query(&format!(
      "CREATE TABLE IF NOT EXISTS {partition} PARTITION OF {table} FOR VALUES IN ({realm_id})"
    ))
    .execute(&mut *conn)
    .await?;
  }
  return Ok(());
}

/// Lowercase, everything but `[a-z0-9]` replaced with `_`. The result is a
/// plain identifier fragment, no quoting required.
fn partition_safe_name(name: &str) -> String {
  return name
    .to_lowercase()
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
    .collect();
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_partition_safe_name() {
    assert_eq!(partition_safe_name("MyRealm"), "myrealm");
    assert_eq!(partition_safe_name("geo data-2"), "geo_data_2");
    assert_eq!(partition_safe_name("realm;drop"), "realm_drop");
  }

  #[test]
  fn test_geometry_input_sql_expr() {
    let wkt = GeometryInput {
      value: json!("POINT(1000 1000)"),
      srid: None,
    };
    assert_eq!(wkt.sql_expr("$4").unwrap(), "parse_geometry_to_3857($4)");

    let wkt_4326 = GeometryInput {
      value: json!("POINT(8.5 47.4)"),
      srid: Some(4326),
    };
    assert_eq!(
      wkt_4326.sql_expr("$4").unwrap(),
      "ST_Transform(ST_SetSRID(ST_GeomFromText($4), 4326), 3857)"
    );

    let geojson_3857 = GeometryInput {
      value: json!({"type": "Point", "coordinates": [1000.0, 1000.0]}),
      srid: Some(3857),
    };
    assert_eq!(
      geojson_3857.sql_expr("$4").unwrap(),
      "ST_SetSRID(ST_GeomFromGeoJSON($4), 3857)"
    );

    // EWKT declares its own SRID, the hint is ignored.
    let ewkt = GeometryInput {
      value: json!("SRID=4326;POINT(8.5 47.4)"),
      srid: Some(3857),
    };
    assert_eq!(
      ewkt.sql_expr("$4").unwrap(),
      "ST_Transform(ST_GeomFromEWKT($4), 3857)"
    );
  }

  #[test]
  fn test_geometry_input_rejects_non_text() {
    let bad = GeometryInput {
      value: json!([1, 2]),
      srid: None,
    };
    assert!(matches!(bad.as_text(), Err(StoreError::Geometry)));
  }
}
