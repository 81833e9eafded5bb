use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::path::Path;
use thiserror::Error;

use realmgate::KeycloakConfig;
use realmgate_dsl::Condition;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path:?}: {err}")]
  Io {
    path: std::path::PathBuf,
    err: std::io::Error,
  },
  #[error("invalid yaml: {0}")]
  Yaml(#[from] serde_yaml::Error),
  #[error("invalid config: {0}")]
  Invalid(String),
}

/// Root configuration of the sync tool: where to read source data from and
/// what realm manifest to assemble out of it.
#[derive(Clone, Debug, Deserialize)]
pub struct SyncConfig {
  pub database: DatabaseConfig,
  pub realm: RealmConfig,
  #[serde(default)]
  pub actions: Vec<String>,
  #[serde(default)]
  pub roles: Option<QueryConfig>,
  #[serde(default)]
  pub principals: Option<QueryConfig>,
  #[serde(default)]
  pub resource_types: Vec<ResourceTypeConfig>,
}

impl SyncConfig {
  pub fn load(path: &Path) -> Result<SyncConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
      path: path.to_path_buf(),
      err,
    })?;
    return Self::from_yaml(&contents);
  }

  pub fn from_yaml(contents: &str) -> Result<SyncConfig, ConfigError> {
    let mut config: SyncConfig = serde_yaml::from_str(contents)?;
    config.expand_secrets();
    config.validate()?;
    return Ok(config);
  }

  /// `${VAR}` patterns in secret-bearing fields expand from the environment.
  /// Unset variables are left verbatim.
  fn expand_secrets(&mut self) {
    self.database.password = expand_env_vars(&self.database.password);

    if let Some(ref mut kc) = self.realm.keycloak_config {
      if let Some(ref secret) = kc.client_secret {
        kc.client_secret = Some(expand_env_vars(secret));
      }
      if let Some(ref key) = kc.public_key {
        kc.public_key = Some(expand_env_vars(key));
      }
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.database.db_type != "postgresql" {
      return Err(ConfigError::Invalid(format!(
        "unsupported database type: {:?}",
        self.database.db_type
      )));
    }
    if self.realm.name.trim().is_empty() {
      return Err(ConfigError::Invalid("realm name must not be empty".to_string()));
    }

    for rt in &self.resource_types {
      for acl in rt.acls.iter().flatten() {
        acl.validate(&rt.name)?;
      }
      for resource in rt.resource_list.iter().flatten() {
        for acl in resource.acls.iter().flatten() {
          acl.validate(&rt.name)?;
        }
      }
    }
    return Ok(());
  }

  /// When Keycloak group sync is on, roles and principals come from the sync
  /// and the configured queries are skipped.
  pub fn uses_keycloak_sync(&self) -> bool {
    return self
      .realm
      .keycloak_config
      .as_ref()
      .is_some_and(|kc| kc.sync_groups);
  }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
  #[serde(default = "default_db_type", rename = "type")]
  pub db_type: String,
  #[serde(default = "default_host")]
  pub host: String,
  #[serde(default = "default_port")]
  pub port: u16,
  pub database: String,
  pub user: String,
  #[serde(default)]
  pub password: String,
}

impl DatabaseConfig {
  pub fn connect_options(&self) -> PgConnectOptions {
    return PgConnectOptions::new()
      .host(&self.host)
      .port(self.port)
      .database(&self.database)
      .username(&self.user)
      .password(&self.password);
  }
}

fn default_db_type() -> String {
  return "postgresql".to_string();
}

fn default_host() -> String {
  return "localhost".to_string();
}

fn default_port() -> u16 {
  return 5432;
}

#[derive(Clone, Debug, Deserialize)]
pub struct RealmConfig {
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub keycloak_config: Option<KeycloakConfig>,
}

/// A source query plus optional column renames applied to its results.
#[derive(Clone, Debug, Deserialize)]
pub struct QueryConfig {
  pub query: String,
  #[serde(default)]
  pub mappings: Option<ColumnMappings>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ColumnMappings {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub username: Option<String>,
  #[serde(default)]
  pub attributes: Option<String>,
  #[serde(default)]
  pub roles: Option<String>,
  #[serde(default)]
  pub external_id: Option<String>,
  #[serde(default)]
  pub geometry: Option<String>,
  /// Default SRID for queried geometries without their own `srid` column.
  #[serde(default)]
  pub srid: Option<i32>,
}

impl ColumnMappings {
  /// `(target key, source column)` renames to apply to a result row.
  pub(crate) fn renames(&self) -> Vec<(&'static str, &str)> {
    let mut out = Vec::new();
    for (target, source) in [
      ("name", &self.name),
      ("username", &self.username),
      ("attributes", &self.attributes),
      ("roles", &self.roles),
      ("external_id", &self.external_id),
      ("geometry", &self.geometry),
    ] {
      if let Some(source) = source {
        out.push((target, source.as_str()));
      }
    }
    return out;
  }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResourceTypeConfig {
  pub name: String,
  #[serde(default)]
  pub is_public: bool,
  /// Type-level grants.
  #[serde(default)]
  pub acls: Option<Vec<AclEntry>>,
  /// Queried resources.
  #[serde(default)]
  pub resources: Option<QueryConfig>,
  /// Manually defined resources, each with optional per-resource grants.
  #[serde(default)]
  pub resource_list: Option<Vec<ResourceEntry>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AclEntry {
  pub action: String,
  #[serde(default)]
  pub role: Option<String>,
  #[serde(default)]
  pub principal: Option<String>,
  #[serde(default)]
  pub principal_id: Option<i32>,
  #[serde(default)]
  pub resource_external_id: Option<String>,
  #[serde(default)]
  pub conditions: Option<Condition>,
}

impl AclEntry {
  fn validate(&self, resource_type: &str) -> Result<(), ConfigError> {
    let subjects = [
      self.role.is_some(),
      self.principal.is_some(),
      self.principal_id.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();

    if subjects != 1 {
      return Err(ConfigError::Invalid(format!(
        "acl for {resource_type:?}/{:?} needs exactly one of role, principal or principal_id",
        self.action
      )));
    }
    return Ok(());
  }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResourceEntry {
  pub external_id: String,
  #[serde(default)]
  pub attributes: Option<serde_json::Value>,
  #[serde(default)]
  pub geometry: Option<serde_json::Value>,
  #[serde(default)]
  pub srid: Option<i32>,
  #[serde(default)]
  pub acls: Option<Vec<AclEntry>>,
}

fn expand_env_vars(value: &str) -> String {
  let pattern = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
  return pattern
    .replace_all(value, |caps: &regex::Captures<'_>| {
      return std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string());
    })
    .into_owned();
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
database:
  database: legacy
  user: sync
realm:
  name: MyRealm
"#;

  #[test]
  fn test_minimal_config_defaults() {
    let config = SyncConfig::from_yaml(MINIMAL).unwrap();
    assert_eq!(config.database.db_type, "postgresql");
    assert_eq!(config.database.host, "localhost");
    assert_eq!(config.database.port, 5432);
    assert_eq!(config.database.password, "");
    assert_eq!(config.realm.name, "MyRealm");
    assert!(config.actions.is_empty());
    assert!(config.resource_types.is_empty());
    assert!(!config.uses_keycloak_sync());
  }

  #[test]
  fn test_full_config() {
    let config = SyncConfig::from_yaml(
      r#"
database:
  host: db.internal
  port: 5433
  database: legacy
  user: sync
  password: hunter2
realm:
  name: GeoRealm
  description: Spatial realm
  keycloak_config:
    server_url: https://kc.internal
    keycloak_realm: geo
    client_id: sync-tool
    sync_groups: true
actions: [view, edit]
roles:
  query: SELECT name FROM legacy_roles
principals:
  query: SELECT login AS username, groups AS roles FROM legacy_users
resource_types:
  - name: parcel
    is_public: false
    acls:
      - action: view
        role: surveyor
        conditions:
          op: st_dwithin
          attr: geometry
          val: "$context.location"
          args: 5000
    resources:
      query: SELECT parcel_no, geom FROM parcels
      mappings:
        external_id: parcel_no
        geometry: geom
        srid: 4326
  - name: report
    is_public: true
"#,
    )
    .unwrap();

    assert!(config.uses_keycloak_sync());
    assert_eq!(config.resource_types.len(), 2);

    let parcel = &config.resource_types[0];
    let acl = &parcel.acls.as_ref().unwrap()[0];
    assert_eq!(acl.role.as_deref(), Some("surveyor"));
    assert!(acl.conditions.is_some());

    let mappings = parcel.resources.as_ref().unwrap().mappings.as_ref().unwrap();
    assert_eq!(mappings.srid, Some(4326));
    assert_eq!(
      mappings.renames(),
      vec![("external_id", "parcel_no"), ("geometry", "geom")]
    );
  }

  #[test]
  fn test_rejects_unknown_condition_operator() {
    let err = SyncConfig::from_yaml(
      r#"
database:
  database: legacy
  user: sync
realm:
  name: R
resource_types:
  - name: doc
    acls:
      - action: view
        role: editor
        conditions:
          op: like
          attr: a
          val: x
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Yaml(_)), "{err:?}");
  }

  #[test]
  fn test_rejects_ambiguous_acl_subject() {
    let err = SyncConfig::from_yaml(
      r#"
database:
  database: legacy
  user: sync
realm:
  name: R
resource_types:
  - name: doc
    acls:
      - action: view
        role: editor
        principal: alice
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "{err:?}");

    let err = SyncConfig::from_yaml(
      r#"
database:
  database: legacy
  user: sync
realm:
  name: R
resource_types:
  - name: doc
    acls:
      - action: view
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "{err:?}");
  }

  #[test]
  fn test_rejects_non_postgres_database() {
    let err = SyncConfig::from_yaml(
      r#"
database:
  type: mysql
  database: legacy
  user: sync
realm:
  name: R
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "{err:?}");
  }

  #[test]
  fn test_env_var_expansion_in_password() {
    // SAFETY: test-only process environment mutation.
    unsafe { std::env::set_var("RGATE_TEST_DB_PASSWORD", "s3cret") };

    let config = SyncConfig::from_yaml(
      r#"
database:
  database: legacy
  user: sync
  password: ${RGATE_TEST_DB_PASSWORD}
realm:
  name: R
"#,
    )
    .unwrap();
    assert_eq!(config.database.password, "s3cret");

    // Unset variables stay verbatim.
    let config = SyncConfig::from_yaml(
      r#"
database:
  database: legacy
  user: sync
  password: ${RGATE_TEST_UNSET_VARIABLE}
realm:
  name: R
"#,
    )
    .unwrap();
    assert_eq!(config.database.password, "${RGATE_TEST_UNSET_VARIABLE}");
  }
}
