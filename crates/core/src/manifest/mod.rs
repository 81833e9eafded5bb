use serde::{Deserialize, Serialize};
use thiserror::Error;

use realmgate_dsl::Condition;

use crate::store::{KeycloakConfig, StoreError};

mod builder;
mod export;
mod import;

pub use builder::{AclBuilder, ManifestBuilder, PrincipalBuilder, ResourceBuilder};
pub use export::export_manifest;
pub use import::{ImportSummary, import_manifest};

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
  #[error("store error: {0}")]
  Store(#[from] StoreError),
  #[error("unknown realm: {0}")]
  UnknownRealm(String),
  #[error("unknown {kind}: {name}")]
  UnknownReference { kind: &'static str, name: String },
  #[error("acl for {resource_type:?}/{action:?} needs exactly one of role, principal or principal_id")]
  AmbiguousSubject {
    resource_type: String,
    action: String,
  },
}

/// A realm manifest: the canonical, importable description of a realm's
/// authorization configuration. Entries reference each other by name and
/// external id only, never by internal id.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Manifest {
  pub realm: RealmDoc,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub actions: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub roles: Vec<RoleDoc>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub principals: Vec<PrincipalDoc>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub resource_types: Vec<ResourceTypeDoc>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub resources: Vec<ResourceDoc>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub acls: Vec<AclDoc>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RealmDoc {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub keycloak_config: Option<KeycloakConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RoleDoc {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attributes: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PrincipalDoc {
  pub username: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub roles: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attributes: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceTypeDoc {
  pub name: String,
  #[serde(default)]
  pub is_public: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceDoc {
  pub external_id: String,
  #[serde(rename = "type")]
  pub resource_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub attributes: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub geometry: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub srid: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct AclDoc {
  pub resource_type: String,
  pub action: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub principal: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub principal_id: Option<i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resource_external_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub conditions: Option<Condition>,
}
