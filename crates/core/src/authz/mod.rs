use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Store;

pub mod batch;
pub mod plan;
pub mod runner;

pub use batch::{PermittedAction, permitted_actions};
pub use plan::{AuthzPlan, authorization_conditions};
pub use runner::{authorize, authorized_resources};

#[derive(Debug, Error)]
pub enum AuthzError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// The context bind: principal and request attribute bags, passed to the
/// compiled fragments as a single JSON parameter.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RequestContext {
  #[serde(default)]
  pub principal: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub context: serde_json::Map<String, serde_json::Value>,
}

impl RequestContext {
  pub fn to_value(&self) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(2);
    map.insert(
      "principal".to_string(),
      serde_json::Value::Object(self.principal.clone()),
    );
    map.insert(
      "context".to_string(),
      serde_json::Value::Object(self.context.clone()),
    );
    return serde_json::Value::Object(map);
  }
}

/// One authorization question: may `principal_id` (with `role_ids`) perform
/// `action_id` on resources of `resource_type_id` in `realm_id`? An optional
/// `resource_ids` filter restricts every tier of the answer.
#[derive(Clone, Debug)]
pub struct AuthzRequest {
  pub realm_id: i32,
  pub principal_id: i32,
  pub role_ids: Vec<i32>,
  pub resource_type_id: i32,
  pub action_id: i32,
  pub resource_ids: Option<Vec<i32>>,
}

/// A stored fragment counts as trivial (blanket) when it is absent, blank or
/// a bare TRUE.
pub(crate) const TRIVIAL_FRAGMENT_SQL: &str =
  "(compiled_sql IS NULL OR trim(compiled_sql) = '' OR upper(trim(compiled_sql)) = 'TRUE')";

/// Principal-matching predicate over `$P` (principal id) and `$R` (role id
/// array) placeholders: explicit principal, role membership, or the
/// both-zero anonymous sentinel.
pub(crate) fn subject_match_sql(principal_param: &str, roles_param: &str) -> String {
  return format!(
    "(principal_id = {principal_param} OR role_id = ANY({roles_param}) \
     OR (principal_id = 0 AND role_id = 0))"
  );
}

/// All resources of a type in a realm, optionally restricted to
/// `resource_ids`. Used by the public floodgate and blanket-grant tiers.
pub(crate) async fn resources_of_type(
  store: &Store,
  realm_id: i32,
  resource_type_id: i32,
  resource_ids: Option<&[i32]>,
) -> Result<Vec<i32>, AuthzError> {
  return Ok(
    sqlx::query_scalar::<_, i32>(
      "SELECT resource.id FROM resource \
       WHERE realm_id = $1 AND resource_type_id = $2 \
         AND ($3::int[] IS NULL OR resource.id = ANY($3)) \
       ORDER BY resource.id",
    )
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(resource_ids.map(<[i32]>::to_vec))
    .fetch_all(store.pool())
    .await?,
  );
}

/// Is the resource type public in this realm? A missing type reads as not
/// public and falls through to the grant tiers (which then find nothing).
pub(crate) async fn is_public_type(
  store: &Store,
  realm_id: i32,
  resource_type_id: i32,
) -> Result<bool, AuthzError> {
  let is_public: Option<bool> =
    sqlx::query_scalar("SELECT is_public FROM resource_type WHERE id = $1 AND realm_id = $2")
      .bind(resource_type_id)
      .bind(realm_id)
      .fetch_optional(store.pool())
      .await?;
  return Ok(is_public.unwrap_or(false));
}

/// Splice one rule's compiled fragment into the resource filter template and
/// execute it, binding the context as `$4` when the fragment references it.
/// Resource-level rules additionally pin `resource.id`.
pub(crate) async fn filter_resources_by_rule(
  store: &Store,
  realm_id: i32,
  resource_type_id: i32,
  resource_ids: Option<&[i32]>,
  ctx: &serde_json::Value,
  compiled_sql: Option<&str>,
  rule_resource_id: Option<i32>,
) -> Result<Vec<i32>, sqlx::Error> {
  let fragment = match compiled_sql {
    Some(sql) if !sql.trim().is_empty() => sql,
    _ => "TRUE",
  };
  let uses_ctx = fragment.contains(realmgate_dsl::CTX_VAR);
  let fragment = fragment.replace(realmgate_dsl::CTX_VAR, "$4");

  let filter = match rule_resource_id {
    Some(resource_id) => format!("resource.id = {resource_id} AND ({fragment})"),
    None => fragment,
  };

  let sql = format!(
    "SELECT resource.id FROM resource \
     WHERE realm_id = $1 AND resource_type_id = $2 \
       AND ($3::int[] IS NULL OR resource.id = ANY($3)) \
       AND ({filter})"
  );

  let query = sqlx::query_scalar::<_, i32>(&sql)
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(resource_ids.map(<[i32]>::to_vec));

  let query = if uses_ctx {
    query.bind(ctx.clone())
  } else {
    query
  };

  return query.fetch_all(store.pool()).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_request_context_shape() {
    let mut ctx = RequestContext::default();
    ctx
      .principal
      .insert("clearance".to_string(), json!(4));
    ctx.context.insert("hour".to_string(), json!(20));

    assert_eq!(
      ctx.to_value(),
      json!({"principal": {"clearance": 4}, "context": {"hour": 20}})
    );

    let empty = RequestContext::default();
    assert_eq!(empty.to_value(), json!({"principal": {}, "context": {}}));
  }

  #[test]
  fn test_request_context_deserializes_partial() {
    let ctx: RequestContext = serde_json::from_value(json!({"principal": {"a": 1}})).unwrap();
    assert_eq!(ctx.principal.get("a"), Some(&json!(1)));
    assert!(ctx.context.is_empty());
  }
}
