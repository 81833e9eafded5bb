use crate::authz::AuthzRequest;
use crate::store::{Store, StoreError};

/// Append one decision to the authorization log: who asked, for what, and
/// which resources (internal and external ids) came back. An empty grant is
/// recorded as a deny.
pub(crate) async fn log_decision(
  store: &Store,
  request: &AuthzRequest,
  granted: &[i32],
) -> Result<(), StoreError> {
  let action_name: Option<String> = sqlx::query_scalar("SELECT name FROM action WHERE id = $1")
    .bind(request.action_id)
    .fetch_optional(store.pool())
    .await?;
  let resource_type_name: Option<String> =
    sqlx::query_scalar("SELECT name FROM resource_type WHERE id = $1")
      .bind(request.resource_type_id)
      .fetch_optional(store.pool())
      .await?;

  let external = store
    .external_ids_for(request.realm_id, request.resource_type_id, granted)
    .await?;
  let external_ids: Vec<&String> = granted.iter().filter_map(|id| external.get(id)).collect();

  sqlx::query(
    "INSERT INTO authorization_log \
       (realm_id, principal_id, action_name, resource_type_name, decision, \
        resource_ids, external_resource_ids) \
     VALUES ($1, $2, $3, $4, $5, $6, $7)",
  )
  .bind(request.realm_id)
  .bind(request.principal_id)
  .bind(action_name)
  .bind(resource_type_name)
  .bind(!granted.is_empty())
  .bind(serde_json::json!(granted))
  .bind(serde_json::json!(external_ids))
  .execute(store.pool())
  .await?;

  return Ok(());
}
