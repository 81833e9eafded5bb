use log::*;
use std::collections::BTreeSet;

use crate::authz::{
  AuthzError, RequestContext, TRIVIAL_FRAGMENT_SQL, filter_resources_by_rule, is_public_type,
  subject_match_sql,
};
use crate::store::Store;

/// One granted `(resource, action)` pair. `is_type_level` marks grants that
/// came from a blanket type-level rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, sqlx::FromRow)]
pub struct PermittedAction {
  pub resource_id: i32,
  pub action_id: i32,
  pub is_type_level: bool,
}

/// Resolve every action the caller may perform on resources of the type, in
/// one pass. Semantics per action mirror the three-tier runner; each grant
/// emits one triple.
pub async fn permitted_actions(
  store: &Store,
  realm_id: i32,
  principal_id: i32,
  role_ids: &[i32],
  resource_type_id: i32,
  resource_ids: Option<&[i32]>,
  ctx: &RequestContext,
) -> Result<Vec<PermittedAction>, AuthzError> {
  // Public type: every realm action on every resource of the type.
  if is_public_type(store, realm_id, resource_type_id).await? {
    return Ok(
      sqlx::query_as::<_, PermittedAction>(
        "SELECT r.id AS resource_id, a.id AS action_id, FALSE AS is_type_level \
         FROM resource r CROSS JOIN action a \
         WHERE r.realm_id = $1 AND r.resource_type_id = $2 \
           AND a.realm_id = $1 \
           AND ($3::int[] IS NULL OR r.id = ANY($3)) \
         ORDER BY r.id, a.id",
      )
      .bind(realm_id)
      .bind(resource_type_id)
      .bind(resource_ids.map(<[i32]>::to_vec))
      .fetch_all(store.pool())
      .await?,
    );
  }

  let mut permitted = BTreeSet::<PermittedAction>::new();

  // Blanket type-level grants, joined against the resources they cover.
  let blanket_sql = format!(
    "SELECT r.id AS resource_id, acl.action_id AS action_id, TRUE AS is_type_level \
     FROM acl CROSS JOIN resource r \
     WHERE acl.realm_id = $1 AND acl.resource_type_id = $2 \
       AND acl.resource_id IS NULL \
       AND {TRIVIAL_FRAGMENT_SQL} \
       AND {subject} \
       AND r.realm_id = $1 AND r.resource_type_id = $2 \
       AND ($5::int[] IS NULL OR r.id = ANY($5))",
    subject = subject_match_sql("$3", "$4"),
  );
  permitted.extend(
    sqlx::query_as::<_, PermittedAction>(&blanket_sql)
      .bind(realm_id)
      .bind(resource_type_id)
      .bind(principal_id)
      .bind(role_ids)
      .bind(resource_ids.map(<[i32]>::to_vec))
      .fetch_all(store.pool())
      .await?,
  );

  // Conditional and resource-level grants: evaluate each rule's fragment
  // against the resource table, per action.
  let rules_sql = format!(
    "SELECT id, action_id, resource_id, compiled_sql FROM acl \
     WHERE realm_id = $1 AND resource_type_id = $2 \
       AND {subject} \
       AND (resource_id IS NOT NULL OR NOT {TRIVIAL_FRAGMENT_SQL}) \
     ORDER BY id",
    subject = subject_match_sql("$3", "$4"),
  );
  let rules = sqlx::query_as::<_, (i32, i32, Option<i32>, Option<String>)>(&rules_sql)
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(principal_id)
    .bind(role_ids)
    .fetch_all(store.pool())
    .await?;

  let ctx_value = ctx.to_value();
  for (rule_id, action_id, rule_resource_id, compiled_sql) in rules {
    match filter_resources_by_rule(
      store,
      realm_id,
      resource_type_id,
      resource_ids,
      &ctx_value,
      compiled_sql.as_deref(),
      rule_resource_id,
    )
    .await
    {
      Ok(ids) => {
        permitted.extend(ids.into_iter().map(|resource_id| PermittedAction {
          resource_id,
          action_id,
          is_type_level: false,
        }));
      }
      Err(err) => {
        warn!("skipping acl rule {realm_id}/{resource_type_id}/{rule_id}: {err}");
      }
    }
  }

  return Ok(permitted.into_iter().collect());
}
