use log::*;
use std::collections::BTreeSet;

use crate::audit;
use crate::authz::{
  AuthzError, AuthzRequest, RequestContext, TRIVIAL_FRAGMENT_SQL, filter_resources_by_rule,
  is_public_type, resources_of_type, subject_match_sql,
};
use crate::store::Store;

#[derive(sqlx::FromRow)]
struct AclRuleRow {
  id: i32,
  compiled_sql: Option<String>,
  resource_id: Option<i32>,
}

/// Resolve an authorization request to the set of granted resource ids and
/// record the decision in the audit log. Audit failures are logged, they do
/// not change the decision.
pub async fn authorize(
  store: &Store,
  request: &AuthzRequest,
  ctx: &RequestContext,
) -> Result<Vec<i32>, AuthzError> {
  let granted = authorized_resources(store, request, ctx).await?;

  if let Err(err) = audit::log_decision(store, request, &granted).await {
    warn!("failed to record authorization decision: {err}");
  }
  return Ok(granted);
}

/// The three-tier decision procedure.
///
/// 1. Public floodgate: a public resource type grants everything.
/// 2. Blanket grant: a matching type-level rule with a trivial condition
///    grants all resources of the type.
/// 3. Otherwise each matching rule's compiled fragment is spliced into the
///    resource filter; results are unioned. A rule whose splice fails is
///    skipped and the evaluation continues on the surviving rules.
///
/// No matching rule means an empty set: absence is deny.
pub async fn authorized_resources(
  store: &Store,
  request: &AuthzRequest,
  ctx: &RequestContext,
) -> Result<Vec<i32>, AuthzError> {
  let resource_ids = request.resource_ids.as_deref();

  // Tier 1: floodgate.
  if is_public_type(store, request.realm_id, request.resource_type_id).await? {
    return resources_of_type(store, request.realm_id, request.resource_type_id, resource_ids)
      .await;
  }

  // Tier 2: blanket type-level grant.
  if has_blanket_grant(store, request).await? {
    return resources_of_type(store, request.realm_id, request.resource_type_id, resource_ids)
      .await;
  }

  // Tier 3: conditional and resource-level rules.
  let rules = matching_rules(store, request).await?;

  let ctx_value = ctx.to_value();
  let mut granted = BTreeSet::<i32>::new();
  for rule in rules {
    match filter_resources_by_rule(
      store,
      request.realm_id,
      request.resource_type_id,
      resource_ids,
      &ctx_value,
      rule.compiled_sql.as_deref(),
      rule.resource_id,
    )
    .await
    {
      Ok(ids) => granted.extend(ids),
      Err(err) => {
        // A rule that fails at execution denies only its own grant.
        warn!(
          "skipping acl rule {realm}/{rtype}/{id}: {err}",
          realm = request.realm_id,
          rtype = request.resource_type_id,
          id = rule.id,
        );
      }
    }
  }

  return Ok(granted.into_iter().collect());
}

async fn has_blanket_grant(store: &Store, request: &AuthzRequest) -> Result<bool, AuthzError> {
  let sql = format!(
    "SELECT EXISTS( \
       SELECT 1 FROM acl \
       WHERE realm_id = $1 AND resource_type_id = $2 AND action_id = $3 \
         AND resource_id IS NULL \
         AND {TRIVIAL_FRAGMENT_SQL} \
         AND {subject})",
    subject = subject_match_sql("$4", "$5"),
  );

  return Ok(
    sqlx::query_scalar::<_, bool>(&sql)
      .bind(request.realm_id)
      .bind(request.resource_type_id)
      .bind(request.action_id)
      .bind(request.principal_id)
      .bind(&request.role_ids)
      .fetch_one(store.pool())
      .await?,
  );
}

async fn matching_rules(
  store: &Store,
  request: &AuthzRequest,
) -> Result<Vec<AclRuleRow>, AuthzError> {
  let sql = format!(
    "SELECT id, compiled_sql, resource_id FROM acl \
     WHERE realm_id = $1 AND resource_type_id = $2 AND action_id = $3 \
       AND {subject} \
     ORDER BY id",
    subject = subject_match_sql("$4", "$5"),
  );

  return Ok(
    sqlx::query_as::<_, AclRuleRow>(&sql)
      .bind(request.realm_id)
      .bind(request.resource_type_id)
      .bind(request.action_id)
      .bind(request.principal_id)
      .bind(&request.role_ids)
      .fetch_all(store.pool())
      .await?,
  );
}
