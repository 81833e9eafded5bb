use log::*;

use realmgate_dsl::{CondValue, Condition, Source};

use crate::authz::AuthzError;
use crate::store::Store;

/// The planning form of an authorization decision: instead of materializing
/// resource ids, return what the caller would need to fold into its own
/// query.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthzPlan {
  /// An unconditional type-level grant matched; every resource of the type
  /// is authorized.
  GrantedAll,
  /// No grant matched at all.
  DeniedAll,
  /// The caller is granted the OR-fold of `dsl` over the type, plus the
  /// specific resources named by `external_ids`. `has_context_refs` tells
  /// the caller whether evaluating `dsl` requires the context bind.
  Conditions {
    dsl: Option<Condition>,
    external_ids: Vec<String>,
    has_context_refs: bool,
  },
}

/// Single-query authorization planning. Unlike the runner, the anonymous
/// both-zero sentinel is not consulted: plans are for identified callers.
pub async fn authorization_conditions(
  store: &Store,
  realm_id: i32,
  principal_id: i32,
  role_ids: &[i32],
  resource_type_id: i32,
  action_id: i32,
) -> Result<AuthzPlan, AuthzError> {
  let blanket: bool = sqlx::query_scalar(
    "SELECT EXISTS( \
       SELECT 1 FROM acl a \
       WHERE a.realm_id = $1 AND a.resource_type_id = $2 AND a.action_id = $3 \
         AND (a.conditions IS NULL OR a.conditions = 'null'::jsonb) \
         AND a.resource_id IS NULL \
         AND (a.principal_id = $4 OR a.role_id = ANY($5)))",
  )
  .bind(realm_id)
  .bind(resource_type_id)
  .bind(action_id)
  .bind(principal_id)
  .bind(role_ids)
  .fetch_one(store.pool())
  .await?;

  if blanket {
    return Ok(AuthzPlan::GrantedAll);
  }

  let rows = sqlx::query_as::<_, (Option<serde_json::Value>, Option<String>)>(
    "SELECT a.conditions, e.external_id \
     FROM acl a \
     LEFT JOIN external_ids e \
       ON a.resource_id = e.resource_id \
      AND a.realm_id = e.realm_id \
      AND a.resource_type_id = e.resource_type_id \
     WHERE a.realm_id = $1 AND a.resource_type_id = $2 AND a.action_id = $3 \
       AND (a.principal_id = $4 OR a.role_id = ANY($5)) \
     ORDER BY a.id",
  )
  .bind(realm_id)
  .bind(resource_type_id)
  .bind(action_id)
  .bind(principal_id)
  .bind(role_ids)
  .fetch_all(store.pool())
  .await?;

  let mut conditions = Vec::<Condition>::new();
  let mut external_ids = Vec::<String>::new();

  for (stored, external_id) in rows {
    if let Some(external_id) = external_id {
      external_ids.push(external_id);
      continue;
    }

    let Some(stored) = stored else {
      continue;
    };
    match Condition::from_value(&stored) {
      Ok(Some(cond)) => conditions.push(cond),
      Ok(None) => {}
      Err(err) => {
        // Should have been rejected at write time; treat like any other
        // broken rule and move on.
        warn!("skipping stored condition in realm {realm_id}: {err}");
      }
    }
  }

  if conditions.is_empty() && external_ids.is_empty() {
    return Ok(AuthzPlan::DeniedAll);
  }

  let has_context_refs = conditions.iter().any(references_context);
  let dsl = match conditions.len() {
    0 => None,
    1 => conditions.pop(),
    _ => Some(Condition::Or(conditions)),
  };

  return Ok(AuthzPlan::Conditions {
    dsl,
    external_ids,
    has_context_refs,
  });
}

/// Does evaluating the condition require the principal/context bags?
fn references_context(cond: &Condition) -> bool {
  return match cond {
    Condition::And(children) | Condition::Or(children) => {
      children.iter().any(references_context)
    }
    Condition::Not(child) => references_context(child),
    Condition::Leaf(leaf) => {
      if leaf.source != Source::Resource {
        return true;
      }
      return matches!(&leaf.val, CondValue::Var(var) if var.bag != Source::Resource);
    }
  };
}
