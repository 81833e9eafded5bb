use sqlx::{Postgres, Transaction};

use realmgate_dsl::{CTX_VAR, Condition, compile};

use crate::store::{Store, StoreError};

/// Whom a rule applies to. The numeric `(0, 0)` sentinel only exists in
/// storage; everywhere else the subject is one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subject {
  Principal(i32),
  Role(i32),
  /// Matches every caller, authenticated or not.
  Anonymous,
}

impl Subject {
  /// Storage encoding: exactly one of the two columns is non-zero, except
  /// for the anonymous both-zero sentinel.
  pub(crate) fn storage_ids(&self) -> Result<(i32, i32), StoreError> {
    return match self {
      Self::Principal(id) if *id != 0 => Ok((*id, 0)),
      Self::Role(id) if *id != 0 => Ok((0, *id)),
      Self::Anonymous => Ok((0, 0)),
      _ => Err(StoreError::Subject("subject id must be non-zero")),
    };
  }

  pub fn from_storage(principal_id: i32, role_id: i32) -> Result<Subject, StoreError> {
    return match (principal_id, role_id) {
      (0, 0) => Ok(Self::Anonymous),
      (p, 0) => Ok(Self::Principal(p)),
      (0, r) => Ok(Self::Role(r)),
      _ => Err(StoreError::Subject(
        "at most one of principal and role may be set",
      )),
    };
  }
}

/// A grant to be written to the rule store. `resource_id = None` makes it
/// type-level, `conditions = None` unconditional.
#[derive(Clone, Debug)]
pub struct NewAclRule {
  pub realm_id: i32,
  pub resource_type_id: i32,
  pub action_id: i32,
  pub subject: Subject,
  pub resource_id: Option<i32>,
  pub conditions: Option<Condition>,
}

impl Store {
  /// Write a grant. The condition is compiled in the same statement that
  /// stores the row, so `compiled_sql` is always derivable from `conditions`
  /// and readers never recompile. A condition that cannot be lowered rejects
  /// the write.
  pub async fn create_acl(&self, rule: &NewAclRule) -> Result<i32, StoreError> {
    let mut tx = self.pool().begin().await?;
    let id = insert_acl(&mut tx, rule, OnConflict::Error).await?;
    tx.commit().await?;
    return Ok(id);
  }

  /// Re-materialize `compiled_sql` for an existing rule, atomically with the
  /// condition change.
  pub async fn update_acl_conditions(
    &self,
    realm_id: i32,
    resource_type_id: i32,
    acl_id: i32,
    conditions: Option<&Condition>,
  ) -> Result<(), StoreError> {
    let compiled = compile(conditions, CTX_VAR)?;
    let conditions_json = conditions.map(Condition::to_value);

    sqlx::query(
      "UPDATE acl SET conditions = $4, compiled_sql = $5 \
       WHERE realm_id = $1 AND resource_type_id = $2 AND id = $3",
    )
    .bind(realm_id)
    .bind(resource_type_id)
    .bind(acl_id)
    .bind(conditions_json)
    .bind(compiled)
    .execute(self.pool())
    .await?;
    return Ok(());
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OnConflict {
  Error,
  /// Re-target the existing row's conditions on the logical rule key.
  UpdateConditions,
}

pub(crate) async fn insert_acl(
  tx: &mut Transaction<'_, Postgres>,
  rule: &NewAclRule,
  on_conflict: OnConflict,
) -> Result<i32, StoreError> {
  let (principal_id, role_id) = rule.subject.storage_ids()?;
  let compiled = compile(rule.conditions.as_ref(), CTX_VAR)?;
  let conditions_json = rule.conditions.as_ref().map(Condition::to_value);

  let sql = match on_conflict {
    OnConflict::Error => {
      "INSERT INTO acl \
         (realm_id, resource_type_id, action_id, principal_id, role_id, resource_id, \
          conditions, compiled_sql) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
       RETURNING id"
    }
    OnConflict::UpdateConditions => {
      "INSERT INTO acl \
         (realm_id, resource_type_id, action_id, principal_id, role_id, resource_id, \
          conditions, compiled_sql) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
       ON CONFLICT (realm_id, resource_type_id, action_id, principal_id, role_id, \
                    COALESCE(resource_id, -1)) \
       DO UPDATE SET conditions = EXCLUDED.conditions, compiled_sql = EXCLUDED.compiled_sql \
       RETURNING id"
    }
  };

  return Ok(
    sqlx::query_scalar::<_, i32>(sql)
      .bind(rule.realm_id)
      .bind(rule.resource_type_id)
      .bind(rule.action_id)
      .bind(principal_id)
      .bind(role_id)
      .bind(rule.resource_id)
      .bind(conditions_json)
      .bind(compiled)
      .fetch_one(&mut **tx)
      .await?,
  );
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_subject_storage_roundtrip() {
    assert_eq!(Subject::Principal(7).storage_ids().unwrap(), (7, 0));
    assert_eq!(Subject::Role(3).storage_ids().unwrap(), (0, 3));
    assert_eq!(Subject::Anonymous.storage_ids().unwrap(), (0, 0));

    assert_eq!(Subject::from_storage(7, 0).unwrap(), Subject::Principal(7));
    assert_eq!(Subject::from_storage(0, 3).unwrap(), Subject::Role(3));
    assert_eq!(Subject::from_storage(0, 0).unwrap(), Subject::Anonymous);
    assert!(Subject::from_storage(7, 3).is_err());
  }

  #[test]
  fn test_zero_subject_ids_are_rejected() {
    assert!(Subject::Principal(0).storage_ids().is_err());
    assert!(Subject::Role(0).storage_ids().is_err());
  }
}
