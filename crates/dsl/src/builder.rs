use crate::condition::{CondValue, Condition, Leaf, LeafOp, ScalarOp, Source, SpatialOp};

/// Start a fluent condition chain for the given attribute.
///
/// ```
/// use realmgate_dsl::{attr, all_of};
///
/// let cond = all_of([
///   attr("status").eq("active"),
///   attr("clearance").from_principal().gte(3),
/// ]);
/// ```
pub fn attr(name: impl Into<String>) -> AttrBuilder {
  return AttrBuilder {
    attr: name.into(),
    source: Source::Resource,
  };
}

/// Chainable leaf-condition builder created by [`attr`]. String values of the
/// form `$bag.path` become bag references.
#[derive(Clone, Debug)]
pub struct AttrBuilder {
  attr: String,
  source: Source,
}

impl AttrBuilder {
  pub fn from_resource(mut self) -> Self {
    self.source = Source::Resource;
    return self;
  }

  pub fn from_principal(mut self) -> Self {
    self.source = Source::Principal;
    return self;
  }

  pub fn from_context(mut self) -> Self {
    self.source = Source::Context;
    return self;
  }

  fn leaf(self, op: LeafOp, val: serde_json::Value, args: Option<serde_json::Value>) -> Condition {
    return Condition::Leaf(Leaf {
      op,
      source: self.source,
      attr: self.attr,
      val: CondValue::from_json(val),
      args,
    });
  }

  fn scalar(self, op: ScalarOp, val: impl Into<serde_json::Value>) -> Condition {
    return self.leaf(LeafOp::Scalar(op), val.into(), None);
  }

  fn spatial(
    self,
    op: SpatialOp,
    val: impl Into<serde_json::Value>,
    args: Option<serde_json::Value>,
  ) -> Condition {
    return self.leaf(LeafOp::Spatial(op), val.into(), args);
  }

  pub fn eq(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.scalar(ScalarOp::Equal, val);
  }

  pub fn neq(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.scalar(ScalarOp::NotEqual, val);
  }

  pub fn lt(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.scalar(ScalarOp::LessThan, val);
  }

  pub fn lte(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.scalar(ScalarOp::LessThanEqual, val);
  }

  pub fn gt(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.scalar(ScalarOp::GreaterThan, val);
  }

  pub fn gte(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.scalar(ScalarOp::GreaterThanEqual, val);
  }

  pub fn is_in(self, vals: impl IntoIterator<Item = impl Into<serde_json::Value>>) -> Condition {
    let vals: Vec<serde_json::Value> = vals.into_iter().map(Into::into).collect();
    return self.scalar(ScalarOp::In, vals);
  }

  pub fn not_in(self, vals: impl IntoIterator<Item = impl Into<serde_json::Value>>) -> Condition {
    let vals: Vec<serde_json::Value> = vals.into_iter().map(Into::into).collect();
    return self.scalar(ScalarOp::NotIn, vals);
  }

  pub fn has_all(self, vals: impl IntoIterator<Item = impl Into<serde_json::Value>>) -> Condition {
    let vals: Vec<serde_json::Value> = vals.into_iter().map(Into::into).collect();
    return self.scalar(ScalarOp::ContainsAll, vals);
  }

  /// Geometry within `distance` (in the units of SRID 3857).
  pub fn dwithin(self, val: impl Into<serde_json::Value>, distance: f64) -> Condition {
    return self.spatial(SpatialOp::DWithin, val, Some(distance.into()));
  }

  pub fn contains(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.spatial(SpatialOp::Contains, val, None);
  }

  pub fn within(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.spatial(SpatialOp::Within, val, None);
  }

  pub fn intersects(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.spatial(SpatialOp::Intersects, val, None);
  }

  pub fn covers(self, val: impl Into<serde_json::Value>) -> Condition {
    return self.spatial(SpatialOp::Covers, val, None);
  }
}

/// Combine conditions with logical AND.
pub fn all_of(conditions: impl IntoIterator<Item = Condition>) -> Condition {
  return Condition::And(conditions.into_iter().collect());
}

/// Combine conditions with logical OR.
pub fn any_of(conditions: impl IntoIterator<Item = Condition>) -> Condition {
  return Condition::Or(conditions.into_iter().collect());
}

/// Negate a condition.
pub fn negate(condition: Condition) -> Condition {
  return Condition::Not(Box::new(condition));
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_simple_equality() {
    assert_eq!(
      serde_json::to_value(attr("status").eq("active")).unwrap(),
      json!({"op": "=", "attr": "status", "val": "active", "source": "resource"})
    );
  }

  #[test]
  fn test_source_modifiers() {
    assert_eq!(
      serde_json::to_value(attr("clearance").from_principal().gte(5)).unwrap(),
      json!({"op": ">=", "attr": "clearance", "val": 5, "source": "principal"})
    );
    assert_eq!(
      serde_json::to_value(attr("hour").from_context().lt(22)).unwrap(),
      json!({"op": "<", "attr": "hour", "val": 22, "source": "context"})
    );
  }

  #[test]
  fn test_reference_values_classify() {
    let cond = attr("owner").eq("$principal.username");
    let Condition::Leaf(ref leaf) = cond else {
      panic!();
    };
    assert!(matches!(leaf.val, CondValue::Var(_)));
    assert_eq!(
      serde_json::to_value(&cond).unwrap(),
      json!({"op": "=", "attr": "owner", "val": "$principal.username", "source": "resource"})
    );
  }

  #[test]
  fn test_set_operators() {
    assert_eq!(
      serde_json::to_value(attr("status").is_in(["active", "pending"])).unwrap(),
      json!({"op": "in", "attr": "status", "val": ["active", "pending"], "source": "resource"})
    );
    assert_eq!(
      serde_json::to_value(attr("roles").has_all(["admin", "moderator"])).unwrap(),
      json!({"op": "all", "attr": "roles", "val": ["admin", "moderator"], "source": "resource"})
    );
  }

  #[test]
  fn test_dwithin_carries_distance() {
    assert_eq!(
      serde_json::to_value(attr("geometry").dwithin("$context.loc", 100.5)).unwrap(),
      json!({
        "op": "st_dwithin",
        "attr": "geometry",
        "val": "$context.loc",
        "source": "resource",
        "args": 100.5,
      })
    );
  }

  #[test]
  fn test_combinators() {
    let cond = all_of([
      attr("geometry").dwithin("$context.loc", 5000.0),
      any_of([
        attr("public").eq(true),
        attr("clearance").from_principal().gte(3),
      ]),
    ]);

    let Condition::And(ref children) = cond else {
      panic!();
    };
    assert_eq!(children.len(), 2);
    assert!(matches!(children[1], Condition::Or(_)));

    let negated = negate(cond);
    let wire = serde_json::to_value(&negated).unwrap();
    assert_eq!(wire["op"], "not");
    assert_eq!(wire["conditions"].as_array().unwrap().len(), 1);
  }

  #[test]
  fn test_built_conditions_compile() {
    let cond = attr("status").is_in(["active", "pending"]);
    assert!(crate::compile(Some(&cond), "p_ctx").is_ok());
  }
}
