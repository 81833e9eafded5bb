use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Which attribute bag a term reads from.
///
/// Unrecognized source strings fall back to `Resource`, mirroring how the
/// stored rules have always been interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Source {
  #[default]
  Resource,
  Principal,
  Context,
}

impl Source {
  pub fn parse(s: &str) -> Self {
    return match s.to_lowercase().as_str() {
      "principal" => Self::Principal,
      "context" => Self::Context,
      _ => Self::Resource,
    };
  }

  #[inline]
  pub fn as_str(&self) -> &'static str {
    return match self {
      Self::Resource => "resource",
      Self::Principal => "principal",
      Self::Context => "context",
    };
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarOp {
  Equal,
  NotEqual,
  LessThan,
  GreaterThan,
  LessThanEqual,
  GreaterThanEqual,
  In,
  NotIn,
  ContainsAll,
}

impl ScalarOp {
  pub fn from(token: &str) -> Option<Self> {
    return match token {
      "=" => Some(Self::Equal),
      "!=" => Some(Self::NotEqual),
      "<" => Some(Self::LessThan),
      ">" => Some(Self::GreaterThan),
      "<=" => Some(Self::LessThanEqual),
      ">=" => Some(Self::GreaterThanEqual),
      "in" => Some(Self::In),
      "not_in" => Some(Self::NotIn),
      "all" => Some(Self::ContainsAll),
      _ => None,
    };
  }

  #[inline]
  pub fn as_token(&self) -> &'static str {
    return match self {
      Self::Equal => "=",
      Self::NotEqual => "!=",
      Self::LessThan => "<",
      Self::GreaterThan => ">",
      Self::LessThanEqual => "<=",
      Self::GreaterThanEqual => ">=",
      Self::In => "in",
      Self::NotIn => "not_in",
      Self::ContainsAll => "all",
    };
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpatialOp {
  DWithin,
  Contains,
  Within,
  Intersects,
  Covers,
}

impl SpatialOp {
  pub fn from(token: &str) -> Option<Self> {
    return match token {
      "st_dwithin" => Some(Self::DWithin),
      "st_contains" => Some(Self::Contains),
      "st_within" => Some(Self::Within),
      "st_intersects" => Some(Self::Intersects),
      "st_covers" => Some(Self::Covers),
      _ => None,
    };
  }

  #[inline]
  pub fn as_token(&self) -> &'static str {
    return match self {
      Self::DWithin => "st_dwithin",
      Self::Contains => "st_contains",
      Self::Within => "st_within",
      Self::Intersects => "st_intersects",
      Self::Covers => "st_covers",
    };
  }

  #[inline]
  pub fn as_sql(&self) -> &'static str {
    return match self {
      Self::DWithin => "ST_DWithin",
      Self::Contains => "ST_Contains",
      Self::Within => "ST_Within",
      Self::Intersects => "ST_Intersects",
      Self::Covers => "ST_Covers",
    };
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafOp {
  Scalar(ScalarOp),
  Spatial(SpatialOp),
}

impl LeafOp {
  pub fn from(token: &str) -> Option<Self> {
    if let Some(op) = ScalarOp::from(token) {
      return Some(Self::Scalar(op));
    }
    return SpatialOp::from(token).map(Self::Spatial);
  }

  #[inline]
  pub fn as_token(&self) -> &'static str {
    return match self {
      Self::Scalar(op) => op.as_token(),
      Self::Spatial(op) => op.as_token(),
    };
  }

  #[inline]
  pub fn is_spatial(&self) -> bool {
    return matches!(self, Self::Spatial(_));
  }
}

/// A `$bag.dotted.path` reference into one of the attribute bags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarRef {
  pub bag: Source,
  pub path: Vec<String>,
}

impl VarRef {
  /// Parse a variable reference of the form `$resource.a.b`, `$principal.a`
  /// or `$context.a`. Anything else, including bare `$resource`, is not a
  /// reference and stays a literal.
  pub fn parse(s: &str) -> Option<VarRef> {
    let rest = s.strip_prefix('$')?;
    let (bag, raw_path) = rest.split_once('.')?;
    let bag = match bag {
      "resource" => Source::Resource,
      "principal" => Source::Principal,
      "context" => Source::Context,
      _ => return None,
    };
    if raw_path.is_empty() {
      return None;
    }
    return Some(VarRef {
      bag,
      path: raw_path.split('.').map(str::to_string).collect(),
    });
  }

  pub fn to_string_repr(&self) -> String {
    return format!("${}.{}", self.bag.as_str(), self.path.join("."));
  }
}

/// The value side of a leaf term: a JSON literal or a bag reference.
#[derive(Clone, Debug, PartialEq)]
pub enum CondValue {
  Literal(serde_json::Value),
  Var(VarRef),
}

impl CondValue {
  pub fn from_json(v: serde_json::Value) -> Self {
    if let serde_json::Value::String(ref s) = v
      && let Some(var) = VarRef::parse(s)
    {
      return Self::Var(var);
    }
    return Self::Literal(v);
  }

  pub fn to_json(&self) -> serde_json::Value {
    return match self {
      Self::Literal(v) => v.clone(),
      Self::Var(var) => serde_json::Value::String(var.to_string_repr()),
    };
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Leaf {
  pub op: LeafOp,
  pub source: Source,
  pub attr: String,
  pub val: CondValue,
  pub args: Option<serde_json::Value>,
}

/// A parsed condition tree. The wire format is the JSON DSL stored in
/// `acl.conditions`; see the crate-level docs for the grammar.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
  And(Vec<Condition>),
  Or(Vec<Condition>),
  Not(Box<Condition>),
  Leaf(Leaf),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConditionError {
  #[error("unknown operator: {0:?}")]
  UnknownOperator(String),
  #[error("operator {0:?} requires a 'conditions' array")]
  MissingConditions(&'static str),
  #[error("'not' takes exactly one condition, got {0}")]
  NotArity(usize),
  #[error("leaf condition requires {0:?}")]
  MissingField(&'static str),
  #[error("malformed condition: {0}")]
  Malformed(String),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct RawCondition {
  op: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  source: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  attr: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  val: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  args: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  conditions: Option<Vec<RawCondition>>,
}

impl TryFrom<RawCondition> for Condition {
  type Error = ConditionError;

  fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
    let op = raw.op.to_lowercase();

    match op.as_str() {
      "and" | "or" | "not" => {
        let Some(children) = raw.conditions else {
          return Err(ConditionError::MissingConditions(match op.as_str() {
            "and" => "and",
            "or" => "or",
            _ => "not",
          }));
        };
        let children = children
          .into_iter()
          .map(Condition::try_from)
          .collect::<Result<Vec<_>, _>>()?;

        return match op.as_str() {
          "and" => Ok(Condition::And(children)),
          "or" => Ok(Condition::Or(children)),
          _ => {
            if children.len() != 1 {
              return Err(ConditionError::NotArity(children.len()));
            }
            let child = children.into_iter().next().expect("len() == 1");
            Ok(Condition::Not(Box::new(child)))
          }
        };
      }
      _ => {}
    }

    let Some(leaf_op) = LeafOp::from(&op) else {
      return Err(ConditionError::UnknownOperator(raw.op));
    };
    let Some(attr) = raw.attr else {
      return Err(ConditionError::MissingField("attr"));
    };
    let Some(val) = raw.val else {
      return Err(ConditionError::MissingField("val"));
    };

    return Ok(Condition::Leaf(Leaf {
      op: leaf_op,
      source: raw.source.as_deref().map_or(Source::default(), Source::parse),
      attr,
      val: CondValue::from_json(val),
      args: raw.args,
    }));
  }
}

impl Condition {
  fn to_raw(&self) -> RawCondition {
    return match self {
      Self::And(children) => RawCondition {
        op: "and".to_string(),
        conditions: Some(children.iter().map(Condition::to_raw).collect()),
        ..Default::default()
      },
      Self::Or(children) => RawCondition {
        op: "or".to_string(),
        conditions: Some(children.iter().map(Condition::to_raw).collect()),
        ..Default::default()
      },
      Self::Not(child) => RawCondition {
        op: "not".to_string(),
        conditions: Some(vec![child.to_raw()]),
        ..Default::default()
      },
      Self::Leaf(leaf) => RawCondition {
        op: leaf.op.as_token().to_string(),
        source: Some(leaf.source.as_str().to_string()),
        attr: Some(leaf.attr.clone()),
        val: Some(leaf.val.to_json()),
        args: leaf.args.clone(),
        conditions: None,
      },
    };
  }

  /// Parse a condition from its stored JSON form. JSON `null` is a valid
  /// "no condition" and yields `None`.
  pub fn from_value(value: &serde_json::Value) -> Result<Option<Condition>, ConditionError> {
    if value.is_null() {
      return Ok(None);
    }
    let raw: RawCondition = serde_json::from_value(value.clone())
      .map_err(|err| ConditionError::Malformed(err.to_string()))?;
    return Condition::try_from(raw).map(Some);
  }

  pub fn to_value(&self) -> serde_json::Value {
    return serde_json::to_value(self.to_raw()).expect("condition serialization is total");
  }
}

impl Serialize for Condition {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    return self.to_raw().serialize(serializer);
  }
}

impl<'de> Deserialize<'de> for Condition {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = RawCondition::deserialize(deserializer)?;
    return Condition::try_from(raw).map_err(D::Error::custom);
  }
}
