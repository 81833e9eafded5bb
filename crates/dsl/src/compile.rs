use thiserror::Error;

use crate::condition::{CondValue, Condition, Leaf, LeafOp, ScalarOp, Source, SpatialOp, VarRef};
use crate::geometry::GeometryFormat;
use crate::quote::quote_literal;

/// Lowering failures. The rule-write path treats any of these as fatal and
/// rejects the rule rather than materializing a permissive fragment.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CompileError {
  #[error("operator {op:?} requires {expected}")]
  InvalidOperand {
    op: &'static str,
    expected: &'static str,
  },
  #[error("st_dwithin distance must be numeric")]
  InvalidDistance,
}

/// Lower a condition tree into a SQL boolean expression.
///
/// The returned expression references the `resource` table and the single
/// JSON bind named `ctx_var`; it is safe to splice into
/// `WHERE realm_id = … AND resource_type_id = … AND (<expr>)`. `None`
/// compiles to `TRUE`. The lowering is deterministic.
pub fn compile(cond: Option<&Condition>, ctx_var: &str) -> Result<String, CompileError> {
  let Some(cond) = cond else {
    return Ok("TRUE".to_string());
  };
  return compile_node(cond, ctx_var);
}

fn compile_node(cond: &Condition, ctx_var: &str) -> Result<String, CompileError> {
  return match cond {
    Condition::And(children) => compile_junction(children, " AND ", ctx_var),
    Condition::Or(children) => compile_junction(children, " OR ", ctx_var),
    Condition::Not(child) => Ok(format!("NOT ({})", compile_node(child, ctx_var)?)),
    Condition::Leaf(leaf) => compile_leaf(leaf, ctx_var),
  };
}

fn compile_junction(
  children: &[Condition],
  separator: &str,
  ctx_var: &str,
) -> Result<String, CompileError> {
  if children.is_empty() {
    return Ok("TRUE".to_string());
  }

  let parts = children
    .iter()
    .map(|child| compile_node(child, ctx_var))
    .collect::<Result<Vec<_>, _>>()?;
  return Ok(format!("({})", parts.join(separator)));
}

fn compile_leaf(leaf: &Leaf, ctx_var: &str) -> Result<String, CompileError> {
  return match leaf.op {
    LeafOp::Scalar(op) => compile_scalar(leaf, op, ctx_var),
    LeafOp::Spatial(op) => compile_spatial(leaf, op, ctx_var),
  };
}

/// LHS of a leaf term. Spatial terms keep the JSON structure (`->`) so the
/// value can be handed to the geometry parser; everything else text-extracts.
fn leaf_lhs(leaf: &Leaf, ctx_var: &str, spatial: bool) -> String {
  let arrow = if spatial { "->" } else { "->>" };
  return match leaf.source {
    Source::Resource => {
      if leaf.attr == "geometry" {
        "resource.geometry".to_string()
      } else {
        format!("resource.attributes{arrow}{}", quote_literal(&leaf.attr))
      }
    }
    Source::Principal => format!("{ctx_var}->'principal'{arrow}{}", quote_literal(&leaf.attr)),
    Source::Context => format!("{ctx_var}->'context'{arrow}{}", quote_literal(&leaf.attr)),
  };
}

/// Path walk for a `$bag.dotted.path` reference. Intermediate steps keep the
/// JSON structure; the final step text-extracts unless the consumer is a
/// spatial operator. Resource references always text-extract, the geometry
/// parser re-reads them as text anyway.
fn var_ref_sql(var: &VarRef, ctx_var: &str, spatial: bool) -> String {
  let (base, final_arrow) = match var.bag {
    Source::Resource => ("resource.attributes".to_string(), "->>"),
    Source::Principal => (
      format!("{ctx_var}->'principal'"),
      if spatial { "->" } else { "->>" },
    ),
    Source::Context => (
      format!("{ctx_var}->'context'"),
      if spatial { "->" } else { "->>" },
    ),
  };

  let mut sql = base;
  for (i, part) in var.path.iter().enumerate() {
    let arrow = if i + 1 == var.path.len() { final_arrow } else { "->" };
    sql.push_str(arrow);
    sql.push_str(&quote_literal(part));
  }
  return sql;
}

fn literal_rhs(value: &serde_json::Value) -> String {
  use serde_json::Value;

  return match value {
    Value::String(s) => quote_literal(s),
    Value::Bool(b) => quote_literal(if *b { "true" } else { "false" }),
    Value::Number(n) => n.to_string(),
    Value::Null => "NULL".to_string(),
    Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
  };
}

/// Cast suffix driven by the literal's JSON type. References and arrays
/// compare as text.
fn cast_suffix(val: &CondValue) -> &'static str {
  return match val {
    CondValue::Literal(serde_json::Value::Number(_)) => "::numeric",
    CondValue::Literal(serde_json::Value::Bool(_)) => "::boolean",
    _ => "",
  };
}

fn array_literal(leaf: &Leaf, op: &'static str) -> Result<String, CompileError> {
  let CondValue::Literal(value @ serde_json::Value::Array(_)) = &leaf.val else {
    return Err(CompileError::InvalidOperand {
      op,
      expected: "a JSON array value",
    });
  };
  return Ok(value.to_string());
}

fn compile_scalar(leaf: &Leaf, op: ScalarOp, ctx_var: &str) -> Result<String, CompileError> {
  let cast = cast_suffix(&leaf.val);
  let lhs = format!("({}){cast}", leaf_lhs(leaf, ctx_var, false));

  match op {
    ScalarOp::In => {
      let arr = array_literal(leaf, "in")?;
      return Ok(format!(
        "{lhs} = ANY(ARRAY(SELECT jsonb_array_elements_text({}::jsonb)))",
        quote_literal(&arr)
      ));
    }
    ScalarOp::NotIn => {
      let arr = array_literal(leaf, "not_in")?;
      return Ok(format!(
        "NOT ({lhs} = ANY(ARRAY(SELECT jsonb_array_elements_text({}::jsonb))))",
        quote_literal(&arr)
      ));
    }
    ScalarOp::ContainsAll => {
      // JSONB containment needs the structured value on both sides.
      let arr = array_literal(leaf, "all")?;
      return Ok(format!(
        "({}) @> ({}::jsonb)",
        leaf_lhs(leaf, ctx_var, true),
        quote_literal(&arr)
      ));
    }
    _ => {}
  }

  let rhs = match &leaf.val {
    CondValue::Var(var) => var_ref_sql(var, ctx_var, false),
    CondValue::Literal(serde_json::Value::Array(_)) => {
      return Err(CompileError::InvalidOperand {
        op: op.as_token(),
        expected: "a scalar value or reference",
      });
    }
    CondValue::Literal(value) => literal_rhs(value),
  };

  return Ok(format!("{lhs} {} ({rhs}){cast}", op.as_token()));
}

fn compile_spatial(leaf: &Leaf, op: SpatialOp, ctx_var: &str) -> Result<String, CompileError> {
  let lhs_raw = leaf_lhs(leaf, ctx_var, true);
  let lhs = if lhs_raw == "resource.geometry" {
    lhs_raw
  } else {
    // JSON-sourced geometry only exists at execution time, route through the
    // format auto-detecting parser.
    format!("parse_geometry_to_3857(({lhs_raw})::text)")
  };

  let geom = match &leaf.val {
    CondValue::Var(var) => {
      format!("parse_geometry_to_3857(({})::text)", var_ref_sql(var, ctx_var, true))
    }
    CondValue::Literal(value) => {
      let text = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(_) => value.to_string(),
        _ => {
          return Err(CompileError::InvalidOperand {
            op: op.as_token(),
            expected: "a geometry literal or reference",
          });
        }
      };
      GeometryFormat::detect(&text).to_sql_expr(&quote_literal(&text))
    }
  };

  if op == SpatialOp::DWithin {
    let distance = dwithin_distance(leaf.args.as_ref())?;
    return Ok(format!("ST_DWithin({lhs}, {geom}, {distance})"));
  }
  return Ok(format!("{}({lhs}, {geom})", op.as_sql()));
}

/// `args` is either the bare distance or the legacy `{"distance": n}` form.
fn dwithin_distance(args: Option<&serde_json::Value>) -> Result<String, CompileError> {
  use serde_json::Value;

  let Some(args) = args else {
    return Ok("0".to_string());
  };
  return match args {
    Value::Null => Ok("0".to_string()),
    Value::Number(n) => Ok(n.to_string()),
    Value::String(s) => s
      .parse::<f64>()
      .map(|d| d.to_string())
      .map_err(|_| CompileError::InvalidDistance),
    Value::Object(map) => match map.get("distance") {
      Some(Value::Number(n)) => Ok(n.to_string()),
      _ => Err(CompileError::InvalidDistance),
    },
    _ => Err(CompileError::InvalidDistance),
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn parse(value: serde_json::Value) -> Condition {
    return Condition::from_value(&value).unwrap().unwrap();
  }

  fn compile_json(value: serde_json::Value) -> String {
    return compile(Some(&parse(value)), "p_ctx").unwrap();
  }

  #[test]
  fn test_null_compiles_to_true() {
    assert_eq!(compile(None, "p_ctx").unwrap(), "TRUE");
  }

  #[test]
  fn test_empty_junction_compiles_to_true() {
    assert_eq!(compile_json(json!({"op": "and", "conditions": []})), "TRUE");
    assert_eq!(compile_json(json!({"op": "or", "conditions": []})), "TRUE");
  }

  #[test]
  fn test_string_equality() {
    assert_eq!(
      compile_json(json!({"op": "=", "attr": "status", "val": "active"})),
      "(resource.attributes->>'status') = ('active')"
    );
  }

  #[test]
  fn test_numeric_comparison_casts_both_sides() {
    assert_eq!(
      compile_json(json!({"op": "<", "attr": "hour", "val": 22, "source": "context"})),
      "(p_ctx->'context'->>'hour')::numeric < (22)::numeric"
    );
  }

  #[test]
  fn test_boolean_cast() {
    assert_eq!(
      compile_json(json!({"op": "=", "attr": "deleted", "val": true})),
      "(resource.attributes->>'deleted')::boolean = ('true')::boolean"
    );
  }

  #[test]
  fn test_null_literal() {
    assert_eq!(
      compile_json(json!({"op": "!=", "attr": "owner", "val": null})),
      "(resource.attributes->>'owner') != (NULL)"
    );
  }

  #[test]
  fn test_principal_reference_rhs() {
    assert_eq!(
      compile_json(json!({"op": ">=", "attr": "clearance", "val": "$principal.clearance"})),
      "(resource.attributes->>'clearance') >= (p_ctx->'principal'->>'clearance')"
    );
  }

  #[test]
  fn test_nested_reference_path() {
    assert_eq!(
      compile_json(json!({"op": "=", "attr": "region", "val": "$context.geo.region"})),
      "(resource.attributes->>'region') = (p_ctx->'context'->'geo'->>'region')"
    );
  }

  #[test]
  fn test_resource_reference_both_sides() {
    // Both sides read from resource.attributes; single-segment paths
    // text-extract directly.
    assert_eq!(
      compile_json(json!({"op": "=", "attr": "owner", "val": "$resource.creator"})),
      "(resource.attributes->>'owner') = (resource.attributes->>'creator')"
    );
    assert_eq!(
      compile_json(json!({"op": "=", "attr": "owner", "val": "$resource.audit.created_by"})),
      "(resource.attributes->>'owner') = (resource.attributes->'audit'->>'created_by')"
    );
  }

  #[test]
  fn test_in_operator() {
    assert_eq!(
      compile_json(json!({"op": "in", "attr": "status", "val": ["active", "pending"]})),
      "(resource.attributes->>'status') = \
       ANY(ARRAY(SELECT jsonb_array_elements_text('[\"active\",\"pending\"]'::jsonb)))"
    );
  }

  #[test]
  fn test_not_in_operator() {
    assert_eq!(
      compile_json(json!({"op": "not_in", "attr": "status", "val": ["deleted", "archived"]})),
      "NOT ((resource.attributes->>'status') = \
       ANY(ARRAY(SELECT jsonb_array_elements_text('[\"deleted\",\"archived\"]'::jsonb))))"
    );
  }

  #[test]
  fn test_all_operator_is_jsonb_containment() {
    assert_eq!(
      compile_json(json!({"op": "all", "attr": "roles", "val": ["admin", "moderator"]})),
      "(resource.attributes->'roles') @> ('[\"admin\",\"moderator\"]'::jsonb)"
    );
  }

  #[test]
  fn test_in_rejects_scalar_operand() {
    let cond = parse(json!({"op": "in", "attr": "status", "val": "active"}));
    assert_eq!(
      compile(Some(&cond), "p_ctx").unwrap_err(),
      CompileError::InvalidOperand {
        op: "in",
        expected: "a JSON array value",
      }
    );
  }

  #[test]
  fn test_equality_rejects_array_operand() {
    let cond = parse(json!({"op": "=", "attr": "status", "val": ["a", "b"]}));
    assert!(matches!(
      compile(Some(&cond), "p_ctx").unwrap_err(),
      CompileError::InvalidOperand { op: "=", .. }
    ));
  }

  #[test]
  fn test_junctions() {
    assert_eq!(
      compile_json(json!({
        "op": "and",
        "conditions": [
          {"op": "=", "attr": "a", "val": "x"},
          {"op": "or", "conditions": [
            {"op": "=", "attr": "b", "val": "y"},
            {"op": "=", "attr": "c", "val": "z"},
          ]},
        ],
      })),
      "((resource.attributes->>'a') = ('x') AND \
       ((resource.attributes->>'b') = ('y') OR (resource.attributes->>'c') = ('z')))"
    );
  }

  #[test]
  fn test_not_wraps_child() {
    assert_eq!(
      compile_json(json!({
        "op": "not",
        "conditions": [{"op": "=", "attr": "deleted", "val": true}],
      })),
      "NOT ((resource.attributes->>'deleted')::boolean = ('true')::boolean)"
    );
  }

  #[test]
  fn test_double_negation_preserves_inner() {
    let inner = compile_json(json!({"op": "=", "attr": "a", "val": "x"}));
    let doubled = compile_json(json!({
      "op": "not",
      "conditions": [{
        "op": "not",
        "conditions": [{"op": "=", "attr": "a", "val": "x"}],
      }],
    }));
    assert_eq!(doubled, format!("NOT (NOT ({inner}))"));
  }

  #[test]
  fn test_dwithin_wkt_literal() {
    assert_eq!(
      compile_json(json!({
        "op": "st_dwithin",
        "attr": "geometry",
        "val": "POINT(1050 1000)",
        "args": 100,
      })),
      "ST_DWithin(resource.geometry, \
       ST_SetSRID(ST_GeomFromText('POINT(1050 1000)'), 3857), 100)"
    );
  }

  #[test]
  fn test_dwithin_defaults_distance_to_zero() {
    assert_eq!(
      compile_json(json!({"op": "st_dwithin", "attr": "geometry", "val": "POINT(0 0)"})),
      "ST_DWithin(resource.geometry, ST_SetSRID(ST_GeomFromText('POINT(0 0)'), 3857), 0)"
    );
  }

  #[test]
  fn test_dwithin_legacy_distance_args() {
    assert_eq!(
      compile_json(json!({
        "op": "st_dwithin",
        "attr": "geometry",
        "val": "POINT(0 0)",
        "args": {"distance": 250.5},
      })),
      "ST_DWithin(resource.geometry, ST_SetSRID(ST_GeomFromText('POINT(0 0)'), 3857), 250.5)"
    );
  }

  #[test]
  fn test_dwithin_context_reference() {
    assert_eq!(
      compile_json(json!({
        "op": "st_dwithin",
        "attr": "geometry",
        "val": "$context.loc",
        "args": 100,
      })),
      "ST_DWithin(resource.geometry, \
       parse_geometry_to_3857((p_ctx->'context'->'loc')::text), 100)"
    );
  }

  #[test]
  fn test_spatial_geojson_literal_transforms_from_4326() {
    assert_eq!(
      compile_json(json!({
        "op": "st_within",
        "attr": "geometry",
        "val": {"type": "Point", "coordinates": [8.5, 47.4]},
      })),
      "ST_Within(resource.geometry, \
       ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON(\
       '{\"type\":\"Point\",\"coordinates\":[8.5,47.4]}'), 4326), 3857))"
    );
  }

  #[test]
  fn test_spatial_ewkt_literals() {
    assert_eq!(
      compile_json(json!({
        "op": "st_intersects",
        "attr": "geometry",
        "val": "SRID=3857;POINT(1 2)",
      })),
      "ST_Intersects(resource.geometry, ST_GeomFromEWKT('SRID=3857;POINT(1 2)'))"
    );
    assert_eq!(
      compile_json(json!({
        "op": "st_intersects",
        "attr": "geometry",
        "val": "SRID=4326;POINT(8.5 47.4)",
      })),
      "ST_Intersects(resource.geometry, \
       ST_Transform(ST_GeomFromEWKT('SRID=4326;POINT(8.5 47.4)'), 3857))"
    );
  }

  #[test]
  fn test_spatial_json_lhs_goes_through_parser() {
    assert_eq!(
      compile_json(json!({
        "op": "st_contains",
        "attr": "area",
        "val": "POINT(1 2)",
        "source": "context",
      })),
      "ST_Contains(parse_geometry_to_3857((p_ctx->'context'->'area')::text), \
       ST_SetSRID(ST_GeomFromText('POINT(1 2)'), 3857))"
    );
  }

  #[test]
  fn test_attr_names_are_quoted_as_literals() {
    assert_eq!(
      compile_json(json!({"op": "=", "attr": "a'; DROP TABLE acl; --", "val": "x"})),
      "(resource.attributes->>'a''; DROP TABLE acl; --') = ('x')"
    );
  }

  #[test]
  fn test_custom_ctx_var() {
    let cond = parse(json!({"op": "=", "attr": "dept", "val": "$principal.dept"}));
    assert_eq!(
      compile(Some(&cond), "$1").unwrap(),
      "(resource.attributes->>'dept') = ($1->'principal'->>'dept')"
    );
  }

  #[test]
  fn test_compiler_is_deterministic() {
    let value = json!({
      "op": "and",
      "conditions": [
        {"op": "in", "attr": "status", "val": ["a", "b"]},
        {"op": "st_dwithin", "attr": "geometry", "val": "$context.loc", "args": 5000},
      ],
    });
    assert_eq!(compile_json(value.clone()), compile_json(value));
  }
}
