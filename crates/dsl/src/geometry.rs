/// Detected input encoding of a geometry value.
///
/// Stored geometries are normalized to SRID 3857. GeoJSON carries no SRID and
/// is assumed geographic (4326); EWKT declares its SRID inline; bare WKT is
/// assumed to already be in 3857.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryFormat {
  GeoJson,
  Ewkt { srid: Option<i32> },
  Wkt,
}

impl GeometryFormat {
  pub fn detect(geom_text: &str) -> GeometryFormat {
    let trimmed = geom_text.trim().trim_matches('"').trim();

    if trimmed.starts_with('{') {
      return GeometryFormat::GeoJson;
    }

    if trimmed.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("SRID=")) {
      let srid = trimmed
        .split_once(';')
        .and_then(|(srid_part, _wkt_part)| srid_part[5..].trim().parse::<i32>().ok());
      return GeometryFormat::Ewkt { srid };
    }

    return GeometryFormat::Wkt;
  }

  /// Wrap a SQL expression producing the geometry text (a quoted literal or a
  /// bind placeholder) into an expression yielding a SRID 3857 geometry.
  pub fn to_sql_expr(&self, value_expr: &str) -> String {
    return match self {
      GeometryFormat::GeoJson => {
        format!("ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON({value_expr}), 4326), 3857)")
      }
      GeometryFormat::Ewkt { srid: Some(3857) } => format!("ST_GeomFromEWKT({value_expr})"),
      GeometryFormat::Ewkt { .. } => {
        format!("ST_Transform(ST_GeomFromEWKT({value_expr}), 3857)")
      }
      GeometryFormat::Wkt => format!("ST_SetSRID(ST_GeomFromText({value_expr}), 3857)"),
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_detect() {
    assert_eq!(
      GeometryFormat::detect(r#"{"type": "Point", "coordinates": [8.5, 47.4]}"#),
      GeometryFormat::GeoJson
    );
    assert_eq!(
      GeometryFormat::detect("SRID=3857;POINT(1000 1000)"),
      GeometryFormat::Ewkt { srid: Some(3857) }
    );
    assert_eq!(
      GeometryFormat::detect("srid=4326;POINT(8.5 47.4)"),
      GeometryFormat::Ewkt { srid: Some(4326) }
    );
    assert_eq!(GeometryFormat::detect("POINT(1000 1000)"), GeometryFormat::Wkt);
    // JSON-encoded strings may arrive with their quotes still on.
    assert_eq!(GeometryFormat::detect("\"POINT(0 0)\""), GeometryFormat::Wkt);
    assert_eq!(GeometryFormat::detect("SRID=;POINT(0 0)"), GeometryFormat::Ewkt { srid: None });
  }

  #[test]
  fn test_to_sql_expr() {
    assert_eq!(
      GeometryFormat::GeoJson.to_sql_expr("$1"),
      "ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON($1), 4326), 3857)"
    );
    assert_eq!(
      GeometryFormat::Ewkt { srid: Some(3857) }.to_sql_expr("'SRID=3857;POINT(0 0)'"),
      "ST_GeomFromEWKT('SRID=3857;POINT(0 0)')"
    );
    assert_eq!(
      GeometryFormat::Ewkt { srid: Some(4326) }.to_sql_expr("$2"),
      "ST_Transform(ST_GeomFromEWKT($2), 3857)"
    );
    assert_eq!(
      GeometryFormat::Wkt.to_sql_expr("'POINT(0 0)'"),
      "ST_SetSRID(ST_GeomFromText('POINT(0 0)'), 3857)"
    );
  }
}
