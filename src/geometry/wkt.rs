//! Geometry normalization and EWKT rendering
//!
//! Every geometry leaves this module 3-D (missing Z becomes 0) with closed,
//! valid rings. Rendering tags it with an SRID so the store can reproject on
//! insert.

use super::rings::MIN_RING_POINTS;
use super::{Coord, Geometry};
use crate::error::{LayerError, LayerResult};

/// KML coordinates are always WGS 84 longitude/latitude
pub const KML_SRID: i32 = 4326;

/// Validate, close rings and lift to 3-D
pub fn normalize(geometry: Geometry) -> LayerResult<Geometry> {
    Ok(match geometry {
        Geometry::Point(coord) => Geometry::Point(lift(coord)),
        Geometry::LineString(coords) => {
            if coords.len() < 2 {
                return Err(LayerError::malformed_geometry(format!(
                    "LineString has {} point(s), at least 2 are required.",
                    coords.len()
                )));
            }
            Geometry::LineString(coords.into_iter().map(lift).collect())
        }
        Geometry::LinearRing(coords) => Geometry::LinearRing(normalize_ring(coords)?),
        Geometry::Polygon {
            exterior,
            interiors,
        } => Geometry::Polygon {
            exterior: normalize_ring(exterior)?,
            interiors: interiors
                .into_iter()
                .map(normalize_ring)
                .collect::<LayerResult<_>>()?,
        },
        Geometry::Multi(parts) => Geometry::Multi(
            parts
                .into_iter()
                .map(normalize)
                .collect::<LayerResult<_>>()?,
        ),
    })
}

fn lift(coord: Coord) -> Coord {
    Coord {
        z: Some(coord.z.unwrap_or(0.0)),
        ..coord
    }
}

fn normalize_ring(coords: Vec<Coord>) -> LayerResult<Vec<Coord>> {
    if coords.len() < MIN_RING_POINTS {
        return Err(LayerError::malformed_geometry(format!(
            "LinearRing has {} point(s), at least {} are required.",
            coords.len(),
            MIN_RING_POINTS
        )));
    }
    let mut ring: Vec<Coord> = coords.into_iter().map(lift).collect();
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied())
        && first != last
    {
        ring.push(first);
    }
    Ok(ring)
}

/// Render as EWKT, e.g. `SRID=4326;POINT Z (1 2 0)`
pub fn to_ewkt(geometry: &Geometry, srid: i32) -> String {
    format!("SRID={};{}", srid, to_wkt(geometry))
}

fn to_wkt(geometry: &Geometry) -> String {
    match geometry {
        Geometry::Point(coord) => format!("POINT Z ({})", tuple(coord)),
        Geometry::LineString(coords) | Geometry::LinearRing(coords) => {
            format!("LINESTRING Z {}", sequence(coords))
        }
        Geometry::Polygon {
            exterior,
            interiors,
        } => format!("POLYGON Z {}", rings(exterior, interiors)),
        Geometry::Multi(parts) => multi(parts),
    }
}

fn multi(parts: &[Geometry]) -> String {
    if parts.iter().all(|p| matches!(p, Geometry::Point(_))) {
        let points: Vec<String> = parts
            .iter()
            .filter_map(|p| match p {
                Geometry::Point(c) => Some(format!("({})", tuple(c))),
                _ => None,
            })
            .collect();
        return format!("MULTIPOINT Z ({})", points.join(", "));
    }
    if parts
        .iter()
        .all(|p| matches!(p, Geometry::LineString(_) | Geometry::LinearRing(_)))
    {
        let lines: Vec<String> = parts
            .iter()
            .filter_map(|p| match p {
                Geometry::LineString(c) | Geometry::LinearRing(c) => Some(sequence(c)),
                _ => None,
            })
            .collect();
        return format!("MULTILINESTRING Z ({})", lines.join(", "));
    }
    if parts.iter().all(|p| matches!(p, Geometry::Polygon { .. })) {
        let polygons: Vec<String> = parts
            .iter()
            .filter_map(|p| match p {
                Geometry::Polygon {
                    exterior,
                    interiors,
                } => Some(rings(exterior, interiors)),
                _ => None,
            })
            .collect();
        return format!("MULTIPOLYGON Z ({})", polygons.join(", "));
    }
    let members: Vec<String> = parts.iter().map(to_wkt).collect();
    format!("GEOMETRYCOLLECTION Z ({})", members.join(", "))
}

fn tuple(coord: &Coord) -> String {
    format!("{} {} {}", coord.x, coord.y, coord.z.unwrap_or(0.0))
}

fn sequence(coords: &[Coord]) -> String {
    let tuples: Vec<String> = coords.iter().map(tuple).collect();
    format!("({})", tuples.join(", "))
}

fn rings(exterior: &[Coord], interiors: &[Vec<Coord>]) -> String {
    let mut all = vec![sequence(exterior)];
    all.extend(interiors.iter().map(|ring| sequence(ring)));
    format!("({})", all.join(", "))
}

/// Split an EWKT string into its SRID and WKT body
pub fn split_ewkt(ewkt: &str) -> Option<(i32, &str)> {
    let (header, body) = ewkt.split_once(';')?;
    let srid = header.trim().strip_prefix("SRID=")?.parse().ok()?;
    Some((srid, body))
}

/// Whether a WKT/EWKT geometry is declared with a Z dimension
pub fn is_3d(wkt: &str) -> bool {
    let body = split_ewkt(wkt).map(|(_, body)| body).unwrap_or(wkt);
    body.split('(')
        .next()
        .is_some_and(|head| head.split_whitespace().any(|token| token == "Z" || token == "ZM"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ring(points: &[(f64, f64)]) -> Vec<Coord> {
        points.iter().map(|&(x, y)| Coord::xy(x, y)).collect()
    }

    #[test]
    fn test_point_lifted_to_3d() {
        let geometry = normalize(Geometry::Point(Coord::xy(-58.4, -34.6))).unwrap();
        assert_eq!(to_ewkt(&geometry, KML_SRID), "SRID=4326;POINT Z (-58.4 -34.6 0)");
    }

    #[test]
    fn test_native_z_kept() {
        let geometry = normalize(Geometry::Point(Coord::xyz(1.0, 2.0, 35.5))).unwrap();
        assert_eq!(to_ewkt(&geometry, KML_SRID), "SRID=4326;POINT Z (1 2 35.5)");
    }

    #[test]
    fn test_padded_ring_is_closed() {
        let geometry = normalize(Geometry::Polygon {
            exterior: ring(&[(0.0, 0.0), (1.0, 1.0), (1.0, 1.0), (1.0, 1.0)]),
            interiors: vec![],
        })
        .unwrap();
        assert_eq!(
            to_ewkt(&geometry, KML_SRID),
            "SRID=4326;POLYGON Z ((0 0 0, 1 1 0, 1 1 0, 1 1 0, 0 0 0))"
        );
    }

    #[test]
    fn test_short_ring_rejected_with_hint() {
        let err = normalize(Geometry::Polygon {
            exterior: ring(&[(0.0, 0.0), (1.0, 1.0)]),
            interiors: vec![],
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.message.starts_with("LinearRing has 2 point(s)"));
        assert!(err.message.ends_with(crate::error::RING_RETRY_HINT));
    }

    #[test]
    fn test_short_linestring_rejected() {
        let err = normalize(Geometry::LineString(ring(&[(0.0, 0.0)]))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_multi_rendering() {
        let points = Geometry::Multi(vec![
            Geometry::Point(Coord::xy(1.0, 2.0)),
            Geometry::Point(Coord::xy(3.0, 4.0)),
        ]);
        assert_eq!(
            to_ewkt(&normalize(points).unwrap(), 4326),
            "SRID=4326;MULTIPOINT Z ((1 2 0), (3 4 0))"
        );

        let mixed = Geometry::Multi(vec![
            Geometry::Point(Coord::xy(1.0, 2.0)),
            Geometry::LineString(ring(&[(0.0, 0.0), (1.0, 0.0)])),
        ]);
        assert_eq!(
            to_ewkt(&normalize(mixed).unwrap(), 4326),
            "SRID=4326;GEOMETRYCOLLECTION Z (POINT Z (1 2 0), LINESTRING Z (0 0 0, 1 0 0))"
        );
    }

    #[test]
    fn test_split_and_dimension() {
        let ewkt = "SRID=22185;POLYGON Z ((0 0 0, 1 0 0, 1 1 0, 0 0 0))";
        assert_eq!(split_ewkt(ewkt).map(|(srid, _)| srid), Some(22185));
        assert!(is_3d(ewkt));
        assert!(!is_3d("SRID=4326;POINT (1 2)"));
    }
}
