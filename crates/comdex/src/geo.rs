// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Geoqueries.
//!
//! A geoquery needs `georel`, `geometry` and `coordinates` together; the
//! entity's geoproperty (default `location`) is tested against the query
//! geometry. Relations are evaluated on the DE-9IM matrix from
//! [`::geo::Relate`].

use crate::entity::Entity;
use ::geo::{
    Coord, EuclideanDistance, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon, Relate,
};
use serde_json::Value;
use thiserror::Error;

/// Geoproperty consulted when the query names none.
pub const DEFAULT_GEOPROPERTY: &str = "location";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GeoError {
    #[error("geoquery needs georel, geometry and coordinates together")]
    Incomplete,

    #[error("unsupported georel '{0}'")]
    UnknownRelation(String),

    #[error("unsupported geometry type '{0}'")]
    UnknownGeometry(String),

    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),
}

/// Distance bound of a `near` relation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NearBound {
    MaxDistance(f64),
    MinDistance(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoRelation {
    Equals,
    Within,
    Intersects,
    Contains,
    Disjoint,
    Overlaps,
    Near(NearBound),
}

impl GeoRelation {
    /// Parse `equals`, `within`, ... or `near;maxDistance==d`.
    pub fn parse(text: &str) -> Result<Self, GeoError> {
        let unknown = || GeoError::UnknownRelation(text.to_string());
        Ok(match text.trim() {
            "equals" => Self::Equals,
            "within" => Self::Within,
            "intersects" => Self::Intersects,
            "contains" => Self::Contains,
            "disjoint" => Self::Disjoint,
            "overlaps" => Self::Overlaps,
            other => {
                let bound = other.strip_prefix("near;").ok_or_else(unknown)?;
                let (name, distance) = bound.split_once("==").ok_or_else(unknown)?;
                let distance: f64 = distance.trim().parse().map_err(|_| unknown())?;
                match name.trim() {
                    "maxDistance" => Self::Near(NearBound::MaxDistance(distance)),
                    "minDistance" => Self::Near(NearBound::MinDistance(distance)),
                    _ => return Err(unknown()),
                }
            }
        })
    }

    /// `entity REL query`.
    pub fn holds(&self, entity: &Geometry<f64>, query: &Geometry<f64>) -> bool {
        match self {
            Self::Near(NearBound::MaxDistance(max)) => distance(entity, query) <= *max,
            Self::Near(NearBound::MinDistance(min)) => distance(entity, query) >= *min,
            Self::Equals => entity.relate(query).is_equal_topo(),
            Self::Within => entity.relate(query).is_within(),
            Self::Intersects => entity.relate(query).is_intersects(),
            Self::Contains => entity.relate(query).is_contains(),
            Self::Disjoint => entity.relate(query).is_disjoint(),
            Self::Overlaps => entity.relate(query).is_overlaps(),
        }
    }
}

/// Parsed geoquery.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoQuery {
    pub relation: GeoRelation,
    pub geometry: Geometry<f64>,
    pub property: String,
}

impl GeoQuery {
    /// Build from the raw query parameters. Returns `Ok(None)` when none
    /// of the three required parameters is present.
    pub fn from_params(
        georel: Option<&str>,
        geometry: Option<&str>,
        coordinates: Option<&str>,
        geoproperty: Option<&str>,
    ) -> Result<Option<Self>, GeoError> {
        let (georel, geometry, coordinates) = match (georel, geometry, coordinates) {
            (None, None, None) => return Ok(None),
            (Some(r), Some(g), Some(c)) => (r, g, c),
            _ => return Err(GeoError::Incomplete),
        };
        let coords: Value = serde_json::from_str(coordinates)
            .map_err(|e| GeoError::InvalidCoordinates(e.to_string()))?;
        Ok(Some(Self {
            relation: GeoRelation::parse(georel)?,
            geometry: parse_geometry(geometry, &coords)?,
            property: geoproperty.unwrap_or(DEFAULT_GEOPROPERTY).to_string(),
        }))
    }

    /// Entities lacking a readable geoproperty never match.
    pub fn matches(&self, entity: &Entity) -> bool {
        entity
            .attribute_value(&self.property)
            .and_then(|v| geometry_from_geojson(v).ok())
            .is_some_and(|g| self.relation.holds(&g, &self.geometry))
    }
}

/// Parse a GeoJSON geometry object (`{"type": ..., "coordinates": ...}`).
pub fn geometry_from_geojson(value: &Value) -> Result<Geometry<f64>, GeoError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GeoError::InvalidCoordinates("geometry has no type".into()))?;
    let coords = value
        .get("coordinates")
        .ok_or_else(|| GeoError::InvalidCoordinates("geometry has no coordinates".into()))?;
    parse_geometry(kind, coords)
}

/// Build a geometry of `kind` from its coordinate array.
///
/// Polygons accept either GeoJSON rings or a bare exterior ring.
pub fn parse_geometry(kind: &str, coords: &Value) -> Result<Geometry<f64>, GeoError> {
    Ok(match kind {
        "Point" => Geometry::Point(Point::from(coord(coords)?)),
        "LineString" => Geometry::LineString(line(coords)?),
        "Polygon" => Geometry::Polygon(polygon(coords)?),
        "MultiPoint" => Geometry::MultiPoint(MultiPoint::new(
            list(coords)?
                .iter()
                .map(|c| coord(c).map(Point::from))
                .collect::<Result<_, _>>()?,
        )),
        "MultiLineString" => Geometry::MultiLineString(MultiLineString::new(
            list(coords)?.iter().map(line).collect::<Result<_, _>>()?,
        )),
        "MultiPolygon" => Geometry::MultiPolygon(MultiPolygon::new(
            list(coords)?.iter().map(polygon).collect::<Result<_, _>>()?,
        )),
        other => return Err(GeoError::UnknownGeometry(other.to_string())),
    })
}

fn list(value: &Value) -> Result<&Vec<Value>, GeoError> {
    value
        .as_array()
        .ok_or_else(|| GeoError::InvalidCoordinates(format!("expected an array, got {value}")))
}

fn coord(value: &Value) -> Result<Coord<f64>, GeoError> {
    match list(value)?.as_slice() {
        [x, y, ..] => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok(Coord { x, y }),
            _ => Err(GeoError::InvalidCoordinates(format!("non-numeric position {value}"))),
        },
        _ => Err(GeoError::InvalidCoordinates(format!("short position {value}"))),
    }
}

fn line(value: &Value) -> Result<LineString<f64>, GeoError> {
    let coords = list(value)?
        .iter()
        .map(coord)
        .collect::<Result<Vec<_>, _>>()?;
    if coords.len() < 2 {
        return Err(GeoError::InvalidCoordinates(
            "a line needs at least two positions".into(),
        ));
    }
    Ok(LineString::new(coords))
}

fn is_position(value: &Value) -> bool {
    value
        .as_array()
        .and_then(|a| a.first())
        .is_some_and(Value::is_number)
}

fn polygon(value: &Value) -> Result<Polygon<f64>, GeoError> {
    let items = list(value)?;
    if items.first().is_some_and(is_position) {
        return Ok(Polygon::new(line(value)?, Vec::new()));
    }
    let mut rings = items.iter().map(line);
    let exterior = rings
        .next()
        .ok_or_else(|| GeoError::InvalidCoordinates("polygon without rings".into()))??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Euclidean distance between two geometries; zero when they intersect.
pub fn distance(a: &Geometry<f64>, b: &Geometry<f64>) -> f64 {
    a.euclidean_distance(b)
}
