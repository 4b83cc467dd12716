//! Minimal GeoJSON decoding into `geo` types.
//!
//! Only what feature services hand back is supported: points, polygons and
//! multi-polygons. Other geometry types decode to `None`.

use geo::{Coord, Geometry, LineString, MultiPolygon, Point, Polygon};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{RawFeature, ServiceError};

/// CRS assumed when a document does not name one (RFC 7946).
pub const DEFAULT_EPSG: i32 = 4326;

#[derive(Debug, Deserialize)]
pub struct FeatureCollection {
    #[serde(default)]
    pub crs: Option<NamedCrs>,
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
pub struct NamedCrs {
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub geometry: Option<GeoJsonGeometry>,
}

type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJsonGeometry {
    Point { coordinates: Position },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    #[serde(other)]
    Unsupported,
}

impl FeatureCollection {
    /// Parse a feature collection from JSON text.
    ///
    /// # Errors
    /// Returns [`ServiceError::Decode`] on malformed JSON.
    pub fn parse(text: &str) -> Result<Self, ServiceError> {
        serde_json::from_str(text).map_err(|e| ServiceError::Decode(e.to_string()))
    }

    /// EPSG code named by the `crs` member, or [`DEFAULT_EPSG`].
    #[must_use]
    pub fn epsg(&self) -> i32 {
        self.crs
            .as_ref()
            .and_then(|crs| crs.properties.get("name"))
            .and_then(Value::as_str)
            .and_then(parse_crs_name)
            .unwrap_or(DEFAULT_EPSG)
    }

    #[must_use]
    pub fn into_raw_features(self) -> Vec<RawFeature> {
        self.features
            .into_iter()
            .map(|f| {
                RawFeature::new(
                    f.properties.unwrap_or_default(),
                    f.geometry.and_then(GeoJsonGeometry::into_geo),
                )
            })
            .collect()
    }
}

/// Parse `EPSG:3857` or `urn:ogc:def:crs:EPSG::3857`.
fn parse_crs_name(name: &str) -> Option<i32> {
    if name.contains("CRS84") {
        return Some(DEFAULT_EPSG);
    }
    name.rsplit(':').next()?.trim().parse().ok()
}

impl GeoJsonGeometry {
    #[must_use]
    pub fn into_geo(self) -> Option<Geometry<f64>> {
        match self {
            Self::Point { coordinates } => to_coord(&coordinates).map(|c| Geometry::Point(Point(c))),
            Self::Polygon { coordinates } => to_polygon(&coordinates).map(Geometry::Polygon),
            Self::MultiPolygon { coordinates } => {
                let polygons: Vec<Polygon<f64>> =
                    coordinates.iter().filter_map(|p| to_polygon(p)).collect();
                (!polygons.is_empty()).then(|| Geometry::MultiPolygon(MultiPolygon::new(polygons)))
            }
            Self::Unsupported => None,
        }
    }
}

fn to_coord(position: &[f64]) -> Option<Coord<f64>> {
    match position {
        [x, y, ..] => Some(Coord { x: *x, y: *y }),
        _ => None,
    }
}

fn to_ring(ring: &[Position]) -> Option<LineString<f64>> {
    let coords: Option<Vec<Coord<f64>>> = ring.iter().map(|p| to_coord(p)).collect();
    coords.map(LineString::new)
}

fn to_polygon(rings: &[Vec<Position>]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    let exterior = to_ring(exterior)?;
    let interiors = interiors.iter().filter_map(|r| to_ring(r)).collect();
    Some(Polygon::new(exterior, interiors))
}

/// Read a geometry as a multi-polygon; points and unsupported types give
/// `None`.
#[must_use]
pub fn as_multi_polygon(geometry: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::3857"}},
        "features": [
            {"type": "Feature", "properties": {"lt_code_1": "LT1"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[10,0],[10,10],[0,0]]]}},
            {"type": "Feature", "properties": null,
             "geometry": {"type": "Point", "coordinates": [5, 5, 100]}},
            {"type": "Feature", "properties": {},
             "geometry": {"type": "LineString", "coordinates": [[0,0],[1,1]]}},
            {"type": "Feature", "properties": {},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[0,0],[1,0],[1,1],[0,0]]], [[[5,5],[6,5],[6,6],[5,5]]]]}}
        ]
    }"#;

    #[test]
    fn test_decode_feature_collection() {
        let fc = FeatureCollection::parse(SAMPLE).unwrap();
        assert_eq!(fc.epsg(), 3857);
        let features = fc.into_raw_features();
        assert_eq!(features.len(), 4);
        assert!(matches!(features[0].geometry, Some(Geometry::Polygon(_))));
        assert_eq!(features[0].text("lt_code_1").as_deref(), Some("LT1"));
        assert_eq!(features[1].geometry, Some(Geometry::Point(Point::new(5.0, 5.0))));
        assert!(features[2].geometry.is_none());
        match &features[3].geometry {
            Some(Geometry::MultiPolygon(mp)) => assert_eq!(mp.0.len(), 2),
            other => panic!("unexpected geometry {other:?}"),
        }
    }

    #[test]
    fn test_crs_defaults_to_wgs84() {
        let fc = FeatureCollection::parse(r#"{"type": "FeatureCollection", "features": []}"#).unwrap();
        assert_eq!(fc.epsg(), 4326);
        assert_eq!(parse_crs_name("EPSG:28356"), Some(28356));
        assert_eq!(parse_crs_name("urn:ogc:def:crs:OGC:1.3:CRS84"), Some(4326));
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        assert!(matches!(
            FeatureCollection::parse("{"),
            Err(ServiceError::Decode(_))
        ));
    }
}
