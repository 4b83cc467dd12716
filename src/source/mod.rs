//! Feature service abstraction.
//!
//! The pipeline never talks to a concrete backend. It is handed an
//! `Arc<dyn FeatureService>`; the binary uses [`LocalFeatureService`] over a
//! directory of GeoJSON files and tests use [`InMemoryFeatureService`].
//!
//! # Example
//!
//! ```rust,no_run
//! use landtypes::source::{FeatureService, LocalFeatureService, LocalScanOptions};
//! use landtypes::lotplan::LotPlan;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let service = LocalFeatureService::scan("/data/qld", &LocalScanOptions::default())?;
//! let lotplan = LotPlan::parse("13SP181800")?;
//! if let Some(parcel) = service.fetch_parcel(&lotplan).await? {
//!     println!("{} uses EPSG:{}", parcel.lotplan, parcel.epsg);
//! }
//! # Ok(())
//! # }
//! ```

pub mod geojson;
pub mod local;
pub mod memory;

pub use local::{LocalFeatureService, LocalScanOptions, LocalServiceStats};
pub use memory::InMemoryFeatureService;

use async_trait::async_trait;
use geo::{BoundingRect, Geometry};
use serde_json::{Map, Value};

use crate::geometry::projection::Reprojector;
use crate::geometry::Extent;
use crate::lotplan::LotPlan;
use crate::model::{Envelope, Parcel, ThemeLayer};

/// Errors reported by a feature service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("service call timed out after {0} ms")]
    Timeout(u64),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("service returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("cannot decode service response: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl ServiceError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::Io(_) => false,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A feature as returned by the service: attribute bag plus geometry in the
/// CRS of its [`RawFeatureSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawFeature {
    pub properties: Map<String, Value>,
    pub geometry: Option<Geometry<f64>>,
}

impl RawFeature {
    pub fn new(properties: Map<String, Value>, geometry: Option<Geometry<f64>>) -> Self {
        Self {
            properties,
            geometry,
        }
    }

    /// Attribute as trimmed text; numbers are formatted, empty strings and
    /// nulls are `None`.
    #[must_use]
    pub fn text(&self, field: &str) -> Option<String> {
        let text = match self.properties.get(field)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => return None,
        };
        (!text.is_empty()).then_some(text)
    }

    /// First non-empty attribute among `fields`.
    #[must_use]
    pub fn first_text(&self, fields: &[&str]) -> Option<String> {
        fields.iter().find_map(|f| self.text(f))
    }

    /// Attribute as a number; numeric strings (with thousands separators) are
    /// accepted.
    #[must_use]
    pub fn number(&self, field: &str) -> Option<f64> {
        match self.properties.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', "").parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn extent(&self) -> Option<Extent> {
        let rect = self.geometry.as_ref()?.bounding_rect()?;
        Some(Extent::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y))
    }
}

/// Features from one query, all in `epsg`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawFeatureSet {
    pub features: Vec<RawFeature>,
    pub epsg: i32,
}

/// Capability to resolve parcels and query classified features.
#[async_trait]
pub trait FeatureService: Send + Sync {
    /// Resolve a parcel. `Ok(None)` means the identifier is unknown.
    async fn fetch_parcel(&self, lotplan: &LotPlan) -> Result<Option<Parcel>, ServiceError>;

    /// Polygons of `theme` whose bounding boxes intersect `envelope`.
    async fn query_features(
        &self,
        theme: ThemeLayer,
        envelope: &Envelope,
    ) -> Result<RawFeatureSet, ServiceError>;

    /// Bore points inside `envelope`.
    async fn fetch_bores_in_envelope(&self, envelope: &Envelope)
        -> Result<RawFeatureSet, ServiceError>;
}

/// Select features whose bounding box meets `envelope`, reprojecting the
/// envelope into `layer_epsg` first.
///
/// # Errors
/// Returns [`ServiceError::Decode`] if the envelope cannot be reprojected.
pub fn filter_by_envelope(
    features: &[RawFeature],
    layer_epsg: i32,
    envelope: &Envelope,
) -> Result<RawFeatureSet, ServiceError> {
    let window = if envelope.epsg == layer_epsg {
        envelope.extent
    } else {
        let reprojector = Reprojector::new(envelope.epsg, layer_epsg)
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        envelope
            .extent
            .reproject(&reprojector)
            .map_err(|e| ServiceError::Decode(e.to_string()))?
    };
    let features = features
        .iter()
        .filter(|f| f.extent().is_some_and(|e| e.intersects(&window)))
        .cloned()
        .collect();
    Ok(RawFeatureSet {
        features,
        epsg: layer_epsg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ServiceError::Timeout(100).is_retryable());
        assert!(ServiceError::Unavailable("down".into()).is_retryable());
        assert!(ServiceError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(ServiceError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(!ServiceError::Http { status: 400, message: String::new() }.is_retryable());
        assert!(!ServiceError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn test_attribute_access() {
        let feature = RawFeature::new(
            props(json!({"code": " LT1 ", "empty": "  ", "n": 42, "area": "1,234.5", "nil": null})),
            None,
        );
        assert_eq!(feature.text("code").as_deref(), Some("LT1"));
        assert_eq!(feature.text("empty"), None);
        assert_eq!(feature.text("nil"), None);
        assert_eq!(feature.text("n").as_deref(), Some("42"));
        assert_eq!(feature.number("area"), Some(1234.5));
        assert_eq!(feature.first_text(&["missing", "empty", "code"]).as_deref(), Some("LT1"));
    }

    #[test]
    fn test_filter_by_envelope() {
        let inside = RawFeature::new(
            Map::new(),
            Some(Geometry::Polygon(polygon![
                (x: 1.0, y: 1.0), (x: 2.0, y: 1.0), (x: 2.0, y: 2.0), (x: 1.0, y: 1.0),
            ])),
        );
        let outside = RawFeature::new(Map::new(), Some(Geometry::Point(point!(x: 50.0, y: 50.0))));
        let no_geometry = RawFeature::new(Map::new(), None);
        let envelope = Envelope {
            extent: Extent::new(0.0, 0.0, 10.0, 10.0),
            epsg: 3857,
        };
        let set = filter_by_envelope(&[inside.clone(), outside, no_geometry], 3857, &envelope).unwrap();
        assert_eq!(set.features, vec![inside]);
        assert_eq!(set.epsg, 3857);
    }
}
