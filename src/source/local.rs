//! Local filesystem feature service.
//!
//! Scans a directory of GeoJSON files laid out by layer:
//!
//! ```text
//! root/
//!   parcels/      features carrying a lot/plan attribute
//!   landtypes/
//!   vegetation/
//!   bores/
//! ```
//!
//! Everything is loaded at scan time; queries filter in memory.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::lotplan::LotPlan;
use crate::model::{Envelope, Parcel, ThemeLayer};

use super::geojson::{as_multi_polygon, FeatureCollection};
use super::{filter_by_envelope, FeatureService, RawFeature, RawFeatureSet, ServiceError};

/// Options for scanning a fixture directory.
#[derive(Debug, Clone)]
pub struct LocalScanOptions {
    /// Maximum depth below each layer directory (None = unlimited)
    pub max_depth: Option<usize>,
    /// File extensions to read (case-insensitive)
    pub extensions: Vec<String>,
    /// Whether to follow symbolic links
    pub follow_links: bool,
    /// Parcel attribute holding the lot/plan identifier
    pub lotplan_field: String,
}

impl Default for LocalScanOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            extensions: vec!["geojson".to_string(), "json".to_string()],
            follow_links: false,
            lotplan_field: "lotplan".to_string(),
        }
    }
}

impl LocalScanOptions {
    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_lotplan_field(mut self, field: &str) -> Self {
        self.lotplan_field = field.to_string();
        self
    }
}

/// A layer loaded from disk. Files in one layer may use different CRSs, so
/// features are kept grouped by EPSG code.
#[derive(Debug, Default)]
struct Layer {
    by_epsg: HashMap<i32, Vec<RawFeature>>,
}

impl Layer {
    fn push(&mut self, epsg: i32, features: Vec<RawFeature>) {
        self.by_epsg.entry(epsg).or_default().extend(features);
    }

    fn len(&self) -> usize {
        self.by_epsg.values().map(Vec::len).sum()
    }

    /// Features meeting `envelope`, reprojected into a single CRS (the
    /// envelope's) only when the layer mixes CRSs.
    fn query(&self, envelope: &Envelope) -> Result<RawFeatureSet, ServiceError> {
        match self.by_epsg.len() {
            0 => Ok(RawFeatureSet {
                features: Vec::new(),
                epsg: envelope.epsg,
            }),
            1 => {
                let (epsg, features) = self
                    .by_epsg
                    .iter()
                    .next()
                    .ok_or_else(|| ServiceError::Decode("empty layer".into()))?;
                filter_by_envelope(features, *epsg, envelope)
            }
            _ => {
                let mut epsgs: Vec<&i32> = self.by_epsg.keys().collect();
                epsgs.sort();
                let mut merged = RawFeatureSet {
                    features: Vec::new(),
                    epsg: envelope.epsg,
                };
                for epsg in epsgs {
                    let set = filter_by_envelope(&self.by_epsg[epsg], *epsg, envelope)?;
                    merged.features.extend(reproject_features(set, envelope.epsg)?);
                }
                Ok(merged)
            }
        }
    }
}

fn reproject_features(set: RawFeatureSet, target: i32) -> Result<Vec<RawFeature>, ServiceError> {
    use geo::{Coord, MapCoords};

    if set.epsg == target {
        return Ok(set.features);
    }
    let reprojector = crate::geometry::projection::Reprojector::new(set.epsg, target)
        .map_err(|e| ServiceError::Decode(e.to_string()))?;
    set.features
        .into_iter()
        .map(|f| {
            let geometry = f
                .geometry
                .map(|g| {
                    g.try_map_coords(|c| {
                        reprojector
                            .transform(c.x, c.y)
                            .map(|(x, y)| Coord { x, y })
                    })
                })
                .transpose()
                .map_err(|e| ServiceError::Decode(e.to_string()))?;
            Ok(RawFeature::new(f.properties, geometry))
        })
        .collect()
}

/// Feature service backed by GeoJSON files on disk.
///
/// # Example
///
/// ```rust,no_run
/// use landtypes::source::{LocalFeatureService, LocalScanOptions};
///
/// fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let service = LocalFeatureService::scan("/data/qld", &LocalScanOptions::default())?;
///     println!("{} parcels", service.stats().parcel_count);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct LocalFeatureService {
    parcels: HashMap<LotPlan, Parcel>,
    landtypes: Layer,
    vegetation: Layer,
    bores: Layer,
}

impl LocalFeatureService {
    /// Scan a fixture directory.
    ///
    /// # Errors
    /// Returns an error if the root directory does not exist.
    pub fn scan<P: AsRef<Path>>(
        root: P,
        options: &LocalScanOptions,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(format!("Directory does not exist: {}", root.display()).into());
        }

        let mut parcel_layer = Layer::default();
        let mut service = Self {
            parcels: HashMap::new(),
            landtypes: Layer::default(),
            vegetation: Layer::default(),
            bores: Layer::default(),
        };

        for (dir, layer) in [
            ("parcels", &mut parcel_layer),
            ("landtypes", &mut service.landtypes),
            ("vegetation", &mut service.vegetation),
            ("bores", &mut service.bores),
        ] {
            let path = root.join(dir);
            if path.is_dir() {
                load_layer(&path, options, layer);
            } else {
                debug!(path = %path.display(), "Layer directory missing");
            }
        }

        for (epsg, features) in parcel_layer.by_epsg {
            for feature in features {
                service.add_parcel_feature(feature, epsg, &options.lotplan_field);
            }
        }

        Ok(service)
    }

    fn add_parcel_feature(&mut self, feature: RawFeature, epsg: i32, lotplan_field: &str) {
        let Some(raw_id) = feature.text(lotplan_field) else {
            warn!(field = lotplan_field, "Parcel feature without lot/plan attribute");
            return;
        };
        let lotplan = match LotPlan::parse(&raw_id) {
            Ok(lp) => lp,
            Err(e) => {
                warn!(lotplan = %raw_id, error = %e, "Skipping parcel with bad lot/plan");
                return;
            }
        };
        let Some(boundary) = feature.geometry.as_ref().and_then(as_multi_polygon) else {
            warn!(lotplan = %lotplan, "Parcel feature without polygon geometry");
            return;
        };

        match self.parcels.get_mut(&lotplan) {
            Some(existing) if existing.epsg == epsg => {
                existing.boundary.0.extend(boundary.0);
            }
            Some(_) => {
                warn!(lotplan = %lotplan, epsg, "Parcel split across CRSs; keeping first");
            }
            None => {
                self.parcels.insert(
                    lotplan.clone(),
                    Parcel {
                        lotplan,
                        boundary,
                        epsg,
                    },
                );
            }
        }
    }

    /// Get statistics about loaded features.
    #[must_use]
    pub fn stats(&self) -> LocalServiceStats {
        LocalServiceStats {
            parcel_count: self.parcels.len(),
            landtype_count: self.landtypes.len(),
            vegetation_count: self.vegetation.len(),
            bore_count: self.bores.len(),
        }
    }
}

fn load_layer(dir: &Path, options: &LocalScanOptions, layer: &mut Layer) {
    let mut walker = WalkDir::new(dir).follow_links(options.follow_links);
    if let Some(max) = options.max_depth {
        walker = walker.max_depth(max + 1);
    }

    for entry in walker.into_iter().filter_map(std::result::Result::ok) {
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|e| options.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
        if !entry.file_type().is_file() || !matches_ext {
            continue;
        }

        match read_collection(path) {
            Ok((epsg, features)) => {
                debug!(path = %path.display(), count = features.len(), epsg, "Loaded features");
                layer.push(epsg, features);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read GeoJSON");
            }
        }
    }
}

fn read_collection(path: &Path) -> Result<(i32, Vec<RawFeature>), ServiceError> {
    let text = std::fs::read_to_string(path)?;
    let collection = FeatureCollection::parse(&text)?;
    let epsg = collection.epsg();
    Ok((epsg, collection.into_raw_features()))
}

#[async_trait]
impl FeatureService for LocalFeatureService {
    async fn fetch_parcel(&self, lotplan: &LotPlan) -> Result<Option<Parcel>, ServiceError> {
        Ok(self.parcels.get(lotplan).cloned())
    }

    async fn query_features(
        &self,
        theme: ThemeLayer,
        envelope: &Envelope,
    ) -> Result<RawFeatureSet, ServiceError> {
        match theme {
            ThemeLayer::LandTypes => self.landtypes.query(envelope),
            ThemeLayer::Vegetation => self.vegetation.query(envelope),
        }
    }

    async fn fetch_bores_in_envelope(
        &self,
        envelope: &Envelope,
    ) -> Result<RawFeatureSet, ServiceError> {
        self.bores.query(envelope)
    }
}

/// Statistics about a local feature service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalServiceStats {
    pub parcel_count: usize,
    pub landtype_count: usize,
    pub vegetation_count: usize,
    pub bore_count: usize,
}
