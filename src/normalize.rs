//! Geometry normalizer.
//!
//! Brings fetched geometry into the working CRS, repairs it, clips class
//! polygons to their parcel and computes areas. The repaired form is
//! canonical, so normalizing a normalized feature returns it unchanged.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::bores::select_bores;
use crate::error::{ExportError, FailureKind, ParcelFailure, Result, Warning};
use crate::geometry::ops;
use crate::geometry::projection::{Reprojector, WORKING_EPSG};
use crate::geometry::{mercator_area_ha, Extent};
use crate::model::{ClassifiedFeature, NormalizedFeature, NormalizedParcel, ParcelFetch};

/// Reprojectors into the working CRS, keyed by source EPSG.
#[derive(Debug, Default)]
pub struct Normalizer {
    reprojectors: HashMap<i32, Reprojector>,
}

impl Normalizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn to_working(&mut self, epsg: i32) -> Result<&Reprojector> {
        if !self.reprojectors.contains_key(&epsg) {
            let reprojector = Reprojector::new(epsg, WORKING_EPSG)?;
            self.reprojectors.insert(epsg, reprojector);
        }
        self.reprojectors
            .get(&epsg)
            .ok_or_else(|| ExportError::Config(format!("no reprojector for EPSG:{epsg}")))
    }

    /// Reproject and repair one feature.
    ///
    /// # Errors
    /// Returns [`ExportError::InvalidGeometry`] when the geometry has
    /// non-finite coordinates, cannot be repaired, or has no area after
    /// repair, and a projection error when reprojection fails.
    pub fn normalize(&mut self, feature: &ClassifiedFeature) -> Result<NormalizedFeature> {
        let invalid = |reason: &str| ExportError::InvalidGeometry {
            code: feature.class.code.clone(),
            reason: reason.to_string(),
        };

        if !ops::is_finite(&feature.geometry) {
            return Err(invalid("non-finite coordinate"));
        }
        let projected = self.to_working(feature.epsg)?.multi_polygon(&feature.geometry)?;
        let repaired = ops::repair(&projected).ok_or_else(|| invalid("repair failed"))?;
        let area_ha = mercator_area_ha(&repaired);
        if repaired.0.is_empty() || area_ha <= 0.0 || !area_ha.is_finite() {
            return Err(invalid("no area after repair"));
        }

        Ok(NormalizedFeature {
            parcel: feature.parcel.clone(),
            theme: feature.theme,
            class: feature.class.clone(),
            geometry: repaired,
            ordinal: feature.ordinal,
            area_ha,
        })
    }

    /// Normalize everything fetched for a parcel.
    ///
    /// Class polygons are clipped to the parcel boundary; pieces outside it are
    /// dropped. Bores outside the boundary are dropped and the rest
    /// de-duplicated. Feature-level problems become warnings.
    ///
    /// # Errors
    /// Returns a failure when the boundary itself is unusable or when nothing
    /// survives normalization.
    pub fn normalize_parcel(
        &mut self,
        fetch: &ParcelFetch,
    ) -> std::result::Result<NormalizedParcel, ParcelFailure> {
        let lotplan = &fetch.parcel.lotplan;
        let boundary_failure = |detail: String| ParcelFailure {
            lotplan: lotplan.to_string(),
            kind: FailureKind::Empty,
            detail,
        };

        let boundary = self
            .to_working(fetch.parcel.epsg)
            .and_then(|r| Ok(r.multi_polygon(&fetch.parcel.boundary)?))
            .map_err(|e| boundary_failure(format!("parcel boundary: {e}")))?;
        let boundary = ops::repair(&boundary)
            .filter(|b| !b.0.is_empty())
            .ok_or_else(|| boundary_failure("parcel boundary has no area".to_string()))?;
        let extent = Extent::of(&boundary)
            .ok_or_else(|| boundary_failure("parcel boundary has no extent".to_string()))?;

        let mut warnings = Vec::new();
        let mut features = Vec::new();
        for feature in &fetch.features {
            let normalized = match self.normalize(feature) {
                Ok(n) => n,
                Err(e) => {
                    warn!(lotplan = %lotplan, code = %feature.class.code, error = %e, "Dropping feature");
                    warnings.push(Warning::from_feature_error(lotplan, &e));
                    continue;
                }
            };
            match clip(normalized, &boundary) {
                Ok(Some(clipped)) => features.push(clipped),
                Ok(None) => {
                    debug!(lotplan = %lotplan, code = %feature.class.code, "Feature outside parcel");
                }
                Err(e) => {
                    warn!(lotplan = %lotplan, code = %feature.class.code, error = %e, "Clip failed");
                    warnings.push(Warning::from_feature_error(lotplan, &e));
                }
            }
        }

        let mut bores = Vec::with_capacity(fetch.bores.len());
        for bore in &fetch.bores {
            match self.to_working(bore.epsg).and_then(|r| Ok(r.point(bore.location)?)) {
                Ok(location) => {
                    let mut bore = bore.clone();
                    bore.location = location;
                    bore.epsg = WORKING_EPSG;
                    bores.push(bore);
                }
                Err(e) => {
                    warn!(lotplan = %lotplan, bore = %bore.bore_number, error = %e, "Dropping bore");
                }
            }
        }
        let bores = select_bores(&bores, &boundary);

        let parcel = NormalizedParcel {
            lotplan: lotplan.clone(),
            boundary,
            extent,
            features,
            bores,
            warnings,
        };
        if parcel.is_empty() {
            return Err(ParcelFailure::empty(lotplan));
        }
        debug!(
            lotplan = %lotplan,
            features = parcel.features.len(),
            bores = parcel.bores.len(),
            "Parcel normalized"
        );
        Ok(parcel)
    }
}

/// Clip a normalized feature to `boundary`. `Ok(None)` when nothing is left.
fn clip(
    feature: NormalizedFeature,
    boundary: &geo::MultiPolygon<f64>,
) -> Result<Option<NormalizedFeature>> {
    let (Some(a), Some(b)) = (Extent::of(&feature.geometry), Extent::of(boundary)) else {
        return Ok(None);
    };
    if !a.intersects(&b) {
        return Ok(None);
    }
    let clipped = ops::intersection(&feature.geometry, boundary).ok_or_else(|| {
        ExportError::InvalidGeometry {
            code: feature.class.code.clone(),
            reason: "clip to parcel failed".to_string(),
        }
    })?;
    let area_ha = mercator_area_ha(&clipped);
    if clipped.0.is_empty() || area_ha <= 0.0 {
        return Ok(None);
    }
    Ok(Some(NormalizedFeature {
        geometry: clipped,
        area_ha,
        ..feature
    }))
}
