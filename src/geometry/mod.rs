//! Extents, projection and small polygon helpers shared by the pipeline.

pub mod ops;
pub mod projection;

use geo::{Area, BoundingRect, Centroid, MultiPolygon};
use serde::Serialize;

use projection::{mercator_area_scale, Reprojector};

/// Axis-aligned box in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Extent {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl Extent {
    #[must_use]
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self {
            minx,
            miny,
            maxx,
            maxy,
        }
    }

    /// Bounding box of a multi-polygon, `None` when it has no coordinates.
    #[must_use]
    pub fn of(geometry: &MultiPolygon<f64>) -> Option<Self> {
        geometry
            .bounding_rect()
            .map(|r| Self::new(r.min().x, r.min().y, r.max().x, r.max().y))
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }

    /// True when the box encloses a positive, finite area.
    #[must_use]
    pub fn has_area(&self) -> bool {
        let (w, h) = (self.width(), self.height());
        w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::new(
            self.minx.min(other.minx),
            self.miny.min(other.miny),
            self.maxx.max(other.maxx),
            self.maxy.max(other.maxy),
        )
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        !(self.maxx < other.minx
            || self.minx > other.maxx
            || self.maxy < other.miny
            || self.miny > other.maxy)
    }

    #[must_use]
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.minx && x <= self.maxx && y >= self.miny && y <= self.maxy
    }

    /// Reproject the four corners and take their bounding box.
    ///
    /// # Errors
    /// Returns an error if any corner fails to transform.
    pub fn reproject(&self, reprojector: &Reprojector) -> Result<Self, projection::ProjectionError> {
        let corners = [
            (self.minx, self.miny),
            (self.minx, self.maxy),
            (self.maxx, self.miny),
            (self.maxx, self.maxy),
        ];
        let mut out: Option<Self> = None;
        for (x, y) in corners {
            let (px, py) = reprojector.transform(x, y)?;
            let corner = Self::new(px, py, px, py);
            out = Some(match out {
                Some(acc) => acc.union(&corner),
                None => corner,
            });
        }
        Ok(out.unwrap_or(*self))
    }

    /// Compare two extents within an absolute tolerance.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        (self.minx - other.minx).abs() <= tolerance
            && (self.miny - other.miny).abs() <= tolerance
            && (self.maxx - other.maxx).abs() <= tolerance
            && (self.maxy - other.maxy).abs() <= tolerance
    }
}

/// Ground area in hectares of a geometry held in Web Mercator.
///
/// Uses the scale factor at the geometry's centroid, which is accurate for
/// parcel-sized shapes.
#[must_use]
pub fn mercator_area_ha(geometry: &MultiPolygon<f64>) -> f64 {
    let planar = geometry.unsigned_area();
    if planar <= 0.0 {
        return 0.0;
    }
    let scale = geometry
        .centroid()
        .map_or(1.0, |c| mercator_area_scale(c.y()));
    planar * scale / 10_000.0
}
