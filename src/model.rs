//! Pipeline entities.
//!
//! Each stage takes its inputs by reference and produces new values; nothing
//! is mutated after it has been handed downstream.

use std::fmt;

use geo::{MultiPolygon, Point};
use serde::Serialize;

use crate::geometry::Extent;
use crate::lotplan::LotPlan;

/// Polygon classification scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeLayer {
    LandTypes,
    Vegetation,
}

impl ThemeLayer {
    pub const ALL: [Self; 2] = [Self::LandTypes, Self::Vegetation];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LandTypes => "land_types",
            Self::Vegetation => "vegetation",
        }
    }

    /// Folder title inside a parcel folder.
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::LandTypes => "Land Types",
            Self::Vegetation => "Vegetation",
        }
    }

    /// Folder title for the cross-parcel merged layer.
    #[must_use]
    pub fn merged_title(self) -> &'static str {
        match self {
            Self::LandTypes => "Merged Land Types (All Properties)",
            Self::Vegetation => "Merged Vegetation (All Properties)",
        }
    }

    /// Short prefix used in style ids and file names.
    #[must_use]
    pub fn short(self) -> &'static str {
        match self {
            Self::LandTypes => "lt",
            Self::Vegetation => "veg",
        }
    }
}

impl fmt::Display for ThemeLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layers a fetch should retrieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSet {
    pub land_types: bool,
    pub vegetation: bool,
    pub bores: bool,
}

impl Default for LayerSet {
    fn default() -> Self {
        Self {
            land_types: true,
            vegetation: false,
            bores: false,
        }
    }
}

impl LayerSet {
    #[must_use]
    pub fn all() -> Self {
        Self {
            land_types: true,
            vegetation: true,
            bores: true,
        }
    }

    #[must_use]
    pub fn themes(&self) -> Vec<ThemeLayer> {
        ThemeLayer::ALL
            .into_iter()
            .filter(|t| match t {
                ThemeLayer::LandTypes => self.land_types,
                ThemeLayer::Vegetation => self.vegetation,
            })
            .collect()
    }
}

/// Grouping key for merge and style resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ClassKey {
    pub theme: ThemeLayer,
    pub code: String,
}

impl ClassKey {
    pub fn new(theme: ThemeLayer, code: impl Into<String>) -> Self {
        Self {
            theme,
            code: code.into(),
        }
    }
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.theme.short(), self.code)
    }
}

/// Code plus human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub code: String,
    pub name: String,
}

impl Classification {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// Cadastral parcel as returned by the feature service.
#[derive(Debug, Clone)]
pub struct Parcel {
    pub lotplan: LotPlan,
    pub boundary: MultiPolygon<f64>,
    pub epsg: i32,
}

impl Parcel {
    /// Search envelope in the parcel's own CRS.
    #[must_use]
    pub fn envelope(&self) -> Option<Envelope> {
        Extent::of(&self.boundary).map(|extent| Envelope {
            extent,
            epsg: self.epsg,
        })
    }
}

/// Spatial filter passed to the feature service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub extent: Extent,
    pub epsg: i32,
}

/// A classified polygon in its source CRS, as fetched.
#[derive(Debug, Clone)]
pub struct ClassifiedFeature {
    pub parcel: LotPlan,
    pub theme: ThemeLayer,
    pub class: Classification,
    pub geometry: MultiPolygon<f64>,
    pub epsg: i32,
    /// Position in fetch order; rasterization draws in this order.
    pub ordinal: usize,
}

impl ClassifiedFeature {
    #[must_use]
    pub fn key(&self) -> ClassKey {
        ClassKey::new(self.theme, self.class.code.clone())
    }
}

/// A classified polygon after reprojection, repair and clipping.
///
/// The geometry is in the working CRS, free of self-intersections and has
/// positive area.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFeature {
    pub parcel: LotPlan,
    pub theme: ThemeLayer,
    pub class: Classification,
    pub geometry: MultiPolygon<f64>,
    pub ordinal: usize,
    pub area_ha: f64,
}

impl NormalizedFeature {
    #[must_use]
    pub fn key(&self) -> ClassKey {
        ClassKey::new(self.theme, self.class.code.clone())
    }

    /// View this feature as fetched input in the working CRS, so it can be
    /// run through normalization again.
    #[must_use]
    pub fn to_classified(&self) -> ClassifiedFeature {
        ClassifiedFeature {
            parcel: self.parcel.clone(),
            theme: self.theme,
            class: self.class.clone(),
            geometry: self.geometry.clone(),
            epsg: crate::geometry::projection::WORKING_EPSG,
            ordinal: self.ordinal,
        }
    }
}

/// Groundwater bore after attribute normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BorePoint {
    pub bore_number: String,
    pub status: Option<String>,
    pub status_label: Option<String>,
    pub bore_type: Option<String>,
    pub type_label: Option<String>,
    pub drilled_date: Option<String>,
    pub report_url: Option<String>,
    pub icon_key: Option<String>,
    #[serde(skip)]
    pub location: Point<f64>,
    #[serde(skip)]
    pub epsg: i32,
}

/// Everything fetched for one parcel.
#[derive(Debug, Clone)]
pub struct ParcelFetch {
    pub parcel: Parcel,
    pub features: Vec<ClassifiedFeature>,
    pub bores: Vec<BorePoint>,
}

/// Everything normalized for one parcel.
#[derive(Debug, Clone)]
pub struct NormalizedParcel {
    pub lotplan: LotPlan,
    /// Parcel boundary in the working CRS.
    pub boundary: MultiPolygon<f64>,
    /// Bounding box of the boundary in the working CRS; raster and vector
    /// outputs for the parcel share it.
    pub extent: Extent,
    pub features: Vec<NormalizedFeature>,
    /// Bores inside the parcel, in the working CRS.
    pub bores: Vec<BorePoint>,
    pub warnings: Vec<crate::error::Warning>,
}

impl NormalizedParcel {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.bores.is_empty()
    }

    pub fn features_of(&self, theme: ThemeLayer) -> impl Iterator<Item = &NormalizedFeature> {
        self.features.iter().filter(move |f| f.theme == theme)
    }
}
