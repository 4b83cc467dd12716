#![doc = include_str!("../README.md")]
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`lotplan`]: Lot/plan identifier parsing and normalization
//! - [`source`]: [`FeatureService`] trait, GeoJSON decoding, local and in-memory services
//! - [`fetch`]: Bounded, retrying, cancellable per-parcel fetching via [`Fetcher`]
//! - [`normalize`]: Reprojection, repair and clipping into the working CRS
//! - [`merge`]: Per-class unions within a parcel or across parcels
//! - [`style`]: Deterministic class colours and the legend
//! - [`bores`]: Groundwater bore attributes and PNG icons
//! - [`document`]: Folder/placemark trees and the KML/KMZ serializer
//! - [`raster`]: Class rasterization, point sampling and GeoTIFF writing
//! - [`package`]: File naming, manifest and ZIP packaging
//! - [`pipeline`]: [`Exporter`] running an [`ExportRequest`] end to end

// ============================================================================
// Public modules
// ============================================================================

pub mod bores;
pub mod casting;
pub mod config;
pub mod document;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod logging;
pub mod lotplan;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod package;
pub mod pipeline;
pub mod raster;
pub mod source;
pub mod style;

// ============================================================================
// Errors & Configuration
// ============================================================================

pub use error::{
    ExportError,
    FailureKind,
    ParcelFailure,
    Result,
    Warning,
};

pub use config::{
    ExportConfig,
    FetchOptions,
    FieldMapping,
    RasterOptions,
    StyleOverrides,
};

pub use logging::{init_logging, LogFormat};

// ============================================================================
// Domain Model
// ============================================================================

pub use lotplan::{LotPlan, LotPlanError};

pub use model::{
    BorePoint,
    ClassKey,
    Classification,
    ClassifiedFeature,
    LayerSet,
    NormalizedFeature,
    NormalizedParcel,
    Parcel,
    ThemeLayer,
};

// ============================================================================
// Feature Services & Fetching
// ============================================================================
// Primary API: Fetcher::new(service, options, fields).fetch(...).await

pub use source::{
    FeatureService,
    InMemoryFeatureService,
    LocalFeatureService,
    LocalScanOptions,
    ServiceError,
};

pub use fetch::{cancellation, CancelHandle, Cancellation, FetchReport, Fetcher};

// ============================================================================
// Geometry & Projections
// ============================================================================

pub use geometry::Extent;
pub use geometry::projection::{
    project_point,
    get_proj_string,
    is_geographic_crs,
    Reprojector,
    OUTPUT_EPSG,
    WORKING_EPSG,
};

// ============================================================================
// Normalization & Merging
// ============================================================================

pub use normalize::Normalizer;
pub use merge::{merge, name_conflicts, MergeResult, MergeScope, MergedClassLayer};

// ============================================================================
// Styling
// ============================================================================

pub use style::{build_legend, LegendEntry, Style, StyleResolver};

// ============================================================================
// Vector Documents
// ============================================================================

pub use document::{DocumentBuilder, DocumentTree, Folder, Placemark};
pub use document::kml::{to_kml, to_kmz, IconRefs};

// ============================================================================
// Rasters
// ============================================================================

pub use raster::{render, ClassRaster, GridSpec};
pub use raster::query::{ClassQuery, ClassQueryResult};
pub use raster::geotiff::{
    GeoTiffCompression,
    GeoTiffWriteError,
    GeoTiffWriter,
};

// ============================================================================
// Packaging & Orchestration
// ============================================================================
// Primary API: Exporter::new(service, config).export(&request, &cancel).await

pub use package::{Artifact, ExportFormat, Manifest, Package, Packager};
pub use pipeline::{ExportOutcome, ExportRequest, Exporter};
