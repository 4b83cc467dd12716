//! Error taxonomy for the export pipeline.
//!
//! Per-parcel and per-feature problems are captured as data ([`ParcelFailure`],
//! [`Warning`]) and attached to the bundle manifest. Only
//! [`ExportError::NoDataAvailable`] and [`ExportError::Cancelled`] abort a
//! whole request.

use serde::Serialize;

use crate::geometry::projection::ProjectionError;
use crate::lotplan::LotPlan;
use crate::raster::geotiff::GeoTiffWriteError;
use crate::source::ServiceError;

/// Crate-wide result alias.
pub type Result<T, E = ExportError> = std::result::Result<T, E>;

/// Errors raised by pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Parcel identifier could not be resolved by the feature service.
    #[error("lot/plan {0} not found")]
    NotFound(String),

    /// Feature service calls for a parcel exhausted their retries.
    #[error("fetch failed for {lotplan} after {attempts} attempts: {source}")]
    FetchFailed {
        lotplan: String,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    /// Polygon could not be repaired into a geometry with positive area.
    #[error("invalid geometry for {code}: {reason}")]
    InvalidGeometry { code: String, reason: String },

    /// Same classification code seen with two different names.
    #[error("class {code} named both {kept:?} and {discarded:?}")]
    MergeConflict {
        code: String,
        kept: String,
        discarded: String,
    },

    /// Raster requested for a region with zero area.
    #[error("raster extent has zero area")]
    EmptyExtent,

    /// Nothing exportable came out of the request.
    #[error("no data available for the requested lot/plans")]
    NoDataAvailable,

    /// The triggering request was aborted.
    #[error("export cancelled")]
    Cancelled,

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    GeoTiff(#[from] GeoTiffWriteError),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("icon encoding error: {0}")]
    Icon(#[from] png::EncodingError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("document formatting error: {0}")]
    Format(#[from] std::fmt::Error),

    /// A blocking worker panicked or was aborted.
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Why a requested parcel produced no export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    FetchFailed,
    /// Parcel resolved but no polygon or bore survived normalization.
    Empty,
}

/// Manifest record for a parcel that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParcelFailure {
    pub lotplan: String,
    pub kind: FailureKind,
    pub detail: String,
}

impl ParcelFailure {
    pub fn not_found(lotplan: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            lotplan: lotplan.into(),
            kind: FailureKind::NotFound,
            detail: detail.into(),
        }
    }

    pub fn fetch_failed(lotplan: &LotPlan, err: &ExportError) -> Self {
        Self {
            lotplan: lotplan.to_string(),
            kind: FailureKind::FetchFailed,
            detail: err.to_string(),
        }
    }

    pub fn empty(lotplan: &LotPlan) -> Self {
        Self {
            lotplan: lotplan.to_string(),
            kind: FailureKind::Empty,
            detail: "no land type, vegetation or bore features intersect this parcel".to_string(),
        }
    }
}

/// Non-fatal problem surfaced alongside a successful export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    InvalidGeometry {
        lotplan: String,
        code: String,
        reason: String,
    },
    MergeConflict {
        code: String,
        kept: String,
        discarded: String,
    },
    UnionSkipped {
        code: String,
        lotplan: String,
        reason: String,
    },
    RasterSkipped {
        lotplan: String,
        reason: String,
    },
}

impl Warning {
    /// Convert a per-feature error into a manifest warning.
    pub fn from_feature_error(lotplan: &LotPlan, err: &ExportError) -> Self {
        match err {
            ExportError::InvalidGeometry { code, reason } => Self::InvalidGeometry {
                lotplan: lotplan.to_string(),
                code: code.clone(),
                reason: reason.clone(),
            },
            other => Self::InvalidGeometry {
                lotplan: lotplan.to_string(),
                code: String::new(),
                reason: other.to_string(),
            },
        }
    }
}
