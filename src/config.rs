//! Export configuration.
//!
//! Loaded once at startup and passed to the pipeline; nothing in the crate
//! reads process-wide settings on its own.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ExportError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub fetch: FetchOptions,
    pub raster: RasterOptions,
    pub fields: FieldMapping,
    pub styles: StyleOverrides,
}

impl ExportConfig {
    /// Read configuration from a JSON file. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExportError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Parse configuration from JSON text.
    ///
    /// # Errors
    /// Returns an error if the text is not valid JSON for this structure.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ExportError::Config(e.to_string()))
    }

    #[must_use]
    pub fn with_fetch(mut self, fetch: FetchOptions) -> Self {
        self.fetch = fetch;
        self
    }

    #[must_use]
    pub fn with_raster(mut self, raster: RasterOptions) -> Self {
        self.raster = raster;
        self
    }

    #[must_use]
    pub fn with_fields(mut self, fields: FieldMapping) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn with_styles(mut self, styles: StyleOverrides) -> Self {
        self.styles = styles;
        self
    }
}

/// Feature service call policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Parcels fetched at the same time.
    pub concurrency: usize,
    /// Attempts per service call, including the first.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 4_000,
            call_timeout_ms: 20_000,
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self
    }

    #[must_use]
    pub fn with_call_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    /// Concurrency limit, never below one.
    #[must_use]
    pub fn permits(&self) -> usize {
        self.concurrency.max(1)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based): base doubled per
    /// attempt, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1_u64 << shift)
            .min(self.backoff_cap_ms);
        Duration::from_millis(millis)
    }
}

/// Raster sizing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RasterOptions {
    /// Longest raster side in pixels.
    pub max_px: u32,
    /// Explicit pixel size in working-CRS units; overrides `max_px`.
    pub pixel_size: Option<f64>,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            max_px: 4096,
            pixel_size: None,
        }
    }
}

impl RasterOptions {
    pub const MIN_PX: u32 = 256;
    pub const MAX_PX: u32 = 8192;

    #[must_use]
    pub fn with_max_px(mut self, max_px: u32) -> Self {
        self.max_px = max_px;
        self
    }

    #[must_use]
    pub fn with_pixel_size(mut self, pixel_size: f64) -> Self {
        self.pixel_size = Some(pixel_size);
        self
    }

    #[must_use]
    pub fn clamped_max_px(&self) -> u32 {
        self.max_px.clamp(Self::MIN_PX, Self::MAX_PX)
    }
}

/// Attribute names read from raw features.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub landtype_code: String,
    pub landtype_name: String,
    /// Vegetation code attribute; when unset the name doubles as the code.
    pub veg_code: Option<String>,
    pub veg_name: String,
    pub bore_number: String,
    pub bore_status_code: String,
    pub bore_status_label: String,
    pub bore_type_code: String,
    pub bore_type_label: String,
    pub bore_drill_date: String,
    pub bore_report_url: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            landtype_code: "lt_code_1".to_string(),
            landtype_name: "lt_name_1".to_string(),
            veg_code: None,
            veg_name: "rvm_cat".to_string(),
            bore_number: "rn_char".to_string(),
            bore_status_code: "facility_status".to_string(),
            bore_status_label: "facility_status_decode".to_string(),
            bore_type_code: "facility_type".to_string(),
            bore_type_label: "facility_type_decode".to_string(),
            bore_drill_date: "drilled_date".to_string(),
            bore_report_url: "bore_report_url".to_string(),
        }
    }
}

impl FieldMapping {
    #[must_use]
    pub fn with_landtype_fields(mut self, code: &str, name: &str) -> Self {
        self.landtype_code = code.to_string();
        self.landtype_name = name.to_string();
        self
    }

    #[must_use]
    pub fn with_veg_fields(mut self, code: Option<&str>, name: &str) -> Self {
        self.veg_code = code.map(str::to_string);
        self.veg_name = name.to_string();
        self
    }
}

/// Fixed colours for specific classification codes, as `#rrggbb`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StyleOverrides {
    pub colors: BTreeMap<String, String>,
}

impl StyleOverrides {
    #[must_use]
    pub fn with_color(mut self, code: &str, hex: &str) -> Self {
        self.colors.insert(code.to_string(), hex.to_string());
        self
    }
}
