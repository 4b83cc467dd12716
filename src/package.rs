//! Bundle packager.
//!
//! A request for one parcel in one format yields that file as-is. Anything
//! more is wrapped in a ZIP with one folder per parcel, an `All Properties`
//! folder for combined documents and a `manifest.json` recording which
//! parcels succeeded and which failed.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{Cursor, Write};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{ParcelFailure, Result, Warning};
use crate::lotplan::LotPlan;
use crate::style::LegendEntry;

/// Archive folder for documents spanning every parcel.
pub const ALL_PROPERTIES_FOLDER: &str = "All Properties";

/// Archive name used when no prefix is given.
pub const DEFAULT_ARCHIVE_NAME: &str = "Property Reports";

pub const MANIFEST_NAME: &str = "manifest.json";

/// Output file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Kml,
    Kmz,
    GeoTiff,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Kml => "kml",
            Self::Kmz => "kmz",
            Self::GeoTiff => "tif",
        }
    }

    #[must_use]
    pub fn media_type(self) -> &'static str {
        match self {
            Self::Kml => "application/vnd.google-earth.kml+xml",
            Self::Kmz => "application/vnd.google-earth.kmz",
            Self::GeoTiff => "image/tiff",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kml => "kml",
            Self::Kmz => "kmz",
            Self::GeoTiff => "geotiff",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kml" => Ok(Self::Kml),
            "kmz" => Ok(Self::Kmz),
            "tif" | "tiff" | "geotiff" => Ok(Self::GeoTiff),
            other => Err(format!("unknown export format '{other}' (expected kml, kmz or geotiff)")),
        }
    }
}

/// One produced file.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Archive folder; `None` for the archive root.
    pub folder: Option<String>,
    pub filename: String,
    pub media_type: &'static str,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(folder: Option<String>, filename: String, format: ExportFormat, bytes: Vec<u8>) -> Self {
        Self {
            folder,
            filename,
            media_type: format.media_type(),
            bytes,
        }
    }

    /// Path inside the archive.
    #[must_use]
    pub fn path(&self) -> String {
        match &self.folder {
            Some(folder) => format!("{folder}/{}", self.filename),
            None => self.filename.clone(),
        }
    }
}

/// Request record shipped as `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Manifest {
    pub generated_at: String,
    pub requested: Vec<String>,
    pub succeeded: Vec<String>,
    pub failures: Vec<ParcelFailure>,
    pub warnings: Vec<Warning>,
    pub legend: Vec<LegendEntry>,
    pub files: Vec<String>,
}

/// Packaged response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Package {
    File(Artifact),
    Archive { filename: String, bytes: Vec<u8> },
}

impl Package {
    #[must_use]
    pub fn filename(&self) -> &str {
        match self {
            Self::File(artifact) => &artifact.filename,
            Self::Archive { filename, .. } => filename,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::File(artifact) => &artifact.bytes,
            Self::Archive { bytes, .. } => bytes,
        }
    }

    #[must_use]
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::File(artifact) => artifact.media_type,
            Self::Archive { .. } => "application/zip",
        }
    }

    #[must_use]
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }
}

/// Keep alphanumerics, `_`, `-`, `.` and spaces. `None` if nothing is left.
#[must_use]
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let kept: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '))
        .collect();
    let kept = kept.trim();
    (!kept.is_empty()).then(|| kept.to_string())
}

fn strip_extension<'a>(name: &'a str, ext: &str) -> &'a str {
    let suffix = format!(".{ext}");
    if name.to_ascii_lowercase().ends_with(&suffix) {
        &name[..name.len() - suffix.len()]
    } else {
        name
    }
}

/// Lot/plan as a path segment: `3/DP45678` → `3_DP45678`.
#[must_use]
pub fn file_stem(lotplan: &LotPlan) -> String {
    lotplan.to_string().replace('/', "_")
}

/// `{lotplan}_landtypes[_veg].kml`
#[must_use]
pub fn kml_filename(lotplan: &LotPlan, with_vegetation: bool) -> String {
    let veg = if with_vegetation { "_veg" } else { "" };
    format!("{}_landtypes{veg}.kml", file_stem(lotplan))
}

/// `Property Report – {lotplan}.kmz`, prefixed as `{prefix} – …` when given.
#[must_use]
pub fn kmz_filename(lotplan: &LotPlan, prefix: Option<&str>) -> String {
    let base = format!("Property Report – {}.kmz", file_stem(lotplan));
    match prefix.and_then(sanitize_filename) {
        Some(clean) => format!("{} – {base}", strip_extension(&clean, "kmz")),
        None => base,
    }
}

/// `{lotplan}_{theme}.tif`
#[must_use]
pub fn geotiff_filename(lotplan: &LotPlan, theme: crate::model::ThemeLayer) -> String {
    let name = match theme {
        crate::model::ThemeLayer::LandTypes => "landtypes",
        crate::model::ThemeLayer::Vegetation => "vegetation",
    };
    format!("{}_{name}.tif", file_stem(lotplan))
}

/// Title of a document covering `count` parcels: `Property Report – {n} lots`,
/// or built from a caller-supplied label.
#[must_use]
pub fn combined_label(count: usize, label: Option<&str>) -> String {
    let Some(clean) = label.and_then(sanitize_filename) else {
        return format!("Property Report – {count} lots");
    };
    let clean = strip_extension(strip_extension(&clean, "kmz"), "kml").to_string();
    if clean.contains("Property Report") {
        clean
    } else {
        format!("Property Report – {clean}")
    }
}

/// Builds [`Package`]s. The timestamp is injected so archive names are
/// reproducible in tests.
#[derive(Debug, Clone)]
pub struct Packager {
    prefix: Option<String>,
    now: DateTime<Utc>,
}

impl Packager {
    #[must_use]
    pub fn new(prefix: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.and_then(sanitize_filename),
            now,
        }
    }

    /// `{prefix}_{YYYYMMDDTHHMMSSZ}.zip`
    #[must_use]
    pub fn archive_name(&self) -> String {
        let base = self.prefix.as_deref().unwrap_or(DEFAULT_ARCHIVE_NAME);
        format!("{base}_{}.zip", self.now.format("%Y%m%dT%H%M%SZ"))
    }

    /// Package `artifacts`. With `single` set and exactly one artifact the
    /// file is returned unwrapped; otherwise everything goes into a ZIP with
    /// the manifest.
    ///
    /// # Errors
    /// Fails if the archive or manifest cannot be written.
    pub fn package(&self, mut artifacts: Vec<Artifact>, mut manifest: Manifest, single: bool) -> Result<Package> {
        if manifest.generated_at.is_empty() {
            manifest.generated_at = self.now.to_rfc3339();
        }
        if single && artifacts.len() == 1 {
            if let Some(artifact) = artifacts.pop() {
                debug!(file = %artifact.filename, "Single file export");
                return Ok(Package::File(artifact));
            }
        }

        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let mut written = BTreeSet::new();
        for artifact in &artifacts {
            let path = artifact.path();
            if !written.insert(path.clone()) {
                warn!(path = %path, "Duplicate archive entry skipped");
                continue;
            }
            zip.start_file(path.as_str(), options)?;
            zip.write_all(&artifact.bytes)?;
        }
        manifest.files = written.into_iter().collect();
        zip.start_file(MANIFEST_NAME, options)?;
        zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;
        let bytes = zip.finish()?.into_inner();

        let filename = self.archive_name();
        debug!(archive = %filename, files = manifest.files.len(), bytes = bytes.len(), "Archive written");
        Ok(Package::Archive { filename, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThemeLayer;
    use chrono::TimeZone;
    use std::io::Read;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
    }

    fn lp(s: &str) -> LotPlan {
        LotPlan::parse(s).unwrap()
    }

    fn artifact(folder: Option<&str>, name: &str) -> Artifact {
        Artifact::new(folder.map(str::to_string), name.to_string(), ExportFormat::Kml, b"<kml/>".to_vec())
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("  My/Report:*2024 ").as_deref(), Some("MyReport2024"));
        assert_eq!(sanitize_filename("a_b-c.d e").as_deref(), Some("a_b-c.d e"));
        assert_eq!(sanitize_filename("///"), None);
    }

    #[test]
    fn test_filenames() {
        assert_eq!(kml_filename(&lp("13SP181800"), false), "13SP181800_landtypes.kml");
        assert_eq!(kml_filename(&lp("13SP181800"), true), "13SP181800_landtypes_veg.kml");
        assert_eq!(kmz_filename(&lp("13SP181800"), None), "Property Report – 13SP181800.kmz");
        assert_eq!(
            kmz_filename(&lp("13SP181800"), Some("Smith.kmz")),
            "Smith – Property Report – 13SP181800.kmz"
        );
        assert_eq!(geotiff_filename(&lp("3/DP45678"), ThemeLayer::Vegetation), "3_DP45678_vegetation.tif");
        assert_eq!(combined_label(3, None), "Property Report – 3 lots");
        assert_eq!(combined_label(3, Some("Smith Farms.kmz")), "Property Report – Smith Farms");
        assert_eq!(combined_label(3, Some("Property Report East")), "Property Report East");
    }

    #[test]
    fn test_archive_name_uses_prefix_and_stamp() {
        assert_eq!(Packager::new(None, now()).archive_name(), "Property Reports_20240305T070809Z.zip");
        assert_eq!(Packager::new(Some(" Smith?! "), now()).archive_name(), "Smith_20240305T070809Z.zip");
    }

    #[test]
    fn test_single_file_shortcut() {
        let packager = Packager::new(None, now());
        let package = packager
            .package(vec![artifact(None, "1RP1_landtypes.kml")], Manifest::default(), true)
            .unwrap();
        assert!(!package.is_archive());
        assert_eq!(package.filename(), "1RP1_landtypes.kml");
        assert_eq!(package.bytes(), b"<kml/>");
        assert_eq!(package.media_type(), "application/vnd.google-earth.kml+xml");

        let wrapped = packager
            .package(vec![artifact(None, "1RP1_landtypes.kml")], Manifest::default(), false)
            .unwrap();
        assert!(wrapped.is_archive());
    }

    #[test]
    fn test_archive_layout_and_manifest() {
        let manifest = Manifest {
            requested: vec!["1RP1".into(), "2RP1".into(), "9XX9".into()],
            succeeded: vec!["1RP1".into(), "2RP1".into()],
            failures: vec![ParcelFailure::not_found("9XX9", "no parcel")],
            ..Manifest::default()
        };
        let package = Packager::new(None, now())
            .package(
                vec![
                    artifact(Some("1RP1"), "1RP1_landtypes.kml"),
                    artifact(Some("2RP1"), "2RP1_landtypes.kml"),
                    artifact(Some(ALL_PROPERTIES_FOLDER), "Property Report – 2 lots.kml"),
                    artifact(Some("2RP1"), "2RP1_landtypes.kml"),
                ],
                manifest,
                true,
            )
            .unwrap();
        assert!(package.is_archive());
        assert_eq!(package.media_type(), "application/zip");

        let mut archive = zip::ZipArchive::new(Cursor::new(package.bytes().to_vec())).unwrap();
        assert_eq!(archive.len(), 4);
        let mut text = String::new();
        archive.by_name(MANIFEST_NAME).unwrap().read_to_string(&mut text).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["generated_at"], "2024-03-05T07:08:09+00:00");
        assert_eq!(json["failures"][0]["lotplan"], "9XX9");
        assert_eq!(json["failures"][0]["kind"], "not_found");
        assert_eq!(json["files"].as_array().unwrap().len(), 3);
        assert!(archive.by_name("All Properties/Property Report – 2 lots.kml").is_ok());
    }
}
