//! Export land types, vegetation and bores for lot/plans from a local
//! directory of GeoJSON layers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use landtypes::{
    cancellation, init_logging, ExportConfig, ExportFormat, ExportRequest, Exporter,
    LocalFeatureService, LocalScanOptions, LogFormat,
};

/// `landtype-export` - package land type and vegetation layers for parcels.
///
/// Reads `parcels/`, `landtypes/`, `vegetation/` and `bores/` GeoJSON layers
/// under the data directory and writes a single KML, KMZ or GeoTIFF, or a ZIP
/// bundle when the request yields several files.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the layer subdirectories.
    #[arg(long, env = "LANDTYPES_DATA_DIR")]
    data_dir: PathBuf,

    /// Lot/plan identifiers, separated by commas, semicolons or whitespace lines.
    #[arg(required = true)]
    lotplans: Vec<String>,

    /// Output formats (`kml`, `kmz`, `tiff`). Repeat or comma-separate.
    #[arg(long = "format", short, value_delimiter = ',', default_value = "kmz")]
    formats: Vec<ExportFormat>,

    /// Include the vegetation theme.
    #[arg(long)]
    veg: bool,

    /// Include groundwater bores.
    #[arg(long)]
    bores: bool,

    /// Leave the cross-parcel merged folders out of combined documents.
    #[arg(long)]
    no_merged: bool,

    /// Archive prefix or combined document label.
    #[arg(long)]
    name: Option<String>,

    /// Directory the package is written to. Without it only the JSON summary
    /// is printed.
    #[arg(long, short, env = "LANDTYPES_OUT_DIR")]
    out: Option<PathBuf>,

    /// JSON configuration file; missing keys take their defaults.
    #[arg(long, env = "LANDTYPES_CONFIG")]
    config: Option<PathBuf>,

    /// Parcel attribute holding the lot/plan identifier.
    #[arg(long, default_value = "lotplan")]
    lotplan_field: String,

    /// Log format (`pretty` or `json`).
    #[arg(long, env = "LANDTYPES_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_logging(args.log_format);

    let config = match &args.config {
        Some(path) => ExportConfig::from_json_file(path)?,
        None => ExportConfig::default(),
    };
    let scan = LocalScanOptions::default().with_lotplan_field(&args.lotplan_field);
    let service = LocalFeatureService::scan(&args.data_dir, &scan)?;
    info!(dir = %args.data_dir.display(), stats = ?service.stats(), "Feature layers loaded");

    let lotplans: Vec<String> = args
        .lotplans
        .iter()
        .flat_map(|arg| arg.split(|c| matches!(c, ',' | ';' | '\n')))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let mut request = ExportRequest::new(lotplans, ExportFormat::Kmz)
        .with_vegetation(args.veg)
        .with_bores(args.bores)
        .with_merged(!args.no_merged)
        .with_download(args.out.is_some());
    request.formats = args.formats.iter().copied().collect();
    if let Some(name) = &args.name {
        request = request.with_filename(name.clone());
    }

    let (handle, cancel) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling export");
            handle.cancel();
        }
    });

    let exporter = Exporter::new(Arc::new(service), config);
    let outcome = exporter.export(&request, &cancel).await?;

    if let (Some(dir), Some(package)) = (&args.out, &outcome.package) {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(package.filename());
        std::fs::write(&path, package.bytes())?;
        info!(path = %path.display(), bytes = package.bytes().len(), "Package written");
    }
    println!("{}", serde_json::to_string_pretty(&outcome.summary_json())?);
    Ok(())
}
