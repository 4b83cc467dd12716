//! Request orchestration.
//!
//! One [`ExportRequest`] runs fetch and normalization per parcel on a bounded
//! pool, waits for every parcel, then merges and builds vector documents while
//! rasters render, both on blocking threads. Everything is joined before packaging;
//! a cancelled request returns [`ExportError::Cancelled`] and nothing partial.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{ExportConfig, RasterOptions};
use crate::document::kml::{to_kml, to_kmz, IconRefs};
use crate::document::{DocumentBuilder, DocumentTree};
use crate::error::{ExportError, ParcelFailure, Result, Warning};
use crate::fetch::{Cancellation, Fetcher};
use crate::geometry::projection::{Reprojector, OUTPUT_EPSG, WORKING_EPSG};
use crate::geometry::Extent;
use crate::lotplan::LotPlan;
use crate::merge::{merge, name_conflicts, MergeResult, MergeScope};
use crate::model::{LayerSet, NormalizedParcel, ThemeLayer};
use crate::normalize::Normalizer;
use crate::package::{
    combined_label, file_stem, geotiff_filename, kml_filename, kmz_filename, Artifact,
    ExportFormat, Manifest, Package, Packager, ALL_PROPERTIES_FOLDER,
};
use crate::raster::render;
use crate::source::FeatureService;
use crate::style::{build_legend, LegendEntry, StyleResolver};

/// What to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    /// Lot/plan identifiers as typed by the user.
    pub lotplans: Vec<String>,
    pub formats: BTreeSet<ExportFormat>,
    pub include_veg: bool,
    pub include_bores: bool,
    /// Add cross-parcel merged folders to combined documents.
    pub include_merged: bool,
    /// `false` returns only the JSON summary, no files.
    pub download: bool,
    /// Archive prefix or combined document label.
    pub filename: Option<String>,
}

impl ExportRequest {
    pub fn new<I, S>(lotplans: I, format: ExportFormat) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lotplans: lotplans.into_iter().map(Into::into).collect(),
            formats: BTreeSet::from([format]),
            include_veg: false,
            include_bores: false,
            include_merged: true,
            download: true,
            filename: None,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: ExportFormat) -> Self {
        self.formats.insert(format);
        self
    }

    #[must_use]
    pub fn with_vegetation(mut self, include: bool) -> Self {
        self.include_veg = include;
        self
    }

    #[must_use]
    pub fn with_bores(mut self, include: bool) -> Self {
        self.include_bores = include;
        self
    }

    #[must_use]
    pub fn with_merged(mut self, include: bool) -> Self {
        self.include_merged = include;
        self
    }

    #[must_use]
    pub fn with_download(mut self, download: bool) -> Self {
        self.download = download;
        self
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    fn layers(&self) -> LayerSet {
        LayerSet {
            land_types: true,
            vegetation: self.include_veg,
            bores: self.include_bores,
        }
    }

    fn themes(&self) -> Vec<ThemeLayer> {
        self.layers().themes()
    }
}

/// Result of a successful request.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    /// `None` when the request asked for a summary only.
    pub package: Option<Package>,
    pub manifest: Manifest,
    /// Union of parcel extents in EPSG:4326.
    pub bounds: Option<Extent>,
}

impl ExportOutcome {
    /// Lot/plans, legend, bounds and manifest as JSON.
    #[must_use]
    pub fn summary_json(&self) -> Value {
        json!({
            "lotplans": self.manifest.succeeded,
            "legend": self.manifest.legend,
            "bounds4326": self.bounds.map(|b| json!({
                "west": b.minx,
                "south": b.miny,
                "east": b.maxx,
                "north": b.maxy,
            })),
            "manifest": self.manifest,
            "file": self.package.as_ref().map(|p| json!({
                "filename": p.filename(),
                "media_type": p.media_type(),
                "bytes": p.bytes().len(),
            })),
        })
    }
}

/// Runs export requests against a feature service.
pub struct Exporter {
    service: Arc<dyn FeatureService>,
    config: ExportConfig,
    resolver: Arc<StyleResolver>,
    clock: Option<DateTime<Utc>>,
}

impl Exporter {
    pub fn new(service: Arc<dyn FeatureService>, config: ExportConfig) -> Self {
        let resolver = Arc::new(StyleResolver::new(&config.styles));
        Self {
            service,
            config,
            resolver,
            clock: None,
        }
    }

    /// Fix the timestamp used for archive names and the manifest.
    #[must_use]
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.clock = Some(now);
        self
    }

    #[must_use]
    pub fn resolver(&self) -> &StyleResolver {
        &self.resolver
    }

    /// Run `request` to completion.
    ///
    /// # Errors
    /// Returns [`ExportError::NoDataAvailable`] when every requested parcel
    /// fails, [`ExportError::Cancelled`] when `cancel` fires, and
    /// [`ExportError::Config`] for a request with no formats. Per-parcel and
    /// per-feature problems are reported in the manifest instead.
    #[tracing::instrument(skip_all, fields(parcels = request.lotplans.len()))]
    pub async fn export(&self, request: &ExportRequest, cancel: &Cancellation) -> Result<ExportOutcome> {
        if request.formats.is_empty() && request.download {
            return Err(ExportError::Config("no export format requested".to_string()));
        }
        let now = self.clock.unwrap_or_else(Utc::now);

        let (lotplans, mut failures) = parse_request(&request.lotplans);
        let requested = lotplans.len() + failures.len();
        if lotplans.is_empty() {
            warn!(failures = failures.len(), "No usable lot/plan identifiers");
            return Err(ExportError::NoDataAvailable);
        }

        let fetcher = Fetcher::new(
            Arc::clone(&self.service),
            self.config.fetch.clone(),
            self.config.fields.clone(),
        );
        let report = fetcher
            .fetch_with(&lotplans, request.layers(), cancel, |fetched| {
                Normalizer::new().normalize_parcel(&fetched)
            })
            .await?;
        failures.extend(report.failures);
        let parcels = Arc::new(report.parcels);
        if parcels.is_empty() {
            warn!(failures = failures.len(), "Every requested parcel failed");
            return Err(ExportError::NoDataAvailable);
        }

        let mut warnings: Vec<Warning> = parcels.iter().flat_map(|p| p.warnings.iter().cloned()).collect();
        let themes = request.themes();

        let mut rasters: JoinSet<RasterJob> = JoinSet::new();
        if request.download && request.formats.contains(&ExportFormat::GeoTiff) {
            spawn_rasters(&mut rasters, &parcels, &themes, &self.resolver, &self.config.raster);
        }

        let mut artifacts = Vec::new();
        let wants_vector = request.formats.contains(&ExportFormat::Kml)
            || request.formats.contains(&ExportFormat::Kmz);
        if request.download && wants_vector {
            let mut vector = {
                let (request, parcels) = (request.clone(), Arc::clone(&parcels));
                let (themes, resolver) = (themes.clone(), Arc::clone(&self.resolver));
                tokio::task::spawn_blocking(move || vector_artifacts(&request, &parcels, &themes, &resolver))
            };
            tokio::select! {
                () = cancel.cancelled() => {
                    vector.abort();
                    rasters.abort_all();
                    info!("Export cancelled while building documents");
                    return Err(ExportError::Cancelled);
                }
                joined = &mut vector => {
                    let (docs, merge_warnings) = joined??;
                    artifacts.extend(docs);
                    warnings.extend(merge_warnings);
                }
            }
        }
        warnings.extend(name_conflicts(parcels.iter().flat_map(|p| p.features.iter())));

        let mut raster_artifacts = Vec::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    rasters.abort_all();
                    info!("Export cancelled while rendering rasters");
                    return Err(ExportError::Cancelled);
                }
                joined = rasters.join_next() => match joined {
                    None => break,
                    Some(Ok((index, Ok(artifact)))) => raster_artifacts.push((index, artifact)),
                    Some(Ok((_, Err(warning)))) => warnings.push(warning),
                    Some(Err(e)) => warn!(error = %e, "Raster worker ended abnormally"),
                },
            }
        }
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        raster_artifacts.sort_by_key(|(index, _)| *index);
        artifacts.extend(raster_artifacts.into_iter().map(|(_, a)| a));

        let legend: Vec<LegendEntry> =
            build_legend(parcels.iter().flat_map(|p| p.features.iter()), &self.resolver);
        let manifest = Manifest {
            generated_at: now.to_rfc3339(),
            requested: request.lotplans.clone(),
            succeeded: parcels.iter().map(|p| p.lotplan.to_string()).collect(),
            failures,
            warnings: dedup_warnings(warnings),
            legend,
            files: artifacts
                .iter()
                .map(Artifact::path)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        let bounds = bounds_4326(&parcels);

        let package = if request.download {
            let single = requested == 1 && request.formats.len() == 1;
            let packager = Packager::new(request.filename.as_deref(), now);
            Some(packager.package(artifacts, manifest.clone(), single)?)
        } else {
            None
        };

        info!(
            succeeded = manifest.succeeded.len(),
            failed = manifest.failures.len(),
            warnings = manifest.warnings.len(),
            file = package.as_ref().map(Package::filename),
            "Export complete"
        );
        Ok(ExportOutcome {
            package,
            manifest,
            bounds,
        })
    }
}

/// Per-parcel documents, plus a combined document when there are several
/// parcels. Runs on a blocking thread.
fn vector_artifacts(
    request: &ExportRequest,
    parcels: &[NormalizedParcel],
    themes: &[ThemeLayer],
    resolver: &StyleResolver,
) -> Result<(Vec<Artifact>, Vec<Warning>)> {
    let mut warnings = Vec::new();
    let mut artifacts = Vec::new();
    let multi = parcels.len() > 1;
    let all_features = || parcels.iter().flat_map(|p| p.features.iter());

    let mut per_parcel: Vec<(&NormalizedParcel, MergeResult)> = Vec::with_capacity(parcels.len());
    for parcel in parcels {
        let merged = merge(&parcel.features, &MergeScope::PerParcel(parcel.lotplan.clone()));
        warnings.extend(merged.warnings.iter().cloned());
        per_parcel.push((parcel, merged));
    }
    let bores = |p: &NormalizedParcel| request.include_bores.then(|| p.bores.clone());

    for &(parcel, ref merged) in &per_parcel {
        let mut builder = DocumentBuilder::new(format!("QLD Export – {}", parcel.lotplan), resolver)?;
        builder.add_parcel(&parcel.lotplan, merged, themes, bores(parcel).as_deref())?;
        let tree = builder.finish();
        let folder = multi.then(|| file_stem(&parcel.lotplan));
        artifacts.extend(encode(
            &tree,
            request,
            folder,
            kml_filename(&parcel.lotplan, request.include_veg),
            kmz_filename(&parcel.lotplan, if multi { None } else { request.filename.as_deref() }),
        )?);
    }

    if multi {
        let label = combined_label(parcels.len(), request.filename.as_deref());
        let mut builder = DocumentBuilder::new(label.clone(), resolver)?;
        for &(parcel, ref merged) in &per_parcel {
            builder.add_parcel(&parcel.lotplan, merged, themes, bores(parcel).as_deref())?;
        }
        if request.include_merged {
            let all = merge(all_features(), &MergeScope::AllParcels);
            debug!(
                classes = all.layers.len(),
                area_ha = all.total_area_ha(),
                "Cross-parcel merge complete"
            );
            warnings.extend(all.warnings.iter().cloned());
            for theme in themes {
                builder.add_merged(&all, *theme)?;
            }
        }
        let tree = builder.finish();
        artifacts.extend(encode(
            &tree,
            request,
            Some(ALL_PROPERTIES_FOLDER.to_string()),
            format!("{label}.kml"),
            format!("{label}.kmz"),
        )?);
    }
    Ok((artifacts, warnings))
}

fn encode(
    tree: &DocumentTree,
    request: &ExportRequest,
    folder: Option<String>,
    kml_name: String,
    kmz_name: String,
) -> Result<Vec<Artifact>> {
    let mut out = Vec::new();
    if request.formats.contains(&ExportFormat::Kml) {
        let text = to_kml(tree, IconRefs::Inline)?;
        out.push(Artifact::new(folder.clone(), kml_name, ExportFormat::Kml, text.into_bytes()));
    }
    if request.formats.contains(&ExportFormat::Kmz) {
        out.push(Artifact::new(folder, kmz_name, ExportFormat::Kmz, to_kmz(tree)?));
    }
    Ok(out)
}

/// Drop repeated warnings, keeping the first of each.
fn dedup_warnings(warnings: Vec<Warning>) -> Vec<Warning> {
    let mut out: Vec<Warning> = Vec::with_capacity(warnings.len());
    for warning in warnings {
        if !out.contains(&warning) {
            out.push(warning);
        }
    }
    out
}

/// Parse and de-duplicate identifiers; unparseable ones become `NotFound`.
fn parse_request(raw: &[String]) -> (Vec<LotPlan>, Vec<ParcelFailure>) {
    let mut seen = HashSet::new();
    let mut rejected = HashSet::new();
    let mut lotplans = Vec::new();
    let mut failures = Vec::new();
    for entry in raw {
        match LotPlan::parse(entry) {
            Ok(lotplan) => {
                if seen.insert(lotplan.clone()) {
                    lotplans.push(lotplan);
                }
            }
            Err(e) => {
                if rejected.insert(entry.trim()) {
                    failures.push(ParcelFailure::not_found(entry.trim(), e.to_string()));
                }
            }
        }
    }
    (lotplans, failures)
}

type RasterJob = (usize, std::result::Result<Artifact, Warning>);

fn spawn_rasters(
    set: &mut JoinSet<RasterJob>,
    parcels: &Arc<Vec<NormalizedParcel>>,
    themes: &[ThemeLayer],
    resolver: &Arc<StyleResolver>,
    options: &RasterOptions,
) {
    let multi = parcels.len() > 1;
    let mut index = 0;
    for parcel_index in 0..parcels.len() {
        for theme in themes {
            let parcels = Arc::clone(parcels);
            let resolver = Arc::clone(resolver);
            let options = options.clone();
            let (theme, job) = (*theme, index);
            index += 1;
            set.spawn_blocking(move || {
                let parcel = &parcels[parcel_index];
                let result = render(parcel.features_of(theme), parcel.extent, &options)
                    .and_then(|raster| raster.to_geotiff_bytes(&resolver).map_err(ExportError::from))
                    .map(|bytes| {
                        Artifact::new(
                            multi.then(|| file_stem(&parcel.lotplan)),
                            geotiff_filename(&parcel.lotplan, theme),
                            ExportFormat::GeoTiff,
                            bytes,
                        )
                    })
                    .map_err(|e| {
                        warn!(lotplan = %parcel.lotplan, theme = %theme, error = %e, "Raster skipped");
                        Warning::RasterSkipped {
                            lotplan: parcel.lotplan.to_string(),
                            reason: e.to_string(),
                        }
                    });
                (job, result)
            });
        }
    }
}

fn bounds_4326(parcels: &[NormalizedParcel]) -> Option<Extent> {
    let reprojector = Reprojector::new(WORKING_EPSG, OUTPUT_EPSG).ok()?;
    parcels
        .iter()
        .filter_map(|p| p.extent.reproject(&reprojector).ok())
        .reduce(|a, b| a.union(&b))
}
