//! Feature fetcher.
//!
//! Resolves each requested parcel and queries its land-type, vegetation and
//! bore features. Parcels run concurrently on a [`JoinSet`] bounded by a
//! [`Semaphore`]; each service call gets a timeout and bounded retries with
//! exponential backoff. A parcel that cannot be resolved or whose retries run
//! out becomes a [`ParcelFailure`] and the rest of the batch carries on.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bores::bore_from_raw;
use crate::config::{FetchOptions, FieldMapping};
use crate::error::{ExportError, FailureKind, ParcelFailure, Result};
use crate::lotplan::LotPlan;
use crate::model::{
    ClassifiedFeature, Classification, LayerSet, ParcelFetch, ThemeLayer,
};
use crate::source::geojson::as_multi_polygon;
use crate::source::{FeatureService, RawFeature, ServiceError};

/// Receiving side of a cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// Sending side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked cancel handle and token.
#[must_use]
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Cancellation {
    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Per-parcel results in request order, plus failures.
#[derive(Debug)]
pub struct FetchReport<T> {
    pub parcels: Vec<T>,
    pub failures: Vec<ParcelFailure>,
}

struct FetchContext {
    service: Arc<dyn FeatureService>,
    options: FetchOptions,
    fields: FieldMapping,
    layers: LayerSet,
}

/// Fetches parcels and their features from a [`FeatureService`].
pub struct Fetcher {
    service: Arc<dyn FeatureService>,
    options: FetchOptions,
    fields: FieldMapping,
}

impl Fetcher {
    pub fn new(service: Arc<dyn FeatureService>, options: FetchOptions, fields: FieldMapping) -> Self {
        Self {
            service,
            options,
            fields,
        }
    }

    /// Fetch every parcel in `lotplans`.
    ///
    /// # Errors
    /// Returns [`ExportError::Cancelled`] if `cancel` fires first. Per-parcel
    /// problems are reported in [`FetchReport::failures`].
    pub async fn fetch(
        &self,
        lotplans: &[LotPlan],
        layers: LayerSet,
        cancel: &Cancellation,
    ) -> Result<FetchReport<ParcelFetch>> {
        self.fetch_with(lotplans, layers, cancel, Ok).await
    }

    /// Fetch every parcel and run `map` on each result on the blocking pool,
    /// so per-parcel CPU work overlaps with other parcels' I/O without holding
    /// up async workers. A `map` error becomes a failure for that parcel.
    ///
    /// # Errors
    /// Returns [`ExportError::Cancelled`] if `cancel` fires first.
    #[tracing::instrument(skip_all, fields(parcels = lotplans.len()))]
    pub async fn fetch_with<T, F>(
        &self,
        lotplans: &[LotPlan],
        layers: LayerSet,
        cancel: &Cancellation,
        map: F,
    ) -> Result<FetchReport<T>>
    where
        T: Send + 'static,
        F: Fn(ParcelFetch) -> std::result::Result<T, ParcelFailure> + Send + Sync + 'static,
    {
        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let ctx = Arc::new(FetchContext {
            service: Arc::clone(&self.service),
            options: self.options.clone(),
            fields: self.fields.clone(),
            layers,
        });
        let map = Arc::new(map);
        let semaphore = Arc::new(Semaphore::new(self.options.permits()));
        let mut set = JoinSet::new();

        for (index, lotplan) in lotplans.iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let map = Arc::clone(&map);
            let semaphore = Arc::clone(&semaphore);
            let lotplan = lotplan.clone();
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => match fetch_parcel(&ctx, &lotplan).await {
                        Ok(fetched) => tokio::task::spawn_blocking(move || (*map)(fetched))
                            .await
                            .unwrap_or_else(|_| Err(aborted(&lotplan))),
                        Err(failure) => Err(failure),
                    },
                    Err(_) => Err(aborted(&lotplan)),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<std::result::Result<T, ParcelFailure>>> =
            lotplans.iter().map(|_| None).collect();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    set.abort_all();
                    info!("Fetch cancelled; in-flight parcels aborted");
                    return Err(ExportError::Cancelled);
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((index, result))) => slots[index] = Some(result),
                    Some(Err(e)) => warn!(error = %e, "Fetch worker ended abnormally"),
                },
            }
        }

        let mut report = FetchReport {
            parcels: Vec::new(),
            failures: Vec::new(),
        };
        for (slot, lotplan) in slots.into_iter().zip(lotplans) {
            match slot.unwrap_or_else(|| Err(aborted(lotplan))) {
                Ok(value) => report.parcels.push(value),
                Err(failure) => report.failures.push(failure),
            }
        }
        info!(
            succeeded = report.parcels.len(),
            failed = report.failures.len(),
            "Fetch complete"
        );
        Ok(report)
    }
}

fn aborted(lotplan: &LotPlan) -> ParcelFailure {
    ParcelFailure {
        lotplan: lotplan.to_string(),
        kind: FailureKind::FetchFailed,
        detail: "fetch worker ended abnormally".to_string(),
    }
}

async fn fetch_parcel(
    ctx: &FetchContext,
    lotplan: &LotPlan,
) -> std::result::Result<ParcelFetch, ParcelFailure> {
    let failed = |e: ExportError| ParcelFailure::fetch_failed(lotplan, &e);

    let parcel = call_with_retry(&ctx.options, lotplan, "parcel", || {
        ctx.service.fetch_parcel(lotplan)
    })
    .await
    .map_err(failed)?
    .ok_or_else(|| ParcelFailure::not_found(lotplan.to_string(), "lot/plan not found"))?;

    let Some(envelope) = parcel.envelope() else {
        return Err(ParcelFailure::not_found(
            lotplan.to_string(),
            "parcel has no boundary geometry",
        ));
    };

    let mut features = Vec::new();
    for theme in ctx.layers.themes() {
        let set = call_with_retry(&ctx.options, lotplan, theme.as_str(), || {
            ctx.service.query_features(theme, &envelope)
        })
        .await
        .map_err(failed)?;
        for raw in &set.features {
            let Some(geometry) = raw.geometry.as_ref().and_then(as_multi_polygon) else {
                debug!(lotplan = %lotplan, theme = %theme, "Skipping non-polygon feature");
                continue;
            };
            features.push(ClassifiedFeature {
                parcel: lotplan.clone(),
                theme,
                class: classify(theme, raw, &ctx.fields),
                geometry,
                epsg: set.epsg,
                ordinal: features.len(),
            });
        }
    }

    let bores = if ctx.layers.bores {
        let set = call_with_retry(&ctx.options, lotplan, "bores", || {
            ctx.service.fetch_bores_in_envelope(&envelope)
        })
        .await
        .map_err(failed)?;
        set.features
            .iter()
            .filter_map(|raw| bore_from_raw(raw, set.epsg, &ctx.fields))
            .collect()
    } else {
        Vec::new()
    };

    debug!(
        lotplan = %lotplan,
        features = features.len(),
        bores = bores.len(),
        "Parcel fetched"
    );
    Ok(ParcelFetch {
        parcel,
        features,
        bores,
    })
}

/// Run `call` with a per-call timeout, retrying retryable errors with
/// exponential backoff.
async fn call_with_retry<T, F, Fut>(
    options: &FetchOptions,
    lotplan: &LotPlan,
    what: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ServiceError>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(options.call_timeout(), call()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(options.call_timeout_ms)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = options.backoff(attempt);
                warn!(
                    lotplan = %lotplan,
                    call = what,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Service call failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                warn!(lotplan = %lotplan, call = what, attempt, error = %source, "Service call failed");
                return Err(ExportError::FetchFailed {
                    lotplan: lotplan.to_string(),
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

/// Read the classification of a raw feature.
///
/// Land types use the configured code and name fields. Vegetation classes
/// fall back from code to name to `UNK` and are displayed as
/// `Category <name>`.
#[must_use]
pub fn classify(theme: ThemeLayer, raw: &RawFeature, fields: &FieldMapping) -> Classification {
    match theme {
        ThemeLayer::LandTypes => {
            let code = raw
                .first_text(&[fields.landtype_code.as_str(), "code"])
                .unwrap_or_else(|| "UNK".to_string());
            let name = raw
                .first_text(&[fields.landtype_name.as_str(), "name"])
                .unwrap_or_else(|| code.clone());
            Classification::new(code, name)
        }
        ThemeLayer::Vegetation => {
            let code_field = fields.veg_code.as_deref().unwrap_or("code");
            let code = raw.first_text(&[code_field, "code"]);
            let name = raw.first_text(&[fields.veg_name.as_str(), "name"]);
            let category = name
                .clone()
                .or_else(|| code.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            Classification::new(
                code.or(name).unwrap_or_else(|| "UNK".to_string()),
                format!("Category {category}"),
            )
        }
    }
}
