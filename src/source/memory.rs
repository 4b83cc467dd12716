//! Deterministic in-memory feature service with fault injection.
//!
//! Used by tests and benchmarks in place of a live service.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use geo::{Geometry, MultiPolygon, Point};
use serde_json::{Map, Value};

use crate::lotplan::LotPlan;
use crate::model::{Envelope, Parcel, ThemeLayer};

use super::{filter_by_envelope, FeatureService, RawFeature, RawFeatureSet, ServiceError};

#[derive(Debug, Default)]
pub struct InMemoryFeatureService {
    epsg: i32,
    parcels: HashMap<LotPlan, Parcel>,
    landtypes: Vec<RawFeature>,
    vegetation: Vec<RawFeature>,
    bores: Vec<RawFeature>,
    latency: Option<Duration>,
    hanging: HashSet<LotPlan>,
    failures: Mutex<HashMap<LotPlan, (u32, ServiceError)>>,
    parcel_calls: Mutex<HashMap<LotPlan, u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryFeatureService {
    /// Empty service whose features are all in `epsg`.
    #[must_use]
    pub fn new(epsg: i32) -> Self {
        Self {
            epsg,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parcel(mut self, lotplan: &LotPlan, boundary: MultiPolygon<f64>) -> Self {
        self.parcels.insert(
            lotplan.clone(),
            Parcel {
                lotplan: lotplan.clone(),
                boundary,
                epsg: self.epsg,
            },
        );
        self
    }

    #[must_use]
    pub fn with_feature(
        mut self,
        theme: ThemeLayer,
        properties: Value,
        geometry: MultiPolygon<f64>,
    ) -> Self {
        let feature = RawFeature::new(object(properties), Some(Geometry::MultiPolygon(geometry)));
        match theme {
            ThemeLayer::LandTypes => self.landtypes.push(feature),
            ThemeLayer::Vegetation => self.vegetation.push(feature),
        }
        self
    }

    #[must_use]
    pub fn with_bore(mut self, properties: Value, location: Point<f64>) -> Self {
        self.bores
            .push(RawFeature::new(object(properties), Some(Geometry::Point(location))));
        self
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the first `times` parcel lookups for `lotplan` with `error`.
    #[must_use]
    pub fn failing(self, lotplan: &LotPlan, times: u32, error: ServiceError) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(lotplan.clone(), (times, error));
        }
        self
    }

    /// Never answer parcel lookups for `lotplan`.
    #[must_use]
    pub fn hanging(mut self, lotplan: &LotPlan) -> Self {
        self.hanging.insert(lotplan.clone());
        self
    }

    /// Number of parcel lookups made for `lotplan`.
    #[must_use]
    pub fn parcel_calls(&self, lotplan: &LotPlan) -> u32 {
        self.parcel_calls
            .lock()
            .map(|calls| calls.get(lotplan).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Highest number of calls observed running at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }

    fn injected_failure(&self, lotplan: &LotPlan) -> Option<ServiceError> {
        let mut failures = self.failures.lock().ok()?;
        let (remaining, error) = failures.get_mut(lotplan)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(error.clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl FeatureService for InMemoryFeatureService {
    async fn fetch_parcel(&self, lotplan: &LotPlan) -> Result<Option<Parcel>, ServiceError> {
        if let Ok(mut calls) = self.parcel_calls.lock() {
            *calls.entry(lotplan.clone()).or_insert(0) += 1;
        }
        let _guard = self.enter().await;
        if self.hanging.contains(lotplan) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.injected_failure(lotplan) {
            return Err(error);
        }
        Ok(self.parcels.get(lotplan).cloned())
    }

    async fn query_features(
        &self,
        theme: ThemeLayer,
        envelope: &Envelope,
    ) -> Result<RawFeatureSet, ServiceError> {
        let _guard = self.enter().await;
        let features = match theme {
            ThemeLayer::LandTypes => &self.landtypes,
            ThemeLayer::Vegetation => &self.vegetation,
        };
        filter_by_envelope(features, self.epsg, envelope)
    }

    async fn fetch_bores_in_envelope(
        &self,
        envelope: &Envelope,
    ) -> Result<RawFeatureSet, ServiceError> {
        let _guard = self.enter().await;
        filter_by_envelope(&self.bores, self.epsg, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Extent;
    use geo::polygon;
    use serde_json::json;

    fn square() -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0),
        ]])
    }

    #[tokio::test]
    async fn test_injected_failures_then_success() {
        let lp = LotPlan::parse("1RP1").unwrap();
        let service = InMemoryFeatureService::new(3857)
            .with_parcel(&lp, square())
            .failing(&lp, 2, ServiceError::Unavailable("flaky".into()));
        assert!(service.fetch_parcel(&lp).await.is_err());
        assert!(service.fetch_parcel(&lp).await.is_err());
        assert!(service.fetch_parcel(&lp).await.unwrap().is_some());
        assert_eq!(service.parcel_calls(&lp), 3);
    }

    #[tokio::test]
    async fn test_features_filtered_by_envelope() {
        let service = InMemoryFeatureService::new(3857)
            .with_feature(ThemeLayer::LandTypes, json!({"lt_code_1": "A"}), square())
            .with_bore(json!({"rn_char": "RN1"}), Point::new(500.0, 500.0));
        let envelope = Envelope {
            extent: Extent::new(5.0, 5.0, 20.0, 20.0),
            epsg: 3857,
        };
        let lt = service.query_features(ThemeLayer::LandTypes, &envelope).await.unwrap();
        assert_eq!(lt.features.len(), 1);
        let bores = service.fetch_bores_in_envelope(&envelope).await.unwrap();
        assert!(bores.features.is_empty());
        assert_eq!(service.peak_in_flight(), 1);
    }
}
