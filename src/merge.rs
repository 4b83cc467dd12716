//! Class merger.
//!
//! Groups normalized polygons by [`ClassKey`] and unions each group into one
//! multi-polygon, either within a single parcel or across every parcel in the
//! request.
//!
//! The result does not depend on input order. Each group is sorted by a
//! geometric key before folding, and [`ops::union`] returns canonical
//! geometry, so any permutation of the same features produces an identical
//! layer.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use geo::MultiPolygon;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Warning;
use crate::geometry::{mercator_area_ha, ops, Extent};
use crate::lotplan::LotPlan;
use crate::model::{ClassKey, NormalizedFeature};

/// Which features a merge covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeScope {
    /// Only features belonging to one parcel.
    PerParcel(LotPlan),
    /// Every feature handed in, across parcels.
    AllParcels,
}

impl MergeScope {
    fn admits(&self, feature: &NormalizedFeature) -> bool {
        match self {
            Self::PerParcel(lotplan) => &feature.parcel == lotplan,
            Self::AllParcels => true,
        }
    }
}

/// Union of every feature sharing a class key within a scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedClassLayer {
    pub key: ClassKey,
    pub name: String,
    #[serde(skip)]
    pub geometry: MultiPolygon<f64>,
    pub area_ha: f64,
    /// Parcels that contributed geometry.
    pub parcels: BTreeSet<LotPlan>,
}

impl MergedClassLayer {
    fn seed(feature: &NormalizedFeature, name: String) -> Self {
        Self {
            key: feature.key(),
            name,
            geometry: feature.geometry.clone(),
            area_ha: feature.area_ha,
            parcels: BTreeSet::from([feature.parcel.clone()]),
        }
    }

    /// Union `feature` into this layer. On failure the layer is left
    /// untouched and `false` is returned.
    fn absorb<U>(&mut self, feature: &NormalizedFeature, union: &U) -> bool
    where
        U: Fn(&MultiPolygon<f64>, &MultiPolygon<f64>) -> Option<MultiPolygon<f64>>,
    {
        match union(&self.geometry, &feature.geometry) {
            Some(geometry) if !geometry.0.is_empty() => {
                self.area_ha = mercator_area_ha(&geometry);
                self.geometry = geometry;
                self.parcels.insert(feature.parcel.clone());
                true
            }
            _ => false,
        }
    }
}

/// Output of [`merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub layers: BTreeMap<ClassKey, MergedClassLayer>,
    pub warnings: Vec<Warning>,
}

impl MergeResult {
    /// Total merged area across all layers, in hectares.
    #[must_use]
    pub fn total_area_ha(&self) -> f64 {
        self.layers.values().map(|l| l.area_ha).sum()
    }
}

/// First-seen class names, with one conflict warning per discarded name.
#[derive(Default)]
struct NameBook {
    names: BTreeMap<ClassKey, String>,
    reported: BTreeSet<(ClassKey, String)>,
}

impl NameBook {
    fn record(&mut self, feature: &NormalizedFeature, warnings: &mut Vec<Warning>) {
        let key = feature.key();
        match self.names.get(&key) {
            None => {
                self.names.insert(key, feature.class.name.clone());
            }
            Some(kept) if *kept != feature.class.name => {
                if self.reported.insert((key.clone(), feature.class.name.clone())) {
                    warn!(
                        code = %key,
                        kept = %kept,
                        discarded = %feature.class.name,
                        "Class name conflict; keeping first name"
                    );
                    warnings.push(Warning::MergeConflict {
                        code: key.code.clone(),
                        kept: kept.clone(),
                        discarded: feature.class.name.clone(),
                    });
                }
            }
            Some(_) => {}
        }
    }
}

/// Name conflicts across `features` in the order given, without merging any
/// geometry. The legend keeps the same first-seen names.
pub fn name_conflicts<'a, I>(features: I) -> Vec<Warning>
where
    I: IntoIterator<Item = &'a NormalizedFeature>,
{
    let mut book = NameBook::default();
    let mut warnings = Vec::new();
    for feature in features {
        book.record(feature, &mut warnings);
    }
    warnings
}

/// Merge `features` within `scope`.
///
/// A class seen under two names keeps the first name and records a
/// [`Warning::MergeConflict`]. A union that fails skips the offending feature
/// and records a [`Warning::UnionSkipped`]; the rest of the class still merges.
pub fn merge<'a, I>(features: I, scope: &MergeScope) -> MergeResult
where
    I: IntoIterator<Item = &'a NormalizedFeature>,
{
    merge_with(features, scope, ops::union)
}

fn merge_with<'a, I, U>(features: I, scope: &MergeScope, union: U) -> MergeResult
where
    I: IntoIterator<Item = &'a NormalizedFeature>,
    U: Fn(&MultiPolygon<f64>, &MultiPolygon<f64>) -> Option<MultiPolygon<f64>>,
{
    let mut book = NameBook::default();
    let mut groups: BTreeMap<ClassKey, Vec<&NormalizedFeature>> = BTreeMap::new();
    let mut warnings = Vec::new();

    for feature in features.into_iter().filter(|f| scope.admits(f)) {
        book.record(feature, &mut warnings);
        groups.entry(feature.key()).or_default().push(feature);
    }

    let mut layers = BTreeMap::new();
    for (key, mut group) in groups {
        group.sort_by(|a, b| fold_order(a, b));
        let name = book.names.remove(&key).unwrap_or_default();

        let mut iter = group.into_iter();
        let Some(first) = iter.next() else {
            continue;
        };
        let mut layer = MergedClassLayer::seed(first, name);
        for feature in iter {
            if !layer.absorb(feature, &union) {
                warn!(code = %key, lotplan = %feature.parcel, "Union failed; feature skipped");
                warnings.push(Warning::UnionSkipped {
                    code: key.code.clone(),
                    lotplan: feature.parcel.to_string(),
                    reason: "polygon union failed".to_string(),
                });
            }
        }
        debug!(
            code = %key,
            parcels = layer.parcels.len(),
            area_ha = layer.area_ha,
            "Class merged"
        );
        layers.insert(key, layer);
    }

    MergeResult { layers, warnings }
}

/// Order features by where they are and what they look like, never by where
/// they came from in the input.
fn fold_order(a: &NormalizedFeature, b: &NormalizedFeature) -> Ordering {
    let extent = |f: &NormalizedFeature| Extent::of(&f.geometry);
    let bbox = match (extent(a), extent(b)) {
        (Some(ea), Some(eb)) => ea
            .minx
            .total_cmp(&eb.minx)
            .then_with(|| ea.miny.total_cmp(&eb.miny))
            .then_with(|| ea.maxx.total_cmp(&eb.maxx))
            .then_with(|| ea.maxy.total_cmp(&eb.maxy)),
        (ea, eb) => ea.is_some().cmp(&eb.is_some()),
    };
    bbox.then_with(|| a.area_ha.total_cmp(&b.area_ha))
        .then_with(|| ops::vertex_count(&a.geometry).cmp(&ops::vertex_count(&b.geometry)))
        .then_with(|| ops::geometry_order(&a.geometry, &b.geometry))
        .then_with(|| a.parcel.cmp(&b.parcel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classification, ThemeLayer};
    use geo::{polygon, Area};
    use proptest::prelude::*;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
        ]])
    }

    fn feature(lotplan: &str, code: &str, name: &str, geometry: MultiPolygon<f64>) -> NormalizedFeature {
        let geometry = ops::canonicalize(&geometry);
        NormalizedFeature {
            parcel: LotPlan::parse(lotplan).unwrap(),
            theme: ThemeLayer::LandTypes,
            class: Classification::new(code, name),
            area_ha: mercator_area_ha(&geometry),
            geometry,
            ordinal: 0,
        }
    }

    #[test]
    fn test_overlap_is_not_double_counted() {
        let p1 = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 100.0, 100.0));
        let p2 = feature("2RP1", "A", "Alpha", rect(50.0, 0.0, 150.0, 100.0));
        let result = merge([&p1, &p2], &MergeScope::AllParcels);
        let layer = &result.layers[&ClassKey::new(ThemeLayer::LandTypes, "A")];
        // 10_000 + 10_000 - 5_000 m²
        assert!((layer.geometry.unsigned_area() - 15_000.0).abs() < 1e-3);
        assert!((layer.area_ha - 1.5).abs() < 1e-6);
        assert_eq!(layer.parcels.len(), 2);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_single_parcel_key_still_produces_layer() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let b = feature("2RP1", "B", "Beta", rect(20.0, 0.0, 30.0, 10.0));
        let result = merge([&a, &b], &MergeScope::AllParcels);
        assert_eq!(result.layers.len(), 2);
        let beta = &result.layers[&ClassKey::new(ThemeLayer::LandTypes, "B")];
        assert_eq!(beta.geometry, b.geometry);
        assert_eq!(beta.parcels.iter().map(ToString::to_string).collect::<Vec<_>>(), vec!["2RP1"]);
    }

    #[test]
    fn test_per_parcel_scope_filters() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let b = feature("2RP1", "A", "Alpha", rect(20.0, 0.0, 30.0, 10.0));
        let scope = MergeScope::PerParcel(LotPlan::parse("2RP1").unwrap());
        let result = merge([&a, &b], &scope);
        let layer = &result.layers[&ClassKey::new(ThemeLayer::LandTypes, "A")];
        assert_eq!(layer.geometry, b.geometry);
    }

    #[test]
    fn test_disjoint_parts_stay_separate_polygons() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let b = feature("1RP1", "A", "Alpha", rect(20.0, 0.0, 30.0, 10.0));
        let result = merge([&a, &b], &MergeScope::AllParcels);
        let layer = &result.layers[&ClassKey::new(ThemeLayer::LandTypes, "A")];
        assert_eq!(layer.geometry.0.len(), 2);
    }

    #[test]
    fn test_name_conflict_keeps_first_and_warns_once() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let b = feature("2RP1", "A", "Other", rect(5.0, 0.0, 15.0, 10.0));
        let c = feature("3RP1", "A", "Other", rect(10.0, 0.0, 20.0, 10.0));
        let result = merge([&a, &b, &c], &MergeScope::AllParcels);
        let layer = &result.layers[&ClassKey::new(ThemeLayer::LandTypes, "A")];
        assert_eq!(layer.name, "Alpha");
        assert_eq!(
            result.warnings,
            vec![Warning::MergeConflict {
                code: "A".to_string(),
                kept: "Alpha".to_string(),
                discarded: "Other".to_string(),
            }]
        );
    }

    #[test]
    fn test_themes_do_not_mix() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let mut v = feature("1RP1", "A", "Category A", rect(0.0, 0.0, 10.0, 10.0));
        v.theme = ThemeLayer::Vegetation;
        let result = merge([&a, &v], &MergeScope::AllParcels);
        assert_eq!(result.layers.len(), 2);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_failed_union_skips_feature_and_keeps_class() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let b = feature("2RP1", "A", "Alpha", rect(5.0, 0.0, 15.0, 10.0));
        let bad = feature("3RP1", "A", "Alpha", rect(40.0, 0.0, 50.0, 10.0));
        let poisoned = bad.geometry.clone();
        let result = merge_with([&bad, &a, &b], &MergeScope::AllParcels, |x, y| {
            if *y == poisoned {
                None
            } else {
                ops::union(x, y)
            }
        });

        let layer = &result.layers[&ClassKey::new(ThemeLayer::LandTypes, "A")];
        assert_eq!(layer.geometry, ops::union(&a.geometry, &b.geometry).unwrap());
        assert!((layer.geometry.unsigned_area() - 150.0).abs() < 1e-6);
        assert_eq!(
            layer.parcels.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["1RP1", "2RP1"]
        );
        assert_eq!(
            result.warnings,
            vec![Warning::UnionSkipped {
                code: "A".to_string(),
                lotplan: "3RP1".to_string(),
                reason: "polygon union failed".to_string(),
            }]
        );
        assert!((result.total_area_ha() - layer.area_ha).abs() < 1e-12);
    }

    #[test]
    fn test_empty_union_counts_as_failure() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let b = feature("2RP1", "A", "Alpha", rect(20.0, 0.0, 30.0, 10.0));
        let result = merge_with([&a, &b], &MergeScope::AllParcels, |_, _| {
            Some(MultiPolygon::new(Vec::new()))
        });
        let layer = &result.layers[&ClassKey::new(ThemeLayer::LandTypes, "A")];
        assert_eq!(layer.geometry, a.geometry);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_name_conflicts_follow_input_order() {
        let a = feature("1RP1", "A", "Alpha", rect(0.0, 0.0, 10.0, 10.0));
        let b = feature("2RP1", "A", "Other", rect(40.0, 0.0, 50.0, 10.0));
        let forward = name_conflicts([&a, &b]);
        assert_eq!(
            forward,
            vec![Warning::MergeConflict {
                code: "A".to_string(),
                kept: "Alpha".to_string(),
                discarded: "Other".to_string(),
            }]
        );
        let backward = name_conflicts([&b, &a]);
        assert!(matches!(&backward[..], [Warning::MergeConflict { kept, .. }] if kept == "Other"));
    }

    fn arb_rect() -> impl Strategy<Value = MultiPolygon<f64>> {
        (0.0_f64..200.0, 0.0_f64..200.0, 5.0_f64..80.0, 5.0_f64..80.0)
            .prop_map(|(x, y, w, h)| rect(x.round(), y.round(), (x + w).round(), (y + h).round()))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_merge_is_order_independent(
            a in arb_rect(),
            b in arb_rect(),
            c in arb_rect(),
        ) {
            let fa = feature("1RP1", "A", "Alpha", a);
            let fb = feature("2RP1", "A", "Alpha", b);
            let fc = feature("3RP1", "A", "Alpha", c);
            let key = ClassKey::new(ThemeLayer::LandTypes, "A");

            let abc = merge([&fa, &fb, &fc], &MergeScope::AllParcels);
            let cba = merge([&fc, &fb, &fa], &MergeScope::AllParcels);
            let bca = merge([&fb, &fc, &fa], &MergeScope::AllParcels);
            prop_assert_eq!(&abc.layers[&key].geometry, &cba.layers[&key].geometry);
            prop_assert_eq!(&abc.layers[&key].geometry, &bca.layers[&key].geometry);

            // union never exceeds the sum of the parts
            let merged = abc.layers[&key].geometry.unsigned_area();
            let parts = fa.geometry.unsigned_area() + fb.geometry.unsigned_area() + fc.geometry.unsigned_area();
            prop_assert!(merged <= parts + 1e-6);
        }
    }
}
