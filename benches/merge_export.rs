//! Benchmarks for class merging, rasterization and the end-to-end export.
//!
//! Run with: `cargo bench`
//!
//! Inputs are synthetic grids of overlapping squares near Longreach in Web
//! Mercator, so no fixture data is needed.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use geo::{polygon, MultiPolygon};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

use landtypes::geometry::{mercator_area_ha, ops};
use landtypes::{
    merge, render, Cancellation, Classification, ExportConfig, ExportFormat, ExportRequest,
    Exporter, Extent, InMemoryFeatureService, LotPlan, MergeScope, NormalizedFeature,
    RasterOptions, StyleResolver, ThemeLayer,
};

const OX: f64 = 16_060_000.0;
const OY: f64 = -2_670_000.0;

fn square(x: f64, y: f64, size: f64) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![polygon![
        (x: OX + x, y: OY + y),
        (x: OX + x + size, y: OY + y),
        (x: OX + x + size, y: OY + y + size),
        (x: OX + x, y: OY + y + size),
        (x: OX + x, y: OY + y),
    ]])
}

/// `side * side` features cycling through `classes` codes, each overlapping
/// its neighbours by half.
fn features(side: usize, classes: usize) -> Vec<NormalizedFeature> {
    let parcel = LotPlan::parse("1RP1").unwrap();
    let mut out = Vec::with_capacity(side * side);
    for row in 0..side {
        for col in 0..side {
            let index = row * side + col;
            let code = format!("LT{}", index % classes);
            let geometry = ops::canonicalize(&square(col as f64 * 50.0, row as f64 * 50.0, 100.0));
            out.push(NormalizedFeature {
                parcel: parcel.clone(),
                theme: ThemeLayer::LandTypes,
                class: Classification::new(code.clone(), code),
                area_ha: mercator_area_ha(&geometry),
                geometry,
                ordinal: index,
            });
        }
    }
    out
}

/// Benchmark union of overlapping polygons per class
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for side in [4, 8, 16] {
        let input = features(side, 4);
        group.bench_with_input(BenchmarkId::new("features", side * side), &input, |b, input| {
            b.iter(|| merge(black_box(input), &MergeScope::AllParcels));
        });
    }
    group.finish();
}

/// Benchmark scanline rasterization at various raster sizes
fn bench_render(c: &mut Criterion) {
    let input = features(8, 4);
    let extent = Extent::new(OX, OY, OX + 450.0, OY + 450.0);
    let resolver = StyleResolver::default();

    let mut group = c.benchmark_group("render");
    for max_px in [256_u32, 1024, 4096] {
        let options = RasterOptions::default().with_max_px(max_px);
        group.bench_with_input(BenchmarkId::new("max_px", max_px), &options, |b, options| {
            b.iter(|| render(black_box(&input), extent, options).unwrap());
        });
    }

    let raster = render(&input, extent, &RasterOptions::default().with_max_px(1024)).unwrap();
    group.bench_function("geotiff_1024", |b| {
        b.iter(|| raster.to_geotiff_bytes(black_box(&resolver)).unwrap());
    });
    group.finish();
}

/// Benchmark a two-parcel KMZ export against the in-memory service
fn bench_export(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut service = InMemoryFeatureService::new(3857)
        .with_parcel(&LotPlan::parse("1RP1").unwrap(), square(0.0, 0.0, 1000.0))
        .with_parcel(&LotPlan::parse("2RP1").unwrap(), square(1000.0, 0.0, 1000.0));
    for i in 0..20 {
        let offset = f64::from(i) * 90.0;
        service = service.with_feature(
            ThemeLayer::LandTypes,
            json!({"lt_code_1": format!("LT{}", i % 5), "lt_name_1": "Bench"}),
            square(offset, offset / 2.0, 300.0),
        );
    }
    let exporter = Exporter::new(Arc::new(service), ExportConfig::default());
    let request = ExportRequest::new(["1RP1", "2RP1"], ExportFormat::Kmz).with_format(ExportFormat::GeoTiff);

    c.bench_function("export_two_parcels_kmz_tiff", |b| {
        b.iter(|| {
            rt.block_on(exporter.export(black_box(&request), &Cancellation::never()))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_merge, bench_render, bench_export);

criterion_main!(benches);
