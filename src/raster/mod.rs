//! Raster renderer.
//!
//! Burns normalized class polygons onto a north-up grid covering an extent in
//! the working CRS. Each cell records the class of the last feature drawn over
//! its centre; features are drawn in ascending fetch ordinal, so later
//! features win ties.

pub mod geotiff;
pub mod query;

use std::collections::BTreeMap;

use geo::{LineString, MultiPolygon};
use tracing::debug;

use crate::casting::{f64_to_pixel_count, f64_to_span_start, pixels_to_f64};
use crate::config::RasterOptions;
use crate::error::{ExportError, Result};
use crate::geometry::projection::WORKING_EPSG;
use crate::geometry::Extent;
use crate::model::{ClassKey, NormalizedFeature};
use crate::style::StyleResolver;

/// Georeferencing of a north-up grid.
///
/// `pixel_width * width` and `pixel_height * height` reproduce the extent
/// exactly, so the raster's bounding box is the extent it was built for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub extent: Extent,
    pub width: usize,
    pub height: usize,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub epsg: i32,
}

impl GridSpec {
    /// Size a grid for `extent`. The longest side gets
    /// [`RasterOptions::clamped_max_px`] pixels unless an explicit pixel size
    /// is set; either way no side exceeds [`RasterOptions::MAX_PX`].
    ///
    /// # Errors
    /// Returns [`ExportError::EmptyExtent`] if the extent has no area.
    pub fn for_extent(extent: Extent, options: &RasterOptions) -> Result<Self> {
        if !extent.has_area() {
            return Err(ExportError::EmptyExtent);
        }
        let longest = extent.width().max(extent.height());
        let finest = longest / f64::from(RasterOptions::MAX_PX);
        let pixel = match options.pixel_size.filter(|s| s.is_finite() && *s > 0.0) {
            Some(size) => size.max(finest),
            None => longest / f64::from(options.clamped_max_px()),
        };

        let width = f64_to_pixel_count(extent.width() / pixel);
        let height = f64_to_pixel_count(extent.height() / pixel);
        Ok(Self {
            extent,
            width,
            height,
            pixel_width: extent.width() / pixels_to_f64(width),
            pixel_height: extent.height() / pixels_to_f64(height),
            epsg: WORKING_EPSG,
        })
    }

    /// World coordinate of a pixel centre.
    #[must_use]
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.extent.minx + (pixels_to_f64(col) + 0.5) * self.pixel_width,
            self.extent.maxy - (pixels_to_f64(row) + 0.5) * self.pixel_height,
        )
    }

    /// Fractional pixel position of a world coordinate (may be out of range).
    #[must_use]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.extent.minx) / self.pixel_width,
            (self.extent.maxy - y) / self.pixel_height,
        )
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }
}

/// Grid of class indices.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRaster {
    pub grid: GridSpec,
    /// Classes present, sorted; a cell value `i > 0` refers to `classes[i - 1]`.
    pub classes: Vec<ClassKey>,
    /// Row-major, `0` for no data.
    pub cells: Vec<u32>,
}

impl ClassRaster {
    /// Class drawn at a cell, `None` for no data or out of range.
    #[must_use]
    pub fn class_at(&self, col: usize, row: usize) -> Option<&ClassKey> {
        if col >= self.grid.width || row >= self.grid.height {
            return None;
        }
        let value = self.cells[row * self.grid.width + col];
        let index = usize::try_from(value).ok()?.checked_sub(1)?;
        self.classes.get(index)
    }

    /// Number of cells showing `key`.
    #[must_use]
    pub fn coverage(&self, key: &ClassKey) -> usize {
        let Some(index) = self.classes.iter().position(|k| k == key) else {
            return 0;
        };
        let value = u32::try_from(index + 1).unwrap_or(u32::MAX);
        self.cells.iter().filter(|v| **v == value).count()
    }

    /// Interleaved RGBA8 with class colours and transparent no-data.
    #[must_use]
    pub fn to_rgba(&self, resolver: &StyleResolver) -> Vec<u8> {
        let colours: Vec<[u8; 4]> = self
            .classes
            .iter()
            .map(|k| {
                let [r, g, b] = resolver.resolve(k).rgb();
                [r, g, b, 255]
            })
            .collect();
        let mut rgba = Vec::with_capacity(self.cells.len() * 4);
        for value in &self.cells {
            let pixel = usize::try_from(*value)
                .ok()
                .and_then(|v| v.checked_sub(1))
                .and_then(|i| colours.get(i))
                .copied()
                .unwrap_or([0, 0, 0, 0]);
            rgba.extend_from_slice(&pixel);
        }
        rgba
    }
}

/// Rasterize `features` over `extent`.
///
/// # Errors
/// Returns [`ExportError::EmptyExtent`] if the extent has no area.
pub fn render<'a, I>(features: I, extent: Extent, options: &RasterOptions) -> Result<ClassRaster>
where
    I: IntoIterator<Item = &'a NormalizedFeature>,
{
    let grid = GridSpec::for_extent(extent, options)?;

    let mut ordered: Vec<&NormalizedFeature> = features.into_iter().collect();
    ordered.sort_by_key(|f| f.ordinal);

    let mut index: BTreeMap<ClassKey, u32> = BTreeMap::new();
    for feature in &ordered {
        index.entry(feature.key()).or_insert(0);
    }
    for (i, value) in index.values_mut().enumerate() {
        *value = u32::try_from(i + 1).unwrap_or(u32::MAX);
    }

    let mut cells = vec![0_u32; grid.cell_count()];
    for feature in &ordered {
        let value = index.get(&feature.key()).copied().unwrap_or(0);
        fill_multi_polygon(&grid, &feature.geometry, value, &mut cells);
    }

    debug!(
        width = grid.width,
        height = grid.height,
        classes = index.len(),
        "Rasterized"
    );
    Ok(ClassRaster {
        grid,
        classes: index.into_keys().collect(),
        cells,
    })
}

/// Even-odd scanline fill sampled at pixel centres.
fn fill_multi_polygon(grid: &GridSpec, geometry: &MultiPolygon<f64>, value: u32, cells: &mut [u32]) {
    let Some(bbox) = Extent::of(geometry) else {
        return;
    };
    if !bbox.intersects(&grid.extent) {
        return;
    }

    for polygon in &geometry.0 {
        let rings: Vec<&LineString<f64>> = std::iter::once(polygon.exterior())
            .chain(polygon.interiors())
            .collect();
        let Some(pbox) = Extent::of(&MultiPolygon::new(vec![polygon.clone()])) else {
            continue;
        };

        let row_start = f64_to_span_start((grid.extent.maxy - pbox.maxy) / grid.pixel_height, grid.height);
        let row_end = f64_to_span_start((grid.extent.maxy - pbox.miny) / grid.pixel_height, grid.height);
        let mut crossings: Vec<f64> = Vec::new();

        for row in row_start..row_end {
            let (_, y) = grid.pixel_center(0, row);
            crossings.clear();
            for ring in &rings {
                for line in ring.lines() {
                    let (a, b) = (line.start, line.end);
                    if (a.y <= y) != (b.y <= y) {
                        crossings.push(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y));
                    }
                }
            }
            crossings.sort_by(f64::total_cmp);

            let offset = row * grid.width;
            for span in crossings.chunks_exact(2) {
                let start = f64_to_span_start((span[0] - grid.extent.minx) / grid.pixel_width, grid.width);
                let end = f64_to_span_start((span[1] - grid.extent.minx) / grid.pixel_width, grid.width);
                for cell in &mut cells[offset + start..offset + end.max(start)] {
                    *cell = value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ops;
    use crate::lotplan::LotPlan;
    use crate::model::{Classification, ThemeLayer};
    use geo::polygon;

    fn feature(code: &str, ordinal: usize, geometry: MultiPolygon<f64>) -> NormalizedFeature {
        NormalizedFeature {
            parcel: LotPlan::parse("1RP1").unwrap(),
            theme: ThemeLayer::LandTypes,
            class: Classification::new(code, code),
            geometry: ops::canonicalize(&geometry),
            ordinal,
            area_ha: 1.0,
        }
    }

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
        ]])
    }

    fn small() -> RasterOptions {
        // below MIN_PX, so clamps to 256
        RasterOptions::default().with_max_px(10)
    }

    #[test]
    fn test_grid_covers_extent_exactly() {
        let extent = Extent::new(1000.0, 2000.0, 1256.0, 2100.0);
        let grid = GridSpec::for_extent(extent, &small()).unwrap();
        assert_eq!(grid.width, 256);
        assert_eq!(grid.height, 100);
        assert!((grid.pixel_width * 256.0 - extent.width()).abs() < 1e-9);
        assert!((grid.pixel_height * 100.0 - extent.height()).abs() < 1e-9);

        let odd = Extent::new(0.0, 0.0, 1000.0, 333.3);
        let grid = GridSpec::for_extent(odd, &RasterOptions::default().with_max_px(300)).unwrap();
        assert_eq!(grid.width, 300);
        assert_eq!(grid.height, 100);
        assert!((grid.pixel_height * 100.0 - 333.3).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_pixel_size_and_cap() {
        let extent = Extent::new(0.0, 0.0, 500.0, 250.0);
        let grid = GridSpec::for_extent(extent, &RasterOptions::default().with_pixel_size(5.0)).unwrap();
        assert_eq!((grid.width, grid.height), (100, 50));

        let grid = GridSpec::for_extent(extent, &RasterOptions::default().with_pixel_size(0.001)).unwrap();
        assert_eq!(grid.width, RasterOptions::MAX_PX as usize);
    }

    #[test]
    fn test_zero_area_extent_fails() {
        let err = GridSpec::for_extent(Extent::new(5.0, 5.0, 5.0, 10.0), &small()).unwrap_err();
        assert!(matches!(err, ExportError::EmptyExtent));
        assert!(matches!(
            render(std::iter::empty(), Extent::new(0.0, 0.0, 0.0, 0.0), &small()),
            Err(ExportError::EmptyExtent)
        ));
    }

    #[test]
    fn test_pixel_center_round_trip() {
        let grid = GridSpec::for_extent(Extent::new(-50.0, 10.0, 206.0, 138.0), &small()).unwrap();
        for (col, row) in [(0, 0), (17, 3), (255, 127)] {
            let (x, y) = grid.pixel_center(col, row);
            let (px, py) = grid.world_to_pixel(x, y);
            assert!((px - (col as f64 + 0.5)).abs() < 1e-9);
            assert!((py - (row as f64 + 0.5)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_later_ordinal_wins_overlap() {
        let extent = Extent::new(0.0, 0.0, 256.0, 256.0);
        let a = feature("A", 0, rect(0.0, 0.0, 128.0, 256.0));
        let b = feature("B", 1, rect(64.0, 0.0, 256.0, 256.0));
        // input order reversed; ordinal decides
        let raster = render([&b, &a], extent, &small()).unwrap();
        let key_a = a.key();
        let key_b = b.key();
        assert_eq!(raster.class_at(10, 10), Some(&key_a));
        assert_eq!(raster.class_at(100, 10), Some(&key_b));
        assert_eq!(raster.coverage(&key_a), 64 * 256);
        assert_eq!(raster.coverage(&key_b), 192 * 256);
    }

    #[test]
    fn test_holes_stay_empty() {
        let extent = Extent::new(0.0, 0.0, 256.0, 256.0);
        let donut = MultiPolygon::new(vec![polygon!(
            exterior: [(x: 0.0, y: 0.0), (x: 256.0, y: 0.0), (x: 256.0, y: 256.0), (x: 0.0, y: 256.0), (x: 0.0, y: 0.0)],
            interiors: [[(x: 64.0, y: 64.0), (x: 64.0, y: 192.0), (x: 192.0, y: 192.0), (x: 192.0, y: 64.0), (x: 64.0, y: 64.0)]],
        )]);
        let f = feature("D", 0, donut);
        let raster = render([&f], extent, &small()).unwrap();
        assert_eq!(raster.class_at(128, 128), None);
        assert_eq!(raster.class_at(10, 128), Some(&f.key()));
        assert_eq!(raster.coverage(&f.key()), 256 * 256 - 128 * 128);

        let rgba = raster.to_rgba(&StyleResolver::default());
        assert_eq!(rgba.len(), 256 * 256 * 4);
        assert_eq!(rgba[(128 * 256 + 128) * 4 + 3], 0);
        assert_eq!(rgba[(128 * 256 + 10) * 4 + 3], 255);
    }
}
