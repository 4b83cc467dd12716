//! Point sampling of class rasters.
//!
//! Lets callers ask which class a rendered raster shows at a coordinate in any
//! supported CRS, which is also how raster georeferencing is checked against
//! the vector geometry it was drawn from.
//!
//! ```rust,no_run
//! use landtypes::raster::query::ClassQuery;
//! # fn demo(raster: &landtypes::raster::ClassRaster) -> landtypes::Result<()> {
//! let hit = raster.sample_lonlat(144.27, -23.32)?;
//! if let Some(class) = hit.class {
//!     println!("{class}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::casting::f64_to_pixel_index;
use crate::error::Result;
use crate::geometry::projection::{project_point, OUTPUT_EPSG};
use crate::model::ClassKey;

use super::ClassRaster;

/// Outcome of sampling a class raster at one coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassQueryResult {
    /// Class drawn at the sampled cell, `None` for no data or out of range.
    pub class: Option<ClassKey>,

    /// Whether the coordinate fell inside the raster.
    pub is_valid: bool,

    /// Sampled cell as `(col, row)`, when inside.
    pub pixel_coords: Option<(usize, usize)>,

    /// CRS of the input coordinate
    pub input_crs: i32,

    /// CRS of the raster grid
    pub raster_crs: i32,
}

/// Class lookups at world coordinates.
pub trait ClassQuery {
    /// Sample at a lon/lat coordinate (EPSG:4326).
    ///
    /// # Errors
    /// Returns an error if the coordinate cannot be projected into the
    /// raster's CRS.
    fn sample_lonlat(&self, lon: f64, lat: f64) -> Result<ClassQueryResult>;

    /// Sample at a coordinate in `crs`.
    ///
    /// # Errors
    /// Returns an error if the coordinate cannot be projected into the
    /// raster's CRS.
    fn sample_crs(&self, crs: i32, x: f64, y: f64) -> Result<ClassQueryResult>;

    /// Sample several coordinates in `crs`.
    ///
    /// # Errors
    /// Fails on the first coordinate that cannot be projected.
    fn sample_points_crs(&self, crs: i32, points: &[(f64, f64)]) -> Result<Vec<ClassQueryResult>>;
}

impl ClassQuery for ClassRaster {
    fn sample_lonlat(&self, lon: f64, lat: f64) -> Result<ClassQueryResult> {
        self.sample_crs(OUTPUT_EPSG, lon, lat)
    }

    fn sample_crs(&self, crs: i32, x: f64, y: f64) -> Result<ClassQueryResult> {
        let raster_crs = self.grid.epsg;
        let (src_x, src_y) = if crs == raster_crs {
            (x, y)
        } else {
            project_point(crs, raster_crs, x, y)?
        };

        let (px, py) = self.grid.world_to_pixel(src_x, src_y);
        let cell = f64_to_pixel_index(px, self.grid.width)
            .zip(f64_to_pixel_index(py, self.grid.height));

        Ok(ClassQueryResult {
            class: cell.and_then(|(col, row)| self.class_at(col, row).cloned()),
            is_valid: cell.is_some(),
            pixel_coords: cell,
            input_crs: crs,
            raster_crs,
        })
    }

    fn sample_points_crs(&self, crs: i32, points: &[(f64, f64)]) -> Result<Vec<ClassQueryResult>> {
        points
            .iter()
            .map(|&(x, y)| self.sample_crs(crs, x, y))
            .collect()
    }
}
