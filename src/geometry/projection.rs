//! Coordinate reprojection using pure Rust (proj4rs + crs-definitions).
//!
//! Two CRS matter to the pipeline: the working CRS ([`WORKING_EPSG`], Web
//! Mercator) in which geometry is repaired, merged and rasterized, and the
//! interchange CRS ([`OUTPUT_EPSG`], WGS84 lon/lat) written into KML.

use geo::{Coord, MapCoords, MultiPolygon, Point};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

/// CRS every downstream stage assumes after normalization.
pub const WORKING_EPSG: i32 = 3857;

/// CRS of vector documents handed to KML/KMZ serialization.
pub const OUTPUT_EPSG: i32 = 4326;

/// Web Mercator sphere radius in metres.
const MERCATOR_RADIUS: f64 = 6_378_137.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProjectionError {
    #[error("EPSG:{0} is not in the crs-definitions database")]
    UnknownCrs(i32),
    #[error("invalid projection EPSG:{epsg}: {message}")]
    InvalidProjection { epsg: i32, message: String },
    #[error("transform from EPSG:{from} to EPSG:{to} failed at ({x}, {y}): {message}")]
    Transform {
        from: i32,
        to: i32,
        x: f64,
        y: f64,
        message: String,
    },
}

/// Get PROJ4 string for an EPSG code using the crs-definitions database
#[inline]
pub fn get_proj_string(epsg: i32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Check if an EPSG code represents a geographic (lon/lat) CRS
#[inline]
#[must_use]
pub fn is_geographic_crs(epsg: i32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        epsg == 4326 || (4000..5000).contains(&epsg)
    }
}

/// Prepared transformation between two EPSG codes.
///
/// Building the `Proj` pair is the expensive part, so callers reprojecting many
/// geometries should hold on to one of these rather than calling
/// [`project_point`] repeatedly.
pub struct Reprojector {
    source_epsg: i32,
    target_epsg: i32,
    projs: Option<(Proj, Proj)>,
    source_is_geographic: bool,
    target_is_geographic: bool,
}

impl std::fmt::Debug for Reprojector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reprojector")
            .field("source_epsg", &self.source_epsg)
            .field("target_epsg", &self.target_epsg)
            .finish_non_exhaustive()
    }
}

impl Reprojector {
    /// Create a transformer between two EPSG codes.
    ///
    /// # Errors
    /// Returns an error if either code is unknown or its PROJ string is rejected.
    pub fn new(source_epsg: i32, target_epsg: i32) -> Result<Self, ProjectionError> {
        let projs = if source_epsg == target_epsg {
            None
        } else {
            Some((load_proj(source_epsg)?, load_proj(target_epsg)?))
        };
        Ok(Self {
            source_epsg,
            target_epsg,
            projs,
            source_is_geographic: is_geographic_crs(source_epsg),
            target_is_geographic: is_geographic_crs(target_epsg),
        })
    }

    #[must_use]
    pub fn source_epsg(&self) -> i32 {
        self.source_epsg
    }

    #[must_use]
    pub fn target_epsg(&self) -> i32 {
        self.target_epsg
    }

    /// Transform a single coordinate pair.
    ///
    /// # Errors
    /// Returns an error if proj4rs cannot transform the point.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), ProjectionError> {
        let Some((source, target)) = &self.projs else {
            return Ok((x, y));
        };

        // proj4rs uses radians for geographic coordinates
        let mut point = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };

        transform(source, target, &mut point).map_err(|e| ProjectionError::Transform {
            from: self.source_epsg,
            to: self.target_epsg,
            x,
            y,
            message: format!("{e:?}"),
        })?;

        if self.target_is_geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }

    /// Reproject every vertex of a multi-polygon.
    ///
    /// # Errors
    /// Fails on the first vertex that cannot be transformed.
    pub fn multi_polygon(
        &self,
        geometry: &MultiPolygon<f64>,
    ) -> Result<MultiPolygon<f64>, ProjectionError> {
        if self.projs.is_none() {
            return Ok(geometry.clone());
        }
        geometry.try_map_coords(|c| {
            let (x, y) = self.transform(c.x, c.y)?;
            Ok(Coord { x, y })
        })
    }

    /// Reproject a point.
    ///
    /// # Errors
    /// Returns an error if the point cannot be transformed.
    pub fn point(&self, point: Point<f64>) -> Result<Point<f64>, ProjectionError> {
        let (x, y) = self.transform(point.x(), point.y())?;
        Ok(Point::new(x, y))
    }
}

fn load_proj(epsg: i32) -> Result<Proj, ProjectionError> {
    let def = get_proj_string(epsg).ok_or(ProjectionError::UnknownCrs(epsg))?;
    Proj::from_proj_string(def).map_err(|e| ProjectionError::InvalidProjection {
        epsg,
        message: format!("{e:?}"),
    })
}

/// Project a single point from one CRS to another.
///
/// # Errors
/// Returns an error if the EPSG code is not supported or the transformation fails.
#[inline]
pub fn project_point(
    source_epsg: i32,
    target_epsg: i32,
    x: f64,
    y: f64,
) -> Result<(f64, f64), ProjectionError> {
    if source_epsg == target_epsg {
        return Ok((x, y));
    }
    Reprojector::new(source_epsg, target_epsg)?.transform(x, y)
}

/// Latitude in degrees of a Web Mercator northing.
#[inline]
#[must_use]
pub fn mercator_latitude(y: f64) -> f64 {
    (2.0 * (y / MERCATOR_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees()
}

/// Factor converting Web Mercator planar area to ground area at northing `y`.
///
/// Mercator inflates lengths by `1/cos(lat)`, so areas by `1/cos²(lat)`.
#[inline]
#[must_use]
pub fn mercator_area_scale(y: f64) -> f64 {
    let lat = mercator_latitude(y).to_radians();
    lat.cos() * lat.cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    const EPS: f64 = 1e-6;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn test_project_point_same_crs_is_identity() {
        let (x, y) = project_point(4326, 4326, 153.02, -27.47).unwrap();
        assert!(approx_eq(x, 153.02));
        assert!(approx_eq(y, -27.47));
    }

    #[test]
    fn test_origin_maps_to_origin() {
        let (x, y) = project_point(OUTPUT_EPSG, WORKING_EPSG, 0.0, 0.0).unwrap();
        assert!(approx_eq(x, 0.0));
        assert!(approx_eq(y, 0.0));
    }

    #[test]
    fn test_roundtrip_queensland_points() {
        let forward = Reprojector::new(OUTPUT_EPSG, WORKING_EPSG).unwrap();
        let back = Reprojector::new(WORKING_EPSG, OUTPUT_EPSG).unwrap();
        let points = [
            (153.0251, -27.4698), // Brisbane
            (145.7781, -16.9186), // Cairns
            (139.4927, -20.7256), // Mount Isa
            (146.2570, -26.5700), // Charleville-ish
        ];
        for (lon, lat) in points {
            let (x, y) = forward.transform(lon, lat).unwrap();
            assert!(y < 0.0, "southern hemisphere northing should be negative");
            let (lon2, lat2) = back.transform(x, y).unwrap();
            assert!(approx_eq(lon, lon2), "lon: {lon} != {lon2}");
            assert!(approx_eq(lat, lat2), "lat: {lat} != {lat2}");
        }
    }

    #[test]
    fn test_multi_polygon_reprojection_keeps_shape() {
        let square = MultiPolygon::new(vec![polygon![
            (x: 150.0, y: -25.0),
            (x: 150.01, y: -25.0),
            (x: 150.01, y: -25.01),
            (x: 150.0, y: -25.01),
            (x: 150.0, y: -25.0),
        ]]);
        let forward = Reprojector::new(OUTPUT_EPSG, WORKING_EPSG).unwrap();
        let projected = forward.multi_polygon(&square).unwrap();
        let ring = projected.0[0].exterior();
        assert_eq!(ring.0.len(), 5);
        assert!(ring.0[1].x > ring.0[0].x);
        assert!(ring.0[2].y < ring.0[1].y);
    }

    #[test]
    fn test_unknown_crs_is_reported() {
        let result = project_point(4326, 999_999, 0.0, 0.0);
        assert_eq!(result, Err(ProjectionError::UnknownCrs(999_999)));
    }

    #[test]
    fn test_is_geographic_crs() {
        assert!(is_geographic_crs(4326));
        assert!(is_geographic_crs(4283), "GDA94 is geographic");
        assert!(!is_geographic_crs(3857));
        assert!(!is_geographic_crs(28356), "MGA zone 56 is projected");
    }

    #[test]
    fn test_mercator_latitude_matches_projection() {
        let (_, y) = project_point(4326, 3857, 150.0, -27.5).unwrap();
        assert!((mercator_latitude(y) + 27.5).abs() < 1e-9);
        let scale = mercator_area_scale(y);
        let expected = 27.5_f64.to_radians().cos().powi(2);
        assert!((scale - expected).abs() < 1e-12);
    }
}
