//! GeoTIFF writer for class rasters.
//!
//! Writes an RGBA8 image (class colours, transparent no-data) with
//! ModelPixelScale, ModelTiepoint and GeoKeyDirectory tags for the raster's
//! CRS. Pure Rust, no GDAL.

use std::io::{Cursor, Seek, Write};

use tiff::encoder::colortype::RGBA8;
use tiff::encoder::{Compression, DeflateLevel, TiffEncoder};
use tiff::tags::Tag;

use crate::casting::usize_to_u32;
use crate::geometry::projection::{get_proj_string, is_geographic_crs};
use crate::style::StyleResolver;

use super::{ClassRaster, GridSpec};

// GeoTIFF Tag IDs (not in standard tiff crate)
pub const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
pub const GEOTIFF_MODELTIEPOINT: u16 = 33922;
pub const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
const GEOTIFF_GEOASCIIPARAMS: u16 = 34737;

// GeoKey IDs
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

// GeoKey values
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Compression method for GeoTIFF output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GeoTiffCompression {
    /// No compression
    None,
    /// LZW compression
    Lzw,
    /// Deflate (zlib) compression; class rasters are mostly flat runs
    #[default]
    Deflate,
}

/// Error type for GeoTIFF writing operations
#[derive(Debug, thiserror::Error)]
pub enum GeoTiffWriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TIFF encoding error: {0}")]
    TiffEncode(String),
    #[error("invalid raster: {0}")]
    InvalidData(String),
}

impl From<tiff::TiffError> for GeoTiffWriteError {
    fn from(e: tiff::TiffError) -> Self {
        Self::TiffEncode(e.to_string())
    }
}

/// Builder for configuring GeoTIFF output
pub struct GeoTiffWriter<'a> {
    raster: &'a ClassRaster,
    resolver: &'a StyleResolver,
    compression: GeoTiffCompression,
}

impl<'a> GeoTiffWriter<'a> {
    #[must_use]
    pub fn new(raster: &'a ClassRaster, resolver: &'a StyleResolver) -> Self {
        Self {
            raster,
            resolver,
            compression: GeoTiffCompression::default(),
        }
    }

    #[must_use]
    pub fn compression(mut self, compression: GeoTiffCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Encode into memory.
    ///
    /// # Errors
    /// Fails if the raster is empty or TIFF encoding fails.
    pub fn to_bytes(self) -> Result<Vec<u8>, GeoTiffWriteError> {
        let mut buffer = Cursor::new(Vec::new());
        self.write_to(&mut buffer)?;
        Ok(buffer.into_inner())
    }

    /// Write to any writer that implements Write + Seek
    ///
    /// # Errors
    /// Fails if the raster is empty or TIFF encoding fails.
    pub fn write_to<W: Write + Seek>(self, writer: W) -> Result<(), GeoTiffWriteError> {
        let grid = &self.raster.grid;
        if grid.width == 0 || grid.height == 0 || self.raster.cells.len() != grid.cell_count() {
            return Err(GeoTiffWriteError::InvalidData(format!(
                "{}x{} grid with {} cells",
                grid.width,
                grid.height,
                self.raster.cells.len()
            )));
        }
        let width = usize_to_u32(grid.width).map_err(GeoTiffWriteError::InvalidData)?;
        let height = usize_to_u32(grid.height).map_err(GeoTiffWriteError::InvalidData)?;

        let compression = match self.compression {
            GeoTiffCompression::None => Compression::Uncompressed,
            GeoTiffCompression::Lzw => Compression::Lzw,
            GeoTiffCompression::Deflate => Compression::Deflate(DeflateLevel::Fast),
        };

        let mut encoder = TiffEncoder::new(writer)?.with_compression(compression);
        let rgba = self.raster.to_rgba(self.resolver);
        let mut image = encoder.new_image::<RGBA8>(width, height)?;
        write_geotiff_tags(image.encoder(), grid)?;
        image.write_data(&rgba)?;
        Ok(())
    }
}

impl ClassRaster {
    /// Encode as a deflate-compressed RGBA GeoTIFF.
    ///
    /// # Errors
    /// Fails if the raster is empty or TIFF encoding fails.
    pub fn to_geotiff_bytes(&self, resolver: &StyleResolver) -> Result<Vec<u8>, GeoTiffWriteError> {
        GeoTiffWriter::new(self, resolver).to_bytes()
    }
}

fn write_geotiff_tags<W: Write + Seek, K: tiff::encoder::TiffKind>(
    dir: &mut tiff::encoder::DirectoryEncoder<W, K>,
    grid: &GridSpec,
) -> Result<(), GeoTiffWriteError> {
    // ModelPixelScale: [ScaleX, ScaleY, ScaleZ]
    let pixel_scale = [grid.pixel_width, grid.pixel_height, 0.0];
    dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), pixel_scale.as_slice())?;

    // ModelTiepoint: raster (0, 0) is the world's (minx, maxy)
    let tiepoint = [0.0, 0.0, 0.0, grid.extent.minx, grid.extent.maxy, 0.0];
    dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), tiepoint.as_slice())?;

    let geokeys = build_geokey_directory(grid.epsg);
    dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), geokeys.as_slice())?;

    if let Some(proj_string) = get_proj_string(grid.epsg) {
        let ascii_params = format!("{proj_string}|");
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOASCIIPARAMS), ascii_params.as_bytes())?;
    }
    Ok(())
}

/// `[version, revision, minor, count, (key, location, count, value)*]`
fn build_geokey_directory(epsg: i32) -> Vec<u16> {
    let is_geographic = is_geographic_crs(epsg);
    let code = u16::try_from(epsg).unwrap_or(0);

    let mut keys = vec![1, 1, 0, 3];
    keys.extend_from_slice(&[
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        if is_geographic {
            MODEL_TYPE_GEOGRAPHIC
        } else {
            MODEL_TYPE_PROJECTED
        },
    ]);
    keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);
    if is_geographic {
        keys.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, code]);
    } else {
        keys.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, code]);
    }
    keys
}
