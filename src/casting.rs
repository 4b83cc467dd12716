//! Checked numeric conversions used by the rasterizer and encoders.
//!
//! Raster dimensions are bounded by [`crate::config::RasterOptions::MAX_PX`],
//! so `usize` ↔ `f64` conversions of pixel counts are exact. Float to index
//! conversions still need bounds checks because world coordinates may fall
//! outside the grid.

use std::convert::TryFrom;

/// Convert a `usize` to `u32`, failing on overflow.
///
/// # Errors
/// Returns an error string if the value exceeds `u32::MAX`.
#[inline]
pub fn usize_to_u32(value: usize) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("Value {value} exceeds u32 maximum"))
}

/// Convert a pixel count to `f64`.
#[inline]
#[must_use]
pub fn pixels_to_f64(value: usize) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    {
        value as f64
    }
}

/// Round a positive float to a pixel count of at least one.
///
/// Non-finite and non-positive inputs give one pixel.
#[inline]
#[must_use]
pub fn f64_to_pixel_count(value: f64) -> usize {
    if !value.is_finite() || value < 1.0 {
        return 1;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let count = value.round() as usize;
    count.max(1)
}

/// Convert a float to a pixel index, returning `None` if out of bounds.
///
/// `max_value` is exclusive. Negative, NaN and too-large values give `None`.
#[inline]
#[must_use]
pub fn f64_to_pixel_index(value: f64, max_value: usize) -> Option<usize> {
    if value.is_nan() || value < 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = value as usize;
    if index >= max_value {
        None
    } else {
        Some(index)
    }
}

/// First pixel column whose centre lies at or right of `value`, clamped to
/// `0..=max_value`.
///
/// Used by scanline fill: a span `[x0, x1)` in pixel space covers the pixels
/// whose centres `i + 0.5` satisfy `x0 <= i + 0.5 < x1`.
#[inline]
#[must_use]
pub fn f64_to_span_start(value: f64, max_value: usize) -> usize {
    if value.is_nan() {
        return max_value;
    }
    let start = (value - 0.5).ceil();
    if start <= 0.0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = start.min(pixels_to_f64(max_value)) as usize;
    index
}
