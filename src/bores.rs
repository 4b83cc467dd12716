//! Groundwater bores: attribute normalization, parcel selection and marker
//! icons.

use std::collections::HashSet;

use chrono::DateTime;
use geo::{Geometry, Intersects, MultiPolygon};
use serde_json::Value;

use crate::config::FieldMapping;
use crate::document::kml::escape_xml;
use crate::geometry::Extent;
use crate::model::BorePoint;
use crate::source::RawFeature;
use crate::style::Rgb;

/// Marker icon edge length in pixels.
pub const ICON_SIZE: u32 = 32;

/// Upper-case a bore number and strip all whitespace: `" rn 0123 "` →
/// `"RN0123"`.
#[must_use]
pub fn normalize_bore_number(raw: &str) -> Option<String> {
    let number: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();
    (!number.is_empty()).then_some(number)
}

/// `STATUS,TYPE`, or `None` when either code is missing.
#[must_use]
pub fn make_icon_key(status: Option<&str>, bore_type: Option<&str>) -> Option<String> {
    let status = status.map(str::trim).filter(|s| !s.is_empty())?;
    let bore_type = bore_type.map(str::trim).filter(|s| !s.is_empty())?;
    Some(format!(
        "{},{}",
        status.to_ascii_uppercase(),
        bore_type.to_ascii_uppercase()
    ))
}

/// Drill date as `YYYY-MM-DD`. Accepts epoch milliseconds (number or numeric
/// string) and ISO-like strings.
#[must_use]
pub fn normalize_drill_date(value: &Value) -> Option<String> {
    let from_millis = |ms: i64| {
        DateTime::from_timestamp_millis(ms).map(|dt| dt.format("%Y-%m-%d").to_string())
    };
    match value {
        Value::Number(n) => {
            #[allow(clippy::cast_possible_truncation)]
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            from_millis(ms)
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(ms) = s.parse::<i64>() {
                return from_millis(ms);
            }
            let date = s.get(..10).unwrap_or(s);
            Some(date.to_string())
        }
        _ => None,
    }
}

/// Build a [`BorePoint`] from a raw point feature in `epsg`. Features without
/// a point geometry or a bore number are dropped.
#[must_use]
pub fn bore_from_raw(raw: &RawFeature, epsg: i32, fields: &FieldMapping) -> Option<BorePoint> {
    let Some(Geometry::Point(location)) = raw.geometry else {
        return None;
    };
    let number = raw.first_text(&["bore_number", fields.bore_number.as_str(), "rn", "rn_char"])?;
    let bore_number = normalize_bore_number(&number)?;

    let status = raw.first_text(&["status", "status_code", fields.bore_status_code.as_str()]);
    let status_label =
        raw.first_text(&["status_label", fields.bore_status_label.as_str(), "statusLabel"]);
    let bore_type = raw.first_text(&["type", "type_code", fields.bore_type_code.as_str()]);
    let type_label = raw.first_text(&["type_label", fields.bore_type_label.as_str(), "typeLabel"]);
    let drilled_date = ["drilled_date", fields.bore_drill_date.as_str()]
        .iter()
        .find_map(|f| raw.properties.get(*f).and_then(normalize_drill_date));
    let report_url = raw.first_text(&["report_url", fields.bore_report_url.as_str()]);
    let icon_key = raw
        .text("icon_key")
        .or_else(|| make_icon_key(status.as_deref(), bore_type.as_deref()));

    Some(BorePoint {
        bore_number,
        status_label: status_label.or_else(|| status.clone()),
        status,
        type_label: type_label.or_else(|| bore_type.clone()),
        bore_type,
        drilled_date,
        report_url,
        icon_key,
        location,
        epsg,
    })
}

/// Bores that fall inside `boundary`, first occurrence of each bore number
/// kept. Points and boundary must share a CRS.
#[must_use]
pub fn select_bores(bores: &[BorePoint], boundary: &MultiPolygon<f64>) -> Vec<BorePoint> {
    let Some(extent) = Extent::of(boundary) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    bores
        .iter()
        .filter(|b| extent.contains_point(b.location.x(), b.location.y()))
        .filter(|b| boundary.intersects(&b.location))
        .filter(|b| seen.insert(b.bore_number.clone()))
        .cloned()
        .collect()
}

/// HTML balloon text: status, type, drill date and report link, escaped.
#[must_use]
pub fn describe(bore: &BorePoint) -> String {
    fn combine(label: Option<&str>, code: Option<&str>) -> Option<String> {
        let label = label.map(str::trim).filter(|s| !s.is_empty());
        let code = code.map(str::trim).filter(|s| !s.is_empty());
        match (label, code) {
            (Some(l), Some(c)) if !l.eq_ignore_ascii_case(c) => Some(format!("{l} ({c})")),
            (Some(l), _) => Some(l.to_string()),
            (None, c) => c.map(str::to_string),
        }
    }

    let mut parts = Vec::new();
    if let Some(status) = combine(bore.status_label.as_deref(), bore.status.as_deref()) {
        parts.push(format!("<b>Status:</b> {}", escape_xml(&status)));
    }
    if let Some(kind) = combine(bore.type_label.as_deref(), bore.bore_type.as_deref()) {
        parts.push(format!("<b>Type:</b> {}", escape_xml(&kind)));
    }
    if let Some(drilled) = &bore.drilled_date {
        parts.push(format!("<b>Drilled:</b> {}", escape_xml(drilled)));
    }
    if let Some(url) = &bore.report_url {
        parts.push(format!(
            r#"<a href="{}" target="_blank" rel="noopener">View bore report</a>"#,
            escape_xml(url)
        ));
    }
    parts.join("<br/>")
}

/// Render a round marker in `color` with a white rim as PNG bytes.
///
/// # Errors
/// Returns an error if PNG encoding fails.
pub fn render_icon(color: Rgb) -> Result<Vec<u8>, png::EncodingError> {
    let size = ICON_SIZE as usize;
    let center = f64::from(ICON_SIZE) / 2.0;
    let outer = center - 2.0;
    let inner = outer - 3.0;

    let mut rgba = vec![0_u8; size * size * 4];
    for (i, pixel) in rgba.chunks_exact_mut(4).enumerate() {
        let (row, col) = (i / size, i % size);
        let dx = crate::casting::pixels_to_f64(col) + 0.5 - center;
        let dy = crate::casting::pixels_to_f64(row) + 0.5 - center;
        let d = dx.hypot(dy);
        if d <= inner {
            pixel.copy_from_slice(&[color[0], color[1], color[2], 255]);
        } else if d <= outer {
            pixel.copy_from_slice(&[255, 255, 255, 255]);
        }
    }

    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, ICON_SIZE, ICON_SIZE);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&rgba)?;
        writer.finish()?;
    }
    Ok(buf)
}
