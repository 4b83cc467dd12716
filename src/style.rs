//! Style resolution.
//!
//! A class key maps to a colour through configured overrides first, then a
//! fixed palette indexed by a stable hash of the key. The resolver is built
//! once and shared read-only, so a key renders the same everywhere in an
//! export and across runs.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::config::StyleOverrides;
use crate::model::{ClassKey, NormalizedFeature, ThemeLayer};

/// RGB triple.
pub type Rgb = [u8; 3];

/// Colour for empty and `UNK` codes.
pub const DEFAULT_COLOR: Rgb = [0x9c, 0xa3, 0xaf];

/// Bore marker colour when the status code is unknown.
pub const DEFAULT_BORE_COLOR: Rgb = [0x38, 0xbd, 0xf8];

const PALETTE: [Rgb; 24] = [
    [0xe6, 0x19, 0x4b],
    [0x3c, 0xb4, 0x4b],
    [0xff, 0xe1, 0x19],
    [0x43, 0x63, 0xd8],
    [0xf5, 0x82, 0x31],
    [0x91, 0x1e, 0xb4],
    [0x46, 0xf0, 0xf0],
    [0xf0, 0x32, 0xe6],
    [0xbc, 0xf6, 0x0c],
    [0xfa, 0xbe, 0xbe],
    [0x00, 0x80, 0x80],
    [0xe6, 0xbe, 0xff],
    [0x9a, 0x63, 0x24],
    [0xff, 0xfa, 0xc8],
    [0x80, 0x00, 0x00],
    [0xaa, 0xff, 0xc3],
    [0x80, 0x80, 0x00],
    [0xff, 0xd8, 0xb1],
    [0x00, 0x00, 0x75],
    [0x6b, 0x8e, 0x23],
    [0xd2, 0x69, 0x1e],
    [0x4b, 0x00, 0x82],
    [0x20, 0xb2, 0xaa],
    [0xdb, 0x70, 0x93],
];

/// Resolved visual style.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Style {
    /// `#rrggbb`
    pub color_hex: String,
    /// Document-wide style id, unique per key.
    pub style_id: String,
    /// Icon asset name for point styles.
    pub icon_id: Option<String>,
}

impl Style {
    fn new(rgb: Rgb, style_id: String, icon_id: Option<String>) -> Self {
        Self {
            color_hex: to_hex(rgb),
            style_id,
            icon_id,
        }
    }

    #[must_use]
    pub fn rgb(&self) -> Rgb {
        parse_hex(&self.color_hex).unwrap_or(DEFAULT_COLOR)
    }

    /// KML `aabbggrr` colour.
    #[must_use]
    pub fn kml_color(&self, alpha: u8) -> String {
        let [r, g, b] = self.rgb();
        format!("{alpha:02x}{b:02x}{g:02x}{r:02x}")
    }
}

/// Maps class keys and bore icon keys to styles.
#[derive(Debug, Clone, Default)]
pub struct StyleResolver {
    overrides: BTreeMap<String, Rgb>,
}

impl StyleResolver {
    /// Build a resolver; invalid override colours are logged and ignored.
    #[must_use]
    pub fn new(overrides: &StyleOverrides) -> Self {
        let overrides = overrides
            .colors
            .iter()
            .filter_map(|(code, hex)| match parse_hex(hex) {
                Some(rgb) => Some((code.clone(), rgb)),
                None => {
                    warn!(code = %code, color = %hex, "Ignoring invalid colour override");
                    None
                }
            })
            .collect();
        Self { overrides }
    }

    /// Style for a polygon class.
    #[must_use]
    pub fn resolve(&self, key: &ClassKey) -> Style {
        let style_id = format!("{}_{}", key.theme.short(), slug(&key.code));
        Style::new(self.color_for(key), style_id, None)
    }

    fn color_for(&self, key: &ClassKey) -> Rgb {
        let code = key.code.trim();
        if let Some(rgb) = self.overrides.get(code) {
            return *rgb;
        }
        if code.is_empty() || code.eq_ignore_ascii_case("UNK") {
            return DEFAULT_COLOR;
        }
        palette_color(key.theme, code)
    }

    /// Style for a bore icon key such as `EX,AB`; colour follows the status.
    #[must_use]
    pub fn bore_style(&self, icon_key: &str) -> Style {
        let icon = icon_slug(icon_key);
        let status = icon_key.split(',').next().unwrap_or_default();
        Style::new(
            bore_status_color(status),
            format!("bore_{icon}"),
            Some(icon),
        )
    }
}

/// Marker colour for a bore status code.
#[must_use]
pub fn bore_status_color(status: &str) -> Rgb {
    match status.trim().to_ascii_uppercase().as_str() {
        "EX" => [0x22, 0xc5, 0x5e],
        "AU" => [0x25, 0x63, 0xeb],
        "AD" => [0xef, 0x44, 0x44],
        "IN" => [0xf5, 0x9e, 0x0b],
        _ => DEFAULT_BORE_COLOR,
    }
}

fn palette_color(theme: ThemeLayer, code: &str) -> Rgb {
    let hash = fxhash::hash64(&(theme.as_str(), code));
    let len = PALETTE.len() as u64;
    let index = usize::try_from(hash % len).unwrap_or(0);
    PALETTE[index]
}

/// Lower-case identifier fragment. Codes that are not plain upper-case
/// alphanumerics get a hash suffix so distinct codes never share an id.
fn slug(code: &str) -> String {
    let code = code.trim();
    if code.is_empty() {
        return "unk".to_string();
    }
    let cleaned: String = code
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        cleaned
    } else {
        format!("{cleaned}_{:08x}", fxhash::hash32(code))
    }
}

/// File-safe form of a bore icon key: `EX,AB` → `ex_ab`.
#[must_use]
pub fn icon_slug(icon_key: &str) -> String {
    let slug: String = icon_key
        .trim()
        .to_lowercase()
        .replace(',', "_")
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if slug.is_empty() {
        "icon".to_string()
    } else {
        slug
    }
}

#[must_use]
pub fn to_hex(rgb: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2])
}

/// Parse `#rrggbb` (leading `#` optional).
#[must_use]
pub fn parse_hex(hex: &str) -> Option<Rgb> {
    let digits = hex.trim().trim_start_matches('#');
    if digits.len() != 6 || !digits.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// One legend row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegendEntry {
    pub theme: ThemeLayer,
    pub code: String,
    pub name: String,
    pub color_hex: String,
    pub area_ha: f64,
}

/// Legend rows for `features`, one per class key, sorted by descending area
/// then code. Names come from the first feature seen for each key.
#[must_use]
pub fn build_legend<'a, I>(features: I, resolver: &StyleResolver) -> Vec<LegendEntry>
where
    I: IntoIterator<Item = &'a NormalizedFeature>,
{
    let mut rows: BTreeMap<ClassKey, LegendEntry> = BTreeMap::new();
    for feature in features {
        let key = feature.key();
        let entry = rows.entry(key.clone()).or_insert_with(|| LegendEntry {
            theme: feature.theme,
            code: feature.class.code.clone(),
            name: feature.class.name.clone(),
            color_hex: resolver.resolve(&key).color_hex,
            area_ha: 0.0,
        });
        entry.area_ha += feature.area_ha;
    }
    let mut legend: Vec<LegendEntry> = rows.into_values().collect();
    legend.sort_by(|a, b| {
        b.area_ha
            .total_cmp(&a.area_ha)
            .then_with(|| a.code.cmp(&b.code))
            .then_with(|| a.theme.cmp(&b.theme))
    });
    legend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lotplan::LotPlan;
    use crate::model::Classification;
    use geo::MultiPolygon;
    use proptest::prelude::*;

    fn key(code: &str) -> ClassKey {
        ClassKey::new(ThemeLayer::LandTypes, code)
    }

    #[test]
    fn test_unknown_codes_use_default() {
        let resolver = StyleResolver::default();
        assert_eq!(resolver.resolve(&key("")).color_hex, "#9ca3af");
        assert_eq!(resolver.resolve(&key("UNK")).color_hex, "#9ca3af");
        assert_eq!(resolver.resolve(&key("unk")).color_hex, "#9ca3af");
    }

    #[test]
    fn test_overrides_win() {
        let resolver =
            StyleResolver::new(&StyleOverrides::default().with_color("LT1", "#112233").with_color("BAD", "zz"));
        assert_eq!(resolver.resolve(&key("LT1")).color_hex, "#112233");
        assert_ne!(resolver.resolve(&key("BAD")).color_hex, "zz");
    }

    #[test]
    fn test_style_ids() {
        let resolver = StyleResolver::default();
        assert_eq!(resolver.resolve(&key("LT12")).style_id, "lt_lt12");
        assert_eq!(
            resolver.resolve(&ClassKey::new(ThemeLayer::Vegetation, "B")).style_id,
            "veg_b"
        );
        let a = resolver.resolve(&key("A-1")).style_id;
        let b = resolver.resolve(&key("A_1")).style_id;
        assert_ne!(a, b);
        assert!(a.starts_with("lt_a_1_"));
    }

    #[test]
    fn test_bore_styles() {
        let resolver = StyleResolver::default();
        let style = resolver.bore_style("EX,AB");
        assert_eq!(style.color_hex, "#22c55e");
        assert_eq!(style.style_id, "bore_ex_ab");
        assert_eq!(style.icon_id.as_deref(), Some("ex_ab"));
        assert_eq!(resolver.bore_style("ZZ,AB").color_hex, "#38bdf8");
        assert_eq!(resolver.bore_style("AD,SB").color_hex, "#ef4444");
    }

    #[test]
    fn test_hex_round_trip_and_kml_color() {
        assert_eq!(parse_hex("#a1b2c3"), Some([0xa1, 0xb2, 0xc3]));
        assert_eq!(parse_hex("a1b2c3"), Some([0xa1, 0xb2, 0xc3]));
        assert_eq!(parse_hex("#a1b2"), None);
        assert_eq!(parse_hex("#gg0000"), None);
        let style = Style::new([0x11, 0x22, 0x33], "x".into(), None);
        assert_eq!(style.kml_color(0xb3), "b3332211");
    }

    #[test]
    fn test_legend_sorted_by_area_then_code() {
        let lp = LotPlan::parse("1RP1").unwrap();
        let feature = |code: &str, name: &str, area: f64| NormalizedFeature {
            parcel: lp.clone(),
            theme: ThemeLayer::LandTypes,
            class: Classification::new(code, name),
            geometry: MultiPolygon::new(vec![]),
            ordinal: 0,
            area_ha: area,
        };
        let features = vec![
            feature("B", "Bee", 2.0),
            feature("A", "Ay", 2.0),
            feature("C", "Cee", 1.0),
            feature("C", "Other", 5.0),
        ];
        let legend = build_legend(&features, &StyleResolver::default());
        let rows: Vec<(&str, &str, f64)> = legend
            .iter()
            .map(|r| (r.code.as_str(), r.name.as_str(), r.area_ha))
            .collect();
        assert_eq!(rows, vec![("C", "Cee", 6.0), ("A", "Ay", 2.0), ("B", "Bee", 2.0)]);
    }

    proptest! {
        #[test]
        fn prop_resolve_is_deterministic(code in "[A-Za-z0-9 _-]{0,12}", veg in any::<bool>()) {
            let theme = if veg { ThemeLayer::Vegetation } else { ThemeLayer::LandTypes };
            let key = ClassKey::new(theme, code);
            let first = StyleResolver::default().resolve(&key);
            let second = StyleResolver::new(&StyleOverrides::default()).resolve(&key);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first, StyleResolver::default().resolve(&key));
        }
    }
}
