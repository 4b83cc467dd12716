//! KML and KMZ serialization of a [`DocumentTree`].

use std::fmt::{self, Write as _};
use std::io::{Cursor, Write as _};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use geo::{LineString, MultiPolygon, Polygon};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{DocumentTree, Folder, Placemark, PlacemarkGeometry};
use crate::bores::render_icon;
use crate::error::Result;
use crate::style::Style;

/// Fill opacity for class polygons.
const FILL_ALPHA: u8 = 0x99;

/// Escape the five XML special characters.
#[must_use]
pub fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// How marker icons are referenced from `<IconStyle>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconRefs {
    /// `icons/<id>.png`, shipped alongside `doc.kml` in a KMZ.
    Archive,
    /// `data:image/png;base64,...`, for standalone KML.
    Inline,
}

/// Archive path of a marker icon.
#[must_use]
pub fn icon_path(icon_id: &str) -> String {
    format!("icons/{icon_id}.png")
}

/// Serialize `tree` as a KML document.
///
/// # Errors
/// Fails if an inline icon cannot be encoded.
pub fn to_kml(tree: &DocumentTree, icons: IconRefs) -> Result<String> {
    let mut out = String::new();
    out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    out.push('\n');
    out.push_str(r#"<kml xmlns="http://www.opengis.net/kml/2.2">"#);
    out.push_str("<Document>");
    write!(out, "<name>{}</name>", escape_xml(&tree.name))?;
    for style in tree.styles.values() {
        write_style(&mut out, tree, style, icons)?;
    }
    for folder in &tree.folders {
        write_folder(&mut out, folder)?;
    }
    out.push_str("</Document></kml>\n");
    Ok(out)
}

/// Serialize `tree` as a KMZ archive: `doc.kml` plus `icons/*.png`.
///
/// # Errors
/// Fails if an icon cannot be encoded or the archive cannot be written.
pub fn to_kmz(tree: &DocumentTree) -> Result<Vec<u8>> {
    let kml = to_kml(tree, IconRefs::Archive)?;
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file("doc.kml", options)?;
    zip.write_all(kml.as_bytes())?;
    for (icon_id, rgb) in &tree.icons {
        zip.start_file(icon_path(icon_id), options)?;
        zip.write_all(&render_icon(*rgb)?)?;
    }
    Ok(zip.finish()?.into_inner())
}

fn write_style(out: &mut String, tree: &DocumentTree, style: &Style, icons: IconRefs) -> Result<()> {
    write!(out, r#"<Style id="{}">"#, escape_xml(&style.style_id))?;
    match &style.icon_id {
        Some(icon_id) => {
            let href = match icons {
                IconRefs::Archive => icon_path(icon_id),
                IconRefs::Inline => {
                    let rgb = tree.icons.get(icon_id).copied().unwrap_or_else(|| style.rgb());
                    format!("data:image/png;base64,{}", STANDARD.encode(render_icon(rgb)?))
                }
            };
            write!(
                out,
                "<IconStyle><scale>1.0</scale><Icon><href>{}</href></Icon></IconStyle>\
                 <LabelStyle><scale>0.8</scale></LabelStyle>",
                escape_xml(&href)
            )?;
        }
        None => {
            write!(
                out,
                "<LineStyle><color>{}</color><width>1.5</width></LineStyle>\
                 <PolyStyle><color>{}</color><fill>1</fill><outline>1</outline></PolyStyle>",
                style.kml_color(0xff),
                style.kml_color(FILL_ALPHA)
            )?;
        }
    }
    out.push_str("</Style>");
    Ok(())
}

fn write_folder(out: &mut String, folder: &Folder) -> fmt::Result {
    write!(out, "<Folder><name>{}</name>", escape_xml(&folder.name))?;
    for placemark in &folder.placemarks {
        write_placemark(out, placemark)?;
    }
    for child in &folder.folders {
        write_folder(out, child)?;
    }
    out.push_str("</Folder>");
    Ok(())
}

fn write_placemark(out: &mut String, placemark: &Placemark) -> fmt::Result {
    write!(
        out,
        "<Placemark><name>{}</name><styleUrl>#{}</styleUrl>",
        escape_xml(&placemark.name),
        escape_xml(&placemark.style_id)
    )?;
    if let Some(description) = &placemark.description {
        write!(
            out,
            "<description><![CDATA[{}]]></description>",
            description.replace("]]>", "]]]]><![CDATA[>")
        )?;
    }
    match &placemark.geometry {
        PlacemarkGeometry::Point(p) => {
            write!(out, "<Point><coordinates>{:.7},{:.7},0</coordinates></Point>", p.x(), p.y())?;
        }
        PlacemarkGeometry::Polygons(mp) => write_multi_polygon(out, mp)?,
    }
    out.push_str("</Placemark>");
    Ok(())
}

fn write_multi_polygon(out: &mut String, mp: &MultiPolygon<f64>) -> fmt::Result {
    if let [single] = mp.0.as_slice() {
        return write_polygon(out, single);
    }
    out.push_str("<MultiGeometry>");
    for polygon in &mp.0 {
        write_polygon(out, polygon)?;
    }
    out.push_str("</MultiGeometry>");
    Ok(())
}

fn write_polygon(out: &mut String, polygon: &Polygon<f64>) -> fmt::Result {
    out.push_str("<Polygon><outerBoundaryIs>");
    write_ring(out, polygon.exterior())?;
    out.push_str("</outerBoundaryIs>");
    for hole in polygon.interiors() {
        out.push_str("<innerBoundaryIs>");
        write_ring(out, hole)?;
        out.push_str("</innerBoundaryIs>");
    }
    out.push_str("</Polygon>");
    Ok(())
}

fn write_ring(out: &mut String, ring: &LineString<f64>) -> fmt::Result {
    out.push_str("<LinearRing><coordinates>");
    for (i, c) in ring.0.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write!(out, "{:.7},{:.7},0", c.x, c.y)?;
    }
    out.push_str("</coordinates></LinearRing>");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::BORE_FOLDER;
    use crate::style::StyleResolver;
    use crate::model::{ClassKey, ThemeLayer};
    use geo::{polygon, Point};
    use std::collections::BTreeMap;
    use std::io::Read;

    fn tree() -> DocumentTree {
        let resolver = StyleResolver::default();
        let class = resolver.resolve(&ClassKey::new(ThemeLayer::LandTypes, "LT1"));
        let bore = resolver.bore_style("EX,AB");
        let mut styles = BTreeMap::new();
        styles.insert(class.style_id.clone(), class.clone());
        styles.insert(bore.style_id.clone(), bore.clone());
        let mut icons = BTreeMap::new();
        icons.insert("ex_ab".to_string(), bore.rgb());

        let square = MultiPolygon::new(vec![polygon![
            (x: 144.0, y: -23.0), (x: 144.1, y: -23.0), (x: 144.1, y: -22.9), (x: 144.0, y: -23.0),
        ]]);
        let mut lt = Folder::new("Land Types");
        lt.placemarks.push(Placemark {
            name: "LT1 – Brigalow & <gidgee>".to_string(),
            style_id: class.style_id.clone(),
            description: None,
            geometry: PlacemarkGeometry::Polygons(square),
        });
        let mut bores = Folder::new(BORE_FOLDER);
        bores.placemarks.push(Placemark {
            name: "RN1".to_string(),
            style_id: bore.style_id.clone(),
            description: Some("<b>Status:</b> EX".to_string()),
            geometry: PlacemarkGeometry::Point(Point::new(144.05, -22.95)),
        });
        let mut parcel = Folder::new("1RP1");
        parcel.folders = vec![lt, bores];
        DocumentTree {
            name: "QLD Export – 1RP1".to_string(),
            styles,
            icons,
            folders: vec![parcel],
        }
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml(r#"a&b<c>"d"'e"#), "a&amp;b&lt;c&gt;&quot;d&quot;&apos;e");
        assert_eq!(escape_xml("plain"), "plain");
    }

    #[test]
    fn test_kml_structure() {
        let kml = to_kml(&tree(), IconRefs::Archive).unwrap();
        assert!(kml.starts_with("<?xml"));
        assert!(kml.contains("<name>QLD Export – 1RP1</name>"));
        assert!(kml.contains("<name>LT1 – Brigalow &amp; &lt;gidgee&gt;</name>"));
        assert!(kml.contains("<href>icons/ex_ab.png</href>"));
        assert!(kml.contains(r#"<Style id="lt_lt1">"#));
        assert!(kml.contains("<styleUrl>#bore_ex_ab</styleUrl>"));
        assert!(kml.contains("<Point><coordinates>144.0500000,-22.9500000,0</coordinates></Point>"));
        assert!(kml.contains("<description><![CDATA[<b>Status:</b> EX]]></description>"));
        assert!(kml.contains("<Folder><name>Groundwater Bores</name>"));
        assert!(kml.trim_end().ends_with("</Document></kml>"));
    }

    #[test]
    fn test_folder_writer_nests_and_reports_errors() {
        let mut out = String::new();
        write_folder(&mut out, &tree().folders[0]).unwrap();
        assert!(out.starts_with("<Folder><name>1RP1</name><Folder><name>"));
        assert_eq!(out.matches("<Folder>").count(), out.matches("</Folder>").count());
        assert_eq!(out.matches("<Placemark>").count(), 2);

        let err = crate::error::ExportError::from(fmt::Error);
        assert!(matches!(err, crate::error::ExportError::Format(_)));
    }

    #[test]
    fn test_inline_icons_are_data_uris() {
        let kml = to_kml(&tree(), IconRefs::Inline).unwrap();
        assert!(kml.contains("<href>data:image/png;base64,iVBORw0KGgo"));
        assert!(!kml.contains("icons/ex_ab.png"));
    }

    #[test]
    fn test_kmz_contains_doc_and_icons() {
        let bytes = to_kmz(&tree()).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"doc.kml".to_string()));
        assert!(names.contains(&"icons/ex_ab.png".to_string()));

        let mut doc = String::new();
        archive.by_name("doc.kml").unwrap().read_to_string(&mut doc).unwrap();
        assert!(doc.contains("icons/ex_ab.png"));
    }
}
