//! Vector document builder.
//!
//! Turns merged class layers and bores into a folder tree of styled
//! placemarks in the output CRS. The tree is format-neutral; [`kml`] turns it
//! into KML text or a KMZ archive.

pub mod kml;

use std::collections::BTreeMap;

use geo::{MultiPolygon, Point};
use tracing::debug;

use crate::bores::describe;
use crate::error::Result;
use crate::geometry::projection::{Reprojector, OUTPUT_EPSG, WORKING_EPSG};
use crate::lotplan::LotPlan;
use crate::merge::{MergeResult, MergedClassLayer};
use crate::model::{BorePoint, ThemeLayer};
use crate::style::{Rgb, Style, StyleResolver};

/// Folder holding bore markers.
pub const BORE_FOLDER: &str = "Groundwater Bores";

/// Placemark geometry, in [`OUTPUT_EPSG`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlacemarkGeometry {
    Polygons(MultiPolygon<f64>),
    Point(Point<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placemark {
    pub name: String,
    pub style_id: String,
    /// HTML balloon text, already escaped where needed.
    pub description: Option<String>,
    pub geometry: PlacemarkGeometry,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Folder {
    pub name: String,
    pub folders: Vec<Folder>,
    pub placemarks: Vec<Placemark>,
}

impl Folder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.placemarks.is_empty() && self.folders.iter().all(Folder::is_empty)
    }

    /// Find a direct child folder by name.
    #[must_use]
    pub fn folder(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    /// Placemarks in this folder and all descendants, depth first.
    pub fn all_placemarks(&self) -> Box<dyn Iterator<Item = &Placemark> + '_> {
        Box::new(
            self.placemarks
                .iter()
                .chain(self.folders.iter().flat_map(Folder::all_placemarks)),
        )
    }
}

/// Styled document ready for serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentTree {
    pub name: String,
    /// Styles referenced by placemarks, keyed by style id.
    pub styles: BTreeMap<String, Style>,
    /// Marker icons to ship with the document, keyed by icon id.
    pub icons: BTreeMap<String, Rgb>,
    pub folders: Vec<Folder>,
}

impl DocumentTree {
    #[must_use]
    pub fn folder(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn placemarks(&self) -> impl Iterator<Item = &Placemark> {
        self.folders.iter().flat_map(Folder::all_placemarks)
    }
}

/// Assembles a [`DocumentTree`], reprojecting from the working CRS into the
/// output CRS as placemarks are added.
pub struct DocumentBuilder<'a> {
    name: String,
    resolver: &'a StyleResolver,
    reprojector: Reprojector,
    styles: BTreeMap<String, Style>,
    icons: BTreeMap<String, Rgb>,
    folders: Vec<Folder>,
}

impl<'a> DocumentBuilder<'a> {
    /// # Errors
    /// Fails if the working-to-output transformation cannot be set up.
    pub fn new(name: impl Into<String>, resolver: &'a StyleResolver) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            resolver,
            reprojector: Reprojector::new(WORKING_EPSG, OUTPUT_EPSG)?,
            styles: BTreeMap::new(),
            icons: BTreeMap::new(),
            folders: Vec::new(),
        })
    }

    /// Add a folder for one parcel, with a subfolder per theme holding that
    /// parcel's merged classes and, when given, a bore folder.
    ///
    /// # Errors
    /// Fails if a geometry cannot be reprojected.
    pub fn add_parcel(
        &mut self,
        lotplan: &LotPlan,
        merged: &MergeResult,
        themes: &[ThemeLayer],
        bores: Option<&[BorePoint]>,
    ) -> Result<()> {
        let mut folder = Folder::new(lotplan.to_string());
        for theme in themes {
            let mut sub = Folder::new(theme.title());
            sub.placemarks = self.class_placemarks(merged, *theme)?;
            folder.folders.push(sub);
        }
        if let Some(bores) = bores.filter(|b| !b.is_empty()) {
            folder.folders.push(self.bore_folder(bores)?);
        }
        debug!(lotplan = %lotplan, placemarks = folder.all_placemarks().count(), "Parcel folder built");
        self.folders.push(folder);
        Ok(())
    }

    /// Add the cross-parcel folder for `theme`.
    ///
    /// # Errors
    /// Fails if a geometry cannot be reprojected.
    pub fn add_merged(&mut self, merged: &MergeResult, theme: ThemeLayer) -> Result<()> {
        let mut folder = Folder::new(theme.merged_title());
        folder.placemarks = self.class_placemarks(merged, theme)?;
        self.folders.push(folder);
        Ok(())
    }

    #[must_use]
    pub fn finish(self) -> DocumentTree {
        DocumentTree {
            name: self.name,
            styles: self.styles,
            icons: self.icons,
            folders: self.folders,
        }
    }

    fn class_placemarks(&mut self, merged: &MergeResult, theme: ThemeLayer) -> Result<Vec<Placemark>> {
        let mut layers: Vec<&MergedClassLayer> =
            merged.layers.values().filter(|l| l.key.theme == theme).collect();
        layers.sort_by(|a, b| b.area_ha.total_cmp(&a.area_ha).then_with(|| a.key.cmp(&b.key)));

        layers
            .into_iter()
            .map(|layer| {
                let style = self.resolver.resolve(&layer.key);
                let style_id = style.style_id.clone();
                self.styles.entry(style_id.clone()).or_insert(style);
                Ok(Placemark {
                    name: placemark_name(&layer.key.code, &layer.name),
                    style_id,
                    description: Some(format!(
                        "<b>Code:</b> {}<br/><b>Name:</b> {}<br/><b>Area:</b> {:.2} ha",
                        kml::escape_xml(&layer.key.code),
                        kml::escape_xml(&layer.name),
                        layer.area_ha
                    )),
                    geometry: PlacemarkGeometry::Polygons(
                        self.reprojector.multi_polygon(&layer.geometry)?,
                    ),
                })
            })
            .collect()
    }

    fn bore_folder(&mut self, bores: &[BorePoint]) -> Result<Folder> {
        let mut folder = Folder::new(BORE_FOLDER);
        for bore in bores {
            let style = self
                .resolver
                .bore_style(bore.icon_key.as_deref().unwrap_or("unknown"));
            if let Some(icon) = &style.icon_id {
                self.icons.insert(icon.clone(), style.rgb());
            }
            let style_id = style.style_id.clone();
            self.styles.entry(style_id.clone()).or_insert(style);

            let description = describe(bore);
            folder.placemarks.push(Placemark {
                name: bore.bore_number.clone(),
                style_id,
                description: (!description.is_empty()).then_some(description),
                geometry: PlacemarkGeometry::Point(self.reprojector.point(bore.location)?),
            });
        }
        Ok(folder)
    }
}

fn placemark_name(code: &str, name: &str) -> String {
    if name.is_empty() || name == code {
        code.to_string()
    } else {
        format!("{code} – {name}")
    }
}
