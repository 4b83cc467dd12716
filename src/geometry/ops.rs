//! Polygon set operations with a canonical output form.
//!
//! Boolean ops come from `geo`. Results are snapped to a millimetre grid,
//! oriented (exterior counter-clockwise, holes clockwise), each ring rotated
//! to start at its smallest vertex, and polygons sorted. Two geometries that
//! cover the same point set after snapping therefore compare equal with `==`,
//! whatever order they were built in.

use std::cmp::Ordering;
use std::panic::{catch_unwind, AssertUnwindSafe};

use geo::orient::Direction;
use geo::{BooleanOps, Coord, LineString, MultiPolygon, Orient, Polygon};

/// Grid cells per working-CRS unit (metres).
const SNAP_GRID: f64 = 1_000.0;

#[inline]
fn snap(v: f64) -> f64 {
    (v * SNAP_GRID).round() / SNAP_GRID
}

/// True when every coordinate is finite.
#[must_use]
pub fn is_finite(geometry: &MultiPolygon<f64>) -> bool {
    geometry.0.iter().all(|p| {
        std::iter::once(p.exterior())
            .chain(p.interiors())
            .all(|ring| ring.0.iter().all(|c| c.x.is_finite() && c.y.is_finite()))
    })
}

/// Self-intersection repair: union with the empty set, which re-nodes every
/// ring, then canonicalize.
///
/// Returns `None` if the boolean op panics on malformed input.
#[must_use]
pub fn repair(geometry: &MultiPolygon<f64>) -> Option<MultiPolygon<f64>> {
    let cleaned = canonicalize(geometry);
    let empty = MultiPolygon::<f64>::new(Vec::new());
    guarded(|| cleaned.union(&empty)).map(|mp| canonicalize(&mp))
}

/// Topological union, canonicalized. `None` if the boolean op panics.
#[must_use]
pub fn union(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Option<MultiPolygon<f64>> {
    guarded(|| a.union(b)).map(|mp| canonicalize(&mp))
}

/// Intersection, canonicalized. `None` if the boolean op panics.
#[must_use]
pub fn intersection(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Option<MultiPolygon<f64>> {
    guarded(|| a.intersection(b)).map(|mp| canonicalize(&mp))
}

fn guarded<F>(op: F) -> Option<MultiPolygon<f64>>
where
    F: FnOnce() -> MultiPolygon<f64>,
{
    catch_unwind(AssertUnwindSafe(op)).ok()
}

/// Snap, orient, rotate and sort. Rings left with fewer than three distinct
/// vertices are dropped, and so are polygons whose exterior goes.
#[must_use]
pub fn canonicalize(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let oriented = geometry.orient(Direction::Default);
    let mut polygons: Vec<Polygon<f64>> = oriented
        .0
        .iter()
        .filter_map(|p| {
            let exterior = canonical_ring(p.exterior())?;
            let mut interiors: Vec<LineString<f64>> =
                p.interiors().iter().filter_map(canonical_ring).collect();
            interiors.sort_by(|a, b| ring_order(a, b));
            Some(Polygon::new(exterior, interiors))
        })
        .collect();
    polygons.sort_by(|a, b| ring_order(a.exterior(), b.exterior()));
    MultiPolygon::new(polygons)
}

fn canonical_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for c in &ring.0 {
        let snapped = Coord {
            x: snap(c.x),
            y: snap(c.y),
        };
        if coords.last() != Some(&snapped) {
            coords.push(snapped);
        }
    }
    while coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return None;
    }

    let start = coords
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| coord_order(a, b))
        .map_or(0, |(i, _)| i);
    coords.rotate_left(start);
    coords.push(coords[0]);
    Some(LineString::new(coords))
}

fn coord_order(a: &Coord<f64>, b: &Coord<f64>) -> Ordering {
    a.x.total_cmp(&b.x).then_with(|| a.y.total_cmp(&b.y))
}

fn ring_order(a: &LineString<f64>, b: &LineString<f64>) -> Ordering {
    for (ca, cb) in a.0.iter().zip(&b.0) {
        let ord = coord_order(ca, cb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.0.len().cmp(&b.0.len())
}

/// Total order over canonical geometries: polygon by polygon, ring by ring,
/// vertex by vertex.
#[must_use]
pub fn geometry_order(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Ordering {
    for (pa, pb) in a.0.iter().zip(&b.0) {
        let ord = ring_order(pa.exterior(), pb.exterior()).then_with(|| {
            pa.interiors()
                .iter()
                .zip(pb.interiors())
                .map(|(ra, rb)| ring_order(ra, rb))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or_else(|| pa.interiors().len().cmp(&pb.interiors().len()))
        });
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.0.len().cmp(&b.0.len())
}

/// Total vertex count, used for cheap ordering keys.
#[must_use]
pub fn vertex_count(geometry: &MultiPolygon<f64>) -> usize {
    geometry
        .0
        .iter()
        .map(|p| p.exterior().0.len() + p.interiors().iter().map(|r| r.0.len()).sum::<usize>())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
        ]])
    }

    #[test]
    fn test_canonical_form_ignores_start_vertex_and_winding() {
        let a = MultiPolygon::new(vec![polygon![
            (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0),
        ]]);
        let b = rect(0.0, 0.0, 10.0, 10.0);
        assert_eq!(canonicalize(&a), canonicalize(&b));
        let ring = &canonicalize(&b).0[0];
        assert_eq!(ring.exterior().0[0], Coord { x: 0.0, y: 0.0 });
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let mp = rect(0.12345, 0.0, 10.0, 5.55555);
        let once = canonicalize(&mp);
        assert_eq!(canonicalize(&once), once);
    }

    #[test]
    fn test_degenerate_rings_are_dropped() {
        let sliver = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 0.0, y: 0.0), (x: 0.0, y: 0.0), (x: 0.0, y: 0.0),
        ]]);
        assert!(canonicalize(&sliver).0.is_empty());
    }

    #[test]
    fn test_repair_bowtie_has_positive_area() {
        let bowtie = MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 10.0, y: 10.0), (x: 10.0, y: 0.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0),
        ]]);
        let repaired = repair(&bowtie).unwrap();
        assert!(repaired.unsigned_area() > 0.0);
        assert!((repaired.unsigned_area() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_union_merges_overlap() {
        let merged = union(&rect(0.0, 0.0, 10.0, 10.0), &rect(5.0, 0.0, 15.0, 10.0)).unwrap();
        assert_eq!(merged.0.len(), 1);
        assert!((merged.unsigned_area() - 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_intersection_and_finiteness() {
        let clipped = intersection(&rect(0.0, 0.0, 10.0, 10.0), &rect(5.0, 5.0, 20.0, 20.0)).unwrap();
        assert!((clipped.unsigned_area() - 25.0).abs() < 1e-6);
        assert!(is_finite(&clipped));
        assert!(!is_finite(&rect(0.0, 0.0, f64::NAN, 1.0)));
    }
}
