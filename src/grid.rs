// Planar grid geometry for patches.
//
// Geographic projections live outside the engine; a patch cell is a
// square identified by its (col, row) moment, with distances in
// meters between cell centers. The moment is the immutable snapshot
// geometries are built from and patch keys hash.

use std::collections::BTreeMap;

use bigdecimal::{BigDecimal, FromPrimitive};

use crate::error::{arithmetic, EngineResult};
use crate::units::Units;
use crate::value::EngineValue;

/// The immutable snapshot a geometry is constructed from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeoMoment {
    pub col: u32,
    pub row: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    moment: GeoMoment,
    edge_meters: f64,
}

impl Geometry {
    pub fn from_moment(moment: GeoMoment, edge_meters: f64) -> Geometry {
        Geometry {
            moment,
            edge_meters,
        }
    }

    pub fn moment(&self) -> GeoMoment {
        self.moment
    }

    /// Cell center in meters from the grid origin.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.moment.col as f64 + 0.5) * self.edge_meters,
            (self.moment.row as f64 + 0.5) * self.edge_meters,
        )
    }

    /// Whether the other geometry's center lies within `distance`
    /// meters of this one's, inclusive.
    pub fn within(&self, other: &Geometry, distance_meters: f64) -> bool {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        let dx = ax - bx;
        let dy = ay - by;
        (dx * dx + dy * dy).sqrt() <= distance_meters
    }

    pub fn area(&self) -> EngineResult<EngineValue> {
        let area = BigDecimal::from_f64(self.edge_meters * self.edge_meters)
            .ok_or_else(|| arithmetic("geometry area out of range"))?;
        Ok(EngineValue::Decimal(area, Units::parse("m * m")?))
    }

    pub fn length(&self) -> EngineResult<EngineValue> {
        let edge = BigDecimal::from_f64(self.edge_meters)
            .ok_or_else(|| arithmetic("geometry edge out of range"))?;
        Ok(EngineValue::Decimal(edge, Units::atom("m")))
    }
}

/// Stable identity for a patch across replicates: simulation,
/// canonical geometry moment, patch type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatchKey {
    pub simulation: String,
    pub moment: GeoMoment,
    pub patch_type: String,
}

/// Row-major grid construction from the simulation's meta-attributes.
pub fn build_grid(width: u32, height: u32, edge_meters: f64) -> Vec<Geometry> {
    let mut cells = Vec::with_capacity((width as usize) * (height as usize));
    for row in 0..height {
        for col in 0..width {
            cells.push(Geometry::from_moment(GeoMoment { col, row }, edge_meters));
        }
    }
    cells
}

/// Frozen per-patch snapshots used by cross-patch spatial queries.
/// Built once at the top of each step from prior-timeline snapshots,
/// so parallel shards read it without coordination.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    patches: Vec<IndexedPatch>,
}

#[derive(Debug)]
struct IndexedPatch {
    geometry: Geometry,
    snapshot: crate::entity::Snapshot,
    members: BTreeMap<String, Vec<crate::entity::Snapshot>>,
}

impl SpatialIndex {
    pub fn new() -> SpatialIndex {
        SpatialIndex::default()
    }

    pub fn push_patch(
        &mut self,
        geometry: Geometry,
        snapshot: crate::entity::Snapshot,
        members: BTreeMap<String, Vec<crate::entity::Snapshot>>,
    ) {
        self.patches.push(IndexedPatch {
            geometry,
            snapshot,
            members,
        });
    }

    /// Snapshots of `entity_type` members in patches within
    /// `distance_meters` of `origin`, excluding the patch at
    /// `skip_moment` (the live patch supplies its own members).
    pub fn members_within(
        &self,
        origin: &Geometry,
        distance_meters: f64,
        entity_type: &str,
        skip_moment: GeoMoment,
    ) -> Vec<crate::entity::Snapshot> {
        let mut found = Vec::new();
        for patch in &self.patches {
            if patch.geometry.moment() == skip_moment {
                continue;
            }
            if !origin.within(&patch.geometry, distance_meters) {
                continue;
            }
            if let Some(list) = patch.members.get(entity_type) {
                found.extend(list.iter().cloned());
            }
        }
        found
    }

    /// Snapshots of patches within range, the live patch excluded.
    pub fn patch_snapshots_within(
        &self,
        origin: &Geometry,
        distance_meters: f64,
        skip_moment: GeoMoment,
    ) -> Vec<crate::entity::Snapshot> {
        self.patches
            .iter()
            .filter(|p| {
                p.geometry.moment() != skip_moment
                    && origin.within(&p.geometry, distance_meters)
            })
            .map(|p| p.snapshot.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_is_row_major() {
        let grid = build_grid(3, 2, 10.0);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[0].moment(), GeoMoment { col: 0, row: 0 });
        assert_eq!(grid[1].moment(), GeoMoment { col: 1, row: 0 });
        assert_eq!(grid[3].moment(), GeoMoment { col: 0, row: 1 });
    }

    #[test]
    fn test_within_is_inclusive() {
        let a = Geometry::from_moment(GeoMoment { col: 0, row: 0 }, 10.0);
        let b = Geometry::from_moment(GeoMoment { col: 1, row: 0 }, 10.0);
        assert!(a.within(&b, 10.0));
        assert!(!a.within(&b, 9.9));
        assert!(a.within(&a, 0.0));
    }

    #[test]
    fn test_area_and_length_units() {
        let g = Geometry::from_moment(GeoMoment { col: 0, row: 0 }, 10.0);
        assert_eq!(g.length().unwrap().units(), Units::atom("m"));
        assert_eq!(
            g.area().unwrap().units(),
            Units::parse("m * m").unwrap()
        );
    }
}
