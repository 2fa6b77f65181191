//! The "SPACE" Node - Uniform 2D grid for proximity relevance
//!
//! The world is cut into square cells of `cell_size`, with cell (0, 0)
//! starting at the configured bias. Each cell keeps two lists:
//! - static: entities that never move (and dormancy entities while dormant)
//! - dynamic: entities that move (and dormancy entities while awake)
//!
//! Re-bucketing of moved entities happens once per tick in
//! [`SpatialGrid::prepare`], so gathers never mutate the grid.

use crate::config::SpatialConfig;
use crate::connection::NetViewer;
use crate::error::RouteError;
use crate::node::{GatherParams, GlobalGraphNode};
use nalgebra::Vector3;
use repgraph_env::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Cap on the cell ring radius walked per viewer.
const MAX_CELL_RANGE: i64 = 1024;

/// Integer cell coordinate. Negative values are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridEntryKind {
    Static,
    Dynamic,
    Dormancy { dormant: bool },
}

impl GridEntryKind {
    /// Which list of a cell the entry lives in.
    fn in_static_list(self) -> bool {
        match self {
            GridEntryKind::Static => true,
            GridEntryKind::Dynamic => false,
            GridEntryKind::Dormancy { dormant } => dormant,
        }
    }

    fn same_route(self, other: GridEntryKind) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }

    fn route_name(self) -> &'static str {
        match self {
            GridEntryKind::Static => "spatial grid (static)",
            GridEntryKind::Dynamic => "spatial grid (dynamic)",
            GridEntryKind::Dormancy { .. } => "spatial grid (dormancy)",
        }
    }
}

#[derive(Debug, Clone)]
struct GridEntry {
    kind: GridEntryKind,
    cell: CellCoord,
    position: Vector3<f64>,
    cull_distance_squared: f64,
    moved: bool,
}

#[derive(Debug, Clone, Default)]
struct GridCell {
    static_entities: Vec<EntityId>,
    dynamic_entities: Vec<EntityId>,
}

impl GridCell {
    fn list_mut(&mut self, in_static: bool) -> &mut Vec<EntityId> {
        if in_static {
            &mut self.static_entities
        } else {
            &mut self.dynamic_entities
        }
    }

    fn is_empty(&self) -> bool {
        self.static_entities.is_empty() && self.dynamic_entities.is_empty()
    }
}

fn compute_cell(position: &Vector3<f64>, bias_x: f64, bias_y: f64, cell_size: f64) -> CellCoord {
    let x = ((position.x - bias_x) / cell_size).floor();
    let y = ((position.y - bias_y) / cell_size).floor();
    CellCoord::new(
        x.clamp(i32::MIN as f64, i32::MAX as f64) as i32,
        y.clamp(i32::MIN as f64, i32::MAX as f64) as i32,
    )
}

fn insert_into_cell(cells: &mut HashMap<CellCoord, GridCell>, cell: CellCoord, in_static: bool, id: EntityId) {
    cells.entry(cell).or_default().list_mut(in_static).push(id);
}

fn remove_from_cell(cells: &mut HashMap<CellCoord, GridCell>, cell: CellCoord, in_static: bool, id: EntityId) {
    if let Some(grid_cell) = cells.get_mut(&cell) {
        let list = grid_cell.list_mut(in_static);
        if let Some(pos) = list.iter().position(|e| *e == id) {
            list.remove(pos);
        }
        if grid_cell.is_empty() {
            cells.remove(&cell);
        }
    }
}

/// Spatial partition used for distance-culled relevance.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    cell_size: f64,
    bias_x: f64,
    bias_y: f64,
    disable_spatial_rebuilds: bool,
    frequency_buckets: u32,
    bucket_list_size: usize,

    entries: BTreeMap<EntityId, GridEntry>,
    cells: HashMap<CellCoord, GridCell>,

    /// Largest cull distance currently in the grid, bounds the cell walk
    max_cull_distance_squared: f64,
}

impl SpatialGrid {
    pub fn new(config: &SpatialConfig) -> Self {
        Self {
            cell_size: config.cell_size,
            bias_x: config.bias_x,
            bias_y: config.bias_y,
            disable_spatial_rebuilds: config.disable_spatial_rebuilds,
            frequency_buckets: config.dynamic_frequency_buckets.max(1),
            bucket_list_size: config.frequency_bucket_list_size,
            entries: BTreeMap::new(),
            cells: HashMap::new(),
            max_cull_distance_squared: 0.0,
        }
    }

    /// Cell containing a world position: `floor((p - bias) / cell_size)`.
    pub fn cell_for(&self, position: &Vector3<f64>) -> CellCoord {
        compute_cell(position, self.bias_x, self.bias_y, self.cell_size)
    }

    pub fn add_static(&mut self, id: EntityId, position: Vector3<f64>, cull_distance_squared: f64) -> Result<(), RouteError> {
        self.add(id, GridEntryKind::Static, position, cull_distance_squared)
    }

    pub fn add_dynamic(&mut self, id: EntityId, position: Vector3<f64>, cull_distance_squared: f64) -> Result<(), RouteError> {
        self.add(id, GridEntryKind::Dynamic, position, cull_distance_squared)
    }

    pub fn add_dormancy(
        &mut self,
        id: EntityId,
        position: Vector3<f64>,
        cull_distance_squared: f64,
        dormant: bool,
    ) -> Result<(), RouteError> {
        self.add(id, GridEntryKind::Dormancy { dormant }, position, cull_distance_squared)
    }

    pub fn remove_static(&mut self, id: EntityId) -> Result<(), RouteError> {
        self.remove(id, GridEntryKind::Static)
    }

    pub fn remove_dynamic(&mut self, id: EntityId) -> Result<(), RouteError> {
        self.remove(id, GridEntryKind::Dynamic)
    }

    pub fn remove_dormancy(&mut self, id: EntityId) -> Result<(), RouteError> {
        self.remove(id, GridEntryKind::Dormancy { dormant: false })
    }

    fn add(
        &mut self,
        id: EntityId,
        kind: GridEntryKind,
        position: Vector3<f64>,
        cull_distance_squared: f64,
    ) -> Result<(), RouteError> {
        if self.entries.contains_key(&id) {
            return Err(RouteError::AlreadyRegistered(id));
        }

        let cell = self.cell_for(&position);
        insert_into_cell(&mut self.cells, cell, kind.in_static_list(), id);
        self.entries.insert(
            id,
            GridEntry {
                kind,
                cell,
                position,
                cull_distance_squared,
                moved: false,
            },
        );
        if cull_distance_squared > self.max_cull_distance_squared {
            let was_clamped = self.is_cell_range_clamped();
            self.max_cull_distance_squared = cull_distance_squared;
            if !was_clamped && self.is_cell_range_clamped() {
                tracing::warn!(
                    "{} cull distance {:.0} spans more than {} cells of size {}, gathering stops at {} cells",
                    id,
                    cull_distance_squared.sqrt(),
                    MAX_CELL_RANGE,
                    self.cell_size,
                    MAX_CELL_RANGE
                );
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: EntityId, expected: GridEntryKind) -> Result<(), RouteError> {
        let matches = self
            .entries
            .get(&id)
            .is_some_and(|entry| entry.kind.same_route(expected));
        if !matches {
            return Err(RouteError::not_found(id, expected.route_name()));
        }

        let Some(entry) = self.entries.remove(&id) else {
            return Err(RouteError::not_found(id, expected.route_name()));
        };
        remove_from_cell(&mut self.cells, entry.cell, entry.kind.in_static_list(), id);

        if entry.cull_distance_squared >= self.max_cull_distance_squared {
            self.max_cull_distance_squared = self
                .entries
                .values()
                .map(|e| e.cull_distance_squared)
                .fold(0.0, f64::max);
        }
        Ok(())
    }

    /// Records a new position. The cell changes at the next prepare.
    pub fn update_position(&mut self, id: EntityId, position: Vector3<f64>) -> Result<(), RouteError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| RouteError::not_found(id, "spatial grid"))?;
        entry.position = position;
        entry.moved = true;
        Ok(())
    }

    /// Switches a dormancy entity between the static and dynamic lists.
    pub fn set_dormant(&mut self, id: EntityId, dormant: bool) -> Result<(), RouteError> {
        let cell_size = self.cell_size;
        let (bias_x, bias_y) = (self.bias_x, self.bias_y);

        let entry = match self.entries.get_mut(&id) {
            Some(entry) if matches!(entry.kind, GridEntryKind::Dormancy { .. }) => entry,
            _ => return Err(RouteError::not_found(id, "spatial grid (dormancy)")),
        };
        if entry.kind == (GridEntryKind::Dormancy { dormant }) {
            return Ok(());
        }

        remove_from_cell(&mut self.cells, entry.cell, entry.kind.in_static_list(), id);
        entry.kind = GridEntryKind::Dormancy { dormant };
        entry.cell = compute_cell(&entry.position, bias_x, bias_y, cell_size);
        entry.moved = false;
        insert_into_cell(&mut self.cells, entry.cell, dormant, id);
        Ok(())
    }

    pub fn set_frequency_buckets(&mut self, buckets: u32) {
        self.frequency_buckets = buckets.max(1);
    }

    pub fn frequency_buckets(&self) -> u32 {
        self.frequency_buckets
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn cell_of(&self, id: EntityId) -> Option<CellCoord> {
        self.entries.get(&id).map(|e| e.cell)
    }

    /// Entities in a cell, static list first.
    pub fn entities_in_cell(&self, cell: CellCoord) -> Vec<EntityId> {
        self.cells
            .get(&cell)
            .map(|c| c.static_entities.iter().chain(&c.dynamic_entities).copied().collect())
            .unwrap_or_default()
    }

    /// Re-buckets moved entities. Runs once per tick before any gather.
    pub fn prepare(&mut self) {
        let cell_size = self.cell_size;
        let (bias_x, bias_y) = (self.bias_x, self.bias_y);
        let rebuild_static = !self.disable_spatial_rebuilds;

        for (id, entry) in self.entries.iter_mut() {
            let in_static = entry.kind.in_static_list();
            let rebucket = !in_static || (entry.moved && rebuild_static);
            entry.moved = false;
            if !rebucket {
                continue;
            }

            let cell = compute_cell(&entry.position, bias_x, bias_y, cell_size);
            if cell != entry.cell {
                remove_from_cell(&mut self.cells, entry.cell, in_static, *id);
                insert_into_cell(&mut self.cells, cell, in_static, *id);
                entry.cell = cell;
            }
        }
    }

    /// Squared distance from a point to the nearest point of a cell.
    fn cell_distance_squared(&self, cell: CellCoord, position: &Vector3<f64>) -> f64 {
        let min_x = self.bias_x + cell.x as f64 * self.cell_size;
        let min_y = self.bias_y + cell.y as f64 * self.cell_size;
        let dx = (min_x - position.x).max(0.0).max(position.x - (min_x + self.cell_size));
        let dy = (min_y - position.y).max(0.0).max(position.y - (min_y + self.cell_size));
        dx * dx + dy * dy
    }

    /// Cell ring radius needed to cover the largest cull distance.
    fn required_cell_range(&self) -> i64 {
        if self.max_cull_distance_squared > 0.0 {
            (self.max_cull_distance_squared.sqrt() / self.cell_size).ceil() as i64
        } else {
            0
        }
    }

    /// True if some entity's cull distance reaches past the cell walk cap.
    pub fn is_cell_range_clamped(&self) -> bool {
        self.required_cell_range() > MAX_CELL_RANGE
    }

    /// Cells to visit for one viewer, in x-major order.
    fn cells_around(&self, center: CellCoord) -> Vec<CellCoord> {
        let range = self.required_cell_range().min(MAX_CELL_RANGE);

        let x_min = center.x as i64 - range;
        let x_max = center.x as i64 + range;
        let y_min = center.y as i64 - range;
        let y_max = center.y as i64 + range;
        let span = (2 * range + 1) as usize;

        if span.saturating_mul(span) > self.cells.len() {
            let mut cells: Vec<CellCoord> = self
                .cells
                .keys()
                .filter(|c| {
                    (x_min..=x_max).contains(&(c.x as i64)) && (y_min..=y_max).contains(&(c.y as i64))
                })
                .copied()
                .collect();
            cells.sort();
            cells
        } else {
            let mut cells = Vec::with_capacity(span * span);
            for x in x_min..=x_max {
                for y in y_min..=y_max {
                    let coord = CellCoord::new(x as i32, y as i32);
                    if self.cells.contains_key(&coord) {
                        cells.push(coord);
                    }
                }
            }
            cells
        }
    }

    /// Appends the entities relevant to any of the viewers. Each entity at most once.
    pub fn gather_for_viewers(&self, viewers: &[NetViewer], tick: u64, out: &mut Vec<EntityId>) {
        let mut seen = HashSet::new();
        let buckets = self.frequency_buckets as usize;
        let active_bucket = (tick % self.frequency_buckets as u64) as usize;

        for viewer in viewers {
            let center = self.cell_for(&viewer.position);
            for coord in self.cells_around(center) {
                let Some(cell) = self.cells.get(&coord) else {
                    continue;
                };
                let distance_squared = self.cell_distance_squared(coord, &viewer.position);
                let within = |id: &EntityId| {
                    self.entries
                        .get(id)
                        .is_some_and(|e| distance_squared <= e.cull_distance_squared)
                };

                for id in &cell.static_entities {
                    if within(id) && seen.insert(*id) {
                        out.push(*id);
                    }
                }

                let bucketed = buckets > 1 && cell.dynamic_entities.len() > self.bucket_list_size;
                for (index, id) in cell.dynamic_entities.iter().enumerate() {
                    if bucketed && index % buckets != active_bucket {
                        continue;
                    }
                    if within(id) && seen.insert(*id) {
                        out.push(*id);
                    }
                }
            }
        }
    }

    /// Get statistics about the grid
    pub fn stats(&self) -> GridStats {
        let (static_entities, dynamic_entities) = self.cells.values().fold((0, 0), |(s, d), c| {
            (s + c.static_entities.len(), d + c.dynamic_entities.len())
        });
        let occupied_cells = self.cells.len();
        let total_entities = self.entries.len();
        let avg_entities_per_cell = if occupied_cells > 0 {
            total_entities as f64 / occupied_cells as f64
        } else {
            0.0
        };

        GridStats {
            total_entities,
            static_entities,
            dynamic_entities,
            occupied_cells,
            avg_entities_per_cell,
            cell_size: self.cell_size,
        }
    }
}

impl GlobalGraphNode for SpatialGrid {
    fn name(&self) -> &'static str {
        "GridSpatialization2D"
    }

    fn requires_prepare(&self) -> bool {
        true
    }

    fn prepare_for_replication(&mut self, _tick: u64) {
        self.prepare();
    }

    fn gather(&self, params: &GatherParams<'_>, out: &mut Vec<EntityId>) {
        self.gather_for_viewers(params.viewers, params.tick, out);
    }
}

/// Statistics about the grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridStats {
    pub total_entities: usize,
    pub static_entities: usize,
    pub dynamic_entities: usize,
    pub occupied_cells: usize,
    pub avg_entities_per_cell: f64,
    pub cell_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use repgraph_env::ConnectionId;

    fn grid(cell_size: f64) -> SpatialGrid {
        SpatialGrid::new(&SpatialConfig {
            cell_size,
            bias_x: 0.0,
            bias_y: 0.0,
            ..SpatialConfig::default()
        })
    }

    fn viewer_at(x: f64, y: f64) -> NetViewer {
        NetViewer::new(ConnectionId::from_seed(1), EntityId(9000), Vector3::new(x, y, 0.0), None)
    }

    fn gather(grid: &SpatialGrid, viewers: &[NetViewer], tick: u64) -> Vec<EntityId> {
        let mut out = Vec::new();
        grid.gather_for_viewers(viewers, tick, &mut out);
        out
    }

    #[test]
    fn test_grid_creation() {
        let grid = grid(100.0);
        let stats = grid.stats();
        assert_eq!(stats.total_entities, 0);
        assert_eq!(stats.occupied_cells, 0);
    }

    #[test]
    fn test_cell_assignment_and_cull() {
        let mut grid = grid(100.0);
        let id = EntityId(1);
        grid.add_dynamic(id, Vector3::new(250.0, 250.0, 0.0), 50.0 * 50.0).unwrap();

        assert_eq!(grid.cell_of(id), Some(CellCoord::new(2, 2)));
        assert_eq!(gather(&grid, &[viewer_at(260.0, 260.0)], 0), vec![id]);
        assert!(gather(&grid, &[viewer_at(1000.0, 1000.0)], 0).is_empty());
    }

    #[test]
    fn test_negative_cells() {
        let mut grid = grid(100.0);
        grid.add_static(EntityId(1), Vector3::new(-50.0, -150.0, 0.0), 100.0).unwrap();
        assert_eq!(grid.cell_of(EntityId(1)), Some(CellCoord::new(-1, -2)));
        assert_eq!(gather(&grid, &[viewer_at(-10.0, -110.0)], 0), vec![EntityId(1)]);
    }

    #[test]
    fn test_default_bias() {
        let grid = SpatialGrid::new(&SpatialConfig::default());
        assert_eq!(grid.cell_for(&Vector3::new(0.0, 0.0, 0.0)), CellCoord::new(20, 20));
    }

    #[test]
    fn test_entity_gathered_once_for_multiple_viewers() {
        let mut grid = grid(100.0);
        grid.add_dynamic(EntityId(1), Vector3::new(150.0, 150.0, 0.0), 500.0 * 500.0).unwrap();

        let out = gather(&grid, &[viewer_at(150.0, 150.0), viewer_at(160.0, 160.0)], 0);
        assert_eq!(out, vec![EntityId(1)]);
    }

    #[test]
    fn test_dynamic_rebucketed_after_move() {
        let mut grid = grid(100.0);
        let id = EntityId(1);
        grid.add_dynamic(id, Vector3::new(50.0, 50.0, 0.0), 10.0).unwrap();
        grid.update_position(id, Vector3::new(550.0, 50.0, 0.0)).unwrap();

        assert_eq!(grid.cell_of(id), Some(CellCoord::new(0, 0)));
        grid.prepare();
        assert_eq!(grid.cell_of(id), Some(CellCoord::new(5, 0)));
        assert_eq!(gather(&grid, &[viewer_at(560.0, 60.0)], 1), vec![id]);
    }

    #[test]
    fn test_static_frozen_when_rebuilds_disabled() {
        let mut frozen = grid(100.0);
        let id = EntityId(1);
        frozen.add_static(id, Vector3::new(50.0, 50.0, 0.0), 10.0).unwrap();
        frozen.update_position(id, Vector3::new(550.0, 50.0, 0.0)).unwrap();
        frozen.prepare();
        assert_eq!(frozen.cell_of(id), Some(CellCoord::new(0, 0)));

        let mut live = SpatialGrid::new(&SpatialConfig {
            cell_size: 100.0,
            bias_x: 0.0,
            bias_y: 0.0,
            disable_spatial_rebuilds: false,
            ..SpatialConfig::default()
        });
        live.add_static(id, Vector3::new(50.0, 50.0, 0.0), 10.0).unwrap();
        live.update_position(id, Vector3::new(550.0, 50.0, 0.0)).unwrap();
        live.prepare();
        assert_eq!(live.cell_of(id), Some(CellCoord::new(5, 0)));
    }

    #[test]
    fn test_dormancy_switches_lists() {
        let mut grid = grid(100.0);
        let id = EntityId(1);
        grid.add_dormancy(id, Vector3::new(50.0, 50.0, 0.0), 10.0, false).unwrap();
        assert_eq!(grid.stats().dynamic_entities, 1);

        grid.set_dormant(id, true).unwrap();
        let stats = grid.stats();
        assert_eq!(stats.static_entities, 1);
        assert_eq!(stats.dynamic_entities, 0);

        // Dormant entities are frozen like static ones
        grid.update_position(id, Vector3::new(950.0, 50.0, 0.0)).unwrap();
        grid.prepare();
        assert_eq!(grid.cell_of(id), Some(CellCoord::new(0, 0)));

        // Waking re-buckets at the current position
        grid.set_dormant(id, false).unwrap();
        assert_eq!(grid.cell_of(id), Some(CellCoord::new(9, 0)));
        assert!(grid.set_dormant(EntityId(2), true).is_err());
    }

    #[test]
    fn test_remove_with_wrong_kind_not_found() {
        let mut grid = grid(100.0);
        let id = EntityId(1);
        grid.add_dynamic(id, Vector3::new(50.0, 50.0, 0.0), 10.0).unwrap();

        assert!(matches!(grid.remove_static(id), Err(RouteError::NotFound { .. })));
        assert!(grid.contains(id));
        assert!(grid.remove_dynamic(id).is_ok());
        assert!(!grid.contains(id));
        assert_eq!(grid.stats().occupied_cells, 0);

        grid.add_dynamic(EntityId(2), Vector3::zeros(), 1.0).unwrap();
        assert!(matches!(
            grid.add_static(EntityId(2), Vector3::zeros(), 1.0),
            Err(RouteError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_crowded_cell_frequency_buckets() {
        let mut grid = grid(1000.0);
        for i in 0..30 {
            grid.add_dynamic(EntityId(i), Vector3::new(500.0, 500.0, 0.0), 100.0).unwrap();
        }
        let viewer = [viewer_at(500.0, 500.0)];

        let mut all = Vec::new();
        for tick in 0..3 {
            let out = gather(&grid, &viewer, tick);
            assert_eq!(out.len(), 10);
            all.extend(out);
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 30);

        grid.set_frequency_buckets(1);
        assert_eq!(gather(&grid, &viewer, 0).len(), 30);
    }

    #[test]
    fn test_gather_order_is_deterministic() {
        let mut grid = grid(100.0);
        grid.add_dynamic(EntityId(3), Vector3::new(150.0, 50.0, 0.0), 1e6).unwrap();
        grid.add_dynamic(EntityId(1), Vector3::new(50.0, 150.0, 0.0), 1e6).unwrap();
        grid.add_static(EntityId(2), Vector3::new(50.0, 50.0, 0.0), 1e6).unwrap();

        let out = gather(&grid, &[viewer_at(100.0, 100.0)], 0);
        assert_eq!(out, vec![EntityId(2), EntityId(1), EntityId(3)]);
    }

    #[test]
    fn test_cell_range_clamp_follows_largest_cull() {
        let mut grid = grid(1.0);
        grid.add_dynamic(EntityId(1), Vector3::new(0.0, 0.0, 0.0), 100.0).unwrap();
        assert!(!grid.is_cell_range_clamped());

        // 5000 units over 1-unit cells needs far more rings than the walk allows
        grid.add_static(EntityId(2), Vector3::new(3.0, 0.0, 0.0), 5000.0 * 5000.0).unwrap();
        assert!(grid.is_cell_range_clamped());

        grid.remove_static(EntityId(2)).unwrap();
        assert!(!grid.is_cell_range_clamped());
        assert_eq!(gather(&grid, &[viewer_at(2.0, 0.0)], 0), vec![EntityId(1)]);
    }
}
