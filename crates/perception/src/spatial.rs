//! Uniform grid over the world used to narrow ray/entity tests.
//!
//! The grid never exceeds [`MAX_GRID_CELLS`] cells. When the configured cell
//! size would need more, cells are widened until the grid fits.

use crate::types::{Entity, Vec2, WorldBounds};
use crate::PerceptionError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialIndexStats {
    pub occupied_cells: usize,
    pub total_entries: usize,
    pub average_entries_per_cell: f32,
}

/// Inclusive rectangle of cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

/// Upper bound on the number of grid cells.
pub const MAX_GRID_CELLS: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct SpatialIndex {
    /// Cell size asked for at construction.
    requested_cell_size: f32,
    /// Cell size in use, at least `requested_cell_size`.
    cell_size: f32,
    dims: [u32; 2],
    cells: Vec<Vec<u32>>,
    ranges: Vec<[u32; 2]>,
    indices: Vec<u32>,
}

fn grid_dims(bounds: WorldBounds, cell_size: f32) -> [u32; 2] {
    let axis = |extent: f32| {
        if extent.is_finite() && extent > 0.0 {
            ((extent / cell_size).ceil() as u32).max(1)
        } else {
            1
        }
    };
    [axis(bounds.width), axis(bounds.height)]
}

fn cells_of(dims: [u32; 2]) -> u64 {
    u64::from(dims[0]) * u64::from(dims[1])
}

/// Cell size and dimensions for `bounds`, widening `requested` until the grid
/// holds at most [`MAX_GRID_CELLS`] cells.
fn fit_grid(bounds: WorldBounds, requested: f32) -> (f32, [u32; 2]) {
    let mut cell_size = requested;
    let mut dims = grid_dims(bounds, cell_size);
    while cells_of(dims) > MAX_GRID_CELLS as u64 {
        let ratio = cells_of(dims) as f64 / MAX_GRID_CELLS as f64;
        cell_size *= (ratio.sqrt() as f32).max(1.001);
        dims = grid_dims(bounds, cell_size);
    }
    (cell_size, dims)
}

impl SpatialIndex {
    pub fn new(bounds: WorldBounds, cell_size: f32) -> Result<Self, PerceptionError> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(PerceptionError::InvalidConfig(
                "cell_size must be finite and positive",
            ));
        }
        let (effective, dims) = fit_grid(bounds, cell_size);
        let cell_count = dims[0] as usize * dims[1] as usize;
        Ok(Self {
            requested_cell_size: cell_size,
            cell_size: effective,
            dims,
            cells: vec![Vec::new(); cell_count],
            ranges: vec![[0, 0]; cell_count],
            indices: Vec::new(),
        })
    }

    /// Rebuilds every cell from `entities`. Cell storage is reused.
    pub fn rebuild(&mut self, bounds: WorldBounds, entities: &[Entity]) {
        let (cell_size, dims) = fit_grid(bounds, self.requested_cell_size);
        if dims != self.dims || cell_size != self.cell_size {
            if cell_size != self.requested_cell_size {
                tracing::debug!(
                    requested = self.requested_cell_size,
                    cell_size,
                    cells = cells_of(dims),
                    "grid cells widened to stay within the cell limit"
                );
            }
            self.cell_size = cell_size;
            self.dims = dims;
            let cell_count = dims[0] as usize * dims[1] as usize;
            self.cells.resize_with(cell_count, Vec::new);
            self.cells.truncate(cell_count);
        }
        self.clear();

        for (index, entity) in entities.iter().enumerate() {
            if !entity.position.is_finite() || !entity.size.is_finite() {
                continue;
            }
            let reach = Vec2::new(entity.size.abs(), entity.size.abs());
            let lo = self.cell_of(entity.position - reach);
            let hi = self.cell_of(entity.position + reach);
            for y in lo[1]..=hi[1] {
                for x in lo[0]..=hi[0] {
                    let cell = self.cell_index(x, y);
                    self.cells[cell].push(index as u32);
                }
            }
        }

        self.ranges.clear();
        for cell in &self.cells {
            self.ranges.push([self.indices.len() as u32, cell.len() as u32]);
            self.indices.extend_from_slice(cell);
        }
    }

    fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
        self.ranges.clear();
        self.indices.clear();
    }

    #[must_use]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    #[must_use]
    pub fn dims(&self) -> [u32; 2] {
        self.dims
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    fn cell_index(&self, x: u32, y: u32) -> usize {
        y as usize * self.dims[0] as usize + x as usize
    }

    /// Cell containing `p`; points outside the world map to border cells.
    #[must_use]
    pub fn cell_of(&self, p: Vec2) -> [u32; 2] {
        let clamp = |v: f32, dim: u32| {
            let cell = (v / self.cell_size).floor();
            cell.clamp(0.0, (dim - 1) as f32) as u32
        };
        [clamp(p.x, self.dims[0]), clamp(p.y, self.dims[1])]
    }

    /// Cells covering the bounding box of `a..b`, dilated by one cell.
    #[must_use]
    pub fn cells_for_segment(&self, a: Vec2, b: Vec2) -> CellRect {
        let lo = self.cell_of(a.min(b));
        let hi = self.cell_of(a.max(b));
        CellRect {
            x0: lo[0].saturating_sub(1),
            y0: lo[1].saturating_sub(1),
            x1: (hi[0] + 1).min(self.dims[0] - 1),
            y1: (hi[1] + 1).min(self.dims[1] - 1),
        }
    }

    #[must_use]
    pub fn cell(&self, x: u32, y: u32) -> &[u32] {
        self.cells
            .get(self.cell_index(x, y))
            .map_or(&[], Vec::as_slice)
    }

    /// Entity indices in `rect`, in cell order. An entity spanning several
    /// cells is yielded once per cell.
    pub fn candidates(&self, rect: CellRect) -> impl Iterator<Item = u32> + '_ {
        (rect.y0..=rect.y1)
            .flat_map(move |y| (rect.x0..=rect.x1).map(move |x| (x, y)))
            .flat_map(move |(x, y)| self.cell(x, y).iter().copied())
    }

    /// Per-cell `[start, count]` into [`Self::indices`], row-major.
    #[must_use]
    pub fn ranges(&self) -> &[[u32; 2]] {
        &self.ranges
    }

    #[must_use]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    #[must_use]
    pub fn stats(&self) -> SpatialIndexStats {
        let occupied_cells = self.cells.iter().filter(|cell| !cell.is_empty()).count();
        let total_entries = self.indices.len();
        let average_entries_per_cell = if occupied_cells > 0 {
            total_entries as f32 / occupied_cells as f32
        } else {
            0.0
        };
        SpatialIndexStats {
            occupied_cells,
            total_entries,
            average_entries_per_cell,
        }
    }

    pub fn shrink_to_fit(&mut self) {
        for cell in &mut self.cells {
            cell.shrink_to_fit();
        }
        self.indices.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> WorldBounds {
        WorldBounds::new(1000.0, 500.0)
    }

    #[test]
    fn dimensions_round_up() {
        let index = SpatialIndex::new(WorldBounds::new(1050.0, 500.0), 100.0).unwrap();
        assert_eq!(index.dims(), [11, 5]);
        assert_eq!(index.cell_count(), 55);
    }

    #[test]
    fn invalid_cell_size_is_rejected() {
        assert!(SpatialIndex::new(world(), 0.0).is_err());
        assert!(SpatialIndex::new(world(), f32::NAN).is_err());
    }

    #[test]
    fn empty_world_is_a_valid_grid() {
        let mut index = SpatialIndex::new(world(), 100.0).unwrap();
        index.rebuild(world(), &[]);
        assert!(index.indices().is_empty());
        assert_eq!(index.ranges().len(), 50);
        assert_eq!(index.stats().occupied_cells, 0);
    }

    #[test]
    fn entity_is_inserted_into_every_overlapped_cell() {
        let mut index = SpatialIndex::new(world(), 100.0).unwrap();
        // straddles the corner of cells (0,0), (1,0), (0,1), (1,1)
        index.rebuild(world(), &[Entity::food(Vec2::new(100.0, 100.0), 5.0)]);
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            assert_eq!(index.cell(x, y), &[0], "missing from cell ({x}, {y})");
        }
        assert!(index.cell(2, 2).is_empty());
        assert_eq!(index.stats().total_entries, 4);
    }

    #[test]
    fn flattened_ranges_match_cells() {
        let mut index = SpatialIndex::new(world(), 100.0).unwrap();
        let entities = [
            Entity::food(Vec2::new(50.0, 50.0), 1.0),
            Entity::food(Vec2::new(55.0, 45.0), 1.0),
            Entity::food(Vec2::new(950.0, 450.0), 1.0),
        ];
        index.rebuild(world(), &entities);
        for (cell, [start, count]) in index.ranges().iter().enumerate() {
            let flat = &index.indices()[*start as usize..(*start + *count) as usize];
            let x = cell as u32 % index.dims()[0];
            let y = cell as u32 / index.dims()[0];
            assert_eq!(flat, index.cell(x, y));
        }
        assert_eq!(index.cell(0, 0), &[0, 1]);
        assert_eq!(index.cell(9, 4), &[2]);
    }

    #[test]
    fn out_of_world_positions_clamp_to_border() {
        let index = SpatialIndex::new(world(), 100.0).unwrap();
        assert_eq!(index.cell_of(Vec2::new(-50.0, 9000.0)), [0, 4]);
        let rect = index.cells_for_segment(Vec2::new(150.0, 150.0), Vec2::new(350.0, 120.0));
        assert_eq!(rect, CellRect { x0: 0, y0: 0, x1: 4, y1: 2 });
    }

    #[test]
    fn oversized_grid_widens_its_cells() {
        let huge = WorldBounds::new(20_000.0, 20_000.0);
        let mut index = SpatialIndex::new(huge, 1.0).unwrap();
        let [w, h] = index.dims();
        assert!(index.cell_count() <= MAX_GRID_CELLS, "{} cells", index.cell_count());
        assert_eq!(w as usize * h as usize, index.cell_count());
        assert!(index.cell_size() >= 20_000.0 / 1024.0, "cell size {}", index.cell_size());

        let corner = Vec2::new(19_999.0, 19_999.0);
        index.rebuild(huge, &[Entity::food(corner, 1.0)]);
        let [x, y] = index.cell_of(corner);
        assert_eq!((x, y), (w - 1, h - 1));
        assert_eq!(index.cell(x, y), &[0]);
        assert_eq!(index.ranges().len(), index.cell_count());

        // a smaller world gets the requested cell size back
        index.rebuild(WorldBounds::new(300.0, 200.0), &[]);
        assert_eq!(index.cell_size(), 1.0);
        assert_eq!(index.dims(), [300, 200]);
    }

    #[test]
    fn rebuild_follows_world_resize() {
        let mut index = SpatialIndex::new(world(), 100.0).unwrap();
        index.rebuild(WorldBounds::new(200.0, 200.0), &[Entity::food(Vec2::new(150.0, 150.0), 1.0)]);
        assert_eq!(index.dims(), [2, 2]);
        assert_eq!(index.ranges().len(), 4);
        assert_eq!(index.candidates(index.cells_for_segment(Vec2::ZERO, Vec2::ZERO)).count(), 1);
    }
}
