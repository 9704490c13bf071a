//! # Post-Processing
//!
//! Passes run over a finished tile, after every generator stage.
//!
//! - [`Filter`]s see the whole buffer and may read neighbouring cells
//! - [`Decorator`]s see one cell at a time
//!
//! Both run on the whole buffer, border included, so a cell near the tile
//! edge is processed from the same neighbourhood as the matching cell of the
//! adjacent tile. Neighbours past the buffer are absent and stand in as the
//! centre cell.

use crate::cell::{Cell, Terrain, SEA_LEVEL};
use crate::tile::TileStorage;

/// A whole-tile pass.
pub trait Filter: Send + Sync {
    /// Applies the pass. `scratch` is a reusable buffer with no contents
    /// guaranteed.
    fn apply(&self, storage: &mut TileStorage, scratch: &mut Vec<f32>);
}

/// A per-cell pass.
pub trait Decorator: Send + Sync {
    /// Decorates one cell.
    fn decorate(&self, cell: &mut Cell);
}

/// Copies every height into `scratch`.
fn snapshot_heights(storage: &TileStorage, scratch: &mut Vec<f32>) {
    scratch.clear();
    scratch.extend(storage.cells().iter().map(|cell| cell.height));
}

/// Height at `(ux + dx, uz + dz)`, or `centre` past the buffer edge.
#[inline]
fn neighbour(
    heights: &[f32],
    edge: usize,
    (ux, uz): (usize, usize),
    (dx, dz): (isize, isize),
    centre: f32,
) -> f32 {
    match (ux.checked_add_signed(dx), uz.checked_add_signed(dz)) {
        (Some(nx), Some(nz)) if nx < edge && nz < edge => heights[nz * edge + nx],
        _ => centre,
    }
}

/// Box blur of the height field.
#[derive(Clone, Copy, Debug)]
pub struct Smoothing {
    /// Blur passes.
    pub passes: usize,
}

impl Default for Smoothing {
    fn default() -> Self {
        Self { passes: 1 }
    }
}

impl Filter for Smoothing {
    fn apply(&self, storage: &mut TileStorage, scratch: &mut Vec<f32>) {
        let edge = storage.edge();
        for _ in 0..self.passes {
            snapshot_heights(storage, scratch);
            for (index, cell) in storage.cells_mut().iter_mut().enumerate() {
                let (ux, uz) = (index % edge, index / edge);
                let centre = scratch[index];
                let mut sum = 0.0;
                for dz in -1..=1 {
                    for dx in -1..=1 {
                        sum += neighbour(scratch, edge, (ux, uz), (dx, dz), centre);
                    }
                }
                cell.height = sum / 9.0;
            }
        }
    }
}

/// Slope measurement and relief tagging.
///
/// Stores the steepest drop to a direct neighbour in `erosion`, then tags
/// dry land as hills or mountains.
#[derive(Clone, Copy, Debug)]
pub struct Steepness {
    /// Slope above which land is hilly.
    pub hills: f32,
    /// Slope or height above which land is mountainous.
    pub mountains: f32,
}

impl Default for Steepness {
    fn default() -> Self {
        Self {
            hills: 0.004,
            mountains: 0.012,
        }
    }
}

impl Filter for Steepness {
    fn apply(&self, storage: &mut TileStorage, scratch: &mut Vec<f32>) {
        let edge = storage.edge();
        snapshot_heights(storage, scratch);
        for (index, cell) in storage.cells_mut().iter_mut().enumerate() {
            let (ux, uz) = (index % edge, index / edge);
            let centre = scratch[index];
            let slope = [(-1, 0), (1, 0), (0, -1), (0, 1)]
                .into_iter()
                .map(|(dx, dz)| (centre - neighbour(scratch, edge, (ux, uz), (dx, dz), centre)).abs())
                .fold(0.0_f32, f32::max);
            cell.erosion = slope;

            if cell.is_water() || cell.height < SEA_LEVEL {
                continue;
            }
            cell.terrain = if slope > self.mountains || cell.height > 0.8 {
                Terrain::Mountains
            } else if slope > self.hills {
                Terrain::Hills
            } else {
                cell.terrain
            };
        }
    }
}

/// Tags low dry land next to the sea surface as coast.
#[derive(Clone, Copy, Debug)]
pub struct CoastDecorator {
    /// Height above sea level still counted as coast.
    pub band: f32,
}

impl Default for CoastDecorator {
    fn default() -> Self {
        Self { band: 0.02 }
    }
}

impl Decorator for CoastDecorator {
    fn decorate(&self, cell: &mut Cell) {
        if !cell.is_water() && cell.height >= SEA_LEVEL && cell.height < SEA_LEVEL + self.band {
            cell.terrain = Terrain::Coast;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{TilePools, TileSize};

    fn storage_with(pools: &TilePools, height: impl Fn(usize, usize) -> f32) -> TileStorage {
        let mut storage = TileStorage::new(pools, TileSize::new(0, 0));
        let edge = storage.edge();
        for (index, cell) in storage.cells_mut().iter_mut().enumerate() {
            cell.height = height(index % edge, index / edge);
            cell.terrain = Terrain::Plains;
        }
        storage
    }

    #[test]
    fn test_smoothing_keeps_flat_field_flat() {
        let pools = TilePools::new(1);
        let mut storage = storage_with(&pools, |_, _| 0.5);
        Smoothing { passes: 3 }.apply(&mut storage, &mut Vec::new());
        // Absent neighbours stand in as the centre, so edges stay flat too
        assert!(storage.cells().iter().all(|c| (c.height - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_smoothing_spreads_a_spike() {
        let pools = TilePools::new(1);
        let mut storage = storage_with(&pools, |x, z| if (x, z) == (8, 8) { 0.9 } else { 0.3 });
        Smoothing::default().apply(&mut storage, &mut Vec::new());

        let peak = storage.buffer_cell(8, 8).height;
        let side = storage.buffer_cell(9, 8).height;
        assert!(peak < 0.9 && peak > 0.3);
        assert!((side - (0.3 * 8.0 + 0.9) / 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_steepness_tags_relief() {
        let pools = TilePools::new(1);
        #[allow(clippy::cast_precision_loss)]
        let mut storage = storage_with(&pools, |x, _| 0.3 + x as f32 * 0.006);
        Steepness::default().apply(&mut storage, &mut Vec::new());

        let cell = storage.buffer_cell(4, 4);
        assert!((cell.erosion - 0.006).abs() < 1e-5);
        assert_eq!(cell.terrain, Terrain::Hills);
    }

    #[test]
    fn test_coast_band() {
        let decorator = CoastDecorator::default();
        let mut shore = Cell {
            height: SEA_LEVEL + 0.01,
            terrain: Terrain::Plains,
            ..Cell::EMPTY
        };
        decorator.decorate(&mut shore);
        assert_eq!(shore.terrain, Terrain::Coast);

        let mut river = Cell {
            height: SEA_LEVEL + 0.01,
            terrain: Terrain::River,
            ..Cell::EMPTY
        };
        decorator.decorate(&mut river);
        assert_eq!(river.terrain, Terrain::River);
    }
}
