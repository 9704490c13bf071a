//! # Cells
//!
//! One point's worth of generated terrain.
//!
//! Cells live in pooled tile buffers and are recycled rather than freed, so
//! [`Cell::reset`] must leave a cell indistinguishable from a fresh one.

use crate::climate::Biome;

/// Chunk width/depth in cells.
pub const CHUNK_SIZE: usize = 16;

/// Normalized height of the sea surface.
pub const SEA_LEVEL: f32 = 0.25;

/// Terrain tag assigned during generation and post-processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Terrain {
    /// Below the sea surface.
    #[default]
    Ocean = 0,
    /// Land touching water.
    Coast = 1,
    /// Flat land.
    Plains = 2,
    /// Moderate slopes.
    Hills = 3,
    /// Steep slopes.
    Mountains = 4,
    /// River channel.
    River = 5,
    /// Inland standing water.
    Lake = 6,
    /// Marks a sample taken outside any buffer.
    Void = 7,
}

impl Terrain {
    /// Returns true for water tags.
    #[inline]
    #[must_use]
    pub const fn is_water(self) -> bool {
        matches!(self, Self::Ocean | Self::River | Self::Lake)
    }
}

/// Per-point terrain attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Cell {
    /// Surface height in `[0, 1]`.
    pub height: f32,
    /// Continent field in `[-1, 1]`; positive is land.
    pub continent: f32,
    /// Temperature in `[-1, 1]`.
    pub temperature: f32,
    /// Moisture in `[-1, 1]`.
    pub moisture: f32,
    /// Slope and erosion accumulator.
    pub erosion: f32,
    /// River strength in `[0, 1]`.
    pub river: f32,
    /// Lake strength in `[0, 1]`.
    pub lake: f32,
    /// Terrain tag.
    pub terrain: Terrain,
    /// Biome.
    pub biome: Biome,
}

impl Cell {
    /// A freshly allocated cell.
    pub const EMPTY: Self = Self {
        height: 0.0,
        continent: 0.0,
        temperature: 0.0,
        moisture: 0.0,
        erosion: 0.0,
        river: 0.0,
        lake: 0.0,
        terrain: Terrain::Ocean,
        biome: Biome::Ocean,
    };

    /// Returned for samples outside any buffer.
    pub const ABSENT: Self = Self {
        terrain: Terrain::Void,
        ..Self::EMPTY
    };

    /// Restores every field to its fresh value.
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::EMPTY;
    }

    /// Copies every field from `other`.
    #[inline]
    pub fn copy_from(&mut self, other: &Self) {
        *self = *other;
    }

    /// Returns true if this is the out-of-range sentinel.
    #[inline]
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.terrain == Terrain::Void
    }

    /// Returns true if the surface is under water.
    #[inline]
    #[must_use]
    pub fn is_water(&self) -> bool {
        self.terrain.is_water()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_matches_fresh() {
        let mut cell = Cell {
            height: 0.7,
            continent: 0.4,
            temperature: -0.2,
            moisture: 0.9,
            erosion: 0.1,
            river: 1.0,
            lake: 0.5,
            terrain: Terrain::River,
            biome: Biome::Swamp,
        };
        cell.reset();
        assert_eq!(cell, Cell::default());
        assert_eq!(cell, Cell::EMPTY);
    }

    #[test]
    fn test_absent_sentinel() {
        assert!(Cell::ABSENT.is_absent());
        assert!(!Cell::EMPTY.is_absent());

        let mut cell = Cell::ABSENT;
        cell.reset();
        assert!(!cell.is_absent());
    }

    #[test]
    fn test_copy_from() {
        let mut source = Cell::EMPTY;
        source.height = 0.33;
        source.terrain = Terrain::Hills;

        let mut target = Cell::EMPTY;
        target.copy_from(&source);
        assert_eq!(target, source);
    }
}
