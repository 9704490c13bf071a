//! # Climate and Biomes
//!
//! Temperature and moisture fields, and the biome table they index.
//!
//! Heights here are normalized to `[0, 1]` with the sea surface at
//! [`SEA_LEVEL`]. Temperature and moisture are in `[-1, 1]`.

use crate::cell::SEA_LEVEL;
use crate::noise::{Octaves, SimplexNoise, WorldSeed};

/// Biome types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Biome {
    /// Far below the sea surface.
    DeepOcean = 0,
    /// Open water.
    #[default]
    Ocean = 1,
    /// Thin band of land at the waterline.
    Beach = 2,
    /// Temperate grassland.
    Plains = 3,
    /// Temperate forest.
    Forest = 4,
    /// Hot and wet.
    Jungle = 5,
    /// Hot and dry.
    Desert = 6,
    /// Cold and dry.
    Tundra = 7,
    /// Cold forest.
    Taiga = 8,
    /// High ground.
    Mountains = 9,
    /// High, cold ground.
    SnowyPeaks = 10,
    /// Low, wet ground.
    Swamp = 11,
    /// Warm grassland.
    Savanna = 12,
}

impl Biome {
    /// Returns true for biomes under water.
    #[inline]
    #[must_use]
    pub const fn is_aquatic(self) -> bool {
        matches!(self, Self::DeepOcean | Self::Ocean)
    }

    /// Average tree density (0-100).
    #[must_use]
    pub const fn tree_density(self) -> u8 {
        match self {
            Self::Jungle => 80,
            Self::Forest => 50,
            Self::Taiga => 40,
            Self::Swamp => 30,
            Self::Savanna => 10,
            Self::Plains => 5,
            _ => 0,
        }
    }
}

/// Climate fields sampled per world position.
pub struct Climate {
    temperature: SimplexNoise,
    moisture: SimplexNoise,
}

impl Climate {
    /// Larger = more gradual temperature bands.
    const TEMPERATURE_SCALE: f64 = 0.0015;
    /// Larger = more gradual moisture bands.
    const MOISTURE_SCALE: f64 = 0.0025;

    /// Creates the climate fields for a world seed.
    #[must_use]
    pub fn new(seed: WorldSeed) -> Self {
        Self {
            temperature: SimplexNoise::new(seed.derive(11)),
            moisture: SimplexNoise::new(seed.derive(12)),
        }
    }

    /// Temperature at world `(x, z)` for ground at `height`.
    ///
    /// Falls with height above the sea and with distance from `z = 0`.
    #[must_use]
    pub fn temperature(&self, x: f64, z: f64, height: f64) -> f64 {
        let base = self
            .temperature
            .fbm(x * Self::TEMPERATURE_SCALE, z * Self::TEMPERATURE_SCALE, Octaves::SMOOTH);
        let latitude = (z.abs() * 0.0001).min(1.0) * 0.5;
        let altitude = (height - f64::from(SEA_LEVEL)).max(0.0) * 0.8;
        (base - latitude - altitude).clamp(-1.0, 1.0)
    }

    /// Moisture at world `(x, z)`, raised by nearby water (`wetness` in `[0, 1]`).
    #[must_use]
    pub fn moisture(&self, x: f64, z: f64, wetness: f64) -> f64 {
        let base = self
            .moisture
            .fbm(x * Self::MOISTURE_SCALE, z * Self::MOISTURE_SCALE, Octaves::TERRAIN);
        (base + wetness * 0.5).clamp(-1.0, 1.0)
    }

    /// Maps height and climate to a biome.
    #[must_use]
    pub fn classify(height: f64, temperature: f64, moisture: f64) -> Biome {
        let sea = f64::from(SEA_LEVEL);
        if height < sea - 0.12 {
            return Biome::DeepOcean;
        }
        if height < sea {
            return Biome::Ocean;
        }
        if height < sea + 0.02 {
            return Biome::Beach;
        }
        if height > 0.8 {
            return if temperature < -0.2 {
                Biome::SnowyPeaks
            } else {
                Biome::Mountains
            };
        }

        match (temperature, moisture) {
            (t, _) if t < -0.5 => Biome::Tundra,
            (t, m) if t < -0.2 && m > 0.0 => Biome::Taiga,
            (t, _) if t < -0.2 => Biome::Tundra,
            (t, m) if t > 0.5 && m < -0.3 => Biome::Desert,
            (t, m) if t > 0.5 && m > 0.5 => Biome::Jungle,
            (t, m) if t > 0.3 && m < 0.0 => Biome::Savanna,
            (_, m) if m > 0.5 && height < sea + 0.08 => Biome::Swamp,
            (_, m) if m > 0.2 => Biome::Forest,
            _ => Biome::Plains,
        }
    }
}
