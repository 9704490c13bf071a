//! # Generators
//!
//! The per-point terrain contract tiles are filled through, and a
//! simplex-noise implementation of it.
//!
//! A generator runs three stages on every cell, in order:
//!
//! ```text
//!   apply_base     continent shape and height
//!   apply_rivers   river and lake carving (needs the continent field)
//!   apply_climate  temperature, moisture and biome (needs the height)
//! ```
//!
//! Generators must be pure in `(x, z)`: batched tiles are filled from many
//! threads at once and must come out identical to sequential ones.

use crate::cell::{Cell, Terrain, SEA_LEVEL};
use crate::climate::Climate;
use crate::error::{GenResult, GenerationError};
use crate::noise::{Octaves, SimplexNoise, WorldSeed};

/// Per-point terrain computation.
///
/// `x` and `z` are world block coordinates, possibly fractional on zoomed
/// tiles.
pub trait Generator: Send + Sync {
    /// Continent shape and base height.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::Generator`] if the sample can't be computed.
    fn apply_base(&self, cell: &mut Cell, x: f32, z: f32) -> GenResult<()>;

    /// River and lake carving.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::Generator`] if the sample can't be computed.
    fn apply_rivers(&self, cell: &mut Cell, x: f32, z: f32) -> GenResult<()>;

    /// Temperature, moisture and biome.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::Generator`] if the sample can't be computed.
    fn apply_climate(&self, cell: &mut Cell, x: f32, z: f32) -> GenResult<()>;
}

/// Runs all three stages on one cell.
///
/// # Errors
///
/// Returns the first stage error.
#[inline]
pub fn apply_all<G: Generator + ?Sized>(
    generator: &G,
    cell: &mut Cell,
    x: f32,
    z: f32,
) -> GenResult<()> {
    generator.apply_base(cell, x, z)?;
    generator.apply_rivers(cell, x, z)?;
    generator.apply_climate(cell, x, z)
}

/// Deterministic simplex-noise terrain.
///
/// # Example
///
/// ```rust,ignore
/// let generator = NoiseGenerator::new(WorldSeed::new(42));
/// let mut cell = Cell::EMPTY;
/// apply_all(&generator, &mut cell, 128.0, -64.0)?;
/// ```
pub struct NoiseGenerator {
    seed: WorldSeed,
    continent: SimplexNoise,
    detail: SimplexNoise,
    rivers: SimplexNoise,
    lakes: SimplexNoise,
    climate: Climate,
}

impl NoiseGenerator {
    /// Continent features span thousands of blocks.
    const CONTINENT_SCALE: f64 = 0.000_8;
    /// Hills and valleys.
    const DETAIL_SCALE: f64 = 0.006;
    /// River network spacing.
    const RIVER_SCALE: f64 = 0.002;
    /// Lake spacing.
    const LAKE_SCALE: f64 = 0.004;
    /// Ridged values above this carve a river.
    const RIVER_THRESHOLD: f64 = 0.92;
    /// Noise above this floods a lake.
    const LAKE_THRESHOLD: f64 = 0.72;
    /// Deepest river cut, in normalized height.
    const RIVER_DEPTH: f32 = 0.08;

    /// Creates a generator for a world seed.
    #[must_use]
    pub fn new(seed: WorldSeed) -> Self {
        Self {
            seed,
            continent: SimplexNoise::new(seed.derive(1)),
            detail: SimplexNoise::new(seed.derive(2)),
            rivers: SimplexNoise::new(seed.derive(3)),
            lakes: SimplexNoise::new(seed.derive(4)),
            climate: Climate::new(seed),
        }
    }

    /// The world seed.
    #[must_use]
    pub fn seed(&self) -> WorldSeed {
        self.seed
    }

    fn check(stage: &'static str, x: f32, z: f32) -> GenResult<(f64, f64)> {
        if x.is_finite() && z.is_finite() {
            Ok((f64::from(x), f64::from(z)))
        } else {
            Err(GenerationError::stage(stage, x, z, "non-finite coordinate"))
        }
    }
}

impl Default for NoiseGenerator {
    fn default() -> Self {
        Self::new(WorldSeed::default())
    }
}

#[allow(clippy::cast_possible_truncation)]
impl Generator for NoiseGenerator {
    fn apply_base(&self, cell: &mut Cell, x: f32, z: f32) -> GenResult<()> {
        let (x, z) = Self::check("base", x, z)?;

        let continent = self.continent.fbm(
            x * Self::CONTINENT_SCALE,
            z * Self::CONTINENT_SCALE,
            Octaves::SMOOTH,
        );
        let detail = self
            .detail
            .fbm(x * Self::DETAIL_SCALE, z * Self::DETAIL_SCALE, Octaves::TERRAIN);

        // Land rises over the remaining range, sea floor sinks to zero
        let shaped = continent * 0.75 + detail * 0.25;
        let sea = f64::from(SEA_LEVEL);
        let height = if shaped > 0.0 {
            sea + shaped * (1.0 - sea)
        } else {
            sea + shaped * sea
        };

        cell.continent = continent as f32;
        cell.height = height.clamp(0.0, 1.0) as f32;
        cell.terrain = if cell.height < SEA_LEVEL {
            Terrain::Ocean
        } else {
            Terrain::Plains
        };
        Ok(())
    }

    fn apply_rivers(&self, cell: &mut Cell, x: f32, z: f32) -> GenResult<()> {
        let (x, z) = Self::check("rivers", x, z)?;
        if cell.continent <= 0.0 || cell.height < SEA_LEVEL {
            return Ok(());
        }

        let ridge = self
            .rivers
            .ridged(x * Self::RIVER_SCALE, z * Self::RIVER_SCALE, Octaves::SMOOTH);
        if ridge > Self::RIVER_THRESHOLD {
            let strength = ((ridge - Self::RIVER_THRESHOLD) / (1.0 - Self::RIVER_THRESHOLD)) as f32;
            cell.river = strength.clamp(0.0, 1.0);
            cell.height = (cell.height - cell.river * Self::RIVER_DEPTH).max(SEA_LEVEL - 0.005);
            cell.terrain = Terrain::River;
            return Ok(());
        }

        let basin = self.lakes.sample(x * Self::LAKE_SCALE, z * Self::LAKE_SCALE);
        if basin > Self::LAKE_THRESHOLD && cell.height < SEA_LEVEL + 0.1 {
            let depth = ((basin - Self::LAKE_THRESHOLD) / (1.0 - Self::LAKE_THRESHOLD)) as f32;
            cell.lake = depth.clamp(0.0, 1.0);
            cell.height = (cell.height - cell.lake * 0.03).max(SEA_LEVEL - 0.01);
            cell.terrain = Terrain::Lake;
        }
        Ok(())
    }

    fn apply_climate(&self, cell: &mut Cell, x: f32, z: f32) -> GenResult<()> {
        let (x, z) = Self::check("climate", x, z)?;

        let height = f64::from(cell.height);
        let wetness = f64::from(cell.river.max(cell.lake));
        let temperature = self.climate.temperature(x, z, height);
        let moisture = self.climate.moisture(x, z, wetness);

        cell.temperature = temperature as f32;
        cell.moisture = moisture as f32;
        cell.biome = Climate::classify(height, temperature, moisture);
        Ok(())
    }
}
