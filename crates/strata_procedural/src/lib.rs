//! # STRATA Procedural Terrain
//!
//! Lazily computed, pooled and expiring terrain tiles.
//!
//! ## Design Principles
//!
//! 1. **Deterministic**: same seed and coordinates, same tile
//! 2. **Built once**: concurrent requests for a tile share one build
//! 3. **Recycled**: tile buffers come from pools and go back exactly once
//! 4. **Parallel**: big tiles are split into sub-jobs on a dedicated lane
//!
//! ## Core Components
//!
//! - `Cell`: one column of terrain
//! - `Tile`: a square of chunks with a border, handed out as `ChunkReader`s
//! - `Generator`: the three-stage per-point contract, `NoiseGenerator` implements it
//! - `TileGenerator`: fills tiles sequentially or in batches, then filters them
//! - `TileCache`: the entry point, chunk coordinates in, chunk views out
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_procedural::{NoiseGenerator, TileCache, TileCacheConfig, WorldSeed};
//!
//! let cache = TileCache::new(NoiseGenerator::new(WorldSeed::new(12345)), &TileCacheConfig::default())?;
//!
//! let chunk = cache.get_chunk(10, -4)?;
//! let height = chunk.get(8, 8).height;
//! chunk.dispose();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cell;
pub mod climate;
pub mod config;
pub mod error;
pub mod filter;
pub mod generator;
pub mod noise;
pub mod tile;
pub mod tile_cache;
pub mod tile_generator;

pub use cell::{Cell, Terrain, CHUNK_SIZE, SEA_LEVEL};
pub use climate::{Biome, Climate};
pub use config::TileCacheConfig;
pub use error::{GenResult, GenerationError};
pub use filter::{CoastDecorator, Decorator, Filter, Smoothing, Steepness};
pub use generator::{apply_all, Generator, NoiseGenerator};
pub use noise::{Octaves, SimplexNoise, WorldSeed};
pub use tile::{
    region_id, ChunkReader, ChunkWriter, Tile, TileDisposed, TilePools, TileSize, TileState,
    TileStorage,
};
pub use tile_cache::{TileCache, TileEntry};
pub use tile_generator::{partition, SubRegion, TileGenerator, Transform};
