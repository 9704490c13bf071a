//! # Tile Cache
//!
//! The entry point: chunk coordinates in, chunk views out.
//!
//! ```text
//! get_chunk(cx, cz)
//!   │  tile_of_chunk
//!   ▼
//! Cache<Arc<Tile>> ──miss──> TileGenerator::generate_region
//!   │ hit                         │
//!   ▼                             ▼
//! Tile::open_chunk  <──────── Arc<Tile> (stored)
//!
//! ChunkReader::dispose ... last chunk ──> disposal channel ──> drained on
//!                                         next access: entry removed if
//!                                         its serial matches, evict hook
//!                                         closes the tile
//! ```
//!
//! Tiles never point back at the cache. The cache learns that a tile is
//! dead from a [`TileDisposed`] arriving on the disposal channel. Each
//! build gets a fresh serial, so a late message about an evicted tile
//! never removes its rebuilt successor. Sweeps, including the ones the
//! cache schedules itself, also evict any tile whose chunks are all
//! retired.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use strata_core::{Cache, CacheEntry, CacheStats, ThreadPool};

use crate::config::TileCacheConfig;
use crate::error::{GenResult, GenerationError};
use crate::generator::Generator;
use crate::tile::{region_id, ChunkReader, Tile, TileDisposed, TilePools, TileSize};
use crate::tile_generator::{TileGenerator, Transform};

/// A cache entry holding a tile.
pub type TileEntry = CacheEntry<Arc<Tile>, GenerationError>;

/// Offsets of the 8 tiles around a tile.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Expiring, at-most-once store of generated tiles.
pub struct TileCache {
    cache: Cache<Arc<Tile>, GenerationError>,
    tiles: Arc<TileGenerator>,
    disposed_tx: Sender<TileDisposed>,
    disposed_rx: Receiver<TileDisposed>,
    /// Serial of the next tile built.
    serials: Arc<AtomicU64>,
    prefetch: bool,
}

impl TileCache {
    /// Builds a cache, its thread pool and tile generator from `config`.
    ///
    /// # Errors
    ///
    /// [`GenerationError::InvalidConfig`] for a bad config, or a pool error
    /// if worker threads can't be spawned.
    pub fn new(generator: impl Generator + 'static, config: &TileCacheConfig) -> GenResult<Self> {
        config.validate()?;
        let pool = Arc::new(ThreadPool::new(config.threads)?);
        let mut tiles = TileGenerator::new(generator, pool, config.tile_size())
            .with_batch_size(config.batch_size)
            .with_pools(TilePools::new(config.pool_retain));
        if config.filters {
            tiles = tiles.with_default_filters();
        }
        Ok(Self::with_tile_generator(tiles, config))
    }

    /// Wraps an already configured tile generator.
    ///
    /// Only the expiry, sweep and prefetch settings of `config` are used.
    #[must_use]
    pub fn with_tile_generator(tiles: TileGenerator, config: &TileCacheConfig) -> Self {
        let pool = Arc::clone(tiles.thread_pool());
        let cache = Cache::with_hooks(
            pool,
            config.expire(),
            config.sweep_interval(),
            |tile: &Arc<Tile>| {
                tile.close();
            },
            |tile: &Arc<Tile>| tile.is_dead(),
        );
        let (disposed_tx, disposed_rx) = crossbeam_channel::unbounded();

        tracing::info!(
            strategy = tiles.thread_pool().strategy_name(),
            threads = tiles.thread_pool().size(),
            chunks = tiles.size().chunks(),
            border = tiles.size().border_chunks(),
            batched = tiles.is_batched(),
            "tile cache ready"
        );

        Self {
            cache,
            tiles: Arc::new(tiles),
            disposed_tx,
            disposed_rx,
            serials: Arc::new(AtomicU64::new(1)),
            prefetch: config.prefetch_neighbours,
        }
    }

    /// Tile geometry.
    #[must_use]
    pub fn tile_size(&self) -> TileSize {
        self.tiles.size()
    }

    /// The pools tile buffers come from.
    #[must_use]
    pub fn pools(&self) -> &TilePools {
        self.tiles.pools()
    }

    /// The worker pool.
    #[must_use]
    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        self.cache.pool()
    }

    /// The tile generator.
    #[must_use]
    pub fn tile_generator(&self) -> &TileGenerator {
        &self.tiles
    }

    /// Returns tile `(tile_x, tile_z)`, generating it on this thread if
    /// nobody else has.
    ///
    /// # Errors
    ///
    /// The generation error. Every concurrent caller sees the same one and
    /// the failed tile is not kept.
    pub fn get_region(&self, tile_x: i32, tile_z: i32) -> GenResult<Arc<Tile>> {
        self.drain_disposed();
        let tile = self
            .cache
            .get_or_compute(region_id(tile_x, tile_z), self.factory(tile_x, tile_z))?;
        if self.prefetch {
            self.prefetch_neighbours(tile_x, tile_z);
        }
        Ok(tile)
    }

    /// Opens a view on chunk `(chunk_x, chunk_z)` in world chunk coordinates.
    ///
    /// # Errors
    ///
    /// The generation error, or [`GenerationError::TileReleased`] if the
    /// tile was released twice in a row between lookup and open.
    pub fn get_chunk(&self, chunk_x: i32, chunk_z: i32) -> GenResult<ChunkReader> {
        let size = self.tile_size();
        let (tile_x, tile_z) = (size.tile_of_chunk(chunk_x), size.tile_of_chunk(chunk_z));
        let (local_x, local_z) = (size.local_chunk(chunk_x), size.local_chunk(chunk_z));

        for _ in 0..2 {
            let tile = self.get_region(tile_x, tile_z)?;
            let reader = tile.open_chunk(local_x, local_z);
            if !reader.is_absent() {
                return Ok(reader);
            }
            tracing::debug!(tile_x, tile_z, "tile released during lookup, retrying");
            self.evict_if_current(&tile);
        }
        Err(GenerationError::TileReleased { tile_x, tile_z })
    }

    /// Starts generating tile `(tile_x, tile_z)` in the background.
    ///
    /// Returns immediately with the entry; `get` on it blocks until ready.
    pub fn queue_region(&self, tile_x: i32, tile_z: i32) -> Arc<TileEntry> {
        self.drain_disposed();
        self.cache
            .queue(region_id(tile_x, tile_z), self.factory(tile_x, tile_z))
    }

    /// Returns tile `(tile_x, tile_z)` only if it is already built.
    #[must_use]
    pub fn get_if_present(&self, tile_x: i32, tile_z: i32) -> Option<Arc<Tile>> {
        self.drain_disposed();
        self.cache.get_if_present(region_id(tile_x, tile_z))
    }

    /// Retires chunk `(chunk_x, chunk_z)` of a cached tile.
    ///
    /// Returns false if the tile isn't cached or the chunk was already
    /// retired. Retiring a tile's last chunk evicts the tile.
    pub fn dispose_chunk(&self, chunk_x: i32, chunk_z: i32) -> bool {
        let size = self.tile_size();
        let Some(tile) =
            self.get_if_present(size.tile_of_chunk(chunk_x), size.tile_of_chunk(chunk_z))
        else {
            return false;
        };
        let retired = tile.dispose(size.local_chunk(chunk_x), size.local_chunk(chunk_z));
        self.drain_disposed();
        retired
    }

    /// Builds an uncached, transformed view of tile `(tile_x, tile_z)`.
    ///
    /// # Errors
    ///
    /// The generation error.
    pub fn generate_zoom(
        &self,
        tile_x: i32,
        tile_z: i32,
        transform: Transform,
        filters: bool,
    ) -> GenResult<Tile> {
        self.tiles.generate_zoom(tile_x, tile_z, transform, filters)
    }

    /// Evicts dead, expired and failed tiles now. Returns how many went.
    pub fn sweep(&self) -> usize {
        let dead = self.drain_disposed();
        let swept = self.cache.sweep();
        tracing::debug!(dead, swept, remaining = self.cache.len(), "tile cache swept");
        dead + swept
    }

    /// Cached tiles, including ones still being generated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.drain_disposed();
        self.cache.len()
    }

    /// Whether no tile is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache traffic counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn factory(
        &self,
        tile_x: i32,
        tile_z: i32,
    ) -> impl FnOnce() -> GenResult<Arc<Tile>> + Send + 'static {
        let tiles = Arc::clone(&self.tiles);
        let disposed = self.disposed_tx.clone();
        let serials = Arc::clone(&self.serials);
        move || {
            let tile = tiles.generate_region(tile_x, tile_z)?;
            let serial = serials.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(tile.with_disposal_channel(disposed, serial)))
        }
    }

    fn prefetch_neighbours(&self, tile_x: i32, tile_z: i32) {
        // Inline execution would build all 8 on the caller's thread
        if self.thread_pool().size() < 2 {
            return;
        }
        for (dx, dz) in NEIGHBOURS {
            let (nx, nz) = (tile_x.wrapping_add(dx), tile_z.wrapping_add(dz));
            if !self.cache.contains_key(region_id(nx, nz)) {
                self.cache.queue(region_id(nx, nz), self.factory(nx, nz));
            }
        }
    }

    /// Removes the entries of fully disposed tiles. Returns how many.
    ///
    /// A message only removes the tile build it came from.
    fn drain_disposed(&self) -> usize {
        let mut removed = 0;
        for dead in self.disposed_rx.try_iter() {
            if self
                .cache
                .remove_if(dead.region_id, |tile| tile.serial() == dead.serial)
            {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "disposed tiles evicted");
        }
        removed
    }

    /// Drops the entry for `tile` unless it has already been replaced.
    fn evict_if_current(&self, tile: &Arc<Tile>) {
        self.cache
            .remove_if(tile.region_id(), |current| Arc::ptr_eq(current, tile));
    }
}

impl fmt::Debug for TileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileCache")
            .field("tiles", &self.cache.len())
            .field("size", &self.tile_size())
            .field("prefetch", &self.prefetch)
            .field("pools", self.pools())
            .finish_non_exhaustive()
    }
}
