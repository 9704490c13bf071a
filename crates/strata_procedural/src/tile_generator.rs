//! # Tile Generator
//!
//! Builds one tile: pooled buffers in, generator over every point, then
//! post-processing.
//!
//! ## Modes
//!
//! ```text
//! Sequential:  for chunk in tile { for point in chunk { generate } }
//!
//! Batched:     partition the tile into square sub-regions
//!              ┌────┬────┐
//!              │ j0 │ j1 │   each job fills its own scratch buffer
//!              ├────┼────┤   on the batch lane
//!              │ j2 │ j3 │
//!              └────┴────┘
//!              barrier ──> copy scratch into the tile ──> post-process
//! ```
//!
//! Sub-regions never overlap and both modes run the exact same per-point
//! code, so a batched tile is bit-identical to a sequential one. Filters
//! read across sub-region seams, so they only run after the barrier.

use std::ops::Range;
use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

use strata_core::{ArrayPool, ObjectPool, PoolError, Pooled, ThreadPool};

use crate::cell::{Cell, CHUNK_SIZE};
use crate::error::{GenResult, GenerationError};
use crate::filter::{CoastDecorator, Decorator, Filter, Smoothing, Steepness};
use crate::generator::{apply_all, Generator};
use crate::tile::{Tile, TilePools, TileSize, TileStorage};

/// [`CHUNK_SIZE`] for coordinate math.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
const CHUNK: i32 = CHUNK_SIZE as i32;

/// Maps tile block coordinates to the coordinates the generator sees.
///
/// `world = block * scale + offset`, on both axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    /// Added to X after scaling.
    pub offset_x: f32,
    /// Added to Z after scaling.
    pub offset_z: f32,
    /// Uniform scale.
    pub scale: f32,
}

impl Transform {
    /// Leaves coordinates untouched.
    pub const IDENTITY: Self = Self {
        offset_x: 0.0,
        offset_z: 0.0,
        scale: 1.0,
    };

    /// Scale first, then translate.
    #[must_use]
    pub const fn new(offset_x: f32, offset_z: f32, scale: f32) -> Self {
        Self {
            offset_x,
            offset_z,
            scale,
        }
    }

    /// Zoomed-out view: each cell covers `scale` blocks, centred on world
    /// `(centre_x, centre_z)` for tile `(0, 0)`.
    #[must_use]
    pub fn zoom(centre_x: f32, centre_z: f32, scale: f32) -> Self {
        Self::new(centre_x, centre_z, scale)
    }

    #[inline]
    #[allow(clippy::cast_precision_loss)]
    fn apply(self, bx: i64, bz: i64) -> (f32, f32) {
        (
            bx as f32 * self.scale + self.offset_x,
            bz as f32 * self.scale + self.offset_z,
        )
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Block coordinate of a tile's first inner cell.
#[derive(Clone, Copy, Debug)]
struct Origin {
    x: i64,
    z: i64,
}

impl Origin {
    fn of(tile_x: i32, tile_z: i32, size: TileSize) -> Self {
        let blocks = i64::try_from(size.blocks()).unwrap_or(i64::MAX);
        Self {
            x: i64::from(tile_x) * blocks,
            z: i64::from(tile_z) * blocks,
        }
    }
}

/// Resets `cell` and runs every generator stage on it.
#[inline]
fn fill_point(
    generator: &dyn Generator,
    transform: Transform,
    origin: Origin,
    (bx, bz): (i32, i32),
    cell: &mut Cell,
) -> GenResult<()> {
    cell.reset();
    let (x, z) = transform.apply(origin.x + i64::from(bx), origin.z + i64::from(bz));
    apply_all(generator, cell, x, z)
}

/// A rectangle of chunks filled by one batched sub-job.
///
/// Chunk ranges are relative to the tile's first inner chunk and include
/// any border the sub-region absorbs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubRegion {
    /// Chunk X range.
    pub chunk_x: Range<i32>,
    /// Chunk Z range.
    pub chunk_z: Range<i32>,
}

impl SubRegion {
    /// Chunks along X.
    #[must_use]
    pub fn width(&self) -> usize {
        self.chunk_x.len()
    }

    /// Chunks along Z.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.chunk_z.len()
    }

    /// The inner (non-border) chunks of this sub-region.
    #[must_use]
    pub fn inner(&self, size: TileSize) -> SubRegion {
        let n = i32::try_from(size.chunks()).unwrap_or(i32::MAX);
        let clamp = |range: &Range<i32>| range.start.max(0)..range.end.min(n);
        SubRegion {
            chunk_x: clamp(&self.chunk_x),
            chunk_z: clamp(&self.chunk_z),
        }
    }

    fn cells_x(&self) -> usize {
        self.width() * CHUNK_SIZE
    }

    fn cell_count(&self) -> usize {
        self.cells_x() * self.depth() * CHUNK_SIZE
    }
}

/// Splits a tile into square sub-jobs, `batch_size` per edge.
///
/// The inner chunk grid is cut into squares of `ceil(chunks / batch_size)`
/// chunks; sub-jobs on the tile edge also take the border beyond them. The
/// result covers every chunk, border included, exactly once.
///
/// `batch_size` is clamped to `1..=chunks`.
#[must_use]
pub fn partition(size: TileSize, batch_size: usize) -> Vec<SubRegion> {
    let chunks = size.chunks();
    let job_edge = chunks.div_ceil(batch_size.clamp(1, chunks));
    let jobs_per_edge = chunks.div_ceil(job_edge);

    let to_i32 = |v: usize| i32::try_from(v).unwrap_or(i32::MAX);
    let border = to_i32(size.border_chunks());
    let span = |job: usize| {
        let mut start = to_i32(job * job_edge);
        let mut end = to_i32(((job + 1) * job_edge).min(chunks));
        if job == 0 {
            start -= border;
        }
        if job + 1 == jobs_per_edge {
            end += border;
        }
        start..end
    };

    let mut regions = Vec::with_capacity(jobs_per_edge * jobs_per_edge);
    for jz in 0..jobs_per_edge {
        for jx in 0..jobs_per_edge {
            regions.push(SubRegion {
                chunk_x: span(jx),
                chunk_z: span(jz),
            });
        }
    }
    regions
}

/// Fills a sub-region's scratch buffer, row-major.
fn fill_region(
    generator: &dyn Generator,
    transform: Transform,
    origin: Origin,
    region: &SubRegion,
    buffer: &mut [Cell],
) -> GenResult<()> {
    let width = region.cells_x();
    let base_x = region.chunk_x.start * CHUNK;
    let base_z = region.chunk_z.start * CHUNK;
    for (index, cell) in buffer.iter_mut().enumerate() {
        let lx = i32::try_from(index % width).unwrap_or(i32::MAX);
        let lz = i32::try_from(index / width).unwrap_or(i32::MAX);
        fill_point(generator, transform, origin, (base_x + lx, base_z + lz), cell)?;
    }
    Ok(())
}

/// Copies a filled scratch buffer into its place in the tile.
fn copy_region(storage: &mut TileStorage, region: &SubRegion, buffer: &[Cell]) {
    let width = region.cells_x();
    for (rz, cz) in region.chunk_z.clone().enumerate() {
        for (rx, cx) in region.chunk_x.clone().enumerate() {
            let Some(mut writer) = storage.gen_chunk(cx, cz) else {
                continue;
            };
            writer.for_each_mut(|x, z, cell| {
                let sx = rx * CHUNK_SIZE + x;
                let sz = rz * CHUNK_SIZE + z;
                cell.copy_from(&buffer[sz * width + sx]);
            });
        }
    }
}

/// Result of one batched sub-job.
type SubJobOutput = (SubRegion, Pooled<Vec<Cell>>, GenResult<()>);

/// Builds tiles from a [`Generator`].
///
/// # Example
///
/// ```rust,ignore
/// let pool = Arc::new(ThreadPool::new(0)?);
/// let tiles = TileGenerator::new(NoiseGenerator::new(seed), pool, TileSize::new(3, 1))
///     .with_batch_size(2)
///     .with_default_filters();
/// let tile = tiles.generate_region(0, 0)?;
/// ```
pub struct TileGenerator {
    generator: Arc<dyn Generator>,
    pool: Arc<ThreadPool>,
    pools: TilePools,
    size: TileSize,
    batch_size: usize,
    filters: Vec<Arc<dyn Filter>>,
    decorators: Vec<Arc<dyn Decorator>>,
    /// Filter scratch space.
    scratch: ObjectPool<Vec<f32>>,
    /// Sub-job scratch buffers.
    buffers: ArrayPool<Cell>,
}

impl TileGenerator {
    /// Idle tile buffers kept by a generator's own pools.
    const DEFAULT_RETAIN: usize = 16;

    /// Creates a sequential generator without post-processing.
    pub fn new(generator: impl Generator + 'static, pool: Arc<ThreadPool>, size: TileSize) -> Self {
        Self::from_arc(Arc::new(generator), pool, size)
    }

    /// Like [`new`](Self::new) for a generator already behind an `Arc`.
    #[must_use]
    pub fn from_arc(generator: Arc<dyn Generator>, pool: Arc<ThreadPool>, size: TileSize) -> Self {
        Self {
            generator,
            pool,
            pools: TilePools::new(Self::DEFAULT_RETAIN),
            size,
            batch_size: 1,
            filters: Vec::new(),
            decorators: Vec::new(),
            scratch: ObjectPool::new(Self::DEFAULT_RETAIN, Vec::new),
            buffers: ArrayPool::new(Self::DEFAULT_RETAIN),
        }
    }

    /// Splits each tile into `batch_size` sub-jobs per edge.
    ///
    /// Batching only happens on pools that support it and with more than
    /// one sub-job.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Draws tile buffers from `pools`.
    #[must_use]
    pub fn with_pools(mut self, pools: TilePools) -> Self {
        self.pools = pools;
        self
    }

    /// Adds a filter. Filters run in insertion order.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Adds a decorator. Decorators run after every filter.
    #[must_use]
    pub fn with_decorator(mut self, decorator: impl Decorator + 'static) -> Self {
        self.decorators.push(Arc::new(decorator));
        self
    }

    /// Adds smoothing, steepness and coast tagging.
    #[must_use]
    pub fn with_default_filters(self) -> Self {
        self.with_filter(Smoothing::default())
            .with_filter(Steepness::default())
            .with_decorator(CoastDecorator::default())
    }

    /// Tile geometry.
    #[must_use]
    pub fn size(&self) -> TileSize {
        self.size
    }

    /// The pools tile buffers come from.
    #[must_use]
    pub fn pools(&self) -> &TilePools {
        &self.pools
    }

    /// The worker pool.
    #[must_use]
    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// The sub-regions a tile is split into.
    #[must_use]
    pub fn sub_regions(&self) -> Vec<SubRegion> {
        partition(self.size, self.batch_size)
    }

    /// Whether tiles are filled by batched sub-jobs.
    #[must_use]
    pub fn is_batched(&self) -> bool {
        self.pool.supports_batching() && self.sub_regions().len() > 1
    }

    /// Builds tile `(tile_x, tile_z)` with post-processing.
    ///
    /// # Errors
    ///
    /// Returns the first generator error, or a pool error if a batched
    /// sub-job could not run. The tile's buffers go back to their pools.
    pub fn generate_region(&self, tile_x: i32, tile_z: i32) -> GenResult<Tile> {
        self.generate(tile_x, tile_z, Transform::IDENTITY, true)
    }

    /// Builds a tile whose sample coordinates pass through `transform`.
    ///
    /// Post-processing runs only if `filters` is set.
    ///
    /// # Errors
    ///
    /// Same as [`generate_region`](Self::generate_region).
    pub fn generate_zoom(
        &self,
        tile_x: i32,
        tile_z: i32,
        transform: Transform,
        filters: bool,
    ) -> GenResult<Tile> {
        self.generate(tile_x, tile_z, transform, filters)
    }

    fn generate(
        &self,
        tile_x: i32,
        tile_z: i32,
        transform: Transform,
        post_process: bool,
    ) -> GenResult<Tile> {
        let start = Instant::now();
        let origin = Origin::of(tile_x, tile_z, self.size);
        let mut storage = TileStorage::new(&self.pools, self.size);

        let batched = self.is_batched();
        if batched {
            self.fill_batched(&mut storage, origin, transform)?;
        } else {
            self.fill_sequential(&mut storage, origin, transform)?;
        }
        if post_process {
            self.post_process(&mut storage);
        }

        tracing::debug!(
            tile_x,
            tile_z,
            batched,
            elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
            "tile generated"
        );
        Ok(Tile::new(tile_x, tile_z, storage))
    }

    fn fill_sequential(
        &self,
        storage: &mut TileStorage,
        origin: Origin,
        transform: Transform,
    ) -> GenResult<()> {
        let border = i32::try_from(self.size.border_chunks()).unwrap_or(0);
        let end = i32::try_from(self.size.chunks()).unwrap_or(0) + border;
        let generator = self.generator.as_ref();

        for cz in -border..end {
            for cx in -border..end {
                let Some(mut writer) = storage.gen_chunk(cx, cz) else {
                    continue;
                };
                let mut result = Ok(());
                writer.for_each_mut(|x, z, cell| {
                    if result.is_ok() {
                        let bx = cx * CHUNK + i32::try_from(x).unwrap_or(0);
                        let bz = cz * CHUNK + i32::try_from(z).unwrap_or(0);
                        result = fill_point(generator, transform, origin, (bx, bz), cell);
                    }
                });
                result?;
            }
        }
        Ok(())
    }

    fn fill_batched(
        &self,
        storage: &mut TileStorage,
        origin: Origin,
        transform: Transform,
    ) -> GenResult<()> {
        let regions = self.sub_regions();
        let (sender, receiver) = crossbeam_channel::unbounded::<SubJobOutput>();

        {
            let mut batch = self.pool.batcher();
            batch.size(regions.len());
            for region in &regions {
                let generator = Arc::clone(&self.generator);
                let mut buffer = self.buffers.get(region.cell_count());
                let region = region.clone();
                let sender = sender.clone();
                batch.submit(move || {
                    let result = fill_region(generator.as_ref(), transform, origin, &region, &mut buffer);
                    // The receiver outlives the batch
                    let _ = sender.send((region, buffer, result));
                })?;
            }
            batch.close();
        }
        drop(sender);

        let mut completed = 0;
        for (region, buffer, result) in receiver.try_iter() {
            result?;
            copy_region(storage, &region, &buffer);
            completed += 1;
        }
        if completed == regions.len() {
            Ok(())
        } else {
            Err(GenerationError::Pool(PoolError::TaskPanicked(format!(
                "{} of {} sub-jobs did not finish",
                regions.len() - completed,
                regions.len()
            ))))
        }
    }

    fn post_process(&self, storage: &mut TileStorage) {
        if !self.filters.is_empty() {
            let mut scratch = self.scratch.get();
            for filter in &self.filters {
                filter.apply(storage, &mut scratch);
            }
        }
        if !self.decorators.is_empty() {
            for cell in storage.cells_mut() {
                for decorator in &self.decorators {
                    decorator.decorate(cell);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::WorldSeed;
    use crate::NoiseGenerator;
    use std::collections::HashMap;

    fn generator(threads: usize, size: TileSize, batch: usize) -> TileGenerator {
        TileGenerator::new(
            NoiseGenerator::new(WorldSeed::new(42)),
            Arc::new(ThreadPool::new(threads).unwrap()),
            size,
        )
        .with_batch_size(batch)
        .with_default_filters()
    }

    #[test]
    fn test_partition_covers_every_chunk_once() {
        for exp in 0..=4 {
            for border in 0..=2 {
                let size = TileSize::new(exp, border);
                for batch in 1..=size.chunks() {
                    let mut seen: HashMap<(i32, i32), usize> = HashMap::new();
                    for region in partition(size, batch) {
                        for cz in region.chunk_z.clone() {
                            for cx in region.chunk_x.clone() {
                                *seen.entry((cx, cz)).or_default() += 1;
                            }
                        }
                    }
                    let gen = size.gen_chunks();
                    assert_eq!(seen.len(), gen * gen, "{size:?} batch {batch}");
                    assert!(seen.values().all(|&n| n == 1), "{size:?} batch {batch}");
                    assert!(seen.keys().all(|&(x, z)| size.contains_gen_chunk(x, z)));
                }
            }
        }
    }

    #[test]
    fn test_four_by_two_by_two_partition() {
        let size = TileSize::new(2, 2);
        let regions = partition(size, 2);
        assert_eq!(regions.len(), 4);
        for region in &regions {
            let inner = region.inner(size);
            assert_eq!((inner.width(), inner.depth()), (2, 2));
        }
        assert_eq!(regions[0].chunk_x, -2..2);
        assert_eq!(regions[3].chunk_x, 2..6);
    }

    #[test]
    fn test_mode_selection() {
        let size = TileSize::new(2, 1);
        assert!(!generator(1, size, 2).is_batched());
        assert!(!generator(2, size, 2).is_batched());
        assert!(!generator(4, size, 1).is_batched());
        assert!(generator(4, size, 2).is_batched());
    }

    #[test]
    fn test_batched_matches_sequential() {
        let size = TileSize::new(2, 2);
        let sequential = Arc::new(generator(1, size, 1).generate_region(3, -2).unwrap());
        let batched = Arc::new(generator(4, size, 2).generate_region(3, -2).unwrap());

        let edge = i32::try_from(size.buffer_edge()).unwrap();
        let border = i32::try_from(size.border_blocks()).unwrap();
        for bz in -border..edge - border {
            for bx in -border..edge - border {
                assert_eq!(sequential.sample(bx, bz), batched.sample(bx, bz), "({bx}, {bz})");
            }
        }
    }

    #[test]
    fn test_zoom_transforms_coordinates() {
        let size = TileSize::new(0, 0);
        let tiles = generator(1, size, 1);
        // A zoom of scale 1 offset by one tile is the neighbouring tile
        let shifted = tiles
            .generate_zoom(0, 0, Transform::new(16.0, 0.0, 1.0), false)
            .unwrap();
        let plain = tiles.generate_zoom(1, 0, Transform::IDENTITY, false).unwrap();
        assert_eq!(shifted.sample(5, 5), plain.sample(5, 5));
    }

    #[test]
    fn test_failed_generation_returns_buffers() {
        struct Broken;
        impl Generator for Broken {
            fn apply_base(&self, _: &mut Cell, x: f32, z: f32) -> GenResult<()> {
                Err(GenerationError::stage("base", x, z, "broken"))
            }
            fn apply_rivers(&self, _: &mut Cell, _: f32, _: f32) -> GenResult<()> {
                Ok(())
            }
            fn apply_climate(&self, _: &mut Cell, _: f32, _: f32) -> GenResult<()> {
                Ok(())
            }
        }

        for threads in [1, 4] {
            let tiles = TileGenerator::new(Broken, Arc::new(ThreadPool::new(threads).unwrap()), TileSize::new(1, 0))
                .with_batch_size(2);
            let err = tiles.generate_region(0, 0).unwrap_err();
            assert!(matches!(err, GenerationError::Generator { stage: "base", .. }));
            assert_eq!(tiles.pools().free_blocks(), 1);
            assert_eq!(tiles.pools().free_chunks(), 1);
        }
    }
}
