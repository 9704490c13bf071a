//! # Tiles
//!
//! A tile is a square of chunks plus a border margin, backed by pooled
//! buffers and shared by every consumer reading from it.
//!
//! ## Layout
//!
//! ```text
//!   ┌───────────────────────┐
//!   │ border                │   chunks per edge = 1 << size_exp
//!   │   ┌───────────────┐   │   border         = extra chunks per side
//!   │   │ inner chunks  │   │
//!   │   │ (disposable)  │   │   buffer edge    = (chunks + 2 * border) * 16
//!   │   └───────────────┘   │
//!   │                       │
//!   └───────────────────────┘
//! ```
//!
//! Block coordinates are relative to the first inner cell, so the border
//! is reached with negative coordinates or coordinates past the last chunk.
//!
//! ## Lifecycle
//!
//! ```text
//!   Open ──close()──> Closing ──last view closed──> Released
//!     │                                                 ^
//!     └──────────close() with no open view──────────────┘
//! ```
//!
//! The move to `Released` is a single compare-and-set of the open view
//! count from 0 to a sentinel, so the buffers go back to their pools exactly
//! once and never while a view can still read them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use strata_core::{ArrayPool, PoolStats, Pooled};

use crate::cell::{Cell, CHUNK_SIZE};

/// [`CHUNK_SIZE`] for coordinate math.
#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
const CHUNK: i32 = CHUNK_SIZE as i32;

/// Open-view count of a released tile.
const RELEASED: u32 = u32::MAX;

/// Packs a tile coordinate into a cache key.
///
/// Both halves are truncated to 32 bits: `x | z << 32`.
#[inline]
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub const fn region_id(tile_x: i32, tile_z: i32) -> u64 {
    (tile_x as u32 as u64) | ((tile_z as u32 as u64) << 32)
}

/// Tile geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileSize {
    size_exp: u32,
    border: usize,
}

impl TileSize {
    /// A tile of `1 << size_exp` chunks per edge with `border` extra chunks
    /// on every side.
    #[must_use]
    pub const fn new(size_exp: u32, border: usize) -> Self {
        Self { size_exp, border }
    }

    /// Power-of-two exponent of the chunks per edge.
    #[inline]
    #[must_use]
    pub const fn size_exp(self) -> u32 {
        self.size_exp
    }

    /// Inner chunks per edge.
    #[inline]
    #[must_use]
    pub const fn chunks(self) -> usize {
        1 << self.size_exp
    }

    /// Border chunks per side.
    #[inline]
    #[must_use]
    pub const fn border_chunks(self) -> usize {
        self.border
    }

    /// Inner chunks in the whole tile.
    #[inline]
    #[must_use]
    pub const fn chunk_count(self) -> usize {
        self.chunks() * self.chunks()
    }

    /// Chunks per edge including the border on both sides.
    #[inline]
    #[must_use]
    pub const fn gen_chunks(self) -> usize {
        self.chunks() + 2 * self.border
    }

    /// Inner cells per edge.
    #[inline]
    #[must_use]
    pub const fn blocks(self) -> usize {
        self.chunks() * CHUNK_SIZE
    }

    /// Border cells per side.
    #[inline]
    #[must_use]
    pub const fn border_blocks(self) -> usize {
        self.border * CHUNK_SIZE
    }

    /// Buffer cells per edge.
    #[inline]
    #[must_use]
    pub const fn buffer_edge(self) -> usize {
        self.gen_chunks() * CHUNK_SIZE
    }

    /// Cells in the whole buffer.
    #[inline]
    #[must_use]
    pub const fn buffer_len(self) -> usize {
        self.buffer_edge() * self.buffer_edge()
    }

    /// Tile holding world chunk `chunk`.
    #[inline]
    #[must_use]
    pub const fn tile_of_chunk(self, chunk: i32) -> i32 {
        chunk >> self.size_exp
    }

    /// Position of world chunk `chunk` inside its tile.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub const fn local_chunk(self, chunk: i32) -> i32 {
        chunk & (self.chunks() as i32 - 1)
    }

    /// Whether inner chunk `(cx, cz)` exists.
    #[inline]
    #[must_use]
    pub fn contains_chunk(self, cx: i32, cz: i32) -> bool {
        let n = self.chunks_i32();
        (0..n).contains(&cx) && (0..n).contains(&cz)
    }

    /// Whether chunk `(cx, cz)` is addressable, border included.
    #[inline]
    #[must_use]
    pub fn contains_gen_chunk(self, cx: i32, cz: i32) -> bool {
        let b = self.border_i32();
        let range = -b..self.chunks_i32() + b;
        range.contains(&cx) && range.contains(&cz)
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    fn chunks_i32(self) -> i32 {
        self.chunks() as i32
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    fn border_i32(self) -> i32 {
        self.border as i32
    }

    /// Buffer index of block `(bx, bz)`, relative to the first inner cell.
    #[inline]
    fn index(self, bx: i32, bz: i32) -> Option<usize> {
        let offset = i64::from(self.border_i32()) * i64::from(CHUNK);
        let ux = usize::try_from(i64::from(bx) + offset).ok()?;
        let uz = usize::try_from(i64::from(bz) + offset).ok()?;
        let edge = self.buffer_edge();
        (ux < edge && uz < edge).then_some(uz * edge + ux)
    }

    /// Index of inner chunk `(cx, cz)` in the slot array.
    #[inline]
    fn slot(self, cx: i32, cz: i32) -> Option<usize> {
        if !self.contains_chunk(cx, cz) {
            return None;
        }
        let cx = usize::try_from(cx).ok()?;
        let cz = usize::try_from(cz).ok()?;
        Some(cz * self.chunks() + cx)
    }
}

impl Default for TileSize {
    /// 8x8 chunks with a 1-chunk border.
    fn default() -> Self {
        Self::new(3, 1)
    }
}

/// Per-chunk bookkeeping.
#[derive(Debug, Default)]
pub struct ChunkSlot {
    /// Set once the chunk has been retired.
    disposed: AtomicBool,
    /// Views opened on this chunk.
    opened: AtomicU32,
}

impl ChunkSlot {
    fn reset(&self) {
        self.disposed.store(false, Ordering::Relaxed);
        self.opened.store(0, Ordering::Relaxed);
    }
}

/// The pools tile buffers are drawn from.
#[derive(Clone)]
pub struct TilePools {
    blocks: ArrayPool<Cell>,
    chunks: ArrayPool<ChunkSlot>,
}

impl TilePools {
    /// Creates pools that keep at most `retain` idle buffers each.
    #[must_use]
    pub fn new(retain: usize) -> Self {
        Self {
            blocks: ArrayPool::new(retain),
            chunks: ArrayPool::new(retain),
        }
    }

    /// Pre-allocates buffers for `count` tiles of `size`.
    pub fn warm(&self, count: usize, size: TileSize) {
        self.blocks.warm(count, size.buffer_len());
        self.chunks.warm(count, size.chunk_count());
    }

    /// Idle cell buffers.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.blocks.free_count()
    }

    /// Idle chunk slot arrays.
    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.chunks.free_count()
    }

    /// Cell buffer pool counters.
    #[must_use]
    pub fn block_stats(&self) -> PoolStats {
        self.blocks.stats()
    }

    /// Chunk slot pool counters.
    #[must_use]
    pub fn chunk_stats(&self) -> PoolStats {
        self.chunks.stats()
    }
}

impl fmt::Debug for TilePools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TilePools")
            .field("free_blocks", &self.free_blocks())
            .field("free_chunks", &self.free_chunks())
            .finish()
    }
}

/// A tile's pooled buffers.
///
/// Dropping the storage resets every cell and slot and hands both buffers
/// back to their pools.
pub struct TileStorage {
    size: TileSize,
    blocks: Pooled<Vec<Cell>>,
    chunks: Pooled<Vec<ChunkSlot>>,
}

impl TileStorage {
    /// Checks out buffers for a tile of `size`.
    #[must_use]
    pub fn new(pools: &TilePools, size: TileSize) -> Self {
        Self {
            size,
            blocks: pools.blocks.get(size.buffer_len()),
            chunks: pools.chunks.get(size.chunk_count()),
        }
    }

    /// Tile geometry.
    #[inline]
    #[must_use]
    pub fn size(&self) -> TileSize {
        self.size
    }

    /// Cells per buffer row.
    #[inline]
    #[must_use]
    pub fn edge(&self) -> usize {
        self.size.buffer_edge()
    }

    /// The whole buffer, row-major.
    #[inline]
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.blocks
    }

    /// The whole buffer, row-major, writable.
    #[inline]
    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.blocks
    }

    /// Cell at block `(bx, bz)`, or [`Cell::ABSENT`] outside the buffer.
    #[inline]
    #[must_use]
    pub fn cell(&self, bx: i32, bz: i32) -> Cell {
        self.size
            .index(bx, bz)
            .map_or(Cell::ABSENT, |index| self.blocks[index])
    }

    /// Cell at buffer position `(ux, uz)`, or [`Cell::ABSENT`] outside it.
    #[inline]
    #[must_use]
    pub fn buffer_cell(&self, ux: usize, uz: usize) -> Cell {
        let edge = self.edge();
        if ux < edge && uz < edge {
            self.blocks[uz * edge + ux]
        } else {
            Cell::ABSENT
        }
    }

    /// Write access to chunk `(cx, cz)`, border chunks included.
    ///
    /// Used only while the tile is being generated.
    pub fn gen_chunk(&mut self, cx: i32, cz: i32) -> Option<ChunkWriter<'_>> {
        if !self.size.contains_gen_chunk(cx, cz) {
            return None;
        }
        let border = self.size.border_i32();
        let origin_x = usize::try_from(cx + border).ok()? * CHUNK_SIZE;
        let origin_z = usize::try_from(cz + border).ok()? * CHUNK_SIZE;
        let edge = self.edge();
        Some(ChunkWriter {
            cells: &mut self.blocks,
            edge,
            origin_x,
            origin_z,
            chunk_x: cx,
            chunk_z: cz,
        })
    }

    fn slot(&self, cx: i32, cz: i32) -> Option<&ChunkSlot> {
        self.size.slot(cx, cz).map(|index| &self.chunks[index])
    }
}

impl Drop for TileStorage {
    fn drop(&mut self) {
        for cell in self.blocks.iter_mut() {
            cell.reset();
        }
        for slot in self.chunks.iter() {
            slot.reset();
        }
    }
}

impl fmt::Debug for TileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileStorage")
            .field("size", &self.size)
            .field("cells", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

/// Write access to one chunk of a tile under construction.
pub struct ChunkWriter<'a> {
    cells: &'a mut [Cell],
    edge: usize,
    origin_x: usize,
    origin_z: usize,
    chunk_x: i32,
    chunk_z: i32,
}

impl ChunkWriter<'_> {
    /// Chunk X relative to the tile's first inner chunk.
    #[inline]
    #[must_use]
    pub fn chunk_x(&self) -> i32 {
        self.chunk_x
    }

    /// Chunk Z relative to the tile's first inner chunk.
    #[inline]
    #[must_use]
    pub fn chunk_z(&self) -> i32 {
        self.chunk_z
    }

    /// Cell `(x, z)` of this chunk, for `x, z < CHUNK_SIZE`.
    #[inline]
    pub fn cell_mut(&mut self, x: usize, z: usize) -> Option<&mut Cell> {
        if x >= CHUNK_SIZE || z >= CHUNK_SIZE {
            return None;
        }
        let index = (self.origin_z + z) * self.edge + self.origin_x + x;
        self.cells.get_mut(index)
    }

    /// Visits every cell of the chunk in row-major order.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(usize, usize, &mut Cell)) {
        for z in 0..CHUNK_SIZE {
            let row = (self.origin_z + z) * self.edge + self.origin_x;
            for (x, cell) in self.cells[row..row + CHUNK_SIZE].iter_mut().enumerate() {
                f(x, z, cell);
            }
        }
    }
}

/// Sent on the disposal channel once every chunk of a tile is retired.
///
/// `serial` tells a tile apart from a later build of the same region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileDisposed {
    /// Cache key of the tile.
    pub region_id: u64,
    /// Build serial of the tile.
    pub serial: u64,
}

/// Lifecycle state of a tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    /// Readable.
    Open,
    /// Close requested; buffers go back when the last view closes.
    Closing,
    /// Buffers returned to their pools.
    Released,
}

/// A generated tile shared between the cache and its readers.
pub struct Tile {
    tile_x: i32,
    tile_z: i32,
    size: TileSize,
    /// `None` once released.
    storage: Mutex<Option<Arc<TileStorage>>>,
    /// Open views, or [`RELEASED`].
    active: AtomicU32,
    /// Set by `close`.
    closing: AtomicBool,
    /// Inner chunks retired so far.
    disposed: AtomicUsize,
    /// Build serial, 0 for tiles built outside a cache.
    serial: u64,
    /// Told once every chunk is retired.
    on_dead: Option<Sender<TileDisposed>>,
}

impl Tile {
    /// Wraps generated storage as tile `(tile_x, tile_z)`.
    #[must_use]
    pub fn new(tile_x: i32, tile_z: i32, storage: TileStorage) -> Self {
        Self {
            tile_x,
            tile_z,
            size: storage.size(),
            storage: Mutex::new(Some(Arc::new(storage))),
            active: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            disposed: AtomicUsize::new(0),
            serial: 0,
            on_dead: None,
        }
    }

    /// Tags the tile with build `serial` and reports it on `channel` once
    /// all chunks are disposed.
    #[must_use]
    pub fn with_disposal_channel(mut self, channel: Sender<TileDisposed>, serial: u64) -> Self {
        self.serial = serial;
        self.on_dead = Some(channel);
        self
    }

    /// Tile X coordinate.
    #[inline]
    #[must_use]
    pub fn tile_x(&self) -> i32 {
        self.tile_x
    }

    /// Tile Z coordinate.
    #[inline]
    #[must_use]
    pub fn tile_z(&self) -> i32 {
        self.tile_z
    }

    /// Cache key of this tile.
    #[inline]
    #[must_use]
    pub fn region_id(&self) -> u64 {
        region_id(self.tile_x, self.tile_z)
    }

    /// Build serial given by the owning cache.
    #[inline]
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Tile geometry.
    #[inline]
    #[must_use]
    pub fn size(&self) -> TileSize {
        self.size
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TileState {
        if self.active.load(Ordering::SeqCst) == RELEASED {
            TileState::Released
        } else if self.closing.load(Ordering::SeqCst) {
            TileState::Closing
        } else {
            TileState::Open
        }
    }

    /// Views currently open.
    #[must_use]
    pub fn active_views(&self) -> u32 {
        match self.active.load(Ordering::SeqCst) {
            RELEASED => 0,
            n => n,
        }
    }

    /// Inner chunks retired so far.
    #[must_use]
    pub fn disposed_chunks(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether every inner chunk has been retired.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.disposed_chunks() >= self.size.chunk_count()
    }

    /// Views ever opened on inner chunk `(cx, cz)`.
    ///
    /// `None` outside the inner grid or once the tile is released.
    #[must_use]
    pub fn chunk_opens(&self, cx: i32, cz: i32) -> Option<u32> {
        self.storage
            .lock()
            .as_ref()
            .and_then(|storage| storage.slot(cx, cz))
            .map(|slot| slot.opened.load(Ordering::Relaxed))
    }

    /// Cell at block `(bx, bz)` relative to the first inner cell.
    ///
    /// Border cells are reachable; anything else, or any cell of a released
    /// tile, is [`Cell::ABSENT`].
    #[must_use]
    pub fn sample(&self, bx: i32, bz: i32) -> Cell {
        self.storage
            .lock()
            .as_ref()
            .map_or(Cell::ABSENT, |storage| storage.cell(bx, bz))
    }

    /// Opens a read view on chunk `(cx, cz)`, border chunks included.
    ///
    /// Out of range coordinates and closing or released tiles yield an
    /// absent view whose samples are all [`Cell::ABSENT`].
    pub fn open_chunk(self: &Arc<Self>, cx: i32, cz: i32) -> ChunkReader {
        if !self.size.contains_gen_chunk(cx, cz) {
            tracing::warn!(
                tile_x = self.tile_x,
                tile_z = self.tile_z,
                cx,
                cz,
                "chunk outside tile"
            );
            return ChunkReader::absent(cx, cz);
        }
        if self.closing.load(Ordering::SeqCst) {
            return ChunkReader::absent(cx, cz);
        }

        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current == RELEASED || current == RELEASED - 1 {
                return ChunkReader::absent(cx, cz);
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // While we hold a view the storage can't be taken
        let storage = self.storage.lock().clone();
        let Some(storage) = storage else {
            self.view_closed();
            return ChunkReader::absent(cx, cz);
        };
        if let Some(slot) = storage.slot(cx, cz) {
            slot.opened.fetch_add(1, Ordering::Relaxed);
        }

        ChunkReader {
            tile: Some(Arc::clone(self)),
            storage: Some(storage),
            chunk_x: cx,
            chunk_z: cz,
        }
    }

    /// Retires inner chunk `(cx, cz)` for good.
    ///
    /// Returns true the first time it is called for a chunk. When the last
    /// chunk is retired a [`TileDisposed`] goes out on the disposal channel.
    pub fn dispose(&self, cx: i32, cz: i32) -> bool {
        let newly = {
            let storage = self.storage.lock();
            storage
                .as_ref()
                .and_then(|storage| storage.slot(cx, cz))
                .is_some_and(|slot| !slot.disposed.swap(true, Ordering::AcqRel))
        };
        if !newly {
            return false;
        }

        let retired = self.disposed.fetch_add(1, Ordering::SeqCst) + 1;
        if retired == self.size.chunk_count() {
            tracing::debug!(tile_x = self.tile_x, tile_z = self.tile_z, "tile fully disposed");
            if let Some(channel) = &self.on_dead {
                // The cache may already be gone
                let _ = channel.send(TileDisposed {
                    region_id: self.region_id(),
                    serial: self.serial,
                });
            }
        }
        true
    }

    /// Requests release of the tile's buffers.
    ///
    /// Releases now if no view is open, otherwise when the last one closes.
    /// Returns true if this call performed the release. Calling it again is
    /// harmless.
    pub fn close(&self) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        self.try_release()
    }

    fn view_closed(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.closing.load(Ordering::SeqCst) {
            self.try_release();
        }
    }

    fn try_release(&self) -> bool {
        if self
            .active
            .compare_exchange(0, RELEASED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let storage = self.storage.lock().take();
        drop(storage);
        tracing::trace!(tile_x = self.tile_x, tile_z = self.tile_z, "tile released");
        true
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("tile_x", &self.tile_x)
            .field("tile_z", &self.tile_z)
            .field("state", &self.state())
            .field("active", &self.active_views())
            .field("disposed", &self.disposed_chunks())
            .finish_non_exhaustive()
    }
}

/// Read view on one chunk of a tile.
///
/// Keeps the tile's buffers alive while open. Dropping or closing the view
/// lets a closing tile release them.
pub struct ChunkReader {
    tile: Option<Arc<Tile>>,
    storage: Option<Arc<TileStorage>>,
    chunk_x: i32,
    chunk_z: i32,
}

impl ChunkReader {
    fn absent(chunk_x: i32, chunk_z: i32) -> Self {
        Self {
            tile: None,
            storage: None,
            chunk_x,
            chunk_z,
        }
    }

    /// Chunk X relative to the tile's first inner chunk.
    #[inline]
    #[must_use]
    pub fn chunk_x(&self) -> i32 {
        self.chunk_x
    }

    /// Chunk Z relative to the tile's first inner chunk.
    #[inline]
    #[must_use]
    pub fn chunk_z(&self) -> i32 {
        self.chunk_z
    }

    /// The tile this view reads from.
    #[must_use]
    pub fn tile(&self) -> Option<&Arc<Tile>> {
        self.tile.as_ref()
    }

    /// Whether this view reads nothing.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.storage.is_none()
    }

    /// Cell `(x, z)` relative to the chunk origin.
    ///
    /// Coordinates may step outside the chunk into neighbouring chunks or
    /// the border; past the buffer the result is [`Cell::ABSENT`].
    #[must_use]
    pub fn get(&self, x: i32, z: i32) -> Cell {
        let Some(storage) = &self.storage else {
            return Cell::ABSENT;
        };
        let bx = self.chunk_x.saturating_mul(CHUNK).saturating_add(x);
        let bz = self.chunk_z.saturating_mul(CHUNK).saturating_add(z);
        storage.cell(bx, bz)
    }

    /// Visits every cell of the chunk in row-major order.
    pub fn for_each(&self, mut f: impl FnMut(usize, usize, &Cell)) {
        for (z, uz) in (0..CHUNK).zip(0_usize..) {
            for (x, ux) in (0..CHUNK).zip(0_usize..) {
                f(ux, uz, &self.get(x, z));
            }
        }
    }

    /// Retires this view's chunk. See [`Tile::dispose`].
    pub fn dispose(&self) -> bool {
        self.tile
            .as_ref()
            .is_some_and(|tile| tile.dispose(self.chunk_x, self.chunk_z))
    }

    /// Closes the view.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        // Storage goes first so a release never races our reference
        self.storage.take();
        if let Some(tile) = self.tile.take() {
            tile.view_closed();
        }
    }
}

impl fmt::Debug for ChunkReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkReader")
            .field("chunk_x", &self.chunk_x)
            .field("chunk_z", &self.chunk_z)
            .field("absent", &self.is_absent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn filled_tile(pools: &TilePools, size: TileSize) -> Arc<Tile> {
        let mut storage = TileStorage::new(pools, size);
        let border = i32::try_from(size.border_chunks()).unwrap();
        let chunks = i32::try_from(size.chunks()).unwrap();
        for cz in -border..chunks + border {
            for cx in -border..chunks + border {
                let mut writer = storage.gen_chunk(cx, cz).unwrap();
                writer.for_each_mut(|x, z, cell| {
                    cell.height = (cx * 100 + cz) as f32 + (x + z) as f32 * 0.001;
                });
            }
        }
        Arc::new(Tile::new(0, 0, storage))
    }

    #[test]
    fn test_region_id_packing() {
        assert_eq!(region_id(0, 0), 0);
        assert_eq!(region_id(1, 0), 1);
        assert_eq!(region_id(0, 1), 1 << 32);
        assert_eq!(region_id(-1, 0), 0xFFFF_FFFF);
        assert_eq!(region_id(-1, -1), u64::MAX);
        assert_ne!(region_id(3, -7), region_id(-7, 3));
    }

    #[test]
    fn test_chunk_to_tile_mapping() {
        let size = TileSize::new(2, 1);
        assert_eq!(size.tile_of_chunk(5), 1);
        assert_eq!(size.local_chunk(5), 1);
        assert_eq!(size.tile_of_chunk(-1), -1);
        assert_eq!(size.local_chunk(-1), 3);
        assert_eq!(size.tile_of_chunk(-4), -1);
        assert_eq!(size.local_chunk(-4), 0);
        assert_eq!(size.buffer_edge(), 6 * CHUNK_SIZE);
    }

    #[test]
    fn test_reader_sees_generated_cells_and_border() {
        let pools = TilePools::new(2);
        let tile = filled_tile(&pools, TileSize::new(1, 1));

        let reader = tile.open_chunk(0, 0);
        assert!(!reader.is_absent());
        assert_eq!(tile.active_views(), 1);
        assert!((reader.get(0, 0).height - 0.0).abs() < 1e-6);
        // One step left of the first inner cell is the border chunk (-1, 0)
        assert!((reader.get(-1, 0).height - (-100.0 + 0.015)).abs() < 1e-4);
        // Past the border
        assert!(reader.get(-17, 0).is_absent());

        drop(reader);
        assert_eq!(tile.active_views(), 0);
    }

    #[test]
    fn test_out_of_range_chunk_is_absent() {
        let pools = TilePools::new(2);
        let tile = filled_tile(&pools, TileSize::new(1, 1));
        let reader = tile.open_chunk(5, 0);
        assert!(reader.is_absent());
        assert!(reader.get(0, 0).is_absent());
        assert_eq!(tile.active_views(), 0);
    }

    #[test]
    fn test_close_releases_once() {
        let pools = TilePools::new(2);
        let tile = filled_tile(&pools, TileSize::new(1, 0));

        assert!(tile.close());
        assert!(!tile.close());
        assert_eq!(tile.state(), TileState::Released);
        assert_eq!(pools.free_blocks(), 1);
        assert_eq!(pools.free_chunks(), 1);
        assert!(tile.open_chunk(0, 0).is_absent());
    }

    #[test]
    fn test_close_waits_for_open_view() {
        let pools = TilePools::new(2);
        let tile = filled_tile(&pools, TileSize::new(1, 0));

        let reader = tile.open_chunk(1, 1);
        assert!(!tile.close());
        assert_eq!(tile.state(), TileState::Closing);
        assert_eq!(pools.free_blocks(), 0);
        // Still readable while open
        assert!(!reader.get(3, 3).is_absent());

        reader.close();
        assert_eq!(tile.state(), TileState::Released);
        assert_eq!(pools.free_blocks(), 1);
    }

    #[test]
    fn test_released_buffers_are_reset() {
        let pools = TilePools::new(1);
        let size = TileSize::new(1, 0);
        let tile = filled_tile(&pools, size);
        tile.close();

        let storage = TileStorage::new(&pools, size);
        assert_eq!(pools.block_stats().reused, 1);
        assert!(storage.cells().iter().all(|cell| *cell == Cell::EMPTY));
    }

    #[test]
    fn test_dispose_signals_once() {
        let pools = TilePools::new(2);
        let size = TileSize::new(1, 0);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let tile = Arc::new(
            Arc::try_unwrap(filled_tile(&pools, size))
                .unwrap()
                .with_disposal_channel(sender, 17),
        );
        assert_eq!(tile.serial(), 17);

        assert!(tile.dispose(0, 0));
        assert!(!tile.dispose(0, 0), "second dispose of a chunk is ignored");
        assert!(!tile.dispose(2, 0), "outside the inner grid");
        assert!(tile.dispose(1, 0));
        assert!(tile.dispose(0, 1));
        assert!(receiver.try_recv().is_err());
        assert!(tile.dispose(1, 1));

        assert_eq!(
            receiver.try_recv(),
            Ok(TileDisposed {
                region_id: region_id(0, 0),
                serial: 17,
            })
        );
        assert!(receiver.try_recv().is_err());
        assert!(tile.is_dead());
    }

    #[test]
    fn test_chunk_opens_counts_views() {
        let pools = TilePools::new(2);
        let tile = filled_tile(&pools, TileSize::new(1, 1));
        assert_eq!(tile.chunk_opens(1, 0), Some(0));

        for _ in 0..3 {
            let _ = tile.open_chunk(1, 0).get(0, 0);
        }
        let border = tile.open_chunk(-1, 0);
        assert!(!border.is_absent());
        assert_eq!(tile.chunk_opens(1, 0), Some(3));
        assert_eq!(tile.chunk_opens(0, 0), Some(0));
        assert_eq!(tile.chunk_opens(-1, 0), None, "border chunks have no slot");

        drop(border);
        assert!(tile.close());
        assert_eq!(tile.chunk_opens(1, 0), None);
    }

    #[test]
    fn test_concurrent_views_and_close() {
        let pools = TilePools::new(4);
        let tile = filled_tile(&pools, TileSize::new(2, 1));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tile = Arc::clone(&tile);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let reader = tile.open_chunk(i % 4, i / 4);
                        let _ = reader.get(i, i);
                        if i == 7 {
                            tile.close();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        tile.close();
        assert_eq!(tile.state(), TileState::Released);
        assert_eq!(pools.free_blocks(), 1);
        assert_eq!(pools.free_chunks(), 1);
    }
}
