//! # Tile Cache Configuration
//!
//! Everything a [`TileCache`](crate::TileCache) needs to know, loadable from
//! TOML. Missing keys fall back to [`TileCacheConfig::default`].
//!
//! ```toml
//! threads = 0            # 0 = one per core
//! batch_size = 2
//! size_exp = 3
//! border_chunks = 1
//! expire_ms = 30000
//! sweep_interval_ms = 5000
//! prefetch_neighbours = false
//! filters = true
//! pool_retain = 64
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GenResult, GenerationError};
use crate::tile::TileSize;

/// Largest supported `size_exp`: 2^8 = 256 chunks per edge.
pub const MAX_SIZE_EXP: u32 = 8;

/// Tile cache settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileCacheConfig {
    /// Worker threads. 0 = available parallelism, 1 = synchronous.
    pub threads: usize,
    /// Batched sub-jobs per tile edge. 1 disables batching.
    pub batch_size: usize,
    /// Tiles are `2^size_exp` chunks on a side.
    pub size_exp: u32,
    /// Extra chunks generated around each tile.
    pub border_chunks: usize,
    /// Idle time after which a tile may be evicted.
    pub expire_ms: u64,
    /// Minimum time between sweeps.
    pub sweep_interval_ms: u64,
    /// Queue the 8 surrounding tiles on every direct lookup.
    pub prefetch_neighbours: bool,
    /// Run smoothing, steepness and coast tagging after generation.
    pub filters: bool,
    /// Idle tile buffers kept for reuse.
    pub pool_retain: usize,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            batch_size: 2,
            size_exp: 3,
            border_chunks: 1,
            expire_ms: 30_000,
            sweep_interval_ms: 5_000,
            prefetch_neighbours: false,
            filters: true,
            pool_retain: 16,
        }
    }
}

impl TileCacheConfig {
    /// Settings for a long-running world server.
    ///
    /// Bigger tiles, eager prefetch, a longer idle window and a deeper pool.
    #[must_use]
    pub fn production() -> Self {
        Self {
            threads: 0,
            batch_size: 4,
            size_exp: 4,
            border_chunks: 1,
            expire_ms: 120_000,
            sweep_interval_ms: 10_000,
            prefetch_neighbours: true,
            filters: true,
            pool_retain: 64,
        }
    }

    /// Single-threaded, short-lived settings for tests and tools.
    #[must_use]
    pub fn synchronous() -> Self {
        Self {
            threads: 1,
            batch_size: 1,
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`GenerationError::InvalidConfig`] on malformed TOML or values
    /// rejected by [`validate`](Self::validate).
    pub fn from_toml_str(source: &str) -> GenResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| GenerationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`GenerationError::Io`] if the file can't be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> GenResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| GenerationError::Io(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!(path = %path.display(), "tile cache config loaded");
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// [`GenerationError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> GenResult<String> {
        toml::to_string(self).map_err(|e| GenerationError::InvalidConfig(e.to_string()))
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`GenerationError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> GenResult<()> {
        let invalid = |msg: String| Err(GenerationError::InvalidConfig(msg));
        if self.size_exp > MAX_SIZE_EXP {
            return invalid(format!(
                "size_exp {} exceeds {MAX_SIZE_EXP}",
                self.size_exp
            ));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_string());
        }
        if self.border_chunks > self.tile_size().chunks() {
            return invalid(format!(
                "border_chunks {} wider than the tile ({} chunks)",
                self.border_chunks,
                self.tile_size().chunks()
            ));
        }
        if self.expire_ms == 0 {
            return invalid("expire_ms must be positive".to_string());
        }
        Ok(())
    }

    /// Tile geometry.
    #[must_use]
    pub fn tile_size(&self) -> TileSize {
        TileSize::new(self.size_exp, self.border_chunks)
    }

    /// Idle window before eviction.
    #[must_use]
    pub fn expire(&self) -> Duration {
        Duration::from_millis(self.expire_ms)
    }

    /// Minimum time between sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TileCacheConfig::default().validate().is_ok());
        assert!(TileCacheConfig::production().validate().is_ok());
        assert!(TileCacheConfig::synchronous().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = TileCacheConfig::from_toml_str("threads = 4\nsize_exp = 2\n").unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.size_exp, 2);
        assert_eq!(config.expire_ms, TileCacheConfig::default().expire_ms);
        assert_eq!(config.tile_size().chunks(), 4);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = TileCacheConfig::production();
        let text = config.to_toml_string().unwrap();
        assert_eq!(TileCacheConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        for source in [
            "size_exp = 9",
            "batch_size = 0",
            "expire_ms = 0",
            "size_exp = 0\nborder_chunks = 2",
            "threads = \"many\"",
        ] {
            assert!(
                matches!(
                    TileCacheConfig::from_toml_str(source),
                    Err(GenerationError::InvalidConfig(_))
                ),
                "{source}"
            );
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = TileCacheConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, GenerationError::Io(_)));
    }
}
