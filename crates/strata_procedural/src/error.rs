//! # Generation Error Types
//!
//! All errors that can occur while building, caching or configuring tiles.

use strata_core::PoolError;
use thiserror::Error;

/// Errors that can occur in the terrain pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// A generator stage rejected a sample.
    #[error("generator failed in {stage} at ({x}, {z}): {reason}")]
    Generator {
        /// The stage that failed (`base`, `rivers` or `climate`).
        stage: &'static str,
        /// World block X of the sample.
        x: i32,
        /// World block Z of the sample.
        z: i32,
        /// What went wrong.
        reason: String,
    },

    /// The worker pool failed to run part of the build.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// The tile was released before a chunk view could be opened.
    #[error("tile ({tile_x}, {tile_z}) was released")]
    TileReleased {
        /// Tile X coordinate.
        tile_x: i32,
        /// Tile Z coordinate.
        tile_z: i32,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(String),
}

impl GenerationError {
    /// Builds a [`GenerationError::Generator`] for a sample at world `(x, z)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn stage(stage: &'static str, x: f32, z: f32, reason: impl Into<String>) -> Self {
        Self::Generator {
            stage,
            x: x.floor() as i32,
            z: z.floor() as i32,
            reason: reason.into(),
        }
    }
}

/// Result type for terrain operations.
pub type GenResult<T> = Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_convert() {
        let err: GenerationError = PoolError::Abandoned.into();
        assert_eq!(err, GenerationError::Pool(PoolError::Abandoned));
    }

    #[test]
    fn test_stage_error_message() {
        let err = GenerationError::stage("rivers", -0.5, 17.9, "basin overflow");
        assert_eq!(
            err.to_string(),
            "generator failed in rivers at (-1, 17): basin overflow"
        );
    }
}
