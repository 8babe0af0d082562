// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the similarity index.
//!
//! `Unavailable` is produced once, when the embedding provider cannot be
//! constructed, and is then remembered as degraded mode by the service.
//! Per-call failures (`Embedding`, `Persistence`, ...) are returned to the
//! immediate caller. `CorruptState` is only used inside the repository to
//! classify a rejected on-disk pair before it is logged and discarded.

use std::path::PathBuf;

/// Result alias for index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Errors raised by the index repository and the indexing service.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The embedding provider could not be constructed.
    #[error("Embedder unavailable ({model}): {reason}")]
    Unavailable { model: String, reason: String },

    /// An operation that needs a loaded index was called before `initialize()`.
    #[error("Index has not been initialized")]
    NotInitialized,

    /// The embedding provider failed for a batch.
    #[error("Embedding failed for model {model}: {source}")]
    Embedding {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    /// The provider returned a vector with the wrong number of components.
    #[error("Dimension mismatch: index has {expected}-dim vectors, embedder returned {found}-dim")]
    DimensionMismatch { expected: usize, found: usize },

    /// A vector with zero or non-finite norm cannot be unit-normalized.
    #[error("Vector at batch position {position} cannot be normalized (zero or non-finite norm)")]
    DegenerateVector { position: usize },

    /// Writing the index artifacts failed.
    #[error("Failed to persist index to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// On-disk state was unreadable or inconsistent.
    #[error("Corrupt index state at {path}: {detail}")]
    CorruptState { path: PathBuf, detail: String },

    /// The input table is malformed.
    #[error("Invalid table: {0}")]
    Table(String),
}

impl IndexError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        IndexError::CorruptState {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the service must run in degraded mode.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, IndexError::Unavailable { .. })
    }
}
