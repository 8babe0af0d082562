// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vector index - unit-normalized embeddings with position-aligned metadata
//!
//! `store` holds the in-memory state and exact inner-product search, `persist`
//! the on-disk artifacts, and `repository` ties them to an embedder.

pub mod persist;
pub mod repository;
pub mod store;

pub use persist::{vectors_file_name, StoragePaths, METADATA_FILE};
pub use repository::{IndexRepository, IndexStats, Ready};
pub use store::{
    l2_normalize, DocumentKind, DocumentRecord, IndexState, Match, NewDocument, VectorIndex,
};
