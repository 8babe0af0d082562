// SPDX-License-Identifier: MIT OR Apache-2.0

//! tabsim - Similarity index for tabular datasets
//!
//! Describes tables and columns as text, embeds the descriptions and keeps
//! them in a durable cosine-similarity index that answers "which indexed
//! datasets or columns look like this one?".

pub mod config;
pub mod describe;
pub mod embedding;
pub mod errors;
pub mod index;
pub mod output;
pub mod service;
pub mod table;

pub use config::{Config, IndexSettings};
pub use errors::{IndexError, IndexResult};
pub use index::{DocumentKind, IndexStats, Match};
pub use service::SimilarityIndexingService;
pub use table::{CellValue, Column, Table};
