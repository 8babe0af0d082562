// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding module - maps description texts to fixed-dimension vectors
//!
//! The index treats the embedder as an external collaborator: it only relies on
//! the [`EmbeddingProvider`] trait and the provider's reported dimension.

pub mod provider;

#[cfg(feature = "builtin")]
pub use provider::{EmbeddingProviderConfig, FastEmbedder};
pub use provider::{connect_provider, CommandProvider, EmbeddingProvider, HashEmbedder};
