// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration file support for tabsim
//!
//! Loads configuration from .tabsimrc.toml in current directory or ~/.config/tabsim/config.toml

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default embedding dimension for sentence-transformers/all-MiniLM-L6-v2.
pub const DEFAULT_DIMENSION: usize = 384;
/// Default minimum cosine similarity a match must exceed.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;
/// Default directory holding the vector and metadata artifacts.
pub const DEFAULT_STORAGE_DIR: &str = "./data/vector_db";
/// Default embedding model identifier.
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

/// Embedding provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderType {
    #[default]
    Builtin,
    Command,
    Hash,
}

/// Index configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Embedding dimension
    pub dimension: Option<usize>,
    /// Scores at or below this value are dropped from search results
    pub similarity_threshold: Option<f32>,
    /// Directory holding the vector blob and metadata.json
    pub storage_dir: Option<PathBuf>,
}

impl IndexConfig {
    /// Get dimension (defaults to 384)
    pub fn dimension(&self) -> usize {
        self.dimension
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_DIMENSION)
    }

    /// Get similarity threshold (defaults to 0.7)
    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD)
    }

    /// Get storage directory (defaults to ./data/vector_db)
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR))
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider type (builtin, command, hash)
    pub provider: Option<EmbeddingProviderType>,
    /// Model identifier for the embedding provider
    pub model: Option<String>,
    /// Command to execute for command provider
    pub command: Option<String>,
    /// Texts per provider call
    pub batch_size: Option<usize>,
    /// Texts are truncated to this many characters before embedding
    pub max_chars: Option<usize>,
}

impl EmbeddingConfig {
    /// Get provider type (defaults to Builtin)
    pub fn provider(&self) -> EmbeddingProviderType {
        self.provider.unwrap_or_default()
    }

    /// Get model identifier (defaults to "all-MiniLM-L6-v2")
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_EMBEDDING_MODEL)
    }

    /// Get command (defaults to "embedder")
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or("embedder")
    }
}

/// Configuration loaded from .tabsimrc.toml or ~/.config/tabsim/config.toml
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Embedding configuration
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
}

impl Config {
    /// Load configuration from files
    ///
    /// Precedence (highest to lowest):
    /// 1. .tabsimrc.toml in current directory
    /// 2. ~/.config/tabsim/config.toml
    pub fn load() -> Self {
        if let Some(config) = Self::load_from_path(Path::new(".tabsimrc.toml")) {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let config_path = home.join(".config").join("tabsim").join("config.toml");
            if let Some(config) = Self::load_from_path(&config_path) {
                return config;
            }
        }

        Self::default()
    }

    /// Load a specific config file, returning None if it is missing or invalid.
    pub fn load_from_path(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Resolve the immutable settings used to construct the service.
    pub fn settings(&self) -> IndexSettings {
        IndexSettings {
            dimension: self.index.dimension(),
            similarity_threshold: self.index.similarity_threshold(),
            storage_dir: self.index.storage_dir(),
            embedding_model: self.embeddings.model().to_string(),
            provider: self.embeddings.provider(),
            command: self.embeddings.command().to_string(),
            batch_size: self.embeddings.batch_size,
            max_chars: self.embeddings.max_chars,
        }
    }
}

/// Settings supplied at service construction and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    pub dimension: usize,
    pub similarity_threshold: f32,
    pub storage_dir: PathBuf,
    pub embedding_model: String,
    pub provider: EmbeddingProviderType,
    /// Shell command used by the command provider
    pub command: String,
    pub batch_size: Option<usize>,
    pub max_chars: Option<usize>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Config::default().settings()
    }
}

impl IndexSettings {
    /// Settings for the deterministic hash provider rooted at `storage_dir`.
    pub fn hashed(storage_dir: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            dimension,
            storage_dir: storage_dir.into(),
            embedding_model: "fnv1a-hash".to_string(),
            provider: EmbeddingProviderType::Hash,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }
}
