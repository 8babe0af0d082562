// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider interface and implementations.
//!
//! The index only depends on the [`EmbeddingProvider`] trait and a stable output
//! dimension. [`connect_provider`] performs the one-time availability check that
//! decides whether the service is ready or runs in degraded mode.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::borrow::Cow;
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::config::{EmbeddingProviderType, IndexSettings};
use crate::errors::{IndexError, IndexResult};

#[cfg(feature = "builtin")]
const DEFAULT_FASTEMBED_BATCH_SIZE: usize = 256;
#[cfg(feature = "builtin")]
const MAX_FASTEMBED_BATCH_SIZE: usize = 1024;
#[cfg(feature = "builtin")]
const DEFAULT_FASTEMBED_MAX_CHARS: usize = 2000;
const DEFAULT_COMMAND_BATCH_SIZE: usize = 64;
const DEFAULT_HASH_BATCH_SIZE: usize = 128;

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Trait for embedding providers.
pub trait EmbeddingProvider: Send {
    /// Returns the model identifier.
    fn model_id(&self) -> &str;

    /// Returns the number of components in every produced vector.
    fn dimension(&self) -> usize;

    /// Returns the batch size used by the provider.
    fn batch_size(&self) -> usize;

    /// Generates embeddings for the given texts.
    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generates an embedding for a single text.
    fn embed_one(&mut self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_texts(&[text.to_string()])?;
        result
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))
    }
}

/// Constructs the provider selected by `settings`.
///
/// Any construction failure is reported as [`IndexError::Unavailable`].
pub fn connect_provider(settings: &IndexSettings) -> IndexResult<Box<dyn EmbeddingProvider>> {
    let model = settings.embedding_model.clone();
    match settings.provider {
        EmbeddingProviderType::Hash => {
            let mut provider = HashEmbedder::new(settings.dimension);
            if let Some(batch_size) = settings.batch_size.filter(|b| *b > 0) {
                provider.batch_size = batch_size;
            }
            Ok(Box::new(provider))
        }
        EmbeddingProviderType::Command => {
            if settings.command.trim().is_empty() {
                return Err(IndexError::Unavailable {
                    model,
                    reason: "no embedding command configured".to_string(),
                });
            }
            let mut provider =
                CommandProvider::new(settings.command.clone(), model, settings.dimension);
            if let Some(batch_size) = settings.batch_size.filter(|b| *b > 0) {
                provider.batch_size = batch_size;
            }
            Ok(Box::new(provider))
        }
        EmbeddingProviderType::Builtin => connect_builtin(settings),
    }
}

#[cfg(feature = "builtin")]
fn connect_builtin(settings: &IndexSettings) -> IndexResult<Box<dyn EmbeddingProvider>> {
    let unavailable = |reason: String| IndexError::Unavailable {
        model: settings.embedding_model.clone(),
        reason,
    };

    let config = EmbeddingProviderConfig::for_settings(settings)
        .map_err(|e| unavailable(format!("{:#}", e)))?;
    if config.dimension != settings.dimension {
        return Err(unavailable(format!(
            "model produces {}-dim vectors but the index is configured for {}",
            config.dimension, settings.dimension
        )));
    }
    let embedder = FastEmbedder::new(config).map_err(|e| unavailable(format!("{:#}", e)))?;
    tracing::info!("Loaded embedding model: {}", settings.embedding_model);
    Ok(Box::new(embedder))
}

#[cfg(not(feature = "builtin"))]
fn connect_builtin(settings: &IndexSettings) -> IndexResult<Box<dyn EmbeddingProvider>> {
    Err(IndexError::Unavailable {
        model: settings.embedding_model.clone(),
        reason: "built without the `builtin` embedding feature".to_string(),
    })
}

/// Configuration for the builtin fastembed provider.
#[cfg(feature = "builtin")]
#[derive(Debug, Clone)]
pub struct EmbeddingProviderConfig {
    pub model: fastembed::EmbeddingModel,
    pub model_id: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub max_chars: usize,
}

#[cfg(feature = "builtin")]
impl EmbeddingProviderConfig {
    /// Resolves the configured model and batch limits.
    ///
    /// `FASTEMBED_BATCH_SIZE` and `FASTEMBED_MAX_CHARS` override the file settings.
    pub fn for_settings(settings: &IndexSettings) -> Result<Self> {
        let (model, dimension) = parse_model(&settings.embedding_model)?;

        let configured_batch = settings.batch_size.unwrap_or(DEFAULT_FASTEMBED_BATCH_SIZE);
        let mut batch_size = parse_usize_env("FASTEMBED_BATCH_SIZE", configured_batch)?;
        if batch_size == 0 {
            batch_size = DEFAULT_FASTEMBED_BATCH_SIZE;
        }
        if batch_size > MAX_FASTEMBED_BATCH_SIZE {
            tracing::warn!(
                "FASTEMBED_BATCH_SIZE={} exceeds max {}; clamping.",
                batch_size,
                MAX_FASTEMBED_BATCH_SIZE
            );
            batch_size = MAX_FASTEMBED_BATCH_SIZE;
        }

        let configured_chars = settings.max_chars.unwrap_or(DEFAULT_FASTEMBED_MAX_CHARS);
        let mut max_chars = parse_usize_env("FASTEMBED_MAX_CHARS", configured_chars)?;
        if max_chars == 0 {
            max_chars = DEFAULT_FASTEMBED_MAX_CHARS;
        }

        Ok(Self {
            model,
            model_id: settings.embedding_model.clone(),
            dimension,
            batch_size,
            max_chars,
        })
    }
}

/// FastEmbed provider running a local sentence-transformers model.
#[cfg(feature = "builtin")]
pub struct FastEmbedder {
    embedder: fastembed::TextEmbedding,
    config: EmbeddingProviderConfig,
}

#[cfg(feature = "builtin")]
impl FastEmbedder {
    pub fn new(config: EmbeddingProviderConfig) -> Result<Self> {
        let init = fastembed::InitOptions::new(config.model.clone());
        let embedder = fastembed::TextEmbedding::try_new(init)
            .context("Failed to initialize fastembed model")?;

        Ok(Self { embedder, config })
    }
}

#[cfg(feature = "builtin")]
impl EmbeddingProvider for FastEmbedder {
    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = truncate_texts(texts, self.config.max_chars);
        let embeddings = self
            .embedder
            .embed(&prepared, Some(self.config.batch_size))?;
        Ok(embeddings)
    }
}

#[cfg(feature = "builtin")]
fn parse_model(raw: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel;

    let value = raw.trim();
    if value.is_empty() {
        return Ok((EmbeddingModel::AllMiniLML6V2, 384));
    }

    match value.to_lowercase().as_str() {
        "minilm"
        | "all-minilm-l6-v2"
        | "allminilm-l6-v2"
        | "sentence-transformers/all-minilm-l6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "all-minilm-l12-v2" | "sentence-transformers/all-minilm-l12-v2" => {
            Ok((EmbeddingModel::AllMiniLML12V2, 384))
        }
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        other => bail!(
            "Unsupported embedding model '{}'. Supported values: all-MiniLM-L6-v2, all-MiniLM-L12-v2, bge-small-en-v1.5",
            other
        ),
    }
}

/// Command provider that shells out to an external process.
///
/// The command receives `{"model": ..., "texts": [...]}` on stdin and prints
/// either a JSON array of vectors or an object holding one under
/// `embeddings`, `vectors` or `data`.
pub struct CommandProvider {
    command: String,
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl CommandProvider {
    pub fn new(command: String, model: String, dimension: usize) -> Self {
        Self {
            command,
            model,
            dimension,
            batch_size: DEFAULT_COMMAND_BATCH_SIZE,
        }
    }

    fn run_command(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = serde_json::json!({
            "model": self.model,
            "texts": texts,
        });

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn embedding command: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload_str = payload.to_string();
            stdin
                .write_all(payload_str.as_bytes())
                .context("Failed to write embeddings payload to stdin")?;
        }

        let output = child
            .wait_with_output()
            .context("Failed to read embeddings command output")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Embedding command failed (status {}): {}",
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_command_output(stdout.trim())
    }
}

impl EmbeddingProvider for CommandProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size.max(1)) {
            let batch = self.run_command(chunk)?;
            if batch.len() != chunk.len() {
                bail!(
                    "Embedding command returned {} vectors for {} texts",
                    batch.len(),
                    chunk.len()
                );
            }
            vectors.extend(batch);
        }
        Ok(vectors)
    }
}

fn parse_command_output(raw: &str) -> Result<Vec<Vec<f32>>> {
    let parsed: Value = serde_json::from_str(raw)
        .with_context(|| "Failed to parse embeddings command output as JSON")?;

    let embeddings_value = match parsed {
        Value::Array(arr) => Value::Array(arr),
        Value::Object(ref obj) => {
            if let Some(value) = obj.get("embeddings") {
                value.clone()
            } else if let Some(value) = obj.get("vectors") {
                value.clone()
            } else if let Some(value) = obj.get("data") {
                value.clone()
            } else {
                bail!("Embeddings command output missing 'embeddings' field");
            }
        }
        _ => bail!("Embeddings command output must be JSON array or object"),
    };

    embeddings_value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Embeddings output must be a JSON array"))?
        .iter()
        .map(|row| {
            row.as_array()
                .ok_or_else(|| anyhow::anyhow!("Embedding row must be an array"))?
                .iter()
                .map(|value| {
                    value
                        .as_f64()
                        .ok_or_else(|| anyhow::anyhow!("Embedding value must be a number"))
                        .map(|v| v as f32)
                })
                .collect::<Result<Vec<f32>>>()
        })
        .collect::<Result<Vec<Vec<f32>>>>()
}

/// Deterministic, non-semantic provider based on FNV-1a token hashing.
///
/// Each alphanumeric token is hashed into one of `dimension` buckets with a
/// hash-derived sign, so texts sharing tokens get similar vectors. Texts with
/// no tokens map to a fixed bucket so every output can be normalized.
pub struct HashEmbedder {
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            model: format!("fnv1a-{}", dimension),
            dimension: dimension.max(1),
            batch_size: DEFAULT_HASH_BATCH_SIZE,
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        let mut seen_token = false;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a_hash(token.to_lowercase().as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 1 { 1.0 } else { -1.0 };
            embedding[index] += sign;
            seen_token = true;
        }

        if !seen_token || embedding.iter().all(|v| *v == 0.0) {
            embedding[0] = 1.0;
        }
        embedding
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_texts(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg_attr(not(feature = "builtin"), allow(dead_code))]
fn truncate_texts<'a>(texts: &'a [String], max_chars: usize) -> Vec<Cow<'a, str>> {
    texts
        .iter()
        .map(|text| truncate_to_chars(text.as_str(), max_chars))
        .collect()
}

fn truncate_to_chars<'a>(input: &'a str, max_chars: usize) -> Cow<'a, str> {
    if max_chars == 0 {
        return Cow::Borrowed("");
    }

    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => Cow::Owned(input[..idx].to_string()),
        None => Cow::Borrowed(input),
    }
}

#[cfg_attr(not(feature = "builtin"), allow(dead_code))]
fn parse_usize_env(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => {
            let value = raw.trim();
            if value.is_empty() {
                Ok(default)
            } else {
                value
                    .parse::<usize>()
                    .with_context(|| format!("Invalid {} value: {}", name, value))
            }
        }
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", name)),
    }
}
