// SPDX-License-Identifier: MIT OR Apache-2.0

//! The index repository: owns the in-memory state, the embedder and the
//! on-disk artifacts as one unit.
//!
//! Locking: the state sits behind a read-write lock and `add` calls are
//! serialized by a separate writer gate. An `add` embeds first, then builds the
//! appended state on a copy and persists it while readers keep using the
//! current state; the copy is swapped in under the write lock only once it is
//! on disk. Searches therefore observe either the pre-add or the post-add
//! state, and a failed `add` leaves nothing behind.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;

use super::persist;
use super::store::{l2_normalize, DocumentKind, IndexState, Match, NewDocument};
use crate::config::IndexSettings;
use crate::embedding::{connect_provider, EmbeddingProvider};
use crate::errors::{IndexError, IndexResult};

type Connector =
    Box<dyn Fn(&IndexSettings) -> IndexResult<Box<dyn EmbeddingProvider>> + Send + Sync>;

/// Successful initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Vectors available right after initialization
    pub total_vectors: usize,
}

/// Index statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub initialized: bool,
    pub total_vectors: usize,
    pub dimension: usize,
    pub embedding_model: String,
    pub distinct_dataset_count: usize,
    pub count_by_kind: BTreeMap<String, usize>,
}

enum Availability {
    Uninitialized,
    Ready,
    Unavailable { model: String, reason: String },
}

/// Owner of the vector index and its metadata.
pub struct IndexRepository {
    settings: IndexSettings,
    connector: Connector,
    availability: Mutex<Availability>,
    embedder: Mutex<Option<Box<dyn EmbeddingProvider>>>,
    write_gate: Mutex<()>,
    state: RwLock<Option<IndexState>>,
}

impl IndexRepository {
    /// Creates a repository using the provider selected in `settings`.
    pub fn new(settings: IndexSettings) -> Self {
        Self::with_connector(settings, connect_provider)
    }

    /// Creates a repository with a custom embedder constructor.
    pub fn with_connector<F>(settings: IndexSettings, connector: F) -> Self
    where
        F: Fn(&IndexSettings) -> IndexResult<Box<dyn EmbeddingProvider>> + Send + Sync + 'static,
    {
        Self {
            settings,
            connector: Box::new(connector),
            availability: Mutex::new(Availability::Uninitialized),
            embedder: Mutex::new(None),
            write_gate: Mutex::new(()),
            state: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Connects the embedder and loads (or creates) the index.
    ///
    /// Idempotent once it has succeeded. An `Unavailable` failure is cached and
    /// returned again on later calls without retrying.
    pub fn initialize(&self) -> IndexResult<Ready> {
        let mut availability = self.availability.lock();
        match &*availability {
            Availability::Ready => {
                return Ok(Ready {
                    total_vectors: self.len(),
                })
            }
            Availability::Unavailable { model, reason } => {
                return Err(IndexError::Unavailable {
                    model: model.clone(),
                    reason: reason.clone(),
                })
            }
            Availability::Uninitialized => {}
        }

        let provider = match (self.connector)(&self.settings) {
            Ok(provider) => provider,
            Err(err) => {
                let (model, reason) = match &err {
                    IndexError::Unavailable { model, reason } => (model.clone(), reason.clone()),
                    other => (self.settings.embedding_model.clone(), other.to_string()),
                };
                tracing::warn!(
                    "Embedding model {} unavailable, similarity index disabled: {}",
                    model,
                    reason
                );
                *availability = Availability::Unavailable {
                    model: model.clone(),
                    reason: reason.clone(),
                };
                return Err(IndexError::Unavailable { model, reason });
            }
        };

        if provider.dimension() != self.settings.dimension {
            let reason = format!(
                "embedder produces {}-dim vectors, index is configured for {}",
                provider.dimension(),
                self.settings.dimension
            );
            tracing::warn!("{}", reason);
            let model = provider.model_id().to_string();
            *availability = Availability::Unavailable {
                model: model.clone(),
                reason: reason.clone(),
            };
            return Err(IndexError::Unavailable { model, reason });
        }

        let state = self.load_or_create();
        let total_vectors = state.len();
        *self.embedder.lock() = Some(provider);
        *self.state.write() = Some(state);
        *availability = Availability::Ready;

        Ok(Ready { total_vectors })
    }

    fn load_or_create(&self) -> IndexState {
        let dir = &self.settings.storage_dir;
        match persist::load(dir, self.settings.dimension) {
            Ok(Some(state)) => {
                tracing::info!("Loaded existing index with {} vectors", state.len());
                state
            }
            Ok(None) => {
                tracing::info!("Created new index in {}", dir.display());
                IndexState::empty(self.settings.dimension)
            }
            Err(err) => {
                tracing::warn!("Discarding stored index, starting empty: {}", err);
                IndexState::empty(self.settings.dimension)
            }
        }
    }

    /// Number of indexed vectors (0 when uninitialized).
    pub fn len(&self) -> usize {
        self.state.read().as_ref().map(IndexState::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embeds, normalizes, appends and persists a batch of documents.
    ///
    /// All-or-nothing: on any failure the in-memory state is left as it was
    /// and the previous artifacts on disk are kept.
    pub fn add(&self, documents: Vec<NewDocument>) -> IndexResult<usize> {
        if !self.is_initialized() {
            return Err(IndexError::NotInitialized);
        }
        if documents.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let vectors = self.embed_normalized(&texts)?;
        let count = documents.len();
        let model = self.model_id();

        let _writer = self.write_gate.lock();
        let mut next = match self.state.read().as_ref() {
            Some(state) => state.clone(),
            None => return Err(IndexError::NotInitialized),
        };
        next.append_batch(&vectors, documents, Utc::now());

        if let Err(err) = persist::save(&self.settings.storage_dir, &next, &model) {
            tracing::error!("Failed to save index: {}", err);
            return Err(err);
        }
        *self.state.write() = Some(next);

        tracing::info!("Added {} documents to vector index", count);
        Ok(count)
    }

    /// Ranked search by query text.
    ///
    /// Returns an empty list when the repository is uninitialized or empty.
    pub fn search(
        &self,
        query_text: &str,
        top_k: usize,
        kind_filter: Option<DocumentKind>,
    ) -> IndexResult<Vec<Match>> {
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = self.embed_normalized(&[query_text.to_string()])?;
        let query = vectors.pop().ok_or_else(|| IndexError::Embedding {
            model: self.model_id(),
            source: anyhow::anyhow!("No embedding returned"),
        })?;

        let guard = self.state.read();
        Ok(guard
            .as_ref()
            .map(|state| {
                state.search(&query, top_k, kind_filter, self.settings.similarity_threshold)
            })
            .unwrap_or_default())
    }

    pub fn stats(&self) -> IndexStats {
        let embedding_model = self.model_id();
        let guard = self.state.read();
        match guard.as_ref() {
            Some(state) => IndexStats {
                initialized: true,
                total_vectors: state.len(),
                dimension: state.dimension(),
                embedding_model,
                distinct_dataset_count: state.distinct_dataset_count(),
                count_by_kind: state.count_by_kind(),
            },
            None => IndexStats {
                initialized: false,
                total_vectors: 0,
                dimension: self.settings.dimension,
                embedding_model,
                distinct_dataset_count: 0,
                count_by_kind: BTreeMap::new(),
            },
        }
    }

    fn model_id(&self) -> String {
        self.embedder
            .lock()
            .as_ref()
            .map(|p| p.model_id().to_string())
            .unwrap_or_else(|| self.settings.embedding_model.clone())
    }

    /// Embeds `texts` in provider-sized batches, releasing the embedder between
    /// batches so queries are not stuck behind a large `add`.
    fn embed_normalized(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        let mut start = 0;
        while start < texts.len() {
            let mut guard = self.embedder.lock();
            let provider = guard.as_mut().ok_or(IndexError::NotInitialized)?;
            let model = provider.model_id().to_string();
            let end = texts.len().min(start + provider.batch_size().max(1));
            let chunk = &texts[start..end];

            let batch = provider
                .embed_texts(chunk)
                .map_err(|source| IndexError::Embedding {
                    model: model.clone(),
                    source,
                })?;
            drop(guard);

            if batch.len() != chunk.len() {
                return Err(IndexError::Embedding {
                    model,
                    source: anyhow::anyhow!(
                        "embedder returned {} vectors for {} texts",
                        batch.len(),
                        chunk.len()
                    ),
                });
            }
            vectors.extend(batch);
            start = end;
        }

        for (position, vector) in vectors.iter_mut().enumerate() {
            if vector.len() != self.settings.dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: self.settings.dimension,
                    found: vector.len(),
                });
            }
            if !l2_normalize(vector) {
                return Err(IndexError::DegenerateVector { position });
            }
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::persist::{vectors_file_name, StoragePaths, METADATA_FILE};
    use crate::index::store::l2_norm;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Maps known texts to fixed vectors; anything else fails.
    struct FixedProvider {
        vectors: HashMap<String, Vec<f32>>,
        dimension: usize,
    }

    impl EmbeddingProvider for FixedProvider {
        fn model_id(&self) -> &str {
            "fixed"
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn batch_size(&self) -> usize {
            16
        }

        fn embed_texts(&mut self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            texts
                .iter()
                .map(|t| {
                    self.vectors
                        .get(t)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("unknown text: {}", t))
                })
                .collect()
        }
    }

    fn fixed_repository(dir: &std::path::Path, threshold: f32) -> IndexRepository {
        let settings = IndexSettings::hashed(dir, 2).with_threshold(threshold);
        IndexRepository::with_connector(settings, |_| {
            let vectors = HashMap::from([
                ("east".to_string(), vec![1.0, 0.0]),
                ("north".to_string(), vec![0.0, 1.0]),
                ("mostly east".to_string(), vec![0.9, 0.1]),
                ("zero".to_string(), vec![0.0, 0.0]),
                ("scaled east".to_string(), vec![10.0, 0.0]),
            ]);
            Ok(Box::new(FixedProvider {
                vectors,
                dimension: 2,
            }) as Box<dyn EmbeddingProvider>)
        })
    }

    fn docs(texts: &[&str]) -> Vec<NewDocument> {
        texts
            .iter()
            .map(|t| NewDocument::overview(format!("ds-{}", t), *t))
            .collect()
    }

    #[test]
    fn search_before_initialize_is_empty() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        assert!(repo.search("east", 5, None).unwrap().is_empty());
        assert!(matches!(
            repo.add(docs(&["east"])),
            Err(IndexError::NotInitialized)
        ));
    }

    #[test]
    fn empty_index_search_is_empty() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        repo.initialize().unwrap();
        assert!(repo.search("east", 5, None).unwrap().is_empty());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        assert_eq!(repo.initialize().unwrap().total_vectors, 0);
        repo.add(docs(&["east"])).unwrap();
        assert_eq!(repo.initialize().unwrap().total_vectors, 1);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn ranks_synthetic_vectors() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        repo.initialize().unwrap();
        repo.add(docs(&["east", "north", "mostly east"])).unwrap();

        let results = repo.search("east", 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record.text, "east");
        assert!((results[0].score - 1.0).abs() < 1e-5);
        assert_eq!(results[1].record.text, "mostly east");
        assert!(results.iter().all(|m| m.record.text != "north"));
    }

    #[test]
    fn stored_and_query_vectors_are_normalized() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        repo.initialize().unwrap();
        repo.add(docs(&["scaled east", "mostly east"])).unwrap();

        {
            let guard = repo.state.read();
            for vector in guard.as_ref().unwrap().vectors().iter() {
                assert!((l2_norm(vector) - 1.0).abs() < 1e-5);
            }
        }

        let results = repo.search("scaled east", 1, None).unwrap();
        assert!((results[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn failed_embedding_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        repo.initialize().unwrap();
        repo.add(docs(&["east"])).unwrap();

        let err = repo.add(docs(&["north", "not known"])).unwrap_err();
        assert!(matches!(err, IndexError::Embedding { .. }));
        assert_eq!(repo.len(), 1);

        let err = repo.add(docs(&["north", "zero"])).unwrap_err();
        assert!(matches!(err, IndexError::DegenerateVector { position: 1 }));
        assert_eq!(repo.len(), 1);

        repo.add(docs(&["north", "mostly east"])).unwrap();
        assert_eq!(repo.len(), 3);
    }

    #[test]
    fn failed_persist_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let repo = fixed_repository(&blocker, 0.5);
        repo.initialize().unwrap();

        let err = repo.add(docs(&["east"])).unwrap_err();
        assert!(matches!(err, IndexError::Persistence { .. }));
        assert_eq!(repo.len(), 0);
        assert_eq!(repo.stats().total_vectors, 0);
    }

    #[test]
    fn failed_commit_keeps_stored_index() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        repo.initialize().unwrap();
        repo.add(docs(&["east"])).unwrap();

        let mut blocked = dir.path().join(METADATA_FILE).into_os_string();
        blocked.push(".tmp");
        std::fs::create_dir(&blocked).unwrap();

        let err = repo.add(docs(&["north"])).unwrap_err();
        assert!(matches!(err, IndexError::Persistence { .. }));
        assert_eq!(repo.len(), 1);
        assert_eq!(
            StoragePaths::new(dir.path()).vector_files().unwrap().len(),
            1
        );

        let reopened = fixed_repository(dir.path(), 0.5);
        assert_eq!(reopened.initialize().unwrap().total_vectors, 1);
        let results = reopened.search("east", 5, None).unwrap();
        assert_eq!(results[0].record.text, "east");

        std::fs::remove_dir(&blocked).unwrap();
        repo.add(docs(&["north"])).unwrap();
        let reopened = fixed_repository(dir.path(), 0.5);
        assert_eq!(reopened.initialize().unwrap().total_vectors, 2);
    }

    #[test]
    fn readers_proceed_while_an_add_waits() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(fixed_repository(dir.path(), 0.5));
        repo.initialize().unwrap();
        repo.add(docs(&["east"])).unwrap();

        let gate = repo.write_gate.lock();
        let writer = {
            let repo = repo.clone();
            std::thread::spawn(move || repo.add(docs(&["mostly east"])))
        };
        for _ in 0..10 {
            assert_eq!(repo.len(), 1);
            assert_eq!(repo.search("east", 5, None).unwrap().len(), 1);
            assert_eq!(repo.stats().total_vectors, 1);
        }
        drop(gate);

        assert_eq!(writer.join().unwrap().unwrap(), 1);
        assert_eq!(repo.len(), 2);
        assert_eq!(repo.search("east", 5, None).unwrap().len(), 2);
    }

    /// Records the size of every batch it is asked to embed.
    struct RecordingProvider {
        batches: Arc<Mutex<Vec<usize>>>,
    }

    impl EmbeddingProvider for RecordingProvider {
        fn model_id(&self) -> &str {
            "recording"
        }

        fn dimension(&self) -> usize {
            2
        }

        fn batch_size(&self) -> usize {
            2
        }

        fn embed_texts(&mut self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.batches.lock().push(texts.len());
            Ok(texts.iter().map(|_| vec![1.0, 1.0]).collect())
        }
    }

    #[test]
    fn add_embeds_in_provider_batches() {
        let dir = tempdir().unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let recorded = batches.clone();
        let repo = IndexRepository::with_connector(IndexSettings::hashed(dir.path(), 2), move |_| {
            Ok(Box::new(RecordingProvider {
                batches: recorded.clone(),
            }) as Box<dyn EmbeddingProvider>)
        });
        repo.initialize().unwrap();

        repo.add(docs(&["a", "b", "c", "d", "e"])).unwrap();
        assert_eq!(*batches.lock(), vec![2, 2, 1]);
        assert_eq!(repo.len(), 5);
    }

    #[test]
    fn query_embedding_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let repo = fixed_repository(dir.path(), 0.5);
        repo.initialize().unwrap();
        repo.add(docs(&["east"])).unwrap();
        assert!(matches!(
            repo.search("unknown", 3, None),
            Err(IndexError::Embedding { .. })
        ));
    }

    #[test]
    fn reload_after_add() {
        let dir = tempdir().unwrap();
        {
            let repo = fixed_repository(dir.path(), 0.5);
            repo.initialize().unwrap();
            repo.add(docs(&["east", "north"])).unwrap();
        }
        assert!(dir.path().join(vectors_file_name(1)).exists());
        assert!(dir.path().join(METADATA_FILE).exists());

        let repo = fixed_repository(dir.path(), 0.5);
        assert_eq!(repo.initialize().unwrap().total_vectors, 2);
        let results = repo.search("east", 5, None).unwrap();
        assert_eq!(results[0].record.text, "east");
    }

    #[test]
    fn corrupt_storage_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(vectors_file_name(1)), b"garbage").unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), b"{}").unwrap();

        let repo = fixed_repository(dir.path(), 0.5);
        assert_eq!(repo.initialize().unwrap().total_vectors, 0);
        repo.add(docs(&["east"])).unwrap();

        let reopened = fixed_repository(dir.path(), 0.5);
        assert_eq!(reopened.initialize().unwrap().total_vectors, 1);
    }

    #[test]
    fn unavailable_is_cached() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let settings = IndexSettings::hashed(dir.path(), 8);
        let repo = IndexRepository::with_connector(settings, move |s| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(IndexError::Unavailable {
                model: s.embedding_model.clone(),
                reason: "model artifact missing".to_string(),
            })
        });

        assert!(repo.initialize().unwrap_err().is_unavailable());
        assert!(repo.initialize().unwrap_err().is_unavailable());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(repo.stats().total_vectors, 0);
        assert!(!repo.stats().initialized);
    }

    #[test]
    fn dimension_mismatch_makes_unavailable() {
        let dir = tempdir().unwrap();
        let settings = IndexSettings::hashed(dir.path(), 8);
        let repo = IndexRepository::with_connector(settings, |_| {
            Ok(Box::new(HashEmbedder::new(16)) as Box<dyn EmbeddingProvider>)
        });
        assert!(repo.initialize().unwrap_err().is_unavailable());
    }

    #[test]
    fn concurrent_adds_keep_parity() {
        let dir = tempdir().unwrap();
        let settings = IndexSettings::hashed(dir.path(), 32).with_threshold(-1.0);
        let repo = Arc::new(IndexRepository::new(settings));
        repo.initialize().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let repo = repo.clone();
                std::thread::spawn(move || {
                    for i in 0..5 {
                        let batch = vec![
                            NewDocument::overview(format!("t{}", t), format!("table {} batch {}", t, i)),
                            NewDocument::column(format!("t{}", t), "c", format!("column {} {}", t, i)),
                        ];
                        repo.add(batch).unwrap();
                        let _ = repo.search("table", 3, None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(repo.len(), 40);
        let guard = repo.state.read();
        let state = guard.as_ref().unwrap();
        assert_eq!(state.vectors().len(), state.records().len());
    }
}
