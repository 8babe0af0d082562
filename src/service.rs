// SPDX-License-Identifier: MIT OR Apache-2.0

//! Similarity indexing service.
//!
//! Glues the description builder and the embedder to the index repository.
//! Every verb initializes the repository lazily; when the embedder cannot be
//! constructed the service stays in degraded mode and the verbs return
//! `false` or empty results instead of failing.

use serde_json::Value;

use crate::config::IndexSettings;
use crate::describe::DescriptionBuilder;
use crate::errors::{IndexError, IndexResult};
use crate::index::{DocumentKind, IndexRepository, IndexStats, Match, NewDocument};
use crate::table::{CellValue, Column, Table};

/// Default number of results for table lookups.
pub const DEFAULT_TABLE_TOP_K: usize = 5;
/// Default number of results for column lookups.
pub const DEFAULT_COLUMN_TOP_K: usize = 10;

/// Service handle, constructed once and shared (e.g. behind an `Arc`).
pub struct SimilarityIndexingService {
    repository: IndexRepository,
    describer: DescriptionBuilder,
}

impl SimilarityIndexingService {
    pub fn new(settings: IndexSettings) -> Self {
        Self::with_repository(IndexRepository::new(settings))
    }

    pub fn with_repository(repository: IndexRepository) -> Self {
        Self {
            repository,
            describer: DescriptionBuilder::default(),
        }
    }

    pub fn repository(&self) -> &IndexRepository {
        &self.repository
    }

    pub fn describer(&self) -> &DescriptionBuilder {
        &self.describer
    }

    /// Initializes the repository, returning whether the index is usable.
    pub fn initialize(&self) -> bool {
        match self.repository.initialize() {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("Similarity index not ready: {}", err);
                false
            }
        }
    }

    /// Indexes one overview document plus one document per column.
    ///
    /// Returns `false` when the service is degraded or the batch failed.
    pub fn index_table(&self, dataset_id: &str, table: &Table, prior_analysis: Option<&Value>) -> bool {
        match self.try_index_table(dataset_id, table, prior_analysis) {
            Ok(_) => true,
            Err(err) if err.is_unavailable() => false,
            Err(err) => {
                tracing::error!("Failed to index dataset {}: {}", dataset_id, err);
                false
            }
        }
    }

    /// Like [`index_table`](Self::index_table) but reports why indexing failed.
    pub fn try_index_table(
        &self,
        dataset_id: &str,
        table: &Table,
        prior_analysis: Option<&Value>,
    ) -> IndexResult<usize> {
        if dataset_id.trim().is_empty() {
            return Err(IndexError::Table("dataset id must not be empty".to_string()));
        }
        self.repository.initialize()?;

        let mut documents = Vec::with_capacity(table.column_count() + 1);
        documents.push(NewDocument::overview(
            dataset_id,
            self.describer.dataset_overview(table, prior_analysis),
        ));
        for column in table.columns() {
            documents.push(NewDocument::column(
                dataset_id,
                column.name.clone(),
                self.describer.column_description(column),
            ));
        }

        self.repository.add(documents)
    }

    /// Finds indexed documents similar to the overview of `query_table`.
    pub fn find_similar_tables(&self, query_table: &Table, top_k: usize) -> Vec<Match> {
        let query = self.describer.dataset_overview(query_table, None);
        self.search(&query, top_k, None)
    }

    /// Finds indexed column documents similar to the given column.
    pub fn find_similar_columns(
        &self,
        column_name: &str,
        column_values: &[CellValue],
        top_k: usize,
    ) -> Vec<Match> {
        let column = Column::new(column_name, column_values.to_vec());
        let query = self.describer.column_description(&column);
        self.search(&query, top_k, Some(DocumentKind::ColumnMetadata))
    }

    pub fn stats(&self) -> IndexStats {
        self.repository.stats()
    }

    fn search(&self, query: &str, top_k: usize, kind_filter: Option<DocumentKind>) -> Vec<Match> {
        if !self.initialize() {
            return Vec::new();
        }
        match self.repository.search(query, top_k, kind_filter) {
            Ok(matches) => matches,
            Err(err) => {
                tracing::error!("Similarity search failed: {}", err);
                Vec::new()
            }
        }
    }
}
