// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory index state: unit-normalized vectors plus position-aligned records.
//!
//! Ordinal position is the only join key between a vector and its record, so
//! both halves are only ever appended together.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Indexes with at least this many vectors are scored in parallel.
const PARALLEL_SCAN_THRESHOLD: usize = 4096;

/// Tolerance used when checking that a stored vector has unit length.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// What a document describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    DatasetOverview,
    ColumnMetadata,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::DatasetOverview => "dataset_overview",
            DocumentKind::ColumnMetadata => "column_metadata",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dataset_overview" => Ok(DocumentKind::DatasetOverview),
            "column_metadata" => Ok(DocumentKind::ColumnMetadata),
            other => Err(format!("Unknown document type: {}", other)),
        }
    }
}

/// A document waiting to be embedded and indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub text: String,
    pub dataset_id: String,
    pub kind: DocumentKind,
    pub column_name: Option<String>,
}

impl NewDocument {
    pub fn overview(dataset_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            dataset_id: dataset_id.into(),
            kind: DocumentKind::DatasetOverview,
            column_name: None,
        }
    }

    pub fn column(
        dataset_id: impl Into<String>,
        column_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            dataset_id: dataset_id.into(),
            kind: DocumentKind::ColumnMetadata,
            column_name: Some(column_name.into()),
        }
    }
}

/// Metadata describing one indexed vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub text: String,
    pub dataset_id: String,
    pub kind: DocumentKind,
    pub column_name: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub dataset_id: String,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
    pub kind: DocumentKind,
    /// 1-based rank after filtering
    pub rank: usize,
    pub record: DocumentRecord,
}

/// Exact inner-product index over fixed-dimension vectors stored contiguously.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub(crate) fn from_flat(dimension: usize, data: Vec<f32>) -> Self {
        debug_assert!(dimension > 0 && data.len() % dimension == 0);
        Self { dimension, data }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dimension.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.data.chunks_exact(self.dimension.max(1))
    }

    pub(crate) fn as_flat(&self) -> &[f32] {
        &self.data
    }

    fn push(&mut self, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimension);
        self.data.extend_from_slice(vector);
    }

    /// Inner product of `query` with every stored vector, in insertion order.
    pub fn scores(&self, query: &[f32]) -> Vec<f32> {
        if self.len() >= PARALLEL_SCAN_THRESHOLD {
            self.data
                .par_chunks_exact(self.dimension)
                .map(|v| dot(v, query))
                .collect()
        } else {
            self.iter().map(|v| dot(v, query)).collect()
        }
    }
}

/// Vectors and records kept in lock-step.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexState {
    vectors: VectorIndex,
    records: Vec<DocumentRecord>,
}

impl IndexState {
    pub fn empty(dimension: usize) -> Self {
        Self {
            vectors: VectorIndex::new(dimension),
            records: Vec::new(),
        }
    }

    /// Joins a vector index and records loaded from storage.
    pub(crate) fn from_parts(
        vectors: VectorIndex,
        records: Vec<DocumentRecord>,
    ) -> Result<Self, String> {
        if vectors.len() != records.len() {
            return Err(format!(
                "{} vectors but {} metadata records",
                vectors.len(),
                records.len()
            ));
        }
        Ok(Self { vectors, records })
    }

    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.vectors.len(), self.records.len());
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn records(&self) -> &[DocumentRecord] {
        &self.records
    }

    /// Appends already-normalized vectors with their documents.
    ///
    /// Callers must pass one vector of the index dimension per document.
    pub(crate) fn append_batch(
        &mut self,
        vectors: &[Vec<f32>],
        documents: Vec<NewDocument>,
        inserted_at: DateTime<Utc>,
    ) {
        debug_assert_eq!(vectors.len(), documents.len());
        for (vector, doc) in vectors.iter().zip(documents) {
            self.vectors.push(vector);
            self.records.push(DocumentRecord {
                text: doc.text,
                dataset_id: doc.dataset_id,
                kind: doc.kind,
                column_name: doc.column_name,
                inserted_at,
            });
        }
    }

    /// Exact ranked search with a normalized query vector.
    ///
    /// Scores are sorted descending with a stable sort, so equal scores keep
    /// insertion order. The kind filter and threshold are applied before
    /// truncating to `top_k`.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        kind_filter: Option<DocumentKind>,
        threshold: f32,
    ) -> Vec<Match> {
        if top_k == 0 || self.is_empty() {
            return Vec::new();
        }

        let scores = self.vectors.scores(query);
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        order
            .into_iter()
            .filter(|&idx| kind_filter.map_or(true, |kind| self.records[idx].kind == kind))
            .filter(|&idx| scores[idx] > threshold)
            .take(top_k)
            .enumerate()
            .map(|(i, idx)| {
                let record = self.records[idx].clone();
                Match {
                    dataset_id: record.dataset_id.clone(),
                    score: scores[idx],
                    kind: record.kind,
                    rank: i + 1,
                    record,
                }
            })
            .collect()
    }

    pub fn distinct_dataset_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.dataset_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn count_by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.kind.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Scales `vector` to unit L2 norm in place.
///
/// Returns `false` and leaves the vector untouched when its norm is zero or
/// not finite.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    true
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        assert!(l2_normalize(&mut v));
        v
    }

    fn state_with(vectors: &[Vec<f32>], kinds: &[DocumentKind]) -> IndexState {
        let dimension = vectors[0].len();
        let mut state = IndexState::empty(dimension);
        let docs = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| NewDocument {
                text: format!("doc {}", i),
                dataset_id: format!("ds{}", i),
                kind: *kind,
                column_name: None,
            })
            .collect();
        let normalized: Vec<Vec<f32>> = vectors.iter().cloned().map(unit).collect();
        state.append_batch(&normalized, docs, Utc::now());
        state
    }

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize(&mut v));
        assert!((l2_norm(&v) - 1.0).abs() < 1e-5);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn normalize_rejects_degenerate_vectors() {
        let mut zero = vec![0.0, 0.0];
        assert!(!l2_normalize(&mut zero));
        let mut nan = vec![f32::NAN, 1.0];
        assert!(!l2_normalize(&mut nan));
    }

    #[test]
    fn ranking_with_synthetic_vectors() {
        let kinds = [DocumentKind::DatasetOverview; 3];
        let state = state_with(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]], &kinds);

        let results = state.search(&[1.0, 0.0], 2, None, 0.5);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].dataset_id, "ds0");
        assert!((results[0].score - 1.0).abs() < 1e-5);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].dataset_id, "ds2");
        assert_eq!(results[1].rank, 2);
    }

    #[test]
    fn threshold_is_exclusive() {
        let kinds = [DocumentKind::DatasetOverview; 2];
        let state = state_with(&[vec![1.0, 0.0], vec![0.0, 1.0]], &kinds);
        let results = state.search(&[1.0, 0.0], 10, None, 0.0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dataset_id, "ds0");
    }

    #[test]
    fn ties_keep_insertion_order() {
        let kinds = [DocumentKind::ColumnMetadata; 3];
        let state = state_with(&[vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 0.0]], &kinds);
        let results = state.search(&[1.0, 0.0], 3, None, 0.5);
        let ids: Vec<&str> = results.iter().map(|m| m.dataset_id.as_str()).collect();
        assert_eq!(ids, vec!["ds1", "ds2"]);
    }

    #[test]
    fn kind_filter_applies_before_truncation() {
        let kinds = [
            DocumentKind::DatasetOverview,
            DocumentKind::ColumnMetadata,
            DocumentKind::ColumnMetadata,
        ];
        let state = state_with(&[vec![1.0, 0.0], vec![0.95, 0.05], vec![0.9, 0.1]], &kinds);
        let results = state.search(&[1.0, 0.0], 1, Some(DocumentKind::ColumnMetadata), 0.5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dataset_id, "ds1");
        assert_eq!(results[0].rank, 1);
    }

    #[test]
    fn from_parts_rejects_mismatch() {
        let vectors = VectorIndex::from_flat(2, vec![1.0, 0.0]);
        assert!(IndexState::from_parts(vectors, Vec::new()).is_err());
    }

    #[test]
    fn parallel_scan_matches_sequential() {
        let dimension = 4;
        let count = PARALLEL_SCAN_THRESHOLD + 10;
        let mut data = Vec::with_capacity(count * dimension);
        for i in 0..count {
            let mut v = vec![(i % 7) as f32 + 1.0, 1.0, (i % 3) as f32, 0.5];
            l2_normalize(&mut v);
            data.extend(v);
        }
        let index = VectorIndex::from_flat(dimension, data);
        let query = unit(vec![1.0, 0.0, 0.0, 0.0]);
        let parallel = index.scores(&query);
        let sequential: Vec<f32> = index.iter().map(|v| dot(v, &query)).collect();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn stats_helpers() {
        let kinds = [
            DocumentKind::DatasetOverview,
            DocumentKind::ColumnMetadata,
            DocumentKind::ColumnMetadata,
        ];
        let state = state_with(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]], &kinds);
        assert_eq!(state.distinct_dataset_count(), 3);
        let counts = state.count_by_kind();
        assert_eq!(counts.get("dataset_overview"), Some(&1));
        assert_eq!(counts.get("column_metadata"), Some(&2));
    }
}
