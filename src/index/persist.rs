// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable storage for the index: a vector blob and a metadata blob.
//!
//! Vector blobs are named by generation, `vectors.<generation>.bin`, with the
//! layout (little endian):
//!
//! ```text
//! magic "TSVI" | version u16 | dimension u32 | count u64 | count * dimension f32
//! ```
//!
//! `metadata.json` holds the position-aligned record fields, the generation of
//! the vector blob it belongs to and a blake3 checksum of that blob. A save
//! writes a fresh generation first and then replaces `metadata.json` with a
//! single rename, which is the commit point: until that rename the previous
//! pair is untouched. Blobs of older generations are removed afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::store::{l2_norm, DocumentKind, DocumentRecord, IndexState, VectorIndex, UNIT_NORM_TOLERANCE};
use crate::errors::{IndexError, IndexResult};

pub const METADATA_FILE: &str = "metadata.json";

const VECTORS_PREFIX: &str = "vectors.";
const VECTORS_SUFFIX: &str = ".bin";

const MAGIC: &[u8; 4] = b"TSVI";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 8;

#[derive(Debug, Serialize, Deserialize)]
struct MetadataBlob {
    version: u16,
    dimension: usize,
    embedding_model: String,
    generation: u64,
    vectors_file: String,
    vectors_checksum: String,
    documents: Vec<String>,
    dataset_ids: Vec<String>,
    document_types: Vec<String>,
    #[serde(default)]
    column_names: Vec<Option<String>>,
    timestamps: Vec<String>,
}

/// File name of the vector blob for `generation`.
pub fn vectors_file_name(generation: u64) -> String {
    format!("{}{}{}", VECTORS_PREFIX, generation, VECTORS_SUFFIX)
}

fn parse_generation(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(VECTORS_PREFIX)?
        .strip_suffix(VECTORS_SUFFIX)?
        .parse()
        .ok()
}

/// Paths of the artifacts for one index instance.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub dir: PathBuf,
    pub metadata: PathBuf,
}

impl StoragePaths {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            dir: dir.to_path_buf(),
            metadata: dir.join(METADATA_FILE),
        }
    }

    pub fn vectors(&self, generation: u64) -> PathBuf {
        self.dir.join(vectors_file_name(generation))
    }

    /// Vector blobs present in the directory, oldest generation first.
    pub fn vector_files(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(generation) = name.to_str().and_then(parse_generation) {
                files.push((generation, entry.path()));
            }
        }
        files.sort_by_key(|(generation, _)| *generation);
        Ok(files)
    }
}

/// Writes the full state as a new generation, replacing the previous pair.
///
/// On error the previously committed pair is still the one `load` returns.
pub fn save(dir: &Path, state: &IndexState, embedding_model: &str) -> IndexResult<()> {
    fs::create_dir_all(dir).map_err(|e| IndexError::persistence(dir, e))?;
    let paths = StoragePaths::new(dir);
    let previous = paths
        .vector_files()
        .map_err(|e| IndexError::persistence(dir, e))?;
    let generation = previous.last().map_or(1, |(last, _)| last + 1);
    let vectors_path = paths.vectors(generation);

    let vector_blob = encode_vectors(state.vectors());
    let checksum = blake3::hash(&vector_blob).to_hex().to_string();

    let records = state.records();
    let blob = MetadataBlob {
        version: FORMAT_VERSION,
        dimension: state.dimension(),
        embedding_model: embedding_model.to_string(),
        generation,
        vectors_file: vectors_file_name(generation),
        vectors_checksum: checksum,
        documents: records.iter().map(|r| r.text.clone()).collect(),
        dataset_ids: records.iter().map(|r| r.dataset_id.clone()).collect(),
        document_types: records.iter().map(|r| r.kind.as_str().to_string()).collect(),
        column_names: records.iter().map(|r| r.column_name.clone()).collect(),
        timestamps: records.iter().map(|r| r.inserted_at.to_rfc3339()).collect(),
    };
    let metadata_json = serde_json::to_vec_pretty(&blob)
        .map_err(|e| IndexError::persistence(&paths.metadata, io::Error::other(e)))?;

    write_atomic(&vectors_path, &vector_blob)?;
    if let Err(err) = write_atomic(&paths.metadata, &metadata_json) {
        let _ = fs::remove_file(&vectors_path);
        return Err(err);
    }

    for (_, stale) in previous {
        if let Err(e) = fs::remove_file(&stale) {
            tracing::debug!("Failed to remove stale vector blob {}: {}", stale.display(), e);
        }
    }
    Ok(())
}

/// Loads a previously saved state.
///
/// Returns `Ok(None)` when nothing has been saved yet and `CorruptState` when
/// the pair is incomplete, unreadable or inconsistent with itself or with the
/// configured `dimension`.
pub fn load(dir: &Path, dimension: usize) -> IndexResult<Option<IndexState>> {
    let paths = StoragePaths::new(dir);
    if !paths.metadata.exists() {
        let orphans = paths
            .vector_files()
            .map_err(|e| IndexError::corrupt(dir, format!("unreadable: {}", e)))?;
        if orphans.is_empty() {
            return Ok(None);
        }
        return Err(IndexError::corrupt(&paths.metadata, "metadata blob is missing"));
    }

    let metadata_raw = fs::read(&paths.metadata)
        .map_err(|e| IndexError::corrupt(&paths.metadata, format!("unreadable: {}", e)))?;
    let blob: MetadataBlob = serde_json::from_slice(&metadata_raw)
        .map_err(|e| IndexError::corrupt(&paths.metadata, format!("invalid JSON: {}", e)))?;

    if blob.version != FORMAT_VERSION {
        return Err(IndexError::corrupt(
            &paths.metadata,
            format!("unsupported metadata version {}", blob.version),
        ));
    }
    if blob.vectors_file != vectors_file_name(blob.generation) {
        return Err(IndexError::corrupt(
            &paths.metadata,
            format!(
                "vector blob '{}' does not match generation {}",
                blob.vectors_file, blob.generation
            ),
        ));
    }

    let vectors_path = paths.vectors(blob.generation);
    if !vectors_path.exists() {
        return Err(IndexError::corrupt(&vectors_path, "vector blob is missing"));
    }
    let vector_blob = fs::read(&vectors_path)
        .map_err(|e| IndexError::corrupt(&vectors_path, format!("unreadable: {}", e)))?;

    let checksum = blake3::hash(&vector_blob).to_hex().to_string();
    if checksum != blob.vectors_checksum {
        return Err(IndexError::corrupt(
            &vectors_path,
            "checksum does not match metadata",
        ));
    }

    let vectors = decode_vectors(&vector_blob).map_err(|d| IndexError::corrupt(&vectors_path, d))?;
    if vectors.dimension() != dimension || blob.dimension != dimension {
        return Err(IndexError::corrupt(
            &vectors_path,
            format!(
                "stored dimension {} does not match configured dimension {}",
                vectors.dimension(),
                dimension
            ),
        ));
    }
    if let Some(position) = vectors.iter().position(|v| {
        let norm = l2_norm(v);
        !norm.is_finite() || (norm - 1.0).abs() > UNIT_NORM_TOLERANCE
    }) {
        return Err(IndexError::corrupt(
            &vectors_path,
            format!("vector {} is not unit-normalized", position),
        ));
    }

    let records = decode_records(blob).map_err(|d| IndexError::corrupt(&paths.metadata, d))?;
    let state =
        IndexState::from_parts(vectors, records).map_err(|d| IndexError::corrupt(dir, d))?;
    Ok(Some(state))
}

fn decode_records(blob: MetadataBlob) -> Result<Vec<DocumentRecord>, String> {
    let count = blob.documents.len();
    let column_names = if blob.column_names.is_empty() {
        vec![None; count]
    } else {
        blob.column_names
    };

    let lengths = [
        blob.dataset_ids.len(),
        blob.document_types.len(),
        column_names.len(),
        blob.timestamps.len(),
    ];
    if lengths.iter().any(|len| *len != count) {
        return Err(format!(
            "metadata sequences have unequal lengths: documents={} dataset_ids={} document_types={} column_names={} timestamps={}",
            count, lengths[0], lengths[1], lengths[2], lengths[3]
        ));
    }

    blob.documents
        .into_iter()
        .zip(blob.dataset_ids)
        .zip(blob.document_types)
        .zip(column_names)
        .zip(blob.timestamps)
        .map(|((((text, dataset_id), kind), column_name), timestamp)| {
            let kind: DocumentKind = kind.parse()?;
            let inserted_at = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| format!("invalid timestamp '{}': {}", timestamp, e))?
                .with_timezone(&Utc);
            Ok::<_, String>(DocumentRecord {
                text,
                dataset_id,
                kind,
                column_name,
                inserted_at,
            })
        })
        .collect()
}

fn encode_vectors(index: &VectorIndex) -> Vec<u8> {
    let flat = index.as_flat();
    let mut out = Vec::with_capacity(HEADER_LEN + flat.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(index.dimension() as u32).to_le_bytes());
    out.extend_from_slice(&(index.len() as u64).to_le_bytes());
    out.extend(flat.iter().flat_map(|f| f.to_le_bytes()));
    out
}

fn decode_vectors(blob: &[u8]) -> Result<VectorIndex, String> {
    if blob.len() < HEADER_LEN {
        return Err("truncated header".to_string());
    }
    let (header, payload) = blob.split_at(HEADER_LEN);
    if &header[0..4] != MAGIC {
        return Err("bad magic".to_string());
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(format!("unsupported vector format version {}", version));
    }
    let dimension = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header[10..18]);
    let count = u64::from_le_bytes(count_bytes) as usize;

    if dimension == 0 {
        return Err("zero dimension".to_string());
    }
    let expected = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| "vector count overflows".to_string())?;
    if payload.len() != expected {
        return Err(format!(
            "payload is {} bytes, expected {} for {} vectors of dimension {}",
            payload.len(),
            expected,
            count,
            dimension
        ));
    }

    let data = payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(VectorIndex::from_flat(dimension, data))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> IndexResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        IndexError::persistence(&tmp, e)
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        IndexError::persistence(path, e)
    })
}
