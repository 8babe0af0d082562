// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use tabsim::config::EmbeddingProviderType;
use tabsim::embedding::EmbeddingProvider;
use tabsim::index::{vectors_file_name, IndexRepository, StoragePaths, METADATA_FILE};
use tabsim::{
    CellValue, Column, DocumentKind, IndexError, IndexSettings, SimilarityIndexingService, Table,
};

/// Returns the same direction for every text, so every stored document ties.
struct ConstantProvider {
    dimension: usize,
}

impl EmbeddingProvider for ConstantProvider {
    fn model_id(&self) -> &str {
        "constant"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn batch_size(&self) -> usize {
        8
    }

    fn embed_texts(&mut self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![2.0; self.dimension]).collect())
    }
}

fn constant_service(dir: &Path) -> SimilarityIndexingService {
    let repo = IndexRepository::with_connector(IndexSettings::hashed(dir, 4), |s| {
        Ok(Box::new(ConstantProvider {
            dimension: s.dimension,
        }) as Box<dyn EmbeddingProvider>)
    });
    SimilarityIndexingService::with_repository(repo)
}

fn hashed_service(dir: &Path) -> SimilarityIndexingService {
    SimilarityIndexingService::new(IndexSettings::hashed(dir, 256))
}

fn orders_table() -> Table {
    Table::from_csv_reader(
        "order_id,customer,amount\n1,acme,10.5\n2,globex,20\n3,acme,\n".as_bytes(),
    )
    .unwrap()
}

fn weather_table() -> Table {
    Table::from_csv_reader(
        "station,temperature,humidity,condition\nOSL,3.5,80,rain\nBER,7.25,65,cloudy\n".as_bytes(),
    )
    .unwrap()
}

#[test]
fn column_search_never_returns_overview() {
    let dir = TempDir::new().unwrap();
    let service = constant_service(dir.path());

    let table = Table::new(vec![
        Column::new("a", vec![1i64.into()]),
        Column::new("b", vec!["x".into()]),
        Column::new("c", vec![2.5f64.into()]),
    ])
    .unwrap();
    assert!(service.index_table("ds", &table, None));
    assert_eq!(service.stats().total_vectors, 4);

    let matches = service.find_similar_columns("a", &[CellValue::from(1i64)], 10);
    assert_eq!(matches.len(), 3);
    assert!(matches.iter().all(|m| m.kind == DocumentKind::ColumnMetadata));
    let ranks: Vec<usize> = matches.iter().map(|m| m.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);

    let names: Vec<&str> = matches
        .iter()
        .filter_map(|m| m.record.column_name.as_deref())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    // Unfiltered search ranks the overview first (same score, inserted first).
    let tables = service.find_similar_tables(&table, 1);
    assert_eq!(tables[0].kind, DocumentKind::DatasetOverview);
}

#[test]
fn similar_tables_prefers_matching_dataset() {
    let dir = TempDir::new().unwrap();
    let service = hashed_service(dir.path());
    assert!(service.index_table("orders", &orders_table(), None));
    assert!(service.index_table("weather", &weather_table(), None));

    let matches = service.find_similar_tables(&orders_table(), 5);
    assert!(!matches.is_empty());
    assert_eq!(matches[0].dataset_id, "orders");
    assert_eq!(matches[0].kind, DocumentKind::DatasetOverview);
    assert!(matches.iter().all(|m| m.score > 0.7));
    for pair in matches.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn similar_columns_finds_identical_column() {
    let dir = TempDir::new().unwrap();
    let service = hashed_service(dir.path());
    assert!(service.index_table("weather", &weather_table(), None));

    let table = weather_table();
    let column = table.column("temperature").unwrap();
    let matches = service.find_similar_columns("temperature", &column.values, 3);
    assert_eq!(matches[0].record.column_name.as_deref(), Some("temperature"));
    assert!((matches[0].score - 1.0).abs() < 1e-5);
}

#[test]
fn index_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let service = hashed_service(dir.path());
        assert!(service.index_table("orders", &orders_table(), None));
    }
    assert!(dir.path().join(vectors_file_name(1)).exists());
    assert!(dir.path().join(METADATA_FILE).exists());

    let service = hashed_service(dir.path());
    assert_eq!(service.stats().total_vectors, 0);
    assert!(service.initialize());
    let stats = service.stats();
    assert_eq!(stats.total_vectors, 4);
    assert_eq!(stats.distinct_dataset_count, 1);

    let matches = service.find_similar_tables(&orders_table(), 1);
    assert_eq!(matches[0].dataset_id, "orders");
}

#[test]
fn corrupted_metadata_is_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let service = hashed_service(dir.path());
        assert!(service.index_table("orders", &orders_table(), None));
    }
    fs::write(dir.path().join(METADATA_FILE), b"{ not json").unwrap();

    let service = hashed_service(dir.path());
    assert!(service.initialize());
    assert_eq!(service.stats().total_vectors, 0);
    assert!(service.find_similar_tables(&orders_table(), 5).is_empty());
}

#[test]
fn interrupted_save_keeps_committed_datasets() {
    let dir = TempDir::new().unwrap();
    let service = hashed_service(dir.path());
    assert!(service.index_table("orders", &orders_table(), None));

    let mut blocked = dir.path().join(METADATA_FILE).into_os_string();
    blocked.push(".tmp");
    fs::create_dir(&blocked).unwrap();
    assert!(!service.index_table("weather", &weather_table(), None));
    assert_eq!(service.stats().total_vectors, 4);

    let restarted = hashed_service(dir.path());
    assert!(restarted.initialize());
    let stats = restarted.stats();
    assert_eq!(stats.total_vectors, 4);
    assert_eq!(stats.distinct_dataset_count, 1);
    assert_eq!(restarted.find_similar_tables(&orders_table(), 1)[0].dataset_id, "orders");
}

#[test]
fn unavailable_embedder_degrades() {
    let dir = TempDir::new().unwrap();
    let mut settings = IndexSettings::hashed(dir.path(), 16);
    settings.provider = EmbeddingProviderType::Command;
    settings.command = String::new();
    let service = SimilarityIndexingService::new(settings);

    assert!(!service.index_table("orders", &orders_table(), None));
    assert!(matches!(
        service.try_index_table("orders", &orders_table(), None),
        Err(IndexError::Unavailable { .. })
    ));
    assert!(service.find_similar_tables(&orders_table(), 5).is_empty());
    assert_eq!(service.stats().total_vectors, 0);
    assert!(StoragePaths::new(dir.path()).vector_files().unwrap().is_empty());
    assert!(!dir.path().join(METADATA_FILE).exists());
}

#[test]
fn parallel_searches_during_indexing() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(hashed_service(dir.path()));
    assert!(service.index_table("orders", &orders_table(), None));

    let writer = {
        let service = service.clone();
        std::thread::spawn(move || {
            for i in 0..5 {
                assert!(service.index_table(&format!("weather-{}", i), &weather_table(), None));
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let service = service.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    let stats = service.stats();
                    assert_eq!((stats.total_vectors - 4) % 5, 0);
                    let _ = service.find_similar_tables(&orders_table(), 3);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(service.stats().total_vectors, 4 + 5 * 5);
}
