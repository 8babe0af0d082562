// SPDX-License-Identifier: MIT OR Apache-2.0

//! tabsim - Similarity index for tabular datasets
//!
//! Command-line front end over the similarity indexing service.

mod cli;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Commands, OutputFormat};
use serde::Serialize;
use tabsim::output::{render_matches, render_stats, use_colors};
use tabsim::{Config, SimilarityIndexingService, Table};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize tracing with TABSIM_LOG env var (e.g., TABSIM_LOG=debug tabsim stats)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TABSIM_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    let mut settings = Config::load().settings();
    if let Some(dir) = cli.storage_dir {
        settings = settings.with_storage_dir(dir);
    }
    if let Some(threshold) = cli.threshold {
        settings = settings.with_threshold(threshold);
    }
    let service = SimilarityIndexingService::new(settings);

    match cli.command {
        Commands::Index {
            dataset_id,
            csv,
            insights,
        } => {
            let table = Table::from_csv_path(&csv)?;
            let prior = insights.map(|text| serde_json::json!({ "insights": text }));
            let count = service
                .try_index_table(&dataset_id, &table, prior.as_ref())
                .with_context(|| format!("Failed to index {}", csv.display()))?;
            match format {
                OutputFormat::Json => emit_json(&serde_json::json!({
                    "dataset_id": dataset_id,
                    "documents": count,
                }))?,
                OutputFormat::Text => println!("Indexed {} documents for {}", count, dataset_id),
            }
        }
        Commands::SimilarTables { csv, top_k } => {
            let table = Table::from_csv_path(&csv)?;
            let matches = service.find_similar_tables(&table, top_k);
            match format {
                OutputFormat::Json => emit_json(&matches)?,
                OutputFormat::Text => print!("{}", render_matches(&matches, use_colors())),
            }
        }
        Commands::SimilarColumns {
            csv,
            column,
            top_k,
        } => {
            let table = Table::from_csv_path(&csv)?;
            let Some(values) = table.column(&column) else {
                bail!("Column '{}' not found in {}", column, csv.display());
            };
            let matches = service.find_similar_columns(&column, &values.values, top_k);
            match format {
                OutputFormat::Json => emit_json(&matches)?,
                OutputFormat::Text => print!("{}", render_matches(&matches, use_colors())),
            }
        }
        Commands::Stats => {
            service.initialize();
            let stats = service.stats();
            match format {
                OutputFormat::Json => emit_json(&stats)?,
                OutputFormat::Text => print!("{}", render_stats(&stats, use_colors())),
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "tabsim", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
