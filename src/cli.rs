// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// tabsim - Similarity index for tabular datasets
///
/// Indexes CSV datasets as embedded text descriptions and finds
/// previously indexed datasets and columns that look alike.
#[derive(Parser, Debug)]
#[command(name = "tabsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Directory holding the index artifacts (overrides config)
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Minimum similarity a match must exceed (overrides config)
    #[arg(long, global = true)]
    pub threshold: Option<f32>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Index a CSV dataset (one overview plus one document per column)
    Index {
        /// Dataset identifier stored with every document
        dataset_id: String,

        /// CSV file with a header row
        csv: PathBuf,

        /// Prior analysis insight text to include in the overview
        #[arg(long)]
        insights: Option<String>,
    },

    /// Find indexed documents similar to a CSV dataset
    SimilarTables {
        /// CSV file with a header row
        csv: PathBuf,

        /// Maximum number of results
        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
    },

    /// Find indexed columns similar to one column of a CSV dataset
    SimilarColumns {
        /// CSV file with a header row
        csv: PathBuf,

        /// Column to look up
        column: String,

        /// Maximum number of results
        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,
    },

    /// Show index statistics
    Stats,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
