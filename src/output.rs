// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output and color utilities for consistent terminal formatting
//!
//! Provides shared color functions respecting NO_COLOR environment variable.

use colored::Colorize;

use crate::index::{DocumentKind, IndexStats, Match};

/// Check if colors should be used (respects NO_COLOR env var)
pub fn use_colors() -> bool {
    std::env::var("NO_COLOR").is_err()
}

/// Colorize dataset id (cyan)
pub fn colorize_dataset(text: &str, use_color: bool) -> String {
    if use_color {
        text.cyan().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize similarity score (yellow)
pub fn colorize_score(score: f32, use_color: bool) -> String {
    let text = format!("{:.4}", score);
    if use_color {
        text.yellow().to_string()
    } else {
        text
    }
}

/// Colorize document kind (green)
pub fn colorize_kind(kind: DocumentKind, use_color: bool) -> String {
    if use_color {
        kind.as_str().green().to_string()
    } else {
        kind.as_str().to_string()
    }
}

/// Colorize column name (bold)
pub fn colorize_name(text: &str, use_color: bool) -> String {
    if use_color {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize document text (dimmed)
pub fn colorize_document(text: &str, use_color: bool) -> String {
    if use_color {
        text.dimmed().to_string()
    } else {
        text.to_string()
    }
}

/// Render ranked matches, one block per match.
pub fn render_matches(matches: &[Match], use_color: bool) -> String {
    if matches.is_empty() {
        return "No similar documents found.\n".to_string();
    }

    let mut out = String::new();
    for m in matches {
        let mut line = format!(
            "{:>3}. {}  {}  {}",
            m.rank,
            colorize_score(m.score, use_color),
            colorize_kind(m.kind, use_color),
            colorize_dataset(&m.dataset_id, use_color),
        );
        if let Some(column) = &m.record.column_name {
            line.push_str(&format!(" :: {}", colorize_name(column, use_color)));
        }
        out.push_str(&line);
        out.push('\n');
        out.push_str(&format!(
            "     {}\n",
            colorize_document(&m.record.text, use_color)
        ));
    }
    out
}

/// Render index statistics as aligned key/value lines.
pub fn render_stats(stats: &IndexStats, use_color: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("initialized:       {}\n", stats.initialized));
    out.push_str(&format!("total vectors:     {}\n", stats.total_vectors));
    out.push_str(&format!("dimension:         {}\n", stats.dimension));
    out.push_str(&format!(
        "embedding model:   {}\n",
        colorize_name(&stats.embedding_model, use_color)
    ));
    out.push_str(&format!(
        "datasets indexed:  {}\n",
        stats.distinct_dataset_count
    ));
    for (kind, count) in &stats.count_by_kind {
        out.push_str(&format!("  {:<16} {}\n", kind, count));
    }
    out
}
