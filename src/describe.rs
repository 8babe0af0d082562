// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text rendering of tables and columns for embedding.
//!
//! Output must be byte-identical for identical input: embeddings, and therefore
//! similarity rankings, are computed from these strings.

use serde_json::Value;
use std::collections::HashMap;

use crate::table::{format_float, format_number, Column, ColumnType, Table};

/// Separator between description segments.
pub const SEGMENT_SEPARATOR: &str = " | ";

/// Renders dataset overview and column descriptions.
#[derive(Debug, Clone)]
pub struct DescriptionBuilder {
    /// Column names listed per type in the overview
    pub max_listed_columns: usize,
    /// Most frequent values listed for non-numeric columns
    pub top_values: usize,
    /// Top values are only listed when the distinct count is at most this
    pub max_distinct_for_top: usize,
}

impl Default for DescriptionBuilder {
    fn default() -> Self {
        Self {
            max_listed_columns: 10,
            top_values: 5,
            max_distinct_for_top: 20,
        }
    }
}

impl DescriptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the overview document for a whole table.
    ///
    /// Segments, in order: shape, numeric columns, categorical columns and,
    /// when `prior_analysis` carries an `insights` entry, the insight text.
    pub fn dataset_overview(&self, table: &Table, prior_analysis: Option<&Value>) -> String {
        let mut parts = vec![format!(
            "Dataset with {} rows and {} columns",
            table.row_count(),
            table.column_count()
        )];

        let (numeric, categorical): (Vec<&Column>, Vec<&Column>) = table
            .columns()
            .iter()
            .partition(|c| c.column_type().is_numeric());

        if !numeric.is_empty() {
            parts.push(format!(
                "Numeric columns: {}",
                self.list_names(&numeric)
            ));
        }
        if !categorical.is_empty() {
            parts.push(format!(
                "Categorical columns: {}",
                self.list_names(&categorical)
            ));
        }

        if let Some(insights) = prior_analysis.and_then(|v| v.get("insights")) {
            let rendered = match insights {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parts.push(format!("Key insights: {}", rendered));
        }

        parts.join(SEGMENT_SEPARATOR)
    }

    /// Renders the description of one column.
    pub fn column_description(&self, column: &Column) -> String {
        let column_type = column.column_type();
        let mut parts = vec![
            format!("Column: {}", column.name),
            format!("Type: {}", column_type.tag()),
            format!("Non-null values: {}", column.non_missing_count()),
            format!("Missing values: {}", column.missing_count()),
        ];

        if column_type.is_numeric() {
            let (min, max, sum, count) = column.numbers().fold(
                (f64::INFINITY, f64::NEG_INFINITY, 0.0, 0usize),
                |(min, max, sum, count), v| (min.min(v), max.max(v), sum + v, count + 1),
            );
            let (min, max, mean) = if count > 0 {
                (min, max, sum / count as f64)
            } else {
                (f64::NAN, f64::NAN, f64::NAN)
            };
            let render: fn(f64) -> String = match column_type {
                ColumnType::Integer => format_number,
                _ => format_float,
            };
            parts.push(format!("Range: {} to {}", render(min), render(max)));
            if mean.is_nan() {
                parts.push("Mean: nan".to_string());
            } else {
                parts.push(format!("Mean: {:.2}", mean));
            }
        } else {
            let counts = value_counts(column);
            parts.push(format!("Unique values: {}", counts.len()));
            if counts.len() <= self.max_distinct_for_top {
                let top: Vec<&str> = counts
                    .iter()
                    .take(self.top_values)
                    .map(|(value, _)| value.as_str())
                    .collect();
                parts.push(format!("Top values: {}", top.join(", ")));
            }
        }

        parts.join(SEGMENT_SEPARATOR)
    }

    fn list_names(&self, columns: &[&Column]) -> String {
        columns
            .iter()
            .take(self.max_listed_columns)
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Distinct non-missing values with their counts, most frequent first.
/// Ties keep first-appearance order.
fn value_counts(column: &Column) -> Vec<(String, usize)> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut counts: Vec<(String, usize)> = Vec::new();

    for value in column.values.iter().filter(|v| !v.is_missing()) {
        let key = value.to_string();
        match positions.get(&key) {
            Some(&idx) => counts[idx].1 += 1,
            None => {
                positions.insert(key.clone(), counts.len());
                counts.push((key, 1));
            }
        }
    }

    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}
