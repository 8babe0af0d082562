// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory tabular datasets.
//!
//! A [`Table`] is a list of equally long named columns. Cells are either
//! missing, numeric or text; the column type is inferred the same way a
//! dataframe assigns a dtype: a missing cell turns an integer column into a
//! float column, and a column with only missing cells is a float column.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Cell spellings treated as missing values when reading CSV.
const MISSING_MARKERS: &[&str] = &["", "na", "n/a", "nan", "null", "none"];

/// A single cell of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Missing,
    Number(f64),
    Text(String),
}

impl CellValue {
    /// Parses a raw CSV field.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if MISSING_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
            return CellValue::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => CellValue::Number(value),
            _ => CellValue::Text(raw.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, CellValue::Missing)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            CellValue::Missing
        } else {
            CellValue::Number(value)
        }
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(value as f64)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Missing)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Missing => write!(f, "nan"),
            CellValue::Number(v) => write!(f, "{}", format_number(*v)),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Inferred column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Every value is present and integral.
    Integer,
    /// Every non-missing value is a number, or every value is missing.
    Float,
    /// At least one non-missing value is text.
    Text,
    /// No rows at all.
    Empty,
}

impl ColumnType {
    /// Dtype-style tag used in descriptions.
    pub fn tag(&self) -> &'static str {
        match self {
            ColumnType::Integer => "int64",
            ColumnType::Float => "float64",
            ColumnType::Text | ColumnType::Empty => "object",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

/// A named column of cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<CellValue>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<CellValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_type(&self) -> ColumnType {
        if self.values.is_empty() {
            return ColumnType::Empty;
        }
        let mut integral = true;
        for value in &self.values {
            match value {
                CellValue::Missing => integral = false,
                CellValue::Text(_) => return ColumnType::Text,
                CellValue::Number(v) => integral &= v.fract() == 0.0,
            }
        }
        if integral {
            ColumnType::Integer
        } else {
            ColumnType::Float
        }
    }

    pub fn non_missing_count(&self) -> usize {
        self.values.iter().filter(|v| !v.is_missing()).count()
    }

    pub fn missing_count(&self) -> usize {
        self.len() - self.non_missing_count()
    }

    /// Numeric values of the column, skipping missing and text cells.
    pub fn numbers(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().filter_map(|v| match v {
            CellValue::Number(n) => Some(*n),
            _ => None,
        })
    }
}

/// A tabular dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Builds a table, rejecting ragged columns.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            let rows = first.len();
            if let Some(bad) = columns.iter().find(|c| c.len() != rows) {
                bail!(
                    "Column '{}' has {} values, expected {}",
                    bad.name,
                    bad.len(),
                    rows
                );
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Reads a CSV document with a header row.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .context("Failed to read CSV header")?
            .clone();
        let mut columns: Vec<Column> = headers
            .iter()
            .map(|name| Column::new(name.trim(), Vec::new()))
            .collect();

        for (line, record) in csv_reader.records().enumerate() {
            let record = record.with_context(|| format!("Failed to read CSV row {}", line + 1))?;
            for (column, field) in columns.iter_mut().zip(record.iter()) {
                column.values.push(CellValue::parse(field));
            }
        }

        Self::new(columns)
    }

    /// Reads a CSV file with a header row.
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_csv_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Formats a number the way descriptions render it: integral values without
/// a decimal point, everything else with the shortest round-trip form.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Formats a value of a float column: integral values keep one decimal
/// (`30.0`), missing statistics render as `nan`.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}
