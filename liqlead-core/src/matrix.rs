//! Variable matrix: the standardized macro inputs handed to index builders.
//!
//! Row-major, one row per period, `NaN` marks a missing observation. The
//! matrix is immutable once built; subsetting returns a new matrix.
//!
//! Invariant: builders only ever see matrices without target-asset columns.
//! The name check lives here so every builder enforces the same pattern.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::series::{monthly_dates, TimeSeries};

/// Case-insensitive substrings that identify a target-asset column.
pub const TARGET_NAME_PATTERNS: [&str; 2] = ["btc", "bitcoin"];

/// Errors from matrix construction.
#[derive(Debug, Error, PartialEq)]
pub enum MatrixError {
    #[error("matrix has no columns")]
    NoColumns,
    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),
    #[error("row {row} has {found} values, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("{dates} dates for {rows} rows")]
    DateCount { dates: usize, rows: usize },
}

/// Whether a column name refers to the target asset.
pub fn is_target_named(name: &str) -> bool {
    let lower = name.to_lowercase();
    TARGET_NAME_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Whether a column name looks like a net-liquidity level.
fn is_anchor_named(name: &str) -> bool {
    let upper = name.to_uppercase();
    let squashed: String = upper.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    upper.contains("NL") || squashed.contains("NETLIQ")
}

/// Standardized variables by period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMatrix {
    columns: Vec<String>,
    dates: Vec<NaiveDate>,
    rows: Vec<Vec<f64>>,
}

impl VariableMatrix {
    pub fn new(
        columns: Vec<String>,
        dates: Vec<NaiveDate>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, MatrixError> {
        if columns.is_empty() {
            return Err(MatrixError::NoColumns);
        }
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.as_str()) {
                return Err(MatrixError::DuplicateColumn(c.clone()));
            }
        }
        if dates.len() != rows.len() {
            return Err(MatrixError::DateCount {
                dates: dates.len(),
                rows: rows.len(),
            });
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(MatrixError::RowWidth {
                    row: i,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
        }
        Ok(Self {
            columns,
            dates,
            rows,
        })
    }

    /// Outer-join named series on their period keys; gaps become `NaN`.
    pub fn from_series(series: Vec<(String, TimeSeries)>) -> Result<Self, MatrixError> {
        let keys: BTreeSet<NaiveDate> = series
            .iter()
            .flat_map(|(_, s)| s.dates().iter().copied())
            .collect();
        let dates: Vec<NaiveDate> = keys.into_iter().collect();
        let position: BTreeMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut rows = vec![vec![f64::NAN; series.len()]; dates.len()];
        for (col, (_, s)) in series.iter().enumerate() {
            for (date, value) in s.iter() {
                if let Some(&r) = position.get(&date) {
                    rows[r][col] = value;
                }
            }
        }
        let columns = series.into_iter().map(|(name, _)| name).collect();
        Self::new(columns, dates, rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Raw values of column `idx`.
    pub fn column_values(&self, idx: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[idx]).collect()
    }

    /// Named column as a series.
    pub fn column(&self, name: &str) -> Option<TimeSeries> {
        let idx = self.column_index(name)?;
        Some(TimeSeries::from_pairs(
            self.dates.iter().copied().zip(self.rows.iter().map(|r| r[idx])),
        ))
    }

    /// Rows with no missing value.
    pub fn complete_rows(&self) -> VariableMatrix {
        let keep: Vec<usize> = (0..self.rows.len())
            .filter(|&i| self.rows[i].iter().all(|v| v.is_finite()))
            .collect();
        self.select_rows(&keep)
    }

    /// Subset of rows, in the order given. Dates follow the rows, so
    /// repeated indices produce repeated keys; see `with_sequential_dates`.
    pub fn select_rows(&self, indices: &[usize]) -> VariableMatrix {
        Self {
            columns: self.columns.clone(),
            dates: indices.iter().map(|&i| self.dates[i]).collect(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// Replace period keys with consecutive months from the first key.
    ///
    /// Resampled matrices repeat rows; fresh keys keep downstream alignment
    /// positional.
    pub fn with_sequential_dates(mut self) -> VariableMatrix {
        if let Some(&start) = self.dates.first() {
            self.dates = monthly_dates(start, self.rows.len());
        }
        self
    }

    /// Columns whose names match the target-asset pattern.
    pub fn target_named_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| is_target_named(c))
            .cloned()
            .collect()
    }

    /// First net-liquidity-like column, else the first column.
    pub fn anchor_column(&self) -> &str {
        self.columns
            .iter()
            .find(|c| is_anchor_named(c))
            .unwrap_or(&self.columns[0])
    }
}
