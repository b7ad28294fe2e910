//! Tabular dataset exchanged with connectors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// One row, positionally aligned with [`Dataset::columns`].
pub type Row = Vec<Value>;

/// Structural problems that make a dataset unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasetError {
    /// The same column name appears twice.
    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    /// A row does not have one cell per column.
    #[error("row {row} has {actual} cells, expected {expected}")]
    RaggedRow {
        /// Zero-based row index.
        row: usize,
        /// Number of columns.
        expected: usize,
        /// Number of cells in the row.
        actual: usize,
    },
}

/// Column-oriented table of JSON cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Result of concatenating several datasets.
#[derive(Debug, Clone, Default)]
pub struct Concatenated {
    /// The combined dataset.
    pub dataset: Dataset,
    /// Positions of the inputs that were left out, with the reason.
    pub excluded: Vec<(usize, DatasetError)>,
}

impl Dataset {
    /// Creates an empty dataset with the given columns.
    #[must_use]
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Creates a dataset from columns and rows without validating them.
    #[must_use]
    pub fn from_parts(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Builds a dataset from JSON objects.
    ///
    /// Columns are ordered by first appearance; missing keys become `null`.
    #[must_use]
    pub fn from_records(records: &[Map<String, Value>]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for record in records {
            for key in record.keys() {
                if seen.insert(key.as_str()) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|col| record.get(col).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Appends a row after checking its width.
    pub fn push_row(&mut self, row: Row) -> Result<(), DatasetError> {
        if row.len() != self.columns.len() {
            return Err(DatasetError::RaggedRow {
                row: self.rows.len(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Returns the column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the rows.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Iterates over the cells of one column, or `None` if it is absent.
    pub fn column_values<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a Value> + 'a> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().filter_map(move |row| row.get(idx)))
    }

    /// Returns one row as a JSON object.
    #[must_use]
    pub fn record(&self, row: usize) -> Option<Map<String, Value>> {
        let cells = self.rows.get(row)?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(cells.iter().cloned())
                .collect(),
        )
    }

    /// Checks that column names are unique and every row is full width.
    pub fn validate(&self) -> Result<(), DatasetError> {
        let mut seen = HashSet::with_capacity(self.columns.len());
        for col in &self.columns {
            if !seen.insert(col.as_str()) {
                return Err(DatasetError::DuplicateColumn(col.clone()));
            }
        }
        for (idx, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(DatasetError::RaggedRow {
                    row: idx,
                    expected: self.columns.len(),
                    actual: row.len(),
                });
            }
        }
        Ok(())
    }

    /// Concatenates datasets row-wise, preserving input order.
    ///
    /// The result has the ordered union of all columns; cells for columns a
    /// part did not carry are `null`. Parts that fail [`Dataset::validate`]
    /// are skipped and reported in [`Concatenated::excluded`].
    #[must_use]
    pub fn concat(parts: Vec<Dataset>) -> Concatenated {
        let mut excluded = Vec::new();
        let mut valid = Vec::with_capacity(parts.len());
        for (idx, part) in parts.into_iter().enumerate() {
            match part.validate() {
                Ok(()) => valid.push(part),
                Err(err) => excluded.push((idx, err)),
            }
        }

        let mut columns: Vec<String> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for part in &valid {
            for col in &part.columns {
                if !positions.contains_key(col) {
                    positions.insert(col.clone(), columns.len());
                    columns.push(col.clone());
                }
            }
        }

        let total_rows = valid.iter().map(Dataset::len).sum();
        let mut rows = Vec::with_capacity(total_rows);
        for part in valid {
            let mapping: Vec<usize> = part.columns.iter().map(|c| positions[c]).collect();
            for row in part.rows {
                let mut out = vec![Value::Null; columns.len()];
                for (cell, &target) in row.into_iter().zip(&mapping) {
                    out[target] = cell;
                }
                rows.push(out);
            }
        }

        Concatenated {
            dataset: Dataset { columns, rows },
            excluded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn records(value: Value) -> Vec<Map<String, Value>> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_from_records_orders_columns_by_first_appearance() {
        let ds = Dataset::from_records(&records(json!([
            {"id": 1, "name": "a"},
            {"id": 2, "updated_at": "2024-01-01"}
        ])));

        assert_eq!(ds.columns(), ["id", "name", "updated_at"]);
        assert_eq!(ds.rows()[1], vec![json!(2), Value::Null, json!("2024-01-01")]);
        assert_eq!(ds.record(0).unwrap().get("name"), Some(&json!("a")));
    }

    #[test]
    fn test_push_row_rejects_wrong_width() {
        let mut ds = Dataset::new(["id", "name"]);
        assert!(ds.push_row(vec![json!(1), json!("x")]).is_ok());
        assert_eq!(
            ds.push_row(vec![json!(2)]),
            Err(DatasetError::RaggedRow {
                row: 1,
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_validate_detects_duplicates() {
        let ds = Dataset::from_parts(vec!["id".into(), "id".into()], vec![]);
        assert_eq!(ds.validate(), Err(DatasetError::DuplicateColumn("id".into())));
    }

    #[test]
    fn test_column_values() {
        let ds = Dataset::from_parts(
            vec!["id".into(), "v".into()],
            vec![vec![json!(1), json!(10)], vec![json!(2), json!(20)]],
        );
        let values: Vec<_> = ds.column_values("v").unwrap().cloned().collect();
        assert_eq!(values, vec![json!(10), json!(20)]);
        assert!(ds.column_values("missing").is_none());
    }

    #[test]
    fn test_concat_unions_columns_in_order() {
        let first = Dataset::from_parts(vec!["id".into()], vec![vec![json!(1)]]);
        let second = Dataset::from_parts(
            vec!["extra".into(), "id".into()],
            vec![vec![json!("x"), json!(2)]],
        );

        let out = Dataset::concat(vec![first, second]);
        assert!(out.excluded.is_empty());
        assert_eq!(out.dataset.columns(), ["id", "extra"]);
        assert_eq!(
            out.dataset.rows(),
            [vec![json!(1), Value::Null], vec![json!(2), json!("x")]]
        );
    }

    #[test]
    fn test_concat_excludes_malformed_parts() {
        let good = Dataset::from_parts(vec!["id".into()], vec![vec![json!(1)]]);
        let ragged = Dataset::from_parts(vec!["id".into()], vec![vec![json!(2), json!(3)]]);
        let tail = Dataset::from_parts(vec!["id".into()], vec![vec![json!(4)]]);

        let out = Dataset::concat(vec![good, ragged, tail]);
        assert_eq!(out.dataset.len(), 2);
        assert_eq!(out.excluded.len(), 1);
        assert_eq!(out.excluded[0].0, 1);
    }
}
