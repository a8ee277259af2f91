//! The immutable table value that flows between pipeline steps.

use crate::error::TableError;
use crate::fingerprint::Fingerprinter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Named columns and rows of JSON scalar cells. `Value::Null` marks a
/// missing value.
///
/// A `Table` is never mutated once built: steps borrow their input and
/// return a fresh table, which keeps cached copies and sink fan-out free of
/// aliasing. Construction checks that column names are unique and that
/// every row has exactly one value per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableParts")]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct TableParts {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl TryFrom<TableParts> for Table {
    type Error = TableError;

    fn try_from(parts: TableParts) -> Result<Self, Self::Error> {
        Table::new(parts.columns, parts.rows)
    }
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, TableError> {
        let mut seen = HashSet::with_capacity(columns.len());
        for name in &columns {
            if !seen.insert(name.as_str()) {
                return Err(TableError::DuplicateColumn { name: name.clone() });
            }
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TableError::RowWidth {
                    row: i,
                    expected: columns.len(),
                    actual: row.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Value at `row` in the named column, if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// All values of the named column, top to bottom.
    pub fn column_values(&self, column: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Return a table with `values` stored under `name`. An existing column
    /// is replaced in place; otherwise the column is appended.
    pub fn with_column(self, name: &str, values: Vec<Value>) -> Result<Self, TableError> {
        if values.len() != self.rows.len() {
            return Err(TableError::ColumnLength {
                column: name.to_string(),
                expected: self.rows.len(),
                actual: values.len(),
            });
        }
        let Self {
            mut columns,
            mut rows,
        } = self;
        match columns.iter().position(|c| c == name) {
            Some(idx) => {
                for (row, value) in rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                columns.push(name.to_string());
                for (row, value) in rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(Self { columns, rows })
    }

    /// Row-major cells as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<Value>>) {
        (self.columns, self.rows)
    }

    /// Stable SHA-256 fingerprint over column names and row contents.
    /// Order-sensitive in both dimensions.
    pub fn fingerprint(&self) -> String {
        let mut fp = Fingerprinter::new();
        for column in &self.columns {
            fp.field(Value::from(column.as_str()).to_string().as_bytes());
        }
        fp.record();
        for row in &self.rows {
            for cell in row {
                fp.field(cell.to_string().as_bytes());
            }
            fp.record();
        }
        fp.finish()
    }
}
