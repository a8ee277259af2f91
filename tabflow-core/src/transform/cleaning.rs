//! Column drops, fills, casts and row filtering.

use super::{Transformer, require_column};
use crate::error::TransformError;
use crate::schema::{CastType, cast_value};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Declared parameters of a cleaning step. Operations run in field order:
/// drop, fill, coerce, required, deduplicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Columns removed outright. Absent columns are ignored.
    pub drop_columns: Vec<String>,
    /// Replacement for missing values, per column.
    pub fill_values: BTreeMap<String, Value>,
    /// Target type per column.
    pub coerce: BTreeMap<String, CastType>,
    /// Rows missing a value in any of these columns are dropped.
    pub required: Vec<String>,
    /// Remove exact duplicate rows, keeping the first occurrence.
    pub deduplicate: bool,
}

#[derive(Debug, Clone)]
pub struct CleaningTransformer {
    name: String,
    config: CleaningConfig,
}

impl CleaningTransformer {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, CleaningConfig::default())
    }

    pub fn from_config(name: impl Into<String>, config: CleaningConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn drop_column(mut self, column: impl Into<String>) -> Self {
        self.config.drop_columns.push(column.into());
        self
    }

    pub fn fill(mut self, column: impl Into<String>, value: Value) -> Self {
        self.config.fill_values.insert(column.into(), value);
        self
    }

    pub fn coerce(mut self, column: impl Into<String>, target: CastType) -> Self {
        self.config.coerce.insert(column.into(), target);
        self
    }

    pub fn require(mut self, column: impl Into<String>) -> Self {
        self.config.required.push(column.into());
        self
    }

    pub fn deduplicate(mut self, enabled: bool) -> Self {
        self.config.deduplicate = enabled;
        self
    }

    pub fn cleaning_config(&self) -> &CleaningConfig {
        &self.config
    }
}

impl Transformer for CleaningTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }

    fn transform(&self, input: &Table) -> Result<Table, TransformError> {
        let cfg = &self.config;

        let keep: Vec<usize> = (0..input.column_count())
            .filter(|&i| !cfg.drop_columns.contains(&input.columns()[i]))
            .collect();
        let columns: Vec<String> = keep.iter().map(|&i| input.columns()[i].clone()).collect();
        let mut rows: Vec<Vec<Value>> = input
            .rows()
            .iter()
            .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
            .collect();
        // Column lookups run against the header alone while rows are edited.
        let header = Table::new(columns, Vec::new())?;

        for (column, fill) in &cfg.fill_values {
            let idx = require_column(&header, column)?;
            for row in &mut rows {
                if row[idx].is_null() {
                    row[idx] = fill.clone();
                }
            }
        }

        for (column, target) in &cfg.coerce {
            let idx = require_column(&header, column)?;
            for row in &mut rows {
                let cell = std::mem::take(&mut row[idx]);
                row[idx] = cast_value(cell, *target).map_err(|original| {
                    TransformError::type_mismatch(
                        column,
                        format!("cannot convert {original} to {target}"),
                    )
                })?;
            }
        }

        if !cfg.required.is_empty() {
            let idx: Vec<usize> = cfg
                .required
                .iter()
                .map(|c| require_column(&header, c))
                .collect::<Result<_, _>>()?;
            rows.retain(|row| idx.iter().all(|&i| !row[i].is_null()));
        }

        if cfg.deduplicate {
            let mut seen = HashSet::new();
            rows.retain(|row| seen.insert(Value::Array(row.clone()).to_string()));
        }

        let (columns, _) = header.into_parts();
        Ok(Table::new(columns, rows)?)
    }
}
