//! Transformers: pure table-to-table steps.
//!
//! A transformer borrows its input and returns a new table. Its `config()`
//! is the serializable description of its declared parameters, so two
//! transformers with the same name and config are interchangeable for
//! caching.

pub mod aggregation;
pub mod cleaning;
pub mod features;

pub use aggregation::{AggFunc, Aggregation, AggregationTransformer, ReducerFn, ReducerRegistry};
pub use cleaning::{CleaningConfig, CleaningTransformer};
pub use features::{
    Arity, FeatureEngineeringTransformer, FeatureSpec, Formula, FormulaArgs, FormulaRegistry,
    ParamCount, RowView,
};

use crate::error::TransformError;
use crate::table::Table;
use serde_json::Value;
use std::sync::Arc;

/// A step that maps one table to another.
pub trait Transformer: Send + Sync {
    /// Name used in run reports, cache keys and error messages.
    fn name(&self) -> &str;

    /// Declared parameters of this step.
    fn config(&self) -> Value;

    fn transform(&self, input: &Table) -> Result<Table, TransformError>;

    /// Whether results may be served from the cache. Steps whose output
    /// depends on more than their input and config should return false.
    fn is_cacheable(&self) -> bool {
        true
    }
}

/// Named formulas and reducers available to feature and aggregation steps.
#[derive(Debug, Clone)]
pub struct StepRegistries {
    pub formulas: Arc<FormulaRegistry>,
    pub reducers: Arc<ReducerRegistry>,
}

impl Default for StepRegistries {
    fn default() -> Self {
        Self {
            formulas: Arc::new(FormulaRegistry::with_builtins()),
            reducers: Arc::new(ReducerRegistry::with_builtins()),
        }
    }
}

/// Index of `column` in `table`, or a `MissingColumn` error.
pub(crate) fn require_column(table: &Table, column: &str) -> Result<usize, TransformError> {
    table
        .column_index(column)
        .ok_or_else(|| TransformError::missing_column(column))
}

/// Numeric view of a cell: `Ok(None)` for missing, `TypeMismatch` for
/// strings, booleans and nested values.
pub(crate) fn numeric(value: &Value, column: &str) -> Result<Option<f64>, TransformError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        other => Err(TransformError::type_mismatch(
            column,
            format!("expected a number, found {other}"),
        )),
    }
}
