//! Derived columns computed from named formulas.

use super::{Transformer, numeric, require_column};
use crate::error::TransformError;
use crate::schema::float_value;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One derived column: `output = formula(columns, params)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub output: String,
    pub formula: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub params: Vec<f64>,
}

impl FeatureSpec {
    pub fn new(output: impl Into<String>, formula: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            output: output.into(),
            formula: formula.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<f64>) -> Self {
        self.params = params;
        self
    }
}

/// Arguments a formula is invoked with.
#[derive(Debug, Clone, Copy)]
pub struct FormulaArgs<'a> {
    pub output: &'a str,
    pub columns: &'a [String],
    pub params: &'a [f64],
}

impl<'a> FormulaArgs<'a> {
    pub fn column(&self, i: usize) -> Result<&'a str, TransformError> {
        self.columns.get(i).map(String::as_str).ok_or_else(|| {
            TransformError::invalid_config(format!(
                "feature '{}' needs at least {} input column(s)",
                self.output,
                i + 1
            ))
        })
    }

    pub fn param(&self, i: usize) -> Result<f64, TransformError> {
        self.params.get(i).copied().ok_or_else(|| {
            TransformError::invalid_config(format!(
                "feature '{}' needs at least {} parameter(s)",
                self.output,
                i + 1
            ))
        })
    }
}

/// How many parameters a formula takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamCount {
    Exactly(usize),
    /// One parameter per input column.
    PerColumn,
}

/// Input shape a formula accepts, checked when a feature step is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min_columns: usize,
    pub max_columns: Option<usize>,
    pub params: ParamCount,
}

impl Arity {
    pub fn columns(n: usize) -> Self {
        Self {
            min_columns: n,
            max_columns: Some(n),
            params: ParamCount::Exactly(0),
        }
    }

    pub fn at_least(n: usize) -> Self {
        Self {
            min_columns: n,
            max_columns: None,
            params: ParamCount::Exactly(0),
        }
    }

    pub fn with_params(mut self, params: ParamCount) -> Self {
        self.params = params;
        self
    }

    pub fn check(&self, spec: &FeatureSpec) -> Result<(), TransformError> {
        let columns = spec.columns.len();
        let too_many = self.max_columns.is_some_and(|max| columns > max);
        if columns < self.min_columns || too_many {
            let expected = match self.max_columns {
                Some(max) if max == self.min_columns => format!("{max}"),
                Some(max) => format!("{}..={max}", self.min_columns),
                None => format!("at least {}", self.min_columns),
            };
            return Err(TransformError::invalid_config(format!(
                "feature '{}': {} takes {expected} input column(s), got {columns}",
                spec.output, spec.formula
            )));
        }
        let params = match self.params {
            ParamCount::Exactly(n) => n,
            ParamCount::PerColumn => columns,
        };
        if spec.params.len() != params {
            return Err(TransformError::invalid_config(format!(
                "feature '{}': {} takes {params} parameter(s), got {}",
                spec.output,
                spec.formula,
                spec.params.len()
            )));
        }
        Ok(())
    }
}

/// One row of a table, addressed by column name.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    table: &'a Table,
    row: &'a [Value],
}

impl<'a> RowView<'a> {
    pub fn new(table: &'a Table, row: &'a [Value]) -> Self {
        Self { table, row }
    }

    pub fn get(&self, column: &str) -> Result<&'a Value, TransformError> {
        let idx = require_column(self.table, column)?;
        Ok(&self.row[idx])
    }

    /// The cell as a number; `None` when missing.
    pub fn number(&self, column: &str) -> Result<Option<f64>, TransformError> {
        numeric(self.get(column)?, column)
    }
}

pub type RowFn =
    dyn Fn(&RowView<'_>, &FormulaArgs<'_>) -> Result<Value, TransformError> + Send + Sync;
pub type ColumnFn =
    dyn Fn(&Table, &FormulaArgs<'_>) -> Result<Vec<Value>, TransformError> + Send + Sync;

/// A row formula sees one row at a time; a column formula sees the whole
/// table and returns one value per row.
#[derive(Clone)]
pub enum Formula {
    Row(Arc<RowFn>),
    Column(Arc<ColumnFn>),
}

/// Formulas by name. Feature steps reference formulas by name only, so their
/// configuration stays serializable.
/// Formulas registered without an [`Arity`] are not shape-checked.
#[derive(Clone, Default)]
pub struct FormulaRegistry {
    formulas: HashMap<String, Formula>,
    arities: HashMap<String, Arity>,
}

impl std::fmt::Debug for FormulaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormulaRegistry")
            .field("formulas", &self.names())
            .finish()
    }
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `ratio`, `rate`, `sum`, `difference`, `product`,
    /// `weighted_sum`, `zscore` and `min_max`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register_row("ratio", |row, args| {
            let a = row.number(args.column(0)?)?;
            let b = row.number(args.column(1)?)?;
            Ok(divide(a, b, 1.0))
        });
        // value * scale / exposure, e.g. goals per 90 minutes with scale 90
        reg.register_row("rate", |row, args| {
            let value = row.number(args.column(0)?)?;
            let exposure = row.number(args.column(1)?)?;
            Ok(divide(value, exposure, args.param(0)?))
        });
        reg.set_arity("ratio", Arity::columns(2));
        reg.set_arity("rate", Arity::columns(2).with_params(ParamCount::Exactly(1)));
        reg.register_row("sum", |row, args| {
            let weights = vec![1.0; args.columns.len()];
            linear(row, args, &weights)
        });
        reg.set_arity("sum", Arity::at_least(1));
        reg.register_row("difference", |row, args| {
            args.column(1)?;
            linear(row, &FormulaArgs { columns: &args.columns[..2], ..*args }, &[1.0, -1.0])
        });
        reg.set_arity("difference", Arity::columns(2));
        reg.register_row("product", product);
        reg.set_arity("product", Arity::at_least(1));
        reg.register_row("weighted_sum", |row, args| {
            if args.params.len() != args.columns.len() {
                return Err(TransformError::invalid_config(format!(
                    "feature '{}': weighted_sum needs one weight per column ({} columns, {} weights)",
                    args.output,
                    args.columns.len(),
                    args.params.len()
                )));
            }
            linear(row, args, args.params)
        });
        reg.set_arity(
            "weighted_sum",
            Arity::at_least(1).with_params(ParamCount::PerColumn),
        );
        reg.register_column("zscore", |table, args| {
            let column = args.column(0)?;
            let values = numeric_column(table, column)?;
            let present: Vec<f64> = values.iter().flatten().copied().collect();
            if present.is_empty() {
                return Ok(vec![Value::Null; values.len()]);
            }
            let n = present.len() as f64;
            let mean = present.iter().sum::<f64>() / n;
            let std = (present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            Ok(values
                .iter()
                .map(|v| match v {
                    Some(_) if std == 0.0 => float_value(0.0),
                    Some(x) => float_value((x - mean) / std),
                    None => Value::Null,
                })
                .collect())
        });
        reg.set_arity("zscore", Arity::columns(1));
        reg.register_column("min_max", |table, args| {
            let column = args.column(0)?;
            let values = numeric_column(table, column)?;
            let min = values.iter().flatten().copied().fold(f64::INFINITY, f64::min);
            let max = values
                .iter()
                .flatten()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            let range = max - min;
            Ok(values
                .iter()
                .map(|v| match v {
                    Some(_) if range == 0.0 => float_value(0.0),
                    Some(x) => float_value((x - min) / range),
                    None => Value::Null,
                })
                .collect())
        });
        reg.set_arity("min_max", Arity::columns(1));
        reg
    }

    pub fn register_row<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&RowView<'_>, &FormulaArgs<'_>) -> Result<Value, TransformError>
            + Send
            + Sync
            + 'static,
    {
        self.formulas.insert(name.into(), Formula::Row(Arc::new(f)));
    }

    pub fn register_column<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Table, &FormulaArgs<'_>) -> Result<Vec<Value>, TransformError>
            + Send
            + Sync
            + 'static,
    {
        self.formulas
            .insert(name.into(), Formula::Column(Arc::new(f)));
    }

    /// Declare the inputs `name` accepts. Replaces any earlier declaration.
    pub fn set_arity(&mut self, name: impl Into<String>, arity: Arity) {
        self.arities.insert(name.into(), arity);
    }

    pub fn arity(&self, name: &str) -> Option<Arity> {
        self.arities.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.formulas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn divide(a: Option<f64>, b: Option<f64>, scale: f64) -> Value {
    match (a, b) {
        (Some(a), Some(b)) if b != 0.0 => float_value(a * scale / b),
        _ => Value::Null,
    }
}

fn numeric_column(table: &Table, column: &str) -> Result<Vec<Option<f64>>, TransformError> {
    let idx = require_column(table, column)?;
    table
        .rows()
        .iter()
        .map(|row| numeric(&row[idx], column))
        .collect()
}

fn whole(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// `sum(weight * column)`, integral when every input and weight is.
fn linear(row: &RowView<'_>, args: &FormulaArgs<'_>, weights: &[f64]) -> Result<Value, TransformError> {
    if args.columns.is_empty() {
        return Err(TransformError::invalid_config(format!(
            "feature '{}' needs at least one input column",
            args.output
        )));
    }
    let mut int_acc: Option<i64> = Some(0);
    let mut float_acc = 0.0;
    for (column, &weight) in args.columns.iter().zip(weights) {
        let cell = row.get(column)?;
        let Some(x) = numeric(cell, column)? else {
            return Ok(Value::Null);
        };
        int_acc = match (int_acc, cell.as_i64(), whole(weight)) {
            (Some(acc), Some(i), Some(w)) => i.checked_mul(w).and_then(|p| acc.checked_add(p)),
            _ => None,
        };
        float_acc += weight * x;
    }
    Ok(match int_acc {
        Some(i) => Value::from(i),
        None => float_value(float_acc),
    })
}

fn product(row: &RowView<'_>, args: &FormulaArgs<'_>) -> Result<Value, TransformError> {
    if args.columns.is_empty() {
        return Err(TransformError::invalid_config(format!(
            "feature '{}' needs at least one input column",
            args.output
        )));
    }
    let mut int_acc: Option<i64> = Some(1);
    let mut float_acc = 1.0;
    for column in args.columns {
        let cell = row.get(column)?;
        let Some(x) = numeric(cell, column)? else {
            return Ok(Value::Null);
        };
        int_acc = match (int_acc, cell.as_i64()) {
            (Some(acc), Some(i)) => acc.checked_mul(i),
            _ => None,
        };
        float_acc *= x;
    }
    Ok(match int_acc {
        Some(i) => Value::from(i),
        None => float_value(float_acc),
    })
}

/// Adds derived columns, one feature at a time. A later feature may read
/// the output of an earlier one.
#[derive(Debug, Clone)]
pub struct FeatureEngineeringTransformer {
    name: String,
    features: Vec<FeatureSpec>,
    formulas: Arc<FormulaRegistry>,
}

impl FeatureEngineeringTransformer {
    pub fn new(
        name: impl Into<String>,
        features: Vec<FeatureSpec>,
        formulas: Arc<FormulaRegistry>,
    ) -> Result<Self, TransformError> {
        let mut outputs = HashSet::new();
        for spec in &features {
            if !formulas.contains(&spec.formula) {
                return Err(TransformError::invalid_config(format!(
                    "unknown formula '{}' for feature '{}' (available: {})",
                    spec.formula,
                    spec.output,
                    formulas.names().join(", ")
                )));
            }
            if let Some(arity) = formulas.arity(&spec.formula) {
                arity.check(spec)?;
            }
            if !outputs.insert(spec.output.as_str()) {
                return Err(TransformError::invalid_config(format!(
                    "feature output '{}' is defined twice",
                    spec.output
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            features,
            formulas,
        })
    }

    pub fn features(&self) -> &[FeatureSpec] {
        &self.features
    }
}

impl Transformer for FeatureEngineeringTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> Value {
        serde_json::json!({ "features": self.features })
    }

    fn transform(&self, input: &Table) -> Result<Table, TransformError> {
        let mut table = input.clone();
        for spec in &self.features {
            let formula = self.formulas.get(&spec.formula).ok_or_else(|| {
                TransformError::invalid_config(format!("unknown formula '{}'", spec.formula))
            })?;
            for column in &spec.columns {
                require_column(&table, column)?;
            }
            let args = FormulaArgs {
                output: &spec.output,
                columns: &spec.columns,
                params: &spec.params,
            };
            let values = match formula {
                Formula::Row(f) => table
                    .rows()
                    .iter()
                    .map(|row| f(&RowView::new(&table, row), &args))
                    .collect::<Result<Vec<_>, _>>()?,
                Formula::Column(f) => f(&table, &args)?,
            };
            table = table.with_column(&spec.output, values)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn table() -> Table {
        Table::new(
            vec!["goals".into(), "minutes".into(), "wins".into(), "draws".into()],
            vec![
                vec![json!(3), json!(270), json!(2), json!(1)],
                vec![json!(1), json!(0), json!(0), json!(3)],
                vec![Value::Null, json!(90), json!(1), json!(1)],
            ],
        )
        .unwrap()
    }

    fn step(features: Vec<FeatureSpec>) -> FeatureEngineeringTransformer {
        FeatureEngineeringTransformer::new(
            "features",
            features,
            Arc::new(FormulaRegistry::with_builtins()),
        )
        .unwrap()
    }

    #[test]
    fn test_rate_handles_zero_and_missing() {
        let out = step(vec![
            FeatureSpec::new("g90", "rate", &["goals", "minutes"]).with_params(vec![90.0]),
        ])
        .transform(&table())
        .unwrap();
        assert_eq!(out.value(0, "g90"), Some(&json!(1.0)));
        assert_eq!(out.value(1, "g90"), Some(&Value::Null));
        assert_eq!(out.value(2, "g90"), Some(&Value::Null));
    }

    #[test]
    fn test_weighted_sum_stays_integral() {
        let out = step(vec![
            FeatureSpec::new("points", "weighted_sum", &["wins", "draws"]).with_params(vec![3.0, 1.0]),
        ])
        .transform(&table())
        .unwrap();
        assert_eq!(out.column_values("points").unwrap(), [&json!(7), &json!(3), &json!(4)]);
    }

    fn build(features: Vec<FeatureSpec>) -> Result<FeatureEngineeringTransformer, TransformError> {
        FeatureEngineeringTransformer::new(
            "features",
            features,
            Arc::new(FormulaRegistry::with_builtins()),
        )
    }

    #[test]
    fn test_weighted_sum_param_mismatch() {
        let err = build(vec![FeatureSpec::new("points", "weighted_sum", &["wins", "draws"])])
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidConfig { .. }));
    }

    #[test]
    fn test_builtin_arity_checked_at_construction() {
        for spec in [
            FeatureSpec::new("x", "ratio", &["goals"]),
            FeatureSpec::new("x", "rate", &["goals", "minutes"]),
            FeatureSpec::new("x", "difference", &["wins", "draws", "goals"]),
            FeatureSpec::new("x", "zscore", &["wins"]).with_params(vec![1.0]),
            FeatureSpec::new("x", "sum", &[]),
        ] {
            let err = build(vec![spec.clone()]).unwrap_err();
            assert!(
                matches!(err, TransformError::InvalidConfig { .. }),
                "{spec:?} accepted"
            );
        }
        assert!(build(vec![FeatureSpec::new("x", "sum", &["wins", "draws", "goals"])]).is_ok());
    }

    #[test]
    fn test_missing_column_on_empty_table() {
        let empty = Table::new(vec!["goals".into()], vec![]).unwrap();
        for formula in ["ratio", "zscore"] {
            let columns: &[&str] = if formula == "ratio" {
                &["goals", "nonexistent"]
            } else {
                &["nonexistent"]
            };
            let err = step(vec![FeatureSpec::new("x", formula, columns)])
                .transform(&empty)
                .unwrap_err();
            assert_eq!(err, TransformError::missing_column("nonexistent"));
        }
    }

    #[test]
    fn test_sum_difference_product() {
        let out = step(vec![
            FeatureSpec::new("played", "sum", &["wins", "draws"]),
            FeatureSpec::new("diff", "difference", &["wins", "draws"]),
            FeatureSpec::new("prod", "product", &["wins", "draws"]),
        ])
        .transform(&table())
        .unwrap();
        assert_eq!(&out.rows()[0][4..], &[json!(3), json!(1), json!(2)]);
    }

    #[test]
    fn test_features_can_chain() {
        let out = step(vec![
            FeatureSpec::new("played", "sum", &["wins", "draws"]),
            FeatureSpec::new("share", "ratio", &["wins", "played"]),
        ])
        .transform(&table())
        .unwrap();
        assert_eq!(out.value(1, "share"), Some(&json!(0.0)));
    }

    #[test]
    fn test_existing_output_replaced_in_place() {
        let out = step(vec![FeatureSpec::new("goals", "sum", &["wins", "draws"])])
            .transform(&table())
            .unwrap();
        assert_eq!(out.columns(), table().columns());
        assert_eq!(out.value(0, "goals"), Some(&json!(3)));
    }

    #[test]
    fn test_zscore_and_min_max() {
        let out = step(vec![
            FeatureSpec::new("z", "zscore", &["wins"]),
            FeatureSpec::new("mm", "min_max", &["wins"]),
        ])
        .transform(&table())
        .unwrap();
        assert_eq!(out.value(1, "mm"), Some(&json!(0.0)));
        assert_eq!(out.value(0, "mm"), Some(&json!(1.0)));
        let z = out.value(0, "z").and_then(Value::as_f64).unwrap();
        assert!((z - 1.224_744_871).abs() < 1e-6);
    }

    #[test]
    fn test_zscore_constant_column_is_zero() {
        let t = Table::new(vec!["x".into()], vec![vec![json!(5)], vec![json!(5)]]).unwrap();
        let out = step(vec![FeatureSpec::new("z", "zscore", &["x"])])
            .transform(&t)
            .unwrap();
        assert_eq!(out.value(0, "z"), Some(&json!(0.0)));
    }

    #[test]
    fn test_unknown_formula_rejected_at_construction() {
        let err = FeatureEngineeringTransformer::new(
            "f",
            vec![FeatureSpec::new("x", "cube_root", &["goals"])],
            Arc::new(FormulaRegistry::with_builtins()),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidConfig { .. }));
    }

    #[test]
    fn test_missing_and_non_numeric_columns() {
        let err = step(vec![FeatureSpec::new("x", "ratio", &["goals", "assists"])])
            .transform(&table())
            .unwrap_err();
        assert_eq!(err, TransformError::missing_column("assists"));

        let t = Table::new(vec!["a".into(), "b".into()], vec![vec![json!("n/a"), json!(1)]]).unwrap();
        let err = step(vec![FeatureSpec::new("x", "ratio", &["a", "b"])])
            .transform(&t)
            .unwrap_err();
        assert!(matches!(err, TransformError::TypeMismatch { .. }));
    }

    #[test]
    fn test_custom_row_formula() {
        let mut reg = FormulaRegistry::with_builtins();
        reg.register_row("double", |row, args| {
            Ok(row
                .number(args.column(0)?)?
                .map(|x| float_value(x * 2.0))
                .unwrap_or(Value::Null))
        });
        let step = FeatureEngineeringTransformer::new(
            "f",
            vec![FeatureSpec::new("wins2", "double", &["wins"])],
            Arc::new(reg),
        )
        .unwrap();
        let out = step.transform(&table()).unwrap();
        assert_eq!(out.value(0, "wins2"), Some(&json!(4.0)));
    }
}
