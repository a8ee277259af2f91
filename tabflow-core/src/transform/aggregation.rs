//! Group-by aggregation.

use super::{Transformer, numeric, require_column};
use crate::error::TransformError;
use crate::schema::float_value;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Reduction applied to one column within each group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AggFunc {
    Sum,
    Mean,
    Min,
    Max,
    Count,
    /// A reducer looked up by name in a [`ReducerRegistry`].
    Custom(String),
}

impl From<String> for AggFunc {
    fn from(s: String) -> Self {
        match s.as_str() {
            "sum" => AggFunc::Sum,
            "mean" => AggFunc::Mean,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            "count" => AggFunc::Count,
            _ => AggFunc::Custom(s),
        }
    }
}

impl From<AggFunc> for String {
    fn from(f: AggFunc) -> Self {
        f.to_string()
    }
}

impl std::str::FromStr for AggFunc {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AggFunc::from(s.to_string()))
    }
}

impl std::fmt::Display for AggFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggFunc::Sum => write!(f, "sum"),
            AggFunc::Mean => write!(f, "mean"),
            AggFunc::Min => write!(f, "min"),
            AggFunc::Max => write!(f, "max"),
            AggFunc::Count => write!(f, "count"),
            AggFunc::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// A `(column, function)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub column: String,
    pub function: AggFunc,
}

impl Aggregation {
    pub fn new(column: impl Into<String>, function: AggFunc) -> Self {
        Self {
            column: column.into(),
            function,
        }
    }
}

/// A user reducer: receives the column name and the group's non-missing
/// values.
pub type ReducerFn = dyn Fn(&str, &[&Value]) -> Result<Value, TransformError> + Send + Sync;

#[derive(Clone, Default)]
pub struct ReducerRegistry {
    reducers: HashMap<String, Arc<ReducerFn>>,
}

impl std::fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.reducers.keys().collect();
        names.sort_unstable();
        f.debug_struct("ReducerRegistry")
            .field("reducers", &names)
            .finish()
    }
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `median` and `distinct_count`.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("median", |column, values| {
            let mut nums = values
                .iter()
                .map(|v| numeric(v, column))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect::<Vec<f64>>();
            if nums.is_empty() {
                return Ok(Value::Null);
            }
            nums.sort_by(f64::total_cmp);
            let mid = nums.len() / 2;
            let median = if nums.len() % 2 == 0 {
                (nums[mid - 1] + nums[mid]) / 2.0
            } else {
                nums[mid]
            };
            Ok(float_value(median))
        });
        reg.register("distinct_count", |_, values| {
            let distinct: HashSet<String> = values.iter().map(|v| v.to_string()).collect();
            Ok(Value::from(distinct.len()))
        });
        reg
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&str, &[&Value]) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        self.reducers.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ReducerFn>> {
        self.reducers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }
}

/// Groups rows by key columns and reduces the rest.
///
/// Output has one row per distinct key, in order of first appearance. A
/// column reduced by a single function keeps its name; a column reduced by
/// several becomes `<column>_<function>`.
#[derive(Debug, Clone)]
pub struct AggregationTransformer {
    name: String,
    group_by: Vec<String>,
    aggregations: Vec<Aggregation>,
    reducers: Arc<ReducerRegistry>,
}

impl AggregationTransformer {
    pub fn new(
        name: impl Into<String>,
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
        reducers: Arc<ReducerRegistry>,
    ) -> Result<Self, TransformError> {
        if group_by.is_empty() {
            return Err(TransformError::invalid_config(
                "aggregation needs at least one group_by column",
            ));
        }
        let mut pairs = HashSet::new();
        for agg in &aggregations {
            if let AggFunc::Custom(custom) = &agg.function {
                if !reducers.contains(custom) {
                    return Err(TransformError::invalid_config(format!(
                        "unknown reducer '{custom}' for column '{}'",
                        agg.column
                    )));
                }
            }
            if !pairs.insert((agg.column.as_str(), &agg.function)) {
                return Err(TransformError::invalid_config(format!(
                    "aggregation {}({}) is listed twice",
                    agg.function, agg.column
                )));
            }
        }
        let step = Self {
            name: name.into(),
            group_by,
            aggregations,
            reducers,
        };
        let mut outputs = HashSet::new();
        for output in step.output_names() {
            if step.group_by.contains(&output) {
                return Err(TransformError::invalid_config(format!(
                    "aggregate output '{output}' collides with a group_by column"
                )));
            }
            if !outputs.insert(output.clone()) {
                return Err(TransformError::invalid_config(format!(
                    "aggregate output '{output}' is produced twice"
                )));
            }
        }
        Ok(step)
    }

    /// Output column names for the aggregations, in declaration order.
    pub fn output_names(&self) -> Vec<String> {
        let mut uses: HashMap<&str, usize> = HashMap::new();
        for agg in &self.aggregations {
            *uses.entry(agg.column.as_str()).or_default() += 1;
        }
        self.aggregations
            .iter()
            .map(|agg| {
                if uses[agg.column.as_str()] == 1 {
                    agg.column.clone()
                } else {
                    format!("{}_{}", agg.column, agg.function)
                }
            })
            .collect()
    }

    fn reduce(&self, agg: &Aggregation, values: &[&Value]) -> Result<Value, TransformError> {
        let column = agg.column.as_str();
        match &agg.function {
            AggFunc::Sum => sum(column, values),
            AggFunc::Mean => {
                let mut total = 0.0;
                for v in values {
                    total += numeric(v, column)?.unwrap_or(0.0);
                }
                Ok(if values.is_empty() {
                    Value::Null
                } else {
                    float_value(total / values.len() as f64)
                })
            }
            AggFunc::Min => extreme(column, values, std::cmp::Ordering::Less),
            AggFunc::Max => extreme(column, values, std::cmp::Ordering::Greater),
            AggFunc::Count => Ok(Value::from(values.len())),
            AggFunc::Custom(name) => {
                let reducer = self.reducers.get(name).ok_or_else(|| {
                    TransformError::invalid_config(format!("unknown reducer '{name}'"))
                })?;
                reducer(column, values)
            }
        }
    }
}

fn sum(column: &str, values: &[&Value]) -> Result<Value, TransformError> {
    let mut int_acc: Option<i64> = Some(0);
    let mut float_acc = 0.0;
    for v in values {
        let x = numeric(v, column)?.unwrap_or(0.0);
        int_acc = int_acc.and_then(|acc| v.as_i64().and_then(|i| acc.checked_add(i)));
        float_acc += x;
    }
    Ok(match int_acc {
        Some(i) => Value::from(i),
        None => float_value(float_acc),
    })
}

/// Smallest (`Less`) or largest (`Greater`) value. Numbers compare
/// numerically and strings lexically; mixing the two is an error.
fn extreme(
    column: &str,
    values: &[&Value],
    want: std::cmp::Ordering,
) -> Result<Value, TransformError> {
    let mut best: Option<&Value> = None;
    for &v in values {
        let ord = match (best, v) {
            (None, Value::Number(_) | Value::String(_)) => {
                best = Some(v);
                continue;
            }
            (Some(Value::Number(b)), Value::Number(n)) => {
                let (b, n) = (b.as_f64().unwrap_or(0.0), n.as_f64().unwrap_or(0.0));
                n.total_cmp(&b)
            }
            (Some(Value::String(b)), Value::String(s)) => s.cmp(b),
            _ => {
                return Err(TransformError::type_mismatch(
                    column,
                    format!("cannot compare {v} with numbers or strings of this column"),
                ));
            }
        };
        if ord == want {
            best = Some(v);
        }
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

impl Transformer for AggregationTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> Value {
        serde_json::json!({
            "group_by": self.group_by,
            "aggregations": self.aggregations,
        })
    }

    fn transform(&self, input: &Table) -> Result<Table, TransformError> {
        let key_idx: Vec<usize> = self
            .group_by
            .iter()
            .map(|c| require_column(input, c))
            .collect::<Result<_, _>>()?;
        let agg_idx: Vec<usize> = self
            .aggregations
            .iter()
            .map(|a| require_column(input, &a.column))
            .collect::<Result<_, _>>()?;

        let mut groups: Vec<(Vec<Value>, Vec<usize>)> = Vec::new();
        let mut lookup: HashMap<String, usize> = HashMap::new();
        for (r, row) in input.rows().iter().enumerate() {
            let key: Vec<Value> = key_idx.iter().map(|&i| row[i].clone()).collect();
            let fingerprint = Value::Array(key.clone()).to_string();
            match lookup.get(&fingerprint) {
                Some(&g) => groups[g].1.push(r),
                None => {
                    lookup.insert(fingerprint, groups.len());
                    groups.push((key, vec![r]));
                }
            }
        }

        let mut rows = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            let mut out = key;
            for (agg, &col) in self.aggregations.iter().zip(&agg_idx) {
                let values: Vec<&Value> = members
                    .iter()
                    .map(|&r| &input.rows()[r][col])
                    .filter(|v| !v.is_null())
                    .collect();
                out.push(self.reduce(agg, &values)?);
            }
            rows.push(out);
        }

        let mut columns = self.group_by.clone();
        columns.extend(self.output_names());
        Ok(Table::new(columns, rows)?)
    }
}
