//! Cell parsing, type inference and casts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Column data type, as inferred from cell values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Boolean,
    Json,
    Null,
}

impl ColumnType {
    /// SQLite storage type for columns of this type.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::String | ColumnType::Json | ColumnType::Null => "TEXT",
        }
    }
}

/// Target of an explicit cast in a cleaning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    Integer,
    Float,
    String,
    Boolean,
}

impl std::fmt::Display for CastType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CastType::Integer => write!(f, "integer"),
            CastType::Float => write!(f, "float"),
            CastType::String => write!(f, "string"),
            CastType::Boolean => write!(f, "boolean"),
        }
    }
}

/// Infer column type from a sample of values.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a Value>) -> ColumnType {
    let mut has_int = false;
    let mut has_float = false;
    let mut has_bool = false;
    let mut has_string = false;
    let mut has_json = false;

    for v in values {
        match v {
            Value::Null => {}
            Value::Number(n) => {
                if n.is_f64() {
                    has_float = true;
                } else {
                    has_int = true;
                }
            }
            Value::Bool(_) => has_bool = true,
            Value::String(_) => has_string = true,
            Value::Array(_) | Value::Object(_) => has_json = true,
        }
    }

    if has_json {
        return ColumnType::Json;
    }
    if has_string {
        return ColumnType::String;
    }
    if has_float {
        return ColumnType::Float;
    }
    if has_int {
        return if has_bool {
            ColumnType::String
        } else {
            ColumnType::Integer
        };
    }
    if has_bool {
        return ColumnType::Boolean;
    }
    ColumnType::Null
}

/// Parse one text cell (CSV) into a typed JSON value. Empty cells are missing.
pub fn parse_cell(raw: &str) -> Value {
    let s = raw.trim();
    if s.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = s.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

/// Render a cell as text for CSV output. Missing values become empty cells.
pub fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Wrap an `f64` result as a JSON number; non-finite results are missing.
pub fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Cast `value` to `target`. Missing values stay missing. On failure the
/// original value is handed back.
pub fn cast_value(value: Value, target: CastType) -> Result<Value, Value> {
    if value.is_null() {
        return Ok(value);
    }
    let cast = match (&value, target) {
        (Value::Number(n), CastType::Integer) => n.as_i64().map(Value::from).or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| Value::from(f as i64))
        }),
        (Value::String(s), CastType::Integer) => {
            let s = s.trim();
            s.parse::<i64>().ok().map(Value::from).or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Value::from(f as i64))
            })
        }
        (Value::Bool(b), CastType::Integer) => Some(Value::from(i64::from(*b))),

        (Value::Number(n), CastType::Float) => n.as_f64().map(float_value),
        (Value::String(s), CastType::Float) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(float_value),
        (Value::Bool(b), CastType::Float) => Some(float_value(if *b { 1.0 } else { 0.0 })),

        (Value::String(_), CastType::String) => Some(value.clone()),
        (Value::Number(n), CastType::String) => Some(Value::String(n.to_string())),
        (Value::Bool(b), CastType::String) => Some(Value::String(b.to_string())),

        (Value::Bool(_), CastType::Boolean) => Some(value.clone()),
        (Value::String(s), CastType::Boolean) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Value::Bool(true)),
            "false" | "0" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        (Value::Number(n), CastType::Boolean) => match n.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },

        _ => None,
    };
    cast.ok_or(value)
}
