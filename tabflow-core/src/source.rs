//! Sources: extract a table from a file, an HTTP API or a database.

use crate::error::SourceError;
use crate::schema::parse_cell;
use crate::table::Table;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for API requests.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a source reads from, for logs and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub source_type: String,
    pub location: String,
}

/// Trait for extracting a table from an external origin.
#[async_trait]
pub trait Source: Send + Sync {
    /// Name used in run reports and error messages.
    fn name(&self) -> &str;

    /// Read the origin and build a table.
    async fn extract(&self) -> Result<Table, SourceError>;

    /// Return metadata about this source.
    fn info(&self) -> SourceInfo;
}

fn open_error(path: &Path, err: std::io::Error) -> SourceError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            SourceError::not_found(format!("{} does not exist", path.display()))
        }
        _ => SourceError::not_found(format!("{} cannot be opened: {err}", path.display())),
    }
}

async fn run_blocking<F>(label: &str, f: F) -> Result<Table, SourceError>
where
    F: FnOnce() -> Result<Table, SourceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SourceError::malformed(format!("{label} reader task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// CsvSource
// ---------------------------------------------------------------------------

/// CSV file with a header row.
#[derive(Debug, Clone)]
pub struct CsvSource {
    name: String,
    path: PathBuf,
    delimiter: u8,
    infer_types: bool,
}

impl CsvSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            delimiter: b',',
            infer_types: true,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Keep every non-empty cell as a string instead of inferring numbers
    /// and booleans.
    pub fn with_type_inference(mut self, infer_types: bool) -> Self {
        self.infer_types = infer_types;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_csv(path: &Path, delimiter: u8, infer_types: bool) -> Result<Table, SourceError> {
    let file = std::fs::File::open(path).map_err(|e| open_error(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(file);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| {
            SourceError::malformed(format!("{}: failed to read header: {e}", path.display()))
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            SourceError::malformed(format!("{}: record {}: {e}", path.display(), line + 1))
        })?;
        let row = record
            .iter()
            .map(|cell| {
                if infer_types {
                    parse_cell(cell)
                } else if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                }
            })
            .collect();
        rows.push(row);
    }

    Table::new(columns, rows)
        .map_err(|e| SourceError::malformed(format!("{}: {e}", path.display())))
}

#[async_trait]
impl Source for CsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self) -> Result<Table, SourceError> {
        let path = self.path.clone();
        let delimiter = self.delimiter;
        let infer_types = self.infer_types;
        run_blocking("CSV", move || read_csv(&path, delimiter, infer_types)).await
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            source_type: "csv".to_string(),
            location: self.path.display().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// JsonSource
// ---------------------------------------------------------------------------

/// JSON file holding an array of flat objects.
#[derive(Debug, Clone)]
pub struct JsonSource {
    name: String,
    path: PathBuf,
    records_path: Option<String>,
}

impl JsonSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            records_path: None,
        }
    }

    /// Dot-separated path to the records array inside the document,
    /// e.g. `data.players`.
    pub fn with_records_path(mut self, records_path: impl Into<String>) -> Self {
        self.records_path = Some(records_path.into());
        self
    }
}

#[async_trait]
impl Source for JsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self) -> Result<Table, SourceError> {
        let path = self.path.clone();
        let records_path = self.records_path.clone();
        run_blocking("JSON", move || {
            let content = std::fs::read(&path).map_err(|e| open_error(&path, e))?;
            let value: Value = serde_json::from_slice(&content).map_err(|e| {
                SourceError::malformed(format!("{}: invalid JSON: {e}", path.display()))
            })?;
            records_to_table(value, records_path.as_deref())
        })
        .await
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            source_type: "json".to_string(),
            location: self.path.display().to_string(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn select_path(value: Value, records_path: &str) -> Result<Value, SourceError> {
    let mut current = value;
    for segment in records_path.split('.').filter(|s| !s.is_empty()) {
        let next = match &mut current {
            Value::Object(map) => map.get_mut(segment).map(Value::take),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .map(Value::take),
            _ => None,
        };
        current = next.ok_or_else(|| {
            SourceError::malformed(format!(
                "records path '{records_path}' has no segment '{segment}'"
            ))
        })?;
    }
    Ok(current)
}

/// Map a JSON document to a table: an array of objects maps directly, any
/// other shape needs `records_path` to point at such an array. Columns are
/// the union of object keys in first-seen order; absent keys are missing.
pub fn records_to_table(value: Value, records_path: Option<&str>) -> Result<Table, SourceError> {
    let selected = match records_path {
        Some(path) => select_path(value, path)?,
        None => value,
    };
    let items = match selected {
        Value::Array(items) => items,
        other => {
            return Err(SourceError::malformed(format!(
                "expected an array of objects, found {}",
                json_kind(&other)
            )));
        }
    };

    let mut columns: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut objects = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => {
                for key in map.keys() {
                    if seen.insert(key.clone()) {
                        columns.push(key.clone());
                    }
                }
                objects.push(map);
            }
            other => {
                return Err(SourceError::malformed(format!(
                    "record {i} is {} rather than an object",
                    json_kind(&other)
                )));
            }
        }
    }

    let rows = objects
        .iter()
        .map(|obj| {
            columns
                .iter()
                .map(|col| obj.get(col).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    Ok(Table::new(columns, rows)?)
}

// ---------------------------------------------------------------------------
// ApiSource
// ---------------------------------------------------------------------------

/// HTTP method for an API source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
}

/// REST API returning JSON records.
#[derive(Debug, Clone)]
pub struct ApiSource {
    name: String,
    url: String,
    method: HttpMethod,
    query: Vec<(String, String)>,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    timeout: Duration,
    records_path: Option<String>,
}

impl ApiSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: HttpMethod::Get,
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
            timeout: DEFAULT_API_TIMEOUT,
            records_path: None,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// JSON request body, sent with `POST`.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_records_path(mut self, records_path: impl Into<String>) -> Self {
        self.records_path = Some(records_path.into());
        self
    }
}

#[async_trait]
impl Source for ApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self) -> Result<Table, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SourceError::network(format!("failed to build HTTP client: {e}")))?;

        let mut request = match self.method {
            HttpMethod::Get => client.get(&self.url),
            HttpMethod::Post => client.post(&self.url),
        };
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &self.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::network(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SourceError::auth(format!("{} returned {status}", self.url)));
        }
        if !status.is_success() {
            return Err(SourceError::query(format!(
                "{} returned {status}",
                self.url
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::network(format!("{}: {e}", self.url)))?;
        let value: Value = serde_json::from_slice(&body).map_err(|e| {
            SourceError::malformed(format!("{}: response is not JSON: {e}", self.url))
        })?;

        records_to_table(value, self.records_path.as_deref())
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            source_type: "api".to_string(),
            location: self.url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// SqliteSource
// ---------------------------------------------------------------------------

/// Resolve a `sqlite://` connection string (or a bare path) to a file path.
pub fn sqlite_path(connection: &str) -> PathBuf {
    PathBuf::from(connection.strip_prefix("sqlite://").unwrap_or(connection))
}

/// SQLite database queried with a SQL statement.
#[derive(Debug, Clone)]
pub struct SqliteSource {
    name: String,
    connection: String,
    query: String,
}

impl SqliteSource {
    pub fn new(
        name: impl Into<String>,
        connection: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connection: connection.into(),
            query: query.into(),
        }
    }
}

fn query_sqlite(db_path: &Path, query: &str) -> Result<Table, SourceError> {
    if !db_path.exists() {
        return Err(SourceError::not_found(format!(
            "database {} does not exist",
            db_path.display()
        )));
    }
    let conn =
        rusqlite::Connection::open_with_flags(db_path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| SourceError::query(format!("{}: {e}", db_path.display())))?;
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| SourceError::query(e.to_string()))?;
    let column_count = stmt.column_count();
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = Vec::new();
    let mut result_rows = stmt
        .query([])
        .map_err(|e| SourceError::query(e.to_string()))?;
    while let Some(row) = result_rows
        .next()
        .map_err(|e| SourceError::query(e.to_string()))?
    {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let val = match row.get_ref(i) {
                Ok(rusqlite::types::ValueRef::Null) => Value::Null,
                Ok(rusqlite::types::ValueRef::Integer(n)) => Value::from(n),
                Ok(rusqlite::types::ValueRef::Real(f)) => crate::schema::float_value(f),
                Ok(rusqlite::types::ValueRef::Text(t)) => {
                    Value::String(String::from_utf8_lossy(t).into_owned())
                }
                Ok(rusqlite::types::ValueRef::Blob(_)) => Value::String("<blob>".to_string()),
                Err(e) => return Err(SourceError::query(e.to_string())),
            };
            values.push(val);
        }
        rows.push(values);
    }

    Table::new(columns, rows).map_err(|e| SourceError::malformed(e.to_string()))
}

#[async_trait]
impl Source for SqliteSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self) -> Result<Table, SourceError> {
        let db_path = sqlite_path(&self.connection);
        let query = self.query.clone();
        run_blocking("SQLite", move || query_sqlite(&db_path, &query)).await
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            source_type: "sqlite".to_string(),
            location: self.connection.clone(),
        }
    }
}
