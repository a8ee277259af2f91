//! Sinks: persist the final table to a file or a database.

use crate::error::SinkError;
use crate::persistence::atomic_write;
use crate::schema::{infer_column_type, render_cell};
use crate::source::sqlite_path;
use crate::table::Table;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Trait for writing the final table to a destination.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Write `table`. Returns `Ok(true)` once the destination holds it.
    async fn load(&self, table: &Table) -> Result<bool, SinkError>;
}

async fn run_blocking<F>(f: F) -> Result<bool, SinkError>
where
    F: FnOnce() -> Result<bool, SinkError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SinkError::write_failure(format!("writer task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// CsvSink
// ---------------------------------------------------------------------------

/// CSV file with a header row. Missing values are written as empty cells.
#[derive(Debug, Clone)]
pub struct CsvSink {
    name: String,
    path: PathBuf,
}

impl CsvSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Render a table as CSV text.
pub fn to_csv_bytes(table: &Table) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.columns())?;
    for row in table.rows() {
        writer.write_record(row.iter().map(render_cell))?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

#[async_trait]
impl Sink for CsvSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, table: &Table) -> Result<bool, SinkError> {
        let bytes = to_csv_bytes(table).map_err(|e| {
            SinkError::write_failure(format!("{}: {e}", self.path.display()))
        })?;
        let path = self.path.clone();
        let rows = table.row_count();
        run_blocking(move || {
            atomic_write(&path, &bytes).map_err(|e| SinkError::from_io(&path, e))?;
            tracing::debug!(path = %path.display(), rows, "Wrote CSV");
            Ok(true)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// JsonSink
// ---------------------------------------------------------------------------

/// JSON file holding an array of flat objects, keys in column order.
#[derive(Debug, Clone)]
pub struct JsonSink {
    name: String,
    path: PathBuf,
    indent: usize,
}

impl JsonSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            indent: 2,
        }
    }

    /// Spaces per indentation level; `0` writes compact JSON.
    pub fn with_indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }
}

fn to_json_bytes(table: &Table, indent: usize) -> Result<Vec<u8>, serde_json::Error> {
    let records = table.to_records();
    if indent == 0 {
        return serde_json::to_vec(&records);
    }
    let pad = " ".repeat(indent);
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(pad.as_bytes());
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    records.serialize(&mut ser)?;
    out.push(b'\n');
    Ok(out)
}

#[async_trait]
impl Sink for JsonSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, table: &Table) -> Result<bool, SinkError> {
        let bytes = to_json_bytes(table, self.indent).map_err(|e| {
            SinkError::write_failure(format!("{}: {e}", self.path.display()))
        })?;
        let path = self.path.clone();
        run_blocking(move || {
            atomic_write(&path, &bytes).map_err(|e| SinkError::from_io(&path, e))?;
            tracing::debug!(path = %path.display(), "Wrote JSON");
            Ok(true)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// SqliteSink
// ---------------------------------------------------------------------------

/// Behaviour when the destination table already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Drop and recreate the table.
    #[default]
    Replace,
    /// Insert into the existing table; its columns must match.
    Append,
    /// Refuse to write.
    Fail,
}

/// Table in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    name: String,
    connection: String,
    table: String,
    mode: WriteMode,
}

impl SqliteSink {
    pub fn new(
        name: impl Into<String>,
        connection: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            connection: connection.into(),
            table: table.into(),
            mode: WriteMode::Replace,
        }
    }

    pub fn with_mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sqlite_error(db: &Path, err: rusqlite::Error) -> SinkError {
    let detail = format!("{}: {err}", db.display());
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::PermissionDenied)
        | Some(rusqlite::ErrorCode::ReadOnly)
        | Some(rusqlite::ErrorCode::CannotOpen) => SinkError::permission_denied(detail),
        _ => SinkError::write_failure(detail),
    }
}

fn to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn existing_columns(
    conn: &rusqlite::Connection,
    table: &str,
) -> Result<Option<Vec<String>>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((!columns.is_empty()).then_some(columns))
}

fn write_sqlite(db: &Path, name: &str, mode: WriteMode, table: &Table) -> Result<bool, SinkError> {
    if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SinkError::from_io(parent, e))?;
    }
    let mut conn = rusqlite::Connection::open(db).map_err(|e| sqlite_error(db, e))?;
    let tx = conn.transaction().map_err(|e| sqlite_error(db, e))?;
    let ident = quote_ident(name);

    let existing = existing_columns(&tx, name).map_err(|e| sqlite_error(db, e))?;
    let create = match (existing, mode) {
        (None, _) => true,
        (Some(_), WriteMode::Fail) => {
            return Err(SinkError::write_failure(format!(
                "table '{name}' already exists in {}",
                db.display()
            )));
        }
        (Some(_), WriteMode::Replace) => {
            tx.execute(&format!("DROP TABLE {ident}"), [])
                .map_err(|e| sqlite_error(db, e))?;
            true
        }
        (Some(columns), WriteMode::Append) => {
            if columns != table.columns() {
                return Err(SinkError::schema_conflict(format!(
                    "table '{name}' has columns [{}], got [{}]",
                    columns.join(", "),
                    table.columns().join(", ")
                )));
            }
            false
        }
    };

    if create {
        let defs: Vec<String> = table
            .columns()
            .iter()
            .map(|c| {
                let ty = infer_column_type(table.column_values(c).unwrap_or_default());
                format!("{} {}", quote_ident(c), ty.sql_type())
            })
            .collect();
        tx.execute(&format!("CREATE TABLE {ident} ({})", defs.join(", ")), [])
            .map_err(|e| sqlite_error(db, e))?;
    }

    if !table.is_empty() {
        let placeholders = vec!["?"; table.column_count()].join(", ");
        let columns: Vec<String> = table.columns().iter().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "INSERT INTO {ident} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        let mut stmt = tx.prepare(&sql).map_err(|e| sqlite_error(db, e))?;
        for row in table.rows() {
            let params: Vec<rusqlite::types::Value> = row.iter().map(to_sql).collect();
            stmt.execute(rusqlite::params_from_iter(params))
                .map_err(|e| sqlite_error(db, e))?;
        }
    }

    tx.commit().map_err(|e| sqlite_error(db, e))?;
    tracing::debug!(db = %db.display(), table = name, rows = table.row_count(), "Wrote SQLite table");
    Ok(true)
}

#[async_trait]
impl Sink for SqliteSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, table: &Table) -> Result<bool, SinkError> {
        let db = sqlite_path(&self.connection);
        let name = self.table.clone();
        let mode = self.mode;
        let table = table.clone();
        run_blocking(move || write_sqlite(&db, &name, mode, &table)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn table() -> Table {
        Table::new(
            vec!["team".into(), "goals".into(), "xg".into()],
            vec![
                vec![json!("Ajax"), json!(3), json!(2.25)],
                vec![json!("PSV, Eindhoven"), Value::Null, json!(0.1)],
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_csv_sink_writes_header_and_empty_cells() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("teams.csv");
        assert!(CsvSink::new("csv", &path).load(&table()).await.unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "team,goals,xg\nAjax,3,2.25\n\"PSV, Eindhoven\",,0.1\n"
        );
    }

    #[tokio::test]
    async fn test_csv_sink_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("teams.csv");
        std::fs::write(&path, "stale").unwrap();
        CsvSink::new("csv", &path).load(&table()).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("team,"));
    }

    #[tokio::test]
    async fn test_csv_sink_unwritable_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = CsvSink::new("csv", blocker.join("out.csv"))
            .load(&table())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::WriteFailure { .. }));
    }

    #[tokio::test]
    async fn test_json_sink_key_order_and_indent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("teams.json");
        JsonSink::new("json", &path)
            .with_indent(0)
            .load(&table())
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            r#"[{"team":"Ajax","goals":3,"xg":2.25},{"team":"PSV, Eindhoven","goals":null,"xg":0.1}]"#
        );

        JsonSink::new("json", &path).load(&table()).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\n  {\n    \"team\": \"Ajax\""));
    }

    fn read_db(db: &Path, sql: &str) -> Vec<(String, Option<i64>)> {
        let conn = rusqlite::Connection::open(db).unwrap();
        let mut stmt = conn.prepare(sql).unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_sink_modes() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("stats.db");
        let conn = format!("sqlite://{}", db.display());

        SqliteSink::new("db", &conn, "teams").load(&table()).await.unwrap();
        SqliteSink::new("db", &conn, "teams")
            .with_mode(WriteMode::Append)
            .load(&table())
            .await
            .unwrap();
        let rows = read_db(&db, "SELECT team, goals FROM teams");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], ("PSV, Eindhoven".to_string(), None));

        SqliteSink::new("db", &conn, "teams").load(&table()).await.unwrap();
        assert_eq!(read_db(&db, "SELECT team, goals FROM teams").len(), 2);

        let err = SqliteSink::new("db", &conn, "teams")
            .with_mode(WriteMode::Fail)
            .load(&table())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::WriteFailure { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_sink_append_schema_conflict() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("stats.db");
        let conn = db.display().to_string();
        SqliteSink::new("db", &conn, "teams").load(&table()).await.unwrap();

        let other = Table::new(vec!["club".into()], vec![vec![json!("Ajax")]]).unwrap();
        let err = SqliteSink::new("db", &conn, "teams")
            .with_mode(WriteMode::Append)
            .load(&other)
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::SchemaConflict { .. }));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("goals"), "\"goals\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
