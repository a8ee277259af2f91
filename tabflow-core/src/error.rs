//! Error types for the tabflow-core crate.
//!
//! Every pipeline stage has its own error enum so a failed run can say which
//! kind of step broke and why. Cache faults have no error type: they always
//! degrade to a miss.

use std::path::PathBuf;

/// Errors raised while constructing a [`Table`](crate::table::Table).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("duplicate column name: {name}")]
    DuplicateColumn { name: String },

    #[error("row {row} has {actual} values, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("column '{column}' has {actual} values, expected {expected}")]
    ColumnLength {
        column: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors from extracting a table out of a source, or from combining the
/// tables of several sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("not found: {detail}")]
    NotFound { detail: String },

    #[error("malformed data: {detail}")]
    MalformedData { detail: String },

    #[error("network failure: {detail}")]
    NetworkFailure { detail: String },

    #[error("authentication failed: {detail}")]
    AuthFailure { detail: String },

    #[error("query failed: {detail}")]
    QueryFailure { detail: String },
}

impl SourceError {
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound {
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedData {
            detail: detail.into(),
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::NetworkFailure {
            detail: detail.into(),
        }
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::AuthFailure {
            detail: detail.into(),
        }
    }

    pub fn query(detail: impl Into<String>) -> Self {
        Self::QueryFailure {
            detail: detail.into(),
        }
    }
}

impl From<TableError> for SourceError {
    fn from(err: TableError) -> Self {
        Self::malformed(err.to_string())
    }
}

/// Errors from a transformer step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    #[error("missing column: {column}")]
    MissingColumn { column: String },

    #[error("type mismatch in column '{column}': {detail}")]
    TypeMismatch { column: String, detail: String },

    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },
}

impl TransformError {
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }

    pub fn type_mismatch(column: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TypeMismatch {
            column: column.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }
}

impl From<TableError> for TransformError {
    fn from(err: TableError) -> Self {
        Self::invalid_config(err.to_string())
    }
}

/// Errors from writing a table to a sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("permission denied: {detail}")]
    PermissionDenied { detail: String },

    #[error("write failed: {detail}")]
    WriteFailure { detail: String },

    #[error("schema conflict: {detail}")]
    SchemaConflict { detail: String },
}

impl SinkError {
    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self::PermissionDenied {
            detail: detail.into(),
        }
    }

    pub fn write_failure(detail: impl Into<String>) -> Self {
        Self::WriteFailure {
            detail: detail.into(),
        }
    }

    pub fn schema_conflict(detail: impl Into<String>) -> Self {
        Self::SchemaConflict {
            detail: detail.into(),
        }
    }

    /// Classify an I/O error raised while writing `target`.
    pub fn from_io(target: &std::path::Path, err: std::io::Error) -> Self {
        let detail = format!("{}: {err}", target.display());
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(detail),
            _ => Self::write_failure(detail),
        }
    }
}

/// Errors surfaced by the pipeline orchestrator. Each variant names the step
/// that failed so the run report can point at it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("source '{name}' failed: {source}")]
    Source { name: String, source: SourceError },

    #[error("combine stage failed: {0}")]
    Combine(SourceError),

    #[error("transformer '{name}' failed: {source}")]
    Transform { name: String, source: TransformError },

    #[error("sink '{name}' failed: {source}")]
    Sink { name: String, source: SinkError },

    #[error("invalid pipeline configuration: {message}")]
    InvalidConfig { message: String },
}

impl PipelineError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Errors from loading or validating a declarative pipeline definition.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Pipeline definition not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Pipeline definition parse error: {message}")]
    Parse { message: String },

    #[error("Invalid pipeline definition: {message}")]
    Invalid { message: String },

    #[error("Invalid transformer definition: {0}")]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }
}
