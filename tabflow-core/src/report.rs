//! Run state machine and the per-run report.

use crate::table::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage of a pipeline run.
///
/// `NotStarted -> Extracting -> Combining -> Transforming[i] -> Loading ->
/// Completed`, with `Failed` reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Extracting,
    Combining,
    Transforming { index: usize },
    Loading,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "not_started"),
            RunState::Extracting => write!(f, "extracting"),
            RunState::Combining => write!(f, "combining"),
            RunState::Transforming { index } => write!(f, "transforming[{index}]"),
            RunState::Loading => write!(f, "loading"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub name: String,
    pub records: usize,
    pub columns: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerStats {
    pub name: String,
    pub cache_hit: bool,
    pub records_after: usize,
    pub columns_after: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkStats {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of one `Pipeline::run`.
///
/// Stats lists are in registration order and only hold steps that ran to
/// completion (sources, transformers) or were attempted (sinks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunResult {
    pub pipeline: String,
    pub state: RunState,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub sources: Vec<SourceStats>,
    pub transformers: Vec<TransformerStats>,
    pub sinks: Vec<SinkStats>,
    pub error: Option<String>,
    /// Final table, present once the transform stage completed.
    #[serde(skip)]
    pub output: Option<Table>,
}

impl PipelineRunResult {
    pub(crate) fn started(pipeline: &str) -> Self {
        let now = Utc::now();
        Self {
            pipeline: pipeline.to_string(),
            state: RunState::NotStarted,
            start_time: now,
            end_time: now,
            success: false,
            sources: Vec::new(),
            transformers: Vec::new(),
            sinks: Vec::new(),
            error: None,
            output: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as u64
    }

    /// Count of transformer steps served from the cache.
    pub fn cache_hits(&self) -> usize {
        self.transformers.iter().filter(|t| t.cache_hit).count()
    }

    pub fn failed_sinks(&self) -> impl Iterator<Item = &SinkStats> {
        self.sinks.iter().filter(|s| !s.success)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
