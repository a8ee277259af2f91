//! Pipeline lifecycle events and their observers.

use crate::report::RunState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Kind of step an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Source,
    Transformer,
    Sink,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Source => write!(f, "source"),
            StepKind::Transformer => write!(f, "transformer"),
            StepKind::Sink => write!(f, "sink"),
        }
    }
}

/// Events emitted at stage and step boundaries of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        pipeline: String,
        run: usize,
    },
    StageEntered {
        pipeline: String,
        state: RunState,
    },
    StepStarted {
        kind: StepKind,
        name: String,
    },
    StepFinished {
        kind: StepKind,
        name: String,
        duration_ms: u64,
    },
    StepFailed {
        kind: StepKind,
        name: String,
        error: String,
    },
    CacheHit {
        step: String,
        key: String,
    },
    CacheMiss {
        step: String,
        key: String,
    },
    RunFinished {
        pipeline: String,
        success: bool,
        duration_ms: u64,
    },
}

impl PipelineEvent {
    pub fn event_name(&self) -> &str {
        match self {
            PipelineEvent::RunStarted { .. } => "run_started",
            PipelineEvent::StageEntered { .. } => "stage_entered",
            PipelineEvent::StepStarted { .. } => "step_started",
            PipelineEvent::StepFinished { .. } => "step_finished",
            PipelineEvent::StepFailed { .. } => "step_failed",
            PipelineEvent::CacheHit { .. } => "cache_hit",
            PipelineEvent::CacheMiss { .. } => "cache_miss",
            PipelineEvent::RunFinished { .. } => "run_finished",
        }
    }
}

/// Receives pipeline events. Called synchronously from the run; keep it cheap.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Logs every event through `tracing`. The default observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RunStarted { pipeline, run } => {
                info!(pipeline = %pipeline, run, "Pipeline run started");
            }
            PipelineEvent::StageEntered { pipeline, state } => {
                debug!(pipeline = %pipeline, stage = %state, "Entered stage");
            }
            PipelineEvent::StepStarted { kind, name } => {
                debug!(kind = %kind, step = %name, "Step started");
            }
            PipelineEvent::StepFinished {
                kind,
                name,
                duration_ms,
            } => {
                info!(kind = %kind, step = %name, duration_ms, "Step finished");
            }
            PipelineEvent::StepFailed { kind, name, error } => {
                warn!(kind = %kind, step = %name, error = %error, "Step failed");
            }
            PipelineEvent::CacheHit { step, key } => {
                debug!(step = %step, key = %key, "Cache hit");
            }
            PipelineEvent::CacheMiss { step, key } => {
                debug!(step = %step, key = %key, "Cache miss");
            }
            PipelineEvent::RunFinished {
                pipeline,
                success,
                duration_ms,
            } => {
                if *success {
                    info!(pipeline = %pipeline, duration_ms, "Pipeline run completed");
                } else {
                    warn!(pipeline = %pipeline, duration_ms, "Pipeline run failed");
                }
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn on_event(&self, _event: &PipelineEvent) {}
}

/// Collects events in memory; handy for asserting on a run's lifecycle.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.event_name().to_string())
            .collect()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_event(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = PipelineEvent::StepFinished {
            kind: StepKind::Sink,
            name: "out".into(),
            duration_ms: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_finished");
        assert_eq!(json["kind"], "sink");
        assert_eq!(event.event_name(), "step_finished");
    }

    #[test]
    fn test_recording_observer() {
        let obs = RecordingObserver::new();
        obs.on_event(&PipelineEvent::CacheMiss {
            step: "clean".into(),
            key: "abc".into(),
        });
        assert_eq!(obs.event_names(), ["cache_miss"]);
    }
}
