//! Wrappers the orchestrator applies around every step: timing and events,
//! deadlines, panic capture and cache lookup.

use crate::cache::{Cache, CacheKey};
use crate::error::TransformError;
use crate::observer::{PipelineEvent, PipelineObserver, StepKind};
use crate::table::Table;
use crate::transform::Transformer;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

/// A step result with its wall-clock duration.
#[derive(Debug)]
pub struct Timed<T> {
    pub value: T,
    pub duration_ms: u64,
}

/// Await `fut` as the step `kind`/`name`, emitting start, finish and
/// failure events around it.
pub async fn run_step<T, E, F>(
    observer: &dyn PipelineObserver,
    kind: StepKind,
    name: &str,
    fut: F,
) -> Timed<Result<T, E>>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    observer.on_event(&PipelineEvent::StepStarted {
        kind,
        name: name.to_string(),
    });
    let start = Instant::now();
    let value = fut.await;
    let duration_ms = start.elapsed().as_millis() as u64;
    match &value {
        Ok(_) => observer.on_event(&PipelineEvent::StepFinished {
            kind,
            name: name.to_string(),
            duration_ms,
        }),
        Err(e) => observer.on_event(&PipelineEvent::StepFailed {
            kind,
            name: name.to_string(),
            error: e.to_string(),
        }),
    }
    Timed { value, duration_ms }
}

/// Bound `fut` by `deadline`; `None` waits forever.
pub async fn with_deadline<T, E, F>(
    deadline: Option<Duration>,
    on_timeout: impl FnOnce(Duration) -> E,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(limit)),
        },
        None => fut.await,
    }
}

/// Turn a panic inside `fut` into an error.
pub async fn guarded<T, E, F>(fut: F, on_panic: impl FnOnce(String) -> E) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(on_panic(panic_message(&*payload))),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Output of one transformer invocation.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub table: Table,
    pub cache_hit: bool,
}

/// Run `step` on `input`, serving the result from `cache` when an unexpired
/// entry exists for the same input, step name and configuration.
///
/// Blocking: may read and write cache files. Call it from the blocking pool.
pub fn transform_with_cache(
    step: &dyn Transformer,
    input: &Table,
    cache: Option<&dyn Cache>,
    ttl: Duration,
    observer: &dyn PipelineObserver,
) -> Result<StepOutput, TransformError> {
    let cache = cache.filter(|_| step.is_cacheable());
    let Some(cache) = cache else {
        return Ok(StepOutput {
            table: step.transform(input)?,
            cache_hit: false,
        });
    };

    let key = CacheKey::for_step(input, step);
    let digest = key.digest();
    if let Some(table) = cache.get(&key) {
        observer.on_event(&PipelineEvent::CacheHit {
            step: step.name().to_string(),
            key: digest,
        });
        return Ok(StepOutput {
            table,
            cache_hit: true,
        });
    }

    observer.on_event(&PipelineEvent::CacheMiss {
        step: step.name().to_string(),
        key: digest,
    });
    let table = step.transform(input)?;
    cache.set(&key, &table, ttl);
    Ok(StepOutput {
        table,
        cache_hit: false,
    })
}
