//! The pipeline orchestrator: extract, combine, transform, load.

use crate::cache::{Cache, DEFAULT_TTL, FileCache};
use crate::combine::{CombineStrategy, combine};
use crate::error::{PipelineError, SinkError, SourceError, TransformError};
use crate::middleware::{
    StepOutput, Timed, guarded, panic_message, run_step, transform_with_cache, with_deadline,
};
use crate::observer::{PipelineEvent, PipelineObserver, StepKind, TracingObserver};
use crate::report::{PipelineRunResult, RunState, SinkStats, SourceStats, TransformerStats};
use crate::sink::Sink;
use crate::source::Source;
use crate::table::Table;
use crate::transform::Transformer;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Directory used by the default file cache, relative to the working
/// directory.
pub const DEFAULT_CACHE_DIR: &str = ".tabflow/cache";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Ordered sources, transformers and sinks plus the policies used to run
/// them.
///
/// Steps are registered before the first [`run`](Pipeline::run); once a run
/// has started the step lists are frozen. A pipeline can be run any number
/// of times.
pub struct Pipeline {
    name: String,
    sources: Vec<Arc<dyn Source>>,
    transformers: Vec<Arc<dyn Transformer>>,
    sinks: Vec<Arc<dyn Sink>>,
    combine: CombineStrategy,
    cache: Option<Arc<dyn Cache>>,
    cache_ttl: Duration,
    observer: Arc<dyn PipelineObserver>,
    max_concurrency: usize,
    step_timeout: Option<Duration>,
    runs: AtomicUsize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("sources", &self.source_names())
            .field("transformers", &self.transformer_names())
            .field("sinks", &self.sink_names())
            .field("combine", &self.combine)
            .field("cached", &self.cache.is_some())
            .field("max_concurrency", &self.max_concurrency)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

impl Pipeline {
    /// New pipeline with a file cache under [`DEFAULT_CACHE_DIR`] and the
    /// tracing observer.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            transformers: Vec::new(),
            sinks: Vec::new(),
            combine: CombineStrategy::default(),
            cache: Some(Arc::new(FileCache::new(DEFAULT_CACHE_DIR))),
            cache_ttl: DEFAULT_TTL,
            observer: Arc::new(TracingObserver),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            step_timeout: Some(DEFAULT_STEP_TIMEOUT),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn transformer_names(&self) -> Vec<&str> {
        self.transformers.iter().map(|t| t.name()).collect()
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Number of runs started so far.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn check_open(&self, kind: StepKind, name: &str, taken: &[&str]) -> Result<(), PipelineError> {
        if self.run_count() > 0 {
            return Err(PipelineError::invalid_config(format!(
                "cannot add {kind} '{name}' to pipeline '{}' after it has run",
                self.name
            )));
        }
        if taken.contains(&name) {
            return Err(PipelineError::invalid_config(format!(
                "{kind} name '{name}' is already registered in pipeline '{}'",
                self.name
            )));
        }
        Ok(())
    }

    pub fn add_source<S: Source + 'static>(&mut self, source: S) -> Result<&mut Self, PipelineError> {
        self.add_shared_source(Arc::new(source))
    }

    pub fn add_shared_source(&mut self, source: Arc<dyn Source>) -> Result<&mut Self, PipelineError> {
        self.check_open(StepKind::Source, source.name(), &self.source_names())?;
        self.sources.push(source);
        Ok(self)
    }

    pub fn add_transformer<T: Transformer + 'static>(
        &mut self,
        transformer: T,
    ) -> Result<&mut Self, PipelineError> {
        self.add_shared_transformer(Arc::new(transformer))
    }

    pub fn add_shared_transformer(
        &mut self,
        transformer: Arc<dyn Transformer>,
    ) -> Result<&mut Self, PipelineError> {
        self.check_open(
            StepKind::Transformer,
            transformer.name(),
            &self.transformer_names(),
        )?;
        self.transformers.push(transformer);
        Ok(self)
    }

    pub fn add_sink<S: Sink + 'static>(&mut self, sink: S) -> Result<&mut Self, PipelineError> {
        self.add_shared_sink(Arc::new(sink))
    }

    pub fn add_shared_sink(&mut self, sink: Arc<dyn Sink>) -> Result<&mut Self, PipelineError> {
        self.check_open(StepKind::Sink, sink.name(), &self.sink_names())?;
        self.sinks.push(sink);
        Ok(self)
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_combine_strategy(mut self, strategy: CombineStrategy) -> Self {
        self.combine = strategy;
        self
    }

    /// Limit on sources extracted (and sinks written) at the same time.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Deadline for each source and sink call; `None` disables it.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    fn emit(&self, event: PipelineEvent) {
        self.observer.on_event(&event);
    }

    fn enter(&self, report: &mut PipelineRunResult, state: RunState) {
        report.state = state;
        self.emit(PipelineEvent::StageEntered {
            pipeline: self.name.clone(),
            state,
        });
    }

    /// Execute the pipeline once.
    ///
    /// Never fails: source, combine and transform errors abort the run and
    /// are reported in `error`; sink errors are recorded per sink and make
    /// the run unsuccessful without stopping the other sinks.
    pub async fn run(&self) -> PipelineRunResult {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = PipelineRunResult::started(&self.name);
        self.emit(PipelineEvent::RunStarted {
            pipeline: self.name.clone(),
            run,
        });

        match self.execute(&mut report).await {
            Ok(()) if report.error.is_none() => {
                report.success = true;
                report.state = RunState::Completed;
            }
            Ok(()) => {
                report.state = RunState::Failed;
            }
            Err(err) => {
                report.error = Some(err.to_string());
                report.state = RunState::Failed;
            }
        }

        report.end_time = Utc::now();
        self.emit(PipelineEvent::RunFinished {
            pipeline: self.name.clone(),
            success: report.success,
            duration_ms: report.duration_ms(),
        });
        report
    }

    async fn execute(&self, report: &mut PipelineRunResult) -> Result<(), PipelineError> {
        self.enter(report, RunState::Extracting);
        let extracted = self.extract_all(report).await?;

        self.enter(report, RunState::Combining);
        let mut table = combine(&self.combine, extracted).map_err(PipelineError::Combine)?;

        for (index, transformer) in self.transformers.iter().enumerate() {
            self.enter(report, RunState::Transforming { index });
            let name = transformer.name().to_string();
            let timed = run_step(
                self.observer.as_ref(),
                StepKind::Transformer,
                &name,
                self.transform_one(Arc::clone(transformer), table),
            )
            .await;
            let output = timed.value.map_err(|source| PipelineError::Transform {
                name: name.clone(),
                source,
            })?;
            report.transformers.push(TransformerStats {
                name,
                cache_hit: output.cache_hit,
                records_after: output.table.row_count(),
                columns_after: output.table.column_count(),
                duration_ms: timed.duration_ms,
            });
            table = output.table;
        }
        report.output = Some(table.clone());

        self.enter(report, RunState::Loading);
        self.load_all(report, Arc::new(table)).await;
        Ok(())
    }

    async fn extract_all(
        &self,
        report: &mut PipelineRunResult,
    ) -> Result<Vec<(String, Table)>, PipelineError> {
        if self.sources.is_empty() {
            return Err(PipelineError::invalid_config(format!(
                "pipeline '{}' has no sources",
                self.name
            )));
        }

        let observer = self.observer.as_ref();
        let results: Vec<Timed<Result<Table, SourceError>>> = futures::stream::iter(&self.sources)
            .map(|source| async move {
                run_step(
                    observer,
                    StepKind::Source,
                    source.name(),
                    self.extract_one(source.as_ref()),
                )
                .await
            })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let mut tables = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (source, timed) in self.sources.iter().zip(results) {
            match timed.value {
                Ok(table) => {
                    report.sources.push(SourceStats {
                        name: source.name().to_string(),
                        records: table.row_count(),
                        columns: table.columns().to_vec(),
                        duration_ms: timed.duration_ms,
                    });
                    tables.push((source.name().to_string(), table));
                }
                Err(err) => {
                    first_error.get_or_insert(PipelineError::Source {
                        name: source.name().to_string(),
                        source: err,
                    });
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(tables),
        }
    }

    async fn extract_one(&self, source: &dyn Source) -> Result<Table, SourceError> {
        let name = source.name();
        guarded(
            with_deadline(
                self.step_timeout,
                |limit| {
                    SourceError::network(format!(
                        "source '{name}' timed out after {}s",
                        limit.as_secs_f64()
                    ))
                },
                source.extract(),
            ),
            |msg| SourceError::malformed(format!("source '{name}' panicked: {msg}")),
        )
        .await
    }

    async fn transform_one(
        &self,
        transformer: Arc<dyn Transformer>,
        input: Table,
    ) -> Result<StepOutput, TransformError> {
        let cache = self.cache.clone();
        let observer = Arc::clone(&self.observer);
        let ttl = self.cache_ttl;
        let task = tokio::task::spawn_blocking(move || {
            transform_with_cache(
                transformer.as_ref(),
                &input,
                cache.as_deref(),
                ttl,
                observer.as_ref(),
            )
        });
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TransformError::invalid_config(format!(
                "step panicked: {}",
                panic_message(&*e.into_panic())
            ))),
            Err(e) => Err(TransformError::invalid_config(format!(
                "step task failed: {e}"
            ))),
        }
    }

    async fn load_all(&self, report: &mut PipelineRunResult, table: Arc<Table>) {
        let observer = self.observer.as_ref();
        let results: Vec<Timed<Result<bool, SinkError>>> = futures::stream::iter(&self.sinks)
            .map(|sink| {
                let table = Arc::clone(&table);
                async move {
                    run_step(
                        observer,
                        StepKind::Sink,
                        sink.name(),
                        self.load_one(sink.as_ref(), &table),
                    )
                    .await
                }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let mut failures = Vec::new();
        for (sink, timed) in self.sinks.iter().zip(results) {
            let error = match timed.value {
                Ok(true) => None,
                Ok(false) => Some(SinkError::write_failure("sink reported nothing written")),
                Err(err) => Some(err),
            };
            if let Some(err) = &error {
                failures.push(format!("sink '{}' failed: {err}", sink.name()));
            }
            report.sinks.push(SinkStats {
                name: sink.name().to_string(),
                success: error.is_none(),
                error: error.map(|e| e.to_string()),
                duration_ms: timed.duration_ms,
            });
        }
        if !failures.is_empty() {
            report.error = Some(failures.join("; "));
        }
    }

    async fn load_one(&self, sink: &dyn Sink, table: &Table) -> Result<bool, SinkError> {
        let name = sink.name();
        guarded(
            with_deadline(
                self.step_timeout,
                |limit| {
                    SinkError::write_failure(format!(
                        "sink '{name}' timed out after {}s",
                        limit.as_secs_f64()
                    ))
                },
                sink.load(table),
            ),
            |msg| SinkError::write_failure(format!("sink '{name}' panicked: {msg}")),
        )
        .await
    }
}
