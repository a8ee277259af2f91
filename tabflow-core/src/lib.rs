//! # tabflow-core: tabular extract, transform, load pipelines
//!
//! A pipeline pulls tables from one or more [`Source`]s, combines them,
//! threads the result through an ordered list of [`Transformer`]s and hands
//! the final table to every [`Sink`]. Transformer outputs are memoized in a
//! content-addressed [`Cache`] keyed on input fingerprint, step name and
//! step configuration.
//!
//! Pipelines are built in code through [`Pipeline`] or declared in a TOML or
//! JSON file and loaded with [`config::load_definition`].

pub mod cache;
pub mod combine;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod middleware;
pub mod observer;
pub mod persistence;
pub mod pipeline;
pub mod report;
pub mod schema;
pub mod sink;
pub mod source;
pub mod table;
pub mod transform;

// Re-exports
pub use cache::{Cache, CacheKey, FileCache, InMemoryCache};
pub use combine::{CombineStrategy, JoinKind};
pub use config::{PipelineDefinition, load_definition};
pub use error::{ConfigError, PipelineError, SinkError, SourceError, TableError, TransformError};
pub use observer::{PipelineEvent, PipelineObserver, TracingObserver};
pub use pipeline::Pipeline;
pub use report::{PipelineRunResult, RunState};
pub use sink::{CsvSink, JsonSink, Sink, SqliteSink, WriteMode};
pub use source::{ApiSource, CsvSource, JsonSource, Source, SqliteSource};
pub use table::Table;
pub use transform::{
    AggregationTransformer, CleaningTransformer, FeatureEngineeringTransformer, StepRegistries,
    Transformer,
};
