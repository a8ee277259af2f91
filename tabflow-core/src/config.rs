//! Declarative pipeline definitions.
//!
//! Uses `figment` for layered loading: built-in defaults -> definition file
//! (TOML, or JSON by extension) -> `TABFLOW_*` environment variables.

use crate::cache::FileCache;
use crate::combine::CombineStrategy;
use crate::error::ConfigError;
use crate::pipeline::{DEFAULT_CACHE_DIR, DEFAULT_MAX_CONCURRENCY, Pipeline};
use crate::sink::{CsvSink, JsonSink, Sink, SqliteSink, WriteMode};
use crate::source::{ApiSource, CsvSource, HttpMethod, JsonSource, Source, SqliteSource};
use crate::transform::{
    Aggregation, AggregationTransformer, CleaningConfig, CleaningTransformer,
    FeatureEngineeringTransformer, FeatureSpec, StepRegistries, Transformer,
};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Cache settings of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(DEFAULT_CACHE_DIR),
            ttl_secs: 86_400,
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

fn default_api_timeout() -> u64 {
    30
}

fn default_indent() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDefinition {
    Csv {
        name: String,
        path: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_true")]
        infer_types: bool,
    },
    Json {
        name: String,
        path: PathBuf,
        #[serde(default)]
        records_path: Option<String>,
    },
    Api {
        name: String,
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default)]
        query: BTreeMap<String, String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default = "default_api_timeout")]
        timeout_secs: u64,
        #[serde(default)]
        records_path: Option<String>,
    },
    Sqlite {
        name: String,
        connection: String,
        query: String,
    },
}

impl SourceDefinition {
    pub fn name(&self) -> &str {
        match self {
            SourceDefinition::Csv { name, .. }
            | SourceDefinition::Json { name, .. }
            | SourceDefinition::Api { name, .. }
            | SourceDefinition::Sqlite { name, .. } => name,
        }
    }

    pub fn build(&self) -> Result<Arc<dyn Source>, ConfigError> {
        Ok(match self {
            SourceDefinition::Csv {
                name,
                path,
                delimiter,
                infer_types,
            } => {
                let delimiter = u8::try_from(*delimiter)
                    .ok()
                    .filter(u8::is_ascii)
                    .ok_or_else(|| {
                        ConfigError::invalid(format!(
                            "source '{name}': delimiter '{delimiter}' is not a single ASCII character"
                        ))
                    })?;
                Arc::new(
                    CsvSource::new(name, path)
                        .with_delimiter(delimiter)
                        .with_type_inference(*infer_types),
                )
            }
            SourceDefinition::Json {
                name,
                path,
                records_path,
            } => {
                let mut source = JsonSource::new(name, path);
                if let Some(records_path) = records_path {
                    source = source.with_records_path(records_path);
                }
                Arc::new(source)
            }
            SourceDefinition::Api {
                name,
                url,
                method,
                query,
                headers,
                body,
                timeout_secs,
                records_path,
            } => {
                let mut source = ApiSource::new(name, url)
                    .with_method(*method)
                    .with_timeout(Duration::from_secs(*timeout_secs));
                for (k, v) in query {
                    source = source.with_query(k, v);
                }
                for (k, v) in headers {
                    source = source.with_header(k, v);
                }
                if let Some(body) = body {
                    source = source.with_body(body.clone());
                }
                if let Some(records_path) = records_path {
                    source = source.with_records_path(records_path);
                }
                Arc::new(source)
            }
            SourceDefinition::Sqlite {
                name,
                connection,
                query,
            } => Arc::new(SqliteSource::new(name, connection, query)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformerDefinition {
    Cleaning {
        name: String,
        #[serde(flatten)]
        config: CleaningConfig,
    },
    Features {
        name: String,
        features: Vec<FeatureSpec>,
    },
    Aggregation {
        name: String,
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
}

impl TransformerDefinition {
    pub fn name(&self) -> &str {
        match self {
            TransformerDefinition::Cleaning { name, .. }
            | TransformerDefinition::Features { name, .. }
            | TransformerDefinition::Aggregation { name, .. } => name,
        }
    }

    pub fn build(&self, registries: &StepRegistries) -> Result<Arc<dyn Transformer>, ConfigError> {
        Ok(match self {
            TransformerDefinition::Cleaning { name, config } => {
                Arc::new(CleaningTransformer::from_config(name, config.clone()))
            }
            TransformerDefinition::Features { name, features } => Arc::new(
                FeatureEngineeringTransformer::new(
                    name,
                    features.clone(),
                    Arc::clone(&registries.formulas),
                )?,
            ),
            TransformerDefinition::Aggregation {
                name,
                group_by,
                aggregations,
            } => Arc::new(AggregationTransformer::new(
                name,
                group_by.clone(),
                aggregations.clone(),
                Arc::clone(&registries.reducers),
            )?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkDefinition {
    Csv {
        name: String,
        path: PathBuf,
    },
    Json {
        name: String,
        path: PathBuf,
        #[serde(default = "default_indent")]
        indent: usize,
    },
    Sqlite {
        name: String,
        connection: String,
        table: String,
        #[serde(default)]
        mode: WriteMode,
    },
}

impl SinkDefinition {
    pub fn name(&self) -> &str {
        match self {
            SinkDefinition::Csv { name, .. }
            | SinkDefinition::Json { name, .. }
            | SinkDefinition::Sqlite { name, .. } => name,
        }
    }

    pub fn build(&self) -> Arc<dyn Sink> {
        match self {
            SinkDefinition::Csv { name, path } => Arc::new(CsvSink::new(name, path)),
            SinkDefinition::Json { name, path, indent } => {
                Arc::new(JsonSink::new(name, path).with_indent(*indent))
            }
            SinkDefinition::Sqlite {
                name,
                connection,
                table,
                mode,
            } => Arc::new(SqliteSink::new(name, connection, table).with_mode(*mode)),
        }
    }
}

/// A whole pipeline described as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefinition {
    pub name: String,
    pub combine: CombineStrategy,
    pub max_concurrency: usize,
    pub step_timeout_secs: u64,
    pub cache: CacheSettings,
    pub sources: Vec<SourceDefinition>,
    pub transformers: Vec<TransformerDefinition>,
    pub sinks: Vec<SinkDefinition>,
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            combine: CombineStrategy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            step_timeout_secs: 300,
            cache: CacheSettings::default(),
            sources: Vec::new(),
            transformers: Vec::new(),
            sinks: Vec::new(),
        }
    }
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(ConfigError::invalid(format!("a {kind} has an empty name")));
        }
        if !seen.insert(name) {
            return Err(ConfigError::invalid(format!(
                "{kind} name '{name}' is used more than once"
            )));
        }
    }
    Ok(())
}

impl PipelineDefinition {
    /// Parse a TOML definition on top of the defaults. No environment layer.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let def: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        def.validate()?;
        Ok(def)
    }

    /// Structural checks that need no registries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("pipeline name must not be empty"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::invalid(format!(
                "pipeline '{}' declares no sources",
                self.name
            )));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency must be at least 1"));
        }
        if self.step_timeout_secs == 0 {
            return Err(ConfigError::invalid("step_timeout_secs must be at least 1"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.ttl_secs must be at least 1"));
        }
        check_unique("source", self.sources.iter().map(SourceDefinition::name))?;
        check_unique(
            "transformer",
            self.transformers.iter().map(TransformerDefinition::name),
        )?;
        check_unique("sink", self.sinks.iter().map(SinkDefinition::name))?;
        Ok(())
    }

    /// Construct the pipeline. Fails on unknown formulas or reducers.
    pub fn build(&self, registries: &StepRegistries) -> Result<Pipeline, ConfigError> {
        self.validate()?;
        let mut pipeline = Pipeline::new(&self.name)
            .with_combine_strategy(self.combine.clone())
            .with_max_concurrency(self.max_concurrency)
            .with_step_timeout(Some(Duration::from_secs(self.step_timeout_secs)))
            .with_cache_ttl(Duration::from_secs(self.cache.ttl_secs));
        pipeline = if self.cache.enabled {
            pipeline.with_cache(Arc::new(FileCache::new(&self.cache.dir)))
        } else {
            pipeline.without_cache()
        };

        for source in &self.sources {
            pipeline.add_shared_source(source.build()?)?;
        }
        for transformer in &self.transformers {
            pipeline.add_shared_transformer(transformer.build(registries)?)?;
        }
        for sink in &self.sinks {
            pipeline.add_shared_sink(sink.build())?;
        }
        Ok(pipeline)
    }
}

/// Load a definition file, then apply `TABFLOW_*` environment overrides
/// (`TABFLOW_MAX_CONCURRENCY`, `TABFLOW_CACHE__ENABLED`, ...).
pub fn load_definition(path: &Path) -> Result<PipelineDefinition, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let mut figment = Figment::from(Serialized::defaults(PipelineDefinition::default()));
    figment = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    };
    figment = figment.merge(Env::prefixed("TABFLOW_").split("__"));

    let def: PipelineDefinition = figment.extract()?;
    def.validate()?;
    tracing::debug!(
        path = %path.display(),
        pipeline = %def.name,
        sources = def.sources.len(),
        transformers = def.transformers.len(),
        sinks = def.sinks.len(),
        "Loaded pipeline definition"
    );
    Ok(def)
}
