//! CLI subcommand handlers.

use crate::CacheAction;
use crate::Commands;
use crate::PresetKind;
use crate::presets;
use std::path::Path;
use tabflow_core::cache::FileCache;
use tabflow_core::{Pipeline, PipelineRunResult, StepRegistries, config};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            definition,
            report,
            no_cache,
        } => handle_run(&definition, report.as_deref(), no_cache).await,
        Commands::Validate { definition } => handle_validate(&definition),
        Commands::Preset {
            kind,
            input,
            output,
            no_cache,
        } => handle_preset(kind, &input, &output, no_cache).await,
        Commands::Cache { action } => handle_cache(action),
    }
}

async fn handle_run(
    definition: &Path,
    report_path: Option<&Path>,
    no_cache: bool,
) -> anyhow::Result<()> {
    let mut def = config::load_definition(definition)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", definition.display(), e))?;
    if no_cache {
        def.cache.enabled = false;
    }
    let pipeline = def
        .build(&StepRegistries::default())
        .map_err(|e| anyhow::anyhow!("Invalid pipeline '{}': {}", def.name, e))?;
    tracing::debug!(
        definition = %definition.display(),
        cache = def.cache.enabled,
        "Running pipeline definition"
    );

    let report = pipeline.run().await;
    let json = report.to_json_pretty()?;
    println!("{json}");
    if let Some(path) = report_path {
        tabflow_core::persistence::atomic_write(path, json.as_bytes())?;
        tracing::info!(path = %path.display(), "Report written");
    }
    finish(report)
}

fn handle_validate(definition: &Path) -> anyhow::Result<()> {
    let def = config::load_definition(definition)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", definition.display(), e))?;
    let pipeline = def
        .build(&StepRegistries::default())
        .map_err(|e| anyhow::anyhow!("Invalid pipeline '{}': {}", def.name, e))?;

    println!("Pipeline '{}' is valid", pipeline.name());
    println!("  sources:      {}", pipeline.source_names().join(", "));
    println!("  transformers: {}", pipeline.transformer_names().join(", "));
    println!("  sinks:        {}", pipeline.sink_names().join(", "));
    Ok(())
}

async fn handle_preset(
    kind: PresetKind,
    input: &Path,
    output: &Path,
    no_cache: bool,
) -> anyhow::Result<()> {
    let pipeline = match kind {
        PresetKind::Players => presets::player_stats_pipeline(input, output)?,
        PresetKind::Teams => presets::team_stats_pipeline(input, output)?,
        PresetKind::Matches => presets::match_stats_pipeline(input, output)?,
    };
    let pipeline: Pipeline = if no_cache {
        pipeline.without_cache()
    } else {
        pipeline
    };

    let report = pipeline.run().await;
    print_report(&report);
    finish(report)
}

fn handle_cache(action: CacheAction) -> anyhow::Result<()> {
    match action {
        CacheAction::Stats { dir } => {
            let stats = FileCache::new(&dir).stats()?;
            println!("Cache: {}", dir.display());
            println!("  entries:    {}", stats.entries);
            println!("  expired:    {}", stats.expired);
            println!("  unreadable: {}", stats.unreadable);
            println!("  size:       {} bytes", stats.total_bytes);
            Ok(())
        }
        CacheAction::Prune { dir } => {
            let removed = FileCache::new(&dir).prune_expired()?;
            println!("Removed {} stale entries from {}", removed, dir.display());
            Ok(())
        }
        CacheAction::Clear { dir } => {
            let removed = FileCache::new(&dir).clear()?;
            println!("Removed {} entries from {}", removed, dir.display());
            Ok(())
        }
    }
}

fn print_report(report: &PipelineRunResult) {
    let status = if report.success { "completed" } else { "failed" };
    println!(
        "Pipeline '{}' {} in {}ms",
        report.pipeline,
        status,
        report.duration_ms()
    );
    for source in &report.sources {
        println!(
            "  source       {:<20} {:>8} rows  {:>6}ms",
            source.name, source.records, source.duration_ms
        );
    }
    for step in &report.transformers {
        let cached = if step.cache_hit { " (cached)" } else { "" };
        println!(
            "  transformer  {:<20} {:>8} rows  {:>6}ms{}",
            step.name, step.records_after, step.duration_ms, cached
        );
    }
    for sink in &report.sinks {
        match &sink.error {
            None => println!("  sink         {:<20} ok        {:>6}ms", sink.name, sink.duration_ms),
            Some(err) => println!("  sink         {:<20} FAILED: {}", sink.name, err),
        }
    }
}

fn finish(report: PipelineRunResult) -> anyhow::Result<()> {
    if report.success {
        Ok(())
    } else {
        anyhow::bail!(
            "pipeline '{}' failed: {}",
            report.pipeline,
            report.error.as_deref().unwrap_or("unknown error")
        )
    }
}
