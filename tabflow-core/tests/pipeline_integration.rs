//! End-to-end pipeline runs against real files.

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tabflow_core::observer::{NoopObserver, RecordingObserver};
use tabflow_core::transform::{AggFunc, Aggregation, FeatureSpec};
use tabflow_core::{
    AggregationTransformer, CleaningTransformer, CsvSink, CsvSource, FeatureEngineeringTransformer,
    FileCache, JsonSink, Pipeline, PipelineError, RunState, Source, StepRegistries,
};
use tempfile::TempDir;

const GOALS_CSV: &str = "team,goals,minutes\nAjax,2,90\nAjax,,180\nPSV,1,45\nPSV,3,90\n";

fn write_input(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("goals.csv");
    std::fs::write(&path, GOALS_CSV).unwrap();
    path
}

/// Fill missing goals, derive goals_per_90, sum goals per team.
fn goals_pipeline(input: &Path, output: &Path) -> Pipeline {
    let registries = StepRegistries::default();
    let mut pipeline = Pipeline::new("goals")
        .without_cache()
        .with_observer(Arc::new(NoopObserver));
    pipeline
        .add_source(CsvSource::new("goals", input))
        .unwrap()
        .add_transformer(CleaningTransformer::new("clean").fill("goals", json!(0)))
        .unwrap()
        .add_transformer(
            FeatureEngineeringTransformer::new(
                "features",
                vec![
                    FeatureSpec::new("goals_per_90", "rate", &["goals", "minutes"])
                        .with_params(vec![90.0]),
                ],
                registries.formulas.clone(),
            )
            .unwrap(),
        )
        .unwrap()
        .add_transformer(
            AggregationTransformer::new(
                "by_team",
                vec!["team".into()],
                vec![Aggregation::new("goals", AggFunc::Sum)],
                registries.reducers.clone(),
            )
            .unwrap(),
        )
        .unwrap()
        .add_sink(CsvSink::new("out", output))
        .unwrap();
    pipeline
}

#[tokio::test]
async fn test_clean_derive_aggregate() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let output = dir.path().join("by_team.csv");

    let report = goals_pipeline(&input, &output).run().await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.sources[0].records, 4);

    let names: Vec<_> = report.transformers.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["clean", "features", "by_team"]);
    assert_eq!(report.transformers[1].columns_after, 4);
    assert_eq!(report.transformers[2].records_after, 2);

    let out = report.output.unwrap();
    assert_eq!(out.columns(), ["team", "goals"]);
    assert_eq!(out.rows(), &[vec![json!("Ajax"), json!(2)], vec![json!("PSV"), json!(4)]]);

    let written = CsvSource::new("check", &output).extract().await.unwrap();
    assert_eq!(written, out);
}

#[tokio::test]
async fn test_cleaned_table_has_no_missing_goals() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());

    let mut pipeline = Pipeline::new("clean_only")
        .without_cache()
        .with_observer(Arc::new(NoopObserver));
    pipeline
        .add_source(CsvSource::new("goals", &input))
        .unwrap()
        .add_transformer(CleaningTransformer::new("clean").fill("goals", json!(0)))
        .unwrap();

    let report = pipeline.run().await;
    let out = report.output.unwrap();
    let goals = out.column_values("goals").unwrap();
    assert!(goals.iter().all(|v| !v.is_null()));
    assert_eq!(out.value(1, "goals"), Some(&json!(0)));
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let output = dir.path().join("by_team.csv");
    let cache = Arc::new(FileCache::new(dir.path().join("cache")));
    let observer = Arc::new(RecordingObserver::new());

    let pipeline = goals_pipeline(&input, &output)
        .with_cache(cache.clone())
        .with_observer(observer.clone());

    let first = pipeline.run().await;
    let second = pipeline.run().await;
    assert!(first.success && second.success);
    assert_eq!(first.cache_hits(), 0);
    assert_eq!(second.cache_hits(), 3);
    assert_eq!(first.output, second.output);
    assert_eq!(pipeline.run_count(), 2);
    assert_eq!(cache.stats().unwrap().entries, 3);

    let hits = observer
        .event_names()
        .iter()
        .filter(|n| n.as_str() == "cache_hit")
        .count();
    assert_eq!(hits, 3);
}

#[tokio::test]
async fn test_changed_input_misses_cache() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let output = dir.path().join("by_team.csv");
    let pipeline = goals_pipeline(&input, &output)
        .with_cache(Arc::new(FileCache::new(dir.path().join("cache"))));

    let first = pipeline.run().await;
    std::fs::write(&input, format!("{GOALS_CSV}Feyenoord,5,90\n")).unwrap();
    let second = pipeline.run().await;

    assert_eq!(second.cache_hits(), 0);
    assert_ne!(first.output, second.output);
    assert_eq!(second.output.unwrap().row_count(), 3);
}

#[tokio::test]
async fn test_missing_source_aborts_run() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.csv");
    let report = goals_pipeline(&dir.path().join("absent.csv"), &output)
        .run()
        .await;

    assert!(!report.success);
    assert_eq!(report.state, RunState::Failed);
    assert!(report.sources.is_empty());
    assert!(report.transformers.is_empty());
    assert!(report.sinks.is_empty());
    assert!(report.output.is_none());
    let error = report.error.unwrap();
    assert!(error.contains("source 'goals'"), "{error}");
    assert!(error.contains("not found"), "{error}");
    assert!(!output.exists());
}

#[tokio::test]
async fn test_failing_sink_does_not_stop_others() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let good = dir.path().join("good.json");

    let mut pipeline = Pipeline::new("sinks")
        .without_cache()
        .with_observer(Arc::new(NoopObserver));
    pipeline
        .add_source(CsvSource::new("goals", &input))
        .unwrap()
        .add_sink(CsvSink::new("bad", blocker.join("out.csv")))
        .unwrap()
        .add_sink(JsonSink::new("good", &good))
        .unwrap();

    let report = pipeline.run().await;
    assert!(!report.success);
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.sinks.len(), 2);
    assert!(!report.sinks[0].success);
    assert!(report.sinks[0].error.is_some());
    assert!(report.sinks[1].success);
    assert_eq!(report.failed_sinks().count(), 1);
    assert!(report.error.unwrap().contains("sink 'bad'"));

    let records: Value = serde_json::from_str(&std::fs::read_to_string(&good).unwrap()).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 4);
    assert_eq!(records[1]["goals"], Value::Null);
}

#[tokio::test]
async fn test_registration_closed_after_run() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let mut pipeline = Pipeline::new("closed")
        .without_cache()
        .with_observer(Arc::new(NoopObserver));
    pipeline.add_source(CsvSource::new("goals", &input)).unwrap();
    let _ = pipeline.run().await;

    let err = pipeline
        .add_transformer(CleaningTransformer::new("late"))
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfig { .. }));
    assert_eq!(pipeline.transformer_names(), Vec::<&str>::new());
}

#[tokio::test]
async fn test_report_serializes_without_output() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path());
    let output = dir.path().join("by_team.csv");
    let report = goals_pipeline(&input, &output).run().await;

    let json: Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["pipeline"], "goals");
    assert_eq!(json["state"]["stage"], "completed");
    assert_eq!(json["success"], true);
    assert_eq!(json["sources"][0]["name"], "goals");
    assert_eq!(json["transformers"].as_array().unwrap().len(), 3);
    assert_eq!(json["sinks"][0]["success"], true);
    assert!(json.get("start_time").is_some());
    assert!(json.get("end_time").is_some());
    assert!(json.get("output").is_none());
}

#[tokio::test]
async fn test_csv_roundtrip_preserves_values() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.csv");
    let output = dir.path().join("out.csv");
    std::fs::write(&input, "id,name,rating,active\n1,Ada,7.5,true\n2,,8,false\n").unwrap();

    let mut pipeline = Pipeline::new("copy")
        .without_cache()
        .with_observer(Arc::new(NoopObserver));
    pipeline
        .add_source(CsvSource::new("in", &input))
        .unwrap()
        .add_sink(CsvSink::new("out", &output))
        .unwrap();
    let report = pipeline.run().await;
    assert!(report.success, "{:?}", report.error);

    let original = CsvSource::new("a", &input).extract().await.unwrap();
    let copied = CsvSource::new("b", &output).extract().await.unwrap();
    assert_eq!(original, copied);
    assert_eq!(copied.value(1, "name"), Some(&Value::Null));
}
