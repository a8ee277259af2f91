//! Ready-made pipelines for common soccer statistics files.
//!
//! Each preset reads one CSV file, cleans it, derives a few columns from the
//! built-in formulas and writes one CSV file. They only compose the generic
//! steps of `tabflow-core`.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tabflow_core::transform::{FeatureSpec, FormulaRegistry};
use tabflow_core::{
    CleaningTransformer, CsvSink, CsvSource, FeatureEngineeringTransformer, Pipeline,
    PipelineError,
};

fn features(
    name: &str,
    specs: Vec<FeatureSpec>,
) -> Result<FeatureEngineeringTransformer, PipelineError> {
    FeatureEngineeringTransformer::new(name, specs, Arc::new(FormulaRegistry::with_builtins()))
        .map_err(|source| PipelineError::Transform {
            name: name.to_string(),
            source,
        })
}

/// Player file with `player_id`, `goals`, `assists` and `minutes_played`.
///
/// Fills missing goals and assists with 0, drops rows without a player id
/// and adds `goals_per_90`, `assists_per_90` and `goal_contributions`.
pub fn player_stats_pipeline(input: &Path, output: &Path) -> Result<Pipeline, PipelineError> {
    let mut pipeline = Pipeline::new("player_stats");
    pipeline
        .add_source(CsvSource::new("players", input))?
        .add_transformer(
            CleaningTransformer::new("clean_players")
                .fill("goals", json!(0))
                .fill("assists", json!(0))
                .require("player_id"),
        )?
        .add_transformer(features(
            "player_features",
            vec![
                FeatureSpec::new("goals_per_90", "rate", &["goals", "minutes_played"])
                    .with_params(vec![90.0]),
                FeatureSpec::new("assists_per_90", "rate", &["assists", "minutes_played"])
                    .with_params(vec![90.0]),
                FeatureSpec::new("goal_contributions", "sum", &["goals", "assists"]),
            ],
        )?)?
        .add_sink(CsvSink::new("player_stats_csv", output))?;
    Ok(pipeline)
}

/// Team file with `team_id`, `wins`, `draws` and `losses`.
///
/// Adds `points` (3 per win, 1 per draw), `matches_played` and
/// `points_per_match`.
pub fn team_stats_pipeline(input: &Path, output: &Path) -> Result<Pipeline, PipelineError> {
    let mut pipeline = Pipeline::new("team_stats");
    pipeline
        .add_source(CsvSource::new("teams", input))?
        .add_transformer(
            CleaningTransformer::new("clean_teams")
                .fill("wins", json!(0))
                .fill("draws", json!(0))
                .fill("losses", json!(0))
                .require("team_id"),
        )?
        .add_transformer(features(
            "team_features",
            vec![
                FeatureSpec::new("points", "weighted_sum", &["wins", "draws"])
                    .with_params(vec![3.0, 1.0]),
                FeatureSpec::new("matches_played", "sum", &["wins", "draws", "losses"]),
                FeatureSpec::new("points_per_match", "ratio", &["points", "matches_played"]),
            ],
        )?)?
        .add_sink(CsvSink::new("team_stats_csv", output))?;
    Ok(pipeline)
}

/// Match file with `home_score` and `away_score`.
///
/// Drops matches missing either score and adds `goal_difference` and
/// `total_goals`.
pub fn match_stats_pipeline(input: &Path, output: &Path) -> Result<Pipeline, PipelineError> {
    let mut pipeline = Pipeline::new("match_stats");
    pipeline
        .add_source(CsvSource::new("matches", input))?
        .add_transformer(
            CleaningTransformer::new("clean_matches")
                .require("home_score")
                .require("away_score"),
        )?
        .add_transformer(features(
            "match_features",
            vec![
                FeatureSpec::new("goal_difference", "difference", &["home_score", "away_score"]),
                FeatureSpec::new("total_goals", "sum", &["home_score", "away_score"]),
            ],
        )?)?
        .add_sink(CsvSink::new("match_stats_csv", output))?;
    Ok(pipeline)
}
