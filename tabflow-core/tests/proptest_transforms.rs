//! Property-based tests for transformers and fingerprints using proptest.

use proptest::prelude::*;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tabflow_core::schema::CastType;
use tabflow_core::transform::{AggFunc, Aggregation, FeatureSpec, FormulaRegistry, ReducerRegistry};
use tabflow_core::{
    AggregationTransformer, CleaningTransformer, FeatureEngineeringTransformer, Table, Transformer,
};

fn rows_strategy() -> impl Strategy<Value = Vec<(u8, Option<i32>)>> {
    prop::collection::vec((0u8..5, prop::option::of(-1000i32..1000)), 0..40)
}

fn table_from(rows: &[(u8, Option<i32>)]) -> Table {
    Table::new(
        vec!["team".into(), "goals".into()],
        rows.iter()
            .map(|(team, goals)| {
                vec![
                    json!(format!("t{team}")),
                    goals.map(Value::from).unwrap_or(Value::Null),
                ]
            })
            .collect(),
    )
    .unwrap()
}

// --- Aggregation properties ---

proptest! {
    #[test]
    fn grouped_sum_matches_manual_sum(rows in rows_strategy()) {
        let step = AggregationTransformer::new(
            "by_team",
            vec!["team".into()],
            vec![Aggregation::new("goals", AggFunc::Sum)],
            Arc::new(ReducerRegistry::with_builtins()),
        )
        .unwrap();
        let out = step.transform(&table_from(&rows)).unwrap();

        let mut expected: BTreeMap<String, i64> = BTreeMap::new();
        for (team, goals) in &rows {
            *expected.entry(format!("t{team}")).or_default() += goals.map(i64::from).unwrap_or(0);
        }
        prop_assert_eq!(out.row_count(), expected.len());
        for row in out.rows() {
            let team = row[0].as_str().unwrap();
            prop_assert_eq!(row[1].as_i64(), Some(expected[team]));
        }
    }

    #[test]
    fn grouped_count_totals_non_missing(rows in rows_strategy()) {
        let step = AggregationTransformer::new(
            "counts",
            vec!["team".into()],
            vec![Aggregation::new("goals", AggFunc::Count)],
            Arc::new(ReducerRegistry::with_builtins()),
        )
        .unwrap();
        let out = step.transform(&table_from(&rows)).unwrap();
        let total: u64 = out.rows().iter().filter_map(|r| r[1].as_u64()).sum();
        prop_assert_eq!(total as usize, rows.iter().filter(|(_, g)| g.is_some()).count());
    }

    #[test]
    fn fill_leaves_no_missing_values(rows in rows_strategy(), fill in -5i32..5) {
        let step = CleaningTransformer::new("fill").fill("goals", json!(fill));
        let out = step.transform(&table_from(&rows)).unwrap();
        prop_assert_eq!(out.row_count(), rows.len());
        prop_assert!(out.column_values("goals").unwrap().iter().all(|v| !v.is_null()));
    }
}

// --- Repeatability: the same input always yields the same output ---

proptest! {
    #[test]
    fn cleaning_is_repeatable_and_stable(rows in rows_strategy(), fill in -5i32..5) {
        let step = CleaningTransformer::new("clean")
            .fill("goals", json!(fill))
            .coerce("goals", CastType::Float)
            .deduplicate(true);
        let input = table_from(&rows);
        let once = step.transform(&input).unwrap();
        prop_assert_eq!(&once, &step.transform(&input).unwrap());
        prop_assert_eq!(&once, &step.transform(&once).unwrap());
    }

    #[test]
    fn features_are_repeatable(rows in rows_strategy()) {
        let step = FeatureEngineeringTransformer::new(
            "features",
            vec![
                FeatureSpec::new("z", "zscore", &["goals"]),
                FeatureSpec::new("scaled", "min_max", &["goals"]),
                FeatureSpec::new("gap", "difference", &["goals", "z"]),
            ],
            Arc::new(FormulaRegistry::with_builtins()),
        )
        .unwrap();
        let input = table_from(&rows);
        let once = step.transform(&input).unwrap();
        prop_assert_eq!(once.columns(), ["team", "goals", "z", "scaled", "gap"]);
        prop_assert_eq!(&once, &step.transform(&input).unwrap());
        prop_assert_eq!(&input, &table_from(&rows));
    }

    #[test]
    fn aggregation_is_repeatable(rows in rows_strategy()) {
        let step = AggregationTransformer::new(
            "by_team",
            vec!["team".into()],
            vec![
                Aggregation::new("goals", AggFunc::Sum),
                Aggregation::new("goals", AggFunc::Mean),
            ],
            Arc::new(ReducerRegistry::with_builtins()),
        )
        .unwrap();
        let input = table_from(&rows);
        prop_assert_eq!(step.transform(&input).unwrap(), step.transform(&input).unwrap());
    }
}

// --- Fingerprint properties ---

proptest! {
    #[test]
    fn fingerprint_is_deterministic(rows in rows_strategy()) {
        prop_assert_eq!(table_from(&rows).fingerprint(), table_from(&rows).fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_any_cell(rows in rows_strategy(), bump in 1i32..100) {
        prop_assume!(!rows.is_empty());
        let mut changed = rows.clone();
        changed[0].1 = Some(changed[0].1.unwrap_or(0) + bump);
        prop_assert_ne!(table_from(&rows).fingerprint(), table_from(&changed).fingerprint());
    }

    #[test]
    fn fingerprint_is_hex_sha256(rows in rows_strategy()) {
        let fp = table_from(&rows).fingerprint();
        prop_assert_eq!(fp.len(), 64);
        prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
