//! Merging the tables of several sources into one.

use crate::error::SourceError;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How rows from several sources are merged before the first transformer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CombineStrategy {
    /// Stack rows in source registration order. All sources must share the
    /// same column set; later tables are reordered to the first's columns.
    #[default]
    Concat,
    /// Join every later table onto the first on the key columns.
    Join {
        on: Vec<String>,
        #[serde(default)]
        how: JoinKind,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

/// Combine named source tables. A single table passes through unchanged.
pub fn combine(
    strategy: &CombineStrategy,
    mut tables: Vec<(String, Table)>,
) -> Result<Table, SourceError> {
    if tables.is_empty() {
        return Err(SourceError::malformed("no source tables to combine"));
    }
    if tables.len() == 1 {
        return Ok(tables.remove(0).1);
    }
    match strategy {
        CombineStrategy::Concat => concat(tables),
        CombineStrategy::Join { on, how } => {
            let mut iter = tables.into_iter();
            let (_, mut acc) = iter
                .next()
                .ok_or_else(|| SourceError::malformed("no source tables to combine"))?;
            for (name, right) in iter {
                acc = join(acc, &right, &name, on, *how)?;
            }
            Ok(acc)
        }
    }
}

fn concat(tables: Vec<(String, Table)>) -> Result<Table, SourceError> {
    let mut iter = tables.into_iter();
    let Some((first_name, first)) = iter.next() else {
        return Err(SourceError::malformed("no source tables to combine"));
    };
    let (columns, mut rows) = first.into_parts();

    for (name, table) in iter {
        let same_set = table.column_count() == columns.len()
            && columns.iter().all(|c| table.has_column(c));
        if !same_set {
            return Err(SourceError::malformed(format!(
                "cannot concatenate '{name}' onto '{first_name}': columns [{}] differ from [{}]",
                table.columns().join(", "),
                columns.join(", ")
            )));
        }
        let order: Vec<usize> = columns
            .iter()
            .filter_map(|c| table.column_index(c))
            .collect();
        for row in table.rows() {
            rows.push(order.iter().map(|&i| row[i].clone()).collect());
        }
    }

    Ok(Table::new(columns, rows)?)
}

fn key_indices(table: &Table, on: &[String], name: &str) -> Result<Vec<usize>, SourceError> {
    on.iter()
        .map(|k| {
            table.column_index(k).ok_or_else(|| {
                SourceError::malformed(format!("join key '{k}' is missing from '{name}'"))
            })
        })
        .collect()
}

fn row_key(row: &[Value], idx: &[usize]) -> Option<String> {
    let key: Vec<&Value> = idx.iter().map(|&i| &row[i]).collect();
    if key.iter().any(|v| v.is_null()) {
        return None;
    }
    serde_json::to_string(&key).ok()
}

fn join(
    left: Table,
    right: &Table,
    right_name: &str,
    on: &[String],
    how: JoinKind,
) -> Result<Table, SourceError> {
    if on.is_empty() {
        return Err(SourceError::malformed("join needs at least one key column"));
    }
    let left_keys = key_indices(&left, on, "left side")?;
    let right_keys = key_indices(right, on, right_name)?;

    let right_extra: Vec<usize> = (0..right.column_count())
        .filter(|i| !right_keys.contains(i))
        .collect();

    let mut columns = left.columns().to_vec();
    for &i in &right_extra {
        let col = &right.columns()[i];
        if columns.contains(col) {
            columns.push(format!("{col}_{right_name}"));
        } else {
            columns.push(col.clone());
        }
    }

    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, row) in right.rows().iter().enumerate() {
        if let Some(key) = row_key(row, &right_keys) {
            index.entry(key).or_default().push(i);
        }
    }

    let mut rows = Vec::new();
    for row in left.rows() {
        let matches = row_key(row, &left_keys).and_then(|k| index.get(&k));
        match matches {
            Some(hits) => {
                for &r in hits {
                    let mut out = row.clone();
                    out.extend(right_extra.iter().map(|&i| right.rows()[r][i].clone()));
                    rows.push(out);
                }
            }
            None if how == JoinKind::Left => {
                let mut out = row.clone();
                out.extend(std::iter::repeat_n(Value::Null, right_extra.len()));
                rows.push(out);
            }
            None => {}
        }
    }

    Ok(Table::new(columns, rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn table(columns: &[&str], rows: Vec<Vec<Value>>) -> Table {
        Table::new(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    #[test]
    fn test_single_table_passes_through() {
        let t = table(&["a"], vec![vec![json!(1)]]);
        let out = combine(&CombineStrategy::Concat, vec![("s".into(), t.clone())]).unwrap();
        assert_eq!(out, t);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(combine(&CombineStrategy::Concat, vec![]).is_err());
    }

    #[test]
    fn test_concat_reorders_columns() {
        let a = table(&["team", "goals"], vec![vec![json!("Ajax"), json!(3)]]);
        let b = table(&["goals", "team"], vec![vec![json!(1), json!("PSV")]]);
        let out = combine(
            &CombineStrategy::Concat,
            vec![("a".into(), a), ("b".into(), b)],
        )
        .unwrap();
        assert_eq!(out.columns(), ["team", "goals"]);
        assert_eq!(out.rows()[1], vec![json!("PSV"), json!(1)]);
    }

    #[test]
    fn test_concat_column_mismatch() {
        let a = table(&["team"], vec![]);
        let b = table(&["club"], vec![]);
        let err = combine(
            &CombineStrategy::Concat,
            vec![("a".into(), a), ("b".into(), b)],
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::MalformedData { .. }));
    }

    #[test]
    fn test_inner_join_suffixes_collisions() {
        let players = table(
            &["team_id", "name"],
            vec![
                vec![json!(1), json!("Kai")],
                vec![json!(2), json!("Noa")],
                vec![Value::Null, json!("Free agent")],
            ],
        );
        let teams = table(
            &["team_id", "name"],
            vec![vec![json!(1), json!("Ajax")], vec![Value::Null, json!("?")]],
        );
        let strategy = CombineStrategy::Join {
            on: vec!["team_id".into()],
            how: JoinKind::Inner,
        };
        let out = combine(
            &strategy,
            vec![("players".into(), players), ("teams".into(), teams)],
        )
        .unwrap();
        assert_eq!(out.columns(), ["team_id", "name", "name_teams"]);
        assert_eq!(out.rows(), [vec![json!(1), json!("Kai"), json!("Ajax")]]);
    }

    #[test]
    fn test_left_join_keeps_unmatched_rows() {
        let players = table(
            &["team_id", "name"],
            vec![vec![json!(1), json!("Kai")], vec![json!(2), json!("Noa")]],
        );
        let teams = table(&["team_id", "city"], vec![vec![json!(1), json!("Amsterdam")]]);
        let strategy = CombineStrategy::Join {
            on: vec!["team_id".into()],
            how: JoinKind::Left,
        };
        let out = combine(
            &strategy,
            vec![("players".into(), players), ("teams".into(), teams)],
        )
        .unwrap();
        assert_eq!(out.row_count(), 2);
        assert_eq!(out.value(1, "city"), Some(&Value::Null));
    }

    #[test]
    fn test_join_missing_key() {
        let a = table(&["id"], vec![]);
        let b = table(&["other"], vec![]);
        let strategy = CombineStrategy::Join {
            on: vec!["id".into()],
            how: JoinKind::Inner,
        };
        let err = combine(&strategy, vec![("a".into(), a), ("b".into(), b)]).unwrap_err();
        assert!(matches!(err, SourceError::MalformedData { .. }));
    }

    #[test]
    fn test_strategy_deserializes() {
        let s: CombineStrategy =
            serde_json::from_value(json!({"strategy": "join", "on": ["id"]})).unwrap();
        assert_eq!(
            s,
            CombineStrategy::Join {
                on: vec!["id".into()],
                how: JoinKind::Inner
            }
        );
    }
}
