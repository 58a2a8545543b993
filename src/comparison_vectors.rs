//! Comparison vector SQL and the aggregated vector table EM consumes.

use std::collections::BTreeSet;

use crate::backend::{SqlPipeline, Table};
use crate::blocking::quote_identifier;
use crate::error::{LinkageError, Result};
use crate::model::Comparison;

pub const BLOCKED_TABLE: &str = "__linkage__df_blocked";
pub const COMPARISON_VECTORS_TABLE: &str = "__linkage__df_comparison_vectors";
pub const AGGREGATED_VECTORS_TABLE: &str = "__linkage__df_comparison_vector_counts";

/// `CASE` expression assigning each pair its level for one comparison.
///
/// The null level is tested first; an else level becomes the `ELSE` branch.
pub fn case_statement(comparison: &Comparison) -> String {
    let mut sql = String::from("CASE");
    let ordered = comparison
        .comparison_levels
        .iter()
        .filter(|l| l.is_null_level)
        .chain(comparison.levels_excluding_null());
    let mut else_value = None;
    for level in ordered {
        if level.is_else_level() {
            else_value = Some(level.comparison_vector_value);
            continue;
        }
        sql.push_str(&format!(
            " WHEN {} THEN {}",
            level.sql_condition, level.comparison_vector_value
        ));
    }
    if let Some(value) = else_value {
        sql.push_str(&format!(" ELSE {value}"));
    }
    sql.push_str(&format!(" END AS {}", quote_identifier(&comparison.gamma_column_name())));
    sql
}

/// Input columns every comparison needs from the blocked pairs, including `tf_` columns.
pub fn input_columns_required(comparisons: &[Comparison]) -> BTreeSet<String> {
    let mut cols: BTreeSet<String> = comparisons.iter().flat_map(|c| c.input_columns_used()).collect();
    for comparison in comparisons {
        cols.extend(comparison.tf_adjustment_columns().into_iter().map(|c| format!("tf_{c}")));
    }
    cols
}

pub fn comparison_vectors_sql(comparisons: &[Comparison], unique_id_column_name: &str) -> String {
    let mut select = vec![
        quote_identifier(&format!("{unique_id_column_name}_l")),
        quote_identifier(&format!("{unique_id_column_name}_r")),
    ];
    select.extend(comparisons.iter().map(case_statement));
    format!("select {}\nfrom {BLOCKED_TABLE}", select.join(",\n    "))
}

/// Count rows per distinct comparison vector.
pub fn aggregate_comparison_vectors_sql(comparisons: &[Comparison]) -> String {
    let gammas: Vec<String> = comparisons
        .iter()
        .map(|c| quote_identifier(&c.gamma_column_name()))
        .collect();
    if gammas.is_empty() {
        return format!("select count(*) as count from {COMPARISON_VECTORS_TABLE}");
    }
    let cols = gammas.join(", ");
    format!("select {cols}, count(*) as count from {COMPARISON_VECTORS_TABLE} group by {cols}")
}

/// Enqueue the comparison vector stage after a blocking stage named [`BLOCKED_TABLE`].
pub fn enqueue_comparison_vectors(
    pipeline: &mut SqlPipeline,
    comparisons: &[Comparison],
    unique_id_column_name: &str,
) {
    pipeline.enqueue_sql(
        comparison_vectors_sql(comparisons, unique_id_column_name),
        COMPARISON_VECTORS_TABLE,
    );
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonVectorRow {
    /// One level per comparison, in `comparison_names` order. -1 is the null level.
    pub gammas: Vec<i32>,
    pub count: f64,
}

/// Distinct comparison vectors with their pair counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComparisonVectorTable {
    pub comparison_names: Vec<String>,
    pub rows: Vec<ComparisonVectorRow>,
}

impl ComparisonVectorTable {
    /// Read an aggregated result with one `gamma_<name>` column per comparison plus `count`.
    pub fn from_table(table: &Table, comparisons: &[Comparison]) -> Result<Self> {
        let count_idx = table
            .column_index("count")
            .ok_or_else(|| LinkageError::config("comparison vector counts are missing a `count` column"))?;
        let gamma_idx = comparisons
            .iter()
            .map(|c| {
                let name = c.gamma_column_name();
                table
                    .column_index(&name)
                    .ok_or_else(|| LinkageError::config(format!("comparison vector column `{name}` is missing")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut rows = Vec::with_capacity(table.len());
        for row in &table.rows {
            let count = row[count_idx].as_f64().unwrap_or(0.0);
            if count <= 0.0 {
                continue;
            }
            // A pair no level matched (no else level) counts as null.
            let gammas = gamma_idx
                .iter()
                .map(|&i| row[i].as_i64().map_or(-1, |g| g as i32))
                .collect();
            rows.push(ComparisonVectorRow { gammas, count });
        }
        Ok(Self {
            comparison_names: comparisons.iter().map(|c| c.output_column_name.clone()).collect(),
            rows,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_count(&self) -> f64 {
        self.rows.iter().map(|r| r.count).sum()
    }

    pub fn position(&self, output_column_name: &str) -> Option<usize> {
        self.comparison_names.iter().position(|n| n == output_column_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ComparisonLevel;
    use serde_json::json;

    #[test]
    fn case_statement_tests_null_first_and_ends_with_else() {
        let cc = Comparison::new(
            "surname",
            vec![
                ComparisonLevel::exact_match("surname"),
                ComparisonLevel::null_level("surname"),
                ComparisonLevel::levenshtein("surname", 2),
                ComparisonLevel::else_level(),
            ],
        );
        let sql = case_statement(&cc);
        assert!(sql.starts_with("CASE WHEN surname_l IS NULL OR surname_r IS NULL THEN -1"));
        assert!(sql.contains("WHEN surname_l = surname_r THEN 2"));
        assert!(sql.contains("WHEN levenshtein(surname_l, surname_r) <= 2 THEN 1"));
        assert!(sql.ends_with("ELSE 0 END AS \"gamma_surname\""));
    }

    #[test]
    fn required_columns_include_tf_columns() {
        let cc = Comparison::new(
            "city",
            vec![
                ComparisonLevel::exact_match("city").with_tf_adjustment("city"),
                ComparisonLevel::else_level(),
            ],
        );
        let cols: Vec<String> = input_columns_required(&[cc]).into_iter().collect();
        assert_eq!(cols, vec!["city", "tf_city"]);
    }

    #[test]
    fn vector_table_skips_empty_groups_and_maps_nulls() {
        let comparisons = vec![Comparison::exact_match("city"), Comparison::exact_match("dob")];
        let table = Table {
            columns: vec!["gamma_city".into(), "gamma_dob".into(), "count".into()],
            rows: vec![
                vec![json!(1), json!(0), json!(7)],
                vec![json!(-1), serde_json::Value::Null, json!(2)],
                vec![json!(0), json!(0), json!(0)],
            ],
        };
        let vectors = ComparisonVectorTable::from_table(&table, &comparisons).unwrap();
        assert_eq!(vectors.rows.len(), 2);
        assert_eq!(vectors.rows[1].gammas, vec![-1, -1]);
        assert_eq!(vectors.total_count(), 9.0);
        assert_eq!(vectors.position("dob"), Some(1));
    }

    #[test]
    fn aggregate_without_comparisons_counts_all_pairs() {
        assert_eq!(
            aggregate_comparison_vectors_sql(&[]),
            format!("select count(*) as count from {COMPARISON_VECTORS_TABLE}")
        );
    }
}
