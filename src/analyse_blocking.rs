//! Blocking rule cost analysis.
//!
//! Counts how many candidate pairs blocking rules would generate, without
//! computing any comparison vectors.

use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{Record, SqlPipeline, Table};
use crate::blocking::{quote_identifier, BlockingContext, BlockingRule};
use crate::error::{LinkageError, Result};
use crate::linker::{single_count, Linker, CONCAT_TABLE};
use crate::model::LinkType;

const COUNT_COLUMN: &str = "count_of_pairwise_comparisons_generated";

/// One rule's row in the cumulative analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CumulativeComparisonsRecord {
    /// Pairs assigned to this rule (and to no earlier rule).
    pub row_count: u64,
    pub rule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cartesian: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduction_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduction_ratio_text: Option<String>,
    /// Cumulative rows before this rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
}

/// Output of [`cumulative_comparisons_generated_by_blocking_rules`], as records or a table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CumulativeComparisons {
    Records(Vec<CumulativeComparisonsRecord>),
    Table(Table),
}

impl CumulativeComparisons {
    pub fn len(&self) -> usize {
        match self {
            Self::Records(records) => records.len(),
            Self::Table(table) => table.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Option<&[CumulativeComparisonsRecord]> {
        match self {
            Self::Records(records) => Some(records),
            Self::Table(_) => None,
        }
    }
}

/// Total pairs before blocking, from per-dataset row counts.
///
/// Dedupe and link-and-dedupe count unordered pairs over all rows; link-only
/// counts only pairs drawn from two different datasets.
pub fn calculate_cartesian(row_counts: &[u64], link_type: LinkType) -> u64 {
    let total: u64 = row_counts.iter().sum();
    match link_type {
        LinkType::DedupeOnly | LinkType::LinkAndDedupe => total * total.saturating_sub(1) / 2,
        LinkType::LinkOnly => {
            let mut cartesian = 0;
            for (i, n_i) in row_counts.iter().enumerate() {
                for n_j in &row_counts[i + 1..] {
                    cartesian += n_i * n_j;
                }
            }
            cartesian
        }
    }
}

/// `1 - rows / cartesian`; zero when there are no possible pairs.
pub fn calculate_reduction_ratio(rows: u64, cartesian: u64) -> f64 {
    if cartesian == 0 {
        return 0.0;
    }
    1.0 - rows as f64 / cartesian as f64
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

pub async fn cumulative_comparisons_generated_by_blocking_rules(
    linker: &Linker,
    blocking_rules: &[BlockingRule],
    output_chart: bool,
    return_dataframe: bool,
) -> Result<CumulativeComparisons> {
    // Private copy: rule resolution must not touch the canonical model, and
    // term frequencies play no part in counting.
    let mut settings = linker.settings().clone();
    settings.disable_term_frequency_adjustments();
    let rules: Vec<BlockingRule> = if blocking_rules.is_empty() {
        settings.blocking_rules_to_generate_predictions.clone()
    } else {
        blocking_rules.to_vec()
    };

    let cartesian = if output_chart {
        let mut pipeline = SqlPipeline::new();
        linker.enqueue_df_concat(&mut pipeline);
        let group_by = match settings.link_type {
            LinkType::DedupeOnly => String::new(),
            _ => format!("group by {}", quote_identifier(&settings.source_dataset_column_name)),
        };
        pipeline.enqueue_sql(
            format!("select count(*) as count from {CONCAT_TABLE} {group_by}"),
            "__linkage__cartesian_product",
        );
        let staged = linker.execute(&pipeline, &[], "cartesian product").await?;
        let counts = linker.with_timeout("cartesian product", staged.into_table()).await?;
        let row_counts: Vec<u64> = counts
            .column("count")
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_u64())
            .collect();
        Some(calculate_cartesian(&row_counts, settings.link_type))
    } else {
        None
    };

    let mut pipeline = SqlPipeline::new();
    linker.enqueue_df_concat(&mut pipeline);
    let context = BlockingContext {
        link_type: settings.link_type,
        two_dataset_link_only: false,
        unique_id_column_name: &settings.unique_id_column_name,
        source_dataset_column_name: &settings.source_dataset_column_name,
        input_tablename_l: CONCAT_TABLE,
        input_tablename_r: CONCAT_TABLE,
    };
    pipeline.enqueue_sql(context.block_using_rules_sql(&rules, &[]), "__linkage__df_blocked");
    pipeline.enqueue_sql(
        "select count(*) as row_count, match_key from __linkage__df_blocked \
         group by match_key order by cast(match_key as int) asc",
        "__linkage__df_count_cumulative_blocks",
    );
    let staged = linker.execute(&pipeline, &[], "cumulative blocking counts").await?;
    let counts = linker.with_timeout("cumulative blocking counts", staged.into_records()).await?;

    let row_counts = backfill_row_counts(&counts, rules.len());
    debug!(?row_counts, "blocking rule row counts");

    let mut output = Vec::with_capacity(rules.len());
    let mut cumulative = 0u64;
    for (row_count, rule) in row_counts.into_iter().zip(&rules) {
        let mut record = CumulativeComparisonsRecord {
            row_count,
            rule: rule.blocking_rule_sql().to_string(),
            cumulative_rows: None,
            cartesian: None,
            reduction_ratio: None,
            reduction_ratio_text: None,
            start: None,
        };
        if let Some(cartesian) = cartesian {
            cumulative += row_count;
            let rr = round6(calculate_reduction_ratio(cumulative, cartesian));
            record.cumulative_rows = Some(cumulative);
            record.cartesian = Some(cartesian);
            record.reduction_ratio = Some(rr);
            record.reduction_ratio_text = Some(format!(
                "The rolling reduction ratio with your given blocking rule(s) is {rr}. \
                 This represents the reduction in the total number of comparisons due to your rule(s)."
            ));
            record.start = Some(cumulative - row_count);
        }
        output.push(record);
    }
    info!(rules = output.len(), "computed cumulative comparisons");

    if return_dataframe {
        let records: Vec<Record> = output
            .iter()
            .map(|r| match serde_json::to_value(r) {
                Ok(serde_json::Value::Object(map)) => Ok(map),
                Ok(_) => Ok(Record::new()),
                Err(e) => Err(LinkageError::from(e)),
            })
            .collect::<Result<_>>()?;
        Ok(CumulativeComparisons::Table(Table::from_records(&records)))
    } else {
        Ok(CumulativeComparisons::Records(output))
    }
}

/// Per-rule counts in rule order. Rules that generated nothing have no
/// `match_key` row and are filled with 0 at their index.
fn backfill_row_counts(counts: &[Record], num_rules: usize) -> Vec<u64> {
    let mut row_counts = vec![0u64; num_rules];
    for record in counts {
        let key = record.get("match_key").and_then(|k| match k {
            serde_json::Value::String(s) => s.parse::<usize>().ok(),
            other => other.as_u64().map(|v| v as usize),
        });
        let count = record.get("row_count").and_then(|c| c.as_u64()).unwrap_or(0);
        if let Some(slot) = key.and_then(|k| row_counts.get_mut(k)) {
            *slot = count;
        }
    }
    row_counts
}

/// Pre-filter SQL stages: group each side by its equi-join keys and sum
/// `count_l * count_r` over matching key combinations.
pub fn count_comparisons_from_blocking_rule_pre_filter_conditions_sqls(
    rule: &BlockingRule,
    input_tablename_l: &str,
    input_tablename_r: &str,
    two_dataset_link_only: bool,
) -> Vec<(String, String)> {
    let keys = rule.equi_join_conditions();
    if keys.is_empty() {
        let sql = if two_dataset_link_only {
            format!(
                "select (select count(*) from {input_tablename_l}) * (select count(*) from {input_tablename_r}) \
                 as {COUNT_COLUMN}"
            )
        } else {
            format!("select count(*) * count(*) as {COUNT_COLUMN} from {input_tablename_l}")
        };
        return vec![(sql, "__linkage__total_of_block_counts".to_string())];
    }

    let (l_select, l_group) = key_side(keys.iter().map(|k| k.0.as_str()));
    let (r_select, r_group) = key_side(keys.iter().map(|k| k.1.as_str()));
    let using = (0..keys.len()).map(|i| format!("key_{i}")).collect::<Vec<_>>().join(", ");

    vec![
        (
            format!("select {l_select}, count(*) as count_l from {input_tablename_l} group by {l_group}"),
            "__linkage__count_comparisons_from_blocking_l".to_string(),
        ),
        (
            format!("select {r_select}, count(*) as count_r from {input_tablename_r} group by {r_group}"),
            "__linkage__count_comparisons_from_blocking_r".to_string(),
        ),
        (
            format!(
                "select count_l, count_r, count_l * count_r as block_count \
                 from __linkage__count_comparisons_from_blocking_l \
                 inner join __linkage__count_comparisons_from_blocking_r using ({using})"
            ),
            "__linkage__block_counts".to_string(),
        ),
        (
            format!("select coalesce(sum(block_count), 0) as {COUNT_COLUMN} from __linkage__block_counts"),
            "__linkage__total_of_block_counts".to_string(),
        ),
    ]
}

/// `(select list, group by list)` for one side's key expressions.
fn key_side<'a>(keys: impl Iterator<Item = &'a str>) -> (String, String) {
    let keys: Vec<&str> = keys.collect();
    let select = keys
        .iter()
        .enumerate()
        .map(|(i, k)| format!("{k} as key_{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    (select, keys.join(", "))
}

pub async fn count_comparisons_from_blocking_rule_pre_filter_conditions(
    linker: &Linker,
    rule: &BlockingRule,
) -> Result<u64> {
    let mut pipeline = SqlPipeline::new();
    linker.enqueue_df_concat(&mut pipeline);
    let two = linker.two_dataset_link_only();
    let (l, r) = if two {
        let names = linker.input_templated_names();
        (names[0].to_string(), names[1].to_string())
    } else {
        (CONCAT_TABLE.to_string(), CONCAT_TABLE.to_string())
    };
    for (sql, name) in count_comparisons_from_blocking_rule_pre_filter_conditions_sqls(rule, &l, &r, two) {
        pipeline.enqueue_sql(sql, name);
    }
    let staged = linker.execute(&pipeline, &[], "pre-filter count").await?;
    let count = single_count(linker, staged, COUNT_COLUMN, "pre-filter count").await?;
    info!(rule = %rule, count, "pre-filter comparison count");
    Ok(count)
}

/// Runs the literal join, so non-equality filters and the link-type
/// condition are applied.
pub async fn count_comparisons_from_blocking_rule_post_filters(linker: &Linker, rule: &BlockingRule) -> Result<u64> {
    let settings = linker.settings();
    let mut pipeline = SqlPipeline::new();
    linker.enqueue_df_concat(&mut pipeline);
    let context = BlockingContext {
        link_type: settings.link_type,
        two_dataset_link_only: false,
        unique_id_column_name: &settings.unique_id_column_name,
        source_dataset_column_name: &settings.source_dataset_column_name,
        input_tablename_l: CONCAT_TABLE,
        input_tablename_r: CONCAT_TABLE,
    };
    pipeline.enqueue_sql(
        format!(
            "select count(*) as {COUNT_COLUMN} from {CONCAT_TABLE} as l inner join {CONCAT_TABLE} as r \
             on ({}) {}",
            rule.blocking_rule_sql(),
            context.where_condition()
        ),
        "__linkage__post_filter_count",
    );
    let staged = linker.execute(&pipeline, &[], "post-filter count").await?;
    single_count(linker, staged, COUNT_COLUMN, "post-filter count").await
}
