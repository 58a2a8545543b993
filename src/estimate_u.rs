//! u-probability estimation from a random sample of record pairs.
//!
//! A uniformly random pair is almost always a non-match, so the level
//! frequencies observed over a sample of pairs estimate u directly. Sizing
//! inverts the pair-count formula for the link type so the sample yields
//! roughly the requested number of comparisons.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{debug, info};

use crate::backend::{self, SqlPipeline, StagedTable, Table};
use crate::blocking::{quote_identifier, BlockingContext, BlockingRule};
use crate::comparison_vectors::{self, BLOCKED_TABLE};
use crate::error::{LinkageError, Result};
use crate::expectation_maximisation::{compute_new_parameters, compute_proportions_for_new_parameters};
use crate::linker::{self, Linker, CONCAT_WITH_TF_LEFT_TABLE, CONCAT_WITH_TF_RIGHT_TABLE, CONCAT_WITH_TF_TABLE};
use crate::model::{LinkType, Probability, Settings};

pub const U_ESTIMATE_DESCRIPTION: &str = "estimate u by random sampling";

const SAMPLE_TABLE: &str = "__linkage__df_sample";
const SAMPLE_LEFT_TABLE: &str = "__linkage__df_sample_left";
const SAMPLE_RIGHT_TABLE: &str = "__linkage__df_sample_right";
const SAMPLE_ROWS_TABLE: &str = "__linkage__sample_rows";
const SAMPLE_PAIRS_TABLE: &str = "__linkage__sample_pairs";
const ROW_NUMBER_COLUMN: &str = "__linkage__row_n";

/// Rows `n` whose self-join yields `target_rows` pairs: inverts `T = n(n-1)/2`.
pub fn num_target_rows_to_rows_to_sample(target_rows: u64) -> f64 {
    0.5 * ((8.0 * target_rows as f64 + 1.0).sqrt() + 1.0)
}

/// Draws with replacement needed for `target` distinct pairs out of a space of
/// size `space`, from `E[unique] = N(1 - (1 - 1/N)^k)`.
pub fn num_target_rows_to_pairs_to_sample(space: u64, target: u64) -> u64 {
    if target == 0 || space == 0 {
        return 0;
    }
    if target >= space {
        return space;
    }
    let n = space as f64;
    let k = (-(target as f64) / n).ln_1p() / (-1.0 / n).ln_1p();
    k.ceil().max(target as f64) as u64
}

/// `draws` uniform `(row_l, row_r)` pairs with exact repeats removed. Each
/// surviving pair gets its position as `sample_id`.
pub fn sample_row_pairs(rng: &mut StdRng, n_left: u64, n_right: u64, draws: u64) -> Vec<(u64, u64, u64)> {
    let mut seen = HashSet::with_capacity(draws as usize);
    let mut pairs = Vec::with_capacity(draws as usize);
    for _ in 0..draws {
        let pair = (rng.gen_range(0..n_left), rng.gen_range(0..n_right));
        if seen.insert(pair) {
            pairs.push((pair.0, pair.1, pairs.len() as u64));
        }
    }
    pairs
}

fn rng_for(settings: &Settings) -> StdRng {
    match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Estimate u for every comparison level and record it on the canonical model.
pub async fn estimate_u_values(linker: &mut Linker, target_rows: u64) -> Result<()> {
    info!("----- Estimating u probabilities using random sampling -----");
    if target_rows == 0 {
        return Err(LinkageError::config("target_rows for u estimation must be positive"));
    }

    let mut settings = linker.settings().clone();
    settings.disable_term_frequency_adjustments();
    let mut rng = rng_for(&settings);

    let vectors = if linker.two_dataset_link_only() {
        sample_link_only(linker, &settings, target_rows, &mut rng).await?
    } else {
        sample_rows(linker, &settings, target_rows, &mut rng).await?
    };

    let result = linker
        .load_comparison_vector_table(&vectors, &settings.comparisons, "u estimation vector counts")
        .await;
    let table = backend::release(result, vec![vectors]).await?;

    // Every sampled pair is treated as a non-match.
    let posteriors = vec![0.0; table.rows.len()];
    let counts = compute_new_parameters(&table, &posteriors);
    let (_, proportions) = compute_proportions_for_new_parameters(&counts);

    let canonical = linker.settings_mut();
    for (name, levels) in table.comparison_names.iter().zip(&proportions) {
        let Some(comparison) = canonical.comparison_by_output_column_name_mut(name) else {
            continue;
        };
        for level in comparison.levels_excluding_null_mut() {
            let u = levels
                .get(&level.comparison_vector_value)
                .map_or(Probability::NotObserved, |p| p.u);
            if u.is_not_observed() {
                info!(
                    "u probability not trained for {name} - {} (comparison vector value: {}). \
                     This usually means the comparison level was never observed in the training data.",
                    level.label_for_charts, level.comparison_vector_value
                );
            }
            level.add_trained_u_probability(u, U_ESTIMATE_DESCRIPTION);
        }
    }
    canonical.populate_m_u_from_trained_values();
    info!(pairs = table.total_count(), "Estimated u probabilities using random sampling");
    Ok(())
}

/// Dedupe and multi-dataset modes: sample rows, then compare every pair of
/// sampled rows the link type allows.
async fn sample_rows(linker: &Linker, settings: &Settings, target_rows: u64, rng: &mut StdRng) -> Result<StagedTable> {
    let total = count_rows(linker, None).await?;
    let wanted = num_target_rows_to_rows_to_sample(target_rows).ceil() as u64;
    let proportion = if total == 0 { 1.0 } else { wanted as f64 / total as f64 };
    debug!(total, wanted, proportion, "u estimation row sample");

    let mut pipeline = SqlPipeline::new();
    linker.enqueue_df_concat_with_tf(&mut pipeline, settings);

    let mut staged = Vec::new();
    let source = if proportion >= 1.0 {
        CONCAT_WITH_TF_TABLE
    } else {
        let picked = rand::seq::index::sample(rng, total as usize, wanted as usize);
        let mut rows = Table::new(vec![ROW_NUMBER_COLUMN.to_string()]);
        for i in picked.iter() {
            rows.push_row(vec![json!(i)]);
        }
        staged.push(backend::register_table(linker.api(), SAMPLE_ROWS_TABLE, &rows).await?);
        enqueue_numbered_subset(
            &mut pipeline,
            CONCAT_WITH_TF_TABLE,
            &[&settings.source_dataset_column_name, &settings.unique_id_column_name],
            &format!("select {ROW_NUMBER_COLUMN} as row_n from {SAMPLE_ROWS_TABLE}"),
            SAMPLE_TABLE,
        );
        SAMPLE_TABLE
    };

    let context = BlockingContext {
        link_type: settings.link_type,
        two_dataset_link_only: false,
        unique_id_column_name: &settings.unique_id_column_name,
        source_dataset_column_name: &settings.source_dataset_column_name,
        input_tablename_l: source,
        input_tablename_r: source,
    };
    let result = compute_vectors(linker, settings, pipeline, &context, &[], &staged).await;
    backend::release(result, staged).await
}

/// Two-dataset link only: draw row-index pairs and block on their `sample_id`.
async fn sample_link_only(
    linker: &Linker,
    settings: &Settings,
    target_rows: u64,
    rng: &mut StdRng,
) -> Result<StagedTable> {
    let names = linker.input_templated_names();
    let (Some(&left), Some(&right)) = (names.first(), names.get(1)) else {
        return Err(LinkageError::config("link only u estimation needs two input tables"));
    };
    let n_left = count_rows(linker, Some(left)).await?;
    let n_right = count_rows(linker, Some(right)).await?;
    let space = n_left.saturating_mul(n_right);

    let mut pipeline = SqlPipeline::new();
    linker.enqueue_df_concat_with_tf(&mut pipeline, settings);

    let mut context = BlockingContext {
        link_type: LinkType::LinkOnly,
        two_dataset_link_only: true,
        unique_id_column_name: &settings.unique_id_column_name,
        source_dataset_column_name: &settings.source_dataset_column_name,
        input_tablename_l: CONCAT_WITH_TF_LEFT_TABLE,
        input_tablename_r: CONCAT_WITH_TF_RIGHT_TABLE,
    };

    if target_rows >= space {
        debug!(space, "u estimation target covers every pair; using the full cross");
        return compute_vectors(linker, settings, pipeline, &context, &[], &[]).await;
    }

    let draws = num_target_rows_to_pairs_to_sample(space, target_rows);
    let pairs = sample_row_pairs(rng, n_left, n_right, draws);
    debug!(space, draws, unique_pairs = pairs.len(), "u estimation pair sample");

    let mut table = Table::new(vec!["row_l".into(), "row_r".into(), "sample_id".into()]);
    for (row_l, row_r, sample_id) in pairs {
        table.push_row(vec![json!(row_l), json!(row_r), json!(sample_id)]);
    }
    let staged = vec![backend::register_table(linker.api(), SAMPLE_PAIRS_TABLE, &table).await?];

    let uid = settings.unique_id_column_name.as_str();
    enqueue_numbered_subset(
        &mut pipeline,
        CONCAT_WITH_TF_LEFT_TABLE,
        &[uid],
        &format!("select row_l as row_n, sample_id from {SAMPLE_PAIRS_TABLE}"),
        SAMPLE_LEFT_TABLE,
    );
    enqueue_numbered_subset(
        &mut pipeline,
        CONCAT_WITH_TF_RIGHT_TABLE,
        &[uid],
        &format!("select row_r as row_n, sample_id from {SAMPLE_PAIRS_TABLE}"),
        SAMPLE_RIGHT_TABLE,
    );
    context.input_tablename_l = SAMPLE_LEFT_TABLE;
    context.input_tablename_r = SAMPLE_RIGHT_TABLE;

    let rule = BlockingRule::new("l.sample_id = r.sample_id");
    let result = compute_vectors(linker, settings, pipeline, &context, &[rule], &staged).await;
    backend::release(result, staged).await
}

/// Number `source` rows from 0 in `order_by` order and keep those selected by
/// `selection`, which yields a `row_n` column and optionally more.
fn enqueue_numbered_subset(
    pipeline: &mut SqlPipeline,
    source: &str,
    order_by: &[&str],
    selection: &str,
    output: &str,
) {
    let order: Vec<String> = order_by.iter().map(|c| quote_identifier(c)).collect();
    let numbered = format!("{output}_numbered");
    pipeline.enqueue_sql(
        format!(
            "select *, row_number() over (order by {}) - 1 as {ROW_NUMBER_COLUMN} from {source}",
            order.join(", ")
        ),
        numbered.clone(),
    );
    pipeline.enqueue_sql(
        format!(
            "select n.*, s.* from {numbered} as n inner join ({selection}) as s on n.{ROW_NUMBER_COLUMN} = s.row_n"
        ),
        output,
    );
}

async fn compute_vectors(
    linker: &Linker,
    settings: &Settings,
    mut pipeline: SqlPipeline,
    context: &BlockingContext<'_>,
    rules: &[BlockingRule],
    staged: &[StagedTable],
) -> Result<StagedTable> {
    let columns = comparison_vectors::input_columns_required(&settings.comparisons);
    let select = context.columns_to_select(&columns);
    pipeline.enqueue_sql(context.block_using_rules_sql(rules, &select), BLOCKED_TABLE);
    let inputs: Vec<&StagedTable> = staged.iter().collect();
    linker
        .comparison_vectors_after_blocking(
            pipeline,
            &settings.comparisons,
            &settings.unique_id_column_name,
            &inputs,
            "u estimation comparison vectors",
        )
        .await
}

/// Rows across all inputs, or in one input table.
async fn count_rows(linker: &Linker, input: Option<&str>) -> Result<u64> {
    let mut pipeline = SqlPipeline::new();
    let from = match input {
        Some(name) => name.to_string(),
        None => {
            linker.enqueue_df_concat(&mut pipeline);
            linker::CONCAT_TABLE.to_string()
        }
    };
    pipeline.enqueue_sql(format!("select count(*) as count from {from}"), "__linkage__row_count");
    let staged = linker.execute(&pipeline, &[], "u estimation row count").await?;
    linker::single_count(linker, staged, "count", "u estimation row count").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_to_sample_inverts_pair_count() {
        for target in [1u64, 10, 1_000, 123_456, 1_000_000] {
            let n = num_target_rows_to_rows_to_sample(target);
            let pairs = n * (n - 1.0) / 2.0;
            assert!((pairs - target as f64).abs() < 1e-6 * target as f64 + 1e-9);
        }
        assert_eq!(num_target_rows_to_rows_to_sample(45), 10.0);

        let huge = num_target_rows_to_rows_to_sample(u64::MAX);
        assert!(huge.is_finite() && huge > 6.0e9);
    }

    #[test]
    fn pairs_to_sample_grows_with_saturation() {
        assert_eq!(num_target_rows_to_pairs_to_sample(1_000, 0), 0);
        assert_eq!(num_target_rows_to_pairs_to_sample(1_000, 1_000), 1_000);

        // Small targets in a large space need barely more draws than targets.
        let k = num_target_rows_to_pairs_to_sample(1_000_000_000, 1_000);
        assert!((1_000..=1_001).contains(&k));

        // Half the space: k = ln(0.5) / ln(1 - 1/N), about N ln 2.
        let k = num_target_rows_to_pairs_to_sample(10_000, 5_000);
        let expected = (0.5f64).ln() / (1.0 - 1.0 / 10_000.0f64).ln();
        assert_eq!(k, expected.ceil() as u64);
        assert!(k > 6_900 && k < 6_940);
    }

    #[test]
    fn sampled_pairs_are_unique_with_dense_ids() {
        let mut rng = StdRng::seed_from_u64(7);
        let pairs = sample_row_pairs(&mut rng, 10, 10, 200);
        let unique: HashSet<(u64, u64)> = pairs.iter().map(|&(l, r, _)| (l, r)).collect();
        assert_eq!(unique.len(), pairs.len());
        assert!(pairs.len() <= 100);
        for (i, &(l, r, id)) in pairs.iter().enumerate() {
            assert_eq!(id, i as u64);
            assert!(l < 10 && r < 10);
        }
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let a = sample_row_pairs(&mut StdRng::seed_from_u64(42), 50, 60, 100);
        let b = sample_row_pairs(&mut StdRng::seed_from_u64(42), 50, 60, 100);
        assert_eq!(a, b);
    }
}
