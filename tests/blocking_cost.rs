mod common;

use linkage_harness::{BlockingRule, CumulativeComparisons};

use common::{brute_force_pairs, same, value_counts};

#[tokio::test]
async fn pre_filter_count_sums_squared_block_sizes() {
    let (linker, records) = common::dedupe_linker().await;

    let expected: u64 = value_counts(&records, "first_name").values().map(|n| n * n).sum();
    let count = linker
        .count_num_comparisons_from_blocking_rule("l.first_name = r.first_name")
        .await
        .unwrap();
    assert_eq!(count, expected);

    // Null cities never join.
    let expected: u64 = value_counts(&records, "city").values().map(|n| n * n).sum();
    let count = linker.count_num_comparisons_from_blocking_rule("l.city = r.city").await.unwrap();
    assert_eq!(count, expected);
}

#[tokio::test]
async fn pre_filter_count_ignores_non_equality_filters() {
    let (linker, records) = common::dedupe_linker().await;
    let n = records.len() as u64;

    let with_filter = linker
        .count_num_comparisons_from_blocking_rule("l.first_name = r.first_name and l.surname != r.surname")
        .await
        .unwrap();
    let without = linker
        .count_num_comparisons_from_blocking_rule("l.first_name = r.first_name")
        .await
        .unwrap();
    assert_eq!(with_filter, without);

    let fuzzy = linker
        .count_num_comparisons_from_blocking_rule("levenshtein(l.first_name, r.first_name) <= 1")
        .await
        .unwrap();
    assert_eq!(fuzzy, n * n);
}

#[tokio::test]
async fn post_filter_count_applies_the_whole_rule() {
    let (linker, records) = common::dedupe_linker().await;

    let count = linker
        .count_comparisons_from_blocking_rule_post_filters("l.first_name = r.first_name")
        .await
        .unwrap();
    assert_eq!(count, brute_force_pairs(&records, |l, r| same(l, r, "first_name")));

    let count = linker
        .count_comparisons_from_blocking_rule_post_filters("l.first_name = r.first_name and l.surname != r.surname")
        .await
        .unwrap();
    let expected = brute_force_pairs(&records, |l, r| same(l, r, "first_name") && !same(l, r, "surname"));
    assert_eq!(count, expected);
}

#[tokio::test]
async fn cumulative_counts_credit_each_pair_to_its_first_rule() {
    let (linker, records) = common::dedupe_linker().await;
    let n = records.len() as u64;
    let cartesian = n * (n - 1) / 2;

    let rules: Vec<BlockingRule> = ["l.first_name = r.first_name", "l.surname = r.surname", "1=0"]
        .into_iter()
        .map(BlockingRule::from)
        .collect();
    let result = linker
        .cumulative_comparisons_generated_by_blocking_rules(&rules, true, false)
        .await
        .unwrap();
    let records_out = result.records().unwrap();
    assert_eq!(records_out.len(), 3);

    let first = brute_force_pairs(&records, |l, r| same(l, r, "first_name"));
    let second = brute_force_pairs(&records, |l, r| same(l, r, "surname") && !same(l, r, "first_name"));
    assert_eq!(records_out[0].row_count, first);
    assert_eq!(records_out[1].row_count, second);
    assert_eq!(records_out[2].row_count, 0);
    assert_eq!(records_out[2].rule, "1=0");

    assert_eq!(records_out[0].start, Some(0));
    assert_eq!(records_out[1].start, Some(first));
    assert_eq!(records_out[2].cumulative_rows, Some(first + second));
    for record in records_out {
        assert_eq!(record.cartesian, Some(cartesian));
        let rr = 1.0 - record.cumulative_rows.unwrap() as f64 / cartesian as f64;
        assert!((record.reduction_ratio.unwrap() - rr).abs() < 1e-6);
        assert!(record.reduction_ratio_text.as_deref().unwrap().contains("reduction ratio"));
    }
}

#[tokio::test]
async fn cumulative_counts_default_to_prediction_rules_and_can_skip_chart_fields() {
    let (linker, _) = common::dedupe_linker().await;

    let result = linker
        .cumulative_comparisons_generated_by_blocking_rules(&[], false, false)
        .await
        .unwrap();
    let records = result.records().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].rule, "l.surname = r.surname");
    assert!(records.iter().all(|r| r.cartesian.is_none() && r.reduction_ratio.is_none()));

    let table = linker
        .cumulative_comparisons_generated_by_blocking_rules(&[], true, true)
        .await
        .unwrap();
    match table {
        CumulativeComparisons::Table(table) => {
            assert_eq!(table.len(), 2);
            for column in ["row_count", "rule", "cumulative_rows", "cartesian", "reduction_ratio"] {
                assert!(table.column_index(column).is_some(), "missing {column}");
            }
        }
        other => panic!("expected a table, got {other:?}"),
    }
}

#[tokio::test]
async fn link_only_counts_pairs_across_datasets() {
    let (linker, left, right) = common::link_only_linker().await;

    let left_counts = value_counts(&left, "first_name");
    let right_counts = value_counts(&right, "first_name");
    let expected: u64 = left_counts
        .iter()
        .map(|(name, n)| n * right_counts.get(name).copied().unwrap_or(0))
        .sum();

    let pre = linker
        .count_num_comparisons_from_blocking_rule("l.first_name = r.first_name")
        .await
        .unwrap();
    assert_eq!(pre, expected);

    let result = linker
        .cumulative_comparisons_generated_by_blocking_rules(&["l.first_name = r.first_name".into()], true, false)
        .await
        .unwrap();
    let record = &result.records().unwrap()[0];
    assert_eq!(record.row_count, expected);
    assert_eq!(record.cartesian, Some(left.len() as u64 * right.len() as u64));

    let no_keys = linker.count_num_comparisons_from_blocking_rule("1=1").await.unwrap();
    assert_eq!(no_keys, left.len() as u64 * right.len() as u64);
}

#[tokio::test]
async fn link_and_dedupe_counts_every_pair_of_the_union_once() {
    let (linker, left, right) = common::link_and_dedupe_linker().await;
    let union: Vec<_> = left.iter().chain(&right).cloned().collect();
    let n = union.len() as u64;

    let rules: Vec<BlockingRule> = ["l.first_name = r.first_name", "l.surname = r.surname"]
        .into_iter()
        .map(BlockingRule::from)
        .collect();
    let result = linker
        .cumulative_comparisons_generated_by_blocking_rules(&rules, true, false)
        .await
        .unwrap();
    let records = result.records().unwrap();

    let first = brute_force_pairs(&union, |l, r| same(l, r, "first_name"));
    let second = brute_force_pairs(&union, |l, r| same(l, r, "surname") && !same(l, r, "first_name"));
    assert_eq!(records[0].row_count, first);
    assert_eq!(records[1].row_count, second);
    assert_eq!(records[1].cumulative_rows, Some(first + second));
    assert_eq!(records[0].cartesian, Some(n * (n - 1) / 2));

    let post = linker
        .count_comparisons_from_blocking_rule_post_filters("l.surname = r.surname")
        .await
        .unwrap();
    assert_eq!(post, brute_force_pairs(&union, |l, r| same(l, r, "surname")));
}
