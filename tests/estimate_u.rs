mod common;

use linkage_harness::{InputTable, LinkType, Linker, Probability, Settings};

const DESCRIPTION: &str = "estimate u by random sampling";

fn u_values(settings: &Settings, comparison: &str) -> Vec<f64> {
    settings
        .comparison_by_output_column_name(comparison)
        .unwrap()
        .levels_excluding_null()
        .filter_map(|l| l.u_probability.value())
        .collect()
}

fn assert_every_level_has_one_sampled_u(settings: &Settings) {
    for comparison in &settings.comparisons {
        for level in comparison.levels_excluding_null() {
            assert_eq!(level.trained_u_probabilities.len(), 1, "{}", comparison.output_column_name);
            assert_eq!(level.trained_u_probabilities[0].description, DESCRIPTION);
            assert!(level.trained_m_probabilities.is_empty());
        }
    }
}

#[tokio::test]
async fn dedupe_sampling_records_u_for_every_level() {
    let (mut linker, _) = common::dedupe_linker().await;
    linker.estimate_u_using_random_sampling(5_000).await.unwrap();

    let settings = linker.settings();
    assert_every_level_has_one_sampled_u(settings);

    for comparison in &settings.comparisons {
        let u = u_values(settings, &comparison.output_column_name);
        let total: f64 = u.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "{} u sums to {total}", comparison.output_column_name);
    }

    // Random pairs rarely share a surname.
    let surname = settings.comparison_by_output_column_name("surname").unwrap();
    let exact = surname.level_by_comparison_vector_value(1).unwrap();
    assert!(exact.u_probability.value().unwrap() < 0.2);

    // m is untouched.
    assert!(settings
        .comparisons
        .iter()
        .all(|c| c.levels_excluding_null().all(|l| l.m_probability.is_unset())));
}

#[tokio::test]
async fn seeded_sampling_is_reproducible() {
    let (mut a, _) = common::dedupe_linker().await;
    let (mut b, _) = common::dedupe_linker().await;
    a.estimate_u_using_random_sampling(2_000).await.unwrap();
    b.estimate_u_using_random_sampling(2_000).await.unwrap();

    for comparison in &a.settings().comparisons {
        let name = &comparison.output_column_name;
        let ua = u_values(a.settings(), name);
        let ub = u_values(b.settings(), name);
        assert_eq!(ua.len(), ub.len());
        for (x, y) in ua.iter().zip(&ub) {
            assert!((x - y).abs() < 1e-12, "{name}: {x} vs {y}");
        }
    }
}

#[tokio::test]
async fn repeated_estimates_accumulate_and_take_the_median() {
    let (mut linker, _) = common::dedupe_linker().await;
    linker.estimate_u_using_random_sampling(3_000).await.unwrap();
    linker.estimate_u_using_random_sampling(3_000).await.unwrap();

    let surname = linker.settings().comparison_by_output_column_name("surname").unwrap();
    let level = surname.level_by_comparison_vector_value(1).unwrap();
    let trained: Vec<f64> = level
        .trained_u_probabilities
        .iter()
        .filter_map(|t| t.probability.value())
        .collect();
    assert_eq!(trained.len(), 2);
    let median = 0.5 * (trained[0] + trained[1]);
    assert!((level.u_probability.value().unwrap() - median).abs() < 1e-12);
}

#[tokio::test]
async fn unreachable_levels_are_marked_not_observed() {
    let records = common::people(200, 3);
    let mut comparisons = common::comparisons();
    comparisons.push(common::comparison_with_unreachable_level());
    let settings = Settings::new(LinkType::DedupeOnly, comparisons).unwrap().with_seed(9);
    let mut linker = Linker::with_sqlite(vec![InputTable::new("people", records)], settings)
        .await
        .unwrap();

    linker.estimate_u_using_random_sampling(1_000).await.unwrap();

    let marker = linker
        .settings()
        .comparison_by_output_column_name("first_name_marker")
        .unwrap();
    let unreachable = marker.level_by_comparison_vector_value(1).unwrap();
    assert_eq!(unreachable.u_probability, Probability::NotObserved);
    assert!(unreachable.trained_u_probabilities[0].probability.is_not_observed());
    let else_level = marker.level_by_comparison_vector_value(0).unwrap();
    assert_eq!(else_level.u_probability, Probability::Value(1.0));
}

#[tokio::test]
async fn link_only_samples_pairs_or_uses_the_full_cross() {
    let (mut sampled, left, right) = common::link_only_linker().await;
    assert!((left.len() * right.len()) as u64 > 2_000);
    sampled.estimate_u_using_random_sampling(2_000).await.unwrap();
    assert_every_level_has_one_sampled_u(sampled.settings());

    let (mut full, _, _) = common::link_only_linker().await;
    full.estimate_u_using_random_sampling(10_000_000).await.unwrap();
    assert_every_level_has_one_sampled_u(full.settings());
    for comparison in &full.settings().comparisons {
        let total: f64 = u_values(full.settings(), &comparison.output_column_name).iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}

#[tokio::test]
async fn zero_target_is_a_configuration_error() {
    let (mut linker, _) = common::dedupe_linker().await;
    let err = linker.estimate_u_using_random_sampling(0).await.unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn link_and_dedupe_samples_across_and_within_datasets() {
    let (mut linker, _, _) = common::link_and_dedupe_linker().await;
    linker.estimate_u_using_random_sampling(3_000).await.unwrap();

    let settings = linker.settings();
    assert_every_level_has_one_sampled_u(settings);
    for comparison in &settings.comparisons {
        let total: f64 = u_values(settings, &comparison.output_column_name).iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "{} u sums to {total}", comparison.output_column_name);
    }
}
