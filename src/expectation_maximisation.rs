//! Expectation-maximisation over aggregated comparison vectors.
//!
//! The engine is pure: it reads a [`ComparisonVectorTable`] and a starting
//! [`CoreModelSettings`] snapshot and returns the full parameter history.
//! Pairs are aggregated by distinct comparison vector, so each iteration costs
//! O(distinct vectors x comparisons) regardless of how many pairs were blocked.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::comparison_vectors::ComparisonVectorTable;
use crate::model::{Comparison, CoreModelSettings, Probability};

/// Parameters carried through every iteration unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedParameters {
    pub m: bool,
    pub u: bool,
    pub lambda: bool,
}

/// Result of one EM run.
#[derive(Debug, Clone)]
pub struct EmOutcome {
    /// Snapshots in iteration order; index 0 is the starting state.
    pub history: Vec<CoreModelSettings>,
    pub converged: bool,
    /// Iterations actually run (excluding the starting snapshot).
    pub iterations: usize,
    /// Largest parameter change observed in the final iteration.
    pub max_change: f64,
    /// Log-likelihood of the blocked pairs under each snapshot in `history`.
    pub log_likelihood_history: Vec<f64>,
}

impl EmOutcome {
    pub fn final_settings(&self) -> Option<&CoreModelSettings> {
        self.history.last()
    }
}

// ---------------------------------------------------------------------
//  E-step
// ---------------------------------------------------------------------

/// Posterior match probability of each distinct comparison vector.
///
/// Undefined Bayes factors (unset or unobserved m/u, or u = 0) contribute a
/// neutral factor of 1.
pub fn predict_match_probabilities(core: &CoreModelSettings, vectors: &ComparisonVectorTable) -> Vec<f64> {
    let lambda = core.probability_two_random_records_match;
    let prior_log_odds = (lambda / (1.0 - lambda)).ln();

    // Resolve each comparison's column position once.
    let columns: Vec<(usize, &Comparison)> = core
        .comparisons
        .iter()
        .filter_map(|c| vectors.position(&c.output_column_name).map(|i| (i, c)))
        .collect();

    vectors
        .rows
        .iter()
        .map(|row| {
            let mut log_odds = prior_log_odds;
            for &(idx, comparison) in &columns {
                let gamma = row.gammas[idx];
                if gamma < 0 {
                    continue;
                }
                if let Some(bf) = comparison
                    .level_by_comparison_vector_value(gamma)
                    .and_then(|l| l.bayes_factor())
                {
                    log_odds += bf.ln();
                }
            }
            let p = 1.0 / (1.0 + (-log_odds).exp());
            if p.is_nan() {
                lambda
            } else {
                p
            }
        })
        .collect()
}

/// Log-likelihood of the pairs under `core`:
/// `sum(count * ln(lambda * prod(m) + (1 - lambda) * prod(u)))`.
///
/// Levels without a numeric m or u are left out of the products, as in the
/// E-step.
pub fn log_likelihood(core: &CoreModelSettings, vectors: &ComparisonVectorTable) -> f64 {
    let lambda = core.probability_two_random_records_match;
    let columns: Vec<(usize, &Comparison)> = core
        .comparisons
        .iter()
        .filter_map(|c| vectors.position(&c.output_column_name).map(|i| (i, c)))
        .collect();

    vectors
        .rows
        .iter()
        .map(|row| {
            let mut m = 1.0;
            let mut u = 1.0;
            for &(idx, comparison) in &columns {
                let gamma = row.gammas[idx];
                if gamma < 0 {
                    continue;
                }
                let Some(level) = comparison.level_by_comparison_vector_value(gamma) else {
                    continue;
                };
                if let (Some(lm), Some(lu)) = (level.m_probability.value(), level.u_probability.value()) {
                    m *= lm;
                    u *= lu;
                }
            }
            row.count * (lambda * m + (1.0 - lambda) * u).ln()
        })
        .sum()
}

// ---------------------------------------------------------------------
//  M-step
// ---------------------------------------------------------------------

/// Posterior-weighted pair counts per comparison level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterCounts {
    /// Sum of posterior x count across all pairs.
    pub match_mass: f64,
    pub total_count: f64,
    /// Per comparison (in vector table order): level value -> (match mass, non-match mass).
    pub levels: Vec<BTreeMap<i32, (f64, f64)>>,
}

/// Count the match / non-match mass falling into each level. Null levels are excluded.
pub fn compute_new_parameters(vectors: &ComparisonVectorTable, posteriors: &[f64]) -> ParameterCounts {
    let mut counts = ParameterCounts {
        levels: vec![BTreeMap::new(); vectors.comparison_names.len()],
        ..Default::default()
    };
    for (row, &p) in vectors.rows.iter().zip(posteriors) {
        counts.match_mass += p * row.count;
        counts.total_count += row.count;
        for (levels, &gamma) in counts.levels.iter_mut().zip(&row.gammas) {
            if gamma < 0 {
                continue;
            }
            let entry = levels.entry(gamma).or_insert((0.0, 0.0));
            entry.0 += p * row.count;
            entry.1 += (1.0 - p) * row.count;
        }
    }
    counts
}

/// New m/u for one level. `NotObserved` when the level never occurred or its
/// comparison has no mass on that side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelProportions {
    pub m: Probability,
    pub u: Probability,
}

/// Normalise counts within each comparison. Returns `(lambda, levels)`;
/// lambda is `None` when there were no pairs.
pub fn compute_proportions_for_new_parameters(
    counts: &ParameterCounts,
) -> (Option<f64>, Vec<BTreeMap<i32, LevelProportions>>) {
    let lambda = (counts.total_count > 0.0).then(|| counts.match_mass / counts.total_count);
    let proportions = counts
        .levels
        .iter()
        .map(|levels| {
            let m_total: f64 = levels.values().map(|(m, _)| m).sum();
            let u_total: f64 = levels.values().map(|(_, u)| u).sum();
            levels
                .iter()
                .map(|(&gamma, &(m, u))| {
                    (
                        gamma,
                        LevelProportions {
                            m: proportion(m, m_total),
                            u: proportion(u, u_total),
                        },
                    )
                })
                .collect()
        })
        .collect();
    (lambda, proportions)
}

fn proportion(part: f64, total: f64) -> Probability {
    if total > 0.0 {
        Probability::Value((part / total).clamp(0.0, 1.0))
    } else {
        Probability::NotObserved
    }
}

/// Apply new proportions to a copy of `core`, leaving fixed parameters alone.
pub fn maximisation_step(
    core: &CoreModelSettings,
    vectors: &ComparisonVectorTable,
    posteriors: &[f64],
    fixed: FixedParameters,
) -> CoreModelSettings {
    let counts = compute_new_parameters(vectors, posteriors);
    let (lambda, proportions) = compute_proportions_for_new_parameters(&counts);

    let mut next = core.clone();
    if !fixed.lambda {
        if let Some(lambda) = lambda {
            next.probability_two_random_records_match = lambda;
        }
    }
    for comparison in &mut next.comparisons {
        let Some(idx) = vectors.position(&comparison.output_column_name) else {
            continue;
        };
        let observed = &proportions[idx];
        for level in comparison.levels_excluding_null_mut() {
            let new = observed.get(&level.comparison_vector_value).copied().unwrap_or(LevelProportions {
                m: Probability::NotObserved,
                u: Probability::NotObserved,
            });
            if !fixed.m {
                level.m_probability = new.m;
            }
            if !fixed.u {
                level.u_probability = new.u;
            }
        }
    }
    next
}

// ---------------------------------------------------------------------
//  Convergence
// ---------------------------------------------------------------------

/// Largest absolute change between two snapshots, over numeric non-fixed values.
pub fn max_parameter_change(
    previous: &CoreModelSettings,
    current: &CoreModelSettings,
    fixed: FixedParameters,
) -> (f64, String) {
    let mut biggest = 0.0_f64;
    let mut biggest_key = String::new();
    let mut consider = |old: Option<f64>, new: Option<f64>, key: &dyn Fn() -> String| {
        if let (Some(old), Some(new)) = (old, new) {
            let change = (new - old).abs();
            if change > biggest {
                biggest = change;
                biggest_key = key();
            }
        }
    };

    if !fixed.lambda {
        consider(
            Some(previous.probability_two_random_records_match),
            Some(current.probability_two_random_records_match),
            &|| "probability_two_random_records_match".to_string(),
        );
    }
    for new_cc in &current.comparisons {
        let Some(old_cc) = previous.comparison_by_output_column_name(&new_cc.output_column_name) else {
            continue;
        };
        for new_cl in new_cc.levels_excluding_null() {
            let value = new_cl.comparison_vector_value;
            let Some(old_cl) = old_cc.level_by_comparison_vector_value(value) else {
                continue;
            };
            let label = || format!("{}, level {} ({})", new_cc.output_column_name, value, new_cl.label_for_charts);
            if !fixed.m {
                consider(old_cl.m_probability.value(), new_cl.m_probability.value(), &|| {
                    format!("m: {}", label())
                });
            }
            if !fixed.u {
                consider(old_cl.u_probability.value(), new_cl.u_probability.value(), &|| {
                    format!("u: {}", label())
                });
            }
        }
    }
    (biggest, biggest_key)
}

// ---------------------------------------------------------------------
//  Driver
// ---------------------------------------------------------------------

/// Run EM from `core` until the largest parameter change drops below
/// `em_convergence` or `max_iterations` is reached.
pub fn expectation_maximisation(
    core: &CoreModelSettings,
    vectors: &ComparisonVectorTable,
    fixed: FixedParameters,
    em_convergence: f64,
    max_iterations: usize,
) -> EmOutcome {
    let start = core.with_default_probabilities();
    let mut log_likelihood_history = vec![log_likelihood(&start, vectors)];
    let mut history = vec![start];
    let mut converged = false;
    let mut max_change = f64::INFINITY;
    let mut iterations = 0;

    while iterations < max_iterations {
        iterations += 1;
        let current = &history[history.len() - 1];
        let posteriors = predict_match_probabilities(current, vectors);
        let next = maximisation_step(current, vectors, &posteriors, fixed);
        let (change, key) = max_parameter_change(current, &next, fixed);
        max_change = change;
        let ll = log_likelihood(&next, vectors);
        debug!(
            iteration = iterations,
            lambda = next.probability_two_random_records_match,
            log_likelihood = ll,
            "EM iteration complete"
        );
        log_likelihood_history.push(ll);
        info!("Iteration {iterations}: Largest change in params was {change:.6} in {key}");
        history.push(next);
        if change < em_convergence {
            converged = true;
            break;
        }
    }

    if converged {
        info!("EM converged after {iterations} iterations");
    } else {
        info!(
            "EM did not converge after {iterations} iterations (largest change {max_change:.6}); using final parameters"
        );
    }

    EmOutcome {
        history,
        converged,
        iterations,
        max_change,
        log_likelihood_history,
    }
}
