//! A single EM training run against one blocking rule.
//!
//! The session trains a private copy of the model. Comparisons whose columns
//! the blocking rule already constrains are deactivated, and the match prior
//! is raised to account for the agreement blocking guarantees. Only the final
//! snapshot reaches the canonical model, as trained m/u records tagged
//! `EM, blocked on: <rule>`.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::backend::{self, Record, SqlPipeline, StagedTable};
use crate::blocking::BlockingRule;
use crate::comparison_vectors::{self, BLOCKED_TABLE};
use crate::error::{LinkageError, Result};
use crate::expectation_maximisation::{expectation_maximisation, EmOutcome, FixedParameters};
use crate::linker::Linker;
use crate::model::{bayes_factor_to_prob, prob_to_bayes_factor, Comparison, ComparisonLevel, CoreModelSettings, Settings};

/// Caller options for one training session.
#[derive(Debug, Clone, Default)]
pub struct EmTrainingOptions {
    pub fix_m_probabilities: bool,
    pub fix_u_probabilities: bool,
    pub fix_probability_two_random_records_match: bool,
    /// Output column names to deactivate. When `None` or empty, comparisons
    /// sharing input columns with the blocking rule are deactivated.
    pub comparisons_to_deactivate: Option<Vec<String>>,
    pub estimate_without_term_frequencies: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Constructed,
    VectorsComputed,
    Trained,
}

/// A comparison level the training rule forces every blocked pair into.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpliedLevel {
    pub output_column_name: String,
    pub label_for_charts: String,
    pub comparison_vector_value: i32,
    pub bayes_factor: Option<f64>,
}

pub struct EmTrainingSession {
    settings: Settings,
    blocking_rule: BlockingRule,
    fixed: FixedParameters,
    comparisons_deactivated: Vec<String>,
    comparisons_estimated: Vec<String>,
    levels_implied_by_rule: Vec<ImpliedLevel>,
    core_model_settings: CoreModelSettings,
    history: Vec<CoreModelSettings>,
    log_likelihood_history: Vec<f64>,
    converged: Option<bool>,
    iterations: usize,
    state: SessionState,
}

impl EmTrainingSession {
    pub fn new(linker: &Linker, blocking_rule: BlockingRule, options: EmTrainingOptions) -> Result<Self> {
        info!("----- Starting EM training session -----");
        if options.fix_m_probabilities && options.fix_u_probabilities {
            return Err(LinkageError::config("Can't train model if you fix both m and u probabilities"));
        }

        let mut settings = linker.settings().clone();
        if options.estimate_without_term_frequencies {
            settings.disable_term_frequency_adjustments();
        }

        let levels_implied_by_rule = levels_implied_by_rule(&settings.comparisons, &blocking_rule);
        let adjusted = blocking_adjusted_probability_two_random_records_match(
            settings.probability_two_random_records_match,
            &levels_implied_by_rule,
            &blocking_rule,
        );
        settings.probability_two_random_records_match = adjusted;

        let comparisons_deactivated = match options.comparisons_to_deactivate {
            Some(names) if !names.is_empty() => {
                for name in &names {
                    if settings.comparison_by_output_column_name(name).is_none() {
                        return Err(LinkageError::config(format!(
                            "cannot deactivate unknown comparison `{name}`"
                        )));
                    }
                }
                names
            }
            _ => {
                let rule_columns = blocking_rule.columns_used();
                settings
                    .comparisons
                    .iter()
                    .filter(|c| !c.input_columns_used().is_disjoint(&rule_columns))
                    .map(|c| c.output_column_name.clone())
                    .collect()
            }
        };

        let active: Vec<Comparison> = settings
            .comparisons
            .iter()
            .filter(|c| !comparisons_deactivated.contains(&c.output_column_name))
            .cloned()
            .collect();
        let comparisons_estimated = active.iter().map(|c| c.output_column_name.clone()).collect();
        let core_model_settings = CoreModelSettings {
            comparisons: active,
            probability_two_random_records_match: adjusted,
        };

        Ok(Self {
            settings,
            blocking_rule,
            fixed: FixedParameters {
                m: options.fix_m_probabilities,
                u: options.fix_u_probabilities,
                lambda: options.fix_probability_two_random_records_match,
            },
            comparisons_deactivated,
            comparisons_estimated,
            levels_implied_by_rule,
            core_model_settings,
            history: Vec::new(),
            log_likelihood_history: Vec::new(),
            converged: None,
            iterations: 0,
            state: SessionState::Constructed,
        })
    }

    pub fn blocking_rule(&self) -> &BlockingRule {
        &self.blocking_rule
    }

    /// The session's private settings, with the blocking-adjusted prior.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn comparisons_deactivated(&self) -> &[String] {
        &self.comparisons_deactivated
    }

    pub fn comparisons_estimated(&self) -> &[String] {
        &self.comparisons_estimated
    }

    pub fn levels_implied_by_rule(&self) -> &[ImpliedLevel] {
        &self.levels_implied_by_rule
    }

    pub fn blocking_adjusted_probability_two_random_records_match(&self) -> f64 {
        self.settings.probability_two_random_records_match
    }

    /// Latest snapshot: the starting point before training, the final one after.
    pub fn core_model_settings(&self) -> &CoreModelSettings {
        &self.core_model_settings
    }

    pub fn history(&self) -> &[CoreModelSettings] {
        &self.history
    }

    /// Log-likelihood of the training pairs under each snapshot in `history`.
    pub fn log_likelihood_history(&self) -> &[f64] {
        &self.log_likelihood_history
    }

    /// `None` until trained.
    pub fn converged(&self) -> Option<bool> {
        self.converged
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn is_trained(&self) -> bool {
        self.state == SessionState::Trained
    }

    fn training_log_message(&self) {
        let mu = if self.fixed.u {
            "m probabilities"
        } else if self.fixed.m {
            "u probabilities"
        } else {
            "m and u probabilities"
        };
        let bullet = |names: &[String]| names.iter().map(|n| format!("\n    - {n}")).collect::<String>();
        info!(
            "Estimating the {mu} of the model by blocking on:\n{}\n\n\
             Parameter estimates will be made for the following comparison(s):{}\n\n\
             Parameter estimates cannot be made for the following comparison(s) since they are used in the blocking rules:{}",
            self.blocking_rule,
            bullet(&self.comparisons_estimated),
            bullet(&self.comparisons_deactivated),
        );
    }

    /// Block with the training rule and compute each pair's comparison vector.
    pub async fn comparison_vectors(&mut self, linker: &Linker) -> Result<StagedTable> {
        if self.state != SessionState::Constructed {
            return Err(LinkageError::session_state(
                "comparison vectors can only be computed once, before training",
            ));
        }
        self.training_log_message();

        let mut pipeline = SqlPipeline::new();
        linker.enqueue_df_concat_with_tf(&mut pipeline, &self.settings);
        let context = linker.blocking_context(&self.settings);
        let columns = comparison_vectors::input_columns_required(&self.core_model_settings.comparisons);
        let select = context.columns_to_select(&columns);
        pipeline.enqueue_sql(
            context.block_using_rules_sql(std::slice::from_ref(&self.blocking_rule), &select),
            BLOCKED_TABLE,
        );
        let vectors = linker
            .comparison_vectors_after_blocking(
                pipeline,
                &self.core_model_settings.comparisons,
                &self.settings.unique_id_column_name,
                &[],
                "em comparison vectors",
            )
            .await?;
        self.state = SessionState::VectorsComputed;
        Ok(vectors)
    }

    /// Compute comparison vectors, run EM and fold the result into `linker`.
    pub async fn train(&mut self, linker: &mut Linker) -> Result<()> {
        let vectors = self.comparison_vectors(linker).await?;
        self.train_with_vectors(linker, vectors).await
    }

    /// Run EM on previously computed comparison vectors. The vectors are
    /// released whatever the outcome.
    pub async fn train_with_vectors(&mut self, linker: &mut Linker, vectors: StagedTable) -> Result<()> {
        let result = self.run_em(linker, &vectors).await;
        let outcome = backend::release(result, vec![vectors]).await?;

        self.core_model_settings = outcome.final_settings().cloned().unwrap_or_else(|| self.core_model_settings.clone());
        self.converged = Some(outcome.converged);
        self.iterations = outcome.iterations;
        self.history = outcome.history;
        self.log_likelihood_history = outcome.log_likelihood_history;
        self.state = SessionState::Trained;

        self.fold_back(linker.settings_mut());
        linker.settings_mut().populate_m_u_from_trained_values();
        Ok(())
    }

    async fn run_em(&self, linker: &Linker, vectors: &StagedTable) -> Result<EmOutcome> {
        if self.state == SessionState::Trained {
            return Err(LinkageError::session_state("this training session has already been trained"));
        }
        if linker.with_timeout("em pair check", vectors.first_record()).await?.is_none() {
            let rule = format!("`{}`", self.blocking_rule);
            return Err(LinkageError::em_training(format!(
                "Training rule {rule} resulted in no record pairs: no two input records satisfy it. \
                 EM needs hundreds, preferably thousands, of comparisons to give stable estimates. \
                 Loosen the training rule, checking its cost first with `count_num_comparisons_from_blocking_rule`."
            )));
        }
        let table = linker
            .load_comparison_vector_table(vectors, &self.core_model_settings.comparisons, "em comparison vector counts")
            .await?;
        Ok(expectation_maximisation(
            &self.core_model_settings,
            &table,
            self.fixed,
            self.settings.em_convergence,
            self.settings.max_iterations,
        ))
    }

    /// Record the final m/u values on the canonical settings, matched by
    /// output column name and comparison vector value.
    fn fold_back(&self, canonical: &mut Settings) {
        let description = format!("EM, blocked on: {}", self.blocking_rule);
        for cc in &self.core_model_settings.comparisons {
            let Some(orig_cc) = canonical.comparison_by_output_column_name_mut(&cc.output_column_name) else {
                continue;
            };
            for cl in cc.levels_excluding_null() {
                let Some(orig_cl) = orig_cc.level_by_comparison_vector_value_mut(cl.comparison_vector_value) else {
                    continue;
                };
                if !self.fixed.m && !cl.m_probability.is_unset() {
                    log_if_not_observed("m", cc, cl);
                    orig_cl.add_trained_m_probability(cl.m_probability, &description);
                }
                if !self.fixed.u && !cl.u_probability.is_unset() {
                    log_if_not_observed("u", cc, cl);
                    orig_cl.add_trained_u_probability(cl.u_probability, &description);
                }
            }
        }
    }

    /// λ per iteration, with its reciprocal and the log-likelihood.
    pub fn lambda_history_records(&self) -> Vec<Record> {
        self.history
            .iter()
            .enumerate()
            .map(|(iteration, snapshot)| {
                let lam = snapshot.probability_two_random_records_match;
                to_record(json!({
                    "probability_two_random_records_match": lam,
                    "probability_two_random_records_match_reciprocal": 1.0 / lam,
                    "log_likelihood": self.log_likelihood_history.get(iteration),
                    "iteration": iteration,
                }))
            })
            .collect()
    }

    /// One record per iteration and non-null comparison level.
    pub fn iteration_history_records(&self) -> Vec<Record> {
        let mut out = Vec::new();
        for (iteration, snapshot) in self.history.iter().enumerate() {
            for cc in &snapshot.comparisons {
                for cl in cc.levels_excluding_null() {
                    let bf = cl.bayes_factor();
                    out.push(to_record(json!({
                        "iteration": iteration,
                        "comparison_name": cc.output_column_name,
                        "label_for_charts": cl.label_for_charts,
                        "comparison_vector_value": cl.comparison_vector_value,
                        "m_probability": cl.m_probability,
                        "u_probability": cl.u_probability,
                        "bayes_factor": bf,
                        "log2_bayes_factor": bf.filter(|b| *b > 0.0).map(f64::log2),
                        "probability_two_random_records_match": snapshot.probability_two_random_records_match,
                    })));
                }
            }
        }
        out
    }
}

impl fmt::Display for EmTrainingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EMTrainingSession, blocking on {}, deactivating comparisons {}>",
            self.blocking_rule,
            self.comparisons_deactivated.join(", ")
        )
    }
}

impl fmt::Debug for EmTrainingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmTrainingSession")
            .field("blocking_rule", &self.blocking_rule)
            .field("comparisons_deactivated", &self.comparisons_deactivated)
            .field("state", &self.state)
            .field("iterations", &self.iterations)
            .finish()
    }
}

fn log_if_not_observed(side: &str, cc: &Comparison, cl: &ComparisonLevel) {
    let probability = if side == "m" { cl.m_probability } else { cl.u_probability };
    if probability.is_not_observed() {
        info!(
            "{side} probability not trained for {} - {} (comparison vector value: {}). \
             This usually means the comparison level was never observed in the training data.",
            cc.output_column_name, cl.label_for_charts, cl.comparison_vector_value
        );
    }
}

fn to_record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// For each comparison, the first level whose exact-match columns the rule
/// guarantees to be equal.
pub fn levels_implied_by_rule(comparisons: &[Comparison], rule: &BlockingRule) -> Vec<ImpliedLevel> {
    let rule_cols = rule.exact_match_columns();
    if rule_cols.is_empty() {
        return Vec::new();
    }
    comparisons
        .iter()
        .map(Comparison::with_default_probabilities)
        .filter_map(|cc| {
            let level = cc.levels_excluding_null().find(|cl| {
                cl.exact_match_columns()
                    .is_some_and(|cols: BTreeSet<String>| cols.is_subset(&rule_cols))
            })?;
            Some(ImpliedLevel {
                output_column_name: cc.output_column_name.clone(),
                label_for_charts: level.label_for_charts.clone(),
                comparison_vector_value: level.comparison_vector_value,
                bayes_factor: level.bayes_factor(),
            })
        })
        .collect()
}

/// Raise the prior by the Bayes factor of every level the rule implies.
pub fn blocking_adjusted_probability_two_random_records_match(
    prior: f64,
    implied: &[ImpliedLevel],
    rule: &BlockingRule,
) -> f64 {
    debug!("Original prob two random records match: {prior:.3}");
    let mut adjusted_bf = prob_to_bayes_factor(prior);
    for level in implied {
        let bf = level.bayes_factor.unwrap_or(1.0);
        adjusted_bf *= bf;
        debug!(
            "Increasing prob two random records match using {} - {} using bayes factor {bf:.3}",
            level.output_column_name, level.label_for_charts
        );
    }
    let adjusted = bayes_factor_to_prob(adjusted_bf);
    debug!("Prob two random records match adjusted for blocking on {rule}: {adjusted:.3}");
    adjusted
}
