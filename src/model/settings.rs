//! Model settings and per-iteration parameter snapshots.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::comparison::Comparison;
use crate::blocking::BlockingRule;
use crate::error::{LinkageError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    DedupeOnly,
    LinkOnly,
    LinkAndDedupe,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DedupeOnly => "dedupe_only",
            Self::LinkOnly => "link_only",
            Self::LinkAndDedupe => "link_and_dedupe",
        }
    }
}

/// Immutable view of the model parameters at one EM iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreModelSettings {
    pub comparisons: Vec<Comparison>,
    pub probability_two_random_records_match: f64,
}

impl CoreModelSettings {
    pub fn comparison_by_output_column_name(&self, name: &str) -> Option<&Comparison> {
        self.comparisons.iter().find(|c| c.output_column_name == name)
    }

    /// Copy with unset m/u values resolved to their defaults.
    pub fn with_default_probabilities(&self) -> Self {
        Self {
            comparisons: self
                .comparisons
                .iter()
                .map(Comparison::with_default_probabilities)
                .collect(),
            probability_two_random_records_match: self.probability_two_random_records_match,
        }
    }
}

/// Full model configuration.
///
/// Built with [`Settings::from_json_str`] / [`Settings::new`], which assign
/// comparison vector values and validate the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub link_type: LinkType,

    #[serde(default = "default_unique_id_column_name")]
    pub unique_id_column_name: String,

    #[serde(default = "default_source_dataset_column_name")]
    pub source_dataset_column_name: String,

    #[serde(default = "default_probability_two_random_records_match")]
    pub probability_two_random_records_match: f64,

    /// EM stops when no parameter moves by more than this between iterations.
    #[serde(default = "default_em_convergence")]
    pub em_convergence: f64,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    pub comparisons: Vec<Comparison>,

    #[serde(default)]
    pub blocking_rules_to_generate_predictions: Vec<BlockingRule>,

    /// Seed for the u-sampling RNG. Entropy-seeded when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Caller-level timeout applied to each backend phase. A timed-out phase
    /// is abandoned, not interrupted: its output table is dropped once the
    /// backend lets go of it, but work already running on the backend still
    /// runs to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_timeout_secs: Option<u64>,
}

fn default_unique_id_column_name() -> String {
    "unique_id".to_string()
}

fn default_source_dataset_column_name() -> String {
    "source_dataset".to_string()
}

fn default_probability_two_random_records_match() -> f64 {
    0.0001
}

fn default_em_convergence() -> f64 {
    0.0001
}

fn default_max_iterations() -> usize {
    25
}

impl Settings {
    pub fn new(link_type: LinkType, comparisons: Vec<Comparison>) -> Result<Self> {
        Self {
            link_type,
            unique_id_column_name: default_unique_id_column_name(),
            source_dataset_column_name: default_source_dataset_column_name(),
            probability_two_random_records_match: default_probability_two_random_records_match(),
            em_convergence: default_em_convergence(),
            max_iterations: default_max_iterations(),
            comparisons,
            blocking_rules_to_generate_predictions: Vec::new(),
            seed: None,
            phase_timeout_secs: None,
        }
        .completed()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(raw)?;
        settings.completed()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let settings: Settings = serde_json::from_value(value)?;
        settings.completed()
    }

    pub fn with_blocking_rules_to_generate_predictions<I, R>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<BlockingRule>,
    {
        self.blocking_rules_to_generate_predictions = rules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_probability_two_random_records_match(mut self, prob: f64) -> Result<Self> {
        self.probability_two_random_records_match = prob;
        self.validate()?;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Assign comparison vector values, then validate.
    pub fn completed(mut self) -> Result<Self> {
        for comparison in &mut self.comparisons {
            comparison.assign_comparison_vector_values();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let lam = self.probability_two_random_records_match;
        if !(lam > 0.0 && lam < 1.0) {
            return Err(LinkageError::config(format!(
                "probability_two_random_records_match must lie in (0,1), got {lam}"
            )));
        }
        if self.em_convergence.is_nan() || self.em_convergence <= 0.0 {
            return Err(LinkageError::config("em_convergence must be positive"));
        }
        if self.max_iterations == 0 {
            return Err(LinkageError::config("max_iterations must be at least 1"));
        }
        if self.comparisons.is_empty() {
            return Err(LinkageError::config("settings must define at least one comparison"));
        }
        let mut seen = HashSet::new();
        for comparison in &self.comparisons {
            comparison.validate()?;
            if !seen.insert(comparison.output_column_name.as_str()) {
                return Err(LinkageError::config(format!(
                    "duplicate comparison output_column_name `{}`",
                    comparison.output_column_name
                )));
            }
        }
        Ok(())
    }

    pub fn core_model_settings(&self) -> CoreModelSettings {
        CoreModelSettings {
            comparisons: self.comparisons.clone(),
            probability_two_random_records_match: self.probability_two_random_records_match,
        }
    }

    pub fn comparison_by_output_column_name(&self, name: &str) -> Option<&Comparison> {
        self.comparisons.iter().find(|c| c.output_column_name == name)
    }

    pub fn comparison_by_output_column_name_mut(&mut self, name: &str) -> Option<&mut Comparison> {
        self.comparisons.iter_mut().find(|c| c.output_column_name == name)
    }

    /// Drop term-frequency adjustments from every level.
    pub fn disable_term_frequency_adjustments(&mut self) {
        for comparison in &mut self.comparisons {
            for level in &mut comparison.comparison_levels {
                level.tf_adjustment_column = None;
            }
        }
    }

    pub fn tf_adjustment_columns(&self) -> BTreeSet<String> {
        self.comparisons
            .iter()
            .flat_map(|c| c.tf_adjustment_columns())
            .collect()
    }

    /// Set m and u of every level to the median of their trained values.
    pub fn populate_m_u_from_trained_values(&mut self) {
        for comparison in &mut self.comparisons {
            for level in comparison.levels_excluding_null_mut() {
                level.populate_m_from_trained_values();
                level.populate_u_from_trained_values();
            }
        }
    }
}
