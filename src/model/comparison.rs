//! Comparisons and their discrete comparison levels.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::probability::{bayes_factor, Probability, TrainedProbability};
use crate::blocking::{split_top_level, strip_outer_parens};
use crate::error::{LinkageError, Result};

static INPUT_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""?\b([A-Za-z_][A-Za-z0-9_]*)_[lr]\b"?"#).expect("Invalid input column regex")
});

static EXACT_MATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^"?([A-Za-z_][A-Za-z0-9_]*)_([lr])"?\s*=\s*"?([A-Za-z_][A-Za-z0-9_]*)_([lr])"?$"#)
        .expect("Invalid exact match regex")
});

/// One discrete bucket of a comparison, e.g. "exact match" or "else".
///
/// `sql_condition` refers to the two records' columns with `_l` / `_r`
/// suffixes (`surname_l = surname_r`). An else level uses the literal `ELSE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonLevel {
    pub sql_condition: String,
    #[serde(default)]
    pub label_for_charts: String,
    #[serde(default)]
    pub is_null_level: bool,
    #[serde(default)]
    pub m_probability: Probability,
    #[serde(default)]
    pub u_probability: Probability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf_adjustment_column: Option<String>,
    /// Ordinal written into the comparison vector. -1 for the null level.
    #[serde(default)]
    pub comparison_vector_value: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trained_m_probabilities: Vec<TrainedProbability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trained_u_probabilities: Vec<TrainedProbability>,
}

impl ComparisonLevel {
    pub fn custom(sql_condition: impl Into<String>, label_for_charts: impl Into<String>) -> Self {
        Self {
            sql_condition: sql_condition.into(),
            label_for_charts: label_for_charts.into(),
            is_null_level: false,
            m_probability: Probability::Unset,
            u_probability: Probability::Unset,
            tf_adjustment_column: None,
            comparison_vector_value: 0,
            trained_m_probabilities: Vec::new(),
            trained_u_probabilities: Vec::new(),
        }
    }

    pub fn null_level(col: &str) -> Self {
        let mut level = Self::custom(format!("{col}_l IS NULL OR {col}_r IS NULL"), "Null");
        level.is_null_level = true;
        level
    }

    pub fn exact_match(col: &str) -> Self {
        Self::custom(format!("{col}_l = {col}_r"), "Exact match")
    }

    pub fn levenshtein(col: &str, distance_threshold: usize) -> Self {
        Self::custom(
            format!("levenshtein({col}_l, {col}_r) <= {distance_threshold}"),
            format!("Levenshtein <= {distance_threshold}"),
        )
    }

    pub fn jaro_winkler(col: &str, similarity_threshold: f64) -> Self {
        Self::custom(
            format!("jaro_winkler({col}_l, {col}_r) >= {similarity_threshold}"),
            format!("Jaro-Winkler >= {similarity_threshold}"),
        )
    }

    pub fn else_level() -> Self {
        Self::custom("ELSE", "All other comparisons")
    }

    pub fn with_m_probability(mut self, m: f64) -> Self {
        self.m_probability = Probability::Value(m);
        self
    }

    pub fn with_u_probability(mut self, u: f64) -> Self {
        self.u_probability = Probability::Value(u);
        self
    }

    pub fn with_tf_adjustment(mut self, col: impl Into<String>) -> Self {
        self.tf_adjustment_column = Some(col.into());
        self
    }

    pub fn is_else_level(&self) -> bool {
        self.sql_condition.trim().eq_ignore_ascii_case("else")
    }

    /// m/u for this level; `None` when undefined.
    pub fn bayes_factor(&self) -> Option<f64> {
        bayes_factor(self.m_probability, self.u_probability)
    }

    /// Input columns referenced through `_l` / `_r` suffixed names.
    pub fn input_columns_used(&self) -> BTreeSet<String> {
        if self.is_else_level() {
            return BTreeSet::new();
        }
        INPUT_COLUMN_RE
            .captures_iter(&self.sql_condition)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Columns this level requires to be exactly equal, if the level is a pure
    /// conjunction of `col_l = col_r` terms.
    pub fn exact_match_columns(&self) -> Option<BTreeSet<String>> {
        if self.is_null_level || self.is_else_level() {
            return None;
        }
        let mut cols = BTreeSet::new();
        for conjunct in split_top_level(&self.sql_condition, "and") {
            let caps = EXACT_MATCH_RE.captures(strip_outer_parens(conjunct))?;
            if caps[1] != caps[3] || caps[2] == caps[4] {
                return None;
            }
            cols.insert(caps[1].to_string());
        }
        if cols.is_empty() {
            None
        } else {
            Some(cols)
        }
    }

    pub fn add_trained_m_probability(&mut self, probability: Probability, description: &str) {
        self.trained_m_probabilities.push(TrainedProbability {
            probability,
            description: description.to_string(),
        });
    }

    pub fn add_trained_u_probability(&mut self, probability: Probability, description: &str) {
        self.trained_u_probabilities.push(TrainedProbability {
            probability,
            description: description.to_string(),
        });
    }

    /// Set m to the median of all numeric trained values.
    pub fn populate_m_from_trained_values(&mut self) {
        if let Some(m) = populate_from_trained(&self.trained_m_probabilities, self.m_probability) {
            self.m_probability = m;
        }
    }

    /// Set u to the median of all numeric trained values.
    pub fn populate_u_from_trained_values(&mut self) {
        if let Some(u) = populate_from_trained(&self.trained_u_probabilities, self.u_probability) {
            self.u_probability = u;
        }
    }
}

fn populate_from_trained(trained: &[TrainedProbability], current: Probability) -> Option<Probability> {
    let values: Vec<f64> = trained.iter().filter_map(|t| t.probability.value()).collect();
    if !values.is_empty() {
        return Some(Probability::Value(median(values)));
    }
    // Only "not observed" records: keep an explicit value, otherwise record the sentinel.
    if trained.iter().any(|t| t.probability.is_not_observed()) && current.value().is_none() {
        return Some(Probability::NotObserved);
    }
    None
}

fn median(mut v: Vec<f64>) -> f64 {
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = v.len();
    if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    }
}

/// Default m probabilities indexed by comparison vector value (lowest first).
pub fn default_m_values(num_levels: usize) -> Vec<f64> {
    match num_levels {
        0 => Vec::new(),
        1 => vec![1.0],
        2 => vec![0.05, 0.95],
        3 => vec![0.05, 0.2, 0.75],
        4 => vec![0.05, 0.1, 0.2, 0.65],
        5 => vec![0.05, 0.1, 0.1, 0.15, 0.6],
        n => {
            let rest = 0.95 / (n - 1) as f64;
            std::iter::once(0.05)
                .chain(std::iter::repeat(rest).take(n - 1))
                .collect()
        }
    }
}

/// Default u probabilities: the m defaults reversed.
pub fn default_u_values(num_levels: usize) -> Vec<f64> {
    let mut u = default_m_values(num_levels);
    u.reverse();
    u
}

/// A compared field: an ordered list of mutually exclusive levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub output_column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_description: Option<String>,
    pub comparison_levels: Vec<ComparisonLevel>,
}

impl Comparison {
    pub fn new(output_column_name: impl Into<String>, comparison_levels: Vec<ComparisonLevel>) -> Self {
        let mut comparison = Self {
            output_column_name: output_column_name.into(),
            comparison_description: None,
            comparison_levels,
        };
        comparison.assign_comparison_vector_values();
        comparison
    }

    /// Null, exact match, else.
    pub fn exact_match(col: &str) -> Self {
        Self::new(
            col,
            vec![
                ComparisonLevel::null_level(col),
                ComparisonLevel::exact_match(col),
                ComparisonLevel::else_level(),
            ],
        )
    }

    /// Null, exact match, one levenshtein level per threshold (ascending), else.
    pub fn levenshtein_at_thresholds(col: &str, thresholds: &[usize]) -> Self {
        let mut levels = vec![ComparisonLevel::null_level(col), ComparisonLevel::exact_match(col)];
        let mut sorted = thresholds.to_vec();
        sorted.sort_unstable();
        levels.extend(sorted.into_iter().map(|t| ComparisonLevel::levenshtein(col, t)));
        levels.push(ComparisonLevel::else_level());
        Self::new(col, levels)
    }

    pub fn gamma_column_name(&self) -> String {
        format!("gamma_{}", self.output_column_name)
    }

    /// Null level gets -1; the remaining levels count down to 0 in listing order.
    pub fn assign_comparison_vector_values(&mut self) {
        let mut next = self.num_levels() as i32 - 1;
        for level in &mut self.comparison_levels {
            if level.is_null_level {
                level.comparison_vector_value = -1;
            } else {
                level.comparison_vector_value = next;
                next -= 1;
            }
        }
    }

    /// Number of non-null levels.
    pub fn num_levels(&self) -> usize {
        self.comparison_levels.iter().filter(|l| !l.is_null_level).count()
    }

    pub fn levels_excluding_null(&self) -> impl Iterator<Item = &ComparisonLevel> {
        self.comparison_levels.iter().filter(|l| !l.is_null_level)
    }

    pub fn levels_excluding_null_mut(&mut self) -> impl Iterator<Item = &mut ComparisonLevel> {
        self.comparison_levels.iter_mut().filter(|l| !l.is_null_level)
    }

    pub fn level_by_comparison_vector_value(&self, value: i32) -> Option<&ComparisonLevel> {
        self.comparison_levels
            .iter()
            .find(|l| l.comparison_vector_value == value)
    }

    pub fn level_by_comparison_vector_value_mut(&mut self, value: i32) -> Option<&mut ComparisonLevel> {
        self.comparison_levels
            .iter_mut()
            .find(|l| l.comparison_vector_value == value)
    }

    pub fn input_columns_used(&self) -> BTreeSet<String> {
        self.comparison_levels
            .iter()
            .flat_map(|l| l.input_columns_used())
            .collect()
    }

    pub fn tf_adjustment_columns(&self) -> BTreeSet<String> {
        self.comparison_levels
            .iter()
            .filter_map(|l| l.tf_adjustment_column.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let name = &self.output_column_name;
        if name.trim().is_empty() {
            return Err(LinkageError::config("comparison output_column_name must not be empty"));
        }
        let null_levels = self.comparison_levels.iter().filter(|l| l.is_null_level).count();
        if null_levels > 1 {
            return Err(LinkageError::config(format!(
                "comparison `{name}` has {null_levels} null levels; at most one is allowed"
            )));
        }
        if self.num_levels() == 0 {
            return Err(LinkageError::config(format!(
                "comparison `{name}` must have at least one non-null level"
            )));
        }
        Ok(())
    }

    /// Set m probabilities for the non-null levels, in listing order.
    pub fn configure_m_probabilities(&mut self, probabilities: &[f64]) -> Result<()> {
        let values = self.checked_probabilities(probabilities, "m")?;
        for (level, m) in self.levels_excluding_null_mut().zip(values) {
            level.m_probability = m;
        }
        Ok(())
    }

    /// Set u probabilities for the non-null levels, in listing order.
    pub fn configure_u_probabilities(&mut self, probabilities: &[f64]) -> Result<()> {
        let values = self.checked_probabilities(probabilities, "u")?;
        for (level, u) in self.levels_excluding_null_mut().zip(values) {
            level.u_probability = u;
        }
        Ok(())
    }

    fn checked_probabilities(&self, probabilities: &[f64], which: &str) -> Result<Vec<Probability>> {
        let expected = self.num_levels();
        if probabilities.len() != expected {
            return Err(LinkageError::config(format!(
                "comparison `{}` has {expected} non-null levels but {} {which} probabilities were given",
                self.output_column_name,
                probabilities.len()
            )));
        }
        probabilities
            .iter()
            .map(|&p| {
                Probability::new(p).ok_or_else(|| {
                    LinkageError::config(format!(
                        "{which} probability {p} for `{}` is outside [0,1]",
                        self.output_column_name
                    ))
                })
            })
            .collect()
    }

    /// Copy with every unset m/u replaced by the level-count default.
    pub fn with_default_probabilities(&self) -> Self {
        let n = self.num_levels();
        let m_defaults = default_m_values(n);
        let u_defaults = default_u_values(n);
        let mut out = self.clone();
        for level in out.levels_excluding_null_mut() {
            let idx = level.comparison_vector_value.max(0) as usize;
            if level.m_probability.is_unset() {
                if let Some(&m) = m_defaults.get(idx) {
                    level.m_probability = Probability::Value(m);
                }
            }
            if level.u_probability.is_unset() {
                if let Some(&u) = u_defaults.get(idx) {
                    level.u_probability = Probability::Value(u);
                }
            }
        }
        out
    }
}
