//! Model representation: comparisons, levels, probabilities and settings.

pub mod comparison;
pub mod probability;
pub mod settings;

pub use comparison::{default_m_values, default_u_values, Comparison, ComparisonLevel};
pub use probability::{
    bayes_factor, bayes_factor_to_prob, prob_to_bayes_factor, Probability, TrainedProbability,
    LEVEL_NOT_OBSERVED_TEXT,
};
pub use settings::{CoreModelSettings, LinkType, Settings};
