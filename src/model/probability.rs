//! m/u probability values and Bayes-factor arithmetic.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serialized form of [`Probability::NotObserved`].
pub const LEVEL_NOT_OBSERVED_TEXT: &str = "level not observed";

/// A level's m or u probability.
///
/// `NotObserved` records that training ran but never saw the level, which is
/// different from a trained value of zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Probability {
    #[default]
    Unset,
    NotObserved,
    Value(f64),
}

impl Probability {
    /// Build a numeric probability, rejecting values outside [0, 1].
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Some(Self::Value(value))
        } else {
            None
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    pub fn is_not_observed(&self) -> bool {
        matches!(self, Self::NotObserved)
    }
}

impl Serialize for Probability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unset => serializer.serialize_none(),
            Self::NotObserved => serializer.serialize_str(LEVEL_NOT_OBSERVED_TEXT),
            Self::Value(v) => serializer.serialize_f64(*v),
        }
    }
}

impl<'de> Deserialize<'de> for Probability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(Self::Unset),
            Some(Repr::Number(v)) => Self::new(v)
                .ok_or_else(|| D::Error::custom(format!("probability out of range [0,1]: {v}"))),
            Some(Repr::Text(t)) if t == LEVEL_NOT_OBSERVED_TEXT => Ok(Self::NotObserved),
            Some(Repr::Text(t)) => Err(D::Error::custom(format!(
                "expected a probability or \"{LEVEL_NOT_OBSERVED_TEXT}\", got \"{t}\""
            ))),
        }
    }
}

/// A probability recorded by one training run, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedProbability {
    pub probability: Probability,
    pub description: String,
}

pub fn prob_to_bayes_factor(prob: f64) -> f64 {
    prob / (1.0 - prob)
}

pub fn bayes_factor_to_prob(bayes_factor: f64) -> f64 {
    if bayes_factor.is_infinite() {
        return 1.0;
    }
    bayes_factor / (1.0 + bayes_factor)
}

/// m/u ratio, or `None` when either side is not numeric or u is zero.
///
/// Callers treat `None` as a neutral factor of 1.
pub fn bayes_factor(m: Probability, u: Probability) -> Option<f64> {
    match (m, u) {
        (Probability::Value(m), Probability::Value(u)) if u > 0.0 => Some(m / u),
        _ => None,
    }
}
