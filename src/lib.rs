#![forbid(unsafe_code)]

//! # linkage-harness
//!
//! Unsupervised probabilistic record linkage in the Fellegi-Sunter framework.
//!
//! Candidate record pairs are generated by blocking rules, reduced to discrete
//! comparison vectors (one agreement level per compared field) and scored by
//! m/u probabilities. This crate covers the parameter-estimation side:
//! - blocking-rule cost analysis before the expensive comparison step
//! - u-probability estimation from a random sample of pairs
//! - expectation maximisation training sessions that fold their results back
//!   into the canonical model
//!
//! Query execution is delegated to a [`backend::DatabaseApi`]; an in-process
//! SQLite implementation ships with the crate.

pub mod analyse_blocking;
pub mod backend;
pub mod blocking;
pub mod comparison_vectors;
pub mod em_training_session;
pub mod error;
pub mod estimate_u;
pub mod expectation_maximisation;
pub mod linker;
pub mod model;
pub mod params;

pub use analyse_blocking::{CumulativeComparisons, CumulativeComparisonsRecord};
pub use backend::{DatabaseApi, Record, SqliteBackend, StagedTable, Table};
pub use blocking::BlockingRule;
pub use em_training_session::{EmTrainingOptions, EmTrainingSession};
pub use error::{LinkageError, Result};
pub use linker::{InputTable, Linker};
pub use model::{Comparison, ComparisonLevel, CoreModelSettings, LinkType, Probability, Settings};
pub use params::ParameterHistory;
