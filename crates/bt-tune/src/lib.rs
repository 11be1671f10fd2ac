//! # bt-tune
//!
//! Hyperparameter search behind a pluggable search-algorithm interface.
//!
//! Provides search space definitions, random and Gaussian-process Bayesian
//! search with warm starts, a concurrency limiter, trial tracking, a worker
//! pool runtime, and the experiment driver that ties them together.

pub mod demo;

mod analysis;
mod bayes;
mod limiter;
mod report;
mod runner;
mod runtime;
mod search;
mod trial;

pub use analysis::{ExperimentAnalysis, Scope};
pub use bayes::{Acquisition, BayesOptConfig, BayesOptSearch};
pub use limiter::ConcurrencyLimiter;
pub use report::{Objective, Reporter, StopCriteria, TrialDecision, TRAINING_ITERATION};
pub use runner::{run_experiment, ExperimentConfig};
pub use runtime::{Runtime, RuntimeConfig};
pub use search::{
    ParameterDef, ParameterKind, RandomSearch, SearchAlgorithm, SearchSpace, Suggestion,
};
pub use trial::{ExperimentId, Trial, TrialId, TrialResult, TrialStatus};

pub use bt_types::{
    format_config, Config, Metrics, Mode, ParameterValue, SearchError, TrialError, TuneError,
    TuneResult,
};
