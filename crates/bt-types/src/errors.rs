use thiserror::Error;

/// Main error type for the bt tuning harness
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("{failed} of {total} trials did not complete successfully: {trial_ids:?}")]
    TrialsFailed {
        failed: usize,
        total: usize,
        trial_ids: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Search-space and search-algorithm errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid domain for parameter {parameter}: {message}")]
    InvalidDomain { parameter: String, message: String },

    #[error("Duplicate parameter in search space: {parameter}")]
    DuplicateParameter { parameter: String },

    #[error("Configuration is missing parameter: {parameter}")]
    MissingParameter { parameter: String },

    #[error("Value {value} is outside the domain of parameter {parameter}")]
    OutOfDomain { parameter: String, value: String },

    #[error("Got {points} warm-start points but {rewards} evaluated rewards")]
    RewardCountMismatch { points: usize, rewards: usize },

    #[error("Search algorithm {algorithm} was built for {expected} but the experiment uses {actual}")]
    PropertyConflict {
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Search algorithm {algorithm} has no search space")]
    MissingSpace { algorithm: String },

    #[error("Search algorithm {algorithm} keeps waiting while no trial is running")]
    Stalled { algorithm: String },

    #[error("Evaluated reward {index} is not finite: {value}")]
    InvalidReward { index: usize, value: f64 },

    #[error("Surrogate model failure: {message}")]
    Surrogate { message: String },
}

/// Errors raised from inside an objective function
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Objective failed: {message}")]
    Objective { message: String },

    #[error("Objective panicked: {message}")]
    Panicked { message: String },

    #[error("Missing config key: {key}")]
    MissingKey { key: String },

    #[error("Config key {key} has the wrong type, expected {expected}")]
    WrongType { key: String, expected: String },
}

impl TrialError {
    pub fn objective(message: impl Into<String>) -> Self {
        Self::Objective {
            message: message.into(),
        }
    }
}

/// Runtime context errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Worker pool could not be started: {message}")]
    PoolBuild { message: String },

    #[error("Runtime {namespace} has been shut down")]
    ShutDown { namespace: String },

    #[error("Invalid runtime configuration: {message}")]
    InvalidConfig { message: String },
}

/// Result type alias for tuning operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}
