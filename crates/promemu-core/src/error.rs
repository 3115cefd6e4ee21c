use thiserror::Error;

/// Errors that terminate the process or abort a fallible setup step.
///
/// Scenario runtime errors, event-bus callback errors and gateway transport
/// errors are deliberately not part of this enum: per the propagation
/// policy they are logged and absorbed by their caller, never raised here.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid metric config for '{name}': {reason}")]
    InvalidMetricConfig { name: String, reason: String },

    #[error("invalid host config for '{name}': {reason}")]
    InvalidHostConfig { name: String, reason: String },

    #[error("duplicate host '{host}' in job '{job}'")]
    DuplicateHostInJob { job: String, host: String },

    #[error("scenario validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("gateway transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no hosts in mixer config")]
    EmptyHostList,
}

/// Raised directly by scenarios when invoked with out-of-contract
/// parameters. Not absorbed: scenarios validate eagerly and propagate.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{scenario}: period must be > 0, got {value}")]
    NonPositivePeriod { scenario: &'static str, value: f64 },

    #[error("{scenario}: {field} must be > 0, got {value}")]
    NonPositive {
        scenario: &'static str,
        field: &'static str,
        value: f64,
    },

    #[error("{scenario}: start_time must be >= 0, got {value}")]
    NegativeStartTime { scenario: &'static str, value: f64 },

    #[error("variety_selection: values and varieties must have the same length ({values} vs {varieties})")]
    MismatchedLengths { values: usize, varieties: usize },

    #[error("variety_selection: weights must be non-negative")]
    NegativeWeight,

    #[error("variety_selection: at least one weight must be > 0")]
    AllWeightsZero,

    #[error("variety_selection: change_probability must be in [0, 1], got {0}")]
    ProbabilityOutOfRange(f64),

    #[error("update_by_trend: step_range must satisfy 0 <= min <= max, got ({0}, {1})")]
    InvalidStepRange(f64, f64),

    #[error("calc_percent_usage: value_range must satisfy min < max, got ({0}, {1})")]
    InvalidPercentRange(f64, f64),

    #[error("size_to_bytes: {0}")]
    SizeParse(String),
}

/// Raised by the mixer's HTTP interactions with the Pushgateway. Always
/// logged and absorbed by the push/cleanup loop; never propagated to the
/// caller of `run_until_complete`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("push to job '{job}' failed: {source}")]
    Push {
        job: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("delete of job '{job}' failed: {source}")]
    Delete {
        job: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("listing metrics failed: {0}")]
    List(#[source] reqwest::Error),

    #[error("gateway returned unexpected response for '{endpoint}': {status}")]
    UnexpectedStatus { endpoint: String, status: u16 },

    #[error("building or encoding job registry for '{job}' failed: {source}")]
    Registry {
        job: String,
        #[source]
        source: prometheus::Error,
    },
}

/// Errors raised while resolving or building a host population.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown population '{name}', available: {available}")]
    UnknownPopulation { name: String, available: String },

    #[error("failed to build population '{name}': {reason}")]
    BuildFailed { name: String, reason: String },
}
