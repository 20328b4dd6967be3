//! Typed failures for the runtime paths of the gateway.
//!
//! Startup uses `anyhow` with context; everything a request can hit while the
//! process is running is one of the enums below so the HTTP layer can decide
//! how to report it.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::InferencePath;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("TLS {artifact} not readable at {path}: {source}")]
    TlsMaterial {
        artifact: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS {artifact} at {path} is empty")]
    EmptyTlsMaterial {
        artifact: &'static str,
        path: PathBuf,
    },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("client request failed: {0}")]
    Request(String),

    #[error("network loop is not running")]
    LoopStopped,
}

// ---------------------------------------------------------------------------
// Ingest payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not a sensor object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is JSON {found}, expected an object")]
    NotAnObject { found: &'static str },

    #[error("{field} must be {expected} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Learned model
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("failed to read model artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model artifact {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid model artifact: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("expected {expected} features, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("feature {index} is '{got}', model expects '{expected}'")]
    FeatureMismatch {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("feature {index} is not finite")]
    NonFinite { index: usize },
}

// ---------------------------------------------------------------------------
// Estimators
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("invalid estimator input: {0}")]
    InvalidInput(String),

    #[error("{path} inference failed: {source}")]
    Inference {
        path: InferencePath,
        #[source]
        source: ModelError,
    },

    #[error("all inference paths failed: {}", join_errors(.0))]
    Exhausted(Vec<EstimateError>),
}

fn join_errors(errors: &[EstimateError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Weather collaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("weather service answered {0}")]
    Status(u16),

    #[error("no weather data for today")]
    NoDataForToday,

    #[error("weather snapshot is not usable: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Decision cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error(transparent)]
    Weather(#[from] WeatherError),

    #[error("both estimators failed (physical: {physical}; learned: {learned})")]
    BothEstimatorsFailed {
        physical: EstimateError,
        learned: EstimateError,
    },
}
