//! Error types for oxn.
//!
//! A single taxonomy rooted at [`OxnError`] enforces the system boundaries:
//! every external collaborator (container runtime, metric backend, trace
//! backend, load generator, store) gets its own subkind so failures surface
//! to the user as one concise line naming the boundary plus an accumulated
//! explanation.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum OxnError {
    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("Metric backend error: {0}")]
    MetricBackend(#[from] MetricBackendError),

    #[error("Trace backend error: {0}")]
    TraceBackend(#[from] TraceBackendError),

    #[error("Load generation error: {0}")]
    LoadGen(#[from] LoadGenError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Validation failure with all accumulated diagnostic messages.
    #[error("{message}: {explanation}")]
    Validation {
        message: String,
        explanation: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OxnError {
    /// Build a validation error from a message and the accumulated
    /// diagnostics joined with newlines.
    pub fn validation(message: impl Into<String>, messages: &[String]) -> Self {
        OxnError::Validation {
            message: message.into(),
            explanation: messages.join("\n"),
        }
    }

    /// Build a validation error with a single explanation string.
    pub fn validation_explained(
        message: impl Into<String>,
        explanation: impl Into<String>,
    ) -> Self {
        OxnError::Validation {
            message: message.into(),
            explanation: explanation.into(),
        }
    }
}

/// Errors at the boundary to the container runtime and the compose tool.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Error while validating the sue composition: {explanation}")]
    Validation { explanation: String },

    #[error("Cannot connect to docker daemon: {0}")]
    Connection(String),

    #[error("Compose command failed: {explanation}")]
    ComposeCommand { explanation: String },

    #[error("Error while building the sue: container {container} not found")]
    MissingContainer { container: String },

    #[error("Error while building the sue: could not build the sue within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

/// Errors at the boundary to the metrics backend (Prometheus HTTP API).
#[derive(Debug, thiserror::Error)]
pub enum MetricBackendError {
    #[error("Error while talking to Prometheus at {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Cannot create a data frame from an empty Prometheus response: {explanation}")]
    EmptyResponse { explanation: String },

    #[error("Unexpected response shape from Prometheus: {explanation}")]
    Shape { explanation: String },
}

/// Errors at the boundary to the trace backend (Jaeger HTTP API).
#[derive(Debug, thiserror::Error)]
pub enum TraceBackendError {
    #[error("Error while talking to Jaeger at {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Jaeger sent an empty response: {explanation}")]
    EmptyResponse { explanation: String },

    #[error("Unexpected response shape from Jaeger: {explanation}")]
    Shape { explanation: String },
}

/// Errors from the load generator driver.
#[derive(Debug, thiserror::Error)]
pub enum LoadGenError {
    #[error("Load generator failed to start: {0}")]
    Startup(String),

    #[error("Load generator failed to stop: {0}")]
    Shutdown(String),
}

/// Errors from the persistent time-series store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No table stored under key {key}")]
    MissingKey { key: String },

    #[error("Cannot read store file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write store file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
