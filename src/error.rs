//! Error types for the monitoring layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or loading monitoring components.
///
/// None of these cross the `Monitoring` port: agent failures are absorbed
/// inside `initialize()` and the caller's own operation output is passed
/// through untouched.
#[derive(Error, Debug)]
pub enum Error {
    /// Identifier does not follow the capitalized naming convention
    #[error("Invalid name '{value}': {reason}")]
    InvalidName { value: String, reason: String },

    /// Segment name is not of the form `A/B/C`
    #[error("Invalid segment name '{0}': expected three '/'-separated parts")]
    InvalidSegmentName(String),

    /// The APM agent could not be loaded
    #[error("APM agent load failed: {0}")]
    AgentLoad(String),

    /// The APM agent loaded but rejected its configuration
    #[error("APM agent configuration failed: {0}")]
    AgentConfiguration(String),

    /// Prometheus registry error
    #[error("Prometheus registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
