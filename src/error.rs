//! Custom error types for the crate.
//!
//! `DaqError` is the single error type shared by the transport, driver and
//! measurement layers. The variants follow the fault taxonomy of the system:
//!
//! - **`Transport`**: link-level faults (connection lost, write/read failed).
//!   These are the only retryable faults; the retry wrapper absorbs them up
//!   to its attempt budget before escalating.
//! - **`Protocol`**: malformed or unexpected response content. Never retried,
//!   surfaced on the first attempt.
//! - **`Timeout`**: a fetch-loop or query budget was exceeded. Carries the
//!   elapsed budget for diagnostics.
//! - **`Validation`**: a caller-supplied configuration value is outside its
//!   documented physical range. Raised immediately, aborts `configure()`.
//! - **`Instrument`**: a nonzero error record reported by the instrument's
//!   own error queue, surfaced by the engine's error-state checks.
//! - **`Driver`**: escalation wrapper attaching the instrument model to a
//!   fault that escaped the retry budget.
//!
//! A tripped compliance limit is deliberately *not* an error: it is a state
//! machine signal carried as a [`StopReason`](crate::measurement::StopReason).

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout exceeded after {elapsed:.3?}")]
    Timeout { elapsed: Duration },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Instrument error {code}: {message}")]
    Instrument { code: i32, message: String },

    #[error("{model}: {source}")]
    Driver {
        model: &'static str,
        #[source]
        source: Box<DaqError>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No source instrument bound for role '{0}'")]
    NoSourceInstrument(String),

    #[error("No driver for model '{0}'")]
    UnknownModel(String),

    #[error("Resource '{0}' requires a transport that is not enabled")]
    UnsupportedResource(String),
}

impl DaqError {
    /// A fault is retryable only at the transport level. Validation and
    /// protocol faults always propagate on the first attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DaqError::Transport(_) | DaqError::Io(_) => true,
            DaqError::Driver { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// True for faults the engine may recover from with a reconnection
    /// cycle, once they have escaped the retry budget.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            DaqError::Transport(_) | DaqError::Io(_) | DaqError::Timeout { .. } => true,
            DaqError::Driver { source, .. } => source.is_connection_fault(),
            _ => false,
        }
    }

    /// Attach the instrument model that produced this fault. Already-wrapped
    /// faults keep their original attribution.
    pub fn for_model(self, model: &'static str) -> Self {
        match self {
            err @ DaqError::Driver { .. } => err,
            other => DaqError::Driver {
                model,
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_faults_are_retryable() {
        assert!(DaqError::Transport("link down".into()).is_retryable());
        assert!(!DaqError::Protocol("garbage".into()).is_retryable());
        assert!(!DaqError::Validation("out of range".into()).is_retryable());
        assert!(!DaqError::Timeout {
            elapsed: Duration::from_secs(10)
        }
        .is_retryable());
    }

    #[test]
    fn model_attribution_is_not_nested() {
        let err = DaqError::Transport("lost".into())
            .for_model("K2400")
            .for_model("K2470");
        match err {
            DaqError::Driver { model, .. } => assert_eq!(model, "K2400"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn wrapped_faults_keep_retryability() {
        let err = DaqError::Transport("lost".into()).for_model("K2400");
        assert!(err.is_retryable());
        let err = DaqError::Protocol("bad".into()).for_model("K2400");
        assert!(!err.is_retryable());
    }
}
