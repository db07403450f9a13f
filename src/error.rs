//! Error taxonomy for the control plane and the verification engine.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Malformed or incomplete reply: missing locator, unexpected status code.
    #[error("protocol error during {context}: {detail}")]
    Protocol { context: String, detail: String },

    /// The remote side reported a terminal `Error` state for an operation.
    #[error("operation '{operation}' failed: {message}")]
    Operation { operation: String, message: String },

    #[error("unable to create session: {detail}")]
    SessionCreation { detail: String },

    #[error("unable to start session (status {status}): {detail}")]
    SessionStart { status: u16, detail: String },

    #[error("profiles cannot be compared: {detail}")]
    ConfigurationMismatch { detail: String },

    #[error("traffic outage/loss out of tolerance after {rounds} round(s): {}", .failing.join(", "))]
    ToleranceExceeded { failing: Vec<String>, rounds: u32 },

    #[error("profile comparison failed with {} violation(s)", .violations.len())]
    ProfileDeviation { violations: Vec<String> },

    #[error("operation '{operation}' did not finish within {waited:?}")]
    Timeout { operation: String, waited: Duration },

    #[error("required field '{field}' is missing")]
    MissingField { field: String },

    #[error("tolerance '{field}' must be a finite, non-negative number (got {value})")]
    InvalidTolerance { field: &'static str, value: f64 },

    #[error("invalid url '{url}': {detail}")]
    InvalidUrl { url: String, detail: String },

    #[error("request to {url} failed: {detail}")]
    Transport { url: String, detail: String },

    #[error("failed to decode reply from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ControlError {
    /// Whether a whole submit-and-wait cycle may be re-run after this error.
    ///
    /// Protocol errors mean the command never started remotely, and the
    /// session/verification errors are final for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::Operation { .. }
                | ControlError::Timeout { .. }
                | ControlError::Transport { .. }
                | ControlError::Decode { .. }
        )
    }

    pub(crate) fn protocol(context: impl Into<String>, detail: impl Into<String>) -> Self {
        ControlError::Protocol {
            context: context.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let op = ControlError::Operation {
            operation: "runTest".to_string(),
            message: "port busy".to_string(),
        };
        assert!(op.is_retryable());

        let proto = ControlError::protocol("submit runTest", "missing Location header");
        assert!(!proto.is_retryable());

        let mismatch = ControlError::ConfigurationMismatch {
            detail: "3 vs 2".to_string(),
        };
        assert!(!mismatch.is_retryable());
    }

    #[test]
    fn test_tolerance_exceeded_lists_entities() {
        let err = ControlError::ToleranceExceeded {
            failing: vec!["1/1-1/2 | web".to_string(), "1/3-1/4 | dns".to_string()],
            rounds: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("3 round(s)"));
        assert!(msg.contains("1/1-1/2 | web, 1/3-1/4 | dns"));
    }
}
