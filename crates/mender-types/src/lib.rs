//! Shared types and errors for the Mender execution core.
//!
//! This crate provides the foundational types used across all other Mender crates:
//! - `MenderError`: unified error taxonomy
//! - `Outcome`: tagged result returned by a stage body
//! - `StageStatus`: recorded status of an executed stage
//! - `Question`: what a paused stage needs answered before it can continue

use serde::{Deserialize, Serialize};

pub mod duration_serde;

/// Unified error type for all Mender subsystems.
#[derive(Debug, thiserror::Error)]
pub enum MenderError {
    // === Stage Errors ===
    #[error("{stage} timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Gate rejected stage '{stage}': {reason}")]
    GateRejected { stage: String, reason: String },

    #[error("Unknown workflow '{0}'")]
    UnknownWorkflow(String),

    // === Resilience Errors ===
    #[error("Circuit open for {service}, retry in {retry_in_ms}ms")]
    CircuitOpen { service: String, retry_in_ms: u64 },

    #[error("Rate limit exceeded for {service} ({window} window)")]
    RateLimitExceeded { service: String, window: String },

    #[error("Service {service} error: {message}")]
    ServiceError {
        service: String,
        message: String,
        retryable: bool,
    },

    // === Workspace Errors ===
    #[error("Command `{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MenderError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MenderError::StageTimeout { .. }
                | MenderError::RateLimitExceeded { .. }
                | MenderError::CircuitOpen { .. }
                | MenderError::CommandTimeout { .. }
                | MenderError::ServiceError { retryable: true, .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MenderError::GateRejected { .. }
                | MenderError::UnknownWorkflow(_)
                | MenderError::Config(_)
        )
    }
}

/// A convenience alias for `Result<T, MenderError>`.
pub type Result<T> = std::result::Result<T, MenderError>;

// ---------------------------------------------------------------------------
// StageStatus: recorded status of a pipeline stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Paused,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Paused => "paused",
        }
    }
}

// ---------------------------------------------------------------------------
// Question: input a paused stage is waiting for
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub prompt: String,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

impl Question {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            choices: Vec::new(),
            default: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome: what a stage body returns
// ---------------------------------------------------------------------------

/// Result of one stage body invocation.
///
/// Pausing is a value, not an error: call sites match on all three variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Completed { data: serde_json::Value },
    Failed { error: String },
    PausedForInput { questions: Vec<Question> },
}

impl Outcome {
    /// A completed outcome carrying `data` serialized to JSON.
    pub fn completed(data: impl Serialize) -> Result<Self> {
        Ok(Outcome::Completed {
            data: serde_json::to_value(data)?,
        })
    }

    /// A completed outcome with no payload.
    pub fn done() -> Self {
        Outcome::Completed {
            data: serde_json::Value::Null,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Outcome::Failed {
            error: error.into(),
        }
    }

    pub fn paused(questions: Vec<Question>) -> Self {
        Outcome::PausedForInput { questions }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_stage_timeout() {
        let err = MenderError::StageTimeout {
            stage: "Build".into(),
            timeout_ms: 1500,
        };
        assert_eq!(err.to_string(), "Build timed out after 1500ms");
    }

    #[test]
    fn error_display_gate_rejected() {
        let err = MenderError::GateRejected {
            stage: "Verify".into(),
            reason: "tests failed".into(),
        };
        assert_eq!(err.to_string(), "Gate rejected stage 'Verify': tests failed");
    }

    #[test]
    fn error_display_circuit_open() {
        let err = MenderError::CircuitOpen {
            service: "search".into(),
            retry_in_ms: 2500,
        };
        assert_eq!(err.to_string(), "Circuit open for search, retry in 2500ms");
    }

    #[test]
    fn error_display_rate_limit() {
        let err = MenderError::RateLimitExceeded {
            service: "scraper".into(),
            window: "minute".into(),
        };
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded for scraper (minute window)"
        );
    }

    #[test]
    fn retryable_timeouts_and_limits() {
        assert!(MenderError::StageTimeout {
            stage: "x".into(),
            timeout_ms: 1
        }
        .is_retryable());
        assert!(MenderError::CommandTimeout { timeout_ms: 1 }.is_retryable());
        assert!(MenderError::RateLimitExceeded {
            service: "s".into(),
            window: "day".into()
        }
        .is_retryable());
    }

    #[test]
    fn service_error_retryable_only_when_flagged() {
        let transient = MenderError::ServiceError {
            service: "docs".into(),
            message: "502".into(),
            retryable: true,
        };
        let permanent = MenderError::ServiceError {
            service: "docs".into(),
            message: "401".into(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn stage_failure_is_not_retryable_by_default() {
        let err = MenderError::StageFailed {
            stage: "fetch".into(),
            message: "boom".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_terminal());
    }

    #[test]
    fn terminal_gate_and_config_errors() {
        assert!(MenderError::Config("bad".into()).is_terminal());
        assert!(MenderError::UnknownWorkflow("nope".into()).is_terminal());
    }

    #[test]
    fn from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MenderError = io.into();
        assert!(matches!(err, MenderError::Io(_)));
    }

    #[test]
    fn outcome_completed_serializes_payload() {
        let outcome = Outcome::completed(vec![1, 2, 3]).unwrap();
        match outcome {
            Outcome::Completed { data } => assert_eq!(data, serde_json::json!([1, 2, 3])),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn outcome_tagged_json_shape() {
        let paused = Outcome::paused(vec![Question::new("Which branch?")]);
        let json = serde_json::to_value(&paused).unwrap();
        assert_eq!(json["kind"], "paused_for_input");
        assert_eq!(json["questions"][0]["prompt"], "Which branch?");
    }

    #[test]
    fn stage_status_strings() {
        assert_eq!(StageStatus::Completed.as_str(), "completed");
        assert_eq!(StageStatus::Failed.as_str(), "failed");
        assert_eq!(StageStatus::Paused.as_str(), "paused");
    }
}
