//! Error taxonomy for the job execution core
//!
//! Every executor returns a [`JobError`] whose variant classifies how the
//! failure propagates: user errors surface immediately, transient errors are
//! retried with bounded backoff, deadline errors are never retried, and
//! fatal errors fail the affected job without crashing the daemon.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SyntaxError,
    PatternTooLong,
    ValidationError,
    NotAPattern,
    TranspileError,
    RenderError,
    TimeoutError,
    CliUnavailable,
    SpawnFailed,
    RateLimitExceeded,
    QueueFull,
    StatePersistenceError,
    NotFound,
    Forbidden,
    AlreadyCompleted,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::PatternTooLong => "PATTERN_TOO_LONG",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotAPattern => "NOT_A_PATTERN",
            Self::TranspileError => "TRANSPILE_ERROR",
            Self::RenderError => "RENDER_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::CliUnavailable => "CLI_UNAVAILABLE",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::QueueFull => "QUEUE_FULL",
            Self::StatePersistenceError => "STATE_PERSISTENCE_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::AlreadyCompleted => "ALREADY_COMPLETED",
        };
        write!(f, "{}", s)
    }
}

/// User-visible failure payload persisted on terminal records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Classified job error; the variant drives retry/propagation behavior
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Bad input or over-limits; surfaced without retry
    #[error("{0}")]
    User(JobFailure),

    /// Infrastructure hiccup; retried with bounded backoff, then degraded
    /// or surfaced
    #[error("{0}")]
    Transient(JobFailure),

    /// Deadline expired; never retried
    #[error("{0}")]
    Deadline(JobFailure),

    /// Internal invariant violation; fails the job, logged at error severity
    #[error("{0}")]
    Fatal(JobFailure),
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl JobError {
    pub fn user(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::User(JobFailure::new(code, message))
    }

    pub fn transient(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Transient(JobFailure::new(code, message))
    }

    pub fn deadline(message: impl Into<String>) -> Self {
        Self::Deadline(JobFailure::new(ErrorCode::TimeoutError, message))
    }

    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Fatal(JobFailure::new(code, message))
    }

    pub fn failure(&self) -> &JobFailure {
        match self {
            Self::User(f) | Self::Transient(f) | Self::Deadline(f) | Self::Fatal(f) => f,
        }
    }

    pub fn into_failure(self) -> JobFailure {
        match self {
            Self::User(f) | Self::Transient(f) | Self::Deadline(f) | Self::Fatal(f) => f,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.failure().code
    }

    /// Whether a retry against the same input may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::Deadline(_))
    }
}

impl From<kvstore::KvError> for JobError {
    fn from(e: kvstore::KvError) -> Self {
        if e.is_transient() {
            Self::transient(ErrorCode::StatePersistenceError, e.to_string())
        } else {
            Self::fatal(ErrorCode::StatePersistenceError, e.to_string())
        }
    }
}
