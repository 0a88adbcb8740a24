//! Progress event types

use serde::{Deserialize, Serialize};

use crate::domain::JobStatus;
use crate::error::JobFailure;

/// An event on a job's progress stream
///
/// Per job the stream is totally ordered `(queued)* -> (progress)* ->
/// terminal`; exactly one terminal event is emitted per accepted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobEvent {
    Queued {
        position: usize,
        queue_length: usize,
    },
    Progress {
        status: JobStatus,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Terminal {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<JobFailure>,
    },
}

impl JobEvent {
    pub fn progress(status: JobStatus, progress: u8) -> Self {
        Self::Progress {
            status,
            progress,
            message: None,
        }
    }

    pub fn progress_with_message(status: JobStatus, progress: u8, message: impl Into<String>) -> Self {
        Self::Progress {
            status,
            progress,
            message: Some(message.into()),
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self::Terminal {
            status: JobStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(status: JobStatus, error: JobFailure) -> Self {
        Self::Terminal {
            status,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Progress { .. } => "progress",
            Self::Terminal { .. } => "terminal",
        }
    }
}
