//! Job records for both families and the status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobFailure;

use super::{JobFamily, JobId, Priority};

/// Job status
///
/// Progresses monotonically; the only backward edge is the transient-retry
/// path `failed -> queued`. Terminal records never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Validating,
    Rendering,
    #[serde(alias = "complete")]
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `to`
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(to, Queued | Running | Validating | Failed | Cancelled),
            Queued => matches!(to, Running | Validating | Failed | Cancelled),
            Running => matches!(to, Completed | Failed | Timeout | Cancelled),
            Validating => matches!(to, Rendering | Failed | Timeout | Cancelled),
            Rendering => matches!(to, Completed | Failed | Timeout | Cancelled),
            // Retry-on-transient-error re-enters the queue
            Failed => matches!(to, Queued),
            Completed | Timeout | Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Rendering => "rendering",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Fields common to every job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub id: JobId,
    pub user_id: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// 0-100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Opaque tag the event plane uses to route fan-out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_tag: Option<String>,
}

impl JobMeta {
    pub fn new(family: JobFamily, user_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: JobId::generate(family),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0,
            queue_position: None,
            request_id: None,
            subscriber_tag: None,
        }
    }

    /// Apply a guarded status transition, updating timestamps
    ///
    /// Returns false (leaving the record untouched) when the state machine
    /// forbids the edge.
    pub fn set_status(&mut self, to: JobStatus) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        if matches!(to, JobStatus::Running | JobStatus::Validating) && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.queue_position = None;
            if to == JobStatus::Completed {
                self.progress = 100;
            }
        }
        self.status = to;
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }
}

/// Assistant CLI job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmJob {
    #[serde(flatten)]
    pub meta: JobMeta,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    /// OS pid while running; consulted by zombie reclamation after a restart
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Pid of the daemon that spawned the child
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub retry_count: u32,
}

impl LlmJob {
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>, timeout_ms: u64, priority: Priority) -> Self {
        Self {
            meta: JobMeta::new(JobFamily::Llm, user_id, priority),
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            max_tokens: None,
            working_directory: None,
            timeout_ms,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
            pid: None,
            owner_pid: None,
            retry_count: 0,
        }
    }
}

/// Pattern render job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    #[serde(flatten)]
    pub meta: JobMeta,
    /// Pattern source
    pub code: String,
    pub options: RenderOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RenderResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl RenderJob {
    pub fn new(user_id: impl Into<String>, code: impl Into<String>, options: RenderOptions, priority: Priority) -> Self {
        Self {
            meta: JobMeta::new(JobFamily::Render, user_id, priority),
            code: code.into(),
            options,
            validation: None,
            result: None,
            error: None,
        }
    }
}

/// Render request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Seconds of audio to produce
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tempo: Option<f64>,
}

fn default_format() -> String {
    "wav".to_string()
}

pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [22050, 44100, 48000, 96000];

impl RenderOptions {
    pub fn new(duration: f64, sample_rate: u32, channels: u16) -> Self {
        Self {
            duration,
            sample_rate,
            channels,
            format: default_format(),
            tempo: None,
        }
    }

    /// Reject out-of-contract parameters before any record is created
    pub fn validate(&self, max_duration: f64) -> Result<(), String> {
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(format!("duration must be positive, got {}", self.duration));
        }
        if self.duration > max_duration {
            return Err(format!(
                "duration {}s exceeds the maximum of {}s",
                self.duration, max_duration
            ));
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(format!(
                "unsupported sample rate {} (supported: {:?})",
                self.sample_rate, SUPPORTED_SAMPLE_RATES
            ));
        }
        if self.channels != 1 && self.channels != 2 {
            return Err(format!("channels must be 1 or 2, got {}", self.channels));
        }
        if self.format != "wav" {
            return Err(format!("unsupported format '{}'", self.format));
        }
        Ok(())
    }
}

/// Validation outcome persisted on the render record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<ValidationIssue>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub validation_time_ms: u64,
}

/// A single validation error, with position when the parser supplies one
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

/// Successful render payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderResult {
    pub audio_base64: String,
    pub metadata: AudioMetadata,
    pub timing: RenderTiming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: String,
    /// Encoded WAV size in bytes, header included
    pub file_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderTiming {
    pub validate_ms: u64,
    pub render_ms: u64,
    pub encode_ms: u64,
    pub total_ms: u64,
}
