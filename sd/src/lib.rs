//! studiod - Job Execution Core
//!
//! Server-side core of the AI-assisted creative studio. Two job families -
//! assistant CLI invocations and audio-pattern renders - run behind
//! per-family priority schedulers, with durable job state in a key-value
//! store (in-memory failover included), a per-job progress bus, and a
//! workflow orchestration layer supporting sequential, parallel,
//! self-critique, and moderated-discussion patterns.
//!
//! # Modules
//!
//! - [`domain`] - job records, identifiers, the status state machine
//! - [`store`] - durable job state over the KV adapter
//! - [`events`] - per-job progress bus
//! - [`sched`] - priority queues and the per-family scheduler loops
//! - [`process`] - assistant CLI child lifecycle and zombie reclamation
//! - [`render`] - pattern evaluation, offline synthesis, WAV encoding
//! - [`orchestrate`] - workflow graphs, self-critique, discussion
//! - [`service`] - the facade the REST/WebSocket layer consumes

pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod events;
pub mod orchestrate;
pub mod process;
pub mod render;
pub mod sched;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use domain::{JobFamily, JobId, JobStatus, LlmJob, Priority, RenderJob, RenderOptions};
pub use error::{ErrorCode, JobError, JobFailure};
pub use events::{JobEvent, ProgressBus};
pub use orchestrate::{
    run_discussion, run_self_critique, ConsensusStrategy, CritiqueConfig, CritiqueResult, DiscussionConfig,
    DiscussionResult, Executor, ExecutorRegistry, WorkflowDefinition, WorkflowEngine, WorkflowState, WorkflowStatus,
    WorkflowStep,
};
pub use process::{ProcessManager, ReclaimStats};
pub use render::{RenderEngine, SampleCache};
pub use sched::{Admission, Scheduler, SchedulerConfig};
pub use service::{
    CancelOutcome, JobService, StatusView, Submission, SubmitLlmRequest, SubmitRenderRequest,
};
pub use store::{JobPage, JobStore, JobSummary};
