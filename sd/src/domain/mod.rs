//! Domain model: job records, identifiers, priorities, and the status
//! state machine shared by both job families

mod id;
mod job;
mod priority;

pub use id::{JobFamily, JobId};
pub use job::{
    AudioMetadata, JobMeta, JobStatus, LlmJob, RenderJob, RenderOptions, RenderResult, RenderTiming,
    ValidationIssue, ValidationReport,
};
pub use priority::Priority;
