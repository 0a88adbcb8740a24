//! Durable job state, keyed in the KV store

mod job_store;

pub use job_store::{JobPage, JobStore, JobSummary, JOB_TTL, VALIDATION_CACHE_TTL};
