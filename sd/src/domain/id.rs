//! Job identifiers
//!
//! All job IDs use the format `{family}-{uuid}`, e.g.
//! `llm-01927f3e-8a2b-7c90-b1a4-3d5e6f708192`. The family prefix keys the
//! state-store namespace and the per-family scheduler.

use serde::{Deserialize, Serialize};

/// The two job families the core executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobFamily {
    Llm,
    Render,
}

impl JobFamily {
    /// ID and key-namespace prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Render => "render",
        }
    }

    /// State-store key for a job of this family
    pub fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix(), id.as_str())
    }

    /// Sorted-set key of this family's priority queue
    pub fn queue_key(&self) -> String {
        format!("{}:queue", self.prefix())
    }

    /// Scan pattern covering every job record of this family
    pub fn job_scan_pattern(&self) -> String {
        format!("{}:job:*", self.prefix())
    }
}

impl std::fmt::Display for JobFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Family-prefixed job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh ID for the given family
    pub fn generate(family: JobFamily) -> Self {
        Self(format!("{}-{}", family.prefix(), uuid::Uuid::now_v7()))
    }

    /// Wrap an existing ID string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The family encoded in the prefix, if recognizable
    pub fn family(&self) -> Option<JobFamily> {
        if self.0.starts_with("llm-") {
            Some(JobFamily::Llm)
        } else if self.0.starts_with("render-") {
            Some(JobFamily::Render)
        } else {
            None
        }
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_carries_family_prefix() {
        let id = JobId::generate(JobFamily::Llm);
        assert!(id.as_str().starts_with("llm-"));
        assert_eq!(id.family(), Some(JobFamily::Llm));

        let id = JobId::generate(JobFamily::Render);
        assert!(id.as_str().starts_with("render-"));
        assert_eq!(id.family(), Some(JobFamily::Render));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = JobId::generate(JobFamily::Llm);
        let b = JobId::generate(JobFamily::Llm);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_prefix_has_no_family() {
        let id = JobId::from_string("workflow-123".to_string());
        assert_eq!(id.family(), None);
    }

    #[test]
    fn test_key_layout() {
        let id = JobId::from_string("render-abc".to_string());
        assert_eq!(JobFamily::Render.job_key(&id), "render:job:render-abc");
        assert_eq!(JobFamily::Render.queue_key(), "render:queue");
        assert_eq!(JobFamily::Llm.job_scan_pattern(), "llm:job:*");
    }

    #[test]
    fn test_serde_transparent() {
        let id = JobId::from_string("llm-xyz".to_string());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"llm-xyz\"");
    }
}
