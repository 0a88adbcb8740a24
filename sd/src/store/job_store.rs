//! Job State Store
//!
//! Every job record lives under a family-namespaced key (`llm:job:<id>`,
//! `render:job:<id>`) as a JSON blob with a 24-hour TTL; terminal records
//! are only ever removed by TTL eviction. Writes that would block a state
//! transition are retried twice with short backoff before surfacing
//! STATE_PERSISTENCE_ERROR. Listings are cursor scans filtered in memory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kvstore::Kv;

use crate::domain::{JobFamily, JobId, JobMeta, JobStatus, LlmJob, Priority, RenderJob, ValidationReport};
use crate::error::{ErrorCode, JobError};

/// Job records persist for 24 hours
pub const JOB_TTL: Duration = Duration::from_secs(86_400);

/// Successful validations are reusable for 5 minutes
pub const VALIDATION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Backoff schedule for writes that gate a state transition
const WRITE_RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(500)];

/// Batch size for namespace scans
const SCAN_COUNT: usize = 100;

/// Summary fields exposed by listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub family: JobFamily,
    pub user_id: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSummary {
    fn from_meta(meta: JobMeta, family: JobFamily) -> Self {
        Self {
            id: meta.id,
            family,
            user_id: meta.user_id,
            status: meta.status,
            priority: meta.priority,
            created_at: meta.created_at,
            progress: meta.progress,
            queue_position: meta.queue_position,
            completed_at: meta.completed_at,
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub items: Vec<JobSummary>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

/// State store over the KV adapter
#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn Kv>,
}

impl JobStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> Arc<dyn Kv> {
        self.kv.clone()
    }

    /// Write a blob with the transition-gating retry schedule
    async fn write_with_retry(&self, key: &str, blob: &str, ttl: Duration) -> Result<(), JobError> {
        let mut last_err = None;
        for (attempt, delay) in std::iter::once(None)
            .chain(WRITE_RETRY_DELAYS.iter().map(Some))
            .enumerate()
        {
            if let Some(delay) = delay {
                tokio::time::sleep(*delay).await;
            }
            match self.kv.set_ex(key, blob, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(%key, attempt, error = %e, "state write failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()));
                }
            }
        }

        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "state write failed".to_string());
        Err(JobError::transient(ErrorCode::StatePersistenceError, message))
    }

    // === LLM job records ===

    pub async fn put_llm(&self, job: &LlmJob) -> Result<(), JobError> {
        let key = JobFamily::Llm.job_key(&job.meta.id);
        let blob = serde_json::to_string(job)
            .map_err(|e| JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()))?;
        debug!(id = %job.meta.id, status = %job.meta.status, "persisting llm job");
        self.write_with_retry(&key, &blob, JOB_TTL).await
    }

    pub async fn get_llm(&self, id: &JobId) -> Result<Option<LlmJob>, JobError> {
        let key = JobFamily::Llm.job_key(id);
        let Some(blob) = self.kv.get(&key).await.map_err(JobError::from)? else {
            return Ok(None);
        };
        let job = serde_json::from_str(&blob)
            .map_err(|e| JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()))?;
        Ok(Some(job))
    }

    // === Render job records ===

    pub async fn put_render(&self, job: &RenderJob) -> Result<(), JobError> {
        let key = JobFamily::Render.job_key(&job.meta.id);
        let blob = serde_json::to_string(job)
            .map_err(|e| JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()))?;
        debug!(id = %job.meta.id, status = %job.meta.status, "persisting render job");
        self.write_with_retry(&key, &blob, JOB_TTL).await
    }

    pub async fn get_render(&self, id: &JobId) -> Result<Option<RenderJob>, JobError> {
        let key = JobFamily::Render.job_key(id);
        let Some(blob) = self.kv.get(&key).await.map_err(JobError::from)? else {
            return Ok(None);
        };
        let job = serde_json::from_str(&blob)
            .map_err(|e| JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()))?;
        Ok(Some(job))
    }

    /// Common fields of any record, regardless of family
    pub async fn get_meta(&self, id: &JobId) -> Result<Option<JobMeta>, JobError> {
        let Some(family) = id.family() else {
            return Ok(None);
        };
        let key = family.job_key(id);
        let Some(blob) = self.kv.get(&key).await.map_err(JobError::from)? else {
            return Ok(None);
        };
        // The meta fields are flattened into every record, so a partial
        // deserialize recovers them from either family
        let meta: JobMeta = serde_json::from_str(&blob)
            .map_err(|e| JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()))?;
        Ok(Some(meta))
    }

    // === Listings ===

    async fn scan_family_metas(&self, family: JobFamily) -> Result<Vec<JobMeta>, JobError> {
        let pattern = family.job_scan_pattern();
        let mut metas = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self
                .kv
                .scan(&pattern, cursor, SCAN_COUNT)
                .await
                .map_err(JobError::from)?;
            for key in keys {
                if let Some(blob) = self.kv.get(&key).await.map_err(JobError::from)? {
                    match serde_json::from_str::<JobMeta>(&blob) {
                        Ok(meta) => metas.push(meta),
                        Err(e) => warn!(%key, error = %e, "skipping undecodable job record"),
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(metas)
    }

    /// List a user's jobs across both families, newest first
    pub async fn list(
        &self,
        user_id: &str,
        status: Option<JobStatus>,
        page: usize,
        page_size: usize,
    ) -> Result<JobPage, JobError> {
        let mut summaries = Vec::new();
        for family in [JobFamily::Llm, JobFamily::Render] {
            for meta in self.scan_family_metas(family).await? {
                if meta.user_id != user_id {
                    continue;
                }
                if let Some(wanted) = status {
                    if meta.status != wanted {
                        continue;
                    }
                }
                summaries.push(JobSummary::from_meta(meta, family));
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = summaries.len();
        let page = page.max(1);
        let page_size = page_size.max(1);
        let total_pages = total.div_ceil(page_size).max(1);
        let start = (page - 1) * page_size;
        let items = if start >= total {
            Vec::new()
        } else {
            summaries[start..(start + page_size).min(total)].to_vec()
        };

        Ok(JobPage {
            items,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    /// LLM records that still carry a pid, for zombie reclamation at startup
    pub async fn llm_jobs_with_pids(&self) -> Result<Vec<LlmJob>, JobError> {
        let pattern = JobFamily::Llm.job_scan_pattern();
        let mut jobs = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self
                .kv
                .scan(&pattern, cursor, SCAN_COUNT)
                .await
                .map_err(JobError::from)?;
            for key in keys {
                if let Some(blob) = self.kv.get(&key).await.map_err(JobError::from)? {
                    if let Ok(job) = serde_json::from_str::<LlmJob>(&blob) {
                        if job.pid.is_some() && !job.meta.is_terminal() {
                            jobs.push(job);
                        }
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(jobs)
    }

    // === Validation cache ===

    pub async fn get_cached_validation(&self, source_hash: &str) -> Result<Option<ValidationReport>, JobError> {
        let key = format!("render:validation:{}", source_hash);
        let Some(blob) = self.kv.get(&key).await.map_err(JobError::from)? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&blob).ok())
    }

    pub async fn put_cached_validation(
        &self,
        source_hash: &str,
        report: &ValidationReport,
    ) -> Result<(), JobError> {
        let key = format!("render:validation:{}", source_hash);
        let blob = serde_json::to_string(report)
            .map_err(|e| JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()))?;
        // Cache writes are best-effort; a miss later just re-validates
        if let Err(e) = self.kv.set_ex(&key, &blob, VALIDATION_CACHE_TTL).await {
            debug!(%key, error = %e, "validation cache write failed");
        }
        Ok(())
    }

    // === Rate limiting ===

    /// Bump and check the per-user submission counter for a family
    pub async fn check_rate_limit(
        &self,
        family: JobFamily,
        user_id: &str,
        max_per_window: u32,
        window: Duration,
    ) -> Result<(), JobError> {
        let key = format!("ratelimit:{}:{}", family.prefix(), user_id);
        let count = match self.kv.incr(&key).await {
            Ok(n) => n,
            // A counter we cannot reach must not block admission
            Err(e) if e.is_transient() => {
                debug!(%key, error = %e, "rate-limit counter unreachable, admitting");
                return Ok(());
            }
            Err(e) => return Err(JobError::from(e)),
        };
        if count == 1 {
            let _ = self.kv.expire(&key, window).await;
        }
        if count as u64 > max_per_window as u64 {
            return Err(JobError::user(
                ErrorCode::RateLimitExceeded,
                format!("{} submissions per {:?} exceeded", max_per_window, window),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RenderOptions;
    use kvstore::MemoryKv;

    fn store() -> JobStore {
        JobStore::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_llm_roundtrip() {
        let store = store();
        let job = LlmJob::new("u1", "hello", 5_000, Priority::default());
        store.put_llm(&job).await.unwrap();

        let back = store.get_llm(&job.meta.id).await.unwrap().unwrap();
        assert_eq!(back.prompt, "hello");
        assert_eq!(back.meta.user_id, "u1");
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = store();
        let id = JobId::generate(JobFamily::Llm);
        assert!(store.get_llm(&id).await.unwrap().is_none());
        assert!(store.get_meta(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_meta_readable_from_either_family() {
        let store = store();
        let render = RenderJob::new("u2", "s(\"bd\")", RenderOptions::new(1.0, 44100, 2), Priority::new(7));
        store.put_render(&render).await.unwrap();

        let meta = store.get_meta(&render.meta.id).await.unwrap().unwrap();
        assert_eq!(meta.user_id, "u2");
        assert_eq!(meta.priority, Priority::new(7));
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts_newest_first() {
        let store = store();

        let mut old = LlmJob::new("u1", "first", 1_000, Priority::default());
        old.meta.created_at = Utc::now() - chrono::Duration::seconds(60);
        store.put_llm(&old).await.unwrap();

        let newer = RenderJob::new("u1", "s(\"bd\")", RenderOptions::new(1.0, 44100, 2), Priority::default());
        store.put_render(&newer).await.unwrap();

        let other_user = LlmJob::new("u2", "not mine", 1_000, Priority::default());
        store.put_llm(&other_user).await.unwrap();

        let page = store.list("u1", None, 1, 10).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].id, newer.meta.id);
        assert_eq!(page.items[1].id, old.meta.id);
    }

    #[tokio::test]
    async fn test_list_status_filter() {
        let store = store();

        let mut running = LlmJob::new("u1", "a", 1_000, Priority::default());
        running.meta.set_status(JobStatus::Queued);
        running.meta.set_status(JobStatus::Running);
        store.put_llm(&running).await.unwrap();

        let pending = LlmJob::new("u1", "b", 1_000, Priority::default());
        store.put_llm(&pending).await.unwrap();

        let page = store.list("u1", Some(JobStatus::Running), 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, running.meta.id);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let store = store();
        for i in 0..5 {
            let mut job = LlmJob::new("u1", format!("job {}", i), 1_000, Priority::default());
            job.meta.created_at = Utc::now() - chrono::Duration::seconds(10 - i);
            store.put_llm(&job).await.unwrap();
        }

        let page1 = store.list("u1", None, 1, 2).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page1.total, 5);
        assert_eq!(page1.total_pages, 3);

        let page3 = store.list("u1", None, 3, 2).await.unwrap();
        assert_eq!(page3.items.len(), 1);

        let beyond = store.list("u1", None, 9, 2).await.unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 5);
    }

    #[tokio::test]
    async fn test_llm_jobs_with_pids() {
        let store = store();

        let mut orphaned = LlmJob::new("u1", "orphan", 1_000, Priority::default());
        orphaned.meta.set_status(JobStatus::Queued);
        orphaned.meta.set_status(JobStatus::Running);
        orphaned.pid = Some(12345);
        orphaned.owner_pid = Some(99999);
        store.put_llm(&orphaned).await.unwrap();

        let mut done = LlmJob::new("u1", "done", 1_000, Priority::default());
        done.meta.set_status(JobStatus::Queued);
        done.meta.set_status(JobStatus::Running);
        done.pid = Some(12346);
        done.meta.set_status(JobStatus::Completed);
        store.put_llm(&done).await.unwrap();

        let no_pid = LlmJob::new("u1", "fresh", 1_000, Priority::default());
        store.put_llm(&no_pid).await.unwrap();

        let found = store.llm_jobs_with_pids().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].meta.id, orphaned.meta.id);
    }

    #[tokio::test]
    async fn test_validation_cache_roundtrip() {
        let store = store();
        let report = ValidationReport {
            is_valid: true,
            errors: vec![],
            warnings: vec!["no known pattern primitive referenced".to_string()],
            validation_time_ms: 3,
        };

        store.put_cached_validation("abc123", &report).await.unwrap();
        let cached = store.get_cached_validation("abc123").await.unwrap().unwrap();
        assert!(cached.is_valid);
        assert_eq!(cached.warnings.len(), 1);

        assert!(store.get_cached_validation("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_after_max() {
        let store = store();
        for _ in 0..3 {
            store
                .check_rate_limit(JobFamily::Render, "u1", 3, Duration::from_secs(60))
                .await
                .unwrap();
        }

        let err = store
            .check_rate_limit(JobFamily::Render, "u1", 3, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);

        // A different user is unaffected
        store
            .check_rate_limit(JobFamily::Render, "u2", 3, Duration::from_secs(60))
            .await
            .unwrap();
    }
}
