//! KV-backed priority queue
//!
//! One sorted set per family. The score is `-(priority) * 1e15 +
//! enqueued_at_ms`, so higher priority sorts first and equal priorities
//! dequeue FIFO. Members are small JSON blobs carrying the queue-entry
//! fields; removal by job id scans for the matching member before `zrem`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use kvstore::Kv;

use crate::domain::{JobFamily, JobId, Priority};
use crate::error::JobError;

/// Priority dominates the timestamp in the score by 15 orders of magnitude
const PRIORITY_WEIGHT: f64 = 1e15;

/// An entry in a family's priority queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub user_id: String,
    pub priority: Priority,
    /// Milliseconds since the Unix epoch at enqueue time
    pub enqueued_at: i64,
}

impl QueueEntry {
    pub fn score(&self) -> f64 {
        -(self.priority.value() as f64) * PRIORITY_WEIGHT + self.enqueued_at as f64
    }
}

/// Priority queue for one job family
#[derive(Clone)]
pub struct JobQueue {
    kv: Arc<dyn Kv>,
    family: JobFamily,
}

impl JobQueue {
    pub fn new(kv: Arc<dyn Kv>, family: JobFamily) -> Self {
        Self { kv, family }
    }

    fn key(&self) -> String {
        self.family.queue_key()
    }

    /// Push an entry; returns its 1-based position after insertion
    pub async fn enqueue(&self, entry: &QueueEntry) -> Result<usize, JobError> {
        let member = serde_json::to_string(entry)
            .map_err(|e| JobError::fatal(crate::error::ErrorCode::StatePersistenceError, e.to_string()))?;
        self.kv
            .zadd(&self.key(), &member, entry.score())
            .await
            .map_err(JobError::from)?;

        let position = self
            .position_of(&entry.job_id)
            .await?
            .unwrap_or(1);
        debug!(family = %self.family, id = %entry.job_id, position, "enqueued");
        Ok(position)
    }

    /// Pop the highest-priority (lowest-score) entry
    pub async fn pop(&self) -> Result<Option<QueueEntry>, JobError> {
        let Some(z) = self.kv.zpopmin(&self.key()).await.map_err(JobError::from)? else {
            return Ok(None);
        };
        match serde_json::from_str(&z.member) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // An undecodable member cannot be dispatched; drop it
                tracing::warn!(family = %self.family, error = %e, "dropping undecodable queue member");
                Ok(None)
            }
        }
    }

    /// Remove the entry for a job id; true if one was present
    pub async fn remove(&self, job_id: &JobId) -> Result<bool, JobError> {
        for (entry, member) in self.entries_raw().await? {
            if &entry.job_id == job_id {
                return self.kv.zrem(&self.key(), &member).await.map_err(JobError::from);
            }
        }
        Ok(false)
    }

    pub async fn len(&self) -> Result<usize, JobError> {
        self.kv.zcard(&self.key()).await.map_err(JobError::from)
    }

    pub async fn is_empty(&self) -> Result<bool, JobError> {
        Ok(self.len().await? == 0)
    }

    /// All entries in dequeue order
    pub async fn entries(&self) -> Result<Vec<QueueEntry>, JobError> {
        Ok(self.entries_raw().await?.into_iter().map(|(e, _)| e).collect())
    }

    async fn entries_raw(&self) -> Result<Vec<(QueueEntry, String)>, JobError> {
        let zs = self
            .kv
            .zrange(&self.key(), 0, -1)
            .await
            .map_err(JobError::from)?;
        Ok(zs
            .into_iter()
            .filter_map(|z| {
                serde_json::from_str::<QueueEntry>(&z.member)
                    .ok()
                    .map(|e| (e, z.member))
            })
            .collect())
    }

    /// 1-based position of a job in dequeue order
    pub async fn position_of(&self, job_id: &JobId) -> Result<Option<usize>, JobError> {
        let entries = self.entries().await?;
        Ok(entries
            .iter()
            .position(|e| &e.job_id == job_id)
            .map(|i| i + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryKv;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryKv::new()), JobFamily::Render)
    }

    fn entry(id: &str, priority: u8, enqueued_at: i64) -> QueueEntry {
        QueueEntry {
            job_id: JobId::from(id),
            user_id: "u1".to_string(),
            priority: Priority::new(priority),
            enqueued_at,
        }
    }

    #[tokio::test]
    async fn test_fifo_on_equal_priority() {
        let q = queue();
        q.enqueue(&entry("render-a", 0, 1_000)).await.unwrap();
        q.enqueue(&entry("render-b", 0, 2_000)).await.unwrap();

        assert_eq!(q.pop().await.unwrap().unwrap().job_id.as_str(), "render-a");
        assert_eq!(q.pop().await.unwrap().unwrap().job_id.as_str(), "render-b");
        assert!(q.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_higher_priority_jumps_queue() {
        let q = queue();
        q.enqueue(&entry("render-a", 0, 1_000)).await.unwrap();
        q.enqueue(&entry("render-b", 0, 2_000)).await.unwrap();
        let pos = q.enqueue(&entry("render-c", 50, 3_000)).await.unwrap();
        assert_eq!(pos, 1);

        // Dequeue order is C, A, B
        assert_eq!(q.pop().await.unwrap().unwrap().job_id.as_str(), "render-c");
        assert_eq!(q.pop().await.unwrap().unwrap().job_id.as_str(), "render-a");
        assert_eq!(q.pop().await.unwrap().unwrap().job_id.as_str(), "render-b");
    }

    #[tokio::test]
    async fn test_enqueue_reports_position() {
        let q = queue();
        assert_eq!(q.enqueue(&entry("render-a", 0, 1_000)).await.unwrap(), 1);
        assert_eq!(q.enqueue(&entry("render-b", 0, 2_000)).await.unwrap(), 2);
        assert_eq!(q.enqueue(&entry("render-c", 10, 3_000)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let q = queue();
        q.enqueue(&entry("render-a", 0, 1_000)).await.unwrap();
        q.enqueue(&entry("render-b", 0, 2_000)).await.unwrap();

        assert!(q.remove(&JobId::from("render-a")).await.unwrap());
        assert!(!q.remove(&JobId::from("render-a")).await.unwrap());
        assert_eq!(q.len().await.unwrap(), 1);
        assert_eq!(q.pop().await.unwrap().unwrap().job_id.as_str(), "render-b");
    }

    #[tokio::test]
    async fn test_position_of() {
        let q = queue();
        q.enqueue(&entry("render-a", 0, 1_000)).await.unwrap();
        q.enqueue(&entry("render-b", 0, 2_000)).await.unwrap();

        assert_eq!(q.position_of(&JobId::from("render-b")).await.unwrap(), Some(2));
        assert_eq!(q.position_of(&JobId::from("render-x")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_score_formula() {
        let high = entry("a", 100, 5_000);
        let low = entry("b", 0, 1_000);
        assert!(high.score() < low.score());

        let first = entry("c", 10, 1_000);
        let second = entry("d", 10, 2_000);
        assert!(first.score() < second.score());
    }

    #[tokio::test]
    async fn test_queues_are_per_family() {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let llm = JobQueue::new(kv.clone(), JobFamily::Llm);
        let render = JobQueue::new(kv.clone(), JobFamily::Render);

        llm.enqueue(&entry("llm-a", 0, 1_000)).await.unwrap();
        assert_eq!(llm.len().await.unwrap(), 1);
        assert_eq!(render.len().await.unwrap(), 0);
    }
}
