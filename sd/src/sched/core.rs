//! Scheduler core
//!
//! One scheduler per job family. Admission runs jobs inline while a
//! concurrency slot is free and queues them otherwise; the dispatch loop
//! wakes on a tick or an enqueue notify, pops the priority queue, refreshes
//! queue positions, and drives the family executor. Terminal events are
//! emitted from exactly one place so every accepted job produces exactly one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::domain::{JobFamily, JobId, JobStatus, Priority};
use crate::error::JobError;
use crate::events::{JobEvent, ProgressBus};
use crate::store::JobStore;

use super::queue::{JobQueue, QueueEntry};

/// Per-family scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    /// Dispatch loop wake interval
    pub tick: Duration,
    /// Transient-failure retries before a job stays failed
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queue_size: 100,
            tick: Duration::from_secs(1),
            max_retries: 2,
        }
    }
}

/// Outcome of an admission attempt
#[derive(Debug)]
pub enum Admission {
    /// A slot was reserved; the caller runs the job inline
    Inline,
    /// Queued behind running work
    Queued {
        position: usize,
        estimated_wait: Duration,
    },
    /// Queue at capacity; the submission is rejected
    Full,
}

/// What the family executor did with a dequeued job
#[derive(Debug)]
pub enum ExecutionResult {
    /// Terminal record persisted; the scheduler emits this event
    Terminal(JobEvent),
    /// Transient failure; the record was reset to queued for another attempt
    Retry,
    /// Record missing or no longer queued; nothing to do
    Dropped,
}

/// Family executor the scheduler dispatches to
///
/// Implementations transition the record out of `queued`, run the work,
/// persist the terminal record, and hand back the terminal event. Progress
/// events along the way are theirs to emit; the terminal event is not.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job_id: &JobId) -> ExecutionResult;

    /// Signal cooperative cancellation of a running job
    async fn cancel(&self, job_id: &JobId) -> bool;
}

/// Scheduler counters, bucketed by terminal outcome
#[derive(Debug, Default, Clone)]
pub struct SchedStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timeout: u64,
    pub total_cancelled: u64,
    pub total_retried: u64,
    pub peak_concurrent: usize,
    pub peak_queue_depth: usize,
    total_exec_ms: u64,
}

impl SchedStats {
    /// Moving average used for queue-wait estimates
    fn avg_exec_ms(&self) -> u64 {
        if self.total_completed > 0 {
            self.total_exec_ms / self.total_completed
        } else {
            30_000
        }
    }
}

struct SchedInner {
    active: HashSet<String>,
    /// Slots held by the dispatch loop between capacity check and pop
    reserved: usize,
    stats: SchedStats,
}

impl SchedInner {
    fn in_use(&self) -> usize {
        self.active.len() + self.reserved
    }
}

/// Cooperative dispatch loop for one job family
pub struct Scheduler {
    family: JobFamily,
    config: SchedulerConfig,
    queue: JobQueue,
    store: JobStore,
    bus: Arc<ProgressBus>,
    executor: Arc<dyn JobExecutor>,
    inner: Mutex<SchedInner>,
    notify: Notify,
}

impl Scheduler {
    pub fn new(
        family: JobFamily,
        config: SchedulerConfig,
        store: JobStore,
        bus: Arc<ProgressBus>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let queue = JobQueue::new(store.kv(), family);
        Self {
            family,
            config,
            queue,
            store,
            bus,
            executor,
            inner: Mutex::new(SchedInner {
                active: HashSet::new(),
                reserved: 0,
                stats: SchedStats::default(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn family(&self) -> JobFamily {
        self.family
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn stats(&self) -> SchedStats {
        self.inner.lock().await.stats.clone()
    }

    /// Admit a new submission
    ///
    /// Under capacity the job gets a reserved slot and runs inline via
    /// [`execute_now`](Self::execute_now); otherwise it is enqueued (the
    /// caller must already have persisted the record as `queued`). A full
    /// queue rejects the submission before any state exists.
    pub async fn admit(&self, job_id: &JobId, user_id: &str, priority: Priority) -> Result<Admission, JobError> {
        {
            let mut inner = self.inner.lock().await;
            inner.stats.total_submitted += 1;
            if inner.in_use() < self.config.max_concurrent {
                inner.active.insert(job_id.as_str().to_string());
                let active = inner.active.len();
                inner.stats.peak_concurrent = inner.stats.peak_concurrent.max(active);
                debug!(family = %self.family, %job_id, "admitted inline");
                return Ok(Admission::Inline);
            }
        }

        let depth = self.queue.len().await?;
        if depth >= self.config.max_queue_size {
            debug!(family = %self.family, %job_id, depth, "queue full");
            return Ok(Admission::Full);
        }

        let entry = QueueEntry {
            job_id: job_id.clone(),
            user_id: user_id.to_string(),
            priority,
            enqueued_at: Utc::now().timestamp_millis(),
        };
        let position = self.queue.enqueue(&entry).await?;

        let (estimated_wait, queue_length) = {
            let inner = self.inner.lock().await;
            let avg = inner.stats.avg_exec_ms();
            let wait = Duration::from_millis(position as u64 * avg / self.config.max_concurrent.max(1) as u64);
            (wait, depth + 1)
        };
        {
            let mut inner = self.inner.lock().await;
            inner.stats.peak_queue_depth = inner.stats.peak_queue_depth.max(queue_length);
        }

        self.bus.emit(
            job_id.as_str(),
            JobEvent::Queued {
                position,
                queue_length,
            },
        );

        // The caller pokes the loop once it has finished persisting; the
        // tick covers the gap regardless
        debug!(family = %self.family, %job_id, position, ?estimated_wait, "queued");
        Ok(Admission::Queued {
            position,
            estimated_wait,
        })
    }

    /// Run a job whose slot was reserved by [`admit`](Self::admit)
    ///
    /// Returns the terminal event when the job reached one on this path.
    pub async fn execute_now(&self, job_id: &JobId) -> Option<JobEvent> {
        let started = Instant::now();
        let result = self.executor.execute(job_id).await;
        let event = self.settle(job_id, result, started.elapsed()).await;
        self.release(job_id).await;
        event
    }

    /// Route a cancel request for a running job to the executor
    pub async fn cancel_running(&self, job_id: &JobId) -> bool {
        self.executor.cancel(job_id).await
    }

    /// Wake the dispatch loop (used after out-of-band queue edits)
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    /// The dispatch loop; runs until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(family = %self.family, max_concurrent = self.config.max_concurrent, "scheduler loop started");
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.drain().await;
        }
        info!(family = %self.family, "scheduler loop stopped");
    }

    /// Dispatch queued jobs while slots and entries remain
    async fn drain(self: &Arc<Self>) {
        loop {
            // Hold a reservation across the pop so an inline admission
            // cannot steal the slot in between
            {
                let mut inner = self.inner.lock().await;
                if inner.in_use() >= self.config.max_concurrent {
                    return;
                }
                inner.reserved += 1;
            }

            let entry = match self.queue.pop().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.inner.lock().await.reserved -= 1;
                    return;
                }
                Err(e) => {
                    self.inner.lock().await.reserved -= 1;
                    warn!(family = %self.family, error = %e, "queue pop failed");
                    return;
                }
            };

            {
                let mut inner = self.inner.lock().await;
                inner.reserved -= 1;
                inner.active.insert(entry.job_id.as_str().to_string());
                let in_use = inner.in_use();
                inner.stats.peak_concurrent = inner.stats.peak_concurrent.max(in_use);
            }

            self.refresh_queue_positions().await;

            // Drop entries whose record vanished or moved on (e.g. cancelled
            // while queued)
            match self.store.get_meta(&entry.job_id).await {
                Ok(Some(meta)) if meta.status == JobStatus::Queued => {}
                Ok(_) | Err(_) => {
                    debug!(family = %self.family, id = %entry.job_id, "dropping stale queue entry");
                    self.release(&entry.job_id).await;
                    continue;
                }
            }

            let scheduler = self.clone();
            let job_id = entry.job_id.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = scheduler.executor.execute(&job_id).await;
                scheduler.settle(&job_id, result, started.elapsed()).await;
                scheduler.release(&job_id).await;
            });
        }
    }

    /// Record the execution result: emit the terminal event, bump metric
    /// buckets, or re-enqueue a retry
    async fn settle(&self, job_id: &JobId, result: ExecutionResult, elapsed: Duration) -> Option<JobEvent> {
        match result {
            ExecutionResult::Terminal(event) => {
                {
                    let mut inner = self.inner.lock().await;
                    if let JobEvent::Terminal { status, .. } = &event {
                        match status {
                            JobStatus::Completed => {
                                inner.stats.total_completed += 1;
                                inner.stats.total_exec_ms += elapsed.as_millis() as u64;
                            }
                            JobStatus::Timeout => inner.stats.total_timeout += 1,
                            JobStatus::Cancelled => inner.stats.total_cancelled += 1,
                            _ => inner.stats.total_failed += 1,
                        }
                    }
                }
                self.bus.emit(job_id.as_str(), event.clone());
                Some(event)
            }
            ExecutionResult::Retry => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.stats.total_retried += 1;
                }
                if let Err(e) = self.requeue(job_id).await {
                    warn!(family = %self.family, %job_id, error = %e, "requeue failed");
                }
                None
            }
            ExecutionResult::Dropped => None,
        }
    }

    async fn requeue(&self, job_id: &JobId) -> Result<(), JobError> {
        let Some(meta) = self.store.get_meta(job_id).await? else {
            return Ok(());
        };
        let entry = QueueEntry {
            job_id: job_id.clone(),
            user_id: meta.user_id,
            priority: meta.priority,
            enqueued_at: Utc::now().timestamp_millis(),
        };
        let position = self.queue.enqueue(&entry).await?;
        let queue_length = self.queue.len().await?;
        self.bus.emit(
            job_id.as_str(),
            JobEvent::Queued {
                position,
                queue_length,
            },
        );
        self.notify.notify_one();
        Ok(())
    }

    async fn release(&self, job_id: &JobId) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(job_id.as_str());
        drop(inner);
        self.notify.notify_one();
    }

    /// Emit refreshed positions to everything still waiting in line
    async fn refresh_queue_positions(&self) {
        let entries = match self.queue.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(family = %self.family, error = %e, "queue position refresh failed");
                return;
            }
        };
        let queue_length = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            self.bus.emit(
                entry.job_id.as_str(),
                JobEvent::Queued {
                    position: i + 1,
                    queue_length,
                },
            );
        }
    }
}
