//! LLM family executor
//!
//! Bridges the scheduler to the process manager: transitions the record to
//! `running`, persists the child pid for zombie reclamation, maps the
//! process outcome onto the record, and applies the transient-retry policy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{JobId, JobStatus};
use crate::error::{ErrorCode, JobFailure};
use crate::events::{JobEvent, ProgressBus};
use crate::sched::{ExecutionResult, JobExecutor};
use crate::store::JobStore;

use super::manager::{ProcessManager, ProcessOutcome};

pub struct LlmExecutor {
    store: JobStore,
    bus: Arc<ProgressBus>,
    manager: Arc<ProcessManager>,
    max_retries: u32,
}

impl LlmExecutor {
    pub fn new(store: JobStore, bus: Arc<ProgressBus>, manager: Arc<ProcessManager>, max_retries: u32) -> Self {
        Self {
            store,
            bus,
            manager,
            max_retries,
        }
    }

    pub fn manager(&self) -> Arc<ProcessManager> {
        self.manager.clone()
    }
}

#[async_trait]
impl JobExecutor for LlmExecutor {
    async fn execute(&self, job_id: &JobId) -> ExecutionResult {
        let Ok(Some(mut job)) = self.store.get_llm(job_id).await else {
            return ExecutionResult::Dropped;
        };
        if job.meta.status != JobStatus::Queued {
            debug!(id = %job_id, status = %job.meta.status, "llm job not in queued state, dropping");
            return ExecutionResult::Dropped;
        }

        job.meta.set_status(JobStatus::Running);
        if let Err(e) = self.store.put_llm(&job).await {
            let failure = e.into_failure();
            job.error = Some(failure.clone());
            job.meta.set_status(JobStatus::Failed);
            let _ = self.store.put_llm(&job).await;
            return ExecutionResult::Terminal(JobEvent::failed(JobStatus::Failed, failure));
        }
        self.bus
            .emit(job_id.as_str(), JobEvent::progress(JobStatus::Running, 0));

        // Persist the pid as soon as the child exists so a restarted daemon
        // can reclaim it. The manager runs against its own copy of the
        // record so the pid write below does not alias it.
        let (pid_tx, mut pid_rx) = tokio::sync::oneshot::channel();
        let exec_job = job.clone();
        let exec_fut = self.manager.execute(&exec_job, move |pid| {
            let _ = pid_tx.send(pid);
        });
        tokio::pin!(exec_fut);

        let mut pid_seen = false;
        let outcome = loop {
            tokio::select! {
                pid = &mut pid_rx, if !pid_seen => {
                    pid_seen = true;
                    if let Ok(pid) = pid {
                        job.pid = Some(pid);
                        job.owner_pid = Some(std::process::id());
                        if let Err(e) = self.store.put_llm(&job).await {
                            warn!(id = %job_id, error = %e, "failed persisting child pid");
                        }
                    }
                }
                outcome = &mut exec_fut => break outcome,
            }
        };

        job.pid = None;
        job.owner_pid = None;

        match outcome {
            Ok(ProcessOutcome::Completed {
                stdout,
                stderr,
                exit_code,
            }) => {
                job.stdout = stdout;
                job.stderr = stderr;
                job.exit_code = Some(exit_code);
                job.meta.set_status(JobStatus::Completed);
                if let Err(e) = self.store.put_llm(&job).await {
                    let failure = e.into_failure();
                    return ExecutionResult::Terminal(JobEvent::failed(JobStatus::Failed, failure));
                }
                ExecutionResult::Terminal(JobEvent::completed(serde_json::json!({
                    "stdout": job.stdout,
                    "stderr": job.stderr,
                    "exit_code": exit_code,
                })))
            }
            Ok(ProcessOutcome::Failed {
                stdout,
                stderr,
                exit_code,
            }) => {
                job.stdout = stdout;
                job.stderr = stderr.clone();
                job.exit_code = Some(exit_code);
                let failure = JobFailure::new(
                    ErrorCode::SpawnFailed,
                    format!("assistant exited with code {}", exit_code),
                )
                .with_details(serde_json::json!({
                    "exit_code": exit_code,
                    "stderr": stderr.chars().take(512).collect::<String>(),
                }));
                job.error = Some(failure.clone());
                job.meta.set_status(JobStatus::Failed);
                let _ = self.store.put_llm(&job).await;
                ExecutionResult::Terminal(JobEvent::failed(JobStatus::Failed, failure))
            }
            Ok(ProcessOutcome::TimedOut) => {
                let failure = JobFailure::new(
                    ErrorCode::TimeoutError,
                    format!("assistant exceeded {} ms", job.timeout_ms),
                );
                job.error = Some(failure.clone());
                job.meta.set_status(JobStatus::Timeout);
                let _ = self.store.put_llm(&job).await;
                ExecutionResult::Terminal(JobEvent::failed(JobStatus::Timeout, failure))
            }
            Ok(ProcessOutcome::Cancelled) => {
                job.meta.set_status(JobStatus::Cancelled);
                let _ = self.store.put_llm(&job).await;
                ExecutionResult::Terminal(JobEvent::Terminal {
                    status: JobStatus::Cancelled,
                    result: None,
                    error: None,
                })
            }
            Err(error) => {
                // Transient spawn problems re-enter the queue, bounded by
                // the retry budget on the record
                if error.is_transient() && job.retry_count < self.max_retries {
                    job.retry_count += 1;
                    job.meta.set_status(JobStatus::Failed);
                    job.meta.set_status(JobStatus::Queued);
                    if let Err(e) = self.store.put_llm(&job).await {
                        warn!(id = %job_id, error = %e, "failed persisting retry state");
                        let failure = e.into_failure();
                        return ExecutionResult::Terminal(JobEvent::failed(JobStatus::Failed, failure));
                    }
                    debug!(id = %job_id, retry = job.retry_count, "transient failure, requeueing");
                    return ExecutionResult::Retry;
                }

                let failure = error.into_failure();
                job.error = Some(failure.clone());
                job.meta.set_status(JobStatus::Failed);
                let _ = self.store.put_llm(&job).await;
                ExecutionResult::Terminal(JobEvent::failed(JobStatus::Failed, failure))
            }
        }
    }

    async fn cancel(&self, job_id: &JobId) -> bool {
        self.manager.cancel(job_id.as_str()).await
    }
}
