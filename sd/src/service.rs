//! JobService - the facade the REST/WebSocket layer consumes
//!
//! Wires the store, schedulers, process manager, render engine, progress
//! bus, and orchestration engine together: submission with inline fast
//! path, status, cancellation, listing, event subscription, and the
//! workflow layer's LLM/render executors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use kvstore::Kv;

use crate::config::Config;
use crate::domain::{JobFamily, JobId, JobStatus, LlmJob, Priority, RenderJob, RenderOptions};
use crate::error::{ErrorCode, JobError, JobFailure};
use crate::events::{JobEvent, ProgressBus};
use crate::orchestrate::{
    ExecutionContext, Executor, ExecutorInput, ExecutorOutput, ExecutorRegistry, Health, WorkflowEngine,
    WorkflowEngineConfig,
};
use crate::process::{LlmExecutor, ProcessManager, ReclaimStats};
use crate::render::{RenderEngine, RenderEngineConfig, SampleCache};
use crate::sched::{Admission, SchedStats, Scheduler, SchedulerConfig};
use crate::store::{JobPage, JobStore};

/// LLM submission input contract
#[derive(Debug, Clone)]
pub struct SubmitLlmRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub working_directory: Option<String>,
    pub timeout_ms: Option<u64>,
    pub priority: Option<Priority>,
    pub user_id: String,
}

/// Render submission input contract
#[derive(Debug, Clone)]
pub struct SubmitRenderRequest {
    pub code: String,
    pub options: RenderOptions,
    pub priority: Option<Priority>,
    pub user_id: String,
    pub request_id: Option<String>,
}

/// Submission result: inline terminal result or queued acceptance
#[derive(Debug)]
pub enum Submission {
    /// Fast path: the job ran to a terminal state synchronously
    Inline { job_id: JobId, terminal: JobEvent },
    Accepted {
        job_id: JobId,
        status: JobStatus,
        queue_position: Option<usize>,
        estimated_wait_seconds: Option<u64>,
    },
}

impl Submission {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Inline { job_id, .. } | Self::Accepted { job_id, .. } => job_id,
        }
    }
}

/// Status query view
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusView {
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

/// Cancel outcome; idempotent on terminal jobs
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate daemon metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DaemonMetrics {
    pub llm_active: usize,
    pub llm_queued: usize,
    pub render_active: usize,
    pub render_queued: usize,
    #[serde(skip)]
    pub llm_stats: SchedStats,
    #[serde(skip)]
    pub render_stats: SchedStats,
}

/// The job execution core, fully wired
pub struct JobService {
    store: JobStore,
    bus: Arc<ProgressBus>,
    llm_scheduler: Arc<Scheduler>,
    render_scheduler: Arc<Scheduler>,
    process_manager: Arc<ProcessManager>,
    workflows: Arc<WorkflowEngine>,
    config: Config,
    shutdown_tx: watch::Sender<bool>,
}

impl JobService {
    /// Wire the subsystems and start both scheduler loops
    pub fn start(kv: Arc<dyn Kv>, config: Config) -> Arc<Self> {
        let store = JobStore::new(kv.clone());
        let bus = Arc::new(ProgressBus::new());

        let process_manager = Arc::new(ProcessManager::new(
            config.llm.command.clone(),
            config.llm.args.clone(),
        ));
        let llm_executor = Arc::new(LlmExecutor::new(
            store.clone(),
            bus.clone(),
            process_manager.clone(),
            config.llm.max_retries,
        ));
        let llm_scheduler = Arc::new(Scheduler::new(
            JobFamily::Llm,
            SchedulerConfig {
                max_concurrent: config.llm.max_concurrent,
                max_queue_size: config.llm.max_queue_size,
                tick: Duration::from_millis(config.scheduler.tick_ms),
                max_retries: config.llm.max_retries,
            },
            store.clone(),
            bus.clone(),
            llm_executor,
        ));

        let samples = Arc::new(SampleCache::new(
            config.render.sample_repo_url.clone(),
            config.render.sample_cache_dir.clone(),
        ));
        let render_engine = Arc::new(RenderEngine::new(
            store.clone(),
            bus.clone(),
            samples,
            RenderEngineConfig {
                max_pattern_length: config.render.max_pattern_length,
                render_timeout: Duration::from_millis(config.render.render_timeout_ms),
                encode_timeout: Duration::from_millis(config.render.encode_timeout_ms),
            },
        ));
        let render_scheduler = Arc::new(Scheduler::new(
            JobFamily::Render,
            SchedulerConfig {
                max_concurrent: config.render.max_concurrent,
                max_queue_size: config.render.max_queue_size,
                tick: Duration::from_millis(config.scheduler.tick_ms),
                max_retries: 0,
            },
            store.clone(),
            bus.clone(),
            render_engine,
        ));

        let registry = Arc::new(ExecutorRegistry::new());
        let workflows = Arc::new(WorkflowEngine::new(
            registry.clone(),
            kv,
            WorkflowEngineConfig {
                max_parallel_steps: config.orchestration.max_parallel_steps,
                default_step_timeout: Duration::from_millis(config.orchestration.default_step_timeout_ms),
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(llm_scheduler.clone().run(shutdown_rx.clone()));
        tokio::spawn(render_scheduler.clone().run(shutdown_rx));

        let service = Arc::new(Self {
            store,
            bus,
            llm_scheduler,
            render_scheduler,
            process_manager,
            workflows,
            config,
            shutdown_tx,
        });

        // The workflow layer consumes the job layer through these executors
        registry.register(Arc::new(LlmAgent::new(service.clone())));
        registry.register(Arc::new(RenderAgent::new(service.clone())));

        service
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn bus(&self) -> Arc<ProgressBus> {
        self.bus.clone()
    }

    pub fn workflows(&self) -> Arc<WorkflowEngine> {
        self.workflows.clone()
    }

    /// Reclaim children left behind by a previous daemon run
    pub async fn reclaim_zombies(&self) -> Result<ReclaimStats, JobError> {
        self.process_manager.reclaim_zombies(&self.store, &self.bus).await
    }

    /// Stop the scheduler loops and wait for in-flight children
    pub async fn shutdown(&self, timeout: Duration) {
        info!("job service shutting down");
        let _ = self.shutdown_tx.send(true);
        self.process_manager.wait_all(timeout).await;
    }

    // === Submission ===

    pub async fn submit_llm(&self, request: SubmitLlmRequest) -> Result<Submission, JobError> {
        self.store
            .check_rate_limit(
                JobFamily::Llm,
                &request.user_id,
                self.config.llm.rate_limit_per_minute,
                Duration::from_secs(60),
            )
            .await?;

        let mut job = LlmJob::new(
            &request.user_id,
            &request.prompt,
            request.timeout_ms.unwrap_or(self.config.llm.default_timeout_ms),
            request.priority.unwrap_or_default(),
        );
        job.system_prompt = request.system_prompt;
        job.model = request.model;
        job.max_tokens = request.max_tokens;
        job.working_directory = request.working_directory;
        job.meta.set_status(JobStatus::Queued);
        self.store.put_llm(&job).await?;

        self.admit(&self.llm_scheduler, JobFamily::Llm, &job.meta.id, &request.user_id, job.meta.priority)
            .await
    }

    pub async fn submit_render(&self, request: SubmitRenderRequest) -> Result<Submission, JobError> {
        request
            .options
            .validate(self.config.render.max_duration_secs)
            .map_err(|reason| JobError::user(ErrorCode::ValidationError, reason))?;
        self.store
            .check_rate_limit(
                JobFamily::Render,
                &request.user_id,
                self.config.render.rate_limit_per_minute,
                Duration::from_secs(60),
            )
            .await?;

        let mut job = RenderJob::new(
            &request.user_id,
            &request.code,
            request.options,
            request.priority.unwrap_or_default(),
        );
        job.meta.request_id = request.request_id;
        job.meta.set_status(JobStatus::Queued);
        self.store.put_render(&job).await?;

        self.admit(&self.render_scheduler, JobFamily::Render, &job.meta.id, &request.user_id, job.meta.priority)
            .await
    }

    async fn admit(
        &self,
        scheduler: &Arc<Scheduler>,
        family: JobFamily,
        job_id: &JobId,
        user_id: &str,
        priority: Priority,
    ) -> Result<Submission, JobError> {
        match scheduler.admit(job_id, user_id, priority).await? {
            Admission::Inline => {
                match scheduler.execute_now(job_id).await {
                    Some(terminal) => Ok(Submission::Inline {
                        job_id: job_id.clone(),
                        terminal,
                    }),
                    // A transient first attempt was requeued for retry; the
                    // fast path degrades into an accepted async job
                    None => {
                        let queue_position = scheduler.queue().position_of(job_id).await?;
                        Ok(Submission::Accepted {
                            job_id: job_id.clone(),
                            status: JobStatus::Queued,
                            queue_position,
                            estimated_wait_seconds: None,
                        })
                    }
                }
            }
            Admission::Queued {
                position,
                estimated_wait,
            } => {
                // Remember the position on the record for status queries,
                // then wake the dispatch loop
                self.update_queue_position(family, job_id, Some(position)).await;
                scheduler.poke();
                Ok(Submission::Accepted {
                    job_id: job_id.clone(),
                    status: JobStatus::Queued,
                    queue_position: Some(position),
                    estimated_wait_seconds: Some(estimated_wait.as_secs()),
                })
            }
            Admission::Full => {
                // No state record survives a rejected submission
                let key = family.job_key(job_id);
                let _ = self.store.kv().del(&key).await;
                Err(JobError::user(
                    ErrorCode::QueueFull,
                    format!("{} queue is at capacity", family),
                ))
            }
        }
    }

    async fn update_queue_position(&self, family: JobFamily, job_id: &JobId, position: Option<usize>) {
        match family {
            JobFamily::Llm => {
                if let Ok(Some(mut job)) = self.store.get_llm(job_id).await {
                    job.meta.queue_position = position;
                    let _ = self.store.put_llm(&job).await;
                }
            }
            JobFamily::Render => {
                if let Ok(Some(mut job)) = self.store.get_render(job_id).await {
                    job.meta.queue_position = position;
                    let _ = self.store.put_render(&job).await;
                }
            }
        }
    }

    // === Queries ===

    /// Status of a job, or None when unknown
    pub async fn status(&self, job_id: &JobId) -> Result<Option<StatusView>, JobError> {
        let Some(family) = job_id.family() else {
            return Ok(None);
        };

        let (meta, result, error) = match family {
            JobFamily::Llm => {
                let Some(job) = self.store.get_llm(job_id).await? else {
                    return Ok(None);
                };
                let result = (job.meta.status == JobStatus::Completed).then(|| {
                    serde_json::json!({
                        "stdout": job.stdout,
                        "stderr": job.stderr,
                        "exit_code": job.exit_code,
                    })
                });
                (job.meta, result, job.error)
            }
            JobFamily::Render => {
                let Some(job) = self.store.get_render(job_id).await? else {
                    return Ok(None);
                };
                let result = job.result.as_ref().map(|r| serde_json::to_value(r).unwrap_or_default());
                (job.meta, result, job.error)
            }
        };

        Ok(Some(StatusView {
            status: meta.status,
            progress: meta.progress,
            queue_position: meta.queue_position,
            result,
            error,
        }))
    }

    /// Cancel a job wherever it is in its lifecycle; idempotent on terminal
    /// jobs
    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome, JobError> {
        let Some(family) = job_id.family() else {
            return Ok(CancelOutcome {
                cancelled: false,
                reason: Some("unknown job id".to_string()),
            });
        };
        let Some(meta) = self.store.get_meta(job_id).await? else {
            return Ok(CancelOutcome {
                cancelled: false,
                reason: Some("not found".to_string()),
            });
        };

        if meta.is_terminal() {
            return Ok(CancelOutcome {
                cancelled: false,
                reason: Some(format!("already {}", meta.status)),
            });
        }

        let scheduler = self.scheduler_for(family);
        match meta.status {
            JobStatus::Pending | JobStatus::Queued => {
                let removed = scheduler.queue().remove(job_id).await?;
                if removed {
                    scheduler.poke();
                }
                self.mark_cancelled(family, job_id).await?;
                self.bus.emit(
                    job_id.as_str(),
                    JobEvent::Terminal {
                        status: JobStatus::Cancelled,
                        result: None,
                        error: None,
                    },
                );
                Ok(CancelOutcome {
                    cancelled: true,
                    reason: None,
                })
            }
            _ => {
                let cancelled = scheduler.cancel_running(job_id).await;
                Ok(CancelOutcome {
                    cancelled,
                    reason: (!cancelled).then(|| "job is not cancellable right now".to_string()),
                })
            }
        }
    }

    async fn mark_cancelled(&self, family: JobFamily, job_id: &JobId) -> Result<(), JobError> {
        match family {
            JobFamily::Llm => {
                if let Some(mut job) = self.store.get_llm(job_id).await? {
                    if job.meta.set_status(JobStatus::Cancelled) {
                        self.store.put_llm(&job).await?;
                    }
                }
            }
            JobFamily::Render => {
                if let Some(mut job) = self.store.get_render(job_id).await? {
                    if job.meta.set_status(JobStatus::Cancelled) {
                        self.store.put_render(&job).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// List a user's jobs, newest first
    pub async fn list(
        &self,
        user_id: &str,
        status: Option<JobStatus>,
        page: usize,
        page_size: usize,
    ) -> Result<JobPage, JobError> {
        self.store.list(user_id, status, page, page_size).await
    }

    /// Subscribe to a job's event stream
    ///
    /// A subscriber arriving after the job completed still receives a
    /// terminal event: either the bus snapshot or one synthesized from the
    /// stored record (e.g. after a daemon restart).
    pub async fn subscribe(&self, job_id: &JobId) -> tokio::sync::mpsc::Receiver<JobEvent> {
        let rx = self.bus.subscribe(job_id.as_str());
        if !self.bus.is_terminal(job_id.as_str()) {
            if let Ok(Some(view)) = self.status(job_id).await {
                if view.status.is_terminal() {
                    debug!(%job_id, "synthesizing terminal event for late subscriber");
                    self.bus.emit(
                        job_id.as_str(),
                        JobEvent::Terminal {
                            status: view.status,
                            result: view.result,
                            error: view.error,
                        },
                    );
                }
            }
        }
        rx
    }

    pub async fn metrics(&self) -> DaemonMetrics {
        DaemonMetrics {
            llm_active: self.llm_scheduler.active_count().await,
            llm_queued: self.llm_scheduler.queue().len().await.unwrap_or(0),
            render_active: self.render_scheduler.active_count().await,
            render_queued: self.render_scheduler.queue().len().await.unwrap_or(0),
            llm_stats: self.llm_scheduler.stats().await,
            render_stats: self.render_scheduler.stats().await,
        }
    }

    fn scheduler_for(&self, family: JobFamily) -> &Arc<Scheduler> {
        match family {
            JobFamily::Llm => &self.llm_scheduler,
            JobFamily::Render => &self.render_scheduler,
        }
    }

    /// Submit and wait until the job reaches a terminal event
    ///
    /// Inline submissions return immediately; queued submissions wait on
    /// the event stream.
    pub async fn submit_llm_and_wait(&self, request: SubmitLlmRequest) -> Result<JobEvent, JobError> {
        match self.submit_llm(request).await? {
            Submission::Inline { terminal, .. } => Ok(terminal),
            Submission::Accepted { job_id, .. } => self.wait_for_terminal(&job_id).await,
        }
    }

    pub async fn submit_render_and_wait(&self, request: SubmitRenderRequest) -> Result<JobEvent, JobError> {
        match self.submit_render(request).await? {
            Submission::Inline { terminal, .. } => Ok(terminal),
            Submission::Accepted { job_id, .. } => self.wait_for_terminal(&job_id).await,
        }
    }

    async fn wait_for_terminal(&self, job_id: &JobId) -> Result<JobEvent, JobError> {
        let mut rx = self.subscribe(job_id).await;
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                return Ok(event);
            }
        }
        Err(JobError::fatal(
            ErrorCode::StatePersistenceError,
            "event stream closed before terminal delivery",
        ))
    }
}

/// Workflow executor that runs steps as LLM jobs
pub struct LlmAgent {
    service: Arc<JobService>,
    in_flight: Mutex<std::collections::HashMap<String, JobId>>,
}

impl LlmAgent {
    pub fn new(service: Arc<JobService>) -> Self {
        Self {
            service,
            in_flight: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn flight_key(ctx: &ExecutionContext) -> String {
        format!("{}/{}", ctx.workflow_execution_id, ctx.step_id)
    }
}

#[async_trait]
impl Executor for LlmAgent {
    fn kind(&self) -> &str {
        "llm"
    }

    async fn execute(&self, ctx: &ExecutionContext, input: ExecutorInput) -> Result<ExecutorOutput, JobError> {
        let request = SubmitLlmRequest {
            prompt: input.prompt,
            system_prompt: input
                .params
                .get("system_prompt")
                .and_then(|v| v.as_str())
                .map(String::from),
            model: input.params.get("model").and_then(|v| v.as_str()).map(String::from),
            max_tokens: input.params.get("max_tokens").and_then(|v| v.as_u64()).map(|n| n as u32),
            working_directory: None,
            timeout_ms: ctx.timeout.map(|t| t.as_millis() as u64),
            priority: None,
            user_id: ctx.user_id.clone(),
        };

        let submission = self.service.submit_llm(request).await?;
        let job_id = submission.job_id().clone();
        self.in_flight
            .lock()
            .await
            .insert(Self::flight_key(ctx), job_id.clone());

        let terminal = match submission {
            Submission::Inline { terminal, .. } => terminal,
            Submission::Accepted { .. } => self.service.wait_for_terminal(&job_id).await?,
        };
        self.in_flight.lock().await.remove(&Self::flight_key(ctx));

        match terminal {
            JobEvent::Terminal {
                status: JobStatus::Completed,
                result,
                ..
            } => {
                let result = result.unwrap_or_default();
                let content = result
                    .get("stdout")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(ExecutorOutput { content, data: result })
            }
            JobEvent::Terminal {
                status: JobStatus::Timeout,
                ..
            } => Err(JobError::deadline("assistant job timed out")),
            JobEvent::Terminal { error, status, .. } => Err(JobError::User(error.unwrap_or_else(|| {
                JobFailure::new(ErrorCode::ValidationError, format!("assistant job ended {}", status))
            }))),
            other => Err(JobError::fatal(
                ErrorCode::StatePersistenceError,
                format!("unexpected non-terminal event {:?}", other.event_type()),
            )),
        }
    }

    async fn health_check(&self) -> Health {
        Health::Healthy
    }

    async fn cancel(&self, ctx: &ExecutionContext) {
        let job_id = self.in_flight.lock().await.get(&Self::flight_key(ctx)).cloned();
        if let Some(job_id) = job_id {
            if let Err(e) = self.service.cancel(&job_id).await {
                warn!(%job_id, error = %e, "cancelling workflow step job failed");
            }
        }
    }
}

/// Workflow executor that runs steps as render jobs
///
/// The step prompt is the pattern source; render options come from the
/// step's params (`duration`, `sample_rate`, `channels`, `tempo`).
pub struct RenderAgent {
    service: Arc<JobService>,
    in_flight: Mutex<std::collections::HashMap<String, JobId>>,
}

impl RenderAgent {
    pub fn new(service: Arc<JobService>) -> Self {
        Self {
            service,
            in_flight: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl Executor for RenderAgent {
    fn kind(&self) -> &str {
        "render"
    }

    async fn execute(&self, ctx: &ExecutionContext, input: ExecutorInput) -> Result<ExecutorOutput, JobError> {
        let mut options = RenderOptions::new(
            input.params.get("duration").and_then(|v| v.as_f64()).unwrap_or(4.0),
            input
                .params
                .get("sample_rate")
                .and_then(|v| v.as_u64())
                .unwrap_or(44_100) as u32,
            input.params.get("channels").and_then(|v| v.as_u64()).unwrap_or(2) as u16,
        );
        options.tempo = input.params.get("tempo").and_then(|v| v.as_f64());

        let request = SubmitRenderRequest {
            code: input.prompt,
            options,
            priority: None,
            user_id: ctx.user_id.clone(),
            request_id: Some(LlmAgent::flight_key(ctx)),
        };

        let submission = self.service.submit_render(request).await?;
        let job_id = submission.job_id().clone();
        self.in_flight
            .lock()
            .await
            .insert(LlmAgent::flight_key(ctx), job_id.clone());

        let terminal = match submission {
            Submission::Inline { terminal, .. } => terminal,
            Submission::Accepted { .. } => self.service.wait_for_terminal(&job_id).await?,
        };
        self.in_flight.lock().await.remove(&LlmAgent::flight_key(ctx));

        match terminal {
            JobEvent::Terminal {
                status: JobStatus::Completed,
                result,
                ..
            } => {
                let result = result.unwrap_or_default();
                let content = result
                    .get("audio_base64")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(ExecutorOutput { content, data: result })
            }
            JobEvent::Terminal {
                status: JobStatus::Timeout,
                ..
            } => Err(JobError::deadline("render job timed out")),
            JobEvent::Terminal { error, status, .. } => Err(JobError::User(error.unwrap_or_else(|| {
                JobFailure::new(ErrorCode::RenderError, format!("render job ended {}", status))
            }))),
            other => Err(JobError::fatal(
                ErrorCode::StatePersistenceError,
                format!("unexpected non-terminal event {:?}", other.event_type()),
            )),
        }
    }

    async fn cancel(&self, ctx: &ExecutionContext) {
        let job_id = self.in_flight.lock().await.get(&LlmAgent::flight_key(ctx)).cloned();
        if let Some(job_id) = job_id {
            if let Err(e) = self.service.cancel(&job_id).await {
                warn!(%job_id, error = %e, "cancelling workflow render job failed");
            }
        }
    }
}
