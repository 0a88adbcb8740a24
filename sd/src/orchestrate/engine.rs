//! Workflow graph execution
//!
//! Ready-set scheduling over the dependency graph: steps whose dependencies
//! have all completed run concurrently up to `max_parallel_steps`, each
//! through its registered executor with per-step timeout and retry policy.
//! Outputs land in the shared context through the context actor. State
//! persists to the KV store on every transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use kvstore::Kv;

use crate::error::{ErrorCode, JobError, JobFailure};

use super::context::{is_truthy, ContextHandle};
use super::executor::{ExecutionContext, ExecutorInput, ExecutorOutput, ExecutorRegistry};
use super::template;
use super::types::{StepStatus, WorkflowDefinition, WorkflowState, WorkflowStatus, WorkflowStep};

/// Workflow state records share the job TTL
const STATE_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone)]
pub struct WorkflowEngineConfig {
    pub max_parallel_steps: usize,
    pub default_step_timeout: Duration,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
            default_step_timeout: Duration::from_secs(300),
        }
    }
}

struct WorkflowControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

struct StepOutcome {
    step_id: String,
    retries_used: u32,
    result: Result<ExecutorOutput, JobError>,
}

/// Executes workflow graphs over registered executors
pub struct WorkflowEngine {
    registry: Arc<ExecutorRegistry>,
    kv: Arc<dyn Kv>,
    config: WorkflowEngineConfig,
    controls: Mutex<HashMap<String, Arc<WorkflowControl>>>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<ExecutorRegistry>, kv: Arc<dyn Kv>, config: WorkflowEngineConfig) -> Self {
        Self {
            registry,
            kv,
            config,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<ExecutorRegistry> {
        self.registry.clone()
    }

    fn state_key(execution_id: &str) -> String {
        format!("workflow:state:{}", execution_id)
    }

    async fn persist(&self, state: &WorkflowState) {
        match serde_json::to_string(state) {
            Ok(blob) => {
                if let Err(e) = self.kv.set_ex(&Self::state_key(&state.execution_id), &blob, STATE_TTL).await {
                    warn!(execution_id = %state.execution_id, error = %e, "workflow state write failed");
                }
            }
            Err(e) => warn!(execution_id = %state.execution_id, error = %e, "workflow state serialize failed"),
        }
    }

    /// Load persisted state for an execution
    pub async fn state(&self, execution_id: &str) -> Result<Option<WorkflowState>, JobError> {
        let Some(blob) = self.kv.get(&Self::state_key(execution_id)).await.map_err(JobError::from)? else {
            return Ok(None);
        };
        serde_json::from_str(&blob)
            .map(Some)
            .map_err(|e| JobError::fatal(ErrorCode::StatePersistenceError, e.to_string()))
    }

    /// Validate the graph and create the execution record
    pub async fn submit(
        &self,
        definition: &WorkflowDefinition,
        user_id: &str,
        initial_context: serde_json::Value,
    ) -> Result<WorkflowState, JobError> {
        if let Err(problems) = definition.validate() {
            return Err(JobError::user(
                ErrorCode::ValidationError,
                format!("invalid workflow: {}", problems.join("; ")),
            ));
        }

        let state = WorkflowState::new(definition, user_id, initial_context);
        self.persist(&state).await;
        info!(
            execution_id = %state.execution_id,
            workflow_id = %definition.id,
            steps = definition.steps.len(),
            "workflow submitted"
        );
        Ok(state)
    }

    /// Submit and run to a terminal state
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        user_id: &str,
        initial_context: serde_json::Value,
    ) -> Result<WorkflowState, JobError> {
        let state = self.submit(definition, user_id, initial_context).await?;
        self.run(definition, &state.execution_id).await
    }

    /// Request cooperative cancellation
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let controls = self.controls.lock().await;
        match controls.get(execution_id) {
            Some(control) => {
                control.cancelled.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Suspend scheduling of new steps; in-flight steps keep running
    pub async fn pause(&self, execution_id: &str) -> bool {
        let controls = self.controls.lock().await;
        match controls.get(execution_id) {
            Some(control) => {
                control.paused.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub async fn resume(&self, execution_id: &str) -> bool {
        let controls = self.controls.lock().await;
        match controls.get(execution_id) {
            Some(control) => {
                control.paused.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drive a submitted execution to a terminal state
    pub async fn run(&self, definition: &WorkflowDefinition, execution_id: &str) -> Result<WorkflowState, JobError> {
        let mut state = self
            .state(execution_id)
            .await?
            .ok_or_else(|| JobError::user(ErrorCode::NotFound, format!("execution {} not found", execution_id)))?;

        let control = Arc::new(WorkflowControl {
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        });
        self.controls
            .lock()
            .await
            .insert(execution_id.to_string(), control.clone());

        state.status = WorkflowStatus::Running;
        self.persist(&state).await;

        let ctx = ContextHandle::spawn(state.context.clone());
        let steps: HashMap<&str, &WorkflowStep> = definition.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let max_parallel = definition
            .max_parallel_steps
            .unwrap_or(self.config.max_parallel_steps)
            .max(1);

        let mut in_flight: JoinSet<StepOutcome> = JoinSet::new();
        let mut running_ctxs: HashMap<String, ExecutionContext> = HashMap::new();
        let mut hard_failure: Option<JobFailure> = None;

        'drive: loop {
            if control.cancelled.load(Ordering::Relaxed) {
                break 'drive;
            }

            // Schedule every ready step, respecting the parallelism cap
            if !control.paused.load(Ordering::Relaxed) {
                let ready: Vec<&WorkflowStep> = definition
                    .steps
                    .iter()
                    .filter(|step| {
                        state.step_states.get(&step.id).is_some_and(|s| s.status == StepStatus::Pending)
                            && step.dependencies.iter().all(|dep| {
                                state
                                    .step_states
                                    .get(dep)
                                    .is_some_and(|s| s.status == StepStatus::Completed)
                            })
                    })
                    .collect();

                for step in ready {
                    if running_ctxs.len() >= max_parallel {
                        break;
                    }

                    // Condition gate
                    if let Some(cond) = &step.condition {
                        let value = ctx.get(cond).await.unwrap_or(serde_json::Value::Null);
                        if !is_truthy(&value) {
                            debug!(execution_id, step = %step.id, "condition falsy, skipping step");
                            let entry = state.step_states.entry(step.id.clone()).or_default();
                            entry.status = StepStatus::Skipped;
                            entry.completed_at = Some(Utc::now());
                            state.recompute_progress();
                            self.persist(&state).await;
                            continue;
                        }
                    }

                    match self.launch_step(step, execution_id, &state.user_id, &ctx, &mut in_flight).await {
                        Ok(exec_ctx) => {
                            let entry = state.step_states.entry(step.id.clone()).or_default();
                            entry.status = StepStatus::Running;
                            entry.started_at = Some(Utc::now());
                            state.current_steps.push(step.id.clone());
                            running_ctxs.insert(step.id.clone(), exec_ctx);
                            self.persist(&state).await;
                        }
                        Err(error) => {
                            let failure = error.into_failure();
                            let entry = state.step_states.entry(step.id.clone()).or_default();
                            entry.status = StepStatus::Failed;
                            entry.error = Some(failure.clone());
                            entry.completed_at = Some(Utc::now());
                            state.recompute_progress();
                            self.persist(&state).await;
                            if !step.continue_on_error {
                                hard_failure = Some(failure);
                                break 'drive;
                            }
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                if control.paused.load(Ordering::Relaxed) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                // Nothing running, nothing ready: the workflow is done
                break;
            }

            let outcome = tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(outcome)) => outcome,
                    Some(Err(join_err)) => {
                        warn!(execution_id, error = %join_err, "step task panicked");
                        continue;
                    }
                    None => continue,
                },
                _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
            };

            let step = steps.get(outcome.step_id.as_str()).copied();
            running_ctxs.remove(&outcome.step_id);
            state.current_steps.retain(|id| id != &outcome.step_id);

            let entry = state.step_states.entry(outcome.step_id.clone()).or_default();
            entry.retry_count = outcome.retries_used;
            entry.completed_at = Some(Utc::now());

            match outcome.result {
                Ok(output) => {
                    entry.status = StepStatus::Completed;
                    entry.result = Some(serde_json::json!({
                        "content": output.content,
                        "data": output.data,
                    }));
                    self.write_outputs(step, &outcome.step_id, &output, &ctx).await;
                    debug!(execution_id, step = %outcome.step_id, "step completed");
                }
                Err(error) => {
                    let failure = error.into_failure();
                    entry.status = StepStatus::Failed;
                    entry.error = Some(failure.clone());
                    let soft = step.is_some_and(|s| s.continue_on_error);
                    if soft {
                        // Outputs of a soft-failed step are simply absent
                        debug!(execution_id, step = %outcome.step_id, "step failed, continuing");
                    } else {
                        warn!(execution_id, step = %outcome.step_id, code = %failure.code, "step failed, aborting workflow");
                        hard_failure = Some(failure);
                        state.recompute_progress();
                        self.persist(&state).await;
                        break 'drive;
                    }
                }
            }

            state.recompute_progress();
            self.persist(&state).await;
        }

        // Wind down: signal executors for anything still in flight, then drop
        // the tasks
        if !running_ctxs.is_empty() {
            for (step_id, exec_ctx) in &running_ctxs {
                if let Some(step) = steps.get(step_id.as_str()) {
                    if let Some(executor) = self.registry.get(&step.agent_type) {
                        executor.cancel(exec_ctx).await;
                    }
                }
                if let Some(entry) = state.step_states.get_mut(step_id.as_str()) {
                    entry.status = StepStatus::Failed;
                    entry.error = Some(JobFailure::new(ErrorCode::ValidationError, "workflow stopped"));
                    entry.completed_at = Some(Utc::now());
                }
            }
            in_flight.abort_all();
        }
        state.current_steps.clear();

        // Terminal status
        state.status = if control.cancelled.load(Ordering::Relaxed) {
            WorkflowStatus::Cancelled
        } else if hard_failure.is_some() {
            WorkflowStatus::Failed
        } else {
            // Steps left pending are unreachable (their dependencies failed
            // soft or were skipped)
            for step_state in state.step_states.values_mut() {
                if step_state.status == StepStatus::Pending {
                    step_state.status = StepStatus::Skipped;
                }
            }
            WorkflowStatus::Completed
        };
        state.context = ctx.snapshot().await;
        state.completed_at = Some(Utc::now());
        state.recompute_progress();
        self.persist(&state).await;
        self.controls.lock().await.remove(execution_id);

        info!(execution_id, status = ?state.status, "workflow finished");
        Ok(state)
    }

    /// Run the self-critique pattern over the registered LLM executor
    pub async fn self_critique(
        &self,
        user_id: &str,
        task_prompt: &str,
        config: &super::critique::CritiqueConfig,
    ) -> Result<super::critique::CritiqueResult, JobError> {
        let executor = self.registry.get("llm").ok_or_else(|| {
            JobError::user(ErrorCode::ValidationError, "no llm executor registered")
        })?;
        let ctx = ExecutionContext {
            workflow_execution_id: format!("critique-{}", uuid::Uuid::now_v7()),
            step_id: "self-critique".to_string(),
            user_id: user_id.to_string(),
            timeout: Some(self.config.default_step_timeout),
        };
        super::critique::run_self_critique(executor, &ctx, task_prompt, config).await
    }

    /// Run the moderated-discussion pattern over registered executors
    pub async fn discussion(
        &self,
        user_id: &str,
        topic: &str,
        config: &super::discussion::DiscussionConfig,
    ) -> Result<super::discussion::DiscussionResult, JobError> {
        let ctx = ExecutionContext {
            workflow_execution_id: format!("discussion-{}", uuid::Uuid::now_v7()),
            step_id: "discussion".to_string(),
            user_id: user_id.to_string(),
            timeout: Some(self.config.default_step_timeout),
        };
        super::discussion::run_discussion(&self.registry, &ctx, topic, config).await
    }

    /// Resolve inputs, render the prompt, and spawn the step task
    async fn launch_step(
        &self,
        step: &WorkflowStep,
        execution_id: &str,
        user_id: &str,
        ctx: &ContextHandle,
        in_flight: &mut JoinSet<StepOutcome>,
    ) -> Result<ExecutionContext, JobError> {
        let executor = self.registry.get(&step.agent_type).ok_or_else(|| {
            JobError::user(
                ErrorCode::ValidationError,
                format!("no executor registered for kind '{}'", step.agent_type),
            )
        })?;

        // The variable map: the context snapshot with declared inputs
        // overlaid at top level
        let mut vars = ctx.snapshot().await;
        for binding in &step.inputs {
            let value = match &binding.from {
                super::types::InputSource::Context { path } => ctx.get(path).await,
                super::types::InputSource::Step { step_id, path } => {
                    let base = match path {
                        Some(sub) => format!("steps.{}.{}", step_id, sub),
                        None => format!("steps.{}.output", step_id),
                    };
                    ctx.get(&base).await
                }
                super::types::InputSource::Literal { value } => Some(value.clone()),
            };
            if let Some(obj) = vars.as_object_mut() {
                obj.insert(binding.name.clone(), value.unwrap_or(serde_json::Value::Null));
            }
        }

        let prompt_template = step
            .prompt
            .clone()
            .or_else(|| step.template_ref.clone())
            .unwrap_or_default();
        let prompt = template::render(&prompt_template, &vars)?;

        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_step_timeout);
        let exec_ctx = ExecutionContext {
            workflow_execution_id: execution_id.to_string(),
            step_id: step.id.clone(),
            user_id: user_id.to_string(),
            timeout: Some(timeout),
        };

        let retry_policy = step.retry_policy.clone().unwrap_or_default();
        let params = serde_json::to_value(&step.agent_ref).unwrap_or(serde_json::Value::Null);
        let step_id = step.id.clone();
        let task_ctx = exec_ctx.clone();

        in_flight.spawn(async move {
            let mut attempt = 0u32;
            loop {
                let input = ExecutorInput {
                    prompt: prompt.clone(),
                    params: params.clone(),
                };
                let result = match tokio::time::timeout(timeout, executor.execute(&task_ctx, input)).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        // Deadlines are not retried
                        executor.cancel(&task_ctx).await;
                        return StepOutcome {
                            step_id,
                            retries_used: attempt,
                            result: Err(JobError::deadline(format!(
                                "step exceeded {:?}",
                                timeout
                            ))),
                        };
                    }
                };

                match result {
                    Ok(output) => {
                        return StepOutcome {
                            step_id,
                            retries_used: attempt,
                            result: Ok(output),
                        };
                    }
                    Err(error) if error.is_transient() && attempt < retry_policy.max_retries => {
                        let delay = retry_policy.delay(attempt);
                        debug!(step = %step_id, attempt, ?delay, "transient step failure, backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(error) => {
                        return StepOutcome {
                            step_id,
                            retries_used: attempt,
                            result: Err(error),
                        };
                    }
                }
            }
        });

        Ok(exec_ctx)
    }

    /// Write a completed step's outputs into the context
    async fn write_outputs(
        &self,
        step: Option<&WorkflowStep>,
        step_id: &str,
        output: &ExecutorOutput,
        ctx: &ContextHandle,
    ) {
        ctx.set(
            &format!("steps.{}.output", step_id),
            serde_json::Value::String(output.content.clone()),
        )
        .await;
        if !output.data.is_null() {
            ctx.set(&format!("steps.{}.data", step_id), output.data.clone()).await;
        }

        if let Some(step) = step {
            for binding in &step.outputs {
                let value = if binding.name == "content" {
                    serde_json::Value::String(output.content.clone())
                } else {
                    output
                        .data
                        .get(&binding.name)
                        .cloned()
                        .unwrap_or_else(|| serde_json::Value::String(output.content.clone()))
                };
                ctx.set(&binding.context_path, value).await;
            }
        }
    }
}
