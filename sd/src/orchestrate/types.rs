//! Workflow definitions and execution state

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobFailure;

/// Where a step input comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum InputSource {
    /// A dot-path into the shared context
    Context { path: String },
    /// A prior step's output, optionally a path inside it
    Step {
        step_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// A literal value
    Literal { value: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputBinding {
    pub name: String,
    #[serde(flatten)]
    pub from: InputSource,
}

/// Writes a step output into the context at `context_path`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputBinding {
    pub name: String,
    pub context_path: String,
}

/// Exponential backoff retry policy for a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based): `initial * multiplier^n`,
    /// capped at `max_delay_ms`
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(raw.min(self.max_delay_ms as f64) as u64)
    }
}

/// One node of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Executor kind: "llm", "render", or a registered custom kind
    pub agent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<String>,
    /// Prompt template with `{{var}}` placeholders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    #[serde(default)]
    pub outputs: Vec<OutputBinding>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Context path that must hold a truthy value for the step to run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            agent_ref: None,
            prompt: Some(prompt.into()),
            template_ref: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            timeout_ms: None,
            retry_policy: None,
            condition: None,
            continue_on_error: false,
        }
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, context_path: impl Into<String>) -> Self {
        self.outputs.push(OutputBinding {
            name: name.into(),
            context_path: context_path.into(),
        });
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, from: InputSource) -> Self {
        self.inputs.push(InputBinding {
            name: name.into(),
            from,
        });
        self
    }
}

/// A workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps,
            max_parallel_steps: None,
        }
    }

    /// Reject graphs the engine cannot run
    ///
    /// Step ids must be unique; every dependency must name an earlier step
    /// (which also precludes self-dependencies and cycles). A DFS cycle
    /// check backs the ordering rule up for definitions built elsewhere.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.steps.is_empty() {
            problems.push("workflow has no steps".to_string());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                problems.push("step with empty id".to_string());
            }
            if !seen.insert(step.id.as_str()) {
                problems.push(format!("duplicate step id '{}'", step.id));
            }
            for dep in &step.dependencies {
                if dep == &step.id {
                    problems.push(format!("step '{}' depends on itself", step.id));
                } else if !seen.contains(dep.as_str()) {
                    // Either unknown or defined later; both are rejected
                    problems.push(format!(
                        "step '{}' depends on '{}', which is not an earlier step",
                        step.id, dep
                    ));
                }
            }
            if step.prompt.is_none() && step.template_ref.is_none() {
                problems.push(format!("step '{}' has neither prompt nor template_ref", step.id));
            }
        }

        if let Err(cycle) = detect_cycles(&self.steps) {
            problems.push(format!("dependency cycle: {}", cycle.join(" -> ")));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// DFS cycle detection over the dependency edges
fn detect_cycles(steps: &[WorkflowStep]) -> Result<(), Vec<String>> {
    let graph: HashMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for id in graph.keys() {
        if !visited.contains(id) && cycle_dfs(id, &graph, &mut visited, &mut rec_stack, &mut path) {
            return Err(path);
        }
    }
    Ok(())
}

fn cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a WorkflowStep>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node.to_string());

    if let Some(step) = graph.get(node) {
        for dep in &step.dependencies {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str()) && cycle_dfs(dep.as_str(), graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                path.push(dep.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Condition was falsy or an upstream hard failure made it unreachable
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// Execution state of one workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: WorkflowStatus,
    pub step_states: HashMap<String, StepState>,
    #[serde(default)]
    pub current_steps: Vec<String>,
    /// Shared variable namespace, dot-path addressed
    pub context: serde_json::Value,
    /// 0-100, completed steps over total
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(definition: &WorkflowDefinition, user_id: impl Into<String>, context: serde_json::Value) -> Self {
        let step_states = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::default()))
            .collect();
        Self {
            execution_id: format!("wf-exec-{}", uuid::Uuid::now_v7()),
            workflow_id: definition.id.clone(),
            user_id: user_id.into(),
            status: WorkflowStatus::Pending,
            step_states,
            current_steps: Vec::new(),
            context,
            progress: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn recompute_progress(&mut self) {
        let total = self.step_states.len().max(1);
        let settled = self
            .step_states
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
                )
            })
            .count();
        self.progress = (settled * 100 / total) as u8;
    }
}
