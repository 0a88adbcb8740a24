//! Orchestration engine: workflow graphs, self-critique, and moderated
//! discussion over pluggable executors

pub mod context;
mod critique;
mod discussion;
mod engine;
mod executor;
mod template;
mod types;

pub use context::ContextHandle;
pub use critique::{
    run_self_critique, CritiqueConfig, CritiqueIteration, CritiqueResult, Evaluation, QualityCriterion,
};
pub use discussion::{
    run_discussion, ConsensusStrategy, Contribution, DiscussionConfig, DiscussionResult, DiscussionRound,
    Participant, ParticipantSummary,
};
pub use engine::{WorkflowEngine, WorkflowEngineConfig};
pub use executor::{ExecutionContext, Executor, ExecutorInput, ExecutorOutput, ExecutorRegistry, Health};
pub use template::render as render_template;
pub use types::{
    InputBinding, InputSource, OutputBinding, RetryPolicy, StepState, StepStatus, WorkflowDefinition,
    WorkflowState, WorkflowStatus, WorkflowStep,
};
