//! Executor abstraction
//!
//! The orchestration engine consumes the job layer as a black box through
//! this trait. The daemon registers concrete LLM and render executors; user
//! code may register further kinds behind the same interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Execution metadata handed to an executor
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_execution_id: String,
    pub step_id: String,
    pub user_id: String,
    pub timeout: Option<Duration>,
}

/// What a step asks its executor to do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorInput {
    pub prompt: String,
    /// Kind-specific parameters (render options, model overrides)
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ExecutorInput {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// What an executor hands back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorOutput {
    /// Primary textual output
    pub content: String,
    /// Structured payload, when the executor has one
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ExecutorOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// Executor health report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

/// A pluggable step executor
#[async_trait]
pub trait Executor: Send + Sync {
    /// Kind this executor serves ("llm", "render", custom)
    fn kind(&self) -> &str;

    async fn execute(&self, ctx: &ExecutionContext, input: ExecutorInput) -> Result<ExecutorOutput, JobError>;

    async fn health_check(&self) -> Health {
        Health::Healthy
    }

    /// Cooperative cancellation of in-flight work for this context
    async fn cancel(&self, _ctx: &ExecutionContext) {}
}

/// Registry of executors by kind
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: std::sync::RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, executor: Arc<dyn Executor>) {
        let kind = executor.kind().to_string();
        self.executors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, executor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        fn kind(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _ctx: &ExecutionContext, input: ExecutorInput) -> Result<ExecutorOutput, JobError> {
            Ok(ExecutorOutput::text(input.prompt))
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            workflow_execution_id: "wf-exec-1".to_string(),
            step_id: "s1".to_string(),
            user_id: "u1".to_string(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));

        let executor = registry.get("echo").unwrap();
        let out = executor.execute(&ctx(), ExecutorInput::prompt("hello")).await.unwrap();
        assert_eq!(out.content, "hello");

        assert!(registry.get("missing").is_none());
        assert_eq!(registry.kinds(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_default_health_is_healthy() {
        assert_eq!(EchoExecutor.health_check().await, Health::Healthy);
    }
}
