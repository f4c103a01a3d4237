//! Sandboxed execution and the self-debug loop.

pub mod container;
pub mod debugger;
pub mod error_parser;
pub mod validator;

pub use container::ContainerSandbox;
pub use debugger::{diagnose, patch, Diagnosis};
pub use error_parser::{categorize, last_traceback, parse_error, ParsedError};
pub use validator::StaticValidator;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::models::{ExecutionResult, GeneratedArtifact, StepType, WorkflowDag};

/// One isolated execution of an artifact. The backend owns per-execution
/// exclusivity; the environment map carries only the variables the DAG
/// declares.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        artifact: &GeneratedArtifact,
        dag: &WorkflowDag,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecutionResult>;
}

/// Probes the container runtime per execution and falls back to the
/// structural validator when it is unavailable.
#[derive(Default)]
pub struct AutoSandbox {
    container: ContainerSandbox,
    validator: StaticValidator,
}

#[async_trait]
impl SandboxBackend for AutoSandbox {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn execute(
        &self,
        artifact: &GeneratedArtifact,
        dag: &WorkflowDag,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        if ContainerSandbox::available().await {
            self.container.execute(artifact, dag, env, timeout).await
        } else {
            self.validator.execute(artifact, dag, env, timeout).await
        }
    }
}

/// Step ids double as the artifact's function names.
pub fn step_function_names(dag: &WorkflowDag) -> Vec<String> {
    dag.steps
        .iter()
        .filter(|s| s.step_type != StepType::Trigger)
        .map(|s| s.id.clone())
        .collect()
}

/// Scripted backend for tests: replays queued results in order and
/// records the env maps it was handed.
#[derive(Default)]
pub struct ScriptedSandbox {
    results: std::sync::Mutex<std::collections::VecDeque<ExecutionResult>>,
    seen_env: std::sync::Mutex<Vec<HashMap<String, String>>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: ExecutionResult) -> &Self {
        self.results.lock().unwrap().push_back(result);
        self
    }

    pub fn push_exit(&self, exit_code: i32, stderr: &str) -> &Self {
        self.push_result(ExecutionResult {
            success: exit_code == 0,
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            error: (exit_code != 0).then(|| stderr.to_string()),
            sandbox: "scripted".into(),
            ..Default::default()
        })
    }

    /// Environment maps observed across executions, in order.
    pub fn observed_env(&self) -> Vec<HashMap<String, String>> {
        self.seen_env.lock().unwrap().clone()
    }

    pub fn executions(&self) -> usize {
        self.seen_env.lock().unwrap().len()
    }
}

#[async_trait]
impl SandboxBackend for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(
        &self,
        _artifact: &GeneratedArtifact,
        _dag: &WorkflowDag,
        env: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<ExecutionResult> {
        self.seen_env.lock().unwrap().push(env.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted sandbox exhausted"))
    }
}
