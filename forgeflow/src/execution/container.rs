//! Ephemeral-container sandbox backend.
//!
//! One fresh container per execution: the artifact is staged into a
//! temp directory, mounted at /app, and run with a memory cap and only
//! the declared environment variables. Overruns kill the container.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::execution::error_parser::last_traceback;
use crate::execution::SandboxBackend;
use crate::models::{ExecutionResult, GeneratedArtifact, WorkflowDag};

const SANDBOX_IMAGE: &str = "python:3.12-slim";
const CONTAINER_PREFIX: &str = "forgeflow-sandbox-";
const MAX_CAPTURE: usize = 5_000;

#[derive(Default)]
pub struct ContainerSandbox;

impl ContainerSandbox {
    /// Probe the container runtime once at startup.
    pub async fn available() -> bool {
        let probe = Command::new("docker")
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match tokio::time::timeout(Duration::from_secs(5), probe).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }

    async fn stage_artifact(artifact: &GeneratedArtifact) -> Result<tempfile::TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("forgeflow_")
            .tempdir()
            .context("failed to create sandbox staging dir")?;

        tokio::fs::write(dir.path().join("workflow.py"), &artifact.code)
            .await
            .context("failed to stage workflow.py")?;

        for (rel, content) in &artifact.extra_files {
            let full = dir.path().join(rel);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, content).await?;
        }

        let run_sh = "#!/bin/sh\npip install -q httpx websockets 2>/dev/null\npython workflow.py\n";
        tokio::fs::write(dir.path().join("run.sh"), run_sh).await?;
        Ok(dir)
    }
}

#[async_trait]
impl SandboxBackend for ContainerSandbox {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn execute(
        &self,
        artifact: &GeneratedArtifact,
        _dag: &WorkflowDag,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        let staged = Self::stage_artifact(artifact).await?;
        let container_name = format!("{CONTAINER_PREFIX}{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--name", &container_name])
            .args(["--memory", "256m"])
            .args(["--cpus", "0.5"])
            .args(["--tmpfs", "/tmp:size=64m"])
            .args(["-v", &format!("{}:/app", staged.path().display())])
            .args(["-w", "/app"]);
        for (key, value) in env {
            cmd.args(["-e", &format!("{key}={value}")]);
        }
        cmd.args([SANDBOX_IMAGE, "sh", "run.sh"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().context("failed to spawn sandbox container")?;

        // 5s grace over the artifact timeout for container startup.
        let wait = tokio::time::timeout(timeout + Duration::from_secs(5), child.wait_with_output());
        let output = match wait.await {
            Ok(result) => result.context("sandbox container wait failed")?,
            Err(_) => {
                let _ = Command::new("docker")
                    .args(["kill", &container_name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                return Ok(ExecutionResult {
                    success: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!(
                        "execution timed out after {}s (container sandbox)",
                        timeout.as_secs()
                    )),
                    execution_time_secs: start.elapsed().as_secs_f64(),
                    sandbox: self.name().into(),
                    step_transitions: vec![],
                });
            }
        };

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();
        let success = output.status.success();

        Ok(ExecutionResult {
            success,
            exit_code,
            error: if success {
                None
            } else {
                Some(
                    last_traceback(&stderr)
                        .unwrap_or_else(|| {
                            if stderr.is_empty() {
                                format!("process exited with code {exit_code:?}")
                            } else {
                                stderr.clone()
                            }
                        }),
                )
            },
            stdout,
            stderr,
            execution_time_secs: start.elapsed().as_secs_f64(),
            sandbox: self.name().into(),
            step_transitions: vec![],
        })
    }
}

fn truncate(s: &str) -> String {
    if s.len() > MAX_CAPTURE {
        let mut out: String = s.chars().take(MAX_CAPTURE).collect();
        out.push_str("\n[truncated]");
        out
    } else {
        s.to_string()
    }
}
