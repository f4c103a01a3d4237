//! Deployment handoff.
//!
//! On success the pipeline hands the packager the final artifact, the
//! DAG, the required environment variable names, and a run report with
//! the debug history. The packager's own behavior is opaque to the
//! core; a directory-writing implementation ships for the CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::{DebugRecord, ExecutionResult, GeneratedArtifact, WorkflowDag};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunReport {
    pub debug_history: Vec<DebugRecord>,
    pub last_execution: Option<ExecutionResult>,
    pub events_emitted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHandoff {
    pub correlation_id: String,
    pub workflow_name: String,
    pub artifact: GeneratedArtifact,
    pub dag: WorkflowDag,
    pub environment_vars: Vec<String>,
    pub test_code: Option<String>,
    pub report: RunReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReceipt {
    pub location: String,
    pub files: Vec<String>,
}

#[async_trait]
pub trait Packager: Send + Sync {
    async fn deploy(&self, handoff: &DeploymentHandoff) -> Result<DeploymentReceipt>;
}

/// Writes the deployable project folder: workflow.py, extra files, the
/// test module, the DAG, and the run report.
pub struct DirectoryPackager {
    root: PathBuf,
}

impl DirectoryPackager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Packager for DirectoryPackager {
    async fn deploy(&self, handoff: &DeploymentHandoff) -> Result<DeploymentReceipt> {
        let dir = self.root.join(&handoff.correlation_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut files = Vec::new();

        tokio::fs::write(dir.join("workflow.py"), &handoff.artifact.code).await?;
        files.push("workflow.py".to_string());

        for (rel, content) in &handoff.artifact.extra_files {
            let full = dir.join(rel);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, content).await?;
            files.push(rel.clone());
        }

        if let Some(tests) = &handoff.test_code {
            tokio::fs::write(dir.join("test_workflow.py"), tests).await?;
            files.push("test_workflow.py".to_string());
        }

        tokio::fs::write(
            dir.join("dag.json"),
            serde_json::to_string_pretty(&handoff.dag)?,
        )
        .await?;
        files.push("dag.json".to_string());

        tokio::fs::write(
            dir.join("report.json"),
            serde_json::to_string_pretty(&handoff.report)?,
        )
        .await?;
        files.push("report.json".to_string());

        let env_lines: String = handoff
            .environment_vars
            .iter()
            .map(|v| format!("{v}=\n"))
            .collect();
        tokio::fs::write(dir.join(".env.example"), env_lines).await?;
        files.push(".env.example".to_string());

        Ok(DeploymentReceipt {
            location: dir.display().to_string(),
            files,
        })
    }
}

/// Records handoffs in memory; the test double for the packager seam.
#[derive(Default)]
pub struct RecordingPackager {
    received: std::sync::Mutex<Vec<DeploymentHandoff>>,
}

impl RecordingPackager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<DeploymentHandoff> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Packager for RecordingPackager {
    async fn deploy(&self, handoff: &DeploymentHandoff) -> Result<DeploymentReceipt> {
        self.received.lock().unwrap().push(handoff.clone());
        Ok(DeploymentReceipt {
            location: format!("memory://{}", handoff.correlation_id),
            files: vec!["workflow.py".into()],
        })
    }
}
