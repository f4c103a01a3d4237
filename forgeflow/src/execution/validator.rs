//! In-process structural validator, the sandbox fallback.
//!
//! When no container runtime is available the artifact is not executed:
//! this backend checks the module's structure instead (orchestrator
//! presence, per-step functions, an import allow-list, placeholder
//! detection) and never performs network operations.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::execution::{step_function_names, SandboxBackend};
use crate::models::{ExecutionResult, GeneratedArtifact, WorkflowDag};

/// Imports the sandbox image provides; anything else is flagged.
const KNOWN_MODULES: &[&str] = &[
    "asyncio", "os", "json", "logging", "datetime", "time", "sys", "base64", "hashlib", "re",
    "typing", "collections", "functools", "email", "urllib", "pathlib", "dataclasses", "enum",
    "abc", "httpx", "websockets", "csv", "io", "contextlib", "traceback", "inspect", "copy",
    "math", "random", "string", "textwrap", "uuid", "struct", "itertools", "operator", "http",
    "socket", "ssl", "smtplib", "imaplib",
];

fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_]*)").expect("import regex")
    })
}

#[derive(Default)]
pub struct StaticValidator;

impl StaticValidator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for StaticValidator {
    fn name(&self) -> &'static str {
        "static_validator"
    }

    async fn execute(
        &self,
        artifact: &GeneratedArtifact,
        dag: &WorkflowDag,
        _env: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        let expected_steps = step_function_names(dag);
        let code = &artifact.code;
        let mut lines: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        if code.trim().is_empty() {
            return Ok(failed(
                "empty artifact",
                start.elapsed(),
                self.name(),
            ));
        }

        // Orchestrator entry point.
        let has_main = code.contains("def main(") || code.contains("async def main(");
        if has_main {
            lines.push("[PASS] main() orchestrator found".into());
        } else {
            failures.push("no main() orchestrator".into());
        }
        if code.contains("__main__") {
            lines.push("[PASS] __main__ guard found".into());
        } else {
            warnings.push("no __main__ guard".into());
        }

        // One function per workflow step.
        for step in &expected_steps {
            let sync = format!("def {step}(");
            if code.contains(&sync) {
                lines.push(format!("[PASS] step function '{step}' found"));
            } else {
                failures.push(format!("missing step function '{step}'"));
            }
        }

        // Import allow-list.
        for caps in import_regex().captures_iter(code) {
            let module = &caps[1];
            if !KNOWN_MODULES.contains(&module) {
                warnings.push(format!("import '{module}' may be unavailable in the sandbox"));
            }
        }

        // Placeholder detection: sleeps with no real IO.
        let has_io = ["httpx", "websockets", "smtplib", "urllib"]
            .iter()
            .any(|lib| code.contains(lib));
        let sleep_count = code.matches("asyncio.sleep").count();
        if has_io {
            lines.push("[PASS] real API integration detected".into());
        } else if sleep_count > 3 {
            failures.push("placeholder code: sleeps without any API integration".into());
        } else {
            warnings.push("no API client library detected".into());
        }

        // Unbalanced brackets catch truncated generations.
        for (open, close, label) in [('(', ')', "parentheses"), ('[', ']', "brackets"), ('{', '}', "braces")] {
            let opens = code.matches(open).count();
            let closes = code.matches(close).count();
            if opens != closes {
                failures.push(format!("unbalanced {label} ({opens} vs {closes})"));
            }
        }

        for w in &warnings {
            lines.push(format!("[WARN] {w}"));
        }

        let success = failures.is_empty();
        if success {
            lines.push(String::new());
            lines.push("=== VALIDATION PASSED ===".into());
            lines.push(format!(
                "  {} lines | ready for deployment",
                code.lines().count()
            ));
        }

        let stderr = failures.join("\n");
        Ok(ExecutionResult {
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            stdout: lines.join("\n"),
            error: if success { None } else { Some(stderr.clone()) },
            stderr,
            execution_time_secs: start.elapsed().as_secs_f64(),
            sandbox: self.name().into(),
            step_transitions: vec![],
        })
    }
}

fn failed(reason: &str, elapsed: Duration, sandbox: &str) -> ExecutionResult {
    ExecutionResult {
        success: false,
        exit_code: Some(1),
        stdout: String::new(),
        stderr: reason.into(),
        error: Some(reason.into()),
        execution_time_secs: elapsed.as_secs_f64(),
        sandbox: sandbox.into(),
        step_transitions: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepType, WorkflowStep};

    fn artifact(code: &str) -> GeneratedArtifact {
        GeneratedArtifact {
            code: code.into(),
            extra_files: Default::default(),
        }
    }

    fn dag_with_steps(ids: &[&str]) -> WorkflowDag {
        let mut steps = vec![WorkflowStep {
            id: "trigger".into(),
            name: "Trigger".into(),
            description: String::new(),
            step_type: StepType::Trigger,
            endpoint: None,
            inputs: Default::default(),
            outputs: Default::default(),
            depends_on: vec![],
            error_handling: Default::default(),
            condition: None,
            research_required: false,
            api_hint: None,
            status: Default::default(),
        }];
        for id in ids {
            steps.push(WorkflowStep {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                step_type: StepType::ApiCall,
                endpoint: None,
                inputs: Default::default(),
                outputs: Default::default(),
                depends_on: vec!["trigger".into()],
                error_handling: Default::default(),
                condition: None,
                research_required: false,
                api_hint: None,
                status: Default::default(),
            });
        }
        WorkflowDag {
            id: "wf".into(),
            name: "test".into(),
            steps,
            ..Default::default()
        }
    }

    const GOOD: &str = r#"
import asyncio
import os
import httpx

async def post_message(context):
    async with httpx.AsyncClient(timeout=30) as client:
        r = await client.post("https://slack.com/api/chat.postMessage")
        return r.json()

async def main():
    context = {}
    context["post_message"] = await post_message(context)

if __name__ == "__main__":
    asyncio.run(main())
"#;

    #[tokio::test]
    async fn test_well_formed_artifact_passes() {
        let v = StaticValidator::new();
        let result = v
            .execute(&artifact(GOOD), &dag_with_steps(&["post_message"]), &HashMap::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("VALIDATION PASSED"));
    }

    #[tokio::test]
    async fn test_missing_step_function_fails() {
        let v = StaticValidator::new();
        let result = v
            .execute(&artifact(GOOD), &dag_with_steps(&["post_message", "send_email"]), &HashMap::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("send_email"));
    }

    #[tokio::test]
    async fn test_missing_main_fails() {
        let v = StaticValidator::new();
        let result = v
            .execute(
                &artifact("import asyncio\nprint('no orchestrator')\n"),
                &dag_with_steps(&[]),
                &HashMap::new(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("main()"));
    }

    #[tokio::test]
    async fn test_placeholder_sleeps_fail() {
        let code = r#"
import asyncio

async def step(context):
    await asyncio.sleep(1)
    await asyncio.sleep(1)
    await asyncio.sleep(1)
    await asyncio.sleep(1)

async def main():
    await step({})
"#;
        let v = StaticValidator::new();
        let result = v
            .execute(&artifact(code), &dag_with_steps(&[]), &HashMap::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("placeholder"));
    }

    #[tokio::test]
    async fn test_unknown_import_is_warning_not_failure() {
        let code = "import pandas\nimport asyncio\nimport httpx\nasync def main():\n    pass\n";
        let v = StaticValidator::new();
        let result = v
            .execute(&artifact(code), &dag_with_steps(&[]), &HashMap::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.stdout.contains("pandas"));
    }

    #[tokio::test]
    async fn test_truncated_code_fails() {
        let code = "async def main():\n    data = {\"a\": [1, 2\n";
        let v = StaticValidator::new();
        let result = v
            .execute(&artifact(code), &dag_with_steps(&[]), &HashMap::new(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("unbalanced"));
    }
}
