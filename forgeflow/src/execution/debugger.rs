//! Self-debugging: classify an execution failure, then patch.
//!
//! Classification and patching are separate model calls. The patch is a
//! full replacement artifact; it must keep every step function's
//! signature and the DAG's declared environment variables, and it goes
//! back through the security scanner and the sandbox.

use anyhow::{Context, Result};
use forgeflow_llm::LanguageModel;

use crate::execution::error_parser::{parse_error, ParsedError};
use crate::models::{
    DebugRecord, ErrorCategory, ExecutionResult, GeneratedArtifact, StepType, WorkflowDag,
};
use crate::utils::{json_str, llm_json_with_retry, strip_code_fences};

const CLASSIFY_SYSTEM: &str = r#"You are a self-debugging engine. Analyze the workflow failure and produce a diagnosis.

CATEGORIES (use exactly one):
IMPORT_ERROR, AUTH_FAILURE, SCHEMA_MISMATCH, RATE_LIMIT, MISSING_PARAM, LOGIC_ERROR, NETWORK_ERROR, TIMEOUT, SECURITY_VIOLATION, UNKNOWN

Output ONLY valid JSON:
{"category": "...", "root_cause": "one sentence", "fix_plan": "what to change"}"#;

const PATCH_SYSTEM: &str = r#"You repair generated workflow code. Apply the fix plan and return the COMPLETE corrected workflow.py.

RULES:
1. Return the entire file, not a diff
2. Change only what the fix plan requires
3. Keep every step function's name and signature unchanged
4. Keep every declared environment variable read intact
5. No markdown fences, no commentary

Output ONLY the corrected Python source."#;

/// The classified failure plus the parsed stderr it was based on.
#[derive(Debug)]
pub struct Diagnosis {
    pub category: ErrorCategory,
    pub root_cause: String,
    pub fix_plan: String,
    pub parsed: ParsedError,
}

/// Classify a failed execution. The stderr is pre-parsed so the prompt
/// carries structured frames and suggestions, and the pre-classified
/// category backstops an unusable model answer.
pub async fn diagnose(
    model: &dyn LanguageModel,
    artifact: &GeneratedArtifact,
    result: &ExecutionResult,
    dag: &WorkflowDag,
    attempt: u32,
    max_attempts: u32,
) -> Result<Diagnosis> {
    let stderr = if result.stderr.is_empty() {
        result.error.clone().unwrap_or_default()
    } else {
        result.stderr.clone()
    };
    let parsed = parse_error(&stderr, &artifact.code);

    let mut structured = format!(
        "ERROR TYPE: {}\nERROR MESSAGE: {}\nCATEGORY (pre-classified): {}\n",
        parsed.error_type,
        parsed.message,
        parsed
            .category
            .map(|c| c.as_str())
            .unwrap_or(ErrorCategory::Unknown.as_str()),
    );
    if let Some(line) = parsed.line_number {
        structured.push_str(&format!("LINE: {line}\n"));
    }
    if !parsed.code_context.is_empty() {
        structured.push_str(&format!("\nCODE CONTEXT:\n{}\n", parsed.code_context));
    }
    if !parsed.frames.is_empty() {
        structured.push_str("\nTRACEBACK FRAMES:\n");
        for frame in parsed.frames.iter().rev().take(5) {
            structured.push_str(&format!(
                "  {}:{} in {}\n",
                frame.file, frame.line, frame.function
            ));
        }
    }
    for s in &parsed.suggestions {
        structured.push_str(&format!("HINT: {s}\n"));
    }

    let prompt = format!(
        "ATTEMPT: {attempt}/{max_attempts}\n\n=== STRUCTURED ERROR ===\n{structured}\n=== EXIT CODE ===\n{:?}\n\n=== DAG ===\n{}\n\n=== FULL CODE ===\n```python\n{}\n```\n\nDiagnose the failure.",
        result.exit_code,
        serde_json::to_string(dag)?,
        artifact.code,
    );

    match llm_json_with_retry(model, CLASSIFY_SYSTEM, &prompt).await {
        Ok(value) => Ok(Diagnosis {
            category: ErrorCategory::parse(&json_str(&value, "category")),
            root_cause: json_str(&value, "root_cause"),
            fix_plan: json_str(&value, "fix_plan"),
            parsed,
        }),
        Err(e) if !e.is_retryable() => {
            // Model answer unusable after the structured retry: fall back
            // to the parser's classification so the loop keeps moving.
            let category = parsed.category.unwrap_or(ErrorCategory::Unknown);
            Ok(Diagnosis {
                category,
                root_cause: parsed.message.clone(),
                fix_plan: parsed.suggestions.join("; "),
                parsed,
            })
        }
        Err(e) => Err(e).context("diagnosis call failed"),
    }
}

/// Generate the replacement artifact for a diagnosis. Validates that
/// the patch keeps the declared env vars and step functions; one
/// stricter retry, then the original artifact is kept and the failure
/// recorded in the returned record.
pub async fn patch(
    model: &dyn LanguageModel,
    artifact: &GeneratedArtifact,
    dag: &WorkflowDag,
    diagnosis: &Diagnosis,
    attempt: u32,
) -> Result<(GeneratedArtifact, DebugRecord)> {
    let prompt = format!(
        "ROOT CAUSE: {}\nFIX PLAN: {}\nCATEGORY: {}\n\nDECLARED ENV VARS (must stay): {:?}\n\n=== CURRENT CODE ===\n{}\n",
        diagnosis.root_cause,
        diagnosis.fix_plan,
        diagnosis.category,
        dag.environment_vars,
        artifact.code,
    );

    let mut patched_code: Option<String> = None;
    let mut prompt_text = prompt.clone();
    for round in 0..2 {
        let text = model
            .generate_text(PATCH_SYSTEM, &prompt_text)
            .await
            .context("patch call failed")?;
        let code = strip_code_fences(&text);
        match validate_patch(&code, artifact, dag) {
            Ok(()) => {
                patched_code = Some(code);
                break;
            }
            Err(reason) if round == 0 => {
                prompt_text = format!(
                    "{prompt}\n\nYour previous patch was rejected: {reason}. \
                     Return the complete corrected file keeping every step function and env var."
                );
            }
            Err(_) => {}
        }
    }

    match patched_code {
        Some(code) => {
            let diff = diff_summary(&artifact.code, &code);
            let record = DebugRecord {
                attempt,
                category: diagnosis.category,
                root_cause: diagnosis.root_cause.clone(),
                fix_description: diagnosis.fix_plan.clone(),
                diff,
            };
            Ok((
                GeneratedArtifact {
                    code,
                    extra_files: artifact.extra_files.clone(),
                },
                record,
            ))
        }
        None => {
            let record = DebugRecord {
                attempt,
                category: diagnosis.category,
                root_cause: diagnosis.root_cause.clone(),
                fix_description: "patch rejected twice; artifact unchanged".into(),
                diff: String::new(),
            };
            Ok((artifact.clone(), record))
        }
    }
}

/// A patch must keep the public surface: non-empty, every declared env
/// var still read, every step function still defined.
fn validate_patch(
    code: &str,
    _previous: &GeneratedArtifact,
    dag: &WorkflowDag,
) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("empty patch".into());
    }
    for var in &dag.environment_vars {
        if !code.contains(var.as_str()) {
            return Err(format!("declared env var '{var}' disappeared"));
        }
    }
    for step in dag.steps.iter().filter(|s| s.step_type != StepType::Trigger) {
        let needle = format!("def {}(", step.id);
        if !code.contains(&needle) {
            return Err(format!("step function '{}' disappeared", step.id));
        }
    }
    Ok(())
}

/// Compact line-level change summary for the debug record.
fn diff_summary(before: &str, after: &str) -> String {
    let before_lines: std::collections::HashSet<&str> = before.lines().collect();
    let after_lines: std::collections::HashSet<&str> = after.lines().collect();
    let added = after.lines().filter(|l| !before_lines.contains(l)).count();
    let removed = before.lines().filter(|l| !after_lines.contains(l)).count();
    format!("+{added} lines, -{removed} lines")
}
