//! Tool-calling code generation.
//!
//! The driver owns the transcript and the invocation budget. Each turn
//! the model either requests tool calls (executed by [`ToolContext`],
//! results appended to the transcript) or finishes with the artifact.
//! The loop fails closed when the ceiling is hit without `finish`.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use forgeflow_llm::{LanguageModel, ModelTurn, ToolCall, Transcript};

use crate::codegen::tools::{tool_declarations, ToolContext, TOOL_FINISH, TOOL_WRITE_FILE};
use crate::config::Settings;
use crate::discovery::ApiCorpus;
use crate::models::{DataMapping, GeneratedArtifact, WorkflowDag};
use crate::secrets::SecretResolver;
use crate::utils::strip_code_fences;

/// Budget errors are fatal: the runner surfaces them without retry.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("tool loop exceeded its budget of {0} invocations without finishing")]
    ToolBudgetExceeded(u32),
    #[error("model returned a malformed turn twice in a row")]
    MalformedTurn,
    #[error("model finished with an empty artifact")]
    EmptyArtifact,
}

/// One executed tool invocation, recorded for `tool.calling` events.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args_keys: Vec<String>,
    pub result_preview: String,
}

const CODEGEN_SYSTEM: &str = r#"You are a code generation agent producing PRODUCTION-QUALITY, ACTUALLY WORKING Python for workflow automations.

CRITICAL RULES:
1. NEVER generate placeholder code. Every step must do real work with real API calls.
2. Steps marked research_required have no indexed spec: use your tools to research them. Never stub them with asyncio.sleep().
3. Use fetch_spec to confirm parameters and auth for every indexed endpoint you call.
4. The artifact must be immediately runnable with `python workflow.py` given the env vars.

CODE REQUIREMENTS:
1. async/await with httpx.AsyncClient() for all HTTP calls
2. Every credential comes from an environment variable via os.getenv — never a literal
3. One named async function per workflow step, taking the shared context dict and returning a JSON-serializable result stored under the step id
4. Per-step error policy: retry = exponential backoff starting 1s, factor 2, max 3 tries; fallback = swallow and record the error; abort = raise to the orchestrator
5. asyncio.gather() for steps in the same parallel group
6. A main() orchestrator invoking steps in DAG order, and an if __name__ == "__main__": asyncio.run(main()) guard
7. Missing credentials are skipped gracefully with a logged warning, never a crash
8. Only standard library + httpx + websockets as dependencies

Finish by calling the finish tool with the complete workflow.py source. No markdown fences."#;

/// Generated code plus the tool-call trail for event emission.
#[derive(Debug)]
pub struct CodegenOutput {
    pub artifact: GeneratedArtifact,
    pub tool_calls: Vec<ToolCallRecord>,
}

pub async fn generate_workflow_code(
    model: &dyn LanguageModel,
    corpus: Arc<ApiCorpus>,
    secrets: &dyn SecretResolver,
    settings: &Settings,
    dag: &WorkflowDag,
    mappings: &[DataMapping],
    project_dir: std::path::PathBuf,
) -> Result<CodegenOutput> {
    let tools = tool_declarations(settings.allow_web_fetch);
    let ctx = ToolContext::new(corpus, project_dir, settings.allow_web_fetch);

    let step_count = dag.steps.len().max(1) as u32;
    let budget = settings
        .tool_budget_total
        .min(settings.tool_budget_per_step.saturating_mul(step_count));

    let prompt = build_prompt(secrets, dag, mappings)?;
    let mut transcript = Transcript::from_prompt(prompt);
    let mut extra_files: BTreeMap<String, String> = BTreeMap::new();
    let mut records: Vec<ToolCallRecord> = Vec::new();
    let mut invocations: u32 = 0;
    let mut malformed_retried = false;

    loop {
        let turn = model
            .next_turn(CODEGEN_SYSTEM, &transcript, &tools)
            .await
            .context("codegen turn failed")?;

        match turn {
            ModelTurn::Final(text) => {
                return finish_artifact(text, extra_files, records);
            }
            ModelTurn::Malformed => {
                if malformed_retried {
                    return Err(CodegenError::MalformedTurn.into());
                }
                malformed_retried = true;
                transcript.push_user(
                    "Your last response contained neither a tool call nor the final artifact. \
                     Respond with a tool call, or call finish with the complete workflow.py source.",
                );
            }
            ModelTurn::ToolCalls(calls) => {
                malformed_retried = false;
                for call in calls {
                    if call.name == TOOL_FINISH {
                        let text = call
                            .args
                            .get("artifact")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        return finish_artifact(text, extra_files, records);
                    }

                    invocations += 1;
                    if invocations > budget {
                        return Err(CodegenError::ToolBudgetExceeded(budget).into());
                    }

                    let result = ctx.execute(&call).await;
                    if call.name == TOOL_WRITE_FILE {
                        if let (Some(path), Some(content)) = (
                            call.args.get("path").and_then(|v| v.as_str()),
                            call.args.get("content").and_then(|v| v.as_str()),
                        ) {
                            extra_files.insert(path.to_string(), content.to_string());
                        }
                    }

                    records.push(ToolCallRecord {
                        tool: call.name.clone(),
                        args_keys: call
                            .args
                            .as_object()
                            .map(|o| o.keys().cloned().collect())
                            .unwrap_or_default(),
                        result_preview: result.chars().take(200).collect(),
                    });

                    transcript.push_tool_call(ToolCall {
                        name: call.name.clone(),
                        args: call.args.clone(),
                    });
                    // Feed a bounded slice back to the model.
                    transcript.push_tool_result(call.name, result.chars().take(6000).collect::<String>());
                }
            }
        }
    }
}

fn finish_artifact(
    text: String,
    extra_files: BTreeMap<String, String>,
    tool_calls: Vec<ToolCallRecord>,
) -> Result<CodegenOutput> {
    let code = strip_code_fences(&text);
    if code.trim().is_empty() {
        return Err(CodegenError::EmptyArtifact.into());
    }
    Ok(CodegenOutput {
        artifact: GeneratedArtifact {
            code,
            extra_files,
        },
        tool_calls,
    })
}

fn build_prompt(
    secrets: &dyn SecretResolver,
    dag: &WorkflowDag,
    mappings: &[DataMapping],
) -> Result<String> {
    let steps_desc: Vec<serde_json::Value> = dag
        .steps
        .iter()
        .map(|step| {
            let mut info = serde_json::json!({
                "id": step.id,
                "name": step.name,
                "description": step.description,
                "type": step.step_type,
                "depends_on": step.depends_on,
                "error_handling": step.error_handling,
                "inputs": step.inputs,
                "outputs": step.outputs,
            });
            if let Some(ep) = &step.endpoint {
                info["api"] = serde_json::json!({
                    "service": ep.service,
                    "endpoint": ep.endpoint,
                    "method": ep.method,
                    "base_url": ep.base_url,
                    "auth": ep.auth,
                    "parameters": ep.parameters,
                });
            } else if step.research_required {
                info["research_required"] = serde_json::json!(true);
                info["api_hint"] = serde_json::to_value(&step.api_hint).unwrap_or_default();
                info["note"] = serde_json::json!(
                    "No pre-indexed API. Research this service and generate real integration code."
                );
            }
            info
        })
        .collect();

    let credentials: Vec<serde_json::Value> = dag
        .environment_vars
        .iter()
        .map(|var| {
            serde_json::json!({
                "env_var": var,
                "configured": secrets.get(var).map(|v| !v.trim().is_empty()).unwrap_or(false),
            })
        })
        .collect();

    let research_steps: Vec<&str> = dag
        .steps
        .iter()
        .filter(|s| s.research_required)
        .map(|s| s.name.as_str())
        .collect();

    let mut prompt = format!(
        "WORKFLOW: {}\nDESCRIPTION: {}\nTRIGGER: {}\n\nSTEPS:\n{}\n\nDATA MAPPINGS:\n{}\n\nPARALLEL GROUPS: {}\n\nENVIRONMENT VARS: {}\n\nCREDENTIAL STATUS:\n{}\n",
        dag.name,
        dag.description,
        serde_json::to_string(&dag.trigger)?,
        serde_json::to_string_pretty(&steps_desc)?,
        serde_json::to_string_pretty(mappings)?,
        serde_json::to_string(&dag.parallel_groups())?,
        serde_json::to_string(&dag.environment_vars)?,
        serde_json::to_string_pretty(&credentials)?,
    );

    if !research_steps.is_empty() {
        prompt.push_str(&format!(
            "\nSteps needing research (no indexed API): {research_steps:?}. \
             Research their real endpoints and auth; do not stub them.\n"
        ));
    }

    prompt.push_str(
        "\nUse the EXACT input values from each step's inputs map. \
         Generate the workflow code now; call finish with the complete workflow.py when done.",
    );
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorPolicy, StepType, TriggerSpec, WorkflowStep};
    use crate::secrets::StaticSecretResolver;
    use forgeflow_llm::MockModel;

    fn dag() -> WorkflowDag {
        WorkflowDag {
            id: "wf".into(),
            name: "Hello Slack".into(),
            description: "post hello".into(),
            trigger: TriggerSpec::default(),
            steps: vec![
                WorkflowStep {
                    id: "trigger".into(),
                    name: "Trigger".into(),
                    description: String::new(),
                    step_type: StepType::Trigger,
                    endpoint: None,
                    inputs: BTreeMap::new(),
                    outputs: BTreeMap::new(),
                    depends_on: vec![],
                    error_handling: ErrorPolicy::Abort,
                    condition: None,
                    research_required: false,
                    api_hint: None,
                    status: Default::default(),
                },
                WorkflowStep {
                    id: "post".into(),
                    name: "Post message".into(),
                    description: "post hello to #general".into(),
                    step_type: StepType::ApiCall,
                    endpoint: None,
                    inputs: BTreeMap::from([("channel".into(), "#general".into())]),
                    outputs: BTreeMap::new(),
                    depends_on: vec!["trigger".into()],
                    error_handling: ErrorPolicy::Retry,
                    condition: None,
                    research_required: false,
                    api_hint: None,
                    status: Default::default(),
                },
            ],
            environment_vars: vec!["SLACK_BOT_TOKEN".into()],
            global_error_policy: ErrorPolicy::Retry,
        }
    }

    fn services() -> (Arc<ApiCorpus>, StaticSecretResolver, Settings) {
        (
            Arc::new(ApiCorpus::default()),
            StaticSecretResolver::new().with("SLACK_BOT_TOKEN", "xoxb-1"),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn test_finish_tool_produces_artifact() {
        let (corpus, secrets, settings) = services();
        let model = MockModel::new();
        model.push_turn(ModelTurn::ToolCalls(vec![ToolCall {
            name: TOOL_FINISH.into(),
            args: serde_json::json!({ "artifact": "import asyncio\n\nasync def main():\n    pass\n" }),
        }]));

        let dir = tempfile::tempdir().unwrap();
        let out = generate_workflow_code(
            &model,
            corpus,
            &secrets,
            &settings,
            &dag(),
            &[],
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        assert!(out.artifact.code.contains("async def main"));
        assert!(out.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_final_text_counts_as_artifact_and_fences_stripped() {
        let (corpus, secrets, settings) = services();
        let model = MockModel::new();
        model.push_turn(ModelTurn::Final(
            "```python\nimport asyncio\nasync def main():\n    pass\n```".into(),
        ));

        let dir = tempfile::tempdir().unwrap();
        let out = generate_workflow_code(
            &model,
            corpus,
            &secrets,
            &settings,
            &dag(),
            &[],
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        assert!(!out.artifact.code.contains("```"));
    }

    #[tokio::test]
    async fn test_write_file_tracked_in_extra_files() {
        let (corpus, secrets, settings) = services();
        let model = MockModel::new();
        model.push_turn(ModelTurn::ToolCalls(vec![ToolCall {
            name: TOOL_WRITE_FILE.into(),
            args: serde_json::json!({ "path": "config.py", "content": "import os\n" }),
        }]));
        model.push_turn(ModelTurn::ToolCalls(vec![ToolCall {
            name: TOOL_FINISH.into(),
            args: serde_json::json!({ "artifact": "from config import *\n" }),
        }]));

        let dir = tempfile::tempdir().unwrap();
        let out = generate_workflow_code(
            &model,
            corpus,
            &secrets,
            &settings,
            &dag(),
            &[],
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        assert_eq!(out.artifact.extra_files.get("config.py").unwrap(), "import os\n");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].tool, TOOL_WRITE_FILE);
    }

    #[tokio::test]
    async fn test_budget_exceeded_fails_closed() {
        let (corpus, secrets, mut settings) = services();
        settings.tool_budget_per_step = 1;
        settings.tool_budget_total = 2;

        let model = MockModel::new();
        for _ in 0..3 {
            model.push_turn(ModelTurn::ToolCalls(vec![ToolCall {
                name: "read_file".into(),
                args: serde_json::json!({ "path": "x.py" }),
            }]));
        }

        let dir = tempfile::tempdir().unwrap();
        let err = generate_workflow_code(
            &model,
            corpus,
            &secrets,
            &settings,
            &dag(),
            &[],
            dir.path().to_path_buf(),
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<CodegenError>().is_some());
    }

    #[tokio::test]
    async fn test_malformed_turn_retried_once_then_fatal() {
        let (corpus, secrets, settings) = services();
        let model = MockModel::new();
        model.push_turn(ModelTurn::Malformed);
        model.push_turn(ModelTurn::Malformed);

        let dir = tempfile::tempdir().unwrap();
        let err = generate_workflow_code(
            &model,
            corpus,
            &secrets,
            &settings,
            &dag(),
            &[],
            dir.path().to_path_buf(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CodegenError>(),
            Some(CodegenError::MalformedTurn)
        ));
    }

    #[tokio::test]
    async fn test_malformed_then_finish_recovers() {
        let (corpus, secrets, settings) = services();
        let model = MockModel::new();
        model.push_turn(ModelTurn::Malformed);
        model.push_turn(ModelTurn::Final("import asyncio\n".into()));

        let dir = tempfile::tempdir().unwrap();
        let out = generate_workflow_code(
            &model,
            corpus,
            &secrets,
            &settings,
            &dag(),
            &[],
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        assert!(out.artifact.code.contains("import asyncio"));
    }

    #[tokio::test]
    async fn test_empty_artifact_rejected() {
        let (corpus, secrets, settings) = services();
        let model = MockModel::new();
        model.push_turn(ModelTurn::Final("   ".into()));

        let dir = tempfile::tempdir().unwrap();
        let err = generate_workflow_code(
            &model,
            corpus,
            &secrets,
            &settings,
            &dag(),
            &[],
            dir.path().to_path_buf(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CodegenError>(),
            Some(CodegenError::EmptyArtifact)
        ));
    }
}
