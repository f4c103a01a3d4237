//! The pipeline runner: a state machine over the ten stages with two
//! back-edges (clarification and self-debug).
//!
//! One correlation id is advanced by exactly one runner task at a time;
//! concurrent runs share only the immutable singletons in [`Services`].
//! State is checkpointed before every stage so any stage can be
//! re-attempted from the previous checkpoint. Cancellation is checked
//! at every suspension point; resource errors get two silent retries
//! with backoff, content and budget errors never do.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use forgeflow_llm::{Embedder, LanguageModel, LlmError};
use forgeflow_sdk::{EventSink, PipelineEvent, RunPhase, StageTag};

use crate::codegen::{self, scan, CodegenError, ScanConfig, SecurityReport};
use crate::config::Settings;
use crate::conversation;
use crate::deployment::{DeploymentHandoff, DeploymentReceipt, Packager, RunReport};
use crate::discovery::{self, ApiCorpus, VectorIndex};
use crate::execution::{self, Diagnosis, SandboxBackend};
use crate::models::{
    DebugRecord, ErrorCategory, ExecutionResult, StepStatus, StepTransition,
};
use crate::pipeline::checkpoint::{CheckpointLoad, CheckpointStore};
use crate::pipeline::state::PipelineState;
use crate::planner;
use crate::secrets::SecretResolver;

/// Immutable singletons shared by every pipeline run.
pub struct Services {
    pub model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub corpus: Arc<ApiCorpus>,
    pub index: Arc<VectorIndex>,
    pub secrets: Arc<dyn SecretResolver>,
    pub sandbox: Arc<dyn SandboxBackend>,
    pub sink: Arc<dyn EventSink>,
    pub checkpoints: Arc<CheckpointStore>,
    pub packager: Arc<dyn Packager>,
    pub scan_config: ScanConfig,
    pub settings: Settings,
}

/// External cancellation handle, checked at every suspension point.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve when cancelled; immediately if already cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Terminal result of one pipeline traversal.
#[derive(Debug)]
pub enum RunOutcome {
    Deployed {
        receipt: DeploymentReceipt,
        final_message: String,
    },
    NeedsClarification {
        correlation_id: String,
        questions: Vec<String>,
        message: String,
        current_plan: Vec<serde_json::Value>,
        original_request: String,
    },
    Failed {
        stage: StageTag,
        category: ErrorCategory,
        message: String,
        last_debug: Option<DebugRecord>,
    },
    Cancelled,
}

/// Where to go after a stage.
enum Transition {
    Next(StageTag),
    Suspend(RunOutcome),
    Finish(RunOutcome),
    Fail {
        category: ErrorCategory,
        message: String,
    },
    Cancelled,
}

pub struct PipelineRunner {
    services: Arc<Services>,
}

impl PipelineRunner {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run a fresh pipeline for a user request.
    pub async fn run(
        &self,
        user_request: &str,
        correlation_id: Option<String>,
        cancel: CancelFlag,
    ) -> Result<RunOutcome> {
        let id = correlation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());
        let mut state = PipelineState::new(id, user_request);
        self.execute(&mut state, &cancel).await
    }

    /// Resume a suspended pipeline with the user's clarification answer.
    /// A missing checkpoint is an input error; a rejected one starts
    /// fresh when the resume message carries the original request.
    pub async fn resume(
        &self,
        correlation_id: &str,
        answer: &str,
        original_request: Option<&str>,
        cancel: CancelFlag,
    ) -> Result<RunOutcome> {
        let mut state = match self.services.checkpoints.load(correlation_id)? {
            CheckpointLoad::Loaded(state) => {
                let mut state = *state;
                state.user_request = answer.to_string();
                state.stage = StageTag::Conversation;
                state.phase = RunPhase::Collecting;
                state
            }
            CheckpointLoad::Missing => {
                anyhow::bail!("no checkpoint for correlation id '{correlation_id}'")
            }
            CheckpointLoad::Rejected { reason } => match original_request {
                Some(original) => {
                    let mut state = PipelineState::new(correlation_id, answer);
                    state.messages.push(format!("user: {original}"));
                    state
                }
                None => anyhow::bail!(
                    "checkpoint for '{correlation_id}' was rejected ({reason}) and no original request was supplied"
                ),
            },
        };
        self.execute(&mut state, &cancel).await
    }

    async fn execute(&self, state: &mut PipelineState, cancel: &CancelFlag) -> Result<RunOutcome> {
        let budget = Duration::from_secs(self.services.settings.pipeline_timeout_secs);
        match tokio::time::timeout(budget, self.drive(state, cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.finish_failed(
                    state,
                    ErrorCategory::Timeout,
                    format!("pipeline exceeded {}s", budget.as_secs()),
                )
                .await
            }
        }
    }

    async fn drive(&self, state: &mut PipelineState, cancel: &CancelFlag) -> Result<RunOutcome> {
        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(state).await;
            }
            self.services
                .checkpoints
                .save(state)
                .context("checkpoint write failed")?;

            self.emit(state, "stage.started", format!("{} started", state.stage), None)
                .await;

            match self.run_stage_with_retry(state, cancel).await {
                Ok(Transition::Next(next)) => {
                    let payload = stage_payload(state);
                    self.emit(
                        state,
                        "stage.completed",
                        format!("{} completed", state.stage),
                        payload,
                    )
                    .await;
                    state.stage = next;
                }
                Ok(Transition::Suspend(outcome)) => {
                    self.services.checkpoints.save(state)?;
                    return Ok(outcome);
                }
                Ok(Transition::Finish(outcome)) => {
                    self.emit(
                        state,
                        "stage.completed",
                        format!("{} completed", state.stage),
                        None,
                    )
                    .await;
                    self.services.checkpoints.save(state)?;
                    return Ok(outcome);
                }
                Ok(Transition::Fail { category, message }) => {
                    return self.finish_failed(state, category, message).await;
                }
                Ok(Transition::Cancelled) => {
                    return self.finish_cancelled(state).await;
                }
                Err(e) => {
                    let (category, _) = classify_error(&e);
                    return self.finish_failed(state, category, format!("{e:#}")).await;
                }
            }
        }
    }

    /// Resource errors get up to two silent retries with backoff;
    /// everything else propagates on the first failure.
    async fn run_stage_with_retry(
        &self,
        state: &mut PipelineState,
        cancel: &CancelFlag,
    ) -> Result<Transition> {
        let mut attempt = 0u32;
        loop {
            match self.run_stage(state, cancel).await {
                Err(e) if attempt < 2 && classify_error(&e).1 => {
                    attempt += 1;
                    self.emit(
                        state,
                        "stage.retrying",
                        format!("resource error, retry {attempt}/2: {e:#}"),
                        None,
                    )
                    .await;
                    tokio::time::sleep(Duration::from_millis(500 * (1 << (attempt - 1)))).await;
                }
                other => return other,
            }
        }
    }

    async fn run_stage(&self, state: &mut PipelineState, cancel: &CancelFlag) -> Result<Transition> {
        match state.stage {
            StageTag::Conversation => self.stage_conversation(state).await,
            StageTag::ApiDiscovery => self.stage_discovery(state).await,
            StageTag::Planner => self.stage_planner(state).await,
            StageTag::Mapper => self.stage_mapper(state).await,
            StageTag::Codegen => self.stage_codegen(state).await,
            StageTag::Security => self.stage_security(state).await,
            StageTag::TestScaffold => self.stage_test_scaffold(state).await,
            StageTag::SandboxExecute => self.stage_sandbox(state, cancel).await,
            StageTag::SelfDebug => self.stage_self_debug(state).await,
            StageTag::Deploy => self.stage_deploy(state).await,
        }
    }

    // ── Stage 1: Conversation ────────────────────────────────

    async fn stage_conversation(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let known_services = s.corpus.services();
        let record = conversation::extract_requirements(
            s.model.as_ref(),
            &state.user_request,
            &state.messages,
            &known_services,
        )
        .await?;

        let action_count = record.actions.iter().filter(|a| !a.is_trigger).count();
        self.emit(
            state,
            "conversation.analyzed",
            format!(
                "Requirements extracted (confidence: {:.0}%)",
                record.confidence * 100.0
            ),
            Some(serde_json::json!({
                "intent": record.intent,
                "actions_count": action_count,
                "confidence": record.confidence,
                "assumed_defaults": record.assumed_defaults,
            })),
        )
        .await;

        if action_count == 0 {
            return Ok(Transition::Fail {
                category: ErrorCategory::MissingParam,
                message: "no actionable steps could be extracted from the request".into(),
            });
        }

        let threshold = s.settings.confidence_threshold;
        let needs_clarification = record.confidence < threshold
            && !record.clarification_needed.is_empty()
            && state.clarifications_asked < 1;

        if needs_clarification {
            let message = conversation::generate_clarification(s.model.as_ref(), &record).await;
            let current_plan: Vec<serde_json::Value> = record
                .actions
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "step": a.id,
                        "action": a.description,
                        "service": a.service_hint,
                    })
                })
                .collect();

            self.emit(
                state,
                "conversation.clarification_needed",
                message.clone(),
                Some(serde_json::json!({
                    "questions": record.clarification_needed,
                    "current_plan": current_plan,
                    "assumed_defaults": record.assumed_defaults,
                    "confidence": record.confidence,
                    "original_request": state.user_request,
                })),
            )
            .await;

            state.clarifications_asked += 1;
            let original_request = state.user_request.clone();
            state.messages.push(format!("user: {original_request}"));
            state.messages.push(format!("assistant: {message}"));
            let questions = record.clarification_needed.clone();
            state.requirement = Some(record);

            return Ok(Transition::Suspend(RunOutcome::NeedsClarification {
                correlation_id: state.correlation_id.clone(),
                questions,
                message,
                current_plan,
                original_request,
            }));
        }

        state.requirement = Some(record);
        state.phase = RunPhase::Planning;
        Ok(Transition::Next(StageTag::ApiDiscovery))
    }

    // ── Stage 2: API Discovery ───────────────────────────────

    async fn stage_discovery(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let requirement = state
            .requirement
            .clone()
            .context("requirement record missing before discovery")?;

        let outcome = discovery::discover_all(
            s.model.as_ref(),
            s.embedder.as_ref(),
            &s.index,
            &s.corpus,
            s.secrets.as_ref(),
            &s.settings,
            &requirement,
        )
        .await?;

        for found in &outcome.discovered {
            self.emit(
                state,
                "api.discovered",
                format!("Found: {} → {}", found.endpoint.service, found.endpoint.endpoint),
                Some(serde_json::json!({
                    "service": found.endpoint.service,
                    "endpoint": found.endpoint.endpoint,
                    "score": found.score,
                    "justification": found.justification,
                })),
            )
            .await;
        }
        for service in &outcome.skipped_services {
            self.emit(
                state,
                "discovery.skipped",
                format!("{service} has no configured credentials"),
                Some(serde_json::json!({ "service": service })),
            )
            .await;
        }
        for action in &outcome.dropped {
            self.emit(
                state,
                "discovery.miss",
                format!("No API match for: {}", action.description),
                Some(serde_json::json!({ "action": action.description })),
            )
            .await;
        }

        let total = requirement.actions.iter().filter(|a| !a.is_trigger).count();
        let matched = outcome.discovered.len();
        if outcome.dropped.is_empty() && outcome.unmatched.is_empty() {
            self.emit(
                state,
                "discovery.complete",
                format!("Discovered {matched} APIs — all actions matched"),
                None,
            )
            .await;
        } else {
            self.emit(
                state,
                "discovery.partial",
                format!("Matched {matched}/{total} actions"),
                Some(serde_json::json!({
                    "matched": matched,
                    "total": total,
                    "dropped": outcome.dropped.iter().map(|a| a.description.clone()).collect::<Vec<_>>(),
                })),
            )
            .await;
        }

        // Dropped actions leave the plan and are reported with the
        // assumed defaults; credential-skipped actions stay as research
        // steps so generated code can skip them gracefully.
        if let Some(requirement) = state.requirement.as_mut() {
            let dropped_ids: Vec<String> = outcome.dropped.iter().map(|a| a.id.clone()).collect();
            requirement
                .actions
                .retain(|a| a.is_trigger || !dropped_ids.contains(&a.id));
            for action in &outcome.dropped {
                requirement
                    .assumed_defaults
                    .push(format!("Skipped (no matching API): {}", action.description));
            }
        }

        state.discovered = outcome.discovered;
        state.unmatched_actions = outcome.unmatched;
        state.skipped_services = outcome.skipped_services;
        Ok(Transition::Next(StageTag::Planner))
    }

    // ── Stage 3: Planner ─────────────────────────────────────

    async fn stage_planner(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let requirement = state
            .requirement
            .clone()
            .context("requirement record missing before planning")?;

        let planned = planner::build_dag(
            s.model.as_ref(),
            &s.settings,
            &requirement,
            &state.discovered,
            &state.unmatched_actions,
        )
        .await?;

        for warning in &planned.warnings {
            self.emit(state, "planner.warning", warning.clone(), None).await;
        }

        let dag = planned.dag;
        dag.validate().context("planner produced an invalid DAG")?;

        self.emit(
            state,
            "dag.planned",
            format!("Workflow DAG created with {} steps", dag.steps.len()),
            Some(serde_json::json!({
                "steps": dag
                    .steps
                    .iter()
                    .map(|st| serde_json::json!({
                        "id": st.id,
                        "name": st.name,
                        "depends_on": st.depends_on,
                    }))
                    .collect::<Vec<_>>(),
                "parallel_possible": dag.parallel_groups(),
            })),
        )
        .await;

        state.dag = Some(dag);
        Ok(Transition::Next(StageTag::Mapper))
    }

    // ── Stage 4: Mapper ──────────────────────────────────────

    async fn stage_mapper(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let dag = state.dag.clone().context("DAG missing before mapping")?;

        let (mappings, warnings) = planner::map_data_flows(s.model.as_ref(), &dag).await?;
        for warning in &warnings {
            self.emit(state, "mapper.warning", warning.clone(), None).await;
        }
        self.emit(
            state,
            "mapping.complete",
            format!("Synthesized bindings for {} edges", mappings.len()),
            None,
        )
        .await;

        state.mappings = mappings;
        state.phase = RunPhase::Generating;
        Ok(Transition::Next(StageTag::Codegen))
    }

    // ── Stage 5: Codegen ─────────────────────────────────────

    async fn stage_codegen(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let dag = state.dag.clone().context("DAG missing before codegen")?;

        let project_dir =
            std::env::temp_dir().join(format!("forgeflow_codegen_{}", state.correlation_id));
        tokio::fs::create_dir_all(&project_dir)
            .await
            .context("failed to create codegen project dir")?;

        let output = codegen::generate_workflow_code(
            s.model.as_ref(),
            s.corpus.clone(),
            s.secrets.as_ref(),
            &s.settings,
            &dag,
            &state.mappings,
            project_dir,
        )
        .await?;

        for call in &output.tool_calls {
            self.emit(
                state,
                "tool.calling",
                format!("tool: {}", call.tool),
                Some(serde_json::json!({
                    "tool": call.tool,
                    "args_keys": call.args_keys,
                    "result_preview": call.result_preview,
                })),
            )
            .await;
        }

        let lines = output.artifact.line_count();
        let preview: String = output.artifact.code.chars().take(500).collect();
        self.emit(
            state,
            "code.generated",
            format!("Python code generated ({lines} lines)"),
            Some(serde_json::json!({
                "lines": lines,
                "preview": preview,
                "extra_files": output.artifact.extra_files.keys().collect::<Vec<_>>(),
            })),
        )
        .await;

        state.artifact = Some(output.artifact);
        Ok(Transition::Next(StageTag::Security))
    }

    // ── Stage 6: Security ────────────────────────────────────

    async fn stage_security(&self, state: &mut PipelineState) -> Result<Transition> {
        let artifact = state.artifact.clone().context("artifact missing before security")?;
        let report = scan(&artifact.code, &self.services.scan_config);

        self.emit(
            state,
            "security.complete",
            format!("Security review: {}", report.summary()),
            Some(serde_json::to_value(&report)?),
        )
        .await;

        if report.safe {
            state.security_failed = false;
            Ok(Transition::Next(StageTag::TestScaffold))
        } else {
            self.enter_security_debug(state, &report).await
        }
    }

    /// A blocking security violation feeds the self-debug loop.
    async fn enter_security_debug(
        &self,
        state: &mut PipelineState,
        report: &SecurityReport,
    ) -> Result<Transition> {
        state.security_failed = true;
        state.last_execution = Some(security_failure_result(report));
        if state.debug_attempts >= self.services.settings.max_debug_attempts {
            Ok(Transition::Fail {
                category: ErrorCategory::SecurityViolation,
                message: report.summary(),
            })
        } else {
            Ok(Transition::Next(StageTag::SelfDebug))
        }
    }

    // ── Stage 7: Test Scaffold ───────────────────────────────

    async fn stage_test_scaffold(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let dag = state.dag.clone().context("DAG missing before test scaffold")?;
        let artifact = state
            .artifact
            .clone()
            .context("artifact missing before test scaffold")?;

        let tests = codegen::generate_tests(s.model.as_ref(), &dag, &artifact).await;
        self.emit(
            state,
            "testing.generated",
            format!("Generated {}-line test suite", tests.lines().count()),
            None,
        )
        .await;

        state.test_code = Some(tests);
        state.phase = RunPhase::Testing;
        Ok(Transition::Next(StageTag::SandboxExecute))
    }

    // ── Stage 8: Sandbox Execute ─────────────────────────────

    async fn stage_sandbox(
        &self,
        state: &mut PipelineState,
        cancel: &CancelFlag,
    ) -> Result<Transition> {
        let s = &self.services;
        let dag = state.dag.clone().context("DAG missing before execution")?;
        let artifact = state
            .artifact
            .clone()
            .context("artifact missing before execution")?;

        // Patched artifacts go back through the scanner before they run.
        let report = scan(&artifact.code, &s.scan_config);
        if state.security_failed || !report.safe {
            self.emit(
                state,
                "security.complete",
                format!("Security re-review: {}", report.summary()),
                Some(serde_json::to_value(&report)?),
            )
            .await;
        }
        if !report.safe {
            return self.enter_security_debug(state, &report).await;
        }
        state.security_failed = false;

        let attempt = state.debug_attempts + 1;
        self.emit(
            state,
            "execution.started",
            format!("Executing in sandbox (attempt {attempt})"),
            Some(serde_json::json!({ "attempt": attempt, "sandbox": s.sandbox.name() })),
        )
        .await;

        let env = s.secrets.resolve_env(&dag.environment_vars);
        let timeout = Duration::from_secs(s.settings.sandbox_timeout_secs);

        // The execute future is dropped on cancellation, which releases
        // the sandbox (the container backend kills on drop).
        let result = tokio::select! {
            result = s.sandbox.execute(&artifact, &dag, &env, timeout) => result?,
            _ = cancel.cancelled() => return Ok(Transition::Cancelled),
        };

        if result.success {
            let mut result = result;
            result.step_transitions = dag
                .steps
                .iter()
                .map(|st| StepTransition {
                    step_id: st.id.clone(),
                    status: StepStatus::Success,
                })
                .collect();
            self.emit(
                state,
                "execution.success",
                "Code executed successfully".to_string(),
                Some(serde_json::json!({
                    "stdout": result.stdout.chars().take(500).collect::<String>(),
                    "execution_time": result.execution_time_secs,
                })),
            )
            .await;
            state.last_execution = Some(result);
            Ok(Transition::Next(StageTag::Deploy))
        } else {
            self.emit(
                state,
                "execution.failed",
                format!(
                    "Execution failed: {}",
                    result.error.as_deref().unwrap_or("unknown error")
                ),
                Some(serde_json::json!({
                    "stderr": result.stderr.chars().take(500).collect::<String>(),
                    "exit_code": result.exit_code,
                    "attempt": attempt,
                })),
            )
            .await;

            let category = execution::parse_error(&result.stderr, &artifact.code)
                .category
                .unwrap_or(ErrorCategory::Unknown);
            state.last_execution = Some(result);

            if state.debug_attempts >= s.settings.max_debug_attempts {
                Ok(Transition::Fail {
                    category,
                    message: "sandbox execution failed with the debug budget exhausted".into(),
                })
            } else {
                Ok(Transition::Next(StageTag::SelfDebug))
            }
        }
    }

    // ── Stage 9: Self-Debug ──────────────────────────────────

    async fn stage_self_debug(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let dag = state.dag.clone().context("DAG missing before self-debug")?;
        let artifact = state
            .artifact
            .clone()
            .context("artifact missing before self-debug")?;
        let result = state
            .last_execution
            .clone()
            .context("no execution result to debug")?;

        let attempt = state.debug_attempts + 1;
        let max = s.settings.max_debug_attempts;
        self.emit(
            state,
            "debug.started",
            format!("Self-debug attempt {attempt}/{max}"),
            None,
        )
        .await;

        let diagnosis = if state.security_failed {
            Diagnosis {
                category: ErrorCategory::SecurityViolation,
                root_cause: result
                    .error
                    .clone()
                    .unwrap_or_else(|| "security review rejected the artifact".into()),
                fix_plan: format!(
                    "Remove the flagged constructs and replace them with safe equivalents:\n{}",
                    result.stderr
                ),
                parsed: Default::default(),
            }
        } else {
            execution::diagnose(s.model.as_ref(), &artifact, &result, &dag, attempt, max).await?
        };

        let (patched, record) =
            execution::patch(s.model.as_ref(), &artifact, &dag, &diagnosis, attempt).await?;

        self.emit(
            state,
            "debug.diagnosed",
            format!("Diagnosis: {} — {}", record.category, record.fix_description),
            Some(serde_json::json!({
                "category": record.category,
                "root_cause": record.root_cause,
                "fix": record.fix_description,
                "attempt": attempt,
            })),
        )
        .await;

        state.artifact = Some(patched);
        state.debug_attempts = attempt;
        let category = record.category;
        let root_cause = record.root_cause.clone();
        state.debug_history.push(record);

        if attempt < max {
            Ok(Transition::Next(StageTag::SandboxExecute))
        } else {
            Ok(Transition::Fail {
                category,
                message: root_cause,
            })
        }
    }

    // ── Stage 10: Deploy ─────────────────────────────────────

    async fn stage_deploy(&self, state: &mut PipelineState) -> Result<Transition> {
        let s = &self.services;
        let dag = state.dag.clone().context("DAG missing before deploy")?;
        let artifact = state
            .artifact
            .clone()
            .context("artifact missing before deploy")?;

        let handoff = DeploymentHandoff {
            correlation_id: state.correlation_id.clone(),
            workflow_name: dag.name.clone(),
            environment_vars: dag.environment_vars.clone(),
            artifact,
            dag,
            test_code: state.test_code.clone(),
            report: RunReport {
                debug_history: state.debug_history.clone(),
                last_execution: state.last_execution.clone(),
                events_emitted: state.seq,
            },
        };

        let receipt = s
            .packager
            .deploy(&handoff)
            .await
            .context("deployment packaging failed")?;

        let final_message = if state.debug_attempts > 0 {
            format!(
                "Workflow deployed after {} self-debug fix(es): {}",
                state.debug_attempts, receipt.location
            )
        } else {
            format!("Workflow deployed: {}", receipt.location)
        };

        self.emit(
            state,
            "workflow.deployed",
            final_message.clone(),
            Some(serde_json::json!({
                "location": receipt.location,
                "files": receipt.files,
            })),
        )
        .await;

        state.deployed = true;
        state.phase = RunPhase::Deployed;
        state.final_message = final_message.clone();
        Ok(Transition::Finish(RunOutcome::Deployed {
            receipt,
            final_message,
        }))
    }

    // ── Terminal helpers ─────────────────────────────────────

    async fn finish_failed(
        &self,
        state: &mut PipelineState,
        category: ErrorCategory,
        message: String,
    ) -> Result<RunOutcome> {
        self.emit(
            state,
            "stage.failed",
            format!("{} failed: {message}", state.stage),
            Some(serde_json::json!({ "category": category })),
        )
        .await;

        state.phase = RunPhase::Failed;
        state.final_message = message.clone();
        self.emit(
            state,
            "pipeline.failed",
            message.clone(),
            Some(serde_json::json!({
                "stage": state.stage,
                "category": category,
                "last_debug": state.debug_history.last(),
            })),
        )
        .await;

        // The partial artifact stays in the checkpoint for inspection.
        self.services.checkpoints.save(state)?;

        Ok(RunOutcome::Failed {
            stage: state.stage,
            category,
            message,
            last_debug: state.debug_history.last().cloned(),
        })
    }

    async fn finish_cancelled(&self, state: &mut PipelineState) -> Result<RunOutcome> {
        state.phase = RunPhase::Cancelled;
        self.emit(state, "pipeline.cancelled", "Run cancelled".to_string(), None)
            .await;
        // Checkpoint kept so the cancellation is auditable.
        self.services.checkpoints.save(state)?;
        Ok(RunOutcome::Cancelled)
    }

    async fn emit(
        &self,
        state: &mut PipelineState,
        event_type: &str,
        message: String,
        data: Option<serde_json::Value>,
    ) {
        let seq = state.next_seq();
        let mut event = PipelineEvent::new(
            state.correlation_id.clone(),
            seq,
            state.stage,
            state.phase,
            event_type,
        )
        .with_message(message);
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.services.sink.emit(event).await;
    }
}

/// Stage-specific payload attached to `stage.completed`.
fn stage_payload(state: &PipelineState) -> Option<serde_json::Value> {
    match state.stage {
        StageTag::ApiDiscovery => Some(serde_json::json!({
            "discovered": state
                .discovered
                .iter()
                .map(|d| serde_json::json!({
                    "service": d.endpoint.service,
                    "endpoint": d.endpoint.endpoint,
                    "score": d.score,
                }))
                .collect::<Vec<_>>(),
        })),
        StageTag::Planner => state.dag.as_ref().map(|dag| {
            serde_json::json!({
                "steps": dag.steps.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            })
        }),
        StageTag::Codegen => state.artifact.as_ref().map(|a| {
            serde_json::json!({ "lines": a.line_count() })
        }),
        _ => None,
    }
}

/// Synthetic failed execution for a blocking security report, feeding
/// the self-debug loop.
fn security_failure_result(report: &SecurityReport) -> ExecutionResult {
    let findings: Vec<String> = report
        .findings
        .iter()
        .map(|f| format!("line {}: {:?}: {}", f.line, f.category, f.description))
        .collect();
    ExecutionResult {
        success: false,
        exit_code: None,
        stdout: String::new(),
        stderr: findings.join("\n"),
        error: Some("security review rejected the artifact".into()),
        execution_time_secs: 0.0,
        sandbox: "security_review".into(),
        step_transitions: vec![],
    }
}

/// Map an error to (category, is_resource). Only resource errors are
/// eligible for silent stage retry.
fn classify_error(e: &anyhow::Error) -> (ErrorCategory, bool) {
    if let Some(llm) = e.downcast_ref::<LlmError>() {
        return match llm {
            LlmError::Http(inner) if inner.is_timeout() => (ErrorCategory::Timeout, true),
            LlmError::Http(_) | LlmError::EmptyResponse => (ErrorCategory::NetworkError, true),
            LlmError::Api { .. } if llm.is_retryable() => (ErrorCategory::NetworkError, true),
            LlmError::Api { .. } => (ErrorCategory::Unknown, false),
            LlmError::SchemaParse { .. } => (ErrorCategory::SchemaMismatch, false),
            LlmError::MissingApiKey => (ErrorCategory::AuthFailure, false),
        };
    }
    if e.downcast_ref::<CodegenError>().is_some() {
        // Budget and malformed-turn errors: fatal, never retried.
        return (ErrorCategory::Unknown, false);
    }
    if e.downcast_ref::<std::io::Error>().is_some() {
        // Sandbox backend or filesystem unavailable.
        return (ErrorCategory::NetworkError, true);
    }
    (ErrorCategory::Unknown, false)
}
