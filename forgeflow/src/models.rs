//! Core data model for the ForgeFlow pipeline.
//!
//! These types flow between every stage: the requirement record produced
//! by the conversation engine, the endpoint documents of the API corpus,
//! the workflow DAG, the generated artifact, and the execution / debug
//! records of the sandbox loop. All of them serialize with serde so the
//! whole pipeline state can be checkpointed between stages.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

// ── API Discovery Models ──────────────────────────────────────

/// Authentication scheme of a documented endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    ApiKey,
    Bearer,
    Oauth2,
    WebsocketToken,
    None,
}

impl AuthScheme {
    /// Lenient parse from free-form spec strings ("http/bearer", "oauth2").
    pub fn parse(s: &str) -> Self {
        let lower = s.to_lowercase();
        if lower.contains("bearer") {
            AuthScheme::Bearer
        } else if lower.contains("oauth") {
            AuthScheme::Oauth2
        } else if lower.contains("websocket") {
            AuthScheme::WebsocketToken
        } else if lower == "none" || lower.is_empty() {
            AuthScheme::None
        } else {
            AuthScheme::ApiKey
        }
    }
}

/// One parameter of an endpoint's request schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn default_param_type() -> String {
    "string".into()
}

/// One record of the API corpus: a single documented operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDoc {
    pub service: String,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub response_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: AuthScheme,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub code_example: String,
}

impl EndpointDoc {
    /// Stable id used by the vector index and LLM rerank prompts.
    pub fn doc_id(&self) -> String {
        format!("{}:{} {}", self.service, self.method, self.endpoint)
    }

    /// The text embedded for semantic retrieval.
    pub fn embedding_text(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| {
                format!(
                    "{} ({}): {}",
                    p.name,
                    if p.required { "required" } else { "optional" },
                    p.description
                )
            })
            .collect();
        format!(
            "Service: {}\nEndpoint: {} {}\nDescription: {}\nParameters: {}\nAuthentication: {:?}",
            self.service,
            self.method,
            self.endpoint,
            self.description,
            if params.is_empty() {
                "No parameters".to_string()
            } else {
                params.join("; ")
            },
            self.auth,
        )
    }
}

/// An endpoint matched to one action: the document, the rerank score,
/// and the model's one-sentence justification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub action_id: String,
    pub endpoint: EndpointDoc,
    pub score: f64,
    pub justification: String,
}

// ── Requirement Models ────────────────────────────────────────

/// One action extracted from the user's description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionIntent {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub service_hint: String,
    #[serde(default)]
    pub api_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub is_trigger: bool,
    /// Services the user explicitly ruled out for this action.
    #[serde(default)]
    pub excluded_services: Vec<String>,
}

/// What starts the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    #[serde(default = "default_trigger_type")]
    pub trigger_type: String,
    #[serde(default)]
    pub description: String,
    /// Fields the trigger injects into the step context.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

fn default_trigger_type() -> String {
    "manual".into()
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            trigger_type: default_trigger_type(),
            description: String::new(),
            payload: BTreeMap::new(),
        }
    }
}

/// Normalized description of user intent, produced by stage 1 and
/// immutable after stage 3.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequirementRecord {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<ActionIntent>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Recomputed by the conversation engine; never trusted from the model.
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub clarification_needed: Vec<String>,
    #[serde(default)]
    pub assumed_defaults: Vec<String>,
}

// ── Workflow DAG Models ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Trigger,
    #[default]
    ApiCall,
    Condition,
    Delay,
}

/// Per-step error handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Bounded exponential backoff: start 1s, factor 2, max 3 tries.
    #[default]
    Retry,
    /// Swallow the error and record it.
    Fallback,
    /// Propagate to the orchestrator.
    Abort,
}

impl ErrorPolicy {
    /// Lenient parse from planner output ("retry_3x", "abort", ...).
    pub fn parse(s: &str) -> Self {
        let lower = s.to_lowercase();
        if lower.contains("abort") {
            ErrorPolicy::Abort
        } else if lower.contains("fallback") {
            ErrorPolicy::Fallback
        } else {
            ErrorPolicy::Retry
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Hint for steps without a pre-indexed API: the codegen agent will
/// research the service itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiHint {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub docs_url: String,
    #[serde(default)]
    pub likely_endpoint: String,
    #[serde(default)]
    pub auth: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub step_type: StepType,
    #[serde(default)]
    pub endpoint: Option<EndpointDoc>,
    /// Input bindings: parameter name to a literal or a `{{step.field}}`
    /// expression produced by the data mapper.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Declared output schema: field name to description.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub error_handling: ErrorPolicy,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub research_required: bool,
    #[serde(default)]
    pub api_hint: Option<ApiHint>,
    #[serde(default)]
    pub status: StepStatus,
}

/// The ordered, acyclic set of workflow steps produced by the planner.
///
/// Invariants, enforced by [`WorkflowDag::validate`]:
/// - every dependency id references a step earlier in the list,
/// - the dependency graph is acyclic,
/// - exactly one trigger step exists and it comes first.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowDag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub environment_vars: Vec<String>,
    #[serde(default)]
    pub global_error_policy: ErrorPolicy,
}

impl WorkflowDag {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut triggers = 0usize;

        for (i, step) in self.steps.iter().enumerate() {
            if step.step_type == StepType::Trigger {
                triggers += 1;
                if i != 0 {
                    anyhow::bail!("trigger step '{}' is not first", step.id);
                }
            }
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    anyhow::bail!(
                        "step '{}' depends on '{}' which is not an earlier step",
                        step.id,
                        dep
                    );
                }
            }
            if !seen.insert(&step.id) {
                anyhow::bail!("duplicate step id '{}'", step.id);
            }
        }

        if triggers != 1 {
            anyhow::bail!("workflow must have exactly one trigger step, found {triggers}");
        }

        // Earlier-only references already rule out cycles; keep an
        // explicit walk so a hand-built DAG cannot sneak one past us.
        if self.has_cycle() {
            anyhow::bail!("dependency graph contains a cycle");
        }

        Ok(())
    }

    fn has_cycle(&self) -> bool {
        let mut depth_cache: HashMap<&str, u32> = HashMap::new();
        for step in &self.steps {
            if self.depth_inner(&step.id, &mut depth_cache, &mut HashSet::new()).is_none() {
                return true;
            }
        }
        false
    }

    /// Depth of a step: 0 for the trigger, else 1 + max depth of its
    /// dependencies.
    pub fn depth(&self, step_id: &str) -> Option<u32> {
        self.depth_inner(step_id, &mut HashMap::new(), &mut HashSet::new())
    }

    fn depth_inner<'a>(
        &'a self,
        step_id: &'a str,
        cache: &mut HashMap<&'a str, u32>,
        visiting: &mut HashSet<&'a str>,
    ) -> Option<u32> {
        if let Some(&d) = cache.get(step_id) {
            return Some(d);
        }
        if !visiting.insert(step_id) {
            return None; // cycle
        }
        let step = self.step(step_id)?;
        let depth = if step.depends_on.is_empty() {
            0
        } else {
            let mut max = 0;
            for dep in &step.depends_on {
                max = max.max(self.depth_inner(dep, cache, visiting)? + 1);
            }
            max
        };
        visiting.remove(step_id);
        cache.insert(&step.id, depth);
        Some(depth)
    }

    /// Steps sharing an identical dependency set can run in parallel.
    pub fn parallel_groups(&self) -> Vec<Vec<String>> {
        let mut by_deps: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
        for step in &self.steps {
            let mut key = step.depends_on.clone();
            key.sort();
            by_deps.entry(key).or_default().push(step.id.clone());
        }
        by_deps.into_values().filter(|ids| ids.len() > 1).collect()
    }

    /// All transitive dependencies of a step.
    pub fn ancestors(&self, step_id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack: Vec<String> = self
            .step(step_id)
            .map(|s| s.depends_on.clone())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if out.insert(id.clone()) {
                if let Some(step) = self.step(&id) {
                    stack.extend(step.depends_on.iter().cloned());
                }
            }
        }
        out
    }
}

// ── Artifact & Execution Models ──────────────────────────────

/// The generated source for a workflow. Mutable across self-debug
/// iterations; everything else in the pipeline state treats it as a
/// replaceable value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeneratedArtifact {
    pub code: String,
    #[serde(default)]
    pub extra_files: BTreeMap<String, String>,
}

impl GeneratedArtifact {
    pub fn line_count(&self) -> usize {
        self.code.lines().count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransition {
    pub step_id: String,
    pub status: StepStatus,
}

/// Outcome of one sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_secs: f64,
    #[serde(default)]
    pub sandbox: String,
    #[serde(default)]
    pub step_transitions: Vec<StepTransition>,
}

// ── Debug Models ─────────────────────────────────────────────

/// Closed set of failure categories used by the self-debugger. Values
/// outside the set map to `Unknown` on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ImportError,
    AuthFailure,
    SchemaMismatch,
    RateLimit,
    MissingParam,
    LogicError,
    NetworkError,
    Timeout,
    SecurityViolation,
    Unknown,
}

impl ErrorCategory {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "IMPORT_ERROR" => ErrorCategory::ImportError,
            "AUTH_FAILURE" | "AUTH_ERROR" => ErrorCategory::AuthFailure,
            "SCHEMA_MISMATCH" => ErrorCategory::SchemaMismatch,
            "RATE_LIMIT" => ErrorCategory::RateLimit,
            "MISSING_PARAM" => ErrorCategory::MissingParam,
            "LOGIC_ERROR" | "SYNTAX_ERROR" => ErrorCategory::LogicError,
            "NETWORK_ERROR" => ErrorCategory::NetworkError,
            "TIMEOUT" => ErrorCategory::Timeout,
            "SECURITY_VIOLATION" => ErrorCategory::SecurityViolation,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ImportError => "IMPORT_ERROR",
            ErrorCategory::AuthFailure => "AUTH_FAILURE",
            ErrorCategory::SchemaMismatch => "SCHEMA_MISMATCH",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::MissingParam => "MISSING_PARAM",
            ErrorCategory::LogicError => "LOGIC_ERROR",
            ErrorCategory::NetworkError => "NETWORK_ERROR",
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::SecurityViolation => "SECURITY_VIOLATION",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One iteration of the self-debug loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugRecord {
    pub attempt: u32,
    pub category: ErrorCategory,
    pub root_cause: String,
    pub fix_description: String,
    #[serde(default)]
    pub diff: String,
}

// ── Mapping Models ───────────────────────────────────────────

/// Input bindings for one DAG edge group (producers → consumer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMapping {
    pub from_steps: Vec<String>,
    pub to_step: String,
    pub mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub explanation: String,
}
