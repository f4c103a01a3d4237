//! DAG construction from the requirement record and discovered APIs.
//!
//! The model proposes the plan; this module normalizes it into a DAG
//! that holds the structural invariants: trigger first, dependencies
//! reference earlier steps only, exactly one root. A back-reference
//! that would introduce a cycle is dropped and surfaced as a warning;
//! the later step in textual order wins.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

use forgeflow_llm::LanguageModel;

use crate::config::Settings;
use crate::models::{
    ActionIntent, ApiHint, DiscoveredEndpoint, ErrorPolicy, RequirementRecord, StepType,
    TriggerSpec, WorkflowDag, WorkflowStep,
};
use crate::utils::llm_json_with_retry;

const PLANNER_SYSTEM: &str = r#"You are a workflow planner. Build an execution DAG from requirements and discovered APIs.

RULES:
1. Each step maps to one real operation (API call, HTTP request, data processing)
2. Include a trigger step as the FIRST step (step_type "trigger")
3. Steps with no dependency on each other may run in parallel: give them the same depends_on
4. For steps WITH a matching discovered API: set api_index to its 0-based index
5. For steps WITHOUT a matching API: set api_index to null, research_required to true, and include an api_hint with the service name and docs URL
6. Every step needs a clear, specific description
7. depends_on may only reference steps that appear EARLIER in the list
8. environment_vars lists every credential env var the workflow reads

OUTPUT ONLY valid JSON:
{
  "name": "workflow name",
  "description": "one-line description",
  "trigger": {"trigger_type": "manual|webhook|schedule|event", "description": "...", "payload": {"field": "description"}},
  "steps": [
    {
      "id": "step_1",
      "name": "Human-readable step name",
      "description": "what this step does",
      "step_type": "trigger|api_call|condition|delay",
      "api_index": 0,
      "research_required": false,
      "api_hint": {"service": "", "docs_url": "", "likely_endpoint": "", "auth": ""},
      "inputs": {"param": "literal or {{step_id.field}}"},
      "outputs": {"field": "description"},
      "depends_on": [],
      "error_handling": "retry|fallback|abort",
      "condition": null
    }
  ],
  "environment_vars": ["SLACK_BOT_TOKEN"]
}"#;

#[derive(Debug, Deserialize)]
struct PlanJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    trigger: Option<TriggerSpec>,
    #[serde(default)]
    steps: Vec<PlanStep>,
    #[serde(default)]
    environment_vars: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PlanStep {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    step_type: String,
    #[serde(default)]
    api_index: Option<usize>,
    #[serde(default)]
    research_required: bool,
    #[serde(default)]
    api_hint: Option<ApiHint>,
    #[serde(default)]
    inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    error_handling: String,
    #[serde(default)]
    condition: Option<String>,
}

/// The planner result: the normalized DAG plus warnings about dropped
/// dependencies.
#[derive(Debug)]
pub struct PlannedDag {
    pub dag: WorkflowDag,
    pub warnings: Vec<String>,
}

pub async fn build_dag(
    model: &dyn LanguageModel,
    _settings: &Settings,
    requirement: &RequirementRecord,
    discovered: &[DiscoveredEndpoint],
    unmatched: &[ActionIntent],
) -> Result<PlannedDag> {
    let apis_info: Vec<serde_json::Value> = discovered
        .iter()
        .map(|d| {
            serde_json::json!({
                "service": d.endpoint.service,
                "endpoint": d.endpoint.endpoint,
                "method": d.endpoint.method,
                "description": d.endpoint.description,
                "parameters": d.endpoint.parameters,
                "for_action": d.action_id,
            })
        })
        .collect();

    let mut prompt = format!(
        "REQUIREMENTS:\n{}\n\nDISCOVERED APIs:\n{}",
        serde_json::to_string_pretty(requirement)?,
        serde_json::to_string_pretty(&apis_info)?,
    );
    if !unmatched.is_empty() {
        prompt.push_str(&format!(
            "\n\nUNMATCHED ACTIONS (no pre-indexed API — set research_required=true and give an api_hint):\n{}",
            serde_json::to_string_pretty(unmatched)?,
        ));
    }

    let plan = match llm_json_with_retry(model, PLANNER_SYSTEM, &prompt).await {
        Ok(value) => match serde_json::from_value::<PlanJson>(value) {
            Ok(plan) if !plan.steps.is_empty() => plan,
            _ => return Ok(fallback_dag(requirement, discovered)),
        },
        Err(e) if !e.is_retryable() => {
            // Content failure after the structured retry: plan without
            // the model rather than failing the run.
            return Ok(fallback_dag(requirement, discovered));
        }
        Err(e) => return Err(e).context("planner call failed"),
    };

    Ok(normalize_plan(plan, requirement, discovered))
}

/// Turn the raw plan into a DAG holding the invariants.
fn normalize_plan(
    plan: PlanJson,
    requirement: &RequirementRecord,
    discovered: &[DiscoveredEndpoint],
) -> PlannedDag {
    let mut warnings = Vec::new();
    let mut steps: Vec<WorkflowStep> = Vec::new();

    let mut raw_steps = plan.steps;
    // Trigger first: promote a planned trigger or synthesize one.
    let trigger_pos = raw_steps
        .iter()
        .position(|s| s.step_type.eq_ignore_ascii_case("trigger"));
    let trigger_step = match trigger_pos {
        Some(pos) => {
            let s = raw_steps.remove(pos);
            if pos != 0 {
                warnings.push(format!("trigger step '{}' moved to the front", s.id));
            }
            WorkflowStep {
                id: if s.id.is_empty() { "trigger".into() } else { s.id },
                name: if s.name.is_empty() { "Trigger".into() } else { s.name },
                description: s.description,
                step_type: StepType::Trigger,
                endpoint: None,
                inputs: BTreeMap::new(),
                outputs: s.outputs,
                depends_on: vec![],
                error_handling: ErrorPolicy::Abort,
                condition: None,
                research_required: false,
                api_hint: None,
                status: Default::default(),
            }
        }
        None => {
            warnings.push("plan had no trigger step; one was synthesized".into());
            WorkflowStep {
                id: "trigger".into(),
                name: "Trigger".into(),
                description: requirement
                    .triggers
                    .first()
                    .map(|t| t.description.clone())
                    .unwrap_or_default(),
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
            }
        }
    };
    let trigger_id = trigger_step.id.clone();
    steps.push(trigger_step);

    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(trigger_id.clone());

    for (i, raw) in raw_steps.into_iter().enumerate() {
        let mut id = if raw.id.is_empty() {
            format!("step_{}", i + 1)
        } else {
            raw.id
        };
        while seen.contains(&id) {
            warnings.push(format!("duplicate step id '{id}' was renamed"));
            id.push_str("_x");
        }

        // Keep only dependencies on earlier steps. A reference to a
        // later or unknown step is the planner introducing a cycle;
        // the later step in textual order wins and the back-reference
        // goes away.
        let mut depends_on: Vec<String> = Vec::new();
        for dep in raw.depends_on {
            if seen.contains(&dep) {
                depends_on.push(dep);
            } else {
                warnings.push(format!("step '{id}' dropped back-reference to '{dep}'"));
            }
        }
        if depends_on.is_empty() {
            depends_on.push(trigger_id.clone());
        }

        let endpoint = raw
            .api_index
            .and_then(|idx| discovered.get(idx))
            .map(|d| d.endpoint.clone());

        let outputs = if raw.outputs.is_empty() {
            endpoint
                .as_ref()
                .map(|e| e.response_fields.clone())
                .unwrap_or_default()
        } else {
            raw.outputs
        };

        let research_required = raw.research_required || endpoint.is_none();

        steps.push(WorkflowStep {
            id: id.clone(),
            name: if raw.name.is_empty() { id.clone() } else { raw.name },
            description: raw.description,
            step_type: match raw.step_type.to_lowercase().as_str() {
                "condition" => StepType::Condition,
                "delay" => StepType::Delay,
                _ => StepType::ApiCall,
            },
            endpoint,
            inputs: raw
                .inputs
                .into_iter()
                .map(|(k, v)| (k, value_to_expr(v)))
                .collect(),
            outputs,
            depends_on,
            error_handling: ErrorPolicy::parse(&raw.error_handling),
            condition: raw.condition,
            research_required,
            api_hint: raw.api_hint,
            status: Default::default(),
        });
        seen.insert(id);
    }

    let environment_vars = collect_env_vars(plan.environment_vars, discovered);

    let dag = WorkflowDag {
        id: short_id(),
        name: if plan.name.is_empty() {
            requirement.workflow_name.clone()
        } else {
            plan.name
        },
        description: if plan.description.is_empty() {
            requirement.description.clone()
        } else {
            plan.description
        },
        trigger: plan
            .trigger
            .or_else(|| requirement.triggers.first().cloned())
            .unwrap_or_default(),
        steps,
        environment_vars,
        global_error_policy: ErrorPolicy::Retry,
    };

    debug_assert!(dag.validate().is_ok());
    PlannedDag { dag, warnings }
}

/// Simple sequential DAG when the model plan is unusable: trigger, then
/// one step per action chained in described order.
pub fn fallback_dag(
    requirement: &RequirementRecord,
    discovered: &[DiscoveredEndpoint],
) -> PlannedDag {
    let mut steps = vec![WorkflowStep {
        id: "trigger".into(),
        name: "Trigger".into(),
        description: requirement
            .triggers
            .first()
            .map(|t| t.description.clone())
            .unwrap_or_default(),
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
    }];

    let mut prev = "trigger".to_string();
    for (i, action) in requirement
        .actions
        .iter()
        .filter(|a| !a.is_trigger)
        .enumerate()
    {
        let id = format!("step_{}", i + 1);
        let endpoint = discovered
            .iter()
            .find(|d| d.action_id == action.id)
            .map(|d| d.endpoint.clone());
        let research_required = endpoint.is_none();
        steps.push(WorkflowStep {
            id: id.clone(),
            name: action.description.chars().take(50).collect(),
            description: action.description.clone(),
            step_type: StepType::ApiCall,
            endpoint: endpoint.clone(),
            inputs: action
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), value_to_expr(v.clone())))
                .collect(),
            outputs: endpoint
                .map(|e| e.response_fields.clone())
                .unwrap_or_default(),
            depends_on: vec![prev.clone()],
            error_handling: ErrorPolicy::Retry,
            condition: None,
            research_required,
            api_hint: None,
            status: Default::default(),
        });
        prev = id;
    }

    let environment_vars = collect_env_vars(Vec::new(), discovered);
    PlannedDag {
        dag: WorkflowDag {
            id: short_id(),
            name: requirement.workflow_name.clone(),
            description: requirement.description.clone(),
            trigger: requirement.triggers.first().cloned().unwrap_or_default(),
            steps,
            environment_vars,
            global_error_policy: ErrorPolicy::Retry,
        },
        warnings: vec!["planner output unusable; built a sequential fallback DAG".into()],
    }
}

/// Union of the planned env vars and the credential table entries for
/// every bound service, deduped and sorted.
fn collect_env_vars(planned: Vec<String>, discovered: &[DiscoveredEndpoint]) -> Vec<String> {
    let mut vars: HashSet<String> = planned.into_iter().collect();
    for d in discovered {
        if let Some(required) = Settings::required_credentials(&d.endpoint.service) {
            for v in required {
                vars.insert(v.to_string());
            }
        }
    }
    let mut out: Vec<String> = vars.into_iter().collect();
    out.sort();
    out
}

fn value_to_expr(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
