//! Inter-step data mapping.
//!
//! For each DAG edge group (producers → consumer) one LLM JSON call
//! synthesizes input-binding expressions over symbolic `{{step.field}}`
//! references. Expressions are pure value transformations: a reference
//! must resolve to a field some ancestor declares in its output schema,
//! or to a trigger payload field.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use forgeflow_llm::LanguageModel;

use crate::models::{DataMapping, WorkflowDag};
use crate::utils::{json_str, llm_json_with_retry};

const MAPPER_SYSTEM: &str = r#"You map data between workflow steps. Given source step outputs and target step inputs, generate input-binding expressions.

RULES:
1. Reference source data as {{step_id.field}} (or {{trigger.field}} for trigger payload fields)
2. Expressions are pure value transformations: string templates over references, no side effects
3. Only reference fields that actually appear in a source step's outputs or the trigger payload
4. If the target inputs already contain literal values the user specified (channel names, addresses, message text), keep those EXACT values

Output ONLY valid JSON:
{"mapping": {"target_param": "expression using {{step.field}} references"}, "explanation": "brief description"}"#;

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_]+)[A-Za-z0-9_.]*\s*\}\}")
            .expect("reference regex")
    })
}

/// Generate data mappings for every step with dependencies, in DAG
/// order. Invalid references are stripped so the reference-soundness
/// invariant holds for everything returned.
pub async fn map_data_flows(
    model: &dyn LanguageModel,
    dag: &WorkflowDag,
) -> Result<(Vec<DataMapping>, Vec<String>)> {
    let mut mappings = Vec::new();
    let mut warnings = Vec::new();

    for step in dag.steps.iter().filter(|s| !s.depends_on.is_empty()) {
        let sources: Vec<serde_json::Value> = step
            .depends_on
            .iter()
            .filter_map(|id| dag.step(id))
            .map(|src| {
                serde_json::json!({
                    "step_id": src.id,
                    "name": src.name,
                    "description": src.description,
                    "outputs": src.outputs,
                    "service": src.endpoint.as_ref().map(|e| e.service.clone()),
                })
            })
            .collect();

        let target_params: serde_json::Value = match &step.endpoint {
            Some(ep) => serde_json::to_value(&ep.parameters)?,
            None => serde_json::json!(step.inputs),
        };

        let prompt = format!(
            "SOURCE STEPS:\n{}\n\nTRIGGER PAYLOAD FIELDS:\n{}\n\nTARGET STEP: {}\nTARGET DESCRIPTION: {}\nTARGET INPUTS (use these exact values): {}\nTARGET PARAMETERS: {}",
            serde_json::to_string_pretty(&sources)?,
            serde_json::to_string_pretty(&dag.trigger.payload)?,
            step.name,
            step.description,
            serde_json::to_string(&step.inputs)?,
            serde_json::to_string(&target_params)?,
        );

        let value = llm_json_with_retry(model, MAPPER_SYSTEM, &prompt)
            .await
            .with_context(|| format!("data mapping failed for step '{}'", step.id))?;

        let raw: BTreeMap<String, String> = value
            .get("mapping")
            .and_then(|m| m.as_object())
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let expr = match v.as_str() {
                            Some(s) => s.to_string(),
                            None => v.to_string(),
                        };
                        (k.clone(), expr)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut mapping = BTreeMap::new();
        for (param, expr) in raw {
            match validate_references(dag, &step.id, &expr) {
                Ok(()) => {
                    mapping.insert(param, expr);
                }
                Err(reason) => {
                    warnings.push(format!(
                        "step '{}': dropped binding for '{}': {}",
                        step.id, param, reason
                    ));
                }
            }
        }

        mappings.push(DataMapping {
            from_steps: step.depends_on.clone(),
            to_step: step.id.clone(),
            mapping,
            explanation: json_str(&value, "explanation"),
        });
    }

    Ok((mappings, warnings))
}

/// Check every `{{step.field}}` reference in an expression: the step
/// must be an ancestor of the consumer (or the trigger), and the field
/// must exist in the producer's declared outputs or the trigger payload.
pub fn validate_references(dag: &WorkflowDag, to_step: &str, expr: &str) -> Result<(), String> {
    let ancestors = dag.ancestors(to_step);
    for caps in reference_regex().captures_iter(expr) {
        let source = &caps[1];
        let field = &caps[2];

        if source == "trigger" || dag.step(source).map(|s| s.depends_on.is_empty()).unwrap_or(false)
        {
            // Root reference: resolve against the trigger payload.
            let is_root = source == "trigger" || ancestors.contains(source);
            if !is_root {
                return Err(format!("'{source}' is not an ancestor of '{to_step}'"));
            }
            if !dag.trigger.payload.contains_key(field)
                && dag
                    .step(source)
                    .map(|s| !s.outputs.contains_key(field))
                    .unwrap_or(true)
            {
                return Err(format!("trigger payload has no field '{field}'"));
            }
            continue;
        }

        if !ancestors.contains(source) {
            return Err(format!("'{source}' is not an ancestor of '{to_step}'"));
        }
        let producer = dag
            .step(source)
            .ok_or_else(|| format!("unknown step '{source}'"))?;
        if !producer.outputs.contains_key(field) {
            return Err(format!(
                "step '{source}' declares no output field '{field}'"
            ));
        }
    }
    Ok(())
}
