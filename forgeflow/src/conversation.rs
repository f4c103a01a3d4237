//! Conversation engine: requirement extraction and clarification.
//!
//! Extraction is one structured-JSON call against a fixed schema, with a
//! single stricter retry on parse failure. Confidence is not taken from
//! the model: it is recomputed from the extracted record so the
//! clarification gate stays deterministic. Clarification itself never
//! blocks inside this module: the runner suspends the pipeline and the
//! caller resumes it with the user's answer.

use anyhow::{Context, Result};
use forgeflow_llm::LanguageModel;

use crate::models::RequirementRecord;
use crate::utils::llm_json_with_retry;

/// Maximum clarifying questions surfaced on suspend.
pub const MAX_CLARIFICATIONS: usize = 2;

const EXTRACTION_SYSTEM: &str = r#"You are a workflow requirement extractor. Analyze the user's workflow description and extract DETAILED, ACTIONABLE structured requirements.

RULES:
1. Decompose the request into 3-8 CONCRETE action steps, even if the user is vague
2. For each action, give a concrete service_hint (Slack, Gmail, Google Sheets, HTTP, Deriv)
3. If the user does not name services, infer the most likely ones for the use case
4. Each action description must be specific enough to implement as a single API call
5. Extract literal parameter values the user provided (channel names, addresses, message text) into the action's parameters object — never substitute defaults for values the user gave
6. When operational specifics are missing (recipient addresses, channel names, spreadsheet ids, trigger conditions), list up to 2 clarifying questions about the most critical gaps and record what you assumed in assumed_defaults
7. Low-impact gaps get sensible defaults listed in assumed_defaults, not questions

OUTPUT ONLY valid JSON:
{
  "intent": "notification|data_pipeline|onboarding|monitoring|trading_alert|custom",
  "workflow_name": "descriptive name",
  "description": "one-line summary",
  "actions": [
    {
      "id": "step_1",
      "description": "specific action with service details",
      "service_hint": "Slack|Gmail|Google Sheets|HTTP|Deriv",
      "api_type": "rest|websocket|email|http_check",
      "parameters": {"param_name": "literal value from the request"},
      "depends_on": [],
      "is_trigger": false
    }
  ],
  "triggers": [{"trigger_type": "webhook|schedule|event|manual", "description": "what starts it", "payload": {"field": "description"}}],
  "conditions": ["conditional logic if any"],
  "clarification_needed": ["question if specifics are missing"],
  "assumed_defaults": ["what was assumed"]
}"#;

/// Extract a requirement record from the accumulated message history and
/// the latest utterance. The returned record's `confidence` is the
/// recomputed score, not the model's.
pub async fn extract_requirements(
    model: &dyn LanguageModel,
    user_request: &str,
    history: &[String],
    known_services: &[String],
) -> Result<RequirementRecord> {
    let prompt = if history.is_empty() {
        user_request.to_string()
    } else {
        format!("{}\nuser: {}", history.join("\n"), user_request)
    };

    let value = llm_json_with_retry(model, EXTRACTION_SYSTEM, &prompt)
        .await
        .context("requirement extraction failed")?;

    let mut record: RequirementRecord =
        serde_json::from_value(value).context("requirement record did not match schema")?;

    record.clarification_needed.truncate(MAX_CLARIFICATIONS);
    record.confidence = compute_confidence(&record, known_services);
    Ok(record)
}

/// Confidence in [0,1] from three signals:
/// - fraction of non-trigger actions that carry extracted parameters,
/// - presence of a trigger,
/// - fraction of service hints resolvable against the corpus.
pub fn compute_confidence(record: &RequirementRecord, known_services: &[String]) -> f64 {
    let non_trigger: Vec<_> = record.actions.iter().filter(|a| !a.is_trigger).collect();
    if non_trigger.is_empty() {
        return 0.0;
    }

    let with_params = non_trigger
        .iter()
        .filter(|a| !a.parameters.is_empty())
        .count() as f64;
    let param_score = with_params / non_trigger.len() as f64;

    let has_trigger =
        !record.triggers.is_empty() || record.actions.iter().any(|a| a.is_trigger);
    let trigger_score = if has_trigger { 1.0 } else { 0.0 };

    let hints: Vec<&str> = non_trigger
        .iter()
        .map(|a| a.service_hint.as_str())
        .filter(|h| !h.is_empty())
        .collect();
    let service_score = if hints.is_empty() {
        0.0
    } else {
        let resolvable = hints
            .iter()
            .filter(|h| {
                known_services
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(h))
            })
            .count() as f64;
        resolvable / hints.len() as f64
    };

    (0.45 * param_score + 0.20 * trigger_score + 0.35 * service_score).clamp(0.0, 1.0)
}

/// Generate a short natural-language clarification message from the
/// outstanding questions. Falls back to the first raw question when the
/// model is unavailable.
pub async fn generate_clarification(
    model: &dyn LanguageModel,
    record: &RequirementRecord,
) -> String {
    if record.clarification_needed.is_empty() {
        return String::new();
    }

    let system = "You are a friendly workflow automation assistant. Generate a brief, \
                  natural clarification message. Show what you already understood and \
                  ask only what is critical. Two questions maximum.";
    let prompt = format!(
        "Workflow so far: {}\nMissing info: {:?}\nAssumed defaults: {:?}\n\nGenerate the clarification message.",
        record.description, record.clarification_needed, record.assumed_defaults
    );

    match model.generate_text(system, &prompt).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => record.clarification_needed[0].clone(),
    }
}
