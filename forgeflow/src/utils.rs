//! Shared helpers for LLM JSON handling.

use forgeflow_llm::{LanguageModel, LlmError};

/// Reminder appended on the single structured retry after a schema
/// parse failure.
const STRICT_REMINDER: &str = "\n\nREMINDER: Your previous response was not valid JSON. \
Return ONLY a single valid JSON object matching the requested schema. \
No prose, no markdown fences, no trailing commentary.";

/// Call `generate_json`, retrying exactly once with a stricter reminder
/// when the response fails to parse. A second failure propagates as a
/// schema parse failure; transport errors propagate immediately so the
/// caller can apply resource-retry policy.
pub async fn llm_json_with_retry(
    model: &dyn LanguageModel,
    system: &str,
    prompt: &str,
) -> Result<serde_json::Value, LlmError> {
    match model.generate_json(system, prompt).await {
        Ok(value) => Ok(value),
        Err(LlmError::SchemaParse { .. }) => {
            let stricter = format!("{prompt}{STRICT_REMINDER}");
            model.generate_json(system, &stricter).await
        }
        Err(e) => Err(e),
    }
}

/// Strip a surrounding markdown code fence from generated source, if
/// present. The model is told not to emit fences but occasionally does.
pub fn strip_code_fences(code: &str) -> String {
    let trimmed = code.trim();
    if !trimmed.starts_with("```") {
        return code.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    if !lines.is_empty() {
        lines.remove(0);
    }
    if lines.last().map(|l| l.trim() == "```").unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

/// Pull a string field out of an LLM JSON object, defaulting to empty.
pub fn json_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Pull an f64 field out of an LLM JSON object.
pub fn json_f64(value: &serde_json::Value, key: &str) -> Option<f64> {
    value.get(key).and_then(|v| v.as_f64())
}
