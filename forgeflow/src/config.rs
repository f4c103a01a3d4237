//! Environment-derived configuration.
//!
//! All knobs come from the process environment and are read once at
//! startup; the resulting [`Settings`] value is an immutable singleton
//! shared by every pipeline run.

use std::env;

/// Service credential requirement: which env vars a service needs before
/// discovery will offer its endpoints.
#[derive(Debug, Clone)]
pub struct ServiceCredential {
    pub service: &'static str,
    pub env_vars: &'static [&'static str],
}

/// Credential table for the services shipped in the corpus. A service
/// absent from this table requires no credentials.
pub const SERVICE_CREDENTIALS: &[ServiceCredential] = &[
    ServiceCredential {
        service: "Slack",
        env_vars: &["SLACK_BOT_TOKEN"],
    },
    ServiceCredential {
        service: "Gmail",
        env_vars: &["GMAIL_ADDRESS", "GMAIL_APP_PASSWORD"],
    },
    ServiceCredential {
        service: "Google Sheets",
        env_vars: &["GOOGLE_API_KEY"],
    },
    ServiceCredential {
        service: "Deriv",
        env_vars: &["DERIV_APP_ID", "DERIV_API_TOKEN"],
    },
];

#[derive(Debug, Clone)]
pub struct Settings {
    /// Credential for the LLM provider.
    pub llm_api_key: String,
    /// Model identifier for planning / codegen calls.
    pub llm_model: String,
    /// Cheaper model for rerank, mapping, and clarification calls.
    pub llm_fast_model: String,
    /// Self-debug attempt budget.
    pub max_debug_attempts: u32,
    /// Wall-clock seconds per sandbox execution.
    pub sandbox_timeout_secs: u64,
    /// Wall-clock seconds per LLM call.
    pub llm_timeout_secs: u64,
    /// Wall-clock seconds per pipeline run.
    pub pipeline_timeout_secs: u64,
    /// Clarification gate: confidence >= threshold proceeds.
    pub confidence_threshold: f64,
    /// Retrieval candidates kept per action.
    pub retrieval_k: usize,
    /// Minimum embedding similarity to keep a retrieval candidate.
    pub candidate_floor: f64,
    /// Minimum rerank match-score to bind an endpoint to an action.
    pub selection_floor: f64,
    /// Tool-loop invocation budget per workflow step.
    pub tool_budget_per_step: u32,
    /// Hard ceiling on tool invocations per codegen run.
    pub tool_budget_total: u32,
    /// Whether the codegen agent may fetch web pages.
    pub allow_web_fetch: bool,
    /// Directory holding API spec files.
    pub specs_dir: String,
    /// Directory the deployed project folders are written to.
    pub deploy_dir: String,
    /// Path of the checkpoint database.
    pub checkpoint_db: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_api_key: String::new(),
            llm_model: "gemini-2.5-flash".into(),
            llm_fast_model: "gemini-2.5-flash".into(),
            max_debug_attempts: 3,
            sandbox_timeout_secs: 60,
            llm_timeout_secs: 60,
            pipeline_timeout_secs: 180,
            confidence_threshold: 0.75,
            retrieval_k: 5,
            candidate_floor: 0.3,
            selection_floor: 0.5,
            tool_budget_per_step: 8,
            tool_budget_total: 40,
            allow_web_fetch: false,
            specs_dir: "./specs".into(),
            deploy_dir: "./deployed".into(),
            checkpoint_db: "./forgeflow.db".into(),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Self {
            llm_api_key: env::var("LLM_API_KEY").unwrap_or_default(),
            llm_model: env::var("LLM_MODEL").unwrap_or(d.llm_model),
            llm_fast_model: env::var("LLM_FAST_MODEL").unwrap_or(d.llm_fast_model),
            max_debug_attempts: parse_env("MAX_DEBUG_ATTEMPTS", d.max_debug_attempts),
            sandbox_timeout_secs: parse_env("SANDBOX_TIMEOUT", d.sandbox_timeout_secs),
            llm_timeout_secs: parse_env("LLM_TIMEOUT", d.llm_timeout_secs),
            pipeline_timeout_secs: parse_env("PIPELINE_TIMEOUT", d.pipeline_timeout_secs),
            confidence_threshold: parse_env("CONFIDENCE_THRESHOLD", d.confidence_threshold),
            retrieval_k: parse_env("RETRIEVAL_K", d.retrieval_k),
            candidate_floor: parse_env("CANDIDATE_FLOOR", d.candidate_floor),
            selection_floor: parse_env("SELECTION_FLOOR", d.selection_floor),
            tool_budget_per_step: parse_env("TOOL_BUDGET_PER_STEP", d.tool_budget_per_step),
            tool_budget_total: parse_env("TOOL_BUDGET_TOTAL", d.tool_budget_total),
            allow_web_fetch: env::var("ALLOW_WEB_FETCH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(d.allow_web_fetch),
            specs_dir: env::var("SPECS_DIR").unwrap_or(d.specs_dir),
            deploy_dir: env::var("DEPLOY_DIR").unwrap_or(d.deploy_dir),
            checkpoint_db: env::var("CHECKPOINT_DB").unwrap_or(d.checkpoint_db),
        }
    }

    /// Env vars a given service needs, if it is credentialed at all.
    pub fn required_credentials(service: &str) -> Option<&'static [&'static str]> {
        SERVICE_CREDENTIALS
            .iter()
            .find(|c| c.service.eq_ignore_ascii_case(service))
            .map(|c| c.env_vars)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
