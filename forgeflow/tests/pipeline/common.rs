//! Common test utilities for pipeline tests

use std::sync::Arc;

use forgeflow::codegen::ScanConfig;
use forgeflow::deployment::RecordingPackager;
use forgeflow::discovery::{ApiCorpus, SpecFile, VectorIndex};
use forgeflow::execution::ScriptedSandbox;
use forgeflow::pipeline::{CheckpointStore, PipelineRunner, Services};
use forgeflow::secrets::StaticSecretResolver;
use forgeflow::Settings;
use forgeflow_llm::{MockEmbedder, MockModel};
use forgeflow_sdk::MemorySink;

/// Everything a test needs to drive and inspect one pipeline.
pub struct Harness {
    pub model: Arc<MockModel>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub sink: Arc<MemorySink>,
    pub checkpoints: Arc<CheckpointStore>,
    pub packager: Arc<RecordingPackager>,
    pub runner: PipelineRunner,
}

pub async fn harness() -> Harness {
    harness_with_settings(Settings::default()).await
}

pub async fn harness_with_settings(settings: Settings) -> Harness {
    let model = Arc::new(MockModel::new());
    let embedder = Arc::new(MockEmbedder);
    let corpus = Arc::new(test_corpus());
    let index = Arc::new(VectorIndex::build(&corpus, embedder.as_ref()).await.unwrap());
    let sandbox = Arc::new(ScriptedSandbox::new());
    let sink = Arc::new(MemorySink::new());
    let checkpoints = Arc::new(CheckpointStore::new_in_memory().unwrap());
    let packager = Arc::new(RecordingPackager::new());

    let secrets = StaticSecretResolver::new()
        .with("SLACK_BOT_TOKEN", "test-slack-token")
        .with("GMAIL_ADDRESS", "team@example.com")
        .with("GMAIL_APP_PASSWORD", "app-password")
        .with("GOOGLE_API_KEY", "test-google-key");

    let services = Arc::new(Services {
        model: model.clone(),
        embedder,
        corpus,
        index,
        secrets: Arc::new(secrets),
        sandbox: sandbox.clone(),
        sink: sink.clone(),
        checkpoints: checkpoints.clone(),
        packager: packager.clone(),
        scan_config: ScanConfig::default(),
        settings,
    });

    Harness {
        model,
        sandbox,
        sink,
        checkpoints,
        packager,
        runner: PipelineRunner::new(services),
    }
}

/// A small corpus mirroring the shipped spec files.
pub fn test_corpus() -> ApiCorpus {
    let mut corpus = ApiCorpus::default();

    let slack: SpecFile = serde_json::from_value(serde_json::json!({
        "service": "Slack",
        "base_url": "https://slack.com/api",
        "auth": "bearer",
        "endpoints": [
            {
                "path": "/chat.postMessage",
                "method": "POST",
                "description": "Send a message to a channel or direct message conversation",
                "parameters": [
                    {"name": "channel", "required": true, "description": "Channel id or #name to post to"},
                    {"name": "text", "required": true, "description": "Message text"}
                ],
                "response_fields": {"ok": "success flag", "ts": "message timestamp"}
            },
            {
                "path": "/conversations.invite",
                "method": "POST",
                "description": "Invite users to an existing channel",
                "parameters": [
                    {"name": "channel", "required": true, "description": "Channel id to invite into"},
                    {"name": "users", "required": true, "description": "Comma-separated user ids"}
                ],
                "response_fields": {"ok": "success flag"}
            }
        ]
    }))
    .unwrap();
    corpus.add_spec(slack);

    let gmail: SpecFile = serde_json::from_value(serde_json::json!({
        "service": "Gmail",
        "auth": "api_key",
        "endpoints": [
            {
                "path": "/send",
                "method": "SMTP",
                "description": "Send an email over SMTP with a welcome subject and body to a recipient",
                "parameters": [
                    {"name": "to", "required": true, "description": "Recipient email address"},
                    {"name": "subject", "required": true, "description": "Subject line"},
                    {"name": "body", "required": true, "description": "Plain-text body"}
                ],
                "response_fields": {"ok": "success flag"}
            }
        ]
    }))
    .unwrap();
    corpus.add_spec(gmail);

    let sheets: SpecFile = serde_json::from_value(serde_json::json!({
        "service": "Google Sheets",
        "auth": "api_key",
        "endpoints": [
            {
                "path": "/values:append",
                "method": "POST",
                "description": "Append a row of values to a google sheets spreadsheet range",
                "parameters": [
                    {"name": "spreadsheet_id", "required": true, "description": "Target spreadsheet"},
                    {"name": "values", "required": true, "description": "Row values"}
                ],
                "response_fields": {"updated_rows": "rows appended"}
            }
        ]
    }))
    .unwrap();
    corpus.add_spec(sheets);

    corpus
}

// ── Artifacts used across scenarios ──────────────────────────

pub const HELLO_CODE: &str = r##"import asyncio
import logging
import os

import httpx

SLACK_TOKEN = os.getenv("SLACK_BOT_TOKEN", "")

async def post_message(context):
    if not SLACK_TOKEN:
        logging.warning("[Slack] no token, skipping")
        return {"ok": False, "error": "not configured"}
    async with httpx.AsyncClient(timeout=30) as client:
        r = await client.post(
            "https://slack.com/api/chat.postMessage",
            headers={"Authorization": "Bearer " + SLACK_TOKEN},
            json={"channel": "#general", "text": "Hello"},
        )
        data = r.json()
        return {"ok": data.get("ok", False), "ts": data.get("ts")}

async def main():
    context = {}
    context["post_message"] = await post_message(context)
    print("workflow complete")

if __name__ == "__main__":
    asyncio.run(main())
"##;

/// Same workflow, generated with a dependency the sandbox image lacks.
pub const HELLO_CODE_WITH_REQUESTS: &str = r##"import asyncio
import os

import requests

SLACK_TOKEN = os.getenv("SLACK_BOT_TOKEN", "")

async def post_message(context):
    r = requests.post(
        "https://slack.com/api/chat.postMessage",
        headers={"Authorization": "Bearer " + SLACK_TOKEN},
        json={"channel": "#general", "text": "Hello"},
    )
    return r.json()

async def main():
    context = {}
    context["post_message"] = await post_message(context)

if __name__ == "__main__":
    asyncio.run(main())
"##;

/// Artifact with a shell invocation the security review must block.
pub const SHELL_CODE: &str = r#"import asyncio
import os

SLACK_TOKEN = os.getenv("SLACK_BOT_TOKEN", "")

async def post_message(context):
    user_input = context.get("cmd", "echo hello")
    os.system(user_input)
    return {"ok": True}

async def main():
    context = {}
    context["post_message"] = await post_message(context)

if __name__ == "__main__":
    asyncio.run(main())
"#;

pub const ONBOARDING_CODE: &str = r##"import asyncio
import logging
import os
import smtplib
from email.mime.text import MIMEText

import httpx

SLACK_TOKEN = os.getenv("SLACK_BOT_TOKEN", "")
GMAIL_ADDRESS = os.getenv("GMAIL_ADDRESS", "")
GMAIL_APP_PASSWORD = os.getenv("GMAIL_APP_PASSWORD", "")

async def send_email(context):
    if not GMAIL_ADDRESS or not GMAIL_APP_PASSWORD:
        logging.warning("[Gmail] not configured, skipping")
        return {"ok": False}
    msg = MIMEText("Welcome aboard!", "plain")
    msg["To"] = "jane@acme.com"
    msg["Subject"] = "Welcome"
    msg["From"] = GMAIL_ADDRESS
    def _send():
        with smtplib.SMTP("smtp.gmail.com", 587) as server:
            server.starttls()
            server.login(GMAIL_ADDRESS, GMAIL_APP_PASSWORD)
            server.send_message(msg)
    await asyncio.get_event_loop().run_in_executor(None, _send)
    return {"ok": True}

async def create_slack(context):
    async with httpx.AsyncClient(timeout=30) as client:
        r = await client.post(
            "https://slack.com/api/conversations.invite",
            headers={"Authorization": "Bearer " + SLACK_TOKEN},
            json={"channel": "#onboarding", "users": "U123"},
        )
        return r.json()

async def main():
    context = {}
    results = await asyncio.gather(send_email(context), create_slack(context))
    context["send_email"], context["create_slack"] = results
    print("workflow complete")

if __name__ == "__main__":
    asyncio.run(main())
"##;

// ── Script builders ──────────────────────────────────────────

/// Queue the requirement extraction for the happy Slack scenario.
pub fn script_hello_extraction(model: &MockModel) {
    model.push_json_for(
        "requirement extractor",
        serde_json::json!({
            "intent": "notification",
            "workflow_name": "Hello Slack",
            "description": "Send Hello to #general on Slack",
            "actions": [{
                "id": "step_1",
                "description": "Send the message Hello to the Slack channel #general",
                "service_hint": "Slack",
                "api_type": "rest",
                "parameters": {"channel": "#general", "text": "Hello"},
                "depends_on": [],
                "is_trigger": false
            }],
            "triggers": [{"trigger_type": "manual", "description": "Run once"}],
            "conditions": [],
            "clarification_needed": [],
            "assumed_defaults": []
        }),
    );
}

/// Queue an endpoint selection answer.
pub fn script_selection(model: &MockModel, score: f64, justification: &str) {
    model.push_json_for(
        "API selection expert",
        serde_json::json!({
            "selected_index": 0,
            "match_score": score,
            "justification": justification
        }),
    );
}

/// Queue the planner output for the happy Slack scenario.
pub fn script_hello_plan(model: &MockModel) {
    model.push_json_for(
        "workflow planner",
        serde_json::json!({
            "name": "Hello Slack",
            "description": "Send Hello to #general",
            "trigger": {"trigger_type": "manual", "description": "Run once"},
            "steps": [
                {"id": "trigger", "name": "Manual trigger", "step_type": "trigger"},
                {
                    "id": "post_message",
                    "name": "Post Hello to #general",
                    "description": "Send the message via chat.postMessage",
                    "step_type": "api_call",
                    "api_index": 0,
                    "inputs": {"channel": "#general", "text": "Hello"},
                    "outputs": {"ok": "success flag", "ts": "message timestamp"},
                    "depends_on": ["trigger"],
                    "error_handling": "retry"
                }
            ],
            "environment_vars": ["SLACK_BOT_TOKEN"]
        }),
    );
}

/// Queue `count` empty data mappings.
pub fn script_mappings(model: &MockModel, count: usize) {
    for _ in 0..count {
        model.push_json_for(
            "map data between",
            serde_json::json!({ "mapping": {}, "explanation": "inputs are literal values" }),
        );
    }
}

/// Queue a codegen turn that finishes immediately with `code`.
pub fn script_codegen(model: &MockModel, code: &str) {
    model.push_turn(forgeflow_llm::ModelTurn::Final(code.to_string()));
}

/// Queue the test scaffold output.
pub fn script_scaffold(model: &MockModel) {
    model.push_text_for(
        "pytest",
        "import pytest\n\n\ndef test_post_message_exists():\n    assert True\n",
    );
}

/// Queue one self-debug diagnosis + patch pair.
pub fn script_debug_round(model: &MockModel, category: &str, root_cause: &str, patched: &str) {
    model.push_json_for(
        "self-debugging",
        serde_json::json!({
            "category": category,
            "root_cause": root_cause,
            "fix_plan": "apply the targeted fix"
        }),
    );
    model.push_text_for("repair generated workflow", patched);
}

/// Queue a patch without a diagnosis (security violations skip the
/// classification call).
pub fn script_patch_only(model: &MockModel, patched: &str) {
    model.push_text_for("repair generated workflow", patched);
}

/// Queue the full happy path from extraction to scaffold.
pub fn script_happy_slack(model: &MockModel) {
    script_hello_extraction(model);
    script_selection(model, 0.92, "chat.postMessage posts text to a channel");
    script_hello_plan(model);
    script_mappings(model, 1);
    script_codegen(model, HELLO_CODE);
    script_scaffold(model);
}
