//! Request/response types for the Gemini generateContent API and the
//! tool-calling turn protocol built on top of it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declaration of one callable tool, in Gemini function-declaration form.
/// `parameters` is a JSON schema object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Outcome of a single model turn in the tool loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    /// The model requested one or more tool invocations.
    ToolCalls(Vec<ToolCall>),
    /// The model produced its final text.
    Final(String),
    /// The turn carried neither a tool call nor text.
    Malformed,
}

/// One role-tagged entry of a tool-loop transcript.
///
/// The driver owns the transcript and appends the model's tool calls and
/// the executed tool results between turns; the client converts it to
/// wire contents on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TranscriptEntry {
    User { text: String },
    ModelText { text: String },
    ModelToolCall { call: ToolCall },
    ToolResult { name: String, result: String },
}

/// Accumulated conversation for a tool loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            entries: vec![TranscriptEntry::User { text: prompt.into() }],
        }
    }

    pub fn push_tool_call(&mut self, call: ToolCall) {
        self.entries.push(TranscriptEntry::ModelToolCall { call });
    }

    pub fn push_tool_result(&mut self, name: impl Into<String>, result: impl Into<String>) {
        self.entries.push(TranscriptEntry::ToolResult {
            name: name.into(),
            result: result.into(),
        });
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.entries.push(TranscriptEntry::User { text: text.into() });
    }
}

// ── Wire types (generateContent) ─────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SystemInstruction {
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolConfig {
    pub function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            function_call: None,
            function_response: None,
        }
    }

    pub fn function_response(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            text: None,
            function_call: None,
            function_response: Some(FunctionResponse {
                name: name.into(),
                response: serde_json::json!({ "result": result.into() }),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Candidate {
    pub content: Option<Content>,
}

// ── Wire types (batchEmbedContents) ──────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct BatchEmbedRequest {
    pub requests: Vec<EmbedRequest>,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmbedRequest {
    pub model: String,
    pub content: EmbedContent,
}

#[derive(Debug, Serialize)]
pub(crate) struct EmbedContent {
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchEmbedResponse {
    #[serde(default)]
    pub embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingValues {
    #[serde(default)]
    pub values: Vec<f32>,
}
