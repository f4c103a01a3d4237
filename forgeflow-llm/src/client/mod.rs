//! Gemini client and the `LanguageModel` trait.
//!
//! All LLM calls in ForgeFlow go through [`LanguageModel`]:
//! - [`LanguageModel::generate_text`] for free-text responses
//! - [`LanguageModel::generate_json`] for structured JSON responses
//! - [`LanguageModel::next_turn`] for one turn of the tool-calling loop
//!
//! The tool loop itself lives with the caller: `next_turn` is a pure
//! function from transcript to (tool calls | final text), and the driver
//! executes side effects between turns.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::error::{LlmError, Result};
use crate::types::{
    Content, GenerateRequest, GenerateResponse, GenerationConfig, ModelTurn, Part,
    SystemInstruction, ToolCall, ToolConfig, ToolDeclaration, Transcript, TranscriptEntry,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration for the Gemini client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_seconds: u64,
}

impl LlmConfig {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: None,
            max_tokens: None,
            temperature: Some(0.0),
            timeout_seconds: 60,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }
}

/// Text, JSON, and tool-calling access to a language model.
///
/// Implementations must be safe to share across concurrently running
/// pipelines; the client holds no per-conversation state.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-text generation.
    async fn generate_text(&self, system: &str, prompt: &str) -> Result<String>;

    /// Structured generation; the provider is asked for JSON output and
    /// the raw response is parsed into a JSON value.
    async fn generate_json(&self, system: &str, prompt: &str) -> Result<serde_json::Value>;

    /// One turn of a tool-calling conversation.
    async fn next_turn(
        &self,
        system: &str,
        transcript: &Transcript,
        tools: &[ToolDeclaration],
    ) -> Result<ModelTurn>;
}

/// Gemini implementation of [`LanguageModel`] over the REST API.
pub struct GeminiClient {
    config: LlmConfig,
    client: Client,
}

impl GeminiClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url(),
            self.config.model
        );
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json::<GenerateResponse>().await?)
    }

    fn generation_config(&self, json_mode: bool) -> GenerationConfig {
        GenerationConfig {
            response_mime_type: json_mode.then(|| "application/json".to_string()),
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_tokens,
        }
    }

    fn request_for_prompt(&self, system: &str, prompt: &str, json_mode: bool) -> GenerateRequest {
        GenerateRequest {
            contents: vec![Content {
                role: "user".into(),
                parts: vec![Part::text(prompt)],
            }],
            system_instruction: Some(SystemInstruction {
                parts: vec![Part::text(system)],
            }),
            tools: None,
            generation_config: Some(self.generation_config(json_mode)),
        }
    }

    fn collect_text(response: &GenerateResponse) -> Result<String> {
        let parts = response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or_default();

        let text: String = parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }

    /// Convert the driver-owned transcript into wire contents. Tool
    /// results are sent back as user-role function responses, matching
    /// the generateContent function-calling protocol.
    fn contents_from_transcript(transcript: &Transcript) -> Vec<Content> {
        let mut contents = Vec::new();
        for entry in &transcript.entries {
            match entry {
                TranscriptEntry::User { text } => contents.push(Content {
                    role: "user".into(),
                    parts: vec![Part::text(text)],
                }),
                TranscriptEntry::ModelText { text } => contents.push(Content {
                    role: "model".into(),
                    parts: vec![Part::text(text)],
                }),
                TranscriptEntry::ModelToolCall { call } => contents.push(Content {
                    role: "model".into(),
                    parts: vec![Part {
                        text: None,
                        function_call: Some(crate::types::FunctionCall {
                            name: call.name.clone(),
                            args: call.args.clone(),
                        }),
                        function_response: None,
                    }],
                }),
                TranscriptEntry::ToolResult { name, result } => contents.push(Content {
                    role: "user".into(),
                    parts: vec![Part::function_response(name, result.as_str())],
                }),
            }
        }
        contents
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate_text(&self, system: &str, prompt: &str) -> Result<String> {
        let request = self.request_for_prompt(system, prompt, false);
        let response = self.generate(&request).await?;
        Self::collect_text(&response)
    }

    async fn generate_json(&self, system: &str, prompt: &str) -> Result<serde_json::Value> {
        let request = self.request_for_prompt(system, prompt, true);
        let response = self.generate(&request).await?;
        let text = Self::collect_text(&response)?;
        serde_json::from_str(&text).map_err(|e| LlmError::SchemaParse {
            message: e.to_string(),
            raw: text,
        })
    }

    async fn next_turn(
        &self,
        system: &str,
        transcript: &Transcript,
        tools: &[ToolDeclaration],
    ) -> Result<ModelTurn> {
        let request = GenerateRequest {
            contents: Self::contents_from_transcript(transcript),
            system_instruction: Some(SystemInstruction {
                parts: vec![Part::text(system)],
            }),
            tools: Some(vec![ToolConfig {
                function_declarations: tools.to_vec(),
            }]),
            generation_config: Some(self.generation_config(false)),
        };

        let response = self.generate(&request).await?;
        let parts = response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or_default();

        let calls: Vec<ToolCall> = parts
            .iter()
            .filter_map(|p| p.function_call.as_ref())
            .map(|fc| ToolCall {
                name: fc.name.clone(),
                args: fc.args.clone(),
            })
            .collect();

        if !calls.is_empty() {
            return Ok(ModelTurn::ToolCalls(calls));
        }

        let text: String = parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            Ok(ModelTurn::Malformed)
        } else {
            Ok(ModelTurn::Final(text))
        }
    }
}
