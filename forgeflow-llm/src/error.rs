//! Error types for the LLM client.

use thiserror::Error;

/// Errors surfaced by LLM and embedding calls.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider returned a non-success status.
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// The response carried no usable candidate content.
    #[error("empty response from model")]
    EmptyResponse,

    /// A structured-JSON response did not parse against the expected shape.
    #[error("schema parse failure: {message}")]
    SchemaParse { message: String, raw: String },

    /// No API key was configured.
    #[error("missing API key (set LLM_API_KEY)")]
    MissingApiKey,
}

impl LlmError {
    /// Whether a retry may help. Transport failures and 5xx/429 responses
    /// are retryable; schema and configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::EmptyResponse => true,
            LlmError::SchemaParse { .. } | LlmError::MissingApiKey => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
