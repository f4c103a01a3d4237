//! LLM and embedding client for ForgeFlow.
//!
//! Exposes the [`LanguageModel`] trait (text / JSON / tool-calling turns),
//! the [`Embedder`] trait, the Gemini implementations of both, and
//! scripted mocks for offline runs and tests.

pub mod client;
pub mod embeddings;
pub mod error;
pub mod mock;
pub mod types;

pub use client::{GeminiClient, LanguageModel, LlmConfig};
pub use embeddings::{Embedder, GeminiEmbedder};
pub use error::{LlmError, Result};
pub use mock::{MockEmbedder, MockModel};
pub use types::{ModelTurn, ToolCall, ToolDeclaration, Transcript, TranscriptEntry};
