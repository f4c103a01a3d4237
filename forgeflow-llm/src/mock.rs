//! Scripted model and embedder for offline runs and tests.
//!
//! `MockModel` replays queued responses, which keeps pipeline tests
//! deterministic: re-running a pipeline from a checkpoint against the
//! same script reproduces the same stage outputs. Responses can be
//! queued globally (replayed in call order) or routed by a substring of
//! the system prompt, so multi-stage callers do not depend on exact
//! call interleaving.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::client::LanguageModel;
use crate::embeddings::Embedder;
use crate::error::{LlmError, Result};
use crate::types::{ModelTurn, ToolDeclaration, Transcript};

#[derive(Default)]
struct Routed<T> {
    routes: Vec<(String, VecDeque<T>)>,
    fallback: VecDeque<T>,
}

impl<T> Routed<T> {
    fn push(&mut self, value: T) {
        self.fallback.push_back(value);
    }

    fn push_for(&mut self, matcher: &str, value: T) {
        if let Some((_, queue)) = self.routes.iter_mut().find(|(m, _)| m == matcher) {
            queue.push_back(value);
        } else {
            self.routes
                .push((matcher.to_string(), VecDeque::from([value])));
        }
    }

    fn pop(&mut self, system: &str) -> Option<T> {
        for (matcher, queue) in self.routes.iter_mut() {
            if system.contains(matcher.as_str()) {
                if let Some(value) = queue.pop_front() {
                    return Some(value);
                }
            }
        }
        self.fallback.pop_front()
    }

    fn len(&self) -> usize {
        self.fallback.len() + self.routes.iter().map(|(_, q)| q.len()).sum::<usize>()
    }
}

/// A [`LanguageModel`] that replays pre-scripted responses.
#[derive(Default)]
pub struct MockModel {
    json: Mutex<Routed<serde_json::Value>>,
    text: Mutex<Routed<String>>,
    turns: Mutex<VecDeque<ModelTurn>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a JSON response for the next unmatched `generate_json` call.
    pub fn push_json(&self, value: serde_json::Value) -> &Self {
        self.json.lock().unwrap().push(value);
        self
    }

    /// Queue a JSON response for `generate_json` calls whose system
    /// prompt contains `matcher`.
    pub fn push_json_for(&self, matcher: &str, value: serde_json::Value) -> &Self {
        self.json.lock().unwrap().push_for(matcher, value);
        self
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.text.lock().unwrap().push(text.into());
        self
    }

    pub fn push_text_for(&self, matcher: &str, text: impl Into<String>) -> &Self {
        self.text.lock().unwrap().push_for(matcher, text.into());
        self
    }

    pub fn push_turn(&self, turn: ModelTurn) -> &Self {
        self.turns.lock().unwrap().push_back(turn);
        self
    }

    /// Number of scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.json.lock().unwrap().len()
            + self.text.lock().unwrap().len()
            + self.turns.lock().unwrap().len()
    }

    fn exhausted(kind: &str) -> LlmError {
        LlmError::SchemaParse {
            message: format!("mock script exhausted for {kind}"),
            raw: String::new(),
        }
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn generate_text(&self, system: &str, _prompt: &str) -> Result<String> {
        self.text
            .lock()
            .unwrap()
            .pop(system)
            .ok_or_else(|| Self::exhausted("generate_text"))
    }

    async fn generate_json(&self, system: &str, _prompt: &str) -> Result<serde_json::Value> {
        self.json
            .lock()
            .unwrap()
            .pop(system)
            .ok_or_else(|| Self::exhausted("generate_json"))
    }

    async fn next_turn(
        &self,
        _system: &str,
        _transcript: &Transcript,
        _tools: &[ToolDeclaration],
    ) -> Result<ModelTurn> {
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Self::exhausted("next_turn"))
    }
}

/// Deterministic bag-of-tokens embedder. Each lowercase token is hashed
/// onto one of `DIMS` buckets and the vector is L2-normalized, so texts
/// sharing vocabulary land close in cosine space. Good enough to rank
/// corpus endpoints for tests without a network call.
pub struct MockEmbedder;

const DIMS: usize = 64;

impl MockEmbedder {
    fn token_bucket(token: &str) -> usize {
        // FNV-1a, stable across platforms.
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in token.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % DIMS as u64) as usize
    }

    fn embed(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIMS];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[Self::token_bucket(token)] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed(t)).collect())
    }
}
