//! The composite pipeline state threaded through all stages.
//!
//! Exclusively mutated by the runner; observers only ever see event
//! snapshots. The whole record serializes for checkpointing: unknown
//! fields are ignored on load, and a record missing its required fields
//! (correlation id, user request) is rejected.

use forgeflow_sdk::{RunPhase, StageTag};
use serde::{Deserialize, Serialize};

use crate::models::{
    ActionIntent, DataMapping, DebugRecord, DiscoveredEndpoint, ExecutionResult,
    GeneratedArtifact, RequirementRecord, WorkflowDag,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    // Required on load; everything else defaults.
    pub correlation_id: String,
    pub user_request: String,

    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default = "default_stage")]
    pub stage: StageTag,
    #[serde(default = "default_phase")]
    pub phase: RunPhase,

    #[serde(default)]
    pub requirement: Option<RequirementRecord>,
    #[serde(default)]
    pub clarifications_asked: u32,

    #[serde(default)]
    pub discovered: Vec<DiscoveredEndpoint>,
    #[serde(default)]
    pub unmatched_actions: Vec<ActionIntent>,
    #[serde(default)]
    pub skipped_services: Vec<String>,

    #[serde(default)]
    pub dag: Option<WorkflowDag>,
    #[serde(default)]
    pub mappings: Vec<DataMapping>,

    #[serde(default)]
    pub artifact: Option<GeneratedArtifact>,
    #[serde(default)]
    pub test_code: Option<String>,
    #[serde(default)]
    pub security_failed: bool,

    #[serde(default)]
    pub last_execution: Option<ExecutionResult>,
    #[serde(default)]
    pub debug_attempts: u32,
    #[serde(default)]
    pub debug_history: Vec<DebugRecord>,

    /// Monotonic event sequence for this correlation id.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub deployed: bool,
    #[serde(default)]
    pub final_message: String,
}

fn default_stage() -> StageTag {
    StageTag::Conversation
}

fn default_phase() -> RunPhase {
    RunPhase::Collecting
}

impl PipelineState {
    pub fn new(correlation_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            user_request: user_request.into(),
            messages: Vec::new(),
            stage: default_stage(),
            phase: default_phase(),
            requirement: None,
            clarifications_asked: 0,
            discovered: Vec::new(),
            unmatched_actions: Vec::new(),
            skipped_services: Vec::new(),
            dag: None,
            mappings: Vec::new(),
            artifact: None,
            test_code: None,
            security_failed: false,
            last_execution: None,
            debug_attempts: 0,
            debug_history: Vec::new(),
            seq: 0,
            deployed: false,
            final_message: String::new(),
        }
    }

    /// Next event sequence number; strictly increasing per run.
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip_preserves_state() {
        let mut state = PipelineState::new("wf-1", "Send hello to #general");
        state.stage = StageTag::SandboxExecute;
        state.phase = RunPhase::Testing;
        state.debug_attempts = 2;
        state.next_seq();
        state.next_seq();

        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.correlation_id, "wf-1");
        assert_eq!(back.stage, StageTag::SandboxExecute);
        assert_eq!(back.debug_attempts, 2);
        assert_eq!(back.seq, 2);
    }

    #[test]
    fn test_unknown_fields_ignored_on_load() {
        let json = r#"{
            "correlation_id": "wf-2",
            "user_request": "do things",
            "some_future_field": {"nested": true}
        }"#;
        let state: PipelineState = serde_json::from_str(json).unwrap();
        assert_eq!(state.correlation_id, "wf-2");
        assert_eq!(state.stage, StageTag::Conversation);
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let json = r#"{ "user_request": "no id" }"#;
        assert!(serde_json::from_str::<PipelineState>(json).is_err());
    }

    #[test]
    fn test_seq_strictly_increases() {
        let mut state = PipelineState::new("wf-3", "x");
        let a = state.next_seq();
        let b = state.next_seq();
        let c = state.next_seq();
        assert!(a < b && b < c);
    }
}
