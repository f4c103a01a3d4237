//! Shared event vocabulary for the ForgeFlow pipeline.
//!
//! This crate defines the stage tags, the event envelope pushed to
//! observers, the [`EventSink`] trait with its standard implementations,
//! and the console logging macros used by CLI workflows.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub use async_trait::async_trait;

/// One of the ten pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTag {
    Conversation,
    ApiDiscovery,
    Planner,
    Mapper,
    Codegen,
    Security,
    TestScaffold,
    SandboxExecute,
    SelfDebug,
    Deploy,
}

impl StageTag {
    /// Stable string form used in event payloads and checkpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageTag::Conversation => "conversation",
            StageTag::ApiDiscovery => "api_discovery",
            StageTag::Planner => "planner",
            StageTag::Mapper => "mapper",
            StageTag::Codegen => "codegen",
            StageTag::Security => "security",
            StageTag::TestScaffold => "test_scaffold",
            StageTag::SandboxExecute => "sandbox_execute",
            StageTag::SelfDebug => "self_debug",
            StageTag::Deploy => "deploy",
        }
    }
}

impl std::fmt::Display for StageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse lifecycle phase of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Collecting,
    Planning,
    Generating,
    Testing,
    Deployed,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Collecting => "collecting",
            RunPhase::Planning => "planning",
            RunPhase::Generating => "generating",
            RunPhase::Testing => "testing",
            RunPhase::Deployed => "deployed",
            RunPhase::Failed => "failed",
            RunPhase::Cancelled => "cancelled",
        }
    }
}

/// The envelope pushed on the event channel.
///
/// Events are advisory: loss does not affect pipeline correctness, but
/// within one correlation id the `seq` numbers are strictly increasing
/// and sinks must preserve that order. Clients ignore unknown
/// `event_type` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub correlation_id: String,
    pub seq: u64,
    pub stage: StageTag,
    pub event_type: String,
    pub ts: String,
    pub phase: RunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PipelineEvent {
    pub fn new(
        correlation_id: impl Into<String>,
        seq: u64,
        stage: StageTag,
        phase: RunPhase,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            seq,
            stage,
            event_type: event_type.into(),
            ts: Utc::now().to_rfc3339(),
            phase,
            data: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Push channel for pipeline progress events.
///
/// Implementations must deliver events for a single correlation id in
/// the order they were emitted. No ordering is guaranteed across
/// correlation ids.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: PipelineEvent);
}

/// Sink that fans events out over a tokio broadcast channel.
pub struct BroadcastSink {
    tx: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events from all runs sharing this sink.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: PipelineEvent) {
        // Send fails only when no receiver is subscribed; events are advisory.
        let _ = self.tx.send(event);
    }
}

/// Sink that discards every event.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: PipelineEvent) {}
}

/// Sink that prints a one-line summary of each event to stdout.
pub struct ConsoleSink;

#[async_trait]
impl EventSink for ConsoleSink {
    async fn emit(&self, event: PipelineEvent) {
        let msg = event.message.as_deref().unwrap_or("");
        println!(
            "\x1b[2m[{:>4}]\x1b[0m \x1b[36m{}\x1b[0m {} {}",
            event.seq, event.stage, event.event_type, msg
        );
    }
}

/// Sink that records events in memory, for assertions in tests and for
/// building run reports.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().expect("event buffer poisoned").clone()
    }

    /// Events matching an `event_type`, in emission order.
    pub fn events_of_type(&self, event_type: &str) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: PipelineEvent) {
        self.events.lock().expect("event buffer poisoned").push(event);
    }
}

// ============================================================================
// Console Logging Macros
// ============================================================================
// Colored console output for human-readable CLI logs, complementing the
// structured PipelineEvent stream consumed by observers.
// ============================================================================

/// Logs the start of a pipeline stage with a banner.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_stage_start;
/// log_stage_start!(3, "Planner", "Building workflow DAG");
/// ```
///
/// Outputs:
/// ```text
/// ═══ STAGE 3: Planner ═══
/// Building workflow DAG
/// ```
#[macro_export]
macro_rules! log_stage_start {
    ($num:expr, $title:expr, $description:expr) => {
        println!("\x1b[1;36m═══ STAGE {}: {} ═══\x1b[0m", $num, $title);
        println!("\x1b[36m{}\x1b[0m", $description);
    };
}

/// Logs the completion of a pipeline stage.
#[macro_export]
macro_rules! log_stage_complete {
    ($num:expr) => {
        println!("\x1b[32m✓ Stage {} complete\x1b[0m", $num);
    };
}

/// Logs an informational message.
///
/// # Example
/// ```
/// use forgeflow_sdk::log_info;
/// log_info!("Indexed 42 endpoints");
/// let n = 3;
/// log_info!("Retrying in {}s", n);
/// ```
#[macro_export]
macro_rules! log_info {
    ($message:expr) => {
        println!("\x1b[36mℹ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[36mℹ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a warning message.
#[macro_export]
macro_rules! log_warning {
    ($message:expr) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs that a file has been saved.
#[macro_export]
macro_rules! log_file_saved {
    ($path:expr) => {
        println!("\x1b[32m✓ Saved: {}\x1b[0m", $path);
    };
}

/// Logs the number of items found.
#[macro_export]
macro_rules! log_found {
    ($count:expr, $item_type:expr) => {
        println!("\x1b[36mFound {} {}\x1b[0m", $count, $item_type);
    };
}
