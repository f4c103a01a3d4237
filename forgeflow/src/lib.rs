//! ForgeFlow: natural-language workflow descriptions into deployable
//! artifacts, through a staged AI pipeline with checkpointed state,
//! semantic API discovery, DAG planning, tool-calling code generation,
//! sandboxed execution, and a bounded self-debug loop.

pub mod codegen;
pub mod config;
pub mod conversation;
pub mod deployment;
pub mod discovery;
pub mod execution;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod secrets;
pub mod utils;

pub use config::Settings;
pub use pipeline::{CancelFlag, PipelineRunner, RunOutcome, Services};
