//! CLI argument definitions for the forgeflow binary.

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Natural-language workflow descriptions into deployable artifacts.
#[derive(Parser, Debug)]
#[command(name = "forgeflow")]
#[command(about = "Generate deployable workflow automations from natural language")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding API spec files (overrides SPECS_DIR)
    #[arg(long, value_name = "DIR", global = true)]
    pub specs_dir: Option<String>,

    /// Print every pipeline event instead of a summary
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline for a workflow description
    Run {
        /// The natural-language workflow description
        request: String,

        /// Correlation id to use (random when omitted)
        #[arg(long, value_name = "ID")]
        correlation_id: Option<String>,
    },

    /// Resume a pipeline suspended for clarification
    Resume {
        /// Correlation id of the suspended run
        correlation_id: String,

        /// The answer to the clarification questions
        message: String,

        /// The original request, for recovery when the checkpoint was
        /// rejected after a schema change
        #[arg(long, value_name = "TEXT")]
        original_request: Option<String>,
    },

    /// Show the indexed API corpus
    Corpus,

    /// List stored checkpoints
    Checkpoints {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        match &self.command {
            Command::Run { request, .. } => {
                if request.trim().is_empty() {
                    anyhow::bail!("the workflow description must not be empty");
                }
            }
            Command::Resume {
                correlation_id,
                message,
                ..
            } => {
                if correlation_id.trim().is_empty() {
                    anyhow::bail!("a correlation id is required to resume");
                }
                if message.trim().is_empty() {
                    anyhow::bail!("the clarification answer must not be empty");
                }
            }
            Command::Corpus | Command::Checkpoints { .. } => {}
        }
        Ok(())
    }
}
