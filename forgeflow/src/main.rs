//! ForgeFlow CLI.
//!
//! ```bash
//! # Generate and deploy a workflow
//! forgeflow run "Send a message 'Hello' to Slack channel #general"
//!
//! # Answer a clarification round
//! forgeflow resume wf-1a2b3c "Use #onboarding and jane@acme.com"
//!
//! # Inspect the indexed corpus / stored checkpoints
//! forgeflow corpus
//! forgeflow checkpoints
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use forgeflow::codegen::ScanConfig;
use forgeflow::deployment::DirectoryPackager;
use forgeflow::discovery::{ApiCorpus, VectorIndex};
use forgeflow::execution::AutoSandbox;
use forgeflow::pipeline::{CancelFlag, CheckpointStore, PipelineRunner, RunOutcome, Services};
use forgeflow::secrets::EnvSecretResolver;
use forgeflow::Settings;
use forgeflow_llm::{GeminiClient, GeminiEmbedder, LlmConfig};
use forgeflow_sdk::{log_found, log_info, log_warning, ConsoleSink, EventSink, NullSink};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;

    let mut settings = Settings::from_env();
    if let Some(dir) = &args.specs_dir {
        settings.specs_dir = dir.clone();
    }

    match &args.command {
        Command::Corpus => show_corpus(&settings).await,
        Command::Checkpoints { limit } => show_checkpoints(&settings, *limit),
        Command::Run {
            request,
            correlation_id,
        } => {
            let runner = build_runner(&settings, args.verbose).await?;
            let cancel = spawn_ctrl_c_handler();
            let outcome = runner
                .run(request, correlation_id.clone(), cancel)
                .await?;
            report_outcome(outcome);
            Ok(())
        }
        Command::Resume {
            correlation_id,
            message,
            original_request,
        } => {
            let runner = build_runner(&settings, args.verbose).await?;
            let cancel = spawn_ctrl_c_handler();
            let outcome = runner
                .resume(correlation_id, message, original_request.as_deref(), cancel)
                .await?;
            report_outcome(outcome);
            Ok(())
        }
    }
}

async fn build_runner(settings: &Settings, verbose: bool) -> Result<PipelineRunner> {
    let llm_config = LlmConfig::new(settings.llm_api_key.clone(), settings.llm_model.clone())
        .with_timeout(settings.llm_timeout_secs);
    let model = Arc::new(GeminiClient::new(llm_config).context("LLM client setup failed")?);
    let embedder =
        Arc::new(GeminiEmbedder::new(settings.llm_api_key.clone()).context("embedder setup failed")?);

    log_info!("Loading API corpus from {}", settings.specs_dir);
    let corpus = Arc::new(ApiCorpus::load_dir(&settings.specs_dir).await?);
    if corpus.is_empty() {
        log_warning!("API corpus is empty; discovery will match nothing");
    } else {
        log_found!(corpus.len(), "indexed endpoints");
    }

    let index = Arc::new(VectorIndex::build(&corpus, embedder.as_ref()).await?);
    let checkpoints = Arc::new(CheckpointStore::new(settings.checkpoint_db.clone().into())?);
    let sink: Arc<dyn EventSink> = if verbose {
        Arc::new(ConsoleSink)
    } else {
        Arc::new(NullSink)
    };

    let services = Arc::new(Services {
        model,
        embedder,
        corpus,
        index,
        secrets: Arc::new(EnvSecretResolver),
        sandbox: Arc::new(AutoSandbox::default()),
        sink,
        checkpoints,
        packager: Arc::new(DirectoryPackager::new(settings.deploy_dir.clone())),
        scan_config: ScanConfig::default(),
        settings: settings.clone(),
    });

    Ok(PipelineRunner::new(services))
}

fn spawn_ctrl_c_handler() -> CancelFlag {
    let cancel = CancelFlag::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_warning!("Cancelling run");
            handle.cancel();
        }
    });
    cancel
}

fn report_outcome(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Deployed { final_message, receipt } => {
            println!("\x1b[32m✓ {final_message}\x1b[0m");
            for file in receipt.files {
                println!("    {file}");
            }
        }
        RunOutcome::NeedsClarification {
            correlation_id,
            questions,
            message,
            ..
        } => {
            println!("\x1b[33m{message}\x1b[0m");
            for (i, q) in questions.iter().enumerate() {
                println!("  {}. {q}", i + 1);
            }
            println!("\nAnswer with: forgeflow resume {correlation_id} \"<your answer>\"");
        }
        RunOutcome::Failed {
            stage,
            category,
            message,
            last_debug,
        } => {
            println!("\x1b[31m✗ Pipeline failed at {stage} ({category}): {message}\x1b[0m");
            if let Some(record) = last_debug {
                println!(
                    "  last diagnosis (attempt {}): {} — {}",
                    record.attempt, record.category, record.root_cause
                );
            }
        }
        RunOutcome::Cancelled => {
            println!("\x1b[33mRun cancelled; checkpoint kept for inspection\x1b[0m");
        }
    }
}

async fn show_corpus(settings: &Settings) -> Result<()> {
    let corpus = ApiCorpus::load_dir(&settings.specs_dir).await?;
    log_found!(corpus.len(), "endpoints");
    for service in corpus.services() {
        println!("\x1b[1m{service}\x1b[0m");
        for doc in corpus.docs().iter().filter(|d| d.service == service) {
            println!("  {} {} — {}", doc.method, doc.endpoint, doc.description);
        }
    }
    Ok(())
}

fn show_checkpoints(settings: &Settings, limit: usize) -> Result<()> {
    let store = CheckpointStore::new(settings.checkpoint_db.clone().into())?;
    let ids = store.list_ids(limit)?;
    if ids.is_empty() {
        log_info!("No stored checkpoints");
    } else {
        log_found!(ids.len(), "checkpoints");
        for id in ids {
            println!("  {id}");
        }
    }
    Ok(())
}
