//! Semantic API discovery: corpus indexing, retrieval, and LLM-ranked
//! selection.

pub mod corpus;
pub mod index;
pub mod selector;

pub use corpus::{ApiCorpus, SpecFile};
pub use index::{Hit, VectorIndex};
pub use selector::{discover_action, ActionDiscovery};

use anyhow::Result;
use forgeflow_llm::{Embedder, LanguageModel};

use crate::config::Settings;
use crate::models::{ActionIntent, DiscoveredEndpoint, RequirementRecord};
use crate::secrets::SecretResolver;

/// Aggregate result of the discovery stage.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub discovered: Vec<DiscoveredEndpoint>,
    /// Actions whose candidates all fell below the floor. These leave
    /// the plan and are reported with the assumed defaults.
    pub dropped: Vec<ActionIntent>,
    /// Actions skipped only for missing credentials; the planner keeps
    /// them as research steps so generated code can skip gracefully.
    pub unmatched: Vec<ActionIntent>,
    /// Services filtered out for missing credentials.
    pub skipped_services: Vec<String>,
}

impl DiscoveryOutcome {
    pub fn is_partial(&self) -> bool {
        !self.discovered.is_empty() && (!self.dropped.is_empty() || !self.unmatched.is_empty())
    }
}

/// Run discovery for every non-trigger action, in the order the actions
/// were described. Sequential on purpose: event ordering and checkpoint
/// replay stay deterministic.
#[allow(clippy::too_many_arguments)]
pub async fn discover_all(
    model: &dyn LanguageModel,
    embedder: &dyn Embedder,
    vector_index: &VectorIndex,
    corpus: &ApiCorpus,
    secrets: &dyn SecretResolver,
    settings: &Settings,
    requirement: &RequirementRecord,
) -> Result<DiscoveryOutcome> {
    let mut outcome = DiscoveryOutcome::default();

    for action in requirement.actions.iter().filter(|a| !a.is_trigger) {
        match discover_action(
            model,
            embedder,
            vector_index,
            corpus,
            secrets,
            settings,
            action,
            &requirement.description,
        )
        .await?
        {
            ActionDiscovery::Matched(found) => outcome.discovered.push(found),
            ActionDiscovery::Miss => outcome.dropped.push(action.clone()),
            ActionDiscovery::Skipped { services } => {
                for service in services {
                    if !outcome.skipped_services.contains(&service) {
                        outcome.skipped_services.push(service);
                    }
                }
                outcome.unmatched.push(action.clone());
            }
        }
    }

    Ok(outcome)
}
