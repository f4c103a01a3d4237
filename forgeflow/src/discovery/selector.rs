//! LLM-ranked endpoint selection from retrieval candidates.

use anyhow::Result;
use forgeflow_llm::{Embedder, LanguageModel};

use crate::config::Settings;
use crate::discovery::corpus::ApiCorpus;
use crate::discovery::index::{Hit, VectorIndex};
use crate::models::{ActionIntent, DiscoveredEndpoint};
use crate::secrets::SecretResolver;
use crate::utils::{json_f64, json_str, llm_json_with_retry};

/// Outcome of discovery for one action.
#[derive(Debug)]
pub enum ActionDiscovery {
    /// An endpoint was bound to the action.
    Matched(DiscoveredEndpoint),
    /// Nothing cleared the floor; the action is dropped from the DAG
    /// and handed to the codegen agent as research material.
    Miss,
    /// Every surviving candidate belonged to services missing
    /// credentials.
    Skipped { services: Vec<String> },
}

const SELECTION_SYSTEM: &str = r#"You are an API selection expert. Given a workflow step description and candidate API endpoints from a vector search, select the BEST matching endpoint. Consider semantic match, parameter availability, and authentication requirements.

Output ONLY valid JSON:
{"selected_index": <0-based index>, "match_score": 0.0-1.0, "justification": "one sentence"}"#;

/// Build the compound retrieval query for an action: verb/description,
/// extracted parameters, and the service hint as a bias.
pub fn build_query(action: &ActionIntent) -> String {
    let mut parts = vec![action.description.clone()];
    for (name, value) in &action.parameters {
        parts.push(format!("{name}={value}"));
    }
    if !action.service_hint.is_empty() {
        parts.push(action.service_hint.clone());
    }
    parts.join(" ")
}

/// Discover the best endpoint for one action.
#[allow(clippy::too_many_arguments)]
pub async fn discover_action(
    model: &dyn LanguageModel,
    embedder: &dyn Embedder,
    index: &VectorIndex,
    corpus: &ApiCorpus,
    secrets: &dyn SecretResolver,
    settings: &Settings,
    action: &ActionIntent,
    workflow_context: &str,
) -> Result<ActionDiscovery> {
    let query = build_query(action);
    let hits = index
        .search_text(embedder, &query, settings.retrieval_k)
        .await?;

    // Keep candidates above the retrieval floor, excluding services the
    // action ruled out. The service hint is a bias, never a filter.
    let above_floor: Vec<Hit> = hits
        .into_iter()
        .filter(|h| h.similarity >= settings.candidate_floor)
        .filter(|h| {
            let service = &corpus.docs()[h.doc_index].service;
            !action
                .excluded_services
                .iter()
                .any(|x| x.eq_ignore_ascii_case(service))
        })
        .collect();

    if above_floor.is_empty() {
        return Ok(ActionDiscovery::Miss);
    }

    // Credential filter: services without configured credentials are
    // dropped, and reported if that empties the candidate set.
    let mut skipped_services: Vec<String> = Vec::new();
    let candidates: Vec<Hit> = above_floor
        .into_iter()
        .filter(|h| {
            let service = corpus.docs()[h.doc_index].service.clone();
            if secrets.service_available(&service) {
                true
            } else {
                if !skipped_services.contains(&service) {
                    skipped_services.push(service);
                }
                false
            }
        })
        .collect();

    if candidates.is_empty() {
        return Ok(ActionDiscovery::Skipped {
            services: skipped_services,
        });
    }

    // Exactly one candidate clearing the selection floor: no rerank.
    if candidates.len() == 1 && candidates[0].similarity >= settings.selection_floor {
        let hit = candidates[0];
        return Ok(ActionDiscovery::Matched(DiscoveredEndpoint {
            action_id: action.id.clone(),
            endpoint: corpus.docs()[hit.doc_index].clone(),
            score: hit.similarity,
            justification: "single candidate above similarity floor".into(),
        }));
    }

    let (index_in_candidates, score, justification) =
        rerank(model, corpus, &candidates, action, workflow_context).await;
    let hit = candidates[index_in_candidates];

    if score < settings.selection_floor {
        return Ok(ActionDiscovery::Miss);
    }

    Ok(ActionDiscovery::Matched(DiscoveredEndpoint {
        action_id: action.id.clone(),
        endpoint: corpus.docs()[hit.doc_index].clone(),
        score,
        justification,
    }))
}

/// Ask the model to rank the candidates. On any model failure, fall
/// back to the highest embedding similarity (candidates are already
/// sorted best-first, which is also the tie-break order).
async fn rerank(
    model: &dyn LanguageModel,
    corpus: &ApiCorpus,
    candidates: &[Hit],
    action: &ActionIntent,
    workflow_context: &str,
) -> (usize, f64, String) {
    let mut candidates_text = String::new();
    for (i, hit) in candidates.iter().enumerate() {
        let doc = &corpus.docs()[hit.doc_index];
        candidates_text.push_str(&format!(
            "\n--- Candidate {} (similarity: {:.3}) ---\n{}\n",
            i,
            hit.similarity,
            doc.embedding_text()
        ));
    }

    let prompt = format!(
        "STEP DESCRIPTION: {}\n\nWORKFLOW CONTEXT: {}\n\nCANDIDATE APIs:{}",
        action.description, workflow_context, candidates_text
    );

    match llm_json_with_retry(model, SELECTION_SYSTEM, &prompt).await {
        Ok(value) => {
            let mut idx = value
                .get("selected_index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            if idx >= candidates.len() {
                idx = 0;
            }
            let score = json_f64(&value, "match_score").unwrap_or(candidates[idx].similarity);
            let justification = json_str(&value, "justification");
            (idx, score, justification)
        }
        Err(_) => (
            0,
            candidates[0].similarity,
            "highest embedding similarity (rerank unavailable)".into(),
        ),
    }
}
