//! API corpus loading.
//!
//! The corpus is a static set of documentation records authored offline,
//! one spec file per service, loaded once at startup. Spec files are
//! JSON or YAML with the same shape.

use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::{AuthScheme, EndpointDoc, ParamSpec};

/// On-disk spec file: one service with its documented operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecFile {
    pub service: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth: String,
    pub endpoints: Vec<SpecEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecEndpoint {
    pub path: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub response_fields: BTreeMap<String, String>,
    /// Per-endpoint auth override; empty means inherit the service auth.
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub code_example: String,
}

fn default_method() -> String {
    "POST".into()
}

/// The loaded corpus: append-only within a run, never mutated after
/// startup.
#[derive(Debug, Default)]
pub struct ApiCorpus {
    docs: Vec<EndpointDoc>,
}

impl ApiCorpus {
    /// Load every `.json` / `.yaml` / `.yml` spec file in a directory.
    /// Files are read concurrently but indexed in name order so the
    /// corpus layout is stable across runs.
    pub async fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut names: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("failed to read specs directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_lowercase();
            if matches!(ext.as_str(), "json" | "yaml" | "yml") {
                names.push(path);
            }
        }
        names.sort();

        let contents = try_join_all(names.iter().map(|path| async move {
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read spec file {}", path.display()))
        }))
        .await?;

        let mut corpus = ApiCorpus::default();
        for (path, content) in names.iter().zip(&contents) {
            let spec = Self::parse_spec(path, content)?;
            corpus.add_spec(spec);
        }
        Ok(corpus)
    }

    fn parse_spec(path: &Path, content: &str) -> Result<SpecFile> {
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if is_yaml {
            serde_yaml::from_str(content)
                .with_context(|| format!("invalid YAML spec {}", path.display()))
        } else {
            serde_json::from_str(content)
                .with_context(|| format!("invalid JSON spec {}", path.display()))
        }
    }

    /// Flatten a spec file into endpoint documents.
    pub fn add_spec(&mut self, spec: SpecFile) {
        for ep in spec.endpoints {
            let auth_str = if ep.auth.is_empty() { &spec.auth } else { &ep.auth };
            self.docs.push(EndpointDoc {
                service: spec.service.clone(),
                endpoint: ep.path,
                method: ep.method,
                description: ep.description,
                parameters: ep.parameters,
                response_fields: ep.response_fields,
                auth: AuthScheme::parse(auth_str),
                base_url: spec.base_url.clone(),
                code_example: ep.code_example,
            });
        }
    }

    pub fn docs(&self) -> &[EndpointDoc] {
        &self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Distinct service names, in first-seen order.
    pub fn services(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for doc in &self.docs {
            if !out.iter().any(|s| s == &doc.service) {
                out.push(doc.service.clone());
            }
        }
        out
    }

    /// Look up one endpoint by service and path, for the `fetch_spec`
    /// codegen tool.
    pub fn find(&self, service: &str, endpoint: &str) -> Option<&EndpointDoc> {
        self.docs.iter().find(|d| {
            d.service.eq_ignore_ascii_case(service) && d.endpoint.eq_ignore_ascii_case(endpoint)
        })
    }
}
