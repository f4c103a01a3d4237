//! Tool set for the code-generation agent.
//!
//! The LLM never touches the filesystem or network itself: it requests
//! tool invocations and the driver executes them here. Results are
//! plain strings fed back into the transcript, truncated to keep the
//! context window bounded. Tool failures return error strings rather
//! than propagating; the model reads them and adjusts.

use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use forgeflow_llm::{ToolCall, ToolDeclaration};

use crate::discovery::ApiCorpus;

const MAX_PAGE_CHARS: usize = 12_000;
const MAX_FILE_CHARS: usize = 50_000;

pub const TOOL_FETCH_SPEC: &str = "fetch_spec";
pub const TOOL_FETCH_WEB_PAGE: &str = "fetch_web_page";
pub const TOOL_WRITE_FILE: &str = "write_file";
pub const TOOL_READ_FILE: &str = "read_file";
pub const TOOL_FINISH: &str = "finish";

/// Declarations offered to the model. `fetch_web_page` is only exposed
/// when web access is enabled.
pub fn tool_declarations(allow_web_fetch: bool) -> Vec<ToolDeclaration> {
    let mut tools = vec![
        ToolDeclaration {
            name: TOOL_FETCH_SPEC.into(),
            description: "Fetch the indexed documentation for one API endpoint: parameters, \
                          auth, response fields, and a code example."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "service": {"type": "string", "description": "Service name, e.g. Slack"},
                    "endpoint": {"type": "string", "description": "Endpoint path, e.g. /chat.postMessage"}
                },
                "required": ["service", "endpoint"]
            }),
        },
        ToolDeclaration {
            name: TOOL_WRITE_FILE.into(),
            description: "Write a file in the workflow project directory. Use for additional \
                          project files (config.py, client modules). Path is relative to the \
                          project root."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        },
        ToolDeclaration {
            name: TOOL_READ_FILE.into(),
            description: "Read a previously written project file.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"}
                },
                "required": ["path"]
            }),
        },
        ToolDeclaration {
            name: TOOL_FINISH.into(),
            description: "Terminate the loop and return the final workflow.py source. \
                          The artifact must be the complete runnable module."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "artifact": {"type": "string", "description": "Complete workflow.py source"}
                },
                "required": ["artifact"]
            }),
        },
    ];

    if allow_web_fetch {
        tools.insert(
            1,
            ToolDeclaration {
                name: TOOL_FETCH_WEB_PAGE.into(),
                description: "Fetch a web page and return its text. Use to read API \
                              documentation for services without an indexed spec."
                    .into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "description": "http(s) URL to fetch"}
                    },
                    "required": ["url"]
                }),
            },
        );
    }

    tools
}

/// Executes tool calls on behalf of the model.
pub struct ToolContext {
    corpus: Arc<ApiCorpus>,
    project_dir: PathBuf,
    allow_web_fetch: bool,
    http: Client,
}

impl ToolContext {
    pub fn new(corpus: Arc<ApiCorpus>, project_dir: PathBuf, allow_web_fetch: bool) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            corpus,
            project_dir,
            allow_web_fetch,
            http,
        }
    }

    /// Execute one call and return the result string fed back to the
    /// model. `finish` is handled by the driver, never here.
    pub async fn execute(&self, call: &ToolCall) -> String {
        match call.name.as_str() {
            TOOL_FETCH_SPEC => self.fetch_spec(&call.args),
            TOOL_FETCH_WEB_PAGE => self.fetch_web_page(&call.args).await,
            TOOL_WRITE_FILE => self.write_file(&call.args).await,
            TOOL_READ_FILE => self.read_file(&call.args).await,
            other => format!("Error: unknown tool '{other}'"),
        }
    }

    fn fetch_spec(&self, args: &serde_json::Value) -> String {
        let service = args.get("service").and_then(|v| v.as_str()).unwrap_or("");
        let endpoint = args.get("endpoint").and_then(|v| v.as_str()).unwrap_or("");
        if service.is_empty() || endpoint.is_empty() {
            return "Error: service and endpoint are required".into();
        }
        match self.corpus.find(service, endpoint) {
            Some(doc) => serde_json::to_string_pretty(doc)
                .unwrap_or_else(|e| format!("Error: failed to serialize spec: {e}")),
            None => format!("Error: no indexed spec for {service} {endpoint}"),
        }
    }

    async fn fetch_web_page(&self, args: &serde_json::Value) -> String {
        if !self.allow_web_fetch {
            return "Error: web fetch is disabled in this deployment".into();
        }
        let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("");
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return "Error: url must be http(s)".into();
        }

        let resp = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => return format!("Fetch error: {e}"),
        };
        if !resp.status().is_success() {
            return format!("HTTP {}", resp.status().as_u16());
        }
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return format!("Fetch error: {e}"),
        };

        let mut text = strip_html(&body);
        if text.len() > MAX_PAGE_CHARS {
            let total = text.len();
            text.truncate(MAX_PAGE_CHARS);
            text.push_str(&format!("\n\n[Truncated — {total} chars total]"));
        }
        text
    }

    async fn write_file(&self, args: &serde_json::Value) -> String {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let rel = match safe_relative(path) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let full = self.project_dir.join(&rel);
        if let Some(parent) = full.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return format!("Error: failed to create directories: {e}");
            }
        }
        match tokio::fs::write(&full, content).await {
            Ok(()) => format!("Written {} chars to {}", content.len(), rel.display()),
            Err(e) => format!("Error: failed to write {}: {e}", rel.display()),
        }
    }

    async fn read_file(&self, args: &serde_json::Value) -> String {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let rel = match safe_relative(path) {
            Ok(p) => p,
            Err(e) => return e,
        };

        match tokio::fs::read_to_string(self.project_dir.join(&rel)).await {
            Ok(mut content) => {
                if content.len() > MAX_FILE_CHARS {
                    let total = content.len();
                    content.truncate(MAX_FILE_CHARS);
                    content.push_str(&format!("\n\n[Truncated — {total} chars total]"));
                }
                content
            }
            Err(_) => format!("Error: file not found — {}", rel.display()),
        }
    }
}

/// Reject absolute paths and parent traversal; the agent stays inside
/// the project directory.
fn safe_relative(path: &str) -> Result<PathBuf, String> {
    if path.is_empty() {
        return Err("Error: path is required".into());
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err("Error: path must be relative to the project directory".into());
    }
    for component in p.components() {
        if matches!(component, Component::ParentDir) {
            return Err("Error: path must not escape the project directory".into());
        }
    }
    Ok(p.to_path_buf())
}

/// Crude tag stripper for fetched documentation pages.
fn strip_html(html: &str) -> String {
    let no_scripts = regex::Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")
        .expect("script regex")
        .replace_all(html, "");
    let no_tags = regex::Regex::new(r"<[^>]+>")
        .expect("tag regex")
        .replace_all(&no_scripts, "\n");
    no_tags
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
