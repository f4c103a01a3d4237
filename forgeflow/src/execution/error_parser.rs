//! Structured parsing of sandbox stderr.
//!
//! Turns a raw Python traceback into typed diagnostics: error type,
//! message, line number, traceback frames, a keyword-derived category,
//! and fix suggestions for the self-debugger prompt.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::models::ErrorCategory;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracebackFrame {
    pub file: String,
    pub line: usize,
    pub function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParsedError {
    pub error_type: String,
    pub message: String,
    pub line_number: Option<usize>,
    pub code_context: String,
    pub frames: Vec<TracebackFrame>,
    pub category: Option<ErrorCategory>,
    pub suggestions: Vec<String>,
}

const AUTH_KEYWORDS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "invalid_auth",
    "token",
    "credential",
];
const RATE_LIMIT_KEYWORDS: &[&str] = &["429", "rate limit", "too many requests", "throttl"];
const TIMEOUT_KEYWORDS: &[&str] = &["timed out", "timeout"];

fn frame_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"File "([^"]+)", line (\d+)(?:, in (\S+))?"#).expect("frame regex")
    })
}

/// Map a Python exception type name to a category, then let message
/// keywords override (an HTTP 401 inside a ValueError is still an auth
/// failure).
pub fn categorize(error_type: &str, message: &str) -> ErrorCategory {
    let base = match error_type {
        "ModuleNotFoundError" | "ImportError" => ErrorCategory::ImportError,
        "SyntaxError" | "IndentationError" | "TabError" => ErrorCategory::LogicError,
        "NameError" | "AttributeError" | "TypeError" | "ValueError" | "IndexError" => {
            ErrorCategory::LogicError
        }
        "KeyError" | "JSONDecodeError" => ErrorCategory::SchemaMismatch,
        "ConnectionError" | "ConnectError" | "ReadTimeout" | "ClientError" | "SSLError" => {
            ErrorCategory::NetworkError
        }
        "TimeoutError" => ErrorCategory::Timeout,
        "PermissionError" => ErrorCategory::AuthFailure,
        "FileNotFoundError" => ErrorCategory::MissingParam,
        _ => ErrorCategory::Unknown,
    };

    let msg = message.to_lowercase();
    if AUTH_KEYWORDS.iter().any(|kw| msg.contains(kw)) {
        return ErrorCategory::AuthFailure;
    }
    if RATE_LIMIT_KEYWORDS.iter().any(|kw| msg.contains(kw)) {
        return ErrorCategory::RateLimit;
    }
    if base == ErrorCategory::Unknown && TIMEOUT_KEYWORDS.iter().any(|kw| msg.contains(kw)) {
        return ErrorCategory::Timeout;
    }
    base
}

/// Parse stderr into a structured error. `code` supplies the context
/// snippet around the failing line when available.
pub fn parse_error(stderr: &str, code: &str) -> ParsedError {
    let mut parsed = ParsedError::default();
    if stderr.trim().is_empty() {
        parsed.message = "No error output".into();
        return parsed;
    }

    // Final error line: the last non-empty line that is not chained-
    // exception chatter.
    let error_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("During handling"))
        .unwrap_or("");

    if let Some((error_type, message)) = error_line.split_once(": ") {
        // Strip a dotted module prefix: "httpx.ConnectError" -> "ConnectError".
        parsed.error_type = error_type
            .rsplit('.')
            .next()
            .unwrap_or(error_type)
            .trim()
            .to_string();
        parsed.message = message.trim().to_string();
    } else {
        parsed.message = error_line.to_string();
    }

    for caps in frame_regex().captures_iter(stderr) {
        let line = caps[2].parse().unwrap_or(0);
        parsed.frames.push(TracebackFrame {
            file: caps[1].to_string(),
            line,
            function: caps
                .get(3)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "<module>".into()),
        });
        parsed.line_number = Some(line);
    }

    if let Some(line_no) = parsed.line_number {
        parsed.code_context = context_snippet(code, line_no);
    }

    let category = categorize(&parsed.error_type, &parsed.message);
    parsed.suggestions = suggest_fixes(category, &parsed);
    parsed.category = Some(category);
    parsed
}

/// The last complete traceback block of a stderr capture, for the
/// execution-result contract.
pub fn last_traceback(stderr: &str) -> Option<String> {
    let start = stderr.rfind("Traceback (most recent call last):")?;
    Some(stderr[start..].trim_end().to_string())
}

fn context_snippet(code: &str, line_no: usize) -> String {
    if code.is_empty() || line_no == 0 {
        return String::new();
    }
    let lines: Vec<&str> = code.lines().collect();
    let start = line_no.saturating_sub(3);
    let end = (line_no + 2).min(lines.len());
    (start..end)
        .map(|i| {
            let marker = if i + 1 == line_no { " >> " } else { "    " };
            format!("{}{}: {}", marker, i + 1, lines.get(i).unwrap_or(&""))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn suggest_fixes(category: ErrorCategory, parsed: &ParsedError) -> Vec<String> {
    match category {
        ErrorCategory::ImportError => {
            let module = parsed
                .message
                .split('\'')
                .nth(1)
                .unwrap_or(&parsed.message)
                .to_string();
            vec![
                format!("Remove or replace the missing module '{module}'"),
                "Only standard library + httpx + websockets are available in the sandbox".into(),
            ]
        }
        ErrorCategory::AuthFailure => vec![
            "Verify the token env var name matches the DAG's environment_vars".into(),
            "Check the Authorization header format (Bearer vs Basic)".into(),
        ],
        ErrorCategory::SchemaMismatch => vec![
            "Check the request body structure against the endpoint spec".into(),
            "Use defensive access (dict.get()) on response fields".into(),
        ],
        ErrorCategory::NetworkError => vec![
            "Verify the API URL is correct and reachable".into(),
            "Add retry logic with exponential backoff".into(),
        ],
        ErrorCategory::RateLimit => vec![
            "Add delays between API calls".into(),
            "Implement exponential backoff".into(),
        ],
        ErrorCategory::LogicError => vec![
            "Check variable names for typos".into(),
            "Verify function arguments match the expected signature".into(),
        ],
        _ => vec![],
    }
}
