//! Read-only secret resolution.
//!
//! The core never copies credentials into artifacts or pipeline state;
//! it only asks the resolver which services are usable (discovery
//! filtering) and materializes declared env vars at sandbox launch.

use std::collections::HashMap;

use crate::config::Settings;

/// Key-value secret lookup. Read-only and shared across runs.
pub trait SecretResolver: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Whether every credential a service requires is present. Services
    /// without a credential table entry are always available.
    fn service_available(&self, service: &str) -> bool {
        match Settings::required_credentials(service) {
            Some(vars) => vars.iter().all(|v| {
                self.get(v)
                    .map(|value| !value.trim().is_empty())
                    .unwrap_or(false)
            }),
            None => true,
        }
    }

    /// Resolve the declared environment variables of a DAG into the
    /// map injected into the sandbox. Missing values are omitted, not
    /// empty-stringed, so generated code can skip gracefully.
    fn resolve_env(&self, declared: &[String]) -> HashMap<String, String> {
        declared
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.clone(), v)))
            .collect()
    }
}

/// Resolver backed by the process environment.
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed-map resolver for tests and offline runs.
#[derive(Default)]
pub struct StaticSecretResolver {
    values: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl SecretResolver for StaticSecretResolver {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_available_requires_all_vars() {
        let resolver = StaticSecretResolver::new().with("GMAIL_ADDRESS", "team@example.com");
        // Gmail needs both address and app password.
        assert!(!resolver.service_available("Gmail"));

        let resolver = resolver.with("GMAIL_APP_PASSWORD", "abcd efgh");
        assert!(resolver.service_available("Gmail"));
    }

    #[test]
    fn test_uncredentialed_service_is_always_available() {
        let resolver = StaticSecretResolver::new();
        assert!(resolver.service_available("HTTP"));
    }

    #[test]
    fn test_blank_credential_counts_as_missing() {
        let resolver = StaticSecretResolver::new().with("SLACK_BOT_TOKEN", "   ");
        assert!(!resolver.service_available("Slack"));
    }

    #[test]
    fn test_resolve_env_omits_missing() {
        let resolver = StaticSecretResolver::new().with("SLACK_BOT_TOKEN", "xoxb-test");
        let env = resolver.resolve_env(&[
            "SLACK_BOT_TOKEN".to_string(),
            "GMAIL_ADDRESS".to_string(),
        ]);
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("SLACK_BOT_TOKEN").unwrap(), "xoxb-test");
    }
}
