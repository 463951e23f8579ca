//! Env provider: resolves ids against the process environment.

use std::collections::HashMap;

use serde_json::Value;

use crate::secrets::SecretsError;
use crate::secrets::providers::{BatchOutcome, EnvProviderConfig, SecretProvider};

pub struct EnvProvider {
    alias: String,
    config: EnvProviderConfig,
    /// Substitute environment for tests and preflight runs.
    overrides: Option<HashMap<String, String>>,
}

impl EnvProvider {
    pub fn new(
        alias: String,
        config: EnvProviderConfig,
        overrides: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            alias,
            config,
            overrides,
        }
    }

    fn lookup(&self, id: &str) -> Option<String> {
        match &self.overrides {
            Some(map) => map.get(id).cloned(),
            None => std::env::var(id).ok(),
        }
    }
}

#[async_trait::async_trait]
impl SecretProvider for EnvProvider {
    async fn resolve(&self, ids: &[String]) -> Result<BatchOutcome, SecretsError> {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            if let Some(allow) = &self.config.allowlist {
                if !allow.iter().any(|a| a == id) {
                    outcome.errors.insert(
                        id.clone(),
                        format!(
                            "env var {id} is not in the allowlist of provider {}",
                            self.alias
                        ),
                    );
                    continue;
                }
            }
            match self.lookup(id) {
                Some(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        outcome
                            .errors
                            .insert(id.clone(), format!("env var {id} is empty"));
                    } else {
                        outcome
                            .values
                            .insert(id.clone(), Value::String(trimmed.to_string()));
                    }
                }
                None => {
                    outcome
                        .errors
                        .insert(id.clone(), format!("env var {id} is not set"));
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(
        allowlist: Option<Vec<&str>>,
        vars: &[(&str, &str)],
    ) -> EnvProvider {
        EnvProvider::new(
            "default".to_string(),
            EnvProviderConfig {
                allowlist: allowlist
                    .map(|a| a.into_iter().map(str::to_string).collect()),
            },
            Some(
                vars.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        )
    }

    #[tokio::test]
    async fn resolves_and_trims() {
        let p = provider(None, &[("MY_TOKEN", "  tok  ")]);
        let out = p.resolve(&["MY_TOKEN".to_string()]).await.unwrap();
        assert_eq!(out.values["MY_TOKEN"], serde_json::json!("tok"));
    }

    #[tokio::test]
    async fn missing_and_empty_fail_per_id() {
        let p = provider(None, &[("EMPTY", "   ")]);
        let out = p
            .resolve(&["EMPTY".to_string(), "ABSENT".to_string()])
            .await
            .unwrap();
        assert!(out.values.is_empty());
        assert!(out.errors["EMPTY"].contains("empty"));
        assert!(out.errors["ABSENT"].contains("not set"));
    }

    #[tokio::test]
    async fn allowlist_blocks_unlisted_names() {
        let p = provider(Some(vec!["ALLOWED"]), &[("BLOCKED", "v"), ("ALLOWED", "w")]);
        let out = p
            .resolve(&["BLOCKED".to_string(), "ALLOWED".to_string()])
            .await
            .unwrap();
        assert_eq!(out.values["ALLOWED"], serde_json::json!("w"));
        assert!(out.errors["BLOCKED"].contains("allowlist"));
    }
}
