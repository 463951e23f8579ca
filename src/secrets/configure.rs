//! Configure-plan builders.
//!
//! The configure flow discovers every secret still stored as plaintext and
//! builds a migration plan that moves each one behind an env ref with a
//! deterministic variable name. The operator reviews the plan (and exports
//! the named variables) before `secrets apply` commits it.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::config::load_config;
use crate::paths::Paths;
use crate::secrets::auth_profiles::{AuthProfileStore, agent_refs};
use crate::secrets::plan::{PlanTarget, SecretsPlan, new_plan};
use crate::secrets::providers::provider_configs_from;
use crate::secrets::reference::{SecretRef, SecretSource};
use crate::secrets::registry::registry;
use crate::secrets::SecretsError;

/// Options for the configure builder.
#[derive(Debug, Clone, Default)]
pub struct ConfigureOptions {
    /// Only emit provider upserts, no target migrations.
    pub providers_only: bool,
    /// Do not add a default provider even when none exists.
    pub skip_provider_setup: bool,
    /// Restrict auth-profile migration to one agent.
    pub agent: Option<String>,
}

/// Alias used when the builder has to introduce an env provider.
pub const DEFAULT_ENV_PROVIDER_ALIAS: &str = "default";

/// Build a migration plan from the current on-disk state.
pub fn build_configure_plan(
    paths: &Paths,
    options: &ConfigureOptions,
) -> Result<SecretsPlan, SecretsError> {
    let config = load_config(&paths.config_file())?;
    let mut plan = new_plan("polyclaw secrets configure");

    let providers = provider_configs_from(&config)?;
    let env_alias = providers
        .iter()
        .find(|(_, cfg)| cfg.source() == SecretSource::Env)
        .map(|(alias, _)| alias.clone());
    let env_alias = match env_alias {
        Some(alias) => alias,
        None if options.skip_provider_setup => DEFAULT_ENV_PROVIDER_ALIAS.to_string(),
        None => {
            let mut upserts = BTreeMap::new();
            upserts.insert(
                DEFAULT_ENV_PROVIDER_ALIAS.to_string(),
                json!({"source": "env"}),
            );
            plan.provider_upserts = Some(upserts);
            DEFAULT_ENV_PROVIDER_ALIAS.to_string()
        }
    };

    if options.providers_only {
        return Ok(plan);
    }

    for target in registry().discover_config_secret_targets(&config, None) {
        if !target.entry.include_in_configure || !target.entry.include_in_plan {
            continue;
        }
        let Some(plaintext) = target.value.as_ref().and_then(Value::as_str) else {
            continue;
        };
        if plaintext.trim().is_empty() {
            continue;
        }
        plan.targets.push(PlanTarget {
            target_type: target.entry.target_type.to_string(),
            path: target.path.clone(),
            path_segments: Some(target.path_segments.clone()),
            secret_ref: SecretRef {
                source: SecretSource::Env,
                provider: env_alias.clone(),
                id: env_var_name_for(&target.path_segments),
            },
            agent_id: None,
            provider_id: target.provider_id.clone(),
            account_id: target.account_id.clone(),
            auth_profile_provider: None,
        });
    }

    for agent in agent_refs(&config, paths) {
        if options
            .agent
            .as_deref()
            .is_some_and(|wanted| wanted != agent.id)
        {
            continue;
        }
        let store = AuthProfileStore::load(&agent.dir)
            .map_err(|e| SecretsError::ConfigInvalid(e.to_string()))?;
        for target in registry().discover_auth_profile_secret_targets(store.tree(), None) {
            if !target.entry.include_in_configure {
                continue;
            }
            let Some(plaintext) = target.value.as_ref().and_then(Value::as_str) else {
                continue;
            };
            if plaintext.trim().is_empty() {
                continue;
            }
            let profile_id = target.captures.first().cloned().unwrap_or_default();
            let provider = store
                .profile(&profile_id)
                .and_then(|p| p.get("provider"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let mut id_segments = vec!["auth".to_string(), agent.id.clone()];
            id_segments.extend(target.path_segments.iter().skip(1).cloned());
            plan.targets.push(PlanTarget {
                target_type: target.entry.target_type.to_string(),
                path: target.path.clone(),
                path_segments: Some(target.path_segments.clone()),
                secret_ref: SecretRef {
                    source: SecretSource::Env,
                    provider: env_alias.clone(),
                    id: env_var_name_for(&id_segments),
                },
                agent_id: Some(agent.id.clone()),
                provider_id: None,
                account_id: None,
                auth_profile_provider: provider,
            });
        }
    }

    Ok(plan)
}

/// Deterministic env var name for a path: camelCase splits into words,
/// everything non-alphanumeric becomes `_`, the result is uppercased and
/// deduplicated of consecutive underscores.
pub fn env_var_name_for(segments: &[String]) -> String {
    let mut out = String::new();
    for segment in segments {
        if !out.is_empty() {
            out.push('_');
        }
        let mut prev_lower = false;
        for c in segment.chars() {
            if c.is_ascii_alphanumeric() {
                if c.is_ascii_uppercase() && prev_lower {
                    out.push('_');
                }
                prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
                out.push(c.to_ascii_uppercase());
            } else {
                prev_lower = false;
                if !out.ends_with('_') {
                    out.push('_');
                }
            }
        }
    }
    let trimmed: String = out.trim_matches('_').to_string();
    if trimmed
        .chars()
        .next()
        .is_none_or(|c| !c.is_ascii_alphabetic())
    {
        format!("S_{trimmed}")
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::plan::validate_plan;
    use tempfile::TempDir;

    fn seg(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn env_var_names_are_stable_and_valid() {
        assert_eq!(env_var_name_for(&seg(&["talk", "apiKey"])), "TALK_API_KEY");
        assert_eq!(
            env_var_name_for(&seg(&["channels", "telegram", "botToken"])),
            "CHANNELS_TELEGRAM_BOT_TOKEN"
        );
        assert_eq!(
            env_var_name_for(&seg(&["auth", "main", "openai:default", "key"])),
            "AUTH_MAIN_OPENAI_DEFAULT_KEY"
        );
        assert_eq!(env_var_name_for(&seg(&["0weird"])), "S_0WEIRD");
        for name in [
            env_var_name_for(&seg(&["models", "providers", "openai", "apiKey"])),
            env_var_name_for(&seg(&["agents", "list", "0", "memorySearch", "remote", "apiKey"])),
        ] {
            assert!(crate::secrets::reference::is_valid_env_id(&name), "{name}");
        }
    }

    #[tokio::test]
    async fn builds_plan_for_plaintext_targets() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path());
        crate::config::save_config(
            &paths.config_file(),
            &serde_json::json!({
                "talk": {"apiKey": "sk-plain"},
                "channels": {"telegram": {
                    "botToken": {"source": "env", "provider": "default", "id": "ALREADY_REF"}
                }}
            }),
        )
        .unwrap();

        let plan = build_configure_plan(&paths, &ConfigureOptions::default()).unwrap();
        // Plaintext migrated, existing ref left alone, default provider added.
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].path, "talk.apiKey");
        assert_eq!(plan.targets[0].secret_ref.id, "TALK_API_KEY");
        assert!(plan.provider_upserts.is_some());
        validate_plan(&plan).unwrap();
    }

    #[tokio::test]
    async fn providers_only_emits_no_targets() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path());
        crate::config::save_config(
            &paths.config_file(),
            &serde_json::json!({"talk": {"apiKey": "sk-plain"}}),
        )
        .unwrap();

        let plan = build_configure_plan(
            &paths,
            &ConfigureOptions {
                providers_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(plan.targets.is_empty());
        assert!(plan.provider_upserts.is_some());
    }

    #[tokio::test]
    async fn auth_profile_plaintext_included_per_agent() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path());
        crate::config::save_config(&paths.config_file(), &serde_json::json!({})).unwrap();
        let agent_dir = paths.default_agent_dir("main");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            Paths::auth_profiles_file(&agent_dir),
            serde_json::to_string(&serde_json::json!({
                "version": 1,
                "profiles": {"openai:default": {
                    "type": "api_key", "provider": "openai", "key": "sk-plain"
                }}
            }))
            .unwrap(),
        )
        .unwrap();

        let plan = build_configure_plan(&paths, &ConfigureOptions::default()).unwrap();
        assert_eq!(plan.targets.len(), 1);
        let target = &plan.targets[0];
        assert_eq!(target.agent_id.as_deref(), Some("main"));
        assert_eq!(target.auth_profile_provider.as_deref(), Some("openai"));
        assert_eq!(target.secret_ref.id, "AUTH_MAIN_OPENAI_DEFAULT_KEY");
        validate_plan(&plan).unwrap();

        // Filtering by a different agent excludes it.
        let plan = build_configure_plan(
            &paths,
            &ConfigureOptions {
                agent: Some("other".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(plan.targets.is_empty());
    }
}
