//! The resolver: discovery, assignments, batch resolution, activation.
//!
//! Resolution operates on deep clones: the source config keeps the authored
//! view (refs intact) while the resolved config receives every resolved
//! value. Assignments are plain data (`ref key` + `path` + expected shape +
//! which tree to write); they are applied through the path engine after the
//! provider batches return, so a failed batch never leaves a half-written
//! tree behind.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::load_config;
use crate::paths::Paths;
use crate::secrets::auth_profiles::{AuthProfileStore, agent_refs};
use crate::secrets::path::set_path_create_strict;
use crate::secrets::providers::{RefFailure, ResolveContext};
use crate::secrets::reference::{
    ResolvedSecretInput, coerce_secret_ref, has_configured_secret_input, is_ref_shaped,
    resolve_secret_input_ref,
};
use crate::secrets::registry::{
    DiscoveredTarget, ExpectedResolvedValue, registry,
};
use crate::secrets::snapshot::{AgentStore, Snapshot, SnapshotActivator};
use crate::secrets::surfaces::{SurfaceActivity, surface_activity};
use crate::secrets::{
    SecretRef, SecretsDefaults, SecretsError, SecretsWarning, WARN_REF_IGNORED_INACTIVE_SURFACE,
    WARN_REF_OVERRIDES_PLAINTEXT, inactive_surface_message, push_warning_dedup,
};

/// Where an assignment writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignmentTarget {
    Config,
    AuthStore(usize),
}

/// A planned write of one resolved value.
#[derive(Debug, Clone)]
struct Assignment {
    secret_ref: SecretRef,
    /// Display path, prefixed with the agent for auth-store targets.
    display_path: String,
    path_segments: Vec<String>,
    expected: ExpectedResolvedValue,
    target: AssignmentTarget,
}

/// Outcome of a successful reload.
#[derive(Debug, Clone)]
pub struct ReloadReport {
    pub warning_count: usize,
}

/// Validate the referential rules the resolver depends on, before any
/// provider is invoked: every ref-shaped value must be a valid, completable
/// ref, and an HTTP-mode Slack surface must carry a signing secret.
pub fn validate_config_referential_rules(
    config: &Value,
    defaults: &SecretsDefaults,
) -> Result<(), SecretsError> {
    let mut problems = Vec::new();

    for target in registry().discover_config_secret_targets(config, None) {
        if let Some(problem) = invalid_ref_problem(&target, defaults) {
            problems.push(problem);
        }
    }

    validate_slack_signing_secret(config, &mut problems);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SecretsError::ConfigInvalid(problems.join("; ")))
    }
}

/// A value that looks like a ref but does not validate (bad alias, bad id,
/// or no default provider to complete it) is a config error, not a silent
/// skip.
fn invalid_ref_problem(target: &DiscoveredTarget, defaults: &SecretsDefaults) -> Option<String> {
    for (label, candidate) in [
        (&target.path, target.value.as_ref()),
        (
            target.ref_path.as_ref().unwrap_or(&target.path),
            target.ref_value.as_ref(),
        ),
    ] {
        let Some(candidate) = candidate else { continue };
        if is_ref_shaped(candidate) && coerce_secret_ref(candidate, defaults).is_none() {
            return Some(format!("{label}: invalid secret ref"));
        }
    }
    None
}

fn validate_slack_signing_secret(config: &Value, problems: &mut Vec<String>) {
    let Some(slack) = config
        .pointer("/channels/slack")
        .filter(|s| s.is_object())
    else {
        return;
    };
    if slack.get("enabled").and_then(Value::as_bool) == Some(false) {
        return;
    }
    let top_mode = slack.get("mode").and_then(Value::as_str);
    let top_secret = slack
        .get("signingSecret")
        .is_some_and(has_configured_secret_input);

    let accounts = slack
        .get("accounts")
        .and_then(Value::as_object)
        .filter(|a| !a.is_empty());
    match accounts {
        None => {
            if top_mode == Some("http") && !top_secret {
                problems.push(
                    "channels.slack.signingSecret: required when mode is \"http\"".to_string(),
                );
            }
        }
        Some(accounts) => {
            for (id, account) in accounts {
                if account.get("enabled").and_then(Value::as_bool) == Some(false) {
                    continue;
                }
                let mode = account
                    .get("mode")
                    .and_then(Value::as_str)
                    .or(top_mode);
                let own_secret = account
                    .get("signingSecret")
                    .is_some_and(has_configured_secret_input);
                if mode == Some("http") && !own_secret && !top_secret {
                    problems.push(format!(
                        "channels.slack.accounts.{id}.signingSecret: required when mode is \"http\""
                    ));
                }
            }
        }
    }
}

/// Load every agent's auth-profile store named by the config.
pub fn load_agent_stores(config: &Value, paths: &Paths) -> Result<Vec<AgentStore>, SecretsError> {
    let mut stores = Vec::new();
    for agent in agent_refs(config, paths) {
        let store = AuthProfileStore::load(&agent.dir)
            .map_err(|e| SecretsError::ConfigInvalid(e.to_string()))?;
        stores.push(AgentStore {
            agent,
            tree: store.tree().clone(),
        });
    }
    Ok(stores)
}

fn collect_target(
    target: &DiscoveredTarget,
    config: &Value,
    defaults: &SecretsDefaults,
    target_kind: AssignmentTarget,
    display_prefix: &str,
    assignments: &mut Vec<Assignment>,
    warnings: &mut Vec<SecretsWarning>,
) {
    let ResolvedSecretInput {
        explicit_ref,
        secret_ref,
    } = resolve_secret_input_ref(target.value.as_ref(), target.ref_value.as_ref(), defaults);
    let Some(secret_ref) = secret_ref else {
        return;
    };
    let display_path = format!("{display_prefix}{}", target.path);

    // Surface rules only apply to the main config; auth-profile entries are
    // always active.
    if matches!(target_kind, AssignmentTarget::Config) {
        if let SurfaceActivity::Inactive(reason) = surface_activity(target, config) {
            tracing::debug!(path = %display_path, %reason, "skipping ref on inactive surface");
            push_warning_dedup(
                warnings,
                SecretsWarning {
                    code: WARN_REF_IGNORED_INACTIVE_SURFACE.to_string(),
                    path: display_path.clone(),
                    message: inactive_surface_message(&display_path, &reason),
                },
            );
            return;
        }
    }

    let plaintext_present = target
        .value
        .as_ref()
        .is_some_and(|v| v.as_str().is_some_and(|s| !s.trim().is_empty()));
    if explicit_ref.is_some() && plaintext_present {
        push_warning_dedup(
            warnings,
            SecretsWarning {
                code: WARN_REF_OVERRIDES_PLAINTEXT.to_string(),
                path: display_path.clone(),
                message: format!(
                    "{display_path}: a sibling ref is configured; the plaintext value is ignored"
                ),
            },
        );
    }

    assignments.push(Assignment {
        secret_ref,
        display_path,
        path_segments: target.path_segments.clone(),
        expected: target.entry.expected,
        target: target_kind,
    });
}

/// Prepare a snapshot: discover every active ref in the config and the
/// auth-profile stores, resolve them per provider, and write the values into
/// deep clones of both trees.
pub async fn prepare_snapshot(
    config: &Value,
    agent_stores: Vec<AgentStore>,
    ctx: &ResolveContext,
) -> Result<Snapshot, SecretsError> {
    let defaults = SecretsDefaults::from_config(config);
    validate_config_referential_rules(config, &defaults)?;

    let source_config = config.clone();
    let mut resolved_config = config.clone();
    let mut stores = agent_stores;

    let mut assignments = Vec::new();
    let mut warnings = Vec::new();

    for target in registry().discover_config_secret_targets(&source_config, None) {
        collect_target(
            &target,
            &source_config,
            &defaults,
            AssignmentTarget::Config,
            "",
            &mut assignments,
            &mut warnings,
        );
    }
    for (index, store) in stores.iter().enumerate() {
        let prefix = format!("agents.{}.authProfiles.", store.agent.id);
        for target in registry().discover_auth_profile_secret_targets(&store.tree, None) {
            if let Some(problem) = invalid_ref_problem(&target, &defaults) {
                return Err(SecretsError::ConfigInvalid(format!("{prefix}{problem}")));
            }
            collect_target(
                &target,
                &source_config,
                &defaults,
                AssignmentTarget::AuthStore(index),
                &prefix,
                &mut assignments,
                &mut warnings,
            );
        }
    }

    let refs: Vec<SecretRef> = assignments.iter().map(|a| a.secret_ref.clone()).collect();
    let results = ctx.resolve_refs(&refs).await;

    for assignment in &assignments {
        let key = assignment.secret_ref.ref_key();
        let outcome = results.get(&key).cloned().unwrap_or_else(|| {
            Err(RefFailure::PerRef("ref was not resolved".to_string()))
        });
        let value = match outcome {
            Ok(value) => value,
            Err(failure) => {
                return Err(SecretsError::ref_resolution(
                    key,
                    format!("{} (needed at {})", failure.message(), assignment.display_path),
                ));
            }
        };
        if !assignment.expected.accepts(&value) {
            return Err(SecretsError::ShapeMismatch {
                path: assignment.display_path.clone(),
                message: format!(
                    "expected {}, provider returned {}",
                    match assignment.expected {
                        ExpectedResolvedValue::String => "a non-empty string",
                        ExpectedResolvedValue::StringOrObject =>
                            "a non-empty string or an object",
                    },
                    value_kind(&value)
                ),
            });
        }
        let tree = match assignment.target {
            AssignmentTarget::Config => &mut resolved_config,
            AssignmentTarget::AuthStore(index) => &mut stores[index].tree,
        };
        set_path_create_strict(tree, &assignment.path_segments, value)?;
    }

    tracing::debug!(
        assignments = assignments.len(),
        warnings = warnings.len(),
        "snapshot prepared"
    );
    Ok(Snapshot {
        source_config,
        resolved_config,
        auth_stores: stores,
        warnings,
    })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(s) if s.is_empty() => "an empty string",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Drives reloads against the on-disk config and owns the activator.
pub struct SecretsRuntime {
    paths: Paths,
    activator: Arc<SnapshotActivator>,
    env_overrides: Option<HashMap<String, String>>,
}

impl SecretsRuntime {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            activator: Arc::new(SnapshotActivator::new()),
            env_overrides: None,
        }
    }

    /// Substitute the process environment for env providers (tests).
    pub fn with_env_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.env_overrides = Some(overrides);
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn activator(&self) -> Arc<SnapshotActivator> {
        Arc::clone(&self.activator)
    }

    /// Run a full preparation and, on success, activate the snapshot.
    ///
    /// On failure the activator transitions per the reload state machine:
    /// a startup failure is fatal, a reload failure keeps the last-known-good
    /// snapshot.
    pub async fn reload(&self, startup: bool) -> Result<ReloadReport, SecretsError> {
        self.activator.note_prepare_started();
        match self.prepare().await {
            Ok(snapshot) => {
                let warning_count = snapshot.warnings.len();
                for warning in &snapshot.warnings {
                    tracing::warn!(code = %warning.code, path = %warning.path, "{}", warning.message);
                }
                self.activator.activate(snapshot);
                Ok(ReloadReport { warning_count })
            }
            Err(e) => {
                self.activator.note_prepare_failed(startup, &e.to_string());
                Err(e)
            }
        }
    }

    async fn prepare(&self) -> Result<Snapshot, SecretsError> {
        let config = load_config(&self.paths.config_file())?;
        let stores = load_agent_stores(&config, &self.paths)?;
        let ctx = ResolveContext::from_config(&config, self.env_overrides.clone())?;
        prepare_snapshot(&config, stores, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::auth_profiles::AgentRef;
    use serde_json::json;
    use std::path::PathBuf;

    fn env_ctx(config: &Value, vars: &[(&str, &str)]) -> ResolveContext {
        ResolveContext::from_config(
            config,
            Some(
                vars.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        )
        .unwrap()
    }

    fn store(tree: Value) -> AgentStore {
        AgentStore {
            agent: AgentRef {
                id: "main".to_string(),
                dir: PathBuf::from("/tmp/agents/main/agent"),
            },
            tree,
        }
    }

    fn env_provider_config() -> Value {
        json!({"source": "env"})
    }

    #[tokio::test]
    async fn resolves_inline_ref_into_resolved_config() {
        let config = json!({
            "secrets": {"providers": {"default": env_provider_config()}},
            "talk": {"apiKey": {"source": "env", "provider": "default", "id": "TALK_KEY"}}
        });
        let ctx = env_ctx(&config, &[("TALK_KEY", "sk-live")]);
        let snapshot = prepare_snapshot(&config, Vec::new(), &ctx).await.unwrap();

        assert_eq!(snapshot.resolved_config["talk"]["apiKey"], json!("sk-live"));
        // Source view keeps the ref.
        assert!(snapshot.source_config["talk"]["apiKey"].is_object());
        assert!(snapshot.warnings.is_empty());
    }

    #[tokio::test]
    async fn inactive_surface_is_skipped_with_one_warning() {
        // Scenario: top-level telegram token is a ref, but the only enabled
        // account overrides it; the env only has the account token.
        let config = json!({
            "secrets": {"providers": {"default": env_provider_config()}},
            "channels": {"telegram": {
                "botToken": {"source": "env", "provider": "default", "id": "TOP_TOKEN"},
                "accounts": {
                    "work": {
                        "enabled": true,
                        "botToken": {"source": "env", "provider": "default", "id": "WORK_TOKEN"}
                    },
                    "disabled": {"enabled": false}
                }
            }}
        });
        let ctx = env_ctx(&config, &[("WORK_TOKEN", "tok-work")]);
        let snapshot = prepare_snapshot(&config, Vec::new(), &ctx).await.unwrap();

        assert_eq!(
            snapshot.resolved_config["channels"]["telegram"]["accounts"]["work"]["botToken"],
            json!("tok-work")
        );
        // Top-level ref untouched (still the ref object).
        assert!(snapshot.resolved_config["channels"]["telegram"]["botToken"].is_object());

        let inactive: Vec<_> = snapshot
            .warnings
            .iter()
            .filter(|w| w.code == WARN_REF_IGNORED_INACTIVE_SURFACE)
            .collect();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].path, "channels.telegram.botToken");
    }

    #[tokio::test]
    async fn sibling_ref_overrides_plaintext_with_warning() {
        let config = json!({
            "secrets": {"providers": {"files": {
                "source": "env"
            }}},
            "channels": {"googlechat": {
                "serviceAccount": "old-plaintext",
                "serviceAccountRef": {"source": "env", "provider": "files", "id": "SA_JSON"}
            }}
        });
        let ctx = env_ctx(&config, &[("SA_JSON", "resolved-sa")]);
        let snapshot = prepare_snapshot(&config, Vec::new(), &ctx).await.unwrap();

        // Resolved value lands at the plaintext path; the ref path is
        // unchanged.
        assert_eq!(
            snapshot.resolved_config["channels"]["googlechat"]["serviceAccount"],
            json!("resolved-sa")
        );
        assert!(
            snapshot.resolved_config["channels"]["googlechat"]["serviceAccountRef"].is_object()
        );
        let overrides: Vec<_> = snapshot
            .warnings
            .iter()
            .filter(|w| w.code == WARN_REF_OVERRIDES_PLAINTEXT)
            .collect();
        assert_eq!(overrides.len(), 1);
    }

    #[tokio::test]
    async fn auth_store_refs_resolve_into_store_tree() {
        let config = json!({
            "secrets": {"providers": {"default": env_provider_config()}}
        });
        let stores = vec![store(json!({
            "version": 1,
            "profiles": {"openai:default": {
                "type": "api_key",
                "provider": "openai",
                "keyRef": {"source": "env", "provider": "default", "id": "OPENAI_KEY"}
            }}
        }))];
        let ctx = env_ctx(&config, &[("OPENAI_KEY", "sk-oai")]);
        let snapshot = prepare_snapshot(&config, stores, &ctx).await.unwrap();

        let profile = &snapshot.auth_stores[0].tree["profiles"]["openai:default"];
        assert_eq!(profile["key"], json!("sk-oai"));
        assert!(profile["keyRef"].is_object());
    }

    #[tokio::test]
    async fn missing_env_var_fails_activation() {
        let config = json!({
            "secrets": {"providers": {"default": env_provider_config()}},
            "talk": {"apiKey": {"source": "env", "provider": "default", "id": "NOPE"}}
        });
        let ctx = env_ctx(&config, &[]);
        let err = prepare_snapshot(&config, Vec::new(), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("NOPE"));
        assert!(err.to_string().contains("talk.apiKey"));
    }

    #[tokio::test]
    async fn invalid_ref_shape_fails_before_resolution() {
        let config = json!({
            "talk": {"apiKey": {"source": "env", "provider": "BAD ALIAS", "id": "K"}}
        });
        let ctx = env_ctx(&config, &[]);
        let err = prepare_snapshot(&config, Vec::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, SecretsError::ConfigInvalid(_)));
        assert!(err.to_string().contains("talk.apiKey"));
    }

    #[tokio::test]
    async fn slack_http_mode_requires_signing_secret() {
        let config = json!({"channels": {"slack": {"mode": "http"}}});
        let ctx = env_ctx(&config, &[]);
        let err = prepare_snapshot(&config, Vec::new(), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("channels.slack.signingSecret"));

        let config = json!({"channels": {"slack": {"mode": "http", "signingSecret": "s"}}});
        let ctx = env_ctx(&config, &[]);
        assert!(prepare_snapshot(&config, Vec::new(), &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn no_assignments_on_inactive_surfaces_property() {
        // Invariant: after activation, nothing was resolved at a path the
        // surface rules call inactive.
        let config = json!({
            "secrets": {"providers": {"default": env_provider_config()}},
            "models": {"providers": {
                "openai": {"enabled": false,
                           "apiKey": {"source": "env", "provider": "default", "id": "A"}},
                "anthropic": {"apiKey": {"source": "env", "provider": "default", "id": "B"}}
            }}
        });
        let ctx = env_ctx(&config, &[("B", "sk-b")]);
        let snapshot = prepare_snapshot(&config, Vec::new(), &ctx).await.unwrap();
        // Disabled provider's ref untouched even though "A" is unset; the
        // enabled one resolved.
        assert!(snapshot.resolved_config["models"]["providers"]["openai"]["apiKey"].is_object());
        assert_eq!(
            snapshot.resolved_config["models"]["providers"]["anthropic"]["apiKey"],
            json!("sk-b")
        );
    }

    #[tokio::test]
    async fn runtime_reload_installs_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path());
        std::fs::create_dir_all(paths.config_dir()).unwrap();
        crate::config::save_config(
            &paths.config_file(),
            &json!({
                "secrets": {"providers": {"default": {"source": "env"}}},
                "talk": {"apiKey": {"source": "env", "provider": "default", "id": "T"}}
            }),
        )
        .unwrap();

        let runtime = SecretsRuntime::new(paths)
            .with_env_overrides([("T".to_string(), "sk".to_string())].into());
        let report = runtime.reload(true).await.unwrap();
        assert_eq!(report.warning_count, 0);

        let snapshot = runtime.activator().current().unwrap();
        assert_eq!(snapshot.resolved_config["talk"]["apiKey"], json!("sk"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_last_known_good() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path());
        std::fs::create_dir_all(paths.config_dir()).unwrap();
        crate::config::save_config(
            &paths.config_file(),
            &json!({
                "secrets": {"providers": {"default": {"source": "env"}}},
                "talk": {"apiKey": {"source": "env", "provider": "default", "id": "T"}}
            }),
        )
        .unwrap();

        let runtime = SecretsRuntime::new(paths.clone())
            .with_env_overrides([("T".to_string(), "sk-1".to_string())].into());
        runtime.reload(true).await.unwrap();

        // Break the config: the ref now points at an unset var.
        crate::config::save_config(
            &paths.config_file(),
            &json!({
                "secrets": {"providers": {"default": {"source": "env"}}},
                "talk": {"apiKey": {"source": "env", "provider": "default", "id": "UNSET"}}
            }),
        )
        .unwrap();
        runtime.reload(false).await.unwrap_err();

        // LKG still serves the old value.
        let snapshot = runtime.activator().current().unwrap();
        assert_eq!(snapshot.resolved_config["talk"]["apiKey"], json!("sk-1"));
        assert_eq!(
            runtime.activator().state(),
            crate::secrets::snapshot::ReloaderState::Degraded
        );
    }
}
