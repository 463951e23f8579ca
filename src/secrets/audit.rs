//! The secrets audit: scan every on-disk surface for plaintext, unresolved
//! refs, provider shadowing, and legacy residue.
//!
//! The audit never mutates anything. It batches every discovered ref through
//! the provider pipeline exactly like an activation would, so "unresolved"
//! here means "activation would fail on this ref".

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::config::load_config;
use crate::paths::Paths;
use crate::secrets::auth_profiles::{AuthProfileStore, agent_refs, load_legacy_auth};
use crate::secrets::env_file::{EnvFile, is_known_secret_env_var};
use crate::secrets::providers::{RefFailure, ResolveContext};
use crate::secrets::reference::resolve_secret_input_ref;
use crate::secrets::registry::{ExpectedResolvedValue, normalize_provider_id, registry};
use crate::secrets::{SecretRef, SecretsDefaults};

/// Audit finding codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditCode {
    #[serde(rename = "PLAINTEXT_FOUND")]
    PlaintextFound,
    #[serde(rename = "REF_UNRESOLVED")]
    RefUnresolved,
    #[serde(rename = "REF_SHADOWED")]
    RefShadowed,
    #[serde(rename = "LEGACY_RESIDUE")]
    LegacyResidue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditFinding {
    pub code: AuditCode,
    pub severity: AuditSeverity,
    pub file: String,
    #[serde(rename = "jsonPath")]
    pub json_path: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "profileId", skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Clean,
    Findings,
    Unresolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub status: AuditStatus,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    /// Exit-code policy: unresolved refs are always 2; with `--check` any
    /// finding is 1; otherwise 0.
    pub fn exit_code(&self, check: bool) -> i32 {
        match self.status {
            AuditStatus::Unresolved => 2,
            AuditStatus::Findings if check => 1,
            _ => 0,
        }
    }
}

/// A ref queued for batch verification, with enough context to report on it.
struct PendingRef {
    secret_ref: SecretRef,
    file: String,
    json_path: String,
    expected: ExpectedResolvedValue,
    provider: Option<String>,
    profile_id: Option<String>,
}

/// Run the full audit against the on-disk state.
pub async fn run_secrets_audit(
    paths: &Paths,
    env_overrides: Option<HashMap<String, String>>,
) -> AuditReport {
    let mut findings = Vec::new();
    let mut pending: Vec<PendingRef> = Vec::new();

    let config_file = paths.config_file().display().to_string();
    let config = match load_config(&paths.config_file()) {
        Ok(config) => config,
        Err(e) => {
            findings.push(AuditFinding {
                code: AuditCode::RefUnresolved,
                severity: AuditSeverity::Error,
                file: config_file,
                json_path: String::new(),
                message: format!("config is unusable, no resolution attempted: {e}"),
                provider: None,
                profile_id: None,
            });
            return finish(findings);
        }
    };
    let defaults = SecretsDefaults::from_config(&config);

    scan_main_config(&config, &defaults, &config_file, &mut findings, &mut pending);
    let shadow_candidates = scan_auth_stores(
        &config,
        paths,
        &defaults,
        &mut findings,
        &mut pending,
    );
    scan_env_file(paths, &mut findings);

    // Batch every discovered ref through the provider pipeline.
    match ResolveContext::from_config(&config, env_overrides) {
        Ok(ctx) => {
            let refs: Vec<SecretRef> = pending.iter().map(|p| p.secret_ref.clone()).collect();
            let results = ctx.resolve_refs(&refs).await;
            for p in &pending {
                let outcome = results.get(&p.secret_ref.ref_key());
                let failure = match outcome {
                    Some(Ok(value)) if p.expected.accepts(value) => None,
                    Some(Ok(_)) => Some("resolved to the wrong shape".to_string()),
                    Some(Err(RefFailure::ProviderScoped(m))) => Some(m.clone()),
                    Some(Err(RefFailure::PerRef(m))) => Some(m.clone()),
                    None => Some("not resolved".to_string()),
                };
                if let Some(message) = failure {
                    findings.push(AuditFinding {
                        code: AuditCode::RefUnresolved,
                        severity: AuditSeverity::Error,
                        file: p.file.clone(),
                        json_path: p.json_path.clone(),
                        message: format!(
                            "ref {} does not resolve: {message}",
                            p.secret_ref.ref_key()
                        ),
                        provider: p.provider.clone(),
                        profile_id: p.profile_id.clone(),
                    });
                }
            }
        }
        Err(e) => {
            findings.push(AuditFinding {
                code: AuditCode::RefUnresolved,
                severity: AuditSeverity::Error,
                file: paths.config_file().display().to_string(),
                json_path: "secrets.providers".to_string(),
                message: format!("provider configuration is unusable: {e}"),
                provider: None,
                profile_id: None,
            });
        }
    }

    // Shadowing: a config ref for a model provider that also has usable
    // credentials in some auth-profile store.
    for p in &pending {
        let Some(provider) = &p.provider else { continue };
        let normalized = normalize_provider_id(provider);
        if let Some(profile_id) = shadow_candidates.get(&normalized) {
            findings.push(AuditFinding {
                code: AuditCode::RefShadowed,
                severity: AuditSeverity::Warning,
                file: p.file.clone(),
                json_path: p.json_path.clone(),
                message: format!(
                    "ref at {} is shadowed by auth profile {profile_id} for provider {provider}",
                    p.json_path
                ),
                provider: Some(provider.clone()),
                profile_id: Some(profile_id.clone()),
            });
        }
    }

    finish(findings)
}

fn finish(findings: Vec<AuditFinding>) -> AuditReport {
    let status = if findings.iter().any(|f| f.code == AuditCode::RefUnresolved) {
        AuditStatus::Unresolved
    } else if findings.is_empty() {
        AuditStatus::Clean
    } else {
        AuditStatus::Findings
    };
    AuditReport { status, findings }
}

fn scan_main_config(
    config: &Value,
    defaults: &SecretsDefaults,
    config_file: &str,
    findings: &mut Vec<AuditFinding>,
    pending: &mut Vec<PendingRef>,
) {
    for target in registry().discover_config_secret_targets(config, None) {
        if !target.entry.include_in_audit {
            continue;
        }
        let plaintext = target
            .value
            .as_ref()
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty());
        if plaintext {
            findings.push(AuditFinding {
                code: AuditCode::PlaintextFound,
                severity: AuditSeverity::Warning,
                file: config_file.to_string(),
                json_path: target.path.clone(),
                message: format!("plaintext secret at {}", target.path),
                provider: target.provider_id.clone(),
                profile_id: None,
            });
        }
        let resolved = resolve_secret_input_ref(
            target.value.as_ref(),
            target.ref_value.as_ref(),
            defaults,
        );
        if let Some(secret_ref) = resolved.secret_ref {
            pending.push(PendingRef {
                secret_ref,
                file: config_file.to_string(),
                json_path: target.path.clone(),
                expected: target.entry.expected,
                provider: if target.entry.track_provider_shadowing {
                    target.provider_id.clone()
                } else {
                    None
                },
                profile_id: None,
            });
        }
    }
}

/// Scan every agent's auth-profile store and the legacy auth store.
/// Returns `normalized provider -> profile id` for profiles with usable
/// static or OAuth credentials (the shadowing candidates).
fn scan_auth_stores(
    config: &Value,
    paths: &Paths,
    defaults: &SecretsDefaults,
    findings: &mut Vec<AuditFinding>,
    pending: &mut Vec<PendingRef>,
) -> HashMap<String, String> {
    let mut shadow_candidates: HashMap<String, String> = HashMap::new();

    for agent in agent_refs(config, paths) {
        let store = match AuthProfileStore::load(&agent.dir) {
            Ok(store) => store,
            Err(e) => {
                findings.push(AuditFinding {
                    code: AuditCode::RefUnresolved,
                    severity: AuditSeverity::Error,
                    file: Paths::auth_profiles_file(&agent.dir).display().to_string(),
                    json_path: String::new(),
                    message: format!("auth-profile store is unusable: {e}"),
                    provider: None,
                    profile_id: None,
                });
                continue;
            }
        };
        let store_file = store.file_path().display().to_string();

        for target in registry().discover_auth_profile_secret_targets(store.tree(), None) {
            let profile_id = target.captures.first().cloned();
            let profile = profile_id
                .as_deref()
                .and_then(|id| store.profile(id));
            let provider = profile
                .and_then(|p| p.get("provider"))
                .and_then(Value::as_str)
                .map(str::to_string);

            let plaintext = target
                .value
                .as_ref()
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if plaintext {
                findings.push(AuditFinding {
                    code: AuditCode::PlaintextFound,
                    severity: AuditSeverity::Warning,
                    file: store_file.clone(),
                    json_path: target.path.clone(),
                    message: format!("plaintext credential at {}", target.path),
                    provider: provider.clone(),
                    profile_id: profile_id.clone(),
                });
            }
            let resolved = resolve_secret_input_ref(
                target.value.as_ref(),
                target.ref_value.as_ref(),
                defaults,
            );
            if let Some(secret_ref) = resolved.secret_ref {
                pending.push(PendingRef {
                    secret_ref,
                    file: store_file.clone(),
                    json_path: target.path.clone(),
                    expected: target.entry.expected,
                    provider: None,
                    profile_id: profile_id.clone(),
                });
            }
        }

        if let Some(profiles) = store.profiles() {
            for (profile_id, profile) in profiles {
                let profile_type = profile.get("type").and_then(Value::as_str).unwrap_or("");
                let provider = profile
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let static_secret = ["key", "token"].iter().any(|field| {
                    profile
                        .get(*field)
                        .and_then(Value::as_str)
                        .is_some_and(|s| !s.trim().is_empty())
                });
                if profile_type == "oauth" {
                    findings.push(AuditFinding {
                        code: AuditCode::LegacyResidue,
                        severity: AuditSeverity::Info,
                        file: store_file.clone(),
                        json_path: format!("profiles.{profile_id}"),
                        message: format!(
                            "OAuth profile {profile_id} is outside ref management"
                        ),
                        provider: Some(provider.to_string()),
                        profile_id: Some(profile_id.clone()),
                    });
                }
                if (static_secret || profile_type == "oauth") && !provider.is_empty() {
                    shadow_candidates
                        .entry(normalize_provider_id(provider))
                        .or_insert_with(|| profile_id.clone());
                }
            }
        }

        scan_legacy_store(&agent.dir, findings);
    }
    shadow_candidates
}

fn scan_legacy_store(agent_dir: &Path, findings: &mut Vec<AuditFinding>) {
    let Some(legacy) = load_legacy_auth(agent_dir) else {
        return;
    };
    let Some(entries) = legacy.as_object() else {
        return;
    };
    let file = Paths::legacy_auth_file(agent_dir).display().to_string();
    for (provider_id, entry) in entries {
        let is_api_key = entry.get("type").and_then(Value::as_str) == Some("api_key");
        let has_key = entry
            .get("key")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty());
        if is_api_key && has_key {
            findings.push(AuditFinding {
                code: AuditCode::LegacyResidue,
                severity: AuditSeverity::Warning,
                file: file.clone(),
                json_path: provider_id.clone(),
                message: format!(
                    "legacy static api key for {provider_id}; migrate it to an auth profile ref"
                ),
                provider: Some(provider_id.clone()),
                profile_id: None,
            });
        }
    }
}

fn scan_env_file(paths: &Paths, findings: &mut Vec<AuditFinding>) {
    let env_path = paths.env_file();
    let Ok(raw) = std::fs::read_to_string(&env_path) else {
        return;
    };
    let file = env_path.display().to_string();
    let parsed = EnvFile::parse(&raw);
    let mut reported: HashSet<&str> = HashSet::new();
    for (key, value) in parsed.entries() {
        if is_known_secret_env_var(key) && !value.trim().is_empty() && reported.insert(key) {
            findings.push(AuditFinding {
                code: AuditCode::PlaintextFound,
                severity: AuditSeverity::Warning,
                file: file.clone(),
                json_path: key.to_string(),
                message: format!("{key} holds a plaintext secret in .env"),
                provider: None,
                profile_id: None,
            });
        }
    }
}
