//! Migration plans: the versioned file that drives `secrets apply`.
//!
//! A plan names targets (registry type + concrete path + the ref to write),
//! optional provider upserts/deletes, and scrub options. Validation is
//! strict and total: a plan either validates completely or apply refuses to
//! touch anything.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::secrets::path::{join_segments, parse_dot_path};
use crate::secrets::providers::ProviderConfig;
use crate::secrets::reference::{SecretRef, is_valid_provider_alias};
use crate::secrets::registry::{ConfigFileScope, ResolvedPlanTarget, registry};
use crate::secrets::SecretsError;

pub const PLAN_VERSION: u64 = 1;
pub const PLAN_PROTOCOL_VERSION: u64 = 1;

/// Segments that would collide with JS prototype machinery in consumers of
/// the plan format; never legal in a path.
const FORBIDDEN_SEGMENTS: &[&str] = &["__proto__", "prototype", "constructor"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTarget {
    #[serde(rename = "type")]
    pub target_type: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_segments: Option<Vec<String>>,
    #[serde(rename = "ref")]
    pub secret_ref: SecretRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Provider to record when apply must create the auth profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOptions {
    #[serde(default = "default_true")]
    pub scrub_env: bool,
    #[serde(default = "default_true")]
    pub scrub_auth_profiles_for_provider_targets: bool,
    #[serde(default = "default_true")]
    pub scrub_legacy_auth_json: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            scrub_env: true,
            scrub_auth_profiles_for_provider_targets: true,
            scrub_legacy_auth_json: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsPlan {
    pub version: u64,
    pub protocol_version: u64,
    pub generated_at: String,
    pub generated_by: String,
    pub targets: Vec<PlanTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_upserts: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_deletes: Option<Vec<String>>,
    #[serde(default)]
    pub options: PlanOptions,
}

impl SecretsPlan {
    pub fn load(path: &Path) -> Result<Self, SecretsError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SecretsError::PlanInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SecretsError::PlanInvalid(format!("{} does not parse: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SecretsError> {
        let pretty = serde_json::to_string_pretty(self).expect("plan serializes");
        crate::config::write_atomic(path, pretty.as_bytes()).map_err(|source| {
            SecretsError::ApplyIo {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

/// One plan target, resolved against the registry.
#[derive(Debug, Clone)]
pub struct ValidatedTarget {
    pub target: PlanTarget,
    pub resolved: ResolvedPlanTarget,
    pub path_segments: Vec<String>,
}

/// A fully-validated plan, ready for projection.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    pub targets: Vec<ValidatedTarget>,
    pub provider_upserts: BTreeMap<String, ProviderConfig>,
    pub provider_deletes: Vec<String>,
    pub options: PlanOptions,
}

/// Validate a plan end to end. Any violation refuses the whole plan.
pub fn validate_plan(plan: &SecretsPlan) -> Result<ValidatedPlan, SecretsError> {
    if plan.version != PLAN_VERSION {
        return Err(SecretsError::PlanInvalid(format!(
            "unsupported plan version {}",
            plan.version
        )));
    }
    if plan.protocol_version != PLAN_PROTOCOL_VERSION {
        return Err(SecretsError::PlanInvalid(format!(
            "unsupported plan protocolVersion {}",
            plan.protocol_version
        )));
    }

    let reg = registry();
    let mut targets = Vec::new();
    for (index, target) in plan.targets.iter().enumerate() {
        let at = |msg: String| SecretsError::PlanInvalid(format!("targets[{index}]: {msg}"));

        if !reg.is_known_secret_target_type(&target.target_type) {
            return Err(at(format!("unknown target type {:?}", target.target_type)));
        }
        if target.path.trim().is_empty() {
            return Err(at("path is empty".to_string()));
        }
        let derived = parse_dot_path(&target.path);
        let path_segments = match &target.path_segments {
            Some(segments) => {
                if join_segments(segments) != target.path {
                    return Err(at(format!(
                        "pathSegments do not serialize back to {:?}",
                        target.path
                    )));
                }
                segments.clone()
            }
            None => derived,
        };
        if let Some(bad) = path_segments
            .iter()
            .find(|s| FORBIDDEN_SEGMENTS.contains(&s.as_str()))
        {
            return Err(at(format!("forbidden path segment {bad:?}")));
        }

        let resolved = reg
            .resolve_plan_target(
                &target.target_type,
                &path_segments,
                target.provider_id.as_deref(),
                target.account_id.as_deref(),
            )
            .ok_or_else(|| {
                at(format!(
                    "path {:?} does not match the registered pattern for {:?} \
                     (or a supplied provider/account id disagrees with the path)",
                    target.path, target.target_type
                ))
            })?;

        if resolved.entry.config_file == ConfigFileScope::AuthProfile
            && target.agent_id.as_deref().is_none_or(str::is_empty)
        {
            return Err(at("auth-profile target requires agentId".to_string()));
        }

        target.secret_ref.validate().map_err(|e| at(e.to_string()))?;

        targets.push(ValidatedTarget {
            target: target.clone(),
            resolved,
            path_segments,
        });
    }

    let mut provider_upserts = BTreeMap::new();
    if let Some(upserts) = &plan.provider_upserts {
        for (alias, raw) in upserts {
            if !is_valid_provider_alias(alias) {
                return Err(SecretsError::PlanInvalid(format!(
                    "providerUpserts: invalid alias {alias:?}"
                )));
            }
            let config: ProviderConfig = serde_json::from_value(raw.clone()).map_err(|e| {
                SecretsError::PlanInvalid(format!("providerUpserts.{alias}: {e}"))
            })?;
            config
                .validate(alias)
                .map_err(|e| SecretsError::PlanInvalid(format!("providerUpserts.{alias}: {e}")))?;
            provider_upserts.insert(alias.clone(), config);
        }
    }

    let mut provider_deletes = Vec::new();
    if let Some(deletes) = &plan.provider_deletes {
        for alias in deletes {
            if !is_valid_provider_alias(alias) {
                return Err(SecretsError::PlanInvalid(format!(
                    "providerDeletes: invalid alias {alias:?}"
                )));
            }
            provider_deletes.push(alias.clone());
        }
    }

    Ok(ValidatedPlan {
        targets,
        provider_upserts,
        provider_deletes,
        options: plan.options.clone(),
    })
}

/// Convenience constructor used by the configure builders.
pub fn new_plan(generated_by: &str) -> SecretsPlan {
    SecretsPlan {
        version: PLAN_VERSION,
        protocol_version: PLAN_PROTOCOL_VERSION,
        generated_at: chrono::Utc::now().to_rfc3339(),
        generated_by: generated_by.to_string(),
        targets: Vec::new(),
        provider_upserts: None,
        provider_deletes: None,
        options: PlanOptions::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::reference::SecretSource;
    use serde_json::json;

    fn env_ref(id: &str) -> SecretRef {
        SecretRef {
            source: SecretSource::Env,
            provider: "default".to_string(),
            id: id.to_string(),
        }
    }

    fn base_plan() -> SecretsPlan {
        let mut plan = new_plan("test");
        plan.targets.push(PlanTarget {
            target_type: "talk.apiKey".to_string(),
            path: "talk.apiKey".to_string(),
            path_segments: None,
            secret_ref: env_ref("TALK_KEY"),
            agent_id: None,
            provider_id: None,
            account_id: None,
            auth_profile_provider: None,
        });
        plan
    }

    #[test]
    fn valid_plan_passes() {
        let validated = validate_plan(&base_plan()).unwrap();
        assert_eq!(validated.targets.len(), 1);
        assert_eq!(validated.targets[0].path_segments, vec!["talk", "apiKey"]);
    }

    #[test]
    fn wrong_versions_rejected() {
        let mut plan = base_plan();
        plan.version = 2;
        assert!(validate_plan(&plan).is_err());

        let mut plan = base_plan();
        plan.protocol_version = 9;
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let mut plan = base_plan();
        plan.targets[0].target_type = "nope".to_string();
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("unknown target type"));
    }

    #[test]
    fn path_segment_mismatch_rejected() {
        let mut plan = base_plan();
        plan.targets[0].path_segments = Some(vec!["talk".to_string(), "wrong".to_string()]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("serialize back"));
    }

    #[test]
    fn forbidden_segments_rejected() {
        let mut plan = base_plan();
        plan.targets[0].target_type = "models.provider.apiKey".to_string();
        plan.targets[0].path = "models.providers.__proto__.apiKey".to_string();
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("forbidden path segment"));
    }

    #[test]
    fn pattern_mismatch_rejected() {
        let mut plan = base_plan();
        plan.targets[0].path = "talk.other".to_string();
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn provider_id_disagreement_rejected() {
        let mut plan = new_plan("test");
        plan.targets.push(PlanTarget {
            target_type: "models.provider.apiKey".to_string(),
            path: "models.providers.openai.apiKey".to_string(),
            path_segments: None,
            secret_ref: env_ref("OAI"),
            agent_id: None,
            provider_id: Some("anthropic".to_string()),
            account_id: None,
            auth_profile_provider: None,
        });
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn auth_profile_target_needs_agent_id() {
        let mut plan = new_plan("test");
        plan.targets.push(PlanTarget {
            target_type: "auth-profiles.api_key.key".to_string(),
            path: "profiles.openai:default.key".to_string(),
            path_segments: None,
            secret_ref: env_ref("OAI"),
            agent_id: None,
            provider_id: None,
            account_id: None,
            auth_profile_provider: Some("openai".to_string()),
        });
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("agentId"));

        plan.targets[0].agent_id = Some("main".to_string());
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn bad_ref_rejected() {
        let mut plan = base_plan();
        plan.targets[0].secret_ref.id = "not upper".to_string();
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn provider_upserts_validated() {
        let mut plan = base_plan();
        plan.provider_upserts = Some(
            [(
                "vault".to_string(),
                json!({"source": "exec", "command": "/usr/local/bin/vault"}),
            )]
            .into(),
        );
        let validated = validate_plan(&plan).unwrap();
        assert!(validated.provider_upserts.contains_key("vault"));

        let mut plan = base_plan();
        plan.provider_upserts = Some(
            [("Bad Alias".to_string(), json!({"source": "env"}))].into(),
        );
        assert!(validate_plan(&plan).is_err());

        let mut plan = base_plan();
        plan.provider_upserts = Some(
            [("relcmd".to_string(), json!({"source": "exec", "command": "rel"}))].into(),
        );
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn options_default_to_scrub_everything() {
        let plan: SecretsPlan = serde_json::from_value(json!({
            "version": 1,
            "protocolVersion": 1,
            "generatedAt": "2026-01-01T00:00:00Z",
            "generatedBy": "test",
            "targets": []
        }))
        .unwrap();
        assert!(plan.options.scrub_env);
        assert!(plan.options.scrub_auth_profiles_for_provider_targets);
        assert!(plan.options.scrub_legacy_auth_json);
    }

    #[test]
    fn plan_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plan.json");
        let plan = base_plan();
        plan.save(&path).unwrap();
        let loaded = SecretsPlan::load(&path).unwrap();
        assert_eq!(loaded.targets.len(), 1);
        assert_eq!(loaded.targets[0].path, "talk.apiKey");
        validate_plan(&loaded).unwrap();
    }
}
