//! Secret references: the `{source, provider, id}` triple.
//!
//! A ref can appear anywhere the registry allows a secret: either as the value
//! itself (`secret_input` shape) or at a sibling `*Ref` path (`sibling_ref`
//! shape). Sibling refs override plaintext at runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a secret value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    Env,
    File,
    Exec,
}

impl SecretSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Env => "env",
            Self::File => "file",
            Self::Exec => "exec",
        }
    }
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SecretSource {}

/// A canonical secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub source: SecretSource,
    pub provider: String,
    pub id: String,
}

impl SecretRef {
    /// Cache/batch key: `source:provider:id`.
    pub fn ref_key(&self) -> String {
        format!("{}:{}:{}", self.source, self.provider, self.id)
    }

    /// Full shape validation per source.
    pub fn validate(&self) -> Result<(), RefShapeError> {
        if !is_valid_provider_alias(&self.provider) {
            return Err(RefShapeError::BadProvider(self.provider.clone()));
        }
        let id_ok = match self.source {
            SecretSource::Env => is_valid_env_id(&self.id),
            SecretSource::File => is_valid_json_pointer(&self.id),
            SecretSource::Exec => is_valid_exec_id(&self.id),
        };
        if !id_ok {
            return Err(RefShapeError::BadId {
                source: self.source,
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

/// A ref literal that fails shape validation.
#[derive(Debug, thiserror::Error)]
pub enum RefShapeError {
    #[error("invalid provider alias {0:?} (want lowercase [a-z][a-z0-9_-], max 64 chars)")]
    BadProvider(String),

    #[error("invalid {source} ref id {id:?}")]
    BadId { source: SecretSource, id: String },
}

/// Global default provider aliases, used when a ref omits `provider`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
}

impl SecretsDefaults {
    /// Read `secrets.defaults` out of a config tree. Absent or malformed
    /// sections yield the empty defaults.
    pub fn from_config(config: &Value) -> Self {
        config
            .get("secrets")
            .and_then(|s| s.get("defaults"))
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default()
    }

    fn for_source(&self, source: SecretSource) -> Option<&str> {
        match source {
            SecretSource::Env => self.env.as_deref(),
            SecretSource::File => self.file.as_deref(),
            SecretSource::Exec => self.exec.as_deref(),
        }
    }
}

/// Provider alias: `^[a-z][a-z0-9_-]{0,63}$`.
pub fn is_valid_provider_alias(alias: &str) -> bool {
    let bytes = alias.as_bytes();
    if bytes.is_empty() || bytes.len() > 64 {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_' || *b == b'-')
}

/// Env id: `^[A-Z][A-Z0-9_]{0,127}$`.
pub fn is_valid_env_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() > 128 {
        return false;
    }
    if !bytes[0].is_ascii_uppercase() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'_')
}

/// File id: absolute RFC-6901 JSON pointer. `~` may only appear as `~0`/`~1`.
pub fn is_valid_json_pointer(id: &str) -> bool {
    if !id.starts_with('/') {
        return false;
    }
    let bytes = id.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'~' {
            match bytes.get(i + 1) {
                Some(b'0') | Some(b'1') => i += 2,
                _ => return false,
            }
        } else {
            i += 1;
        }
    }
    true
}

/// Exec id: `^[A-Za-z0-9][A-Za-z0-9._:/-]{0,255}$`.
pub fn is_valid_exec_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() > 256 {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes[1..].iter().all(|b| {
        b.is_ascii_alphanumeric() || matches!(*b, b'.' | b'_' | b':' | b'/' | b'-')
    })
}

/// Interpret a JSON value as a ref if it has the ref object shape:
/// `{source, id}` with optional `provider` (filled from defaults) and no
/// other keys. Returns `None` for anything else, including refs that fail
/// validation after the provider is filled.
pub fn coerce_secret_ref(value: &Value, defaults: &SecretsDefaults) -> Option<SecretRef> {
    let obj = value.as_object()?;
    if obj
        .keys()
        .any(|k| k != "source" && k != "provider" && k != "id")
    {
        return None;
    }
    let source: SecretSource = serde_json::from_value(obj.get("source")?.clone()).ok()?;
    let id = obj.get("id")?.as_str()?.to_string();
    let provider = match obj.get("provider") {
        Some(Value::String(p)) => p.clone(),
        Some(_) => return None,
        None => defaults.for_source(source)?.to_string(),
    };
    let re = SecretRef {
        source,
        provider,
        id,
    };
    re.validate().ok()?;
    Some(re)
}

/// Whether a value looks like a ref object, ignoring whether a default
/// provider exists to complete it.
pub fn is_ref_shaped(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    if obj
        .keys()
        .any(|k| k != "source" && k != "provider" && k != "id")
    {
        return false;
    }
    let source_ok = obj
        .get("source")
        .and_then(Value::as_str)
        .is_some_and(|s| matches!(s, "env" | "file" | "exec"));
    source_ok && obj.get("id").and_then(Value::as_str).is_some()
}

/// True when a secret-bearing field is configured at all: a non-empty string
/// plaintext or a ref-shaped object.
pub fn has_configured_secret_input(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.trim().is_empty(),
        other => is_ref_shaped(other),
    }
}

/// Outcome of reading one target: the ref that should resolve, and whether it
/// came from an explicit sibling `*Ref` field.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSecretInput {
    /// The sibling-ref value, when present and valid.
    pub explicit_ref: Option<SecretRef>,
    /// The ref to resolve (sibling ref wins over an inline ref value).
    pub secret_ref: Option<SecretRef>,
}

/// Combine a target's value and optional sibling-ref value into the ref to
/// resolve. A valid sibling ref overrides everything else; otherwise an
/// inline ref-shaped value is used; otherwise there is nothing to resolve.
pub fn resolve_secret_input_ref(
    value: Option<&Value>,
    ref_value: Option<&Value>,
    defaults: &SecretsDefaults,
) -> ResolvedSecretInput {
    if let Some(rv) = ref_value {
        if let Some(explicit) = coerce_secret_ref(rv, defaults) {
            return ResolvedSecretInput {
                explicit_ref: Some(explicit.clone()),
                secret_ref: Some(explicit),
            };
        }
    }
    if let Some(v) = value {
        if let Some(inline) = coerce_secret_ref(v, defaults) {
            return ResolvedSecretInput {
                explicit_ref: None,
                secret_ref: Some(inline),
            };
        }
    }
    ResolvedSecretInput::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_alias_shapes() {
        assert!(is_valid_provider_alias("default"));
        assert!(is_valid_provider_alias("vault-prod_2"));
        assert!(!is_valid_provider_alias(""));
        assert!(!is_valid_provider_alias("Default"));
        assert!(!is_valid_provider_alias("2fast"));
        assert!(!is_valid_provider_alias(&"a".repeat(65)));
    }

    #[test]
    fn env_id_shapes() {
        assert!(is_valid_env_id("TELEGRAM_BOT_TOKEN"));
        assert!(is_valid_env_id("A"));
        assert!(!is_valid_env_id("lower"));
        assert!(!is_valid_env_id("_LEAD"));
        assert!(!is_valid_env_id("HAS-DASH"));
    }

    #[test]
    fn json_pointer_shapes() {
        assert!(is_valid_json_pointer("/providers/openai/apiKey"));
        assert!(is_valid_json_pointer("/a~0b/c~1d"));
        assert!(is_valid_json_pointer("/"));
        assert!(!is_valid_json_pointer("providers/openai"));
        assert!(!is_valid_json_pointer("/bad~2escape"));
        assert!(!is_valid_json_pointer("/trailing~"));
    }

    #[test]
    fn exec_id_shapes() {
        assert!(is_valid_exec_id("openai/api-key"));
        assert!(is_valid_exec_id("ns:item.v2"));
        assert!(!is_valid_exec_id(""));
        assert!(!is_valid_exec_id("-lead"));
        assert!(!is_valid_exec_id("has space"));
    }

    #[test]
    fn coerce_with_explicit_provider() {
        let defaults = SecretsDefaults::default();
        let r = coerce_secret_ref(
            &json!({"source": "env", "provider": "default", "id": "MY_TOKEN"}),
            &defaults,
        )
        .unwrap();
        assert_eq!(r.ref_key(), "env:default:MY_TOKEN");
    }

    #[test]
    fn coerce_fills_provider_from_defaults() {
        let defaults = SecretsDefaults {
            env: Some("primary".to_string()),
            ..Default::default()
        };
        let r = coerce_secret_ref(&json!({"source": "env", "id": "MY_TOKEN"}), &defaults).unwrap();
        assert_eq!(r.provider, "primary");
        // No default for file -> cannot complete the ref.
        assert!(coerce_secret_ref(&json!({"source": "file", "id": "/k"}), &defaults).is_none());
    }

    #[test]
    fn coerce_rejects_extra_keys_and_bad_shapes() {
        let defaults = SecretsDefaults::default();
        assert!(
            coerce_secret_ref(
                &json!({"source": "env", "provider": "p", "id": "K", "extra": 1}),
                &defaults
            )
            .is_none()
        );
        assert!(coerce_secret_ref(&json!("sk-plaintext"), &defaults).is_none());
        assert!(
            coerce_secret_ref(
                &json!({"source": "vault", "provider": "p", "id": "K"}),
                &defaults
            )
            .is_none()
        );
        // Shape-valid but id invalid for the source.
        assert!(
            coerce_secret_ref(
                &json!({"source": "env", "provider": "p", "id": "not upper"}),
                &defaults
            )
            .is_none()
        );
    }

    #[test]
    fn configured_input_detection() {
        assert!(has_configured_secret_input(&json!("sk-live")));
        assert!(!has_configured_secret_input(&json!("   ")));
        assert!(!has_configured_secret_input(&json!(null)));
        assert!(has_configured_secret_input(
            &json!({"source": "env", "id": "K"})
        ));
        assert!(!has_configured_secret_input(&json!({"foo": "bar"})));
    }

    #[test]
    fn sibling_ref_wins_over_inline() {
        let defaults = SecretsDefaults::default();
        let value = json!("plaintext");
        let ref_value = json!({"source": "env", "provider": "default", "id": "TOKEN"});
        let out = resolve_secret_input_ref(Some(&value), Some(&ref_value), &defaults);
        assert_eq!(out.explicit_ref.as_ref().unwrap().id, "TOKEN");
        assert_eq!(out.secret_ref.unwrap().id, "TOKEN");
    }

    #[test]
    fn inline_ref_when_no_sibling() {
        let defaults = SecretsDefaults::default();
        let value = json!({"source": "exec", "provider": "op", "id": "openai/key"});
        let out = resolve_secret_input_ref(Some(&value), None, &defaults);
        assert!(out.explicit_ref.is_none());
        assert_eq!(out.secret_ref.unwrap().ref_key(), "exec:op:openai/key");
    }

    #[test]
    fn plaintext_only_yields_nothing() {
        let defaults = SecretsDefaults::default();
        let out = resolve_secret_input_ref(Some(&json!("sk-plain")), None, &defaults);
        assert!(out.secret_ref.is_none());
    }
}
