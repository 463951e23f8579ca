//! Secrets subsystem: references in configuration, resolved at activation.
//!
//! User configuration and per-agent auth-profile stores may hold secret
//! *references* (`{source, provider, id}`) instead of plaintext. At startup
//! and on `secrets.reload` the resolver discovers every active ref, batches
//! them per provider, and atomically installs a fully-resolved snapshot that
//! the rest of the gateway reads. The audit and apply engines manage the
//! on-disk migration from plaintext to references.
//!
//! Module map:
//! - [`path`]: dot-path engine (`*` and `name[]` tokens, strict mutations)
//! - [`registry`]: catalog of every secret-bearing location
//! - [`reference`]: the ref triple and its validation
//! - [`providers`]: env / file / exec resolution with batching and caps
//! - [`resolver`]: discovery, assignments, activation state machine
//! - [`snapshot`]: the active snapshot and command-secret lookups
//! - [`audit`]: on-disk plaintext/unresolved/shadow/residue scanning
//! - [`plan`] / [`apply`]: migration plans and atomic multi-file commits
//! - [`configure`]: plan builders for the configure flow

pub mod apply;
pub mod audit;
pub mod auth_profiles;
pub mod configure;
pub mod env_file;
pub mod error;
pub mod path;
pub mod plan;
pub mod providers;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod snapshot;
pub mod surfaces;

pub use error::SecretsError;
pub use reference::{SecretRef, SecretSource, SecretsDefaults};

use serde::{Deserialize, Serialize};

/// Warning emitted during resolution or command-secret lookup.
///
/// Warnings are deduplicated by `(code, path, message)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsWarning {
    pub code: String,
    pub path: String,
    pub message: String,
}

/// A sibling `*Ref` field overrode configured plaintext.
pub const WARN_REF_OVERRIDES_PLAINTEXT: &str = "SECRETS_REF_OVERRIDES_PLAINTEXT";
/// A ref sits on a surface the active-surface rules consider disabled.
pub const WARN_REF_IGNORED_INACTIVE_SURFACE: &str = "SECRETS_REF_IGNORED_INACTIVE_SURFACE";

/// Sentinel embedded in inactive-surface diagnostics so remote callers can
/// classify them without a structured code field.
pub const INACTIVE_SURFACE_SENTINEL: &str = ": secret ref is configured on an inactive surface;";

/// Message body for an inactive-surface diagnostic at `path`.
pub fn inactive_surface_message(path: &str, reason: &str) -> String {
    format!("{path}{INACTIVE_SURFACE_SENTINEL} {reason}")
}

/// Append a warning unless an identical one is already present.
pub fn push_warning_dedup(warnings: &mut Vec<SecretsWarning>, warning: SecretsWarning) {
    if !warnings.contains(&warning) {
        warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_dedup_by_triple() {
        let mut warnings = Vec::new();
        let w = SecretsWarning {
            code: WARN_REF_OVERRIDES_PLAINTEXT.to_string(),
            path: "talk.apiKey".to_string(),
            message: "ref overrides plaintext".to_string(),
        };
        push_warning_dedup(&mut warnings, w.clone());
        push_warning_dedup(&mut warnings, w.clone());
        assert_eq!(warnings.len(), 1);

        let mut other = w;
        other.message = "different".to_string();
        push_warning_dedup(&mut warnings, other);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn inactive_sentinel_embedded() {
        let msg = inactive_surface_message("channels.telegram.botToken", "channel disabled");
        assert!(msg.contains(INACTIVE_SURFACE_SENTINEL));
        assert!(msg.starts_with("channels.telegram.botToken"));
        assert!(msg.ends_with("channel disabled"));
    }
}
