//! Error taxonomy for the secrets subsystem.
//!
//! The distinction that matters operationally is provider-scoped vs per-ref:
//! a provider-scoped failure (missing file, rejected command) fails every ref
//! in the batch at once, while a per-ref failure (absent env var, missing
//! pointer) fails only that ref. The audit engine relies on the
//! discriminator to avoid pointless per-ref retries.

use std::path::PathBuf;

use crate::config::ConfigIoError;
use crate::secrets::path::PathError;
use crate::secrets::reference::RefShapeError;

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    /// Source config fails referential rules before any resolution.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// A ref literal fails shape validation.
    #[error(transparent)]
    RefShape(#[from] RefShapeError),

    /// Provider misconfiguration that fails the whole batch.
    #[error("provider {provider}: {message}")]
    ProviderScoped { provider: String, message: String },

    /// Single-ref failure (env var missing, pointer missing, exec per-id
    /// error, timeout).
    #[error("failed to resolve {ref_key}: {message}")]
    RefResolution { ref_key: String, message: String },

    /// An exec child failed as a whole (timeout, output cap, bad protocol,
    /// non-zero exit). Not provider-scoped: the batching layer retries the
    /// refs one at a time and records per-ref errors.
    #[error("exec provider {provider}: {message}")]
    ExecFailed { provider: String, message: String },

    /// Provider returned something other than the declared resolved shape.
    /// Always fatal to the activation.
    #[error("secret at {path} resolved to the wrong shape: {message}")]
    ShapeMismatch { path: String, message: String },

    /// Plan failed strict validation; apply refuses before any write.
    #[error("plan invalid: {0}")]
    PlanInvalid(String),

    /// A commit write failed. Files already written were restored
    /// best-effort before this surfaced.
    #[error("apply failed writing {path}: {source}")]
    ApplyIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    ConfigIo(#[from] ConfigIoError),
}

impl SecretsError {
    /// True for errors that fail every ref handed to the provider at once.
    pub fn is_provider_scoped(&self) -> bool {
        matches!(self, Self::ProviderScoped { .. })
    }

    pub fn provider_scoped(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderScoped {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn ref_resolution(ref_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RefResolution {
            ref_key: ref_key.into(),
            message: message.into(),
        }
    }

    pub fn exec_failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
