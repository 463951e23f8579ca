//! Secret providers and the batching layer in front of them.
//!
//! A provider resolves a batch of ids to values. The batching layer groups
//! refs by `(source, provider alias)`, enforces the process-wide concurrency
//! cap and per-batch size caps, and caches every ref key so a single
//! activation never resolves the same ref twice.

mod env;
mod exec;
mod file;

pub use env::EnvProvider;
pub use exec::ExecProvider;
pub use file::FileProvider;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use crate::secrets::SecretsError;
use crate::secrets::reference::{SecretRef, SecretSource, is_valid_provider_alias};

/// Default global cap on concurrent provider invocations.
pub const DEFAULT_MAX_PROVIDER_CONCURRENCY: usize = 4;
/// Default cap on refs handed to one provider call.
pub const DEFAULT_MAX_REFS_PER_PROVIDER: usize = 512;
/// Default cap on the serialized request size for one provider call.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 262_144;

/// File provider read mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileProviderMode {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "singleValue")]
    SingleValue,
}

/// Env provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EnvProviderConfig {
    /// When set, only these (uppercase) variable names may be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowlist: Option<Vec<String>>,
}

/// File provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FileProviderConfig {
    /// Absolute path of the secrets file.
    pub path: PathBuf,
    pub mode: FileProviderMode,
    #[serde(default = "default_file_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_file_max_bytes")]
    pub max_bytes: u64,
    /// Require regular file, owned by the effective user, mode 0600 or
    /// stricter.
    #[serde(default = "default_true")]
    pub check_permissions: bool,
}

fn default_file_timeout_ms() -> u64 {
    5_000
}

fn default_file_max_bytes() -> u64 {
    1_048_576
}

/// Exec provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ExecProviderConfig {
    /// Absolute path of the command. Never run through a shell.
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_exec_timeout_ms")]
    pub timeout_ms: u64,
    /// Idle cut-off: the child is killed when it produces no stdout for this
    /// long.
    #[serde(default = "default_exec_no_output_timeout_ms")]
    pub no_output_timeout_ms: u64,
    #[serde(default = "default_exec_max_output_bytes")]
    pub max_output_bytes: u64,
    /// Refuse non-JSON stdout even for single-id batches.
    #[serde(default)]
    pub json_only: bool,
    /// Environment variables passed through from the gateway process.
    #[serde(default)]
    pub pass_env: Vec<String>,
    /// Directories a command may live under.
    #[serde(default)]
    pub trusted_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub allow_insecure_path: bool,
    #[serde(default)]
    pub allow_symlink_command: bool,
    /// Fixed environment appended after `pass_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

fn default_exec_timeout_ms() -> u64 {
    10_000
}

fn default_exec_no_output_timeout_ms() -> u64 {
    5_000
}

fn default_exec_max_output_bytes() -> u64 {
    262_144
}

fn default_true() -> bool {
    true
}

/// A provider definition, tagged by source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ProviderConfig {
    Env(EnvProviderConfig),
    File(FileProviderConfig),
    Exec(ExecProviderConfig),
}

impl ProviderConfig {
    pub fn source(&self) -> SecretSource {
        match self {
            Self::Env(_) => SecretSource::Env,
            Self::File(_) => SecretSource::File,
            Self::Exec(_) => SecretSource::Exec,
        }
    }

    /// Static validation applied at plan ingest and context build.
    pub fn validate(&self, alias: &str) -> Result<(), SecretsError> {
        if !is_valid_provider_alias(alias) {
            return Err(SecretsError::provider_scoped(
                alias,
                "invalid provider alias",
            ));
        }
        match self {
            Self::Env(cfg) => {
                if let Some(allow) = &cfg.allowlist {
                    for name in allow {
                        if !crate::secrets::reference::is_valid_env_id(name) {
                            return Err(SecretsError::provider_scoped(
                                alias,
                                format!("allowlist entry {name:?} is not an uppercase env name"),
                            ));
                        }
                    }
                }
                Ok(())
            }
            Self::File(cfg) => {
                if !cfg.path.is_absolute() {
                    return Err(SecretsError::provider_scoped(
                        alias,
                        format!("file path {} must be absolute", cfg.path.display()),
                    ));
                }
                Ok(())
            }
            Self::Exec(cfg) => {
                if !cfg.command.is_absolute() {
                    return Err(SecretsError::provider_scoped(
                        alias,
                        format!("command {} must be absolute", cfg.command.display()),
                    ));
                }
                for dir in &cfg.trusted_dirs {
                    if !dir.is_absolute() {
                        return Err(SecretsError::provider_scoped(
                            alias,
                            format!("trusted dir {} must be absolute", dir.display()),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Parse `secrets.providers` out of a config tree, validating each entry.
pub fn provider_configs_from(config: &Value) -> Result<BTreeMap<String, ProviderConfig>, SecretsError> {
    let Some(section) = config.get("secrets").and_then(|s| s.get("providers")) else {
        return Ok(BTreeMap::new());
    };
    let Some(obj) = section.as_object() else {
        return Err(SecretsError::ConfigInvalid(
            "secrets.providers must be an object".to_string(),
        ));
    };
    let mut out = BTreeMap::new();
    for (alias, raw) in obj {
        let parsed: ProviderConfig = serde_json::from_value(raw.clone()).map_err(|e| {
            SecretsError::ConfigInvalid(format!("secrets.providers.{alias}: {e}"))
        })?;
        parsed.validate(alias)?;
        out.insert(alias.clone(), parsed);
    }
    Ok(out)
}

/// Tunables for the batching layer, read from `secrets.*` in config.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_provider_concurrency: usize,
    pub max_refs_per_provider: usize,
    pub max_batch_bytes: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_provider_concurrency: DEFAULT_MAX_PROVIDER_CONCURRENCY,
            max_refs_per_provider: DEFAULT_MAX_REFS_PER_PROVIDER,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

impl BatchSettings {
    pub fn from_config(config: &Value) -> Self {
        let section = config.get("secrets");
        let read = |key: &str, fallback: usize| {
            section
                .and_then(|s| s.get(key))
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };
        Self {
            max_provider_concurrency: read(
                "maxProviderConcurrency",
                DEFAULT_MAX_PROVIDER_CONCURRENCY,
            ),
            max_refs_per_provider: read("maxRefsPerProvider", DEFAULT_MAX_REFS_PER_PROVIDER),
            max_batch_bytes: read("maxBatchBytes", DEFAULT_MAX_BATCH_BYTES),
        }
    }
}

/// Result of one provider call.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub values: HashMap<String, Value>,
    /// Per-id failures; ids absent from both maps are reported missing by
    /// the batching layer.
    pub errors: HashMap<String, String>,
}

/// A provider instance bound to its alias.
#[async_trait::async_trait]
pub trait SecretProvider: Send + Sync {
    /// Resolve a batch of ids.
    ///
    /// Provider-scoped misconfiguration returns
    /// [`SecretsError::ProviderScoped`]; other batch-level failures return
    /// other error kinds and trigger the caller's per-ref fallback. Per-id
    /// failures belong in [`BatchOutcome::errors`].
    async fn resolve(&self, ids: &[String]) -> Result<BatchOutcome, SecretsError>;
}

/// How one ref failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefFailure {
    /// The whole provider is unusable; every ref in the batch carries this.
    ProviderScoped(String),
    /// Only this ref failed.
    PerRef(String),
}

impl RefFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::ProviderScoped(m) | Self::PerRef(m) => m,
        }
    }
}

/// Per-activation resolution context: provider instances, caps, and the
/// ref-key cache. Contexts are never shared across activations, so every
/// reload observes fresh provider state.
pub struct ResolveContext {
    providers: HashMap<(SecretSource, String), Arc<dyn SecretProvider>>,
    settings: BatchSettings,
    semaphore: Arc<Semaphore>,
    cache: Mutex<HashMap<String, Result<Value, RefFailure>>>,
}

impl ResolveContext {
    /// Build a context from a config tree. `env_overrides` substitutes the
    /// process environment for env providers (tests and preflight).
    pub fn from_config(
        config: &Value,
        env_overrides: Option<HashMap<String, String>>,
    ) -> Result<Self, SecretsError> {
        let configs = provider_configs_from(config)?;
        let settings = BatchSettings::from_config(config);
        let mut providers: HashMap<(SecretSource, String), Arc<dyn SecretProvider>> =
            HashMap::new();
        for (alias, cfg) in configs {
            let source = cfg.source();
            let provider: Arc<dyn SecretProvider> = match cfg {
                ProviderConfig::Env(env_cfg) => Arc::new(EnvProvider::new(
                    alias.clone(),
                    env_cfg,
                    env_overrides.clone(),
                )),
                ProviderConfig::File(file_cfg) => {
                    Arc::new(FileProvider::new(alias.clone(), file_cfg))
                }
                ProviderConfig::Exec(exec_cfg) => {
                    Arc::new(ExecProvider::new(alias.clone(), exec_cfg))
                }
            };
            providers.insert((source, alias), provider);
        }
        let semaphore = Arc::new(Semaphore::new(settings.max_provider_concurrency));
        Ok(Self {
            providers,
            settings,
            semaphore,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a set of refs, grouped per provider, respecting the caps.
    /// Returns an outcome for every distinct ref key in the input.
    pub async fn resolve_refs(
        &self,
        refs: &[SecretRef],
    ) -> HashMap<String, Result<Value, RefFailure>> {
        let mut results: HashMap<String, Result<Value, RefFailure>> = HashMap::new();

        // Serve cached keys and group the rest by (source, provider).
        let mut groups: HashMap<(SecretSource, String), Vec<SecretRef>> = HashMap::new();
        {
            let cache = self.cache.lock().await;
            for r in refs {
                let key = r.ref_key();
                if results.contains_key(&key) {
                    continue;
                }
                if let Some(hit) = cache.get(&key) {
                    results.insert(key, hit.clone());
                    continue;
                }
                let group = groups
                    .entry((r.source, r.provider.clone()))
                    .or_default();
                if !group.iter().any(|g| g.id == r.id) {
                    group.push(r.clone());
                }
            }
        }

        let mut tasks = Vec::new();
        for ((source, alias), group) in groups {
            let semaphore = Arc::clone(&self.semaphore);
            let provider = self.providers.get(&(source, alias.clone())).cloned();
            let settings = self.settings.clone();
            tasks.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("provider semaphore is never closed");
                resolve_group(source, alias, provider, group, &settings).await
            });
        }

        let outcomes = futures::future::join_all(tasks).await;
        let mut cache = self.cache.lock().await;
        for group_results in outcomes {
            for (key, outcome) in group_results {
                cache.insert(key.clone(), outcome.clone());
                results.insert(key, outcome);
            }
        }
        results
    }
}

async fn resolve_group(
    source: SecretSource,
    alias: String,
    provider: Option<Arc<dyn SecretProvider>>,
    group: Vec<SecretRef>,
    settings: &BatchSettings,
) -> Vec<(String, Result<Value, RefFailure>)> {
    let mut out = Vec::new();

    let Some(provider) = provider else {
        let msg = format!("secret provider {source}:{alias} is not configured");
        for r in &group {
            out.push((r.ref_key(), Err(RefFailure::ProviderScoped(msg.clone()))));
        }
        return out;
    };

    for chunk in chunk_refs(&group, settings) {
        let ids: Vec<String> = chunk.iter().map(|r| r.id.clone()).collect();
        match provider.resolve(&ids).await {
            Ok(outcome) => collect_outcome(&mut out, chunk, outcome),
            Err(e) if e.is_provider_scoped() => {
                let msg = e.to_string();
                for r in chunk {
                    out.push((r.ref_key(), Err(RefFailure::ProviderScoped(msg.clone()))));
                }
            }
            Err(batch_err) => {
                // Batch-level but not provider-scoped: fall back to
                // resolving each ref alone, sequentially.
                tracing::debug!(
                    provider = %alias,
                    error = %batch_err,
                    "batch resolution failed, retrying per ref"
                );
                for r in chunk {
                    let single = [r.id.clone()];
                    match provider.resolve(&single).await {
                        Ok(outcome) => collect_outcome(&mut out, &[r.clone()], outcome),
                        Err(e) => {
                            out.push((r.ref_key(), Err(RefFailure::PerRef(e.to_string()))));
                        }
                    }
                }
            }
        }
    }
    out
}

fn collect_outcome(
    out: &mut Vec<(String, Result<Value, RefFailure>)>,
    refs: &[SecretRef],
    mut outcome: BatchOutcome,
) {
    for r in refs {
        let key = r.ref_key();
        if let Some(value) = outcome.values.remove(&r.id) {
            out.push((key, Ok(value)));
        } else if let Some(err) = outcome.errors.remove(&r.id) {
            out.push((key, Err(RefFailure::PerRef(err))));
        } else {
            out.push((
                key,
                Err(RefFailure::PerRef(format!(
                    "provider returned no value for id {:?}",
                    r.id
                ))),
            ));
        }
    }
}

/// Split a group into chunks that respect both size caps. A single ref whose
/// serialized request alone exceeds the byte cap still goes out as its own
/// chunk; the provider enforces its own limits from there.
fn chunk_refs<'a>(group: &'a [SecretRef], settings: &BatchSettings) -> Vec<&'a [SecretRef]> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut bytes = 0usize;
    for (i, r) in group.iter().enumerate() {
        let cost = r.id.len() + 16;
        let len = i - start;
        if len > 0 && (len >= settings.max_refs_per_provider || bytes + cost > settings.max_batch_bytes)
        {
            chunks.push(&group[start..i]);
            start = i;
            bytes = 0;
        }
        bytes += cost;
    }
    if start < group.len() {
        chunks.push(&group[start..]);
    }
    chunks
}
