//! The active snapshot and its activator.
//!
//! One snapshot exists per process. Activation installs a freshly-prepared
//! snapshot with a single pointer swap; readers always receive a defensive
//! clone and can hold it for as long as they like. A failed reload keeps the
//! last-known-good snapshot and moves the activator to `Degraded`, emitting
//! a one-shot event; the first successful reload afterwards emits the
//! matching `Recovered` event.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::secrets::auth_profiles::AgentRef;
use crate::secrets::path::get_path;
use crate::secrets::reference::{is_ref_shaped, resolve_secret_input_ref};
use crate::secrets::registry::registry;
use crate::secrets::surfaces::{SurfaceActivity, surface_activity};
use crate::secrets::{
    SecretsDefaults, SecretsError, SecretsWarning, inactive_surface_message,
};

/// One agent's resolved auth-profile store inside a snapshot.
#[derive(Debug, Clone)]
pub struct AgentStore {
    pub agent: AgentRef,
    pub tree: Value,
}

/// The runtime view installed by a successful activation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The config as authored (refs intact).
    pub source_config: Value,
    /// The config with every active ref replaced by its resolved value.
    pub resolved_config: Value,
    pub auth_stores: Vec<AgentStore>,
    pub warnings: Vec<SecretsWarning>,
}

/// Activator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloaderState {
    Uninitialized,
    Preparing,
    Ready,
    Degraded,
    FatalStartupFailure,
}

impl ReloaderState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::FatalStartupFailure => "fatal_startup_failure",
        }
    }
}

/// One-shot lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    Degraded { error: String },
    Recovered,
}

pub type ReloadObserver = Box<dyn Fn(&ReloadEvent) + Send + Sync>;

struct ActivatorInner {
    state: ReloaderState,
    snapshot: Option<Arc<Snapshot>>,
}

/// Owns the current snapshot and the reload state machine.
pub struct SnapshotActivator {
    inner: RwLock<ActivatorInner>,
    observer: Mutex<Option<ReloadObserver>>,
}

impl Default for SnapshotActivator {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotActivator {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ActivatorInner {
                state: ReloaderState::Uninitialized,
                snapshot: None,
            }),
            observer: Mutex::new(None),
        }
    }

    /// Install the observer for degraded/recovered events.
    pub fn set_observer(&self, observer: ReloadObserver) {
        *self.observer.lock().expect("observer lock") = Some(observer);
    }

    fn emit(&self, event: ReloadEvent) {
        if let Some(observer) = self.observer.lock().expect("observer lock").as_ref() {
            observer(&event);
        }
    }

    pub fn state(&self) -> ReloaderState {
        self.inner.read().expect("activator lock").state
    }

    /// Whether a snapshot (current or last-known-good) is installed.
    pub fn has_snapshot(&self) -> bool {
        self.inner.read().expect("activator lock").snapshot.is_some()
    }

    /// A defensive clone of the active snapshot.
    pub fn current(&self) -> Option<Snapshot> {
        self.inner
            .read()
            .expect("activator lock")
            .snapshot
            .as_ref()
            .map(|s| (**s).clone())
    }

    pub fn note_prepare_started(&self) {
        let mut inner = self.inner.write().expect("activator lock");
        if inner.state != ReloaderState::FatalStartupFailure {
            inner.state = ReloaderState::Preparing;
        }
    }

    /// Install a prepared snapshot atomically and move to `Ready`.
    pub fn activate(&self, snapshot: Snapshot) {
        let was_degraded;
        {
            let mut inner = self.inner.write().expect("activator lock");
            was_degraded = inner.state == ReloaderState::Degraded;
            inner.snapshot = Some(Arc::new(snapshot));
            inner.state = ReloaderState::Ready;
        }
        if was_degraded {
            tracing::info!("secrets reload recovered, fresh snapshot active");
            self.emit(ReloadEvent::Recovered);
        }
    }

    /// Record a failed preparation. Returns the state the activator landed
    /// in; `FatalStartupFailure` means the process must abort.
    pub fn note_prepare_failed(&self, startup: bool, error_text: &str) -> ReloaderState {
        let mut inner = self.inner.write().expect("activator lock");
        let had_snapshot = inner.snapshot.is_some();
        let prior = inner.state;

        let next = if startup {
            ReloaderState::FatalStartupFailure
        } else if had_snapshot {
            ReloaderState::Degraded
        } else {
            // Reload before any successful activation: treated like a
            // startup failure, but the process keeps running and may retry.
            ReloaderState::Uninitialized
        };
        inner.state = next;
        drop(inner);

        match next {
            ReloaderState::Degraded if prior != ReloaderState::Degraded => {
                tracing::warn!(error = %error_text, "secrets reload failed, serving last-known-good snapshot");
                self.emit(ReloadEvent::Degraded {
                    error: error_text.to_string(),
                });
            }
            ReloaderState::Degraded => {
                tracing::warn!(error = %error_text, "secrets reload failed again, still degraded");
            }
            _ => {}
        }
        next
    }

    /// Resolve the already-activated values behind the given target ids for
    /// a command invocation. Unresolved refs on active surfaces are fatal
    /// unless the caller marked the path inactive.
    pub fn resolve_command_secrets(
        &self,
        command_name: &str,
        target_ids: &[String],
        known_inactive_paths: &HashSet<String>,
    ) -> Result<CommandSecrets, SecretsError> {
        let snapshot = self
            .inner
            .read()
            .expect("activator lock")
            .snapshot
            .clone()
            .ok_or_else(|| {
                SecretsError::ConfigInvalid("no active secrets snapshot".to_string())
            })?;

        resolve_command_secrets_in(&snapshot, command_name, target_ids, known_inactive_paths)
    }
}

/// An already-resolved value to write at a path in the caller's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSecretAssignment {
    pub path: String,
    #[serde(rename = "pathSegments")]
    pub path_segments: Vec<String>,
    pub value: Value,
}

/// Result of a command-secret lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSecrets {
    pub assignments: Vec<CommandSecretAssignment>,
    pub diagnostics: Vec<String>,
}

/// Walk the snapshot's configured refs for the requested ids and read their
/// resolved values. Shared by the activator and the gateway client's local
/// cross-check.
pub fn resolve_command_secrets_in(
    snapshot: &Snapshot,
    command_name: &str,
    target_ids: &[String],
    known_inactive_paths: &HashSet<String>,
) -> Result<CommandSecrets, SecretsError> {
    let ids: Vec<&str> = target_ids.iter().map(String::as_str).collect();
    let defaults = SecretsDefaults::from_config(&snapshot.source_config);
    let found =
        registry().discover_config_secret_targets(&snapshot.source_config, Some(ids.as_slice()));

    let mut out = CommandSecrets::default();
    for target in found {
        let resolved_input = resolve_secret_input_ref(
            target.value.as_ref(),
            target.ref_value.as_ref(),
            &defaults,
        );
        if resolved_input.secret_ref.is_none() {
            continue;
        }

        let resolved_value = get_path(&snapshot.resolved_config, &target.path_segments);
        let usable = resolved_value
            .is_some_and(|v| target.entry.expected.accepts(v) && !is_ref_shaped(v));
        if usable {
            out.assignments.push(CommandSecretAssignment {
                path: target.path.clone(),
                path_segments: target.path_segments.clone(),
                value: resolved_value.cloned().expect("checked above"),
            });
            continue;
        }

        match surface_activity(&target, &snapshot.source_config) {
            SurfaceActivity::Inactive(reason) => {
                out.diagnostics
                    .push(inactive_surface_message(&target.path, &reason));
            }
            SurfaceActivity::Active if known_inactive_paths.contains(&target.path) => {
                out.diagnostics
                    .push(inactive_surface_message(&target.path, "reported by gateway"));
            }
            SurfaceActivity::Active => {
                return Err(SecretsError::ref_resolution(
                    target.path.clone(),
                    format!(
                        "command {command_name:?} needs the secret at {}, which is not resolved in the active snapshot",
                        target.path
                    ),
                ));
            }
        }
    }
    Ok(out)
}
