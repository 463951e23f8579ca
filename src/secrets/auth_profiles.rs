//! Per-agent auth-profile stores.
//!
//! Each agent directory holds an `auth-profiles.json`:
//! `{version: 1, profiles: {<id>: {type, provider, key|keyRef|token|tokenRef, ...}}}`
//! plus optional `order` / `lastGood` / `usageStats` metadata. The store is
//! kept as a raw tree so metadata and unknown profile fields survive every
//! load/modify/save cycle. Writes are atomic at mode 0600.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};

use crate::config::write_atomic;
use crate::paths::Paths;

/// Error from auth-profile store operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthProfileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("auth-profile store root in {path} must be a JSON object")]
    NotAnObject { path: PathBuf },

    #[error("unsupported auth-profile store version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u64 },

    #[error("invalid profile id {0:?}")]
    InvalidProfileId(String),

    #[error("profile {id} already exists with type {existing}, refusing to change it to {wanted}")]
    TypeMismatch {
        id: String,
        existing: String,
        wanted: String,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Profile id: `^[A-Za-z0-9:_\-]{1,128}$`.
pub fn is_valid_profile_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() > 128 {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(*b, b':' | b'_' | b'-'))
}

/// One agent's auth-profile store, bound to its directory.
#[derive(Debug, Clone)]
pub struct AuthProfileStore {
    agent_dir: PathBuf,
    tree: Value,
}

impl AuthProfileStore {
    /// Load the store from an agent directory. A missing file yields an
    /// empty version-1 store.
    pub fn load(agent_dir: &Path) -> Result<Self, AuthProfileError> {
        let path = Paths::auth_profiles_file(agent_dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty(agent_dir));
            }
            Err(source) => return Err(AuthProfileError::Read { path, source }),
        };
        let tree: Value = serde_json::from_str(&raw)
            .map_err(|source| AuthProfileError::Parse {
                path: path.clone(),
                source,
            })?;
        if !tree.is_object() {
            return Err(AuthProfileError::NotAnObject { path });
        }
        let version = tree.get("version").and_then(Value::as_u64).unwrap_or(1);
        if version != 1 {
            return Err(AuthProfileError::UnsupportedVersion { path, version });
        }
        Ok(Self {
            agent_dir: agent_dir.to_path_buf(),
            tree,
        })
    }

    /// An empty store for an agent directory.
    pub fn empty(agent_dir: &Path) -> Self {
        Self {
            agent_dir: agent_dir.to_path_buf(),
            tree: json!({"version": 1, "profiles": {}}),
        }
    }

    /// Build a store around an existing tree (preflight overrides).
    pub fn from_tree(agent_dir: &Path, tree: Value) -> Self {
        Self {
            agent_dir: agent_dir.to_path_buf(),
            tree,
        }
    }

    pub fn agent_dir(&self) -> &Path {
        &self.agent_dir
    }

    pub fn file_path(&self) -> PathBuf {
        Paths::auth_profiles_file(&self.agent_dir)
    }

    pub fn tree(&self) -> &Value {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Value {
        &mut self.tree
    }

    pub fn profiles(&self) -> Option<&Map<String, Value>> {
        self.tree.get("profiles").and_then(Value::as_object)
    }

    pub fn profile(&self, id: &str) -> Option<&Value> {
        self.profiles().and_then(|p| p.get(id))
    }

    /// True when the store has no profiles and no metadata worth writing.
    pub fn is_empty(&self) -> bool {
        self.profiles().is_none_or(Map::is_empty)
    }

    /// Ensure a profile object exists with the expected `type` and
    /// `provider`. Refuses to repurpose an existing profile of a different
    /// type.
    pub fn ensure_profile(
        &mut self,
        id: &str,
        profile_type: &str,
        provider: &str,
    ) -> Result<(), AuthProfileError> {
        if !is_valid_profile_id(id) {
            return Err(AuthProfileError::InvalidProfileId(id.to_string()));
        }
        let root = self
            .tree
            .as_object_mut()
            .expect("store tree root is an object");
        if !root.contains_key("version") {
            root.insert("version".to_string(), json!(1));
        }
        let profiles_val = root.entry("profiles").or_insert_with(|| json!({}));
        if !profiles_val.is_object() {
            *profiles_val = json!({});
        }
        let profiles = profiles_val
            .as_object_mut()
            .expect("profiles ensured to be an object");

        match profiles.get_mut(id) {
            Some(existing) => {
                let existing_type = existing
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if existing_type != profile_type {
                    return Err(AuthProfileError::TypeMismatch {
                        id: id.to_string(),
                        existing: existing_type,
                        wanted: profile_type.to_string(),
                    });
                }
                if let Some(obj) = existing.as_object_mut() {
                    obj.entry("provider")
                        .or_insert_with(|| json!(provider));
                }
            }
            None => {
                profiles.insert(
                    id.to_string(),
                    json!({"type": profile_type, "provider": provider}),
                );
            }
        }
        Ok(())
    }

    /// Render the store as pretty JSON (the on-disk format).
    pub fn render(&self) -> String {
        serde_json::to_string_pretty(&self.tree).expect("store tree serializes")
    }

    /// Persist atomically at mode 0600.
    pub fn save(&self) -> Result<(), AuthProfileError> {
        let path = self.file_path();
        write_atomic(&path, self.render().as_bytes())
            .map_err(|source| AuthProfileError::Write { path, source })
    }
}

/// An agent named in configuration, with its resolved directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub id: String,
    pub dir: PathBuf,
}

/// Enumerate the agents the config declares, resolving each directory
/// (configured `dir`, else `<stateDir>/agents/<id>/agent`). A config with no
/// agent list has the single implicit agent `main`.
pub fn agent_refs(config: &Value, paths: &Paths) -> Vec<AgentRef> {
    let list = config
        .get("agents")
        .and_then(|a| a.get("list"))
        .and_then(Value::as_array);

    let mut agents = Vec::new();
    match list {
        Some(entries) if !entries.is_empty() => {
            for entry in entries {
                let Some(id) = entry.get("id").and_then(Value::as_str) else {
                    continue;
                };
                let dir = entry
                    .get("dir")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| paths.default_agent_dir(id));
                agents.push(AgentRef {
                    id: id.to_string(),
                    dir,
                });
            }
        }
        _ => {
            agents.push(AgentRef {
                id: "main".to_string(),
                dir: paths.default_agent_dir("main"),
            });
        }
    }
    agents
}

/// Resolve one agent's directory by id.
pub fn agent_dir_for(config: &Value, paths: &Paths, agent_id: &str) -> PathBuf {
    agent_refs(config, paths)
        .into_iter()
        .find(|a| a.id == agent_id)
        .map(|a| a.dir)
        .unwrap_or_else(|| paths.default_agent_dir(agent_id))
}

/// Load the legacy static auth store (`auth.json`) from an agent directory.
/// Returns `None` when absent or unreadable; the legacy store is read-only.
pub fn load_legacy_auth(agent_dir: &Path) -> Option<Value> {
    let path = Paths::legacy_auth_file(agent_dir);
    let raw = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn profile_id_shapes() {
        assert!(is_valid_profile_id("openai:default"));
        assert!(is_valid_profile_id("a_b-c"));
        assert!(!is_valid_profile_id(""));
        assert!(!is_valid_profile_id("has space"));
        assert!(!is_valid_profile_id(&"x".repeat(129)));
    }

    #[test]
    fn load_missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = AuthProfileStore::load(dir.path()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.tree()["version"], 1);
    }

    #[test]
    fn round_trip_preserves_metadata() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            Paths::auth_profiles_file(dir.path()),
            serde_json::to_string(&serde_json::json!({
                "version": 1,
                "profiles": {"openai:default": {"type": "api_key", "provider": "openai", "key": "sk"}},
                "order": ["openai:default"],
                "usageStats": {"openai:default": {"calls": 12}}
            }))
            .unwrap(),
        )
        .unwrap();

        let store = AuthProfileStore::load(dir.path()).unwrap();
        store.save().unwrap();
        let reloaded = AuthProfileStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.tree()["order"], serde_json::json!(["openai:default"]));
        assert_eq!(
            reloaded.tree()["usageStats"]["openai:default"]["calls"],
            serde_json::json!(12)
        );
    }

    #[test]
    fn ensure_profile_creates_and_guards_type() {
        let dir = TempDir::new().unwrap();
        let mut store = AuthProfileStore::load(dir.path()).unwrap();
        store.ensure_profile("openai:default", "api_key", "openai").unwrap();
        assert_eq!(
            store.profile("openai:default").unwrap()["provider"],
            serde_json::json!("openai")
        );

        let err = store
            .ensure_profile("openai:default", "token", "openai")
            .unwrap_err();
        assert!(matches!(err, AuthProfileError::TypeMismatch { .. }));
    }

    #[test]
    fn unsupported_version_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            Paths::auth_profiles_file(dir.path()),
            r#"{"version": 9, "profiles": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            AuthProfileStore::load(dir.path()),
            Err(AuthProfileError::UnsupportedVersion { version: 9, .. })
        ));
    }

    #[test]
    fn agent_refs_default_and_configured() {
        let paths = Paths::with_base(Path::new("/base"));
        let agents = agent_refs(&serde_json::json!({}), &paths);
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "main");
        assert_eq!(agents[0].dir, PathBuf::from("/base/agents/main/agent"));

        let config = serde_json::json!({"agents": {"list": [
            {"id": "main"},
            {"id": "research", "dir": "/custom/research"}
        ]}});
        let agents = agent_refs(&config, &paths);
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[1].dir, PathBuf::from("/custom/research"));
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let mut store = AuthProfileStore::load(dir.path()).unwrap();
        store.ensure_profile("p", "api_key", "openai").unwrap();
        store.save().unwrap();
        let mode = std::fs::metadata(store.file_path())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }
}
