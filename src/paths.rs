//! Filesystem layout: config dir, state dir, per-agent directories.
//!
//! Everything lives under ~/.polyclaw by default. `POLYCLAW_CONFIG_DIR` and
//! `POLYCLAW_STATE_DIR` override the defaults (tests point them at temp dirs).

use std::path::{Path, PathBuf};

/// Resolved filesystem roots for the gateway.
#[derive(Debug, Clone)]
pub struct Paths {
    config_dir: PathBuf,
    state_dir: PathBuf,
}

impl Paths {
    /// Resolve from the environment, falling back to ~/.polyclaw.
    pub fn resolve() -> Self {
        let config_dir = std::env::var_os("POLYCLAW_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_config_dir);
        let state_dir = std::env::var_os("POLYCLAW_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.clone());
        Self {
            config_dir,
            state_dir,
        }
    }

    /// Root both dirs at a fixed base (tests).
    pub fn with_base(base: &Path) -> Self {
        Self {
            config_dir: base.to_path_buf(),
            state_dir: base.to_path_buf(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Main configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// The .env file the gateway loads at startup.
    pub fn env_file(&self) -> PathBuf {
        self.config_dir.join(".env")
    }

    /// Default directory for an agent that does not configure one.
    pub fn default_agent_dir(&self, agent_id: &str) -> PathBuf {
        self.state_dir
            .join("agents")
            .join(agent_id)
            .join("agent")
    }

    /// Auth-profile store inside an agent directory.
    pub fn auth_profiles_file(agent_dir: &Path) -> PathBuf {
        agent_dir.join("auth-profiles.json")
    }

    /// Legacy static auth store inside an agent directory.
    pub fn legacy_auth_file(agent_dir: &Path) -> PathBuf {
        agent_dir.join("auth.json")
    }
}

fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".polyclaw")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_base_roots_everything() {
        let paths = Paths::with_base(Path::new("/tmp/x"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/x/config.json"));
        assert_eq!(paths.env_file(), PathBuf::from("/tmp/x/.env"));
        assert_eq!(
            paths.default_agent_dir("main"),
            PathBuf::from("/tmp/x/agents/main/agent")
        );
    }

    #[test]
    fn agent_store_files() {
        let dir = Path::new("/srv/agents/main/agent");
        assert_eq!(
            Paths::auth_profiles_file(dir),
            PathBuf::from("/srv/agents/main/agent/auth-profiles.json")
        );
        assert_eq!(
            Paths::legacy_auth_file(dir),
            PathBuf::from("/srv/agents/main/agent/auth.json")
        );
    }
}
