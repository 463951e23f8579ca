//! Main-configuration I/O.
//!
//! The config is a JSON document edited by users and by the apply engine. It
//! is always handled as a raw `serde_json::Value` tree so that keys this
//! subsystem does not understand survive a load/modify/save cycle untouched.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// Error from config file operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigIoError {
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

    #[error("config root in {path} must be a JSON object")]
    NotAnObject { path: PathBuf },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load the main config tree. A missing file is an empty object.
pub fn load_config(path: &Path) -> Result<Value, ConfigIoError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        Err(source) => {
            return Err(ConfigIoError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigIoError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if !value.is_object() {
        return Err(ConfigIoError::NotAnObject {
            path: path.to_path_buf(),
        });
    }
    Ok(value)
}

/// Write the main config tree atomically (temp file + rename, mode 0600).
pub fn save_config(path: &Path, config: &Value) -> Result<(), ConfigIoError> {
    let pretty =
        serde_json::to_string_pretty(config).expect("config tree serializes to JSON");
    write_atomic(path, pretty.as_bytes()).map_err(|source| ConfigIoError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomic file replacement used for every on-disk surface the apply engine
/// touches: write to a sibling temp file at mode 0600, then rename over the
/// target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_string()),
        std::process::id()
    ));

    {
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}
