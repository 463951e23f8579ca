//! File provider: resolves ids out of a single secrets file.
//!
//! In `json` mode the file is a JSON object and ids are absolute RFC-6901
//! pointers into it. In `singleValue` mode the file *is* the secret and the
//! only accepted id is the literal `"value"`.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::secrets::SecretsError;
use crate::secrets::providers::{
    BatchOutcome, FileProviderConfig, FileProviderMode, SecretProvider,
};

pub struct FileProvider {
    alias: String,
    config: FileProviderConfig,
}

impl FileProvider {
    pub fn new(alias: String, config: FileProviderConfig) -> Self {
        Self { alias, config }
    }

    fn scoped(&self, message: impl Into<String>) -> SecretsError {
        SecretsError::provider_scoped(&self.alias, message)
    }

    async fn read_contents(&self) -> Result<String, SecretsError> {
        let path = &self.config.path;
        if !path.is_absolute() {
            return Err(self.scoped(format!("file path {} must be absolute", path.display())));
        }

        let metadata = std::fs::metadata(path)
            .map_err(|e| self.scoped(format!("cannot stat {}: {e}", path.display())))?;
        if !metadata.is_file() {
            return Err(self.scoped(format!("{} is not a regular file", path.display())));
        }
        if metadata.len() > self.config.max_bytes {
            return Err(self.scoped(format!(
                "{} is {} bytes, over the {}-byte cap",
                path.display(),
                metadata.len(),
                self.config.max_bytes
            )));
        }
        if self.config.check_permissions {
            check_owner_and_mode(path, &metadata).map_err(|m| self.scoped(m))?;
        }

        let read = tokio::fs::read_to_string(path.clone());
        match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), read).await {
            Ok(Ok(contents)) => Ok(contents),
            Ok(Err(e)) => Err(self.scoped(format!("cannot read {}: {e}", path.display()))),
            Err(_) => Err(self.scoped(format!(
                "reading {} exceeded {}ms",
                path.display(),
                self.config.timeout_ms
            ))),
        }
    }
}

#[cfg(unix)]
fn check_owner_and_mode(path: &Path, metadata: &std::fs::Metadata) -> Result<(), String> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    let euid = unsafe { libc::geteuid() };
    if metadata.uid() != euid {
        return Err(format!(
            "{} is owned by uid {}, not the effective user {}",
            path.display(),
            metadata.uid(),
            euid
        ));
    }
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(format!(
            "{} permissions {:o} are too broad; require 0600 or stricter",
            path.display(),
            mode & 0o777
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_and_mode(_path: &Path, _metadata: &std::fs::Metadata) -> Result<(), String> {
    Ok(())
}

#[async_trait::async_trait]
impl SecretProvider for FileProvider {
    async fn resolve(&self, ids: &[String]) -> Result<BatchOutcome, SecretsError> {
        let contents = self.read_contents().await?;
        let mut outcome = BatchOutcome::default();

        match self.config.mode {
            FileProviderMode::Json => {
                let root: Value = serde_json::from_str(&contents).map_err(|e| {
                    self.scoped(format!(
                        "{} does not parse as JSON: {e}",
                        self.config.path.display()
                    ))
                })?;
                if !root.is_object() {
                    return Err(self.scoped(format!(
                        "{} must hold a JSON object at the root, not {}",
                        self.config.path.display(),
                        json_kind(&root)
                    )));
                }
                for id in ids {
                    match root.pointer(id) {
                        Some(value) => {
                            outcome.values.insert(id.clone(), value.clone());
                        }
                        None => {
                            outcome.errors.insert(
                                id.clone(),
                                format!("pointer {id} not found in {}", self.config.path.display()),
                            );
                        }
                    }
                }
            }
            FileProviderMode::SingleValue => {
                let value = Value::String(contents.trim().to_string());
                for id in ids {
                    if id == "value" {
                        outcome.values.insert(id.clone(), value.clone());
                    } else {
                        outcome.errors.insert(
                            id.clone(),
                            format!("singleValue provider only serves id \"value\", got {id:?}"),
                        );
                    }
                }
            }
        }
        Ok(outcome)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_secret_file(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        path
    }

    fn provider(path: std::path::PathBuf, mode: FileProviderMode) -> FileProvider {
        FileProvider::new(
            "default".to_string(),
            FileProviderConfig {
                path,
                mode,
                timeout_ms: 2_000,
                max_bytes: 4_096,
                check_permissions: true,
            },
        )
    }

    #[tokio::test]
    async fn json_mode_resolves_pointers() {
        let dir = TempDir::new().unwrap();
        let path = write_secret_file(
            &dir,
            "secrets.json",
            r#"{"providers": {"openai": {"apiKey": "sk-file"}}}"#,
        );
        let p = provider(path, FileProviderMode::Json);
        let out = p
            .resolve(&[
                "/providers/openai/apiKey".to_string(),
                "/providers/missing".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(
            out.values["/providers/openai/apiKey"],
            serde_json::json!("sk-file")
        );
        assert!(out.errors["/providers/missing"].contains("not found"));
    }

    #[tokio::test]
    async fn json_mode_rejects_array_root() {
        let dir = TempDir::new().unwrap();
        let path = write_secret_file(&dir, "secrets.json", "[1,2]");
        let p = provider(path, FileProviderMode::Json);
        let err = p.resolve(&["/0".to_string()]).await.unwrap_err();
        assert!(err.is_provider_scoped());
        assert!(err.to_string().contains("an array"));
    }

    #[tokio::test]
    async fn single_value_mode() {
        let dir = TempDir::new().unwrap();
        let path = write_secret_file(&dir, "token", "sk-whole-file\n");
        let p = provider(path, FileProviderMode::SingleValue);
        let out = p
            .resolve(&["value".to_string(), "other".to_string()])
            .await
            .unwrap();
        assert_eq!(out.values["value"], serde_json::json!("sk-whole-file"));
        assert!(out.errors["other"].contains("only serves"));
    }

    #[tokio::test]
    async fn missing_file_is_provider_scoped() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path().join("absent.json"), FileProviderMode::Json);
        let err = p.resolve(&["/k".to_string()]).await.unwrap_err();
        assert!(err.is_provider_scoped());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn broad_permissions_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = write_secret_file(&dir, "secrets.json", "{}");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let p = provider(path, FileProviderMode::Json);
        let err = p.resolve(&["/k".to_string()]).await.unwrap_err();
        assert!(err.is_provider_scoped());
        assert!(err.to_string().contains("too broad"));
    }

    #[tokio::test]
    async fn oversized_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_secret_file(&dir, "big.json", &"x".repeat(5000));
        let p = provider(path, FileProviderMode::Json);
        let err = p.resolve(&["/k".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("byte cap"));
    }
}
