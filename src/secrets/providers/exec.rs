//! Exec provider: resolves ids through an untrusted helper subprocess.
//!
//! The child is spawned directly (never via a shell) with a scrubbed
//! environment. Request and response are newline-terminated JSON on
//! stdin/stdout:
//!
//! ```text
//! request  = {"protocolVersion":1,"provider":"<alias>","ids":["<id>",...]}
//! response = {"protocolVersion":1,"values":{"<id>":<value>,...},
//!             "errors":{"<id>":{"message":"..."},...}}
//! ```
//!
//! Three guards bound the child: a total wall-clock timeout, an idle
//! (no-output) timeout, and a stdout byte cap. Violating any of them kills
//! the child and fails the batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Instant;

use crate::secrets::SecretsError;
use crate::secrets::providers::{BatchOutcome, ExecProviderConfig, SecretProvider};

pub const EXEC_PROTOCOL_VERSION: u64 = 1;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecRequest<'a> {
    protocol_version: u64,
    provider: &'a str,
    ids: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    protocol_version: u64,
    #[serde(default)]
    values: HashMap<String, Value>,
    #[serde(default)]
    errors: HashMap<String, ExecIdError>,
}

#[derive(Deserialize)]
struct ExecIdError {
    message: String,
}

pub struct ExecProvider {
    alias: String,
    config: ExecProviderConfig,
}

impl ExecProvider {
    pub fn new(alias: String, config: ExecProviderConfig) -> Self {
        Self { alias, config }
    }

    fn scoped(&self, message: impl Into<String>) -> SecretsError {
        SecretsError::provider_scoped(&self.alias, message)
    }

    fn failed(&self, message: impl Into<String>) -> SecretsError {
        SecretsError::exec_failed(&self.alias, message)
    }

    /// Validate the command per the untrusted-subprocess contract:
    /// absolute path, regular file (through at most one symlink when
    /// allowed), and containment in a trusted directory unless explicitly
    /// waived.
    fn validate_command(&self) -> Result<PathBuf, SecretsError> {
        let command = &self.config.command;
        if !command.is_absolute() {
            return Err(self.scoped(format!(
                "command {} must be an absolute path",
                command.display()
            )));
        }
        let metadata = std::fs::symlink_metadata(command)
            .map_err(|e| self.scoped(format!("cannot stat {}: {e}", command.display())))?;

        let resolved = if metadata.file_type().is_symlink() {
            if !self.config.allow_symlink_command {
                return Err(self.scoped(format!(
                    "command {} is a symlink and allowSymlinkCommand is off",
                    command.display()
                )));
            }
            let real = std::fs::canonicalize(command).map_err(|e| {
                self.scoped(format!("cannot resolve symlink {}: {e}", command.display()))
            })?;
            let real_meta = std::fs::metadata(&real)
                .map_err(|e| self.scoped(format!("cannot stat {}: {e}", real.display())))?;
            if !real_meta.is_file() {
                return Err(self.scoped(format!(
                    "{} resolves to {}, which is not a regular file",
                    command.display(),
                    real.display()
                )));
            }
            real
        } else {
            if !metadata.is_file() {
                return Err(
                    self.scoped(format!("{} is not a regular file", command.display()))
                );
            }
            command.clone()
        };

        if !self.config.allow_insecure_path {
            let dir = resolved
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let trusted = self
                .config
                .trusted_dirs
                .iter()
                .any(|t| dir.starts_with(t));
            if !trusted {
                return Err(self.scoped(format!(
                    "command dir {} is not under any trusted dir",
                    dir.display()
                )));
            }
        }
        Ok(command.clone())
    }

    async fn run_child(&self, ids: &[String]) -> Result<Vec<u8>, SecretsError> {
        let command = self.validate_command()?;

        let mut cmd = Command::new(&command);
        cmd.args(&self.config.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in &self.config.pass_env {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        if let Some(fixed) = &self.config.env {
            cmd.envs(fixed);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.scoped(format!("cannot spawn {}: {e}", command.display())))?;

        let request = ExecRequest {
            protocol_version: EXEC_PROTOCOL_VERSION,
            provider: &self.alias,
            ids,
        };
        let mut payload =
            serde_json::to_vec(&request).expect("exec request serializes to JSON");
        payload.push(b'\n');

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| self.failed(format!("writing request failed: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| self.failed(format!("closing stdin failed: {e}")))?;
        }

        // Drain stderr concurrently so a chatty child cannot deadlock on a
        // full pipe; keep a bounded head for error messages.
        let stderr_head = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut head = Vec::new();
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if head.len() < 4096 {
                                let take = (4096 - head.len()).min(n);
                                head.extend_from_slice(&buf[..take]);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&head).into_owned()
            })
        });

        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let idle = Duration::from_millis(self.config.no_output_timeout_ms);
        let cap = self.config.max_output_bytes as usize;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.failed("child stdout is not captured"))?;
        let mut output = Vec::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            let now = Instant::now();
            if now >= deadline {
                let _ = child.kill().await;
                return Err(self.failed(format!(
                    "child exceeded the {}ms total timeout",
                    self.config.timeout_ms
                )));
            }
            let window = idle.min(deadline - now);
            match tokio::time::timeout(window, stdout.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    output.extend_from_slice(&chunk[..n]);
                    if output.len() > cap {
                        let _ = child.kill().await;
                        return Err(self.failed(format!(
                            "child produced more than {cap} bytes of output"
                        )));
                    }
                }
                Ok(Err(e)) => {
                    let _ = child.kill().await;
                    return Err(self.failed(format!("reading child output failed: {e}")));
                }
                Err(_) => {
                    let _ = child.kill().await;
                    let which = if window == idle { "no-output" } else { "total" };
                    return Err(self.failed(format!("child hit the {which} timeout")));
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(self.failed(format!("waiting for child failed: {e}"))),
            Err(_) => {
                let _ = child.kill().await;
                return Err(self.failed("child did not exit before the total timeout"));
            }
        };
        if !status.success() {
            let stderr = match stderr_head {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let detail = stderr.trim();
            return Err(self.failed(format!(
                "child exited with {status}{}{}",
                if detail.is_empty() { "" } else { ": " },
                detail
            )));
        }
        Ok(output)
    }
}

#[async_trait::async_trait]
impl SecretProvider for ExecProvider {
    async fn resolve(&self, ids: &[String]) -> Result<BatchOutcome, SecretsError> {
        let output = self.run_child(ids).await?;
        let text = String::from_utf8_lossy(&output);

        let response: Result<ExecResponse, _> = serde_json::from_str(text.trim());
        let response = match response {
            Ok(r) => r,
            Err(parse_err) => {
                if !self.config.json_only && ids.len() == 1 {
                    // Raw mode: the whole trimmed stdout is the value.
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        return Err(self.failed("child produced no output"));
                    }
                    let mut outcome = BatchOutcome::default();
                    outcome
                        .values
                        .insert(ids[0].clone(), Value::String(trimmed.to_string()));
                    return Ok(outcome);
                }
                return Err(self.failed(format!("stdout is not valid JSON: {parse_err}")));
            }
        };

        if response.protocol_version != EXEC_PROTOCOL_VERSION {
            return Err(self.failed(format!(
                "unsupported response protocolVersion {}",
                response.protocol_version
            )));
        }

        let mut outcome = BatchOutcome {
            values: response.values,
            errors: response
                .errors
                .into_iter()
                .map(|(id, e)| (id, e.message))
                .collect(),
        };
        outcome.values.retain(|id, _| ids.contains(id));
        Ok(outcome)
    }
}
