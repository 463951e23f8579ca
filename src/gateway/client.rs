//! CLI-side hydration: fill secret refs in a local config from the live
//! gateway snapshot instead of resolving providers locally.
//!
//! Commands that read the config (e.g. `memory status`) may hit fields that
//! hold refs. Rather than spawning exec providers from the CLI process, the
//! helper asks the running gateway for the already-resolved values via
//! `secrets.resolve` and writes them into the local tree.

use std::collections::HashSet;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use crate::gateway::rpc::{METHOD_SECRETS_RESOLVE, RpcRequest, RpcResponse};
use crate::secrets::path::set_path_existing_strict;
use crate::secrets::reference::resolve_secret_input_ref;
use crate::secrets::registry::registry;
use crate::secrets::snapshot::{
    CommandSecretAssignment, Snapshot, resolve_command_secrets_in,
};
use crate::secrets::{INACTIVE_SURFACE_SENTINEL, SecretsDefaults, SecretsError};

/// How to reach the gateway.
#[derive(Debug, Clone)]
pub struct GatewayEndpoint {
    /// e.g. `ws://127.0.0.1:9377/gateway`
    pub url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayClientError {
    #[error("cannot reach gateway at {url}: {message}")]
    Connect { url: String, message: String },

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway returned {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("invalid gateway reply: {0}")]
    BadReply(String),

    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

/// Outcome of a hydration attempt.
#[derive(Debug, Default)]
pub struct HydrationReport {
    /// False when the local config had no refs among the target ids and the
    /// gateway was never contacted.
    pub contacted_gateway: bool,
    pub assignments_applied: usize,
    pub diagnostics: Vec<String>,
}

/// Hydrate `config` in place for the given registry target ids.
pub async fn resolve_command_secret_refs_via_gateway(
    config: &mut Value,
    command_name: &str,
    target_ids: &[String],
    endpoint: &GatewayEndpoint,
) -> Result<HydrationReport, GatewayClientError> {
    let defaults = SecretsDefaults::from_config(config);
    let ids: Vec<&str> = target_ids.iter().map(String::as_str).collect();
    let any_ref = registry()
        .discover_config_secret_targets(config, Some(ids.as_slice()))
        .iter()
        .any(|t| {
            resolve_secret_input_ref(t.value.as_ref(), t.ref_value.as_ref(), &defaults)
                .secret_ref
                .is_some()
        });
    if !any_ref {
        return Ok(HydrationReport::default());
    }

    let source_view = config.clone();
    let reply = call_resolve(endpoint, command_name, target_ids).await?;

    let assignments: Vec<CommandSecretAssignment> = reply
        .get("assignments")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| GatewayClientError::BadReply(e.to_string()))?
        .ok_or_else(|| GatewayClientError::BadReply("missing assignments".to_string()))?;
    let diagnostics: Vec<String> = reply
        .get("diagnostics")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| GatewayClientError::BadReply(e.to_string()))?
        .unwrap_or_default();

    for assignment in &assignments {
        set_path_existing_strict(
            config,
            &assignment.path_segments,
            assignment.value.clone(),
        )
        .map_err(SecretsError::from)?;
    }

    // The gateway's inactive-surface diagnostics license unresolved refs at
    // those exact paths; everything else must have resolved.
    let inactive_paths: HashSet<String> = diagnostics
        .iter()
        .filter(|d| d.contains(INACTIVE_SURFACE_SENTINEL))
        .filter_map(|d| {
            d.split(INACTIVE_SURFACE_SENTINEL)
                .next()
                .map(str::to_string)
        })
        .collect();

    let check_view = Snapshot {
        source_config: source_view,
        resolved_config: config.clone(),
        auth_stores: Vec::new(),
        warnings: Vec::new(),
    };
    resolve_command_secrets_in(&check_view, command_name, target_ids, &inactive_paths)?;

    Ok(HydrationReport {
        contacted_gateway: true,
        assignments_applied: assignments.len(),
        diagnostics,
    })
}

async fn call_resolve(
    endpoint: &GatewayEndpoint,
    command_name: &str,
    target_ids: &[String],
) -> Result<Value, GatewayClientError> {
    let url = format!("{}?token={}", endpoint.url, endpoint.token);
    let connect = tokio_tungstenite::connect_async(&url);
    let (mut stream, _) = tokio::time::timeout(endpoint.timeout, connect)
        .await
        .map_err(|_| GatewayClientError::Timeout)?
        .map_err(|e| GatewayClientError::Connect {
            url: endpoint.url.clone(),
            message: e.to_string(),
        })?;

    let request = RpcRequest {
        id: 1,
        method: METHOD_SECRETS_RESOLVE.to_string(),
        params: Some(json!({
            "commandName": command_name,
            "targetIds": target_ids,
        })),
    };
    let payload = serde_json::to_string(&request).expect("rpc request serializes");
    tokio::time::timeout(endpoint.timeout, stream.send(Message::Text(payload.into())))
        .await
        .map_err(|_| GatewayClientError::Timeout)?
        .map_err(|e| GatewayClientError::Connect {
            url: endpoint.url.clone(),
            message: e.to_string(),
        })?;

    let response = loop {
        let frame = tokio::time::timeout(endpoint.timeout, stream.next())
            .await
            .map_err(|_| GatewayClientError::Timeout)?
            .ok_or_else(|| GatewayClientError::BadReply("connection closed".to_string()))?
            .map_err(|e| GatewayClientError::BadReply(e.to_string()))?;
        match frame {
            Message::Text(text) => {
                let response: RpcResponse = serde_json::from_str(&text)
                    .map_err(|e| GatewayClientError::BadReply(e.to_string()))?;
                break response;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                return Err(GatewayClientError::BadReply(format!(
                    "unexpected frame {other:?}"
                )));
            }
        }
    };
    let _ = stream.close(None).await;

    if let Some(error) = response.error {
        return Err(GatewayClientError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    let result = response
        .result
        .ok_or_else(|| GatewayClientError::BadReply("missing result".to_string()))?;
    if result.get("ok").and_then(Value::as_bool) != Some(true) {
        return Err(GatewayClientError::BadReply("result.ok is not true".to_string()));
    }
    Ok(result)
}
