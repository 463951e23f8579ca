//! Gateway RPC envelope and method schemas.
//!
//! Requests and responses are JSON text frames over the gateway WebSocket:
//!
//! ```text
//! request  = {"id": 7, "method": "secrets.resolve", "params": {...}}
//! response = {"id": 7, "result": {...}} | {"id": 7, "error": {"code", "message"}}
//! ```
//!
//! Method params are validated strictly: unknown fields and wrong types are
//! `INVALID_REQUEST`, not best-effort coercion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_PING: &str = "ping";
pub const METHOD_SECRETS_RELOAD: &str = "secrets.reload";
pub const METHOD_SECRETS_RESOLVE: &str = "secrets.resolve";

pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub const ERROR_INTERNAL: &str = "INTERNAL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// `secrets.resolve` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SecretsResolveParams {
    pub command_name: String,
    pub target_ids: Vec<String>,
}

/// Parse `secrets.resolve` params strictly.
pub fn parse_resolve_params(params: Option<&Value>) -> Result<SecretsResolveParams, String> {
    let Some(params) = params else {
        return Err("params are required".to_string());
    };
    let parsed: SecretsResolveParams =
        serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
    if parsed.command_name.trim().is_empty() {
        return Err("commandName must be non-empty".to_string());
    }
    if parsed.target_ids.is_empty() {
        return Err("targetIds must be non-empty".to_string());
    }
    Ok(parsed)
}

/// Parse `secrets.reload` params: absent or an empty object.
pub fn parse_reload_params(params: Option<&Value>) -> Result<(), String> {
    match params {
        None => Ok(()),
        Some(Value::Object(map)) if map.is_empty() => Ok(()),
        Some(_) => Err("secrets.reload takes no params".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_params_strict() {
        let parsed = parse_resolve_params(Some(&json!({
            "commandName": "memory status",
            "targetIds": ["talk.apiKey"]
        })))
        .unwrap();
        assert_eq!(parsed.command_name, "memory status");

        assert!(parse_resolve_params(None).is_err());
        assert!(
            parse_resolve_params(Some(&json!({
                "commandName": "x", "targetIds": []
            })))
            .is_err()
        );
        assert!(
            parse_resolve_params(Some(&json!({
                "commandName": "x", "targetIds": ["a"], "extra": 1
            })))
            .is_err()
        );
        assert!(
            parse_resolve_params(Some(&json!({
                "commandName": "", "targetIds": ["a"]
            })))
            .is_err()
        );
    }

    #[test]
    fn reload_params_must_be_empty() {
        assert!(parse_reload_params(None).is_ok());
        assert!(parse_reload_params(Some(&json!({}))).is_ok());
        assert!(parse_reload_params(Some(&json!({"force": true}))).is_err());
    }

    #[test]
    fn envelope_round_trip() {
        let response = RpcResponse::err(3, ERROR_INVALID_REQUEST, "bad");
        let raw = serde_json::to_string(&response).unwrap();
        let parsed: RpcResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.id, 3);
        assert_eq!(parsed.error.unwrap().code, ERROR_INVALID_REQUEST);

        let request: RpcRequest =
            serde_json::from_str(r#"{"id":1,"method":"ping"}"#).unwrap();
        assert_eq!(request.method, "ping");
        assert!(request.params.is_none());
    }
}
