//! Axum WebSocket server exposing the secrets RPC surface.
//!
//! One endpoint (`/gateway`) carries the JSON envelope from [`super::rpc`].
//! Auth is a bearer token passed as the `token` query parameter and compared
//! in constant time. Malformed frames close the connection; well-formed
//! requests for unknown methods get an `INVALID_REQUEST` error back.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade, ws::Message, ws::WebSocket},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::gateway::rpc::{
    ERROR_INTERNAL, ERROR_INVALID_REQUEST, ERROR_UNAVAILABLE, METHOD_PING,
    METHOD_SECRETS_RELOAD, METHOD_SECRETS_RESOLVE, RpcRequest, RpcResponse,
    parse_reload_params, parse_resolve_params,
};
use crate::secrets::registry::registry;
use crate::secrets::resolver::SecretsRuntime;

/// Shared state for gateway handlers.
pub struct GatewayState {
    pub runtime: Arc<SecretsRuntime>,
    pub auth_token: String,
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: String,
}

/// Start the gateway server. Returns the bound address (useful with port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> std::io::Result<SocketAddr> {
    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server exited");
        }
    });
    tracing::info!(%bound, "gateway listening");
    Ok(bound)
}

async fn ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let supplied = query.token.as_bytes();
    let expected = state.auth_token.as_bytes();
    let authorized =
        supplied.len() == expected.len() && supplied.ct_eq(expected).unwrap_u8() == 1;
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    upgrade
        .on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, state: Arc<GatewayState>) {
    while let Some(frame) = socket.recv().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };
        match frame {
            Message::Text(text) => {
                let request: RpcRequest = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::debug!(error = %e, "closing gateway socket on malformed frame");
                        break;
                    }
                };
                let response = dispatch(&state, request).await;
                let payload =
                    serde_json::to_string(&response).expect("rpc response serializes");
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            Message::Ping(data) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn dispatch(state: &GatewayState, request: RpcRequest) -> RpcResponse {
    match request.method.as_str() {
        METHOD_PING => RpcResponse::ok(request.id, json!({"ok": true})),
        METHOD_SECRETS_RELOAD => {
            if let Err(e) = parse_reload_params(request.params.as_ref()) {
                return RpcResponse::err(request.id, ERROR_INVALID_REQUEST, e);
            }
            match state.runtime.reload(false).await {
                Ok(report) => RpcResponse::ok(
                    request.id,
                    json!({"ok": true, "warningCount": report.warning_count}),
                ),
                Err(e) => RpcResponse::err(
                    request.id,
                    ERROR_UNAVAILABLE,
                    format!("reload failed, keeping last-known-good snapshot: {e}"),
                ),
            }
        }
        METHOD_SECRETS_RESOLVE => {
            let params = match parse_resolve_params(request.params.as_ref()) {
                Ok(params) => params,
                Err(e) => return RpcResponse::err(request.id, ERROR_INVALID_REQUEST, e),
            };
            let unknown: Vec<&String> = params
                .target_ids
                .iter()
                .filter(|id| registry().main_entry_by_id(id).is_none())
                .collect();
            if !unknown.is_empty() {
                return RpcResponse::err(
                    request.id,
                    ERROR_INVALID_REQUEST,
                    format!("unknown target ids: {unknown:?}"),
                );
            }
            let activator = state.runtime.activator();
            if !activator.has_snapshot() {
                return RpcResponse::err(
                    request.id,
                    ERROR_UNAVAILABLE,
                    "no secrets snapshot is active yet",
                );
            }
            match activator.resolve_command_secrets(
                &params.command_name,
                &params.target_ids,
                &HashSet::new(),
            ) {
                Ok(resolved) => RpcResponse::ok(
                    request.id,
                    json!({
                        "ok": true,
                        "assignments": resolved.assignments,
                        "diagnostics": resolved.diagnostics,
                    }),
                ),
                Err(e) => RpcResponse::err(request.id, ERROR_INTERNAL, e.to_string()),
            }
        }
        other => RpcResponse::err(
            request.id,
            ERROR_INVALID_REQUEST,
            format!("unknown method {other:?}"),
        ),
    }
}
