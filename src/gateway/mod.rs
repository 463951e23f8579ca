//! Gateway RPC surface: `secrets.reload` and `secrets.resolve` over a
//! WebSocket, plus the CLI-side hydration client.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{
    GatewayClientError, GatewayEndpoint, HydrationReport,
    resolve_command_secret_refs_via_gateway,
};
pub use server::{GatewayState, start_server};
