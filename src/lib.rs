//! polyclaw: a multi-channel agent gateway.
//!
//! This crate hosts the gateway's secrets subsystem: secret references in
//! configuration and per-agent auth-profile stores, resolved at activation
//! into an in-memory snapshot; tooling to audit and migrate plaintext
//! secrets; and the gateway RPC surface CLI tools use to hydrate refs from
//! the live snapshot.

pub mod channels;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod paths;
pub mod secrets;
