//! CLI command definitions.
//!
//! Subcommands:
//! - `run`: start the gateway
//! - `secrets reload|audit|status|configure|apply`: the secrets tooling

mod secrets;

pub use secrets::run_secrets_command;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "polyclaw")]
#[command(about = "Multi-channel agent gateway with secret-reference resolution")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Override the config directory (default ~/.polyclaw).
    #[arg(long, global = true, env = "POLYCLAW_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway (default mode for service managers).
    Run {
        /// Listen address for the gateway WebSocket.
        #[arg(long, default_value = "127.0.0.1:9377")]
        listen: SocketAddr,

        /// Gateway auth token; falls back to `gateway.auth.token` in config.
        #[arg(long, env = "POLYCLAW_GATEWAY_TOKEN")]
        token: Option<String>,
    },

    /// Secrets: reload, audit, configure, and apply migration plans.
    #[command(subcommand)]
    Secrets(SecretsCommand),
}

#[derive(Subcommand, Debug)]
pub enum SecretsCommand {
    /// Ask the running gateway to re-resolve all secret refs.
    Reload {
        #[arg(long)]
        json: bool,
    },

    /// Scan config, auth-profile stores, the legacy store, and .env.
    Audit {
        /// Exit 1 when any finding exists (CI mode).
        #[arg(long)]
        check: bool,
        #[arg(long)]
        json: bool,
    },

    /// Summarize the secrets configuration and discovered targets.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Build a migration plan that moves plaintext secrets behind refs.
    Configure {
        /// Only ensure providers exist; do not migrate targets.
        #[arg(long)]
        providers_only: bool,

        /// Do not add a default env provider when none is configured.
        #[arg(long)]
        skip_provider_setup: bool,

        /// Restrict auth-profile migration to one agent.
        #[arg(long)]
        agent: Option<String>,

        /// Write the plan to this path instead of the default.
        #[arg(long)]
        plan_out: Option<PathBuf>,

        /// Apply the plan immediately (requires --yes).
        #[arg(long)]
        apply: bool,

        /// Skip the confirmation that applying normally requires.
        #[arg(long)]
        yes: bool,

        #[arg(long)]
        json: bool,
    },

    /// Apply a previously-written migration plan.
    Apply {
        /// Path of the plan file.
        #[arg(long)]
        from: PathBuf,

        /// Project and preflight without writing anything.
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },
}
