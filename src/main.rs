//! polyclaw - main entry point.

use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use polyclaw::cli::{Cli, Command, run_secrets_command};
use polyclaw::gateway::{GatewayState, start_server};
use polyclaw::paths::Paths;
use polyclaw::secrets::resolver::SecretsRuntime;
use polyclaw::secrets::snapshot::ReloadEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env before anything reads the environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polyclaw=info")),
        )
        .with_target(false)
        .init();

    let paths = match &cli.config_dir {
        Some(dir) => Paths::with_base(dir),
        None => Paths::resolve(),
    };

    match cli.command {
        Command::Secrets(command) => {
            let code = run_secrets_command(command, &paths).await?;
            std::process::exit(code);
        }
        Command::Run { listen, token } => {
            let runtime = Arc::new(SecretsRuntime::new(paths));

            let activator = runtime.activator();
            activator.set_observer(Box::new(|event| match event {
                ReloadEvent::Degraded { error } => {
                    tracing::warn!(event = "RELOADER_DEGRADED", %error, "secrets degraded");
                }
                ReloadEvent::Recovered => {
                    tracing::info!(event = "RELOADER_RECOVERED", "secrets recovered");
                }
            }));

            // Startup activation failure aborts the process.
            match runtime.reload(true).await {
                Ok(report) => {
                    tracing::info!(
                        warnings = report.warning_count,
                        "secrets snapshot activated"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "startup secrets activation failed");
                    anyhow::bail!("startup secrets activation failed: {e}");
                }
            }

            let auth_token = match resolve_gateway_token(token, &runtime) {
                Some(token) => token,
                None => {
                    anyhow::bail!(
                        "no gateway auth token configured; set POLYCLAW_GATEWAY_TOKEN \
                         or gateway.auth.token in config"
                    );
                }
            };

            let state = Arc::new(GatewayState {
                runtime: Arc::clone(&runtime),
                auth_token,
            });
            let bound = start_server(listen, state).await?;
            tracing::info!("gateway ready on ws://{bound}/gateway");

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            Ok(())
        }
    }
}

/// The gateway auth token: CLI flag / env first, then the resolved config.
fn resolve_gateway_token(flag: Option<String>, runtime: &SecretsRuntime) -> Option<String> {
    if let Some(token) = flag.filter(|t| !t.trim().is_empty()) {
        return Some(token);
    }
    runtime.activator().current().and_then(|snapshot| {
        snapshot
            .resolved_config
            .pointer("/gateway/auth/token")
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}
