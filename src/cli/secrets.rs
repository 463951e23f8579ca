//! `polyclaw secrets ...` command bodies.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};

use crate::cli::SecretsCommand;
use crate::config::load_config;
use crate::gateway::client::GatewayEndpoint;
use crate::gateway::rpc::{METHOD_SECRETS_RELOAD, RpcRequest, RpcResponse};
use crate::paths::Paths;
use crate::secrets::audit::run_secrets_audit;
use crate::secrets::auth_profiles::{AuthProfileStore, agent_refs};
use crate::secrets::apply::apply_plan;
use crate::secrets::configure::{ConfigureOptions, build_configure_plan};
use crate::secrets::plan::{SecretsPlan, validate_plan};
use crate::secrets::providers::provider_configs_from;
use crate::secrets::registry::registry;

/// Default gateway port, matching `run --listen`.
const DEFAULT_GATEWAY_PORT: u16 = 9377;
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a secrets subcommand; returns the process exit code.
pub async fn run_secrets_command(command: SecretsCommand, paths: &Paths) -> anyhow::Result<i32> {
    match command {
        SecretsCommand::Reload { json } => reload(paths, json).await,
        SecretsCommand::Audit { check, json } => audit(paths, check, json).await,
        SecretsCommand::Status { json } => status(paths, json),
        SecretsCommand::Configure {
            providers_only,
            skip_provider_setup,
            agent,
            plan_out,
            apply,
            yes,
            json,
        } => {
            configure(
                paths,
                ConfigureOptions {
                    providers_only,
                    skip_provider_setup,
                    agent,
                },
                plan_out,
                apply,
                yes,
                json,
            )
            .await
        }
        SecretsCommand::Apply {
            from,
            dry_run,
            json,
        } => apply(paths, &from, dry_run, json).await,
    }
}

/// Resolve how to reach the running gateway from the local config.
pub fn gateway_endpoint_from(config: &Value) -> GatewayEndpoint {
    let port = config
        .pointer("/gateway/port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(DEFAULT_GATEWAY_PORT);
    let token = std::env::var("POLYCLAW_GATEWAY_TOKEN")
        .ok()
        .or_else(|| {
            config
                .pointer("/gateway/auth/token")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    GatewayEndpoint {
        url: format!("ws://127.0.0.1:{port}/gateway"),
        token,
        timeout: GATEWAY_TIMEOUT,
    }
}

async fn reload(paths: &Paths, json_output: bool) -> anyhow::Result<i32> {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let config = load_config(&paths.config_file())?;
    let endpoint = gateway_endpoint_from(&config);
    let url = format!("{}?token={}", endpoint.url, endpoint.token);

    let connect = tokio::time::timeout(endpoint.timeout, tokio_tungstenite::connect_async(&url));
    let (mut stream, _) = match connect.await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            eprintln!(
                "cannot reach the gateway at {} ({e}); is `polyclaw run` running?",
                endpoint.url
            );
            return Ok(1);
        }
        Err(_) => {
            eprintln!("timed out connecting to the gateway at {}", endpoint.url);
            return Ok(1);
        }
    };

    let request = RpcRequest {
        id: 1,
        method: METHOD_SECRETS_RELOAD.to_string(),
        params: None,
    };
    stream
        .send(Message::Text(serde_json::to_string(&request)?.into()))
        .await?;
    let reply = tokio::time::timeout(Duration::from_secs(60), stream.next())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for the reload result"))?
        .ok_or_else(|| anyhow::anyhow!("gateway closed the connection"))??;
    let _ = stream.close(None).await;

    let response: RpcResponse = match reply {
        Message::Text(text) => serde_json::from_str(&text)?,
        other => anyhow::bail!("unexpected gateway frame: {other:?}"),
    };

    match (response.result, response.error) {
        (Some(result), None) => {
            let warning_count = result
                .get("warningCount")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if json_output {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("reload ok ({warning_count} warning(s))");
            }
            Ok(0)
        }
        (_, Some(error)) => {
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "ok": false, "code": error.code, "message": error.message
                    }))?
                );
            } else {
                eprintln!("reload failed [{}]: {}", error.code, error.message);
            }
            Ok(1)
        }
        (None, None) => anyhow::bail!("gateway reply had neither result nor error"),
    }
}

async fn audit(paths: &Paths, check: bool, json_output: bool) -> anyhow::Result<i32> {
    let report = run_secrets_audit(paths, None).await;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Secrets audit");
        println!("=============\n");
        if report.findings.is_empty() {
            println!("  clean: no plaintext, unresolved refs, shadows, or residue");
        } else {
            for finding in &report.findings {
                println!(
                    "  [{}] {} at {} ({})",
                    serde_json::to_value(finding.code)?
                        .as_str()
                        .unwrap_or("FINDING"),
                    finding.message,
                    finding.json_path,
                    finding.file
                );
            }
            println!("\n  {} finding(s)", report.findings.len());
        }
    }
    Ok(report.exit_code(check))
}

fn status(paths: &Paths, json_output: bool) -> anyhow::Result<i32> {
    let config = load_config(&paths.config_file())?;
    let providers = provider_configs_from(&config)
        .map(|p| p.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    let targets = registry().discover_config_secret_targets(&config, None);
    let configured: Vec<&str> = targets
        .iter()
        .filter(|t| {
            t.value
                .as_ref()
                .is_some_and(crate::secrets::reference::has_configured_secret_input)
                || t.ref_value.is_some()
        })
        .map(|t| t.path.as_str())
        .collect();

    let mut agents = Vec::new();
    for agent in agent_refs(&config, paths) {
        let profile_count = AuthProfileStore::load(&agent.dir)
            .map(|s| s.profiles().map_or(0, |p| p.len()))
            .unwrap_or(0);
        agents.push((agent.id, profile_count));
    }

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "configFile": paths.config_file(),
                "providers": providers,
                "configuredTargets": configured,
                "agents": agents
                    .iter()
                    .map(|(id, count)| json!({"id": id, "profiles": count}))
                    .collect::<Vec<_>>(),
            }))?
        );
    } else {
        println!("Secrets status");
        println!("==============\n");
        println!("  config: {}", paths.config_file().display());
        println!(
            "  providers: {}",
            if providers.is_empty() {
                "(none)".to_string()
            } else {
                providers.join(", ")
            }
        );
        println!("  configured secret targets: {}", configured.len());
        for path in &configured {
            println!("    - {path}");
        }
        for (id, count) in &agents {
            println!("  agent {id}: {count} auth profile(s)");
        }
    }
    Ok(0)
}

async fn configure(
    paths: &Paths,
    options: ConfigureOptions,
    plan_out: Option<PathBuf>,
    apply_now: bool,
    yes: bool,
    json_output: bool,
) -> anyhow::Result<i32> {
    let plan = build_configure_plan(paths, &options)?;
    validate_plan(&plan)?;

    let plan_path =
        plan_out.unwrap_or_else(|| paths.config_dir().join("secrets-plan.json"));
    plan.save(&plan_path)?;

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "plan": plan_path,
                "targets": plan.targets.len(),
                "envVars": plan
                    .targets
                    .iter()
                    .map(|t| t.secret_ref.id.clone())
                    .collect::<Vec<_>>(),
            }))?
        );
    } else {
        println!("Wrote plan with {} target(s) to {}", plan.targets.len(), plan_path.display());
        if !plan.targets.is_empty() {
            println!("\nExport these variables before applying:");
            for target in &plan.targets {
                println!("  {}  (for {})", target.secret_ref.id, target.path);
            }
        }
    }

    if !apply_now {
        return Ok(0);
    }
    if !yes {
        eprintln!("refusing to apply without --yes; review {}", plan_path.display());
        return Ok(1);
    }
    match apply_plan(paths, &plan, false, None).await {
        Ok(outcome) => {
            report_apply(&outcome.changed_files, &outcome.warnings, false, json_output)?;
            Ok(0)
        }
        Err(e) => {
            eprintln!("apply failed: {e}");
            Ok(1)
        }
    }
}

async fn apply(
    paths: &Paths,
    from: &std::path::Path,
    dry_run: bool,
    json_output: bool,
) -> anyhow::Result<i32> {
    let plan = SecretsPlan::load(from)?;
    match apply_plan(paths, &plan, dry_run, None).await {
        Ok(outcome) => {
            report_apply(
                &outcome.changed_files,
                &outcome.warnings,
                outcome.dry_run,
                json_output,
            )?;
            Ok(0)
        }
        Err(e) => {
            if json_output {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({"ok": false, "error": e.to_string()}))?
                );
            } else {
                eprintln!("apply failed: {e}");
            }
            Ok(1)
        }
    }
}

fn report_apply(
    changed_files: &[PathBuf],
    warnings: &[String],
    dry_run: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "ok": true,
                "dryRun": dry_run,
                "changedFiles": changed_files,
                "warnings": warnings,
            }))?
        );
        return Ok(());
    }
    let verb = if dry_run { "would change" } else { "changed" };
    if changed_files.is_empty() {
        println!("nothing to do");
    } else {
        println!("{verb} {} file(s):", changed_files.len());
        for path in changed_files {
            println!("  {}", path.display());
        }
    }
    for warning in warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}
