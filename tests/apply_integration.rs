//! Full migration flow: configure -> apply -> audit over real files.

use std::collections::HashMap;

use serde_json::{Value, json};
use tempfile::TempDir;

use polyclaw::config::{load_config, save_config};
use polyclaw::paths::Paths;
use polyclaw::secrets::apply::apply_plan;
use polyclaw::secrets::audit::{AuditStatus, run_secrets_audit};
use polyclaw::secrets::auth_profiles::AuthProfileStore;
use polyclaw::secrets::configure::{ConfigureOptions, build_configure_plan};
use polyclaw::secrets::plan::validate_plan;

fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
    Some(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

fn setup(config: &Value) -> (TempDir, Paths) {
    let dir = TempDir::new().unwrap();
    let paths = Paths::with_base(dir.path());
    save_config(&paths.config_file(), config).unwrap();
    (dir, paths)
}

#[tokio::test]
async fn configure_apply_audit_round_trip() {
    let (_dir, paths) = setup(&json!({
        "talk": {"apiKey": "sk-plaintext-talk"},
        "channels": {"telegram": {"botToken": "123:plain-token"}}
    }));
    let agent_dir = paths.default_agent_dir("main");
    std::fs::create_dir_all(&agent_dir).unwrap();
    std::fs::write(
        Paths::auth_profiles_file(&agent_dir),
        serde_json::to_string(&json!({
            "version": 1,
            "profiles": {"openai:default": {
                "type": "api_key", "provider": "openai", "key": "sk-store-plain"
            }}
        }))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        paths.env_file(),
        "TELEGRAM_BOT_TOKEN=123:plain-token\nUNRELATED=keep\n",
    )
    .unwrap();

    // The audit sees the plaintext before migration.
    let before = run_secrets_audit(&paths, env(&[])).await;
    assert_eq!(before.status, AuditStatus::Findings);

    // Configure builds a plan covering all three plaintext locations.
    let plan = build_configure_plan(&paths, &ConfigureOptions::default()).unwrap();
    let validated = validate_plan(&plan).unwrap();
    assert_eq!(validated.targets.len(), 3);

    // Provide every env var the plan asks for, then apply.
    let vars: Vec<(String, String)> = plan
        .targets
        .iter()
        .map(|t| (t.secret_ref.id.clone(), format!("resolved-{}", t.secret_ref.id)))
        .collect();
    let var_refs: Vec<(&str, &str)> = vars
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let outcome = apply_plan(&paths, &plan, false, env(&var_refs)).await.unwrap();
    assert!(!outcome.dry_run);
    assert!(outcome.changed_files.contains(&paths.config_file()));

    // Plaintext replaced with refs in config...
    let config = load_config(&paths.config_file()).unwrap();
    assert_eq!(config["talk"]["apiKey"]["source"], json!("env"));
    assert_eq!(
        config["channels"]["telegram"]["botToken"]["id"],
        json!("CHANNELS_TELEGRAM_BOT_TOKEN")
    );

    // ...and in the store (sibling-ref shape).
    let store = AuthProfileStore::load(&agent_dir).unwrap();
    let profile = store.profile("openai:default").unwrap();
    assert!(profile.get("key").is_none());
    assert_eq!(profile["keyRef"]["source"], json!("env"));

    // The .env residue that matched migrated plaintext is gone.
    let env_contents = std::fs::read_to_string(paths.env_file()).unwrap();
    assert!(!env_contents.contains("TELEGRAM_BOT_TOKEN"));
    assert!(env_contents.contains("UNRELATED=keep"));

    // Audit is clean now (with the plan's env vars present).
    let after = run_secrets_audit(&paths, env(&var_refs)).await;
    assert_eq!(
        after.status,
        AuditStatus::Clean,
        "unexpected findings: {:?}",
        after.findings
    );
}

#[tokio::test]
async fn dry_run_is_byte_identical() {
    let (_dir, paths) = setup(&json!({
        "secrets": {"providers": {"default": {"source": "env"}}},
        "talk": {"apiKey": "sk-plain"}
    }));
    let agent_dir = paths.default_agent_dir("main");
    std::fs::create_dir_all(&agent_dir).unwrap();
    std::fs::write(
        Paths::auth_profiles_file(&agent_dir),
        serde_json::to_string(&json!({
            "version": 1,
            "profiles": {"openai:default": {
                "type": "api_key", "provider": "openai", "key": "sk-plain-2"
            }}
        }))
        .unwrap(),
    )
    .unwrap();

    let config_before = std::fs::read(paths.config_file()).unwrap();
    let store_before = std::fs::read(Paths::auth_profiles_file(&agent_dir)).unwrap();

    let plan = build_configure_plan(&paths, &ConfigureOptions::default()).unwrap();
    let vars: Vec<(String, String)> = plan
        .targets
        .iter()
        .map(|t| (t.secret_ref.id.clone(), "v".to_string()))
        .collect();
    let var_refs: Vec<(&str, &str)> = vars
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let outcome = apply_plan(&paths, &plan, true, env(&var_refs)).await.unwrap();
    assert!(outcome.dry_run);
    assert!(!outcome.changed_files.is_empty());

    assert_eq!(std::fs::read(paths.config_file()).unwrap(), config_before);
    assert_eq!(
        std::fs::read(Paths::auth_profiles_file(&agent_dir)).unwrap(),
        store_before
    );
}

#[tokio::test]
async fn failed_preflight_leaves_every_file_untouched() {
    let (_dir, paths) = setup(&json!({"talk": {"apiKey": "sk-plain"}}));
    std::fs::write(paths.env_file(), "TALK_API_KEY=sk-plain\n").unwrap();

    let config_before = std::fs::read(paths.config_file()).unwrap();
    let env_before = std::fs::read(paths.env_file()).unwrap();

    let plan = build_configure_plan(&paths, &ConfigureOptions::default()).unwrap();
    // No env vars supplied: preflight resolution must fail.
    apply_plan(&paths, &plan, false, env(&[])).await.unwrap_err();

    assert_eq!(std::fs::read(paths.config_file()).unwrap(), config_before);
    assert_eq!(std::fs::read(paths.env_file()).unwrap(), env_before);
}
