//! End-to-end resolution tests: real config files, real secret files, real
//! provider subprocesses, driven through the full runtime.

use std::collections::HashMap;

use serde_json::{Value, json};
use tempfile::TempDir;

use polyclaw::config::save_config;
use polyclaw::paths::Paths;
use polyclaw::secrets::resolver::SecretsRuntime;
use polyclaw::secrets::snapshot::ReloaderState;

fn setup(config: &Value) -> (TempDir, Paths) {
    let dir = TempDir::new().unwrap();
    let paths = Paths::with_base(dir.path());
    save_config(&paths.config_file(), config).unwrap();
    (dir, paths)
}

fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
    vars.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn file_provider_resolves_json_pointer() {
    let dir = TempDir::new().unwrap();
    let secrets_path = dir.path().join("secrets.json");
    std::fs::write(
        &secrets_path,
        r#"{"providers": {"openai": {"apiKey": "sk-file"}}}"#,
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&secrets_path, std::fs::Permissions::from_mode(0o600)).unwrap();
    }

    let (_config_dir, paths) = setup(&json!({
        "secrets": {"providers": {"default": {
            "source": "file",
            "path": secrets_path,
            "mode": "json"
        }}},
        "models": {"providers": {"openai": {
            "apiKey": {"source": "file", "provider": "default", "id": "/providers/openai/apiKey"}
        }}}
    }));

    let runtime = SecretsRuntime::new(paths);
    runtime.reload(true).await.unwrap();

    let snapshot = runtime.activator().current().unwrap();
    assert_eq!(
        snapshot.resolved_config["models"]["providers"]["openai"]["apiKey"],
        json!("sk-file")
    );
}

#[tokio::test]
async fn exec_provider_resolves_batch() {
    let dir = TempDir::new().unwrap();
    let helper = dir.path().join("helper.sh");
    std::fs::write(
        &helper,
        "#!/bin/sh\ncat >/dev/null\nprintf '{\"protocolVersion\":1,\"values\":{\"talk/key\":\"sk-exec\"}}\\n'\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o700)).unwrap();
    }

    let (_config_dir, paths) = setup(&json!({
        "secrets": {"providers": {"op": {
            "source": "exec",
            "command": helper,
            "trustedDirs": [dir.path()],
            "jsonOnly": true
        }}},
        "talk": {"apiKey": {"source": "exec", "provider": "op", "id": "talk/key"}}
    }));

    let runtime = SecretsRuntime::new(paths);
    runtime.reload(true).await.unwrap();
    let snapshot = runtime.activator().current().unwrap();
    assert_eq!(snapshot.resolved_config["talk"]["apiKey"], json!("sk-exec"));
}

#[tokio::test]
async fn account_inheritance_end_to_end() {
    // Top-level telegram ref is on an inactive surface: the only enabled
    // account overrides it. Activation succeeds with the account token only.
    let (_dir, paths) = setup(&json!({
        "secrets": {"providers": {"default": {"source": "env"}}},
        "channels": {"telegram": {
            "botToken": {"source": "env", "provider": "default", "id": "TOP_TOKEN"},
            "accounts": {
                "work": {
                    "enabled": true,
                    "botToken": {"source": "env", "provider": "default", "id": "WORK_TOKEN"}
                },
                "disabled": {"enabled": false}
            }
        }}
    }));

    let runtime =
        SecretsRuntime::new(paths).with_env_overrides(env(&[("WORK_TOKEN", "tok-work")]));
    let report = runtime.reload(true).await.unwrap();
    assert_eq!(report.warning_count, 1);

    let snapshot = runtime.activator().current().unwrap();
    assert_eq!(
        snapshot.resolved_config["channels"]["telegram"]["accounts"]["work"]["botToken"],
        json!("tok-work")
    );
    assert!(snapshot.resolved_config["channels"]["telegram"]["botToken"].is_object());
    assert_eq!(snapshot.warnings.len(), 1);
    assert_eq!(snapshot.warnings[0].path, "channels.telegram.botToken");
}

#[tokio::test]
async fn degraded_reload_keeps_serving_and_recovers() {
    let good = json!({
        "secrets": {"providers": {"default": {"source": "env"}}},
        "talk": {"apiKey": {"source": "env", "provider": "default", "id": "GOOD_KEY"}}
    });
    let (_dir, paths) = setup(&good);

    let runtime = SecretsRuntime::new(paths.clone())
        .with_env_overrides(env(&[("GOOD_KEY", "sk-good")]));
    runtime.reload(true).await.unwrap();

    // Break it: unknown provider alias.
    save_config(
        &paths.config_file(),
        &json!({
            "talk": {"apiKey": {"source": "env", "provider": "ghost", "id": "GOOD_KEY"}}
        }),
    )
    .unwrap();
    runtime.reload(false).await.unwrap_err();
    assert_eq!(runtime.activator().state(), ReloaderState::Degraded);
    assert_eq!(
        runtime.activator().current().unwrap().resolved_config["talk"]["apiKey"],
        json!("sk-good")
    );

    // Fix it again and recover.
    save_config(&paths.config_file(), &good).unwrap();
    runtime.reload(false).await.unwrap();
    assert_eq!(runtime.activator().state(), ReloaderState::Ready);
}

#[tokio::test]
async fn auth_profile_store_resolution_end_to_end() {
    let (_dir, paths) = setup(&json!({
        "secrets": {"providers": {"default": {"source": "env"}}}
    }));
    let agent_dir = paths.default_agent_dir("main");
    std::fs::create_dir_all(&agent_dir).unwrap();
    std::fs::write(
        Paths::auth_profiles_file(&agent_dir),
        serde_json::to_string(&json!({
            "version": 1,
            "profiles": {"anthropic:work": {
                "type": "token",
                "provider": "anthropic",
                "tokenRef": {"source": "env", "provider": "default", "id": "ANTH_TOKEN"}
            }}
        }))
        .unwrap(),
    )
    .unwrap();

    let runtime =
        SecretsRuntime::new(paths).with_env_overrides(env(&[("ANTH_TOKEN", "tok-anth")]));
    runtime.reload(true).await.unwrap();

    let snapshot = runtime.activator().current().unwrap();
    assert_eq!(snapshot.auth_stores.len(), 1);
    let profile = &snapshot.auth_stores[0].tree["profiles"]["anthropic:work"];
    assert_eq!(profile["token"], json!("tok-anth"));
    assert!(profile["tokenRef"].is_object());
}
