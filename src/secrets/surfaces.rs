//! Active-surface rules.
//!
//! A ref only resolves when the field that holds it would actually be used:
//! the owning channel/account/feature is enabled, mode gates match, and the
//! shared account-inheritance model says the field takes effect. Every
//! inactive decision carries a human-readable reason that ends up in a
//! `SECRETS_REF_IGNORED_INACTIVE_SURFACE` diagnostic.
//!
//! Account inheritance, per channel:
//! - no `accounts` mapping (or empty): the top-level field is active when
//!   the channel is enabled;
//! - non-empty `accounts`: the top-level field is active only when at least
//!   one enabled account does not define its own override;
//! - account fields are active when both the channel and the account are
//!   enabled (a missing account `enabled` counts as enabled).

use serde_json::Value;

use crate::secrets::path::get_path;
use crate::secrets::reference::has_configured_secret_input;
use crate::secrets::registry::{DiscoveredTarget, FieldGate, SecretShape, SurfaceRule, TargetEntry};

/// Whether a discovered target's surface is in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceActivity {
    Active,
    Inactive(String),
}

impl SurfaceActivity {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    fn inactive(reason: impl Into<String>) -> Self {
        Self::Inactive(reason.into())
    }
}

/// `enabled` is only a kill switch: literally false disables, anything else
/// (including absence) leaves the surface on.
fn enabled_flag(obj: Option<&Value>) -> bool {
    obj.and_then(|o| o.get("enabled"))
        .and_then(Value::as_bool)
        != Some(false)
}

fn get_rel<'a>(node: &'a Value, rel_path: &[&str]) -> Option<&'a Value> {
    let mut current = node;
    for part in rel_path {
        current = current.get(part)?;
    }
    Some(current)
}

/// Compute activity for a target discovered in the main config.
pub fn surface_activity(target: &DiscoveredTarget, config: &Value) -> SurfaceActivity {
    match target.entry.surface {
        SurfaceRule::Always => SurfaceActivity::Active,
        SurfaceRule::EnabledSibling => enabled_sibling(target, config),
        SurfaceRule::GatewayAuthPassword => gateway_auth_password(config),
        SurfaceRule::GatewayRemoteSecret => gateway_remote_secret(config),
        SurfaceRule::ChannelField {
            channel,
            field_path,
            gate,
            account_level,
        } => channel_field(target, config, channel, field_path, gate, account_level),
        SurfaceRule::AgentMemorySearchDefaults => agent_memory_search_defaults(config),
        SurfaceRule::AgentMemorySearchAgent => agent_memory_search_agent(target, config),
        SurfaceRule::WebSearchProvider => web_search_provider(target, config),
    }
}

fn enabled_sibling(target: &DiscoveredTarget, config: &Value) -> SurfaceActivity {
    let parent_segments = &target.path_segments[..target.path_segments.len() - 1];
    let parent = get_path(config, parent_segments);
    if enabled_flag(parent) {
        SurfaceActivity::Active
    } else {
        SurfaceActivity::inactive(format!(
            "{} is disabled (enabled: false)",
            parent_segments.join(".")
        ))
    }
}

fn gateway_auth_password(config: &Value) -> SurfaceActivity {
    let mode = config
        .pointer("/gateway/auth/mode")
        .and_then(Value::as_str);
    if mode == Some("password") {
        SurfaceActivity::Active
    } else {
        SurfaceActivity::inactive("gateway.auth.mode is not \"password\"")
    }
}

fn gateway_remote_secret(config: &Value) -> SurfaceActivity {
    let remote = config.pointer("/gateway/remote");
    if !remote.is_some_and(Value::is_object) || !enabled_flag(remote) {
        return SurfaceActivity::inactive("gateway.remote is not configured or is disabled");
    }
    // A local password-mode secret suppresses the remote credentials.
    let local_mode = config
        .pointer("/gateway/auth/mode")
        .and_then(Value::as_str);
    let local_secret = config
        .pointer("/gateway/auth/password")
        .is_some_and(has_configured_secret_input);
    if local_mode == Some("password") && local_secret {
        SurfaceActivity::inactive("a local gateway auth secret takes effect")
    } else {
        SurfaceActivity::Active
    }
}

/// True when an account object defines its own value for the field (or its
/// sibling ref, for sibling-ref entries).
fn account_overrides(account: &Value, entry: &TargetEntry, field_path: &[&str]) -> bool {
    if get_rel(account, field_path).is_some() {
        return true;
    }
    if entry.secret_shape == SecretShape::SiblingRef {
        if let Some((last, init)) = field_path.split_last() {
            let ref_field = format!("{last}Ref");
            let mut rel: Vec<&str> = init.to_vec();
            rel.push(&ref_field);
            return get_rel(account, &rel).is_some();
        }
    }
    false
}

fn channel_field(
    target: &DiscoveredTarget,
    config: &Value,
    channel: &str,
    field_path: &[&str],
    gate: FieldGate,
    account_level: bool,
) -> SurfaceActivity {
    let Some(channel_obj) = config
        .get("channels")
        .and_then(|c| c.get(channel))
        .filter(|c| c.is_object())
    else {
        return SurfaceActivity::inactive(format!("channel {channel} is not configured"));
    };
    if !enabled_flag(Some(channel_obj)) {
        return SurfaceActivity::inactive(format!("channel {channel} is disabled"));
    }

    if account_level {
        let Some(account_id) = target.account_id.as_deref() else {
            return SurfaceActivity::inactive("account id missing from path");
        };
        let Some(account) = channel_obj
            .get("accounts")
            .and_then(|a| a.get(account_id))
        else {
            return SurfaceActivity::inactive(format!("account {account_id} is not configured"));
        };
        if !enabled_flag(Some(account)) {
            return SurfaceActivity::inactive(format!("account {account_id} is disabled"));
        }
        return field_gate(gate, Some(account), channel_obj);
    }

    // Top-level field: defer to the accounts when they exist.
    let accounts = channel_obj
        .get("accounts")
        .and_then(Value::as_object)
        .filter(|a| !a.is_empty());
    if let Some(accounts) = accounts {
        let inheriting = accounts.iter().find(|(_, account)| {
            enabled_flag(Some(account)) && !account_overrides(account, &target.entry, field_path)
        });
        if inheriting.is_none() {
            return SurfaceActivity::inactive(format!(
                "every enabled {channel} account overrides {}, so the top-level value is unused",
                field_path.join(".")
            ));
        }
    }
    field_gate(gate, None, channel_obj)
}

/// Per-field gates. `account` is the account object for account-level
/// fields; gate inputs fall back from the account to the channel top.
fn field_gate(gate: FieldGate, account: Option<&Value>, channel_obj: &Value) -> SurfaceActivity {
    let inherited = |field: &str| {
        account
            .and_then(|a| a.get(field))
            .or_else(|| channel_obj.get(field))
    };
    match gate {
        FieldGate::None => SurfaceActivity::Active,
        FieldGate::TelegramBotToken => {
            let token_file = inherited("tokenFile")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if token_file {
                SurfaceActivity::inactive("a tokenFile is configured, botToken is unused")
            } else {
                SurfaceActivity::Active
            }
        }
        FieldGate::TelegramWebhookSecret => {
            let webhook_url = inherited("webhookUrl")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if webhook_url {
                SurfaceActivity::Active
            } else {
                SurfaceActivity::inactive("webhookSecret requires a non-empty webhookUrl")
            }
        }
        FieldGate::SlackSigningSecret => {
            let mode = inherited("mode").and_then(Value::as_str);
            if mode == Some("http") {
                SurfaceActivity::Active
            } else {
                SurfaceActivity::inactive("signingSecret requires mode \"http\"")
            }
        }
        FieldGate::SubSurface(sub_path) => {
            // The sub-surface object inherits from the channel top unless
            // the account redefines it.
            let sub = account
                .and_then(|a| get_rel(a, sub_path))
                .or_else(|| get_rel(channel_obj, sub_path));
            if enabled_flag(sub) {
                SurfaceActivity::Active
            } else {
                SurfaceActivity::inactive(format!("{} is disabled", sub_path.join(".")))
            }
        }
    }
}

fn enabled_agents(config: &Value) -> Option<Vec<&Value>> {
    let list = config
        .pointer("/agents/list")
        .and_then(Value::as_array)?;
    if list.is_empty() {
        return None;
    }
    Some(
        list.iter()
            .filter(|a| enabled_flag(Some(a)))
            .collect(),
    )
}

fn agent_memory_search_defaults(config: &Value) -> SurfaceActivity {
    let Some(enabled) = enabled_agents(config) else {
        // No explicit agent list: the implicit agent consumes the default.
        return SurfaceActivity::Active;
    };
    if enabled.is_empty() {
        return SurfaceActivity::inactive("no agent is enabled");
    }
    let all_override = enabled.iter().all(|agent| {
        agent
            .pointer("/memorySearch/remote/apiKey")
            .is_some_and(has_configured_secret_input)
    });
    if all_override {
        SurfaceActivity::inactive(
            "every enabled agent overrides memorySearch.remote.apiKey, the default is unused",
        )
    } else {
        SurfaceActivity::Active
    }
}

fn agent_memory_search_agent(target: &DiscoveredTarget, config: &Value) -> SurfaceActivity {
    // Path shape: agents.list.<i>.memorySearch.remote.apiKey
    let agent = get_path(config, &target.path_segments[..3]);
    if enabled_flag(agent) {
        SurfaceActivity::Active
    } else {
        let name = agent
            .and_then(|a| a.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("agent");
        SurfaceActivity::inactive(format!("{name} is disabled"))
    }
}

fn web_search_provider(target: &DiscoveredTarget, config: &Value) -> SurfaceActivity {
    let parent = config.pointer("/tools/webSearch");
    if !enabled_flag(parent) {
        return SurfaceActivity::inactive("tools.webSearch is disabled");
    }
    let provider = get_path(config, &target.path_segments[..target.path_segments.len() - 1]);
    if enabled_flag(provider) {
        SurfaceActivity::Active
    } else {
        SurfaceActivity::inactive(format!(
            "{} is disabled (enabled: false)",
            target.path_segments[..target.path_segments.len() - 1].join(".")
        ))
    }
}
