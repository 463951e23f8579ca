//! Target registry: every location in configuration and in the per-agent
//! auth-profile stores where a secret may live.
//!
//! Entries are declared in a static table and compiled once at startup into
//! token lists plus lookup indices (by target type with aliases, by id for
//! each config-file scope). Queries never re-parse patterns.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use serde_json::Value;

use crate::secrets::path::{
    self, PathError, PathToken, expand, join_segments, match_tokens, materialize,
    parse_path_pattern,
};

/// Which file scope an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFileScope {
    Main,
    AuthProfile,
}

/// How the secret is stored at the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretShape {
    /// The path itself holds plaintext or an inline ref object.
    SecretInput,
    /// Plaintext at the path, ref at the sibling `*Ref` path; the ref wins.
    SiblingRef,
}

/// Shape the provider must return for this target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedResolvedValue {
    String,
    StringOrObject,
}

impl ExpectedResolvedValue {
    /// Post-resolution check applied to every assignment.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.as_str().is_some_and(|s| !s.is_empty()),
            Self::StringOrObject => {
                value.as_str().is_some_and(|s| !s.is_empty()) || value.is_object()
            }
        }
    }
}

/// Extra per-field gate layered on the shared account-inheritance model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldGate {
    None,
    /// Telegram botToken is inactivated by a configured `tokenFile`.
    TelegramBotToken,
    /// Telegram webhookSecret needs a non-empty `webhookUrl` (inherited).
    TelegramWebhookSecret,
    /// Slack signingSecret needs `mode == "http"` (inherited).
    SlackSigningSecret,
    /// Nested sub-surface (e.g. discord pluralkit) gated by its own
    /// `enabled` flag at the named sub-path.
    SubSurface(&'static [&'static str]),
}

/// Activeness rule the resolver applies to this entry's hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceRule {
    Always,
    /// Inactive when the owning object's `enabled` flag is literally false.
    EnabledSibling,
    /// Active only when `gateway.auth.mode == "password"`.
    GatewayAuthPassword,
    /// Active when remote mode is configured and no local auth secret would
    /// take effect.
    GatewayRemoteSecret,
    /// Channel field following the shared account-inheritance model.
    ChannelField {
        channel: &'static str,
        field_path: &'static [&'static str],
        gate: FieldGate,
        account_level: bool,
    },
    /// `agents.defaults.memorySearch.remote.apiKey`: inactive when every
    /// enabled agent overrides it.
    AgentMemorySearchDefaults,
    /// Per-agent memory-search key: active when the agent is enabled.
    AgentMemorySearchAgent,
    /// Web-search child provider: inherits `tools.webSearch.enabled`, plus
    /// its own `enabled` flag.
    WebSearchProvider,
}

/// Declarative registry row. Compiled into a [`TargetEntry`] at startup.
struct TargetSpec {
    id: &'static str,
    target_type: &'static str,
    aliases: &'static [&'static str],
    config_file: ConfigFileScope,
    path_pattern: &'static str,
    ref_path_pattern: Option<&'static str>,
    secret_shape: SecretShape,
    expected: ExpectedResolvedValue,
    provider_id_segment: Option<usize>,
    account_id_segment: Option<usize>,
    auth_profile_type: Option<&'static str>,
    include_in_plan: bool,
    include_in_configure: bool,
    include_in_audit: bool,
    track_provider_shadowing: bool,
    surface: SurfaceRule,
}

/// A compiled registry entry.
#[derive(Debug)]
pub struct TargetEntry {
    pub id: &'static str,
    pub target_type: &'static str,
    pub aliases: &'static [&'static str],
    pub config_file: ConfigFileScope,
    pub path_tokens: Vec<PathToken>,
    pub ref_path_tokens: Option<Vec<PathToken>>,
    pub secret_shape: SecretShape,
    pub expected: ExpectedResolvedValue,
    pub provider_id_segment: Option<usize>,
    pub account_id_segment: Option<usize>,
    pub auth_profile_type: Option<&'static str>,
    pub include_in_plan: bool,
    pub include_in_configure: bool,
    pub include_in_audit: bool,
    pub track_provider_shadowing: bool,
    pub surface: SurfaceRule,
}

/// One target found in a concrete tree.
#[derive(Debug, Clone)]
pub struct DiscoveredTarget {
    pub entry: Arc<TargetEntry>,
    pub path: String,
    pub path_segments: Vec<String>,
    pub captures: Vec<String>,
    pub ref_path: Option<String>,
    pub ref_path_segments: Option<Vec<String>>,
    /// Value at the target path; absent when only the sibling ref exists.
    pub value: Option<Value>,
    /// Value at the sibling ref path, when the entry declares one.
    pub ref_value: Option<Value>,
    pub provider_id: Option<String>,
    pub account_id: Option<String>,
}

/// A plan target resolved against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedPlanTarget {
    pub entry: Arc<TargetEntry>,
    pub path_segments: Vec<String>,
    pub captures: Vec<String>,
    pub ref_path_segments: Option<Vec<String>>,
    pub provider_id: Option<String>,
    pub account_id: Option<String>,
}

/// Compiled registry with lookup indices.
pub struct TargetRegistry {
    entries: Vec<Arc<TargetEntry>>,
    by_type: HashMap<&'static str, Arc<TargetEntry>>,
    main_by_id: HashMap<&'static str, Arc<TargetEntry>>,
    auth_by_id: HashMap<&'static str, Arc<TargetEntry>>,
}

/// Provider ids are compared case-insensitively after trimming.
pub fn normalize_provider_id(id: &str) -> String {
    id.trim().to_lowercase()
}

const fn channel_top(
    channel: &'static str,
    field_path: &'static [&'static str],
    gate: FieldGate,
) -> SurfaceRule {
    SurfaceRule::ChannelField {
        channel,
        field_path,
        gate,
        account_level: false,
    }
}

const fn channel_account(
    channel: &'static str,
    field_path: &'static [&'static str],
    gate: FieldGate,
) -> SurfaceRule {
    SurfaceRule::ChannelField {
        channel,
        field_path,
        gate,
        account_level: true,
    }
}

impl TargetSpec {
    /// Baseline for table rows: `secret_input` shape, string-valued,
    /// included everywhere, no id extraction. Rows override with struct
    /// update syntax; the `id`/`target_type`/`path_pattern`/`surface`
    /// placeholders here are always overridden (the registry unit tests
    /// would trip on the empty ids otherwise).
    const fn defaults() -> Self {
        Self {
            id: "",
            target_type: "",
            aliases: &[],
            config_file: ConfigFileScope::Main,
            path_pattern: "",
            ref_path_pattern: None,
            secret_shape: SecretShape::SecretInput,
            expected: ExpectedResolvedValue::String,
            provider_id_segment: None,
            account_id_segment: None,
            auth_profile_type: None,
            include_in_plan: true,
            include_in_configure: true,
            include_in_audit: true,
            track_provider_shadowing: false,
            surface: SurfaceRule::Always,
        }
    }
}

macro_rules! spec {
    ($($field:ident : $value:expr),* $(,)?) => {
        TargetSpec {
            $($field: $value,)*
            ..TargetSpec::defaults()
        }
    };
}

fn specs() -> Vec<TargetSpec> {
    vec![
        spec! {
            id: "talk.apiKey",
            target_type: "talk.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "talk.apiKey",
            surface: SurfaceRule::Always,
        },
        spec! {
            id: "models.providers.apiKey",
            target_type: "models.provider.apiKey",
            aliases: &["model-provider.apiKey"],
            config_file: ConfigFileScope::Main,
            path_pattern: "models.providers.*.apiKey",
            provider_id_segment: Some(2),
            track_provider_shadowing: true,
            surface: SurfaceRule::EnabledSibling,
        },
        spec! {
            id: "gateway.auth.password",
            target_type: "gateway.auth.password",
            config_file: ConfigFileScope::Main,
            path_pattern: "gateway.auth.password",
            surface: SurfaceRule::GatewayAuthPassword,
        },
        spec! {
            id: "gateway.remote.token",
            target_type: "gateway.remote.token",
            config_file: ConfigFileScope::Main,
            path_pattern: "gateway.remote.token",
            surface: SurfaceRule::GatewayRemoteSecret,
        },
        spec! {
            id: "gateway.remote.password",
            target_type: "gateway.remote.password",
            config_file: ConfigFileScope::Main,
            path_pattern: "gateway.remote.password",
            surface: SurfaceRule::GatewayRemoteSecret,
        },
        // Telegram
        spec! {
            id: "channels.telegram.botToken",
            target_type: "telegram.botToken",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.telegram.botToken",
            surface: channel_top("telegram", &["botToken"], FieldGate::TelegramBotToken),
        },
        spec! {
            id: "channels.telegram.accounts.botToken",
            target_type: "telegram.account.botToken",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.telegram.accounts.*.botToken",
            account_id_segment: Some(3),
            surface: channel_account("telegram", &["botToken"], FieldGate::TelegramBotToken),
        },
        spec! {
            id: "channels.telegram.webhookSecret",
            target_type: "telegram.webhookSecret",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.telegram.webhookSecret",
            surface: channel_top("telegram", &["webhookSecret"], FieldGate::TelegramWebhookSecret),
        },
        spec! {
            id: "channels.telegram.accounts.webhookSecret",
            target_type: "telegram.account.webhookSecret",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.telegram.accounts.*.webhookSecret",
            account_id_segment: Some(3),
            surface: channel_account(
                "telegram",
                &["webhookSecret"],
                FieldGate::TelegramWebhookSecret,
            ),
        },
        // Slack
        spec! {
            id: "channels.slack.botToken",
            target_type: "slack.botToken",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.slack.botToken",
            surface: channel_top("slack", &["botToken"], FieldGate::None),
        },
        spec! {
            id: "channels.slack.accounts.botToken",
            target_type: "slack.account.botToken",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.slack.accounts.*.botToken",
            account_id_segment: Some(3),
            surface: channel_account("slack", &["botToken"], FieldGate::None),
        },
        spec! {
            id: "channels.slack.appToken",
            target_type: "slack.appToken",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.slack.appToken",
            surface: channel_top("slack", &["appToken"], FieldGate::None),
        },
        spec! {
            id: "channels.slack.accounts.appToken",
            target_type: "slack.account.appToken",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.slack.accounts.*.appToken",
            account_id_segment: Some(3),
            surface: channel_account("slack", &["appToken"], FieldGate::None),
        },
        spec! {
            id: "channels.slack.signingSecret",
            target_type: "slack.signingSecret",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.slack.signingSecret",
            surface: channel_top("slack", &["signingSecret"], FieldGate::SlackSigningSecret),
        },
        spec! {
            id: "channels.slack.accounts.signingSecret",
            target_type: "slack.account.signingSecret",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.slack.accounts.*.signingSecret",
            account_id_segment: Some(3),
            surface: channel_account("slack", &["signingSecret"], FieldGate::SlackSigningSecret),
        },
        // Discord
        spec! {
            id: "channels.discord.token",
            target_type: "discord.token",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.token",
            surface: channel_top("discord", &["token"], FieldGate::None),
        },
        spec! {
            id: "channels.discord.accounts.token",
            target_type: "discord.account.token",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.accounts.*.token",
            account_id_segment: Some(3),
            surface: channel_account("discord", &["token"], FieldGate::None),
        },
        spec! {
            id: "channels.discord.pluralkit.token",
            target_type: "discord.pluralkit.token",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.pluralkit.token",
            surface: channel_top(
                "discord",
                &["pluralkit", "token"],
                FieldGate::SubSurface(&["pluralkit"]),
            ),
        },
        spec! {
            id: "channels.discord.accounts.pluralkit.token",
            target_type: "discord.account.pluralkit.token",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.accounts.*.pluralkit.token",
            account_id_segment: Some(3),
            surface: channel_account(
                "discord",
                &["pluralkit", "token"],
                FieldGate::SubSurface(&["pluralkit"]),
            ),
        },
        spec! {
            id: "channels.discord.voice.tts.elevenlabs.apiKey",
            target_type: "discord.voice.tts.elevenlabs.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.voice.tts.elevenlabs.apiKey",
            surface: channel_top(
                "discord",
                &["voice", "tts", "elevenlabs", "apiKey"],
                FieldGate::SubSurface(&["voice", "tts", "elevenlabs"]),
            ),
        },
        spec! {
            id: "channels.discord.accounts.voice.tts.elevenlabs.apiKey",
            target_type: "discord.account.voice.tts.elevenlabs.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.accounts.*.voice.tts.elevenlabs.apiKey",
            account_id_segment: Some(3),
            surface: channel_account(
                "discord",
                &["voice", "tts", "elevenlabs", "apiKey"],
                FieldGate::SubSurface(&["voice", "tts", "elevenlabs"]),
            ),
        },
        spec! {
            id: "channels.discord.voice.tts.openai.apiKey",
            target_type: "discord.voice.tts.openai.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.voice.tts.openai.apiKey",
            surface: channel_top(
                "discord",
                &["voice", "tts", "openai", "apiKey"],
                FieldGate::SubSurface(&["voice", "tts", "openai"]),
            ),
        },
        spec! {
            id: "channels.discord.accounts.voice.tts.openai.apiKey",
            target_type: "discord.account.voice.tts.openai.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.discord.accounts.*.voice.tts.openai.apiKey",
            account_id_segment: Some(3),
            surface: channel_account(
                "discord",
                &["voice", "tts", "openai", "apiKey"],
                FieldGate::SubSurface(&["voice", "tts", "openai"]),
            ),
        },
        // Google Chat (sibling-ref shape)
        spec! {
            id: "channels.googlechat.serviceAccount",
            target_type: "googlechat.serviceAccount",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.googlechat.serviceAccount",
            ref_path_pattern: Some("channels.googlechat.serviceAccountRef"),
            secret_shape: SecretShape::SiblingRef,
            expected: ExpectedResolvedValue::StringOrObject,
            surface: channel_top("googlechat", &["serviceAccount"], FieldGate::None),
        },
        spec! {
            id: "channels.googlechat.accounts.serviceAccount",
            target_type: "googlechat.account.serviceAccount",
            config_file: ConfigFileScope::Main,
            path_pattern: "channels.googlechat.accounts.*.serviceAccount",
            ref_path_pattern: Some("channels.googlechat.accounts.*.serviceAccountRef"),
            secret_shape: SecretShape::SiblingRef,
            expected: ExpectedResolvedValue::StringOrObject,
            account_id_segment: Some(3),
            surface: channel_account("googlechat", &["serviceAccount"], FieldGate::None),
        },
        // Agents
        spec! {
            id: "agents.defaults.memorySearch.remote.apiKey",
            target_type: "agents.defaults.memorySearch.remote.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "agents.defaults.memorySearch.remote.apiKey",
            surface: SurfaceRule::AgentMemorySearchDefaults,
        },
        spec! {
            id: "agents.list.memorySearch.remote.apiKey",
            target_type: "agents.agent.memorySearch.remote.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "agents.list[].memorySearch.remote.apiKey",
            surface: SurfaceRule::AgentMemorySearchAgent,
        },
        // Tools
        spec! {
            id: "tools.webSearch.providers.apiKey",
            target_type: "tools.webSearch.provider.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "tools.webSearch.providers.*.apiKey",
            surface: SurfaceRule::WebSearchProvider,
        },
        // Skills
        spec! {
            id: "skills.entries.apiKey",
            target_type: "skills.entry.apiKey",
            config_file: ConfigFileScope::Main,
            path_pattern: "skills.entries.*.apiKey",
            surface: SurfaceRule::EnabledSibling,
        },
        // Auth-profile stores
        spec! {
            id: "auth-profiles.api_key.key",
            target_type: "auth-profiles.api_key.key",
            config_file: ConfigFileScope::AuthProfile,
            path_pattern: "profiles.*.key",
            ref_path_pattern: Some("profiles.*.keyRef"),
            secret_shape: SecretShape::SiblingRef,
            auth_profile_type: Some("api_key"),
            track_provider_shadowing: true,
            surface: SurfaceRule::Always,
        },
        spec! {
            id: "auth-profiles.token.token",
            target_type: "auth-profiles.token.token",
            config_file: ConfigFileScope::AuthProfile,
            path_pattern: "profiles.*.token",
            ref_path_pattern: Some("profiles.*.tokenRef"),
            secret_shape: SecretShape::SiblingRef,
            auth_profile_type: Some("token"),
            track_provider_shadowing: true,
            surface: SurfaceRule::Always,
        },
    ]
}

impl TargetRegistry {
    /// Compile the static table. Pure; fails only on a malformed table,
    /// which the registry unit tests rule out.
    pub fn compile() -> Result<Self, PathError> {
        let mut entries = Vec::new();
        let mut by_type = HashMap::new();
        let mut main_by_id = HashMap::new();
        let mut auth_by_id = HashMap::new();

        for spec in specs() {
            let path_tokens = parse_path_pattern(spec.path_pattern)?;
            let ref_path_tokens = spec
                .ref_path_pattern
                .map(parse_path_pattern)
                .transpose()?;
            let entry = Arc::new(TargetEntry {
                id: spec.id,
                target_type: spec.target_type,
                aliases: spec.aliases,
                config_file: spec.config_file,
                path_tokens,
                ref_path_tokens,
                secret_shape: spec.secret_shape,
                expected: spec.expected,
                provider_id_segment: spec.provider_id_segment,
                account_id_segment: spec.account_id_segment,
                auth_profile_type: spec.auth_profile_type,
                include_in_plan: spec.include_in_plan,
                include_in_configure: spec.include_in_configure,
                include_in_audit: spec.include_in_audit,
                track_provider_shadowing: spec.track_provider_shadowing,
                surface: spec.surface,
            });

            by_type.insert(entry.target_type, Arc::clone(&entry));
            for alias in entry.aliases {
                by_type.insert(alias, Arc::clone(&entry));
            }
            match entry.config_file {
                ConfigFileScope::Main => {
                    main_by_id.insert(entry.id, Arc::clone(&entry));
                }
                ConfigFileScope::AuthProfile => {
                    auth_by_id.insert(entry.id, Arc::clone(&entry));
                }
            }
            entries.push(entry);
        }

        Ok(Self {
            entries,
            by_type,
            main_by_id,
            auth_by_id,
        })
    }

    pub fn entries(&self) -> &[Arc<TargetEntry>] {
        &self.entries
    }

    pub fn is_known_secret_target_type(&self, target_type: &str) -> bool {
        self.by_type.contains_key(target_type)
    }

    pub fn is_known_secret_target_id(&self, id: &str) -> bool {
        self.main_by_id.contains_key(id) || self.auth_by_id.contains_key(id)
    }

    pub fn entry_by_type(&self, target_type: &str) -> Option<&Arc<TargetEntry>> {
        self.by_type.get(target_type)
    }

    pub fn main_entry_by_id(&self, id: &str) -> Option<&Arc<TargetEntry>> {
        self.main_by_id.get(id)
    }

    pub fn auth_entry_by_id(&self, id: &str) -> Option<&Arc<TargetEntry>> {
        self.auth_by_id.get(id)
    }

    /// Resolve a plan target against the registry: look the type up, match
    /// the path, extract provider/account ids from the path, and materialize
    /// the sibling-ref path when the entry declares one.
    ///
    /// Returns `None` when the type is unknown, the path does not match the
    /// registered pattern, or a caller-supplied provider/account id
    /// disagrees with the one the path carries.
    pub fn resolve_plan_target(
        &self,
        target_type: &str,
        path_segments: &[String],
        provider_id: Option<&str>,
        account_id: Option<&str>,
    ) -> Option<ResolvedPlanTarget> {
        let entry = self.by_type.get(target_type)?;
        let captures = match_tokens(&entry.path_tokens, path_segments)?;

        let extracted_provider = entry
            .provider_id_segment
            .and_then(|i| path_segments.get(i).cloned());
        if let (Some(supplied), Some(extracted)) = (provider_id, extracted_provider.as_deref()) {
            if normalize_provider_id(supplied) != normalize_provider_id(extracted) {
                return None;
            }
        }
        let extracted_account = entry
            .account_id_segment
            .and_then(|i| path_segments.get(i).cloned());
        if let (Some(supplied), Some(extracted)) = (account_id, extracted_account.as_deref()) {
            if supplied != extracted {
                return None;
            }
        }

        let ref_path_segments = match &entry.ref_path_tokens {
            Some(tokens) => Some(materialize(tokens, &captures)?),
            None => None,
        };

        Some(ResolvedPlanTarget {
            entry: Arc::clone(entry),
            path_segments: path_segments.to_vec(),
            captures,
            ref_path_segments,
            provider_id: extracted_provider,
            account_id: extracted_account,
        })
    }

    /// Expand every main-config entry over a config tree.
    pub fn discover_config_secret_targets(
        &self,
        root: &Value,
        filter_ids: Option<&[&str]>,
    ) -> Vec<DiscoveredTarget> {
        self.discover(root, ConfigFileScope::Main, filter_ids)
    }

    /// Expand every auth-profile entry over a store tree.
    pub fn discover_auth_profile_secret_targets(
        &self,
        store: &Value,
        filter_ids: Option<&[&str]>,
    ) -> Vec<DiscoveredTarget> {
        self.discover(store, ConfigFileScope::AuthProfile, filter_ids)
    }

    fn discover(
        &self,
        root: &Value,
        scope: ConfigFileScope,
        filter_ids: Option<&[&str]>,
    ) -> Vec<DiscoveredTarget> {
        let mut seen: HashMap<(&'static str, String), usize> = HashMap::new();
        let mut out: Vec<DiscoveredTarget> = Vec::new();

        for entry in &self.entries {
            if entry.config_file != scope {
                continue;
            }
            if let Some(ids) = filter_ids {
                if !ids.contains(&entry.id) {
                    continue;
                }
            }

            // Hits where the value path exists.
            for hit in expand(&entry.path_tokens, root) {
                push_discovered(
                    &mut out,
                    &mut seen,
                    entry,
                    root,
                    hit.segments,
                    hit.captures,
                    Some(hit.value.clone()),
                );
            }

            // Sibling-ref entries may have a ref with no plaintext beside it;
            // expand the ref pattern too and union by value path.
            if let Some(ref_tokens) = &entry.ref_path_tokens {
                for hit in expand(ref_tokens, root) {
                    let Some(segments) = materialize(&entry.path_tokens, &hit.captures) else {
                        continue;
                    };
                    let value = path::get_path(root, &segments).cloned();
                    push_discovered(
                        &mut out,
                        &mut seen,
                        entry,
                        root,
                        segments,
                        hit.captures,
                        value,
                    );
                }
            }
        }
        out
    }
}

fn push_discovered(
    out: &mut Vec<DiscoveredTarget>,
    seen: &mut HashMap<(&'static str, String), usize>,
    entry: &Arc<TargetEntry>,
    root: &Value,
    segments: Vec<String>,
    captures: Vec<String>,
    value: Option<Value>,
) {
    let path = join_segments(&segments);
    if seen.contains_key(&(entry.id, path.clone())) {
        return;
    }

    let (ref_path, ref_path_segments, ref_value) = match &entry.ref_path_tokens {
        Some(tokens) => match materialize(tokens, &captures) {
            Some(ref_segments) => {
                let rv = path::get_path(root, &ref_segments).cloned();
                (Some(join_segments(&ref_segments)), Some(ref_segments), rv)
            }
            None => (None, None, None),
        },
        None => (None, None, None),
    };

    let provider_id = entry
        .provider_id_segment
        .and_then(|i| segments.get(i).cloned());
    let account_id = entry
        .account_id_segment
        .and_then(|i| segments.get(i).cloned());

    seen.insert((entry.id, path.clone()), out.len());
    out.push(DiscoveredTarget {
        entry: Arc::clone(entry),
        path,
        path_segments: segments,
        captures,
        ref_path,
        ref_path_segments,
        value,
        ref_value,
        provider_id,
        account_id,
    });
}

static REGISTRY: LazyLock<TargetRegistry> = LazyLock::new(|| {
    TargetRegistry::compile().expect("static registry table compiles")
});

/// The process-wide compiled registry.
pub fn registry() -> &'static TargetRegistry {
    &REGISTRY
}
