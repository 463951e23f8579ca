//! The apply engine: project a validated plan over every affected file,
//! preflight the result, then commit all files atomically with best-effort
//! rollback.
//!
//! Nothing is written until the projected state passes a full resolver
//! activation. The commit snapshots every file it is about to replace and
//! restores all of them if any single write fails.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use serde_json::Value;

use crate::config::{load_config, save_config, write_atomic};
use crate::paths::Paths;
use crate::secrets::auth_profiles::{AuthProfileStore, agent_dir_for, agent_refs};
use crate::secrets::env_file::EnvFile;
use crate::secrets::path::{delete_path_strict, set_path_create_strict};
use crate::secrets::plan::{SecretsPlan, ValidatedPlan, ValidatedTarget, validate_plan};
use crate::secrets::providers::{RefFailure, ResolveContext};
use crate::secrets::registry::{ConfigFileScope, SecretShape, normalize_provider_id};
use crate::secrets::resolver::prepare_snapshot;
use crate::secrets::snapshot::AgentStore;
use crate::secrets::{SecretRef, SecretsError};

/// Result of an apply (or dry run).
#[derive(Debug)]
pub struct ApplyOutcome {
    pub changed_files: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub dry_run: bool,
}

/// In-memory projection of the plan over every affected file.
struct Projection {
    next_config: Value,
    config_changed: bool,
    /// Agent dir -> modified store.
    stores: BTreeMap<PathBuf, AuthProfileStore>,
    changed_stores: HashSet<PathBuf>,
    /// `(store file, profile id)` pairs the plan itself wrote; the scrub
    /// pass must not undo them.
    written_profiles: HashSet<(PathBuf, String)>,
    /// Legacy auth files with their projected contents.
    legacy: BTreeMap<PathBuf, Value>,
    changed_legacy: HashSet<PathBuf>,
    /// Plaintext captured from every overwritten location.
    scrubbed_values: HashSet<String>,
    /// Normalized provider ids from provider-tracking main-config targets.
    provider_targets: HashSet<String>,
    warnings: Vec<String>,
}

/// Apply a plan. With `dry_run` the projection and preflight run but no file
/// is written.
pub async fn apply_plan(
    paths: &Paths,
    plan: &SecretsPlan,
    dry_run: bool,
    env_overrides: Option<HashMap<String, String>>,
) -> Result<ApplyOutcome, SecretsError> {
    let validated = validate_plan(plan)?;

    let config = load_config(&paths.config_file())?;
    let mut projection = Projection {
        next_config: config.clone(),
        config_changed: false,
        stores: BTreeMap::new(),
        changed_stores: HashSet::new(),
        written_profiles: HashSet::new(),
        legacy: BTreeMap::new(),
        changed_legacy: HashSet::new(),
        scrubbed_values: HashSet::new(),
        provider_targets: HashSet::new(),
        warnings: Vec::new(),
    };

    apply_provider_edits(&mut projection, &validated)?;
    for target in &validated.targets {
        apply_target(&mut projection, paths, target)?;
    }
    if validated.options.scrub_auth_profiles_for_provider_targets {
        scrub_auth_profiles(&mut projection, paths)?;
    }
    if validated.options.scrub_legacy_auth_json {
        scrub_legacy_stores(&mut projection, paths);
    }
    let env_patch = if validated.options.scrub_env {
        project_env_scrub(&projection, paths)
    } else {
        None
    };

    preflight(&projection, paths, &validated, env_overrides).await?;

    let mut writes: Vec<(PathBuf, String)> = Vec::new();
    if projection.config_changed {
        // The main config goes through its standard writer below; listed
        // here only for the changed-file report and rollback bookkeeping.
        writes.push((
            paths.config_file(),
            serde_json::to_string_pretty(&projection.next_config)
                .expect("config tree serializes"),
        ));
    }
    for dir in &projection.changed_stores {
        let store = &projection.stores[dir];
        writes.push((store.file_path(), store.render()));
    }
    for dir_file in &projection.changed_legacy {
        let tree = &projection.legacy[dir_file];
        writes.push((
            dir_file.clone(),
            serde_json::to_string_pretty(tree).expect("legacy tree serializes"),
        ));
    }
    if let Some((env_path, contents)) = env_patch {
        writes.push((env_path, contents));
    }

    let changed_files: Vec<PathBuf> = writes.iter().map(|(p, _)| p.clone()).collect();
    if dry_run {
        return Ok(ApplyOutcome {
            changed_files,
            warnings: projection.warnings,
            dry_run: true,
        });
    }

    commit(paths, &projection, &writes)?;
    Ok(ApplyOutcome {
        changed_files,
        warnings: projection.warnings,
        dry_run: false,
    })
}

fn apply_provider_edits(
    projection: &mut Projection,
    validated: &ValidatedPlan,
) -> Result<(), SecretsError> {
    if validated.provider_upserts.is_empty() && validated.provider_deletes.is_empty() {
        return Ok(());
    }
    for (alias, config) in &validated.provider_upserts {
        let value = serde_json::to_value(config).expect("provider config serializes");
        let segments = vec![
            "secrets".to_string(),
            "providers".to_string(),
            alias.clone(),
        ];
        if set_path_create_strict(&mut projection.next_config, &segments, value)? {
            projection.config_changed = true;
        }
    }
    for alias in &validated.provider_deletes {
        let segments = vec![
            "secrets".to_string(),
            "providers".to_string(),
            alias.clone(),
        ];
        if delete_path_strict(&mut projection.next_config, &segments)? {
            projection.config_changed = true;
        }
    }
    Ok(())
}

fn ref_value(secret_ref: &SecretRef) -> Value {
    serde_json::to_value(secret_ref).expect("ref serializes")
}

fn capture_plaintext(scrubbed: &mut HashSet<String>, prior: Option<&Value>) {
    if let Some(s) = prior.and_then(Value::as_str) {
        if !s.trim().is_empty() {
            scrubbed.insert(s.to_string());
        }
    }
}

fn apply_target(
    projection: &mut Projection,
    paths: &Paths,
    target: &ValidatedTarget,
) -> Result<(), SecretsError> {
    match target.resolved.entry.config_file {
        ConfigFileScope::Main => apply_config_target(projection, target),
        ConfigFileScope::AuthProfile => apply_auth_profile_target(projection, paths, target),
    }
}

fn apply_config_target(
    projection: &mut Projection,
    target: &ValidatedTarget,
) -> Result<(), SecretsError> {
    let prior = crate::secrets::path::get_path(&projection.next_config, &target.path_segments)
        .cloned();
    capture_plaintext(&mut projection.scrubbed_values, prior.as_ref());

    match target.resolved.entry.secret_shape {
        SecretShape::SecretInput => {
            if set_path_create_strict(
                &mut projection.next_config,
                &target.path_segments,
                ref_value(&target.target.secret_ref),
            )? {
                projection.config_changed = true;
            }
        }
        SecretShape::SiblingRef => {
            let ref_segments = target
                .resolved
                .ref_path_segments
                .as_ref()
                .expect("sibling_ref entries always carry a ref path");
            if set_path_create_strict(
                &mut projection.next_config,
                ref_segments,
                ref_value(&target.target.secret_ref),
            )? {
                projection.config_changed = true;
            }
            if delete_path_strict(&mut projection.next_config, &target.path_segments)? {
                projection.config_changed = true;
            }
        }
    }

    if target.resolved.entry.track_provider_shadowing {
        if let Some(provider) = target
            .resolved
            .provider_id
            .as_deref()
            .or(target.target.provider_id.as_deref())
        {
            projection
                .provider_targets
                .insert(normalize_provider_id(provider));
        }
    }
    Ok(())
}

fn apply_auth_profile_target(
    projection: &mut Projection,
    paths: &Paths,
    target: &ValidatedTarget,
) -> Result<(), SecretsError> {
    let agent_id = target
        .target
        .agent_id
        .as_deref()
        .expect("validation requires agentId for auth-profile targets");
    let agent_dir = agent_dir_for(&projection.next_config, paths, agent_id);

    if !projection.stores.contains_key(&agent_dir) {
        let store = AuthProfileStore::load(&agent_dir)
            .map_err(|e| SecretsError::PlanInvalid(e.to_string()))?;
        projection.stores.insert(agent_dir.clone(), store);
    }
    let store = projection
        .stores
        .get_mut(&agent_dir)
        .expect("inserted above");

    let profile_id = target
        .path_segments
        .get(1)
        .cloned()
        .ok_or_else(|| SecretsError::PlanInvalid("auth-profile path too short".to_string()))?;
    let profile_type = target
        .resolved
        .entry
        .auth_profile_type
        .expect("auth-profile entries declare a profile type");

    let existing_provider = store
        .profile(&profile_id)
        .and_then(|p| p.get("provider"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let provider = target
        .target
        .auth_profile_provider
        .clone()
        .or(existing_provider)
        .ok_or_else(|| {
            SecretsError::PlanInvalid(format!(
                "authProfileProvider is required to create profile {profile_id}"
            ))
        })?;

    store
        .ensure_profile(&profile_id, profile_type, &provider)
        .map_err(|e| SecretsError::PlanInvalid(e.to_string()))?;

    let prior = crate::secrets::path::get_path(store.tree(), &target.path_segments).cloned();
    capture_plaintext(&mut projection.scrubbed_values, prior.as_ref());

    let ref_segments = target
        .resolved
        .ref_path_segments
        .as_ref()
        .expect("auth-profile entries are sibling_ref");
    set_path_create_strict(
        store.tree_mut(),
        ref_segments,
        ref_value(&target.target.secret_ref),
    )?;
    delete_path_strict(store.tree_mut(), &target.path_segments)?;

    let store_file = store.file_path();
    projection.changed_stores.insert(agent_dir.clone());
    projection
        .written_profiles
        .insert((store_file, profile_id));
    Ok(())
}

/// Strip static and ref credentials from every profile whose provider was
/// migrated to a config-level ref by this plan.
fn scrub_auth_profiles(projection: &mut Projection, paths: &Paths) -> Result<(), SecretsError> {
    if projection.provider_targets.is_empty() {
        return Ok(());
    }
    // Make sure every discoverable agent store is loaded.
    for agent in agent_refs(&projection.next_config, paths) {
        if !projection.stores.contains_key(&agent.dir) {
            match AuthProfileStore::load(&agent.dir) {
                Ok(store) => {
                    projection.stores.insert(agent.dir.clone(), store);
                }
                Err(e) => {
                    projection
                        .warnings
                        .push(format!("skipping unreadable auth-profile store: {e}"));
                }
            }
        }
    }

    let provider_targets = projection.provider_targets.clone();
    let written = projection.written_profiles.clone();
    for (dir, store) in projection.stores.iter_mut() {
        let store_file = store.file_path();
        let Some(profiles) = store
            .tree_mut()
            .get_mut("profiles")
            .and_then(Value::as_object_mut)
        else {
            continue;
        };
        let mut changed = false;
        for (profile_id, profile) in profiles.iter_mut() {
            if written.contains(&(store_file.clone(), profile_id.clone())) {
                continue;
            }
            let Some(obj) = profile.as_object_mut() else { continue };
            let profile_type = obj.get("type").and_then(Value::as_str).unwrap_or("");
            let provider = obj
                .get("provider")
                .and_then(Value::as_str)
                .map(normalize_provider_id)
                .unwrap_or_default();
            if !provider_targets.contains(&provider) {
                continue;
            }
            match profile_type {
                "api_key" | "token" => {
                    for field in ["key", "token"] {
                        if let Some(prior) = obj.remove(field) {
                            if let Some(s) = prior.as_str() {
                                if !s.trim().is_empty() {
                                    projection.scrubbed_values.insert(s.to_string());
                                }
                            }
                            changed = true;
                        }
                    }
                    for field in ["keyRef", "tokenRef"] {
                        if obj.remove(field).is_some() {
                            changed = true;
                        }
                    }
                }
                "oauth" => {
                    projection.warnings.push(format!(
                        "profile {profile_id} holds OAuth credentials for {provider}; \
                         they are not scrubbed and still shadow the config ref"
                    ));
                }
                _ => {}
            }
        }
        if changed {
            projection.changed_stores.insert(dir.clone());
        }
    }
    Ok(())
}

fn scrub_legacy_stores(projection: &mut Projection, paths: &Paths) {
    for agent in agent_refs(&projection.next_config, paths) {
        let path = Paths::legacy_auth_file(&agent.dir);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(mut tree) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let Some(entries) = tree.as_object_mut() else {
            continue;
        };
        let mut changed = false;
        let keys: Vec<String> = entries.keys().cloned().collect();
        for key in keys {
            let is_static_api_key = entries
                .get(&key)
                .is_some_and(|e| e.get("type").and_then(Value::as_str) == Some("api_key"));
            if !is_static_api_key {
                continue;
            }
            if let Some(removed) = entries.remove(&key) {
                if let Some(s) = removed.get("key").and_then(Value::as_str) {
                    if !s.trim().is_empty() {
                        projection.scrubbed_values.insert(s.to_string());
                    }
                }
                changed = true;
            }
        }
        if changed {
            projection.legacy.insert(path.clone(), tree);
            projection.changed_legacy.insert(path);
        }
    }
}

/// Project the `.env` scrub; returns `(path, new contents)` when anything
/// would be removed.
fn project_env_scrub(projection: &Projection, paths: &Paths) -> Option<(PathBuf, String)> {
    if projection.scrubbed_values.is_empty() {
        return None;
    }
    let env_path = paths.env_file();
    let raw = std::fs::read_to_string(&env_path).ok()?;
    let mut parsed = EnvFile::parse(&raw);
    if parsed.scrub_values(&projection.scrubbed_values) {
        Some((env_path, parsed.render()))
    } else {
        None
    }
}

/// Preflight: every plan ref must resolve to the declared shape against the
/// projected config, and a full activation of the projected state must
/// succeed end to end.
async fn preflight(
    projection: &Projection,
    paths: &Paths,
    validated: &ValidatedPlan,
    env_overrides: Option<HashMap<String, String>>,
) -> Result<(), SecretsError> {
    let ctx = ResolveContext::from_config(&projection.next_config, env_overrides.clone())?;

    let refs: Vec<SecretRef> = validated
        .targets
        .iter()
        .map(|t| t.target.secret_ref.clone())
        .collect();
    let results = ctx.resolve_refs(&refs).await;
    for target in &validated.targets {
        let key = target.target.secret_ref.ref_key();
        match results.get(&key) {
            Some(Ok(value)) if target.resolved.entry.expected.accepts(value) => {}
            Some(Ok(_)) => {
                return Err(SecretsError::ShapeMismatch {
                    path: target.target.path.clone(),
                    message: format!("preflight: {key} resolved to the wrong shape"),
                });
            }
            Some(Err(RefFailure::ProviderScoped(m))) | Some(Err(RefFailure::PerRef(m))) => {
                return Err(SecretsError::ref_resolution(
                    key,
                    format!("preflight failed for {}: {m}", target.target.path),
                ));
            }
            None => {
                return Err(SecretsError::ref_resolution(key, "preflight: not resolved"));
            }
        }
    }

    // Full activation against the projected files.
    let mut stores = Vec::new();
    for agent in agent_refs(&projection.next_config, paths) {
        let tree = match projection.stores.get(&agent.dir) {
            Some(store) => store.tree().clone(),
            None => AuthProfileStore::load(&agent.dir)
                .map_err(|e| SecretsError::ConfigInvalid(e.to_string()))?
                .tree()
                .clone(),
        };
        stores.push(AgentStore { agent, tree });
    }
    let ctx = ResolveContext::from_config(&projection.next_config, env_overrides)?;
    prepare_snapshot(&projection.next_config, stores, &ctx).await?;
    Ok(())
}

/// Commit all writes. The first failure triggers a best-effort restore of
/// every file already replaced, then surfaces the original error.
fn commit(
    paths: &Paths,
    projection: &Projection,
    writes: &[(PathBuf, String)],
) -> Result<(), SecretsError> {
    let mut pre_images: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::new();
    for (path, _) in writes {
        let pre = match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(SecretsError::ApplyIo {
                    path: path.clone(),
                    source,
                });
            }
        };
        pre_images.push((path.clone(), pre));
    }

    let mut written = 0usize;
    let mut failure: Option<(PathBuf, std::io::Error)> = None;
    for (path, contents) in writes {
        let result = if *path == paths.config_file() {
            save_config(path, &projection.next_config).map_err(|e| match e {
                crate::config::ConfigIoError::Write { source, .. } => source,
                other => std::io::Error::other(other.to_string()),
            })
        } else {
            write_atomic(path, contents.as_bytes())
        };
        match result {
            Ok(()) => written += 1,
            Err(source) => {
                failure = Some((path.clone(), source));
                break;
            }
        }
    }

    if let Some((failed_path, source)) = failure {
        for (path, pre) in pre_images.iter().take(written) {
            let restore = match pre {
                Some(bytes) => write_atomic(path, bytes),
                None => match std::fs::remove_file(path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
            };
            if let Err(e) = restore {
                tracing::error!(path = %path.display(), error = %e, "rollback write failed");
            }
        }
        return Err(SecretsError::ApplyIo {
            path: failed_path,
            source,
        });
    }
    Ok(())
}
