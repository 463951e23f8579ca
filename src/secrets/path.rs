//! Dot-path engine over JSON-like configuration trees.
//!
//! Patterns are dot-separated token lists. `*` matches any mapping key and
//! captures it; `name[]` matches any index of the array field `name` and
//! captures the index. Everything else is a literal. An array token consumes
//! two concrete segments (the field name and the index), so
//! `agents.list[].memorySearch` matches `agents.list.0.memorySearch`.
//!
//! Mutations are strict: array segments must be non-negative integer strings,
//! and intermediate containers are created only by the `create` variant and
//! only when the container type implied by the next segment agrees with what
//! is already in the tree.

use serde_json::Value;

/// One compiled token of a path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
    /// Exact mapping key (or array index spelled literally).
    Literal(String),
    /// Any mapping key; captures the key.
    Wildcard,
    /// Any index of the named array field; captures the index.
    Array(String),
}

/// Error from pattern compilation or strict mutation.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path pattern is empty")]
    EmptyPattern,

    #[error("array token has no field name in pattern segment {0:?}")]
    EmptyArrayField(String),

    #[error("segment {segment:?} at {path} is not a non-negative array index")]
    BadArrayIndex { path: String, segment: String },

    #[error("array index {index} out of bounds (len {len}) at {path}")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("path {path} does not exist in the tree")]
    PathMissing { path: String },

    #[error("cannot descend into non-container value at {path}")]
    NotAContainer { path: String },

    #[error("existing value at {path} is not the container type the path requires")]
    ContainerMismatch { path: String },
}

/// Compile a dot-path pattern into tokens.
///
/// Splits on `.`, trims each piece, drops empties. A bare `*` is a wildcard;
/// a `name[]` suffix is an array token whose field name must be non-empty.
pub fn parse_path_pattern(pattern: &str) -> Result<Vec<PathToken>, PathError> {
    let mut tokens = Vec::new();
    for raw in pattern.split('.') {
        let piece = raw.trim();
        if piece.is_empty() {
            continue;
        }
        if piece == "*" {
            tokens.push(PathToken::Wildcard);
        } else if let Some(field) = piece.strip_suffix("[]") {
            if field.is_empty() {
                return Err(PathError::EmptyArrayField(piece.to_string()));
            }
            tokens.push(PathToken::Array(field.to_string()));
        } else {
            tokens.push(PathToken::Literal(piece.to_string()));
        }
    }
    if tokens.is_empty() {
        return Err(PathError::EmptyPattern);
    }
    Ok(tokens)
}

/// Split a concrete dot-path into segments (no pattern tokens).
pub fn parse_dot_path(path: &str) -> Vec<String> {
    path.split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join concrete segments back into a dot-path.
pub fn join_segments(segments: &[String]) -> String {
    segments.join(".")
}

/// Number of capturing (wildcard or array) tokens in a pattern.
pub fn dynamic_token_count(tokens: &[PathToken]) -> usize {
    tokens
        .iter()
        .filter(|t| !matches!(t, PathToken::Literal(_)))
        .count()
}

fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Match compiled tokens against a concrete segment list.
///
/// Returns the captured strings (one per dynamic token, in order) or `None`
/// when the segments do not fit the pattern.
pub fn match_tokens(tokens: &[PathToken], segments: &[String]) -> Option<Vec<String>> {
    let mut captures = Vec::new();
    let mut pos = 0usize;
    for token in tokens {
        match token {
            PathToken::Literal(lit) => {
                if segments.get(pos)? != lit {
                    return None;
                }
                pos += 1;
            }
            PathToken::Wildcard => {
                captures.push(segments.get(pos)?.clone());
                pos += 1;
            }
            PathToken::Array(field) => {
                if segments.get(pos)? != field {
                    return None;
                }
                let index = segments.get(pos + 1)?;
                parse_index(index)?;
                captures.push(index.clone());
                pos += 2;
            }
        }
    }
    if pos != segments.len() {
        return None;
    }
    Some(captures)
}

/// Rebuild concrete segments from a pattern and the captures `match_tokens`
/// produced. Returns `None` when the capture count or an index shape is wrong.
pub fn materialize(tokens: &[PathToken], captures: &[String]) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut next = 0usize;
    for token in tokens {
        match token {
            PathToken::Literal(lit) => segments.push(lit.clone()),
            PathToken::Wildcard => {
                segments.push(captures.get(next)?.clone());
                next += 1;
            }
            PathToken::Array(field) => {
                let index = captures.get(next)?;
                parse_index(index)?;
                segments.push(field.clone());
                segments.push(index.clone());
                next += 1;
            }
        }
    }
    if next != captures.len() {
        return None;
    }
    Some(segments)
}

/// One leaf the pattern expansion found in a tree.
#[derive(Debug, Clone)]
pub struct PathHit<'a> {
    pub segments: Vec<String>,
    pub captures: Vec<String>,
    pub value: &'a Value,
}

/// Expand a pattern over a tree, emitting every leaf the tokens reach.
/// Non-container values under a dynamic token are skipped silently.
pub fn expand<'a>(tokens: &[PathToken], tree: &'a Value) -> Vec<PathHit<'a>> {
    let mut hits = Vec::new();
    let mut segments = Vec::new();
    let mut captures = Vec::new();
    walk_expand(tokens, tree, &mut segments, &mut captures, &mut hits);
    hits
}

fn walk_expand<'a>(
    tokens: &[PathToken],
    node: &'a Value,
    segments: &mut Vec<String>,
    captures: &mut Vec<String>,
    hits: &mut Vec<PathHit<'a>>,
) {
    let Some(token) = tokens.first() else {
        hits.push(PathHit {
            segments: segments.clone(),
            captures: captures.clone(),
            value: node,
        });
        return;
    };
    let rest = &tokens[1..];
    match token {
        PathToken::Literal(lit) => {
            if let Some(child) = node.as_object().and_then(|obj| obj.get(lit)) {
                segments.push(lit.clone());
                walk_expand(rest, child, segments, captures, hits);
                segments.pop();
            }
        }
        PathToken::Wildcard => {
            if let Some(obj) = node.as_object() {
                for (key, child) in obj {
                    segments.push(key.clone());
                    captures.push(key.clone());
                    walk_expand(rest, child, segments, captures, hits);
                    captures.pop();
                    segments.pop();
                }
            }
        }
        PathToken::Array(field) => {
            if let Some(arr) = node
                .as_object()
                .and_then(|obj| obj.get(field))
                .and_then(Value::as_array)
            {
                for (index, child) in arr.iter().enumerate() {
                    segments.push(field.clone());
                    segments.push(index.to_string());
                    captures.push(index.to_string());
                    walk_expand(rest, child, segments, captures, hits);
                    captures.pop();
                    segments.pop();
                    segments.pop();
                }
            }
        }
    }
}

/// Read the value at a concrete path. `None` when absent.
pub fn get_path<'a>(tree: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = tree;
    for segment in segments {
        node = match node {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(arr) => arr.get(parse_index(segment)?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn partial_path(segments: &[String], upto: usize) -> String {
    join_segments(&segments[..upto])
}

enum CreateMode {
    Create,
    ExistingOnly,
}

/// Set a value, creating intermediate containers as the segment shapes imply
/// (array when the next segment is numeric, mapping otherwise). Returns
/// whether the tree changed; overwriting a structurally equal value does not
/// count as a change.
pub fn set_path_create_strict(
    tree: &mut Value,
    segments: &[String],
    value: Value,
) -> Result<bool, PathError> {
    set_path(tree, segments, value, CreateMode::Create)
}

/// Set a value at a path that must already exist end to end.
pub fn set_path_existing_strict(
    tree: &mut Value,
    segments: &[String],
    value: Value,
) -> Result<bool, PathError> {
    set_path(tree, segments, value, CreateMode::ExistingOnly)
}

fn set_path(
    tree: &mut Value,
    segments: &[String],
    value: Value,
    mode: CreateMode,
) -> Result<bool, PathError> {
    if segments.is_empty() {
        return Err(PathError::EmptyPattern);
    }
    let mut node = tree;
    for (depth, segment) in segments[..segments.len() - 1].iter().enumerate() {
        let here = || partial_path(segments, depth + 1);
        let next_is_index = parse_index(&segments[depth + 1]).is_some();
        match node {
            Value::Object(obj) => {
                if !obj.contains_key(segment) {
                    match mode {
                        CreateMode::Create => {
                            let empty = if next_is_index {
                                Value::Array(Vec::new())
                            } else {
                                Value::Object(serde_json::Map::new())
                            };
                            obj.insert(segment.clone(), empty);
                        }
                        CreateMode::ExistingOnly => {
                            return Err(PathError::PathMissing { path: here() });
                        }
                    }
                }
                node = obj.get_mut(segment).expect("key ensured above");
            }
            Value::Array(arr) => {
                let index = parse_index(segment).ok_or_else(|| PathError::BadArrayIndex {
                    path: here(),
                    segment: segment.clone(),
                })?;
                let len = arr.len();
                if index >= len {
                    return Err(PathError::IndexOutOfBounds {
                        path: here(),
                        index,
                        len,
                    });
                }
                node = &mut arr[index];
            }
            _ => {
                return Err(PathError::NotAContainer {
                    path: partial_path(segments, depth),
                });
            }
        }
        // The container we landed in must agree with the next segment's shape.
        match (&node, next_is_index) {
            (Value::Array(_), false) => {
                return Err(PathError::ContainerMismatch { path: here() });
            }
            (Value::Object(_) | Value::Array(_), _) => {}
            _ if depth + 1 < segments.len() - 1 => {
                return Err(PathError::NotAContainer { path: here() });
            }
            _ => {}
        }
    }

    let leaf = segments.last().expect("checked non-empty");
    let leaf_path = join_segments(segments);
    match node {
        Value::Object(obj) => {
            if let Some(existing) = obj.get(leaf) {
                if *existing == value {
                    return Ok(false);
                }
            } else if matches!(mode, CreateMode::ExistingOnly) {
                return Err(PathError::PathMissing { path: leaf_path });
            }
            obj.insert(leaf.clone(), value);
            Ok(true)
        }
        Value::Array(arr) => {
            let index = parse_index(leaf).ok_or_else(|| PathError::BadArrayIndex {
                path: leaf_path.clone(),
                segment: leaf.clone(),
            })?;
            let len = arr.len();
            if index < len {
                if arr[index] == value {
                    return Ok(false);
                }
                arr[index] = value;
                Ok(true)
            } else if index == len && matches!(mode, CreateMode::Create) {
                arr.push(value);
                Ok(true)
            } else if matches!(mode, CreateMode::ExistingOnly) {
                Err(PathError::PathMissing { path: leaf_path })
            } else {
                Err(PathError::IndexOutOfBounds {
                    path: leaf_path,
                    index,
                    len,
                })
            }
        }
        _ => Err(PathError::NotAContainer {
            path: partial_path(segments, segments.len() - 1),
        }),
    }
}

/// Delete the value at a path. Array elements are spliced out (indices after
/// the removed element shift down). Returns whether anything was removed; a
/// path that is absent returns `Ok(false)`.
pub fn delete_path_strict(tree: &mut Value, segments: &[String]) -> Result<bool, PathError> {
    if segments.is_empty() {
        return Err(PathError::EmptyPattern);
    }
    let mut node = tree;
    for (depth, segment) in segments[..segments.len() - 1].iter().enumerate() {
        node = match node {
            Value::Object(obj) => match obj.get_mut(segment) {
                Some(child) => child,
                None => return Ok(false),
            },
            Value::Array(arr) => {
                let index = parse_index(segment).ok_or_else(|| PathError::BadArrayIndex {
                    path: partial_path(segments, depth + 1),
                    segment: segment.clone(),
                })?;
                match arr.get_mut(index) {
                    Some(child) => child,
                    None => return Ok(false),
                }
            }
            _ => return Ok(false),
        };
    }

    let leaf = segments.last().expect("checked non-empty");
    match node {
        Value::Object(obj) => Ok(obj.remove(leaf).is_some()),
        Value::Array(arr) => {
            let index = parse_index(leaf).ok_or_else(|| PathError::BadArrayIndex {
                path: join_segments(segments),
                segment: leaf.clone(),
            })?;
            if index < arr.len() {
                arr.remove(index);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seg(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_pattern_tokens() {
        let tokens = parse_path_pattern("channels.telegram.accounts.*.botToken").unwrap();
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[3], PathToken::Wildcard);

        let tokens = parse_path_pattern("agents.list[].memorySearch.remote.apiKey").unwrap();
        assert_eq!(tokens[1], PathToken::Array("list".to_string()));
        assert_eq!(dynamic_token_count(&tokens), 1);
    }

    #[test]
    fn parse_pattern_rejects_bad_shapes() {
        assert!(matches!(parse_path_pattern(""), Err(PathError::EmptyPattern)));
        assert!(matches!(
            parse_path_pattern("a.[]"),
            Err(PathError::EmptyArrayField(_))
        ));
    }

    #[test]
    fn parse_pattern_trims_and_drops_empties() {
        let tokens = parse_path_pattern(" a .. b ").unwrap();
        assert_eq!(
            tokens,
            vec![
                PathToken::Literal("a".to_string()),
                PathToken::Literal("b".to_string())
            ]
        );
    }

    #[test]
    fn match_and_materialize_round_trip() {
        let tokens = parse_path_pattern("channels.*.accounts.*.botToken").unwrap();
        let segments = seg(&["channels", "telegram", "accounts", "work", "botToken"]);
        let captures = match_tokens(&tokens, &segments).unwrap();
        assert_eq!(captures, vec!["telegram", "work"]);
        assert_eq!(materialize(&tokens, &captures).unwrap(), segments);
    }

    #[test]
    fn array_token_round_trip() {
        let tokens = parse_path_pattern("agents.list[].memorySearch.remote.apiKey").unwrap();
        let segments = seg(&["agents", "list", "2", "memorySearch", "remote", "apiKey"]);
        let captures = match_tokens(&tokens, &segments).unwrap();
        assert_eq!(captures, vec!["2"]);
        assert_eq!(materialize(&tokens, &captures).unwrap(), segments);
    }

    #[test]
    fn match_rejects_non_numeric_index() {
        let tokens = parse_path_pattern("agents.list[].name").unwrap();
        assert!(match_tokens(&tokens, &seg(&["agents", "list", "x", "name"])).is_none());
    }

    #[test]
    fn match_rejects_length_mismatch() {
        let tokens = parse_path_pattern("a.b").unwrap();
        assert!(match_tokens(&tokens, &seg(&["a", "b", "c"])).is_none());
        assert!(match_tokens(&tokens, &seg(&["a"])).is_none());
    }

    #[test]
    fn expand_collects_all_leaves() {
        let tree = json!({
            "channels": {
                "telegram": {"accounts": {"work": {"botToken": "t1"}, "home": {"botToken": "t2"}}},
                "slack": {"accounts": {"eng": {"botToken": "t3"}}}
            }
        });
        let tokens = parse_path_pattern("channels.*.accounts.*.botToken").unwrap();
        let hits = expand(&tokens, &tree);
        assert_eq!(hits.len(), 3);
        let mut paths: Vec<String> = hits.iter().map(|h| join_segments(&h.segments)).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                "channels.slack.accounts.eng.botToken",
                "channels.telegram.accounts.home.botToken",
                "channels.telegram.accounts.work.botToken"
            ]
        );
    }

    #[test]
    fn expand_skips_non_containers_silently() {
        let tree = json!({"channels": {"telegram": "oops", "slack": {"botToken": "t"}}});
        let tokens = parse_path_pattern("channels.*.botToken").unwrap();
        let hits = expand(&tokens, &tree);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].captures, vec!["slack"]);
    }

    #[test]
    fn expand_arrays() {
        let tree = json!({"agents": {"list": [
            {"memorySearch": {"remote": {"apiKey": "a"}}},
            {"name": "no-key"},
            {"memorySearch": {"remote": {"apiKey": "b"}}}
        ]}});
        let tokens = parse_path_pattern("agents.list[].memorySearch.remote.apiKey").unwrap();
        let hits = expand(&tokens, &tree);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].captures, vec!["0"]);
        assert_eq!(hits[1].captures, vec!["2"]);
    }

    #[test]
    fn get_path_walks_objects_and_arrays() {
        let tree = json!({"a": {"b": [10, {"c": true}]}});
        assert_eq!(
            get_path(&tree, &seg(&["a", "b", "1", "c"])),
            Some(&json!(true))
        );
        assert_eq!(get_path(&tree, &seg(&["a", "missing"])), None);
        assert_eq!(get_path(&tree, &seg(&["a", "b", "9"])), None);
    }

    #[test]
    fn set_create_builds_intermediates() {
        let mut tree = json!({});
        let changed =
            set_path_create_strict(&mut tree, &seg(&["a", "b", "c"]), json!("v")).unwrap();
        assert!(changed);
        assert_eq!(tree, json!({"a": {"b": {"c": "v"}}}));
    }

    #[test]
    fn set_create_builds_arrays_for_numeric_segments() {
        let mut tree = json!({});
        set_path_create_strict(&mut tree, &seg(&["a", "0", "b"]), json!(1)).unwrap_err();
        // Index 0 into a fresh empty array is out of bounds for intermediate
        // traversal; appending only happens at the leaf.
        let mut tree = json!({"a": []});
        let changed = set_path_create_strict(&mut tree, &seg(&["a", "0"]), json!("x")).unwrap();
        assert!(changed);
        assert_eq!(tree, json!({"a": ["x"]}));
    }

    #[test]
    fn set_unchanged_value_reports_no_change() {
        let mut tree = json!({"a": {"b": "same"}});
        let changed = set_path_create_strict(&mut tree, &seg(&["a", "b"]), json!("same")).unwrap();
        assert!(!changed);
        let changed =
            set_path_existing_strict(&mut tree, &seg(&["a", "b"]), json!("new")).unwrap();
        assert!(changed);
    }

    #[test]
    fn set_existing_requires_full_path() {
        let mut tree = json!({"a": {}});
        let err = set_path_existing_strict(&mut tree, &seg(&["a", "b"]), json!(1)).unwrap_err();
        assert!(matches!(err, PathError::PathMissing { .. }));
        let err = set_path_existing_strict(&mut tree, &seg(&["x", "y"]), json!(1)).unwrap_err();
        assert!(matches!(err, PathError::PathMissing { .. }));
    }

    #[test]
    fn set_rejects_container_mismatch() {
        let mut tree = json!({"a": ["x"]});
        let err = set_path_create_strict(&mut tree, &seg(&["a", "key", "b"]), json!(1)).unwrap_err();
        assert!(matches!(err, PathError::ContainerMismatch { .. }));
    }

    #[test]
    fn delete_compacts_arrays() {
        let mut tree = json!({"a": [1, 2, 3]});
        let changed = delete_path_strict(&mut tree, &seg(&["a", "1"])).unwrap();
        assert!(changed);
        assert_eq!(tree, json!({"a": [1, 3]}));
    }

    #[test]
    fn delete_missing_is_no_change() {
        let mut tree = json!({"a": {"b": 1}});
        assert!(!delete_path_strict(&mut tree, &seg(&["a", "c"])).unwrap());
        assert!(!delete_path_strict(&mut tree, &seg(&["x", "y", "z"])).unwrap());
        assert_eq!(tree, json!({"a": {"b": 1}}));
    }

    #[test]
    fn delete_object_key() {
        let mut tree = json!({"a": {"b": 1, "c": 2}});
        assert!(delete_path_strict(&mut tree, &seg(&["a", "b"])).unwrap());
        assert_eq!(tree, json!({"a": {"c": 2}}));
    }

    // Round-trip invariant: for every hit of expand, matching its segments
    // and re-materializing the captures reproduces the segments.
    #[test]
    fn expand_match_materialize_round_trip() {
        let tree = json!({
            "models": {"providers": {"openai": {"apiKey": "k1"}, "anthropic": {"apiKey": "k2"}}},
            "agents": {"list": [{"memorySearch": {"remote": {"apiKey": "k3"}}}]}
        });
        for pattern in [
            "models.providers.*.apiKey",
            "agents.list[].memorySearch.remote.apiKey",
        ] {
            let tokens = parse_path_pattern(pattern).unwrap();
            for hit in expand(&tokens, &tree) {
                let captures = match_tokens(&tokens, &hit.segments).unwrap();
                assert_eq!(captures, hit.captures);
                assert_eq!(materialize(&tokens, &captures).unwrap(), hit.segments);
            }
        }
    }
}
