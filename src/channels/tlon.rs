//! Tlon outbound target normalization.
//!
//! User input for an outbound session can name a peer in several ways:
//! a ship (`~sampel-palnet`, with or without the sigil), a `dm:` prefix, a
//! `group:` prefix, a fully-qualified `chat/...` channel, or a bare
//! `host/channel` pair. All of them normalize to one peer plus the
//! canonical `from`/`to` session ids.

use serde::Serialize;

/// Peer kind on the Tlon network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlonPeerKind {
    Direct,
    Group,
}

/// A normalized peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlonPeer {
    pub kind: TlonPeerKind,
    pub id: String,
}

/// A normalized outbound session target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlonOutbound {
    pub peer: TlonPeer,
    pub from: String,
    pub to: String,
}

/// A ship id is any non-empty token; a leading `~` is prepended if missing.
fn normalize_ship(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "~" {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix('~') {
        Some(format!("~{rest}"))
    } else {
        Some(format!("~{trimmed}"))
    }
}

fn direct(ship: String) -> TlonOutbound {
    let session = format!("tlon:{ship}");
    TlonOutbound {
        peer: TlonPeer {
            kind: TlonPeerKind::Direct,
            id: ship,
        },
        from: session.clone(),
        to: session,
    }
}

fn group(id: String) -> TlonOutbound {
    TlonOutbound {
        from: format!("tlon:group:{id}"),
        to: format!("tlon:{id}"),
        peer: TlonPeer {
            kind: TlonPeerKind::Group,
            id,
        },
    }
}

/// Canonical group id for a `host/channel` pair: `chat/~host/channel`.
fn group_from_pair(pair: &str) -> Option<String> {
    let (host, channel) = pair.split_once('/')?;
    let host = normalize_ship(host)?;
    let channel = channel.trim();
    if channel.is_empty() {
        return None;
    }
    Some(format!("chat/{host}/{channel}"))
}

/// Normalize an outbound target. Returns `None` for blank or unusable
/// input.
pub fn normalize_outbound_target(target: &str) -> Option<TlonOutbound> {
    let trimmed = target.trim();
    let body = trimmed.strip_prefix("tlon:").unwrap_or(trimmed).trim();
    if body.is_empty() {
        return None;
    }

    if let Some(ship) = body.strip_prefix("dm:") {
        return normalize_ship(ship).map(direct);
    }

    if let Some(rest) = body.strip_prefix("group:") {
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }
        if rest.starts_with("chat/") {
            return Some(group(rest.to_string()));
        }
        if rest.contains('/') {
            return group_from_pair(rest).map(group);
        }
        // Opaque group handle, passed through as-is.
        return Some(group(rest.to_string()));
    }

    if body.starts_with("chat/") {
        return Some(group(body.to_string()));
    }
    if body.contains('/') {
        return group_from_pair(body).map(group);
    }

    normalize_ship(body).map(direct)
}
