//! Channel-specific helpers used by the secrets-aware outbound path.
//!
//! Each channel has a small normalizer that turns a user-supplied target
//! into the canonical peer plus the `from`/`to` session identifiers. Tlon is
//! the representative implementation; the other channels follow its shape.

pub mod tlon;
