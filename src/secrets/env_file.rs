//! `.env` parsing for audit and scrubbing.
//!
//! The parser is deliberately conservative: it understands blank lines,
//! comments, optional `export ` prefixes, and `KEY=VALUE` pairs with
//! single- or double-quoted values. Any line it does not understand is kept
//! verbatim and never rewritten.

use std::collections::HashSet;

/// Environment variables the gateway treats as secrets. Only these are
/// candidates for audit findings and plan scrubbing.
pub const KNOWN_SECRET_ENV_VARS: &[&str] = &[
    "TALK_API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "GROK_API_KEY",
    "KIMI_API_KEY",
    "PERPLEXITY_API_KEY",
    "ELEVENLABS_API_KEY",
    "TELEGRAM_BOT_TOKEN",
    "TELEGRAM_WEBHOOK_SECRET",
    "SLACK_BOT_TOKEN",
    "SLACK_APP_TOKEN",
    "SLACK_SIGNING_SECRET",
    "DISCORD_BOT_TOKEN",
    "PLURALKIT_TOKEN",
    "GATEWAY_PASSWORD",
    "GATEWAY_REMOTE_TOKEN",
];

/// Whether a variable name is in the known-secret list.
pub fn is_known_secret_env_var(name: &str) -> bool {
    KNOWN_SECRET_ENV_VARS.contains(&name)
}

#[derive(Debug, Clone)]
enum EnvLine {
    /// Comment, blank, or anything the parser does not understand.
    Raw(String),
    Pair {
        raw: String,
        key: String,
        value: String,
    },
}

/// A parsed `.env` file that can be scrubbed and re-rendered.
#[derive(Debug, Clone)]
pub struct EnvFile {
    lines: Vec<EnvLine>,
}

impl EnvFile {
    pub fn parse(text: &str) -> Self {
        let lines = text.lines().map(parse_line).collect();
        Self { lines }
    }

    /// `(key, value)` pairs for every line the parser understood.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| match line {
            EnvLine::Pair { key, value, .. } => Some((key.as_str(), value.as_str())),
            EnvLine::Raw(_) => None,
        })
    }

    /// Drop every pair whose key is a known secret name and whose parsed
    /// value is in `scrubbed_values`. Returns whether anything was removed.
    pub fn scrub_values(&mut self, scrubbed_values: &HashSet<String>) -> bool {
        let before = self.lines.len();
        self.lines.retain(|line| match line {
            EnvLine::Pair { key, value, .. } => {
                !(is_known_secret_env_var(key) && scrubbed_values.contains(value))
            }
            EnvLine::Raw(_) => true,
        });
        self.lines.len() != before
    }

    /// Render back to text. Lines end with `\n`; an empty file renders empty.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                EnvLine::Raw(raw) | EnvLine::Pair { raw, .. } => {
                    out.push_str(raw);
                    out.push('\n');
                }
            }
        }
        out
    }
}

fn parse_line(raw: &str) -> EnvLine {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return EnvLine::Raw(raw.to_string());
    }
    let body = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let Some(eq) = body.find('=') else {
        return EnvLine::Raw(raw.to_string());
    };
    let key = body[..eq].trim();
    if key.is_empty() || !is_plausible_var_name(key) {
        return EnvLine::Raw(raw.to_string());
    }
    let value = unquote(body[eq + 1..].trim());
    EnvLine::Pair {
        raw: raw.to_string(),
        key: key.to_string(),
        value,
    }
}

fn is_plausible_var_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    (bytes[0].is_ascii_alphabetic() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_preserves_raw_lines() {
        let text = "# secrets\nTELEGRAM_BOT_TOKEN=abc123\nexport SLACK_BOT_TOKEN=\"xoxb-1\"\nnot a pair line\nEMPTY=\n";
        let file = EnvFile::parse(text);
        let entries: Vec<_> = file.entries().collect();
        assert_eq!(
            entries,
            vec![
                ("TELEGRAM_BOT_TOKEN", "abc123"),
                ("SLACK_BOT_TOKEN", "xoxb-1"),
                ("EMPTY", ""),
            ]
        );
        assert_eq!(file.render(), text);
    }

    #[test]
    fn scrub_removes_only_known_exact_matches() {
        let text = "TELEGRAM_BOT_TOKEN=tok\nSLACK_BOT_TOKEN=keep\nRANDOM_VAR=tok\n";
        let mut file = EnvFile::parse(text);
        let mut values = HashSet::new();
        values.insert("tok".to_string());

        assert!(file.scrub_values(&values));
        let rendered = file.render();
        assert!(!rendered.contains("TELEGRAM_BOT_TOKEN"));
        assert!(rendered.contains("SLACK_BOT_TOKEN=keep"));
        // Unknown names are never scrubbed even on a value match.
        assert!(rendered.contains("RANDOM_VAR=tok"));
    }

    #[test]
    fn scrub_matches_unquoted_value() {
        let mut file = EnvFile::parse("SLACK_SIGNING_SECRET='sss'\n");
        let mut values = HashSet::new();
        values.insert("sss".to_string());
        assert!(file.scrub_values(&values));
        assert_eq!(file.render(), "");
    }

    #[test]
    fn no_match_is_no_change() {
        let mut file = EnvFile::parse("SLACK_BOT_TOKEN=a\n");
        assert!(!file.scrub_values(&HashSet::new()));
    }
}
