//! Structured audit log with secret redaction.
//!
//! Every skill invocation, model call, and MCP action emits one entry.
//! Redaction happens when the entry is built, before any sink sees it, and
//! the same value pass is applied to stream tokens at publish time so
//! secret-shaped strings never ride the bus in plaintext.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Keys whose values are always masked regardless of content.
const REDACT_KEYS: &[&str] = &[
    "token",
    "bot_token",
    "password",
    "secret",
    "api_key",
    "apikey",
    "authorization",
    "cookie",
];

const MASK: &str = "[REDACTED]";

/// One audit record. `args` is already redacted by construction.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub args: Value,
    pub outcome: String,
    pub duration_ms: u64,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        args: &Value,
        outcome: impl Into<String>,
        duration: std::time::Duration,
    ) -> Self {
        Self {
            ts: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            args: redact_value(args),
            outcome: outcome.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Emit this entry on the dedicated audit target.
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(line) => tracing::info!(target: "audit", "{line}"),
            Err(e) => tracing::warn!(target: "audit", "unserializable audit entry: {e}"),
        }
    }
}

/// Record an action in one call.
pub fn audit(
    actor: &str,
    action: &str,
    args: &Value,
    outcome: &str,
    duration: std::time::Duration,
) {
    AuditEntry::new(actor, action, args, outcome, duration).emit();
}

fn key_is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    REDACT_KEYS.iter().any(|k| lower.contains(k))
}

/// Whether a bare string looks like a credential.
fn value_is_secret_shaped(s: &str) -> bool {
    // Provider API keys.
    if s.starts_with("sk-") && s.len() > 12 {
        return true;
    }
    // Bearer headers pasted whole.
    if s.len() > 16 && s.to_ascii_lowercase().starts_with("bearer ") {
        return true;
    }
    // Telegram bot tokens: <digits>:<35 url-safe chars>.
    if let Some((head, tail)) = s.split_once(':') {
        if head.len() >= 6
            && head.chars().all(|c| c.is_ascii_digit())
            && tail.len() >= 30
            && tail
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return true;
        }
    }
    false
}

/// Recursively mask sensitive keys and secret-shaped values.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if key_is_sensitive(k) {
                        (k.clone(), Value::String(MASK.into()))
                    } else {
                        (k.clone(), redact_value(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(s) if value_is_secret_shaped(s) => Value::String(MASK.into()),
        other => other.clone(),
    }
}

/// Mask secret-shaped substrings in free text (stream tokens, reply text).
/// Only whole whitespace-separated words are considered; the pass is
/// idempotent.
pub fn redact_text(text: &str) -> String {
    if !text.contains("sk-") && !text.contains(':') {
        return text.to_string();
    }
    text.split_inclusive(char::is_whitespace)
        .map(|word| {
            let trimmed = word.trim_end();
            if value_is_secret_shaped(trimmed) {
                let ws = &word[trimmed.len()..];
                format!("{MASK}{ws}")
            } else {
                word.to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_masked() {
        let args = json!({"api_key": "sk-123456789012345", "path": "a.txt"});
        let red = redact_value(&args);
        assert_eq!(red["api_key"], MASK);
        assert_eq!(red["path"], "a.txt");
    }

    #[test]
    fn nested_values_masked() {
        let args = json!({"outer": {"authorization": "Bearer abc", "n": 1}});
        let red = redact_value(&args);
        assert_eq!(red["outer"]["authorization"], MASK);
        assert_eq!(red["outer"]["n"], 1);
    }

    #[test]
    fn secret_shaped_strings_masked_anywhere() {
        let args = json!({"note": "sk-abcdefghijklmnop"});
        let red = redact_value(&args);
        assert_eq!(red["note"], MASK);
    }

    #[test]
    fn bot_token_shape_masked_in_text() {
        let token = "123456789:AAF_abcdefghijklmnopqrstuvwxyz012345";
        let text = format!("use {token} please");
        let red = redact_text(&text);
        assert!(!red.contains(token));
        assert!(red.contains(MASK));
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(redact_text("hello world"), "hello world");
        assert_eq!(redact_text("12:30 lunch"), "12:30 lunch");
    }
}
