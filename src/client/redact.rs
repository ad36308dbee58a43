//! Redaction of sensitive fields before anything reaches a log line.
//!
//! Matching is by key name only. Anything that cannot be walked safely is
//! replaced wholesale with [`REDACTION_ERROR`].

use serde_json::{Map, Value};
use thiserror::Error;

pub const REDACTED: &str = "[REDACTED]";
pub const REDACTION_ERROR: &str = "[REDACTION_ERROR]";

/// Deepest nesting we are willing to walk.
const MAX_DEPTH: usize = 32;

/// Short names are matched exactly to avoid hitting unrelated keys.
const EXACT_KEYS: &[&str] = &["prv", "otp", "pin", "key", "keychain"];

/// Long names are matched anywhere in the normalized key.
const SUBSTRING_KEYS: &[&str] = &[
    "token",
    "passphrase",
    "password",
    "privatekey",
    "secret",
    "seed",
    "mnemonic",
    "xprv",
    "authorization",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedactionError {
    #[error("Nesting deeper than {0} levels")]
    TooDeep(usize),
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Check a field name against the deny-list.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = normalize_key(key);
    EXACT_KEYS.contains(&normalized.as_str())
        || SUBSTRING_KEYS.iter().any(|s| normalized.contains(s))
}

/// Return a copy of `value` with every sensitive field replaced.
pub fn redact(value: &Value) -> Result<Value, RedactionError> {
    redact_at(value, 0)
}

fn redact_at(value: &Value, depth: usize) -> Result<Value, RedactionError> {
    if depth > MAX_DEPTH {
        return Err(RedactionError::TooDeep(MAX_DEPTH));
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact_at(v, depth + 1)?);
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| redact_at(v, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Render a JSON value for logging. Fails closed.
pub fn redact_for_log(value: &Value) -> String {
    match redact(value) {
        Ok(redacted) => redacted.to_string(),
        Err(_) => REDACTION_ERROR.to_string(),
    }
}

/// Render a raw response body for logging. Non-JSON bodies are never echoed.
pub fn redact_bytes_for_log(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => redact_for_log(&value),
        Err(_) => REDACTION_ERROR.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_key_matching() {
        assert!(is_sensitive_key("walletPassphrase"));
        assert!(is_sensitive_key("access_token"));
        assert!(is_sensitive_key("PRIVATE-KEY"));
        assert!(is_sensitive_key("otp"));
        assert!(is_sensitive_key("prv"));
        assert!(is_sensitive_key("seedPhrase"));

        assert!(!is_sensitive_key("approvals"));
        assert!(!is_sensitive_key("address"));
        assert!(!is_sensitive_key("coin"));
        assert!(!is_sensitive_key("walletId"));
    }

    #[test]
    fn test_redact_nested() {
        let body = json!({
            "walletPassphrase": "hunter2",
            "recipients": [
                {"address": "tb1qxyz", "amount": "1000", "otp": "000000"}
            ],
            "auth": {"accessToken": "v2xabc", "scope": "wallet"}
        });

        let redacted = redact(&body).unwrap();
        assert_eq!(redacted["walletPassphrase"], REDACTED);
        assert_eq!(redacted["recipients"][0]["otp"], REDACTED);
        assert_eq!(redacted["recipients"][0]["address"], "tb1qxyz");
        assert_eq!(redacted["auth"]["accessToken"], REDACTED);
        assert_eq!(redacted["auth"]["scope"], "wallet");

        let line = redact_for_log(&body);
        assert!(!line.contains("hunter2"));
        assert!(!line.contains("v2xabc"));
    }

    #[test]
    fn test_too_deep_fails_closed() {
        let mut value = json!({"passphrase": "leak-me"});
        for _ in 0..(MAX_DEPTH + 5) {
            value = json!({ "inner": value });
        }
        assert_eq!(redact(&value), Err(RedactionError::TooDeep(MAX_DEPTH)));
        assert_eq!(redact_for_log(&value), REDACTION_ERROR);
    }

    #[test]
    fn test_non_json_body_is_not_echoed() {
        assert_eq!(
            redact_bytes_for_log(b"passphrase=hunter2"),
            REDACTION_ERROR
        );
        assert_eq!(redact_bytes_for_log(b""), "");
        assert_eq!(
            redact_bytes_for_log(br#"{"error":"bad","seed":"abc"}"#),
            r#"{"error":"bad","seed":"[REDACTED]"}"#
        );
    }
}
