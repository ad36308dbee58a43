use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identifier of one side-effecting operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Hash `{operation, request}` into a key.
    ///
    /// The request is serialized to JSON, `null` members are dropped and
    /// object keys are written in sorted order, so two requests that differ
    /// only in field order or in absent-vs-null optionals share a key.
    pub fn derive<T: Serialize>(operation: &str, request: &T) -> Result<Self, serde_json::Error> {
        let request = serde_json::to_value(request)?;
        let envelope = serde_json::json!({
            "operation": operation,
            "request": request,
        });

        let mut canonical = String::new();
        write_canonical(&envelope, &mut canonical)?;

        let digest = Sha256::digest(canonical.as_bytes());
        Ok(Self(hex::encode(digest)))
    }

    /// Key supplied by the caller (e.g. a client sequence id), namespaced by
    /// operation and scope so the same client id on two wallets never collides.
    pub fn from_client(operation: &str, scope: &str, client_key: &str) -> Self {
        Self(format!("{}:{}:{}", operation, scope, client_key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
