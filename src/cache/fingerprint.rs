use blake3::Hasher;
use serde_json::{Map, Value};
use std::fmt;

/// Deterministic cache key for one operation and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash of the tool name and the canonical form of `params`.
    pub fn of(tool: &str, params: &Value) -> Self {
        let canonical = canonicalize(params);
        let mut hasher = Hasher::new();
        hasher.update(tool.as_bytes());
        hasher.update(&[0]);
        // Value's Display is compact JSON
        hasher.update(canonical.to_string().as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object keys sorted, nulls dropped, strings trimmed.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                let item = &map[key];
                if item.is_null() {
                    continue;
                }
                out.insert(key.clone(), canonicalize(item));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Number(n) => match n.as_f64() {
            // 10 and 10.0 address the same slot
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Value::from(f as i64)
            }
            _ => value.clone(),
        },
        other => other.clone(),
    }
}
