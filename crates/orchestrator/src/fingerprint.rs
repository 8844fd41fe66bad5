//! Deterministic fingerprints over engine inputs.
//!
//! Inputs are rendered to canonical JSON (object keys sorted at every depth,
//! no whitespace) and hashed with SHA-256 together with the engine name. The
//! result depends only on values, never on map insertion order or process
//! state, so keys stay valid across restarts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Namespace prefix for every fingerprint entry in the backing store.
pub const KEY_PREFIX: &str = "fp:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// `fp:<engine>:<sha256 of engine + canonical inputs>`
    pub fn compute(engine: &str, inputs: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(engine.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(inputs).as_bytes());
        let digest = hasher.finalize();

        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("{}{hex}", engine_prefix(engine)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Prefix shared by every key of one engine. Registered names never contain
/// `:`, so no engine's prefix covers another's keys.
pub fn engine_prefix(engine: &str) -> String {
    format!("{KEY_PREFIX}{engine}:")
}

/// Compact JSON with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn key_order_does_not_change_the_fingerprint() {
        let mut forward = Map::new();
        forward.insert("destination".into(), json!("Lisbon"));
        forward.insert("days".into(), json!(3));
        let mut backward = Map::new();
        backward.insert("days".into(), json!(3));
        backward.insert("destination".into(), json!("Lisbon"));

        let a = json!({ "request": Value::Object(forward) });
        let b = json!({ "request": Value::Object(backward) });
        assert_eq!(CacheKey::compute("nlp", &a), CacheKey::compute("nlp", &b));
    }

    #[test]
    fn engine_name_and_values_are_part_of_the_key() {
        let inputs = json!({ "days": 3 });
        assert_ne!(CacheKey::compute("nlp", &inputs), CacheKey::compute("budget", &inputs));
        assert_ne!(
            CacheKey::compute("nlp", &inputs),
            CacheKey::compute("nlp", &json!({ "days": 4 }))
        );
    }

    #[test]
    fn key_is_stable_and_namespaced() {
        let key = CacheKey::compute("nlp", &json!({ "text": "3 days in Lisbon" }));
        assert!(key.as_str().starts_with("fp:nlp:"));
        assert_eq!(key.as_str().len(), "fp:nlp:".len() + 64);
        assert_eq!(key, CacheKey::compute("nlp", &json!({ "text": "3 days in Lisbon" })));
    }

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let value = json!({ "b": [ { "z": 1, "a": null } ], "a": "x\"y" });
        assert_eq!(canonical_json(&value), r#"{"a":"x\"y","b":[{"a":null,"z":1}]}"#);
    }
}
