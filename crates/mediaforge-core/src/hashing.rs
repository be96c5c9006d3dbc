//! Canonical JSON and content fingerprints.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically: object keys sorted, no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, to_canonical_json(v))).collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// Hex SHA-256 of the canonical form of `value`.
pub fn fingerprint(value: &Value) -> String {
    let digest = Sha256::digest(to_canonical_json(value).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
