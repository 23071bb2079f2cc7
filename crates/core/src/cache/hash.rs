//! Query fingerprint generation for the search cache.

use sha2::{Digest, Sha256};

/// Compute the fingerprint of a `(query, provider, parameters)` triple.
///
/// The query is trimmed and lower-cased so cosmetic differences share an
/// entry. Parameters are hashed in canonical form (object keys sorted at
/// every level), so parameter order does not affect the result.
pub fn compute_query_fingerprint(query: &str, provider: &str, params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(provider.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(params).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
