//! Deterministic JSON encoding and content hashing.
//!
//! The manifest signature and the audit hash chain both require that the
//! same logical value always serializes to the same byte string, so object
//! keys are sorted lexicographically at every level — never rely on map
//! iteration order. Arrays preserve declaration order.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Serialize a JSON value canonically: objects with lexicographically
/// sorted keys, arrays in order, strings JSON-escaped, numbers as JSON
/// numerics.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json escapes exactly the way we want for scalars
            out.push_str(&serde_json::to_string(s).expect("string serialization"));
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("key serialization"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of `data`, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

/// HMAC-SHA-256 of `data` under `secret`, hex-encoded.
pub fn hmac_sha256_hex(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(data);
    hex_encode(&mac.finalize().into_bytes())
}

/// Hash the canonical encoding of `value`. HMAC mode when a secret is
/// supplied, plain SHA-256 otherwise.
pub fn content_hash(value: &Value, secret: Option<&str>) -> String {
    let canonical = canonical_json(value);
    match secret {
        Some(s) => hmac_sha256_hex(s.as_bytes(), canonical.as_bytes()),
        None => sha256_hex(canonical.as_bytes()),
    }
}

/// A signature string in the `sha256-<hex>` form used by the manifest.
pub fn signature(value: &Value, secret: Option<&str>) -> String {
    format!("sha256-{}", content_hash(value, secret))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
