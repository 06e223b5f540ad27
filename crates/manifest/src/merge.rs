//! Deep merge of a partial override onto the baseline manifest value.

use serde_json::Value;

/// Merge `patch` onto `base`, producing a new value. Objects merge
/// recursively; arrays and scalars replace wholesale. Neither input is
/// mutated.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, patch_value) in patch_map {
                match merged.get(key) {
                    Some(base_value) if base_value.is_object() && patch_value.is_object() => {
                        merged.insert(key.clone(), deep_merge(base_value, patch_value));
                    }
                    _ => {
                        merged.insert(key.clone(), patch_value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
