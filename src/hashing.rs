//! Content Hashing - snapshot and output digests
//!
//! Identical sources give an identical content hash regardless of when or
//! where the build ran. Object keys are ordered, array order is kept.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::classes::ClassDefinition;
use crate::instances::Instance;

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Serialize `value` with every object's keys in byte order.
pub fn canonical_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value).map(canonicalize)
}

/// Compact canonical JSON text of `value`.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&canonical_value(value)?)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> = map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(ordered.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        scalar => scalar,
    }
}

/// Hash of the merged model: classes in name order, instances in snapshot
/// order.
pub fn compute_content_hash<'a>(
    classes: impl IntoIterator<Item = &'a ClassDefinition>,
    instances: &[Instance],
) -> Result<String, serde_json::Error> {
    let classes: Vec<&ClassDefinition> = classes.into_iter().collect();
    let payload = json!({
        "classes": serde_json::to_value(&classes)?,
        "instances": serde_json::to_value(instances)?,
    });
    Ok(sha256_hex(canonical_json(&payload)?.as_bytes()))
}
