//! Deep Merge Engine
//!
//! Arrays append, mappings merge key by key, everything else is replaced.
//! A reset directive `{"$reset": true, "value": [...]}` replaces instead of
//! appending.

use serde_json::{Map, Value};

pub const RESET_KEY: &str = "$reset";
pub const RESET_VALUE_KEY: &str = "value";

/// Tagged view of a document value. The merge engine dispatches on this
/// rather than probing the raw JSON at every step.
#[derive(Debug, Clone, Copy)]
pub enum Shape<'a> {
    Scalar(&'a Value),
    List(&'a Vec<Value>),
    Map(&'a Map<String, Value>),
    /// Reset directive; `None` when the directive carries no `value`.
    Reset(Option<&'a Value>),
}

impl<'a> Shape<'a> {
    pub fn of(value: &'a Value) -> Self {
        match value {
            Value::Array(items) => Shape::List(items),
            Value::Object(map) if is_reset(map) => Shape::Reset(map.get(RESET_VALUE_KEY)),
            Value::Object(map) => Shape::Map(map),
            other => Shape::Scalar(other),
        }
    }
}

fn is_reset(map: &Map<String, Value>) -> bool {
    map.get(RESET_KEY) == Some(&Value::Bool(true))
}

pub fn is_reset_directive(value: &Value) -> bool {
    matches!(Shape::of(value), Shape::Reset(_))
}

/// Merge `overlay` onto `base`. Pure; neither input is modified.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (Shape::of(base), Shape::of(overlay)) {
        (Shape::List(left), Shape::List(right)) => {
            let mut items = Vec::with_capacity(left.len() + right.len());
            items.extend(left.iter().cloned());
            items.extend(right.iter().map(materialize));
            Value::Array(items)
        }
        (Shape::Map(left), Shape::Map(right)) => Value::Object(merge_maps(left, right)),
        (_, Shape::Reset(value)) => unwrap_reset(value),
        _ => materialize(overlay),
    }
}

/// Merge two mappings; shared keys recurse, keys only in `overlay` are added.
pub fn merge_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match base.get(key) {
            Some(existing) => merge(existing, value),
            None => materialize(value),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Single-field variant used for class defaults: the instance value wins
/// ties, arrays append unless reset, mappings deep-merge.
pub fn merge_value(class_default: &Value, instance_value: Option<&Value>) -> Value {
    match instance_value {
        None => materialize(class_default),
        Some(value) => merge(class_default, value),
    }
}

/// Fold-stage merge: same rules as `merge`, but reset directives survive so
/// they still apply against layers merged underneath later (class parents,
/// class defaults). A directive followed by a plain array stays a directive
/// with the array appended to its value.
pub fn layer(base: &Value, overlay: &Value) -> Value {
    match (Shape::of(base), Shape::of(overlay)) {
        (Shape::List(left), Shape::List(right)) => {
            Value::Array(left.iter().chain(right.iter()).cloned().collect())
        }
        (Shape::Map(left), Shape::Map(right)) => {
            let mut merged = left.clone();
            for (key, value) in right {
                let next = match left.get(key) {
                    Some(existing) => layer(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Shape::Reset(kept), Shape::List(right)) => {
            let mut items: Vec<Value> = kept.and_then(Value::as_array).cloned().unwrap_or_default();
            items.extend(right.iter().cloned());
            let mut directive = Map::new();
            directive.insert(RESET_KEY.to_string(), Value::Bool(true));
            directive.insert(RESET_VALUE_KEY.to_string(), Value::Array(items));
            Value::Object(directive)
        }
        _ => overlay.clone(),
    }
}

/// Remove every reset directive left in a fully layered value.
pub fn strip_directives(value: &Value) -> Value {
    materialize(value)
}

fn unwrap_reset(value: Option<&Value>) -> Value {
    match value {
        Some(value) => materialize(value),
        None => Value::Array(Vec::new()),
    }
}

/// Strip reset directives from a value that has nothing underneath it, so
/// directive markers never reach the merged model.
fn materialize(value: &Value) -> Value {
    match Shape::of(value) {
        Shape::Reset(inner) => unwrap_reset(inner),
        Shape::Map(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), materialize(value)))
                .collect(),
        ),
        Shape::List(_) | Shape::Scalar(_) => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arrays_append() {
        let merged = merge(&json!({"a": [1, 2]}), &json!({"a": [3]}));
        assert_eq!(merged, json!({"a": [1, 2, 3]}));
    }

    #[test]
    fn test_append_keeps_duplicates() {
        let merged = merge(&json!([1, 2]), &json!([2, 1]));
        assert_eq!(merged, json!([1, 2, 2, 1]));
    }

    #[test]
    fn test_reset_replaces_array() {
        let merged = merge(
            &json!({"a": [1, 2]}),
            &json!({"a": {"$reset": true, "value": [9]}}),
        );
        assert_eq!(merged, json!({"a": [9]}));
    }

    #[test]
    fn test_reset_without_value_empties() {
        let merged = merge(&json!({"a": [1, 2]}), &json!({"a": {"$reset": true}}));
        assert_eq!(merged, json!({"a": []}));
    }

    #[test]
    fn test_reset_on_missing_key_unwraps() {
        let merged = merge(&json!({}), &json!({"tags": {"$reset": true, "value": ["x"]}}));
        assert_eq!(merged, json!({"tags": ["x"]}));
    }

    #[test]
    fn test_reset_false_is_a_plain_mapping() {
        let merged = merge(&json!({"a": {"b": 1}}), &json!({"a": {"$reset": false}}));
        assert_eq!(merged, json!({"a": {"b": 1, "$reset": false}}));
    }

    #[test]
    fn test_disjoint_keys_union() {
        let merged = merge(&json!({"x": 1, "y": 2}), &json!({"y": 3, "z": 4}));
        assert_eq!(merged, json!({"x": 1, "y": 3, "z": 4}));
    }

    #[test]
    fn test_nested_mappings_merge() {
        let merged = merge(
            &json!({"meta": {"title": "a", "tags": ["t1"]}}),
            &json!({"meta": {"tags": ["t2"], "author": "b"}}),
        );
        assert_eq!(
            merged,
            json!({"meta": {"title": "a", "tags": ["t1", "t2"], "author": "b"}})
        );
    }

    #[test]
    fn test_type_mismatch_overrides() {
        assert_eq!(merge(&json!({"a": [1]}), &json!({"a": "s"})), json!({"a": "s"}));
        assert_eq!(merge(&json!({"a": {"b": 1}}), &json!({"a": 5})), json!({"a": 5}));
        assert_eq!(merge(&json!(1), &json!(null)), json!(null));
    }

    #[test]
    fn test_merge_value_prefers_instance() {
        assert_eq!(merge_value(&json!("d"), None), json!("d"));
        assert_eq!(merge_value(&json!("d"), Some(&json!("i"))), json!("i"));
        assert_eq!(merge_value(&json!(["a"]), Some(&json!(["b"]))), json!(["a", "b"]));
        assert_eq!(
            merge_value(&json!({"x": 1, "y": 1}), Some(&json!({"y": 2}))),
            json!({"x": 1, "y": 2})
        );
    }

    #[test]
    fn test_layer_keeps_directive_for_later_merge() {
        let folded = layer(
            &json!({"tags": {"$reset": true, "value": ["x"]}}),
            &json!({"tags": ["y"], "new": {"$reset": true}}),
        );
        assert_eq!(
            folded,
            json!({"tags": {"$reset": true, "value": ["x", "y"]}, "new": {"$reset": true}})
        );
        let applied = merge(&json!({"tags": ["a"], "new": [1]}), &folded);
        assert_eq!(applied, json!({"tags": ["x", "y"], "new": []}));
    }

    #[test]
    fn test_layer_later_reset_wins() {
        let folded = layer(&json!({"a": [1]}), &json!({"a": {"$reset": true, "value": [2]}}));
        assert_eq!(strip_directives(&folded), json!({"a": [2]}));
    }

    #[test]
    fn test_inputs_untouched() {
        let base = json!({"a": [1]});
        let overlay = json!({"a": [2]});
        let _ = merge(&base, &overlay);
        assert_eq!(base, json!({"a": [1]}));
        assert_eq!(overlay, json!({"a": [2]}));
    }
}
