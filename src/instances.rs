//! Instance Loading - fold by id across roots, then apply class defaults
//!
//! Documents without an `id` belong to the reserved `global` record. Later
//! roots override earlier ones field by field, never record by record.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::classes::{ClassDefinition, ClassName, RESERVED_CLASS_FIELDS};
use crate::document::{Provenance, SourceDocument};
use crate::error::{BuildError, ParseError, Result};
use crate::merge::{layer, merge_value, strip_directives};
use crate::validation::ValidationIssue;

pub const GLOBAL_ID: &str = "global";

/// One entry of an instance's `build` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildDirective {
    pub template: String,
    /// `None` for a bare template reference; the planner derives a name.
    pub filename: Option<String>,
}

impl BuildDirective {
    pub fn bare(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            filename: None,
        }
    }

    pub fn named(template: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            filename: Some(filename.into()),
        }
    }

    fn to_value(&self) -> Value {
        match &self.filename {
            None => Value::String(self.template.clone()),
            Some(filename) => {
                let mut map = Map::new();
                map.insert(self.template.clone(), Value::String(filename.clone()));
                Value::Object(map)
            }
        }
    }
}

/// Parse a `build` list. Each entry is a template key or a
/// `{templateKey: filename}` mapping (one directive per pair).
pub fn parse_build_directives(value: &Value) -> std::result::Result<Vec<BuildDirective>, String> {
    let Value::Array(entries) = value else {
        return Err("`build` must be an array".to_string());
    };
    let mut directives = Vec::new();
    for entry in entries {
        match entry {
            Value::String(template) => directives.push(BuildDirective::bare(template.clone())),
            Value::Object(pairs) => {
                for (template, filename) in pairs {
                    let Value::String(filename) = filename else {
                        return Err(format!("build filename for `{template}` must be a string"));
                    };
                    directives.push(BuildDirective::named(template.clone(), filename.clone()));
                }
            }
            other => return Err(format!("unsupported build entry: {other}")),
        }
    }
    Ok(directives)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub class_ref: Option<ClassName>,
    pub properties: Map<String, Value>,
    pub build: Vec<BuildDirective>,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class_ref: None,
            properties: Map::new(),
            build: Vec::new(),
        }
    }

    pub fn empty_global() -> Self {
        Self::new(GLOBAL_ID)
    }

    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_ID
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.properties.get(field)
    }

    /// Split a merged document into the envelope and the owned fields.
    pub fn from_document(id: String, mut doc: Map<String, Value>) -> Result<Self> {
        doc.remove("id");
        let class_ref = match doc.remove("class") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name),
            Some(other) => {
                return Err(BuildError::Merge(format!("instance `{id}` has non-string class {other}")));
            }
        };
        let build = match doc.remove("build") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => parse_build_directives(&value)
                .map_err(|reason| BuildError::Merge(format!("instance `{id}`: {reason}")))?,
        };
        Ok(Self {
            id,
            class_ref,
            properties: doc,
            build,
        })
    }

    /// The instance in its document form: `{id, class?, build?, ...fields}`.
    pub fn to_document(&self) -> Value {
        let mut doc = self.properties.clone();
        doc.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(class) = &self.class_ref {
            doc.insert("class".to_string(), Value::String(class.clone()));
        }
        if !self.build.is_empty() {
            doc.insert(
                "build".to_string(),
                Value::Array(self.build.iter().map(BuildDirective::to_value).collect()),
            );
        }
        Value::Object(doc)
    }
}

impl Serialize for Instance {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.to_document() {
            Value::Object(doc) => {
                let mut map = serializer.serialize_map(Some(doc.len()))?;
                for (key, value) in &doc {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            other => other.serialize(serializer),
        }
    }
}

/// Result of folding instance documents, before class defaults.
#[derive(Debug, Clone, Default)]
pub struct FoldedInstances {
    pub global: Map<String, Value>,
    pub records: BTreeMap<String, Map<String, Value>>,
    /// Side table: every document that contributed to an id, in fold order.
    pub provenance: BTreeMap<String, Vec<Provenance>>,
}

fn document_id(doc: &SourceDocument) -> Result<String> {
    let Value::Object(body) = &doc.value else {
        return Err(ParseError::invalid(&doc.provenance.path, "instance document must be an object").into());
    };
    match body.get("id") {
        None | Some(Value::Null) => Ok(GLOBAL_ID.to_string()),
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(_) => Err(ParseError::invalid(&doc.provenance.path, "`id` must be a non-empty string").into()),
    }
}

/// Fold documents (already in root order, then scan order) by id.
pub fn fold_instances(documents: &[SourceDocument]) -> Result<FoldedInstances> {
    let mut folded = FoldedInstances::default();
    for doc in documents {
        let id = document_id(doc)?;
        let target = if id == GLOBAL_ID {
            &mut folded.global
        } else {
            folded.records.entry(id.clone()).or_default()
        };
        let merged = layer(&Value::Object(std::mem::take(target)), &doc.value);
        if let Value::Object(map) = merged {
            *target = map;
        }
        folded.provenance.entry(id).or_default().push(doc.provenance.clone());
    }
    Ok(folded)
}

/// Apply resolved class defaults onto one instance document.
///
/// A schema-required field the instance lacks is never filled from defaults;
/// it is reported here and left for validation to surface. Required fields
/// the instance does carry merge like any other.
pub fn apply_class_defaults(
    id: &str,
    doc: &mut Map<String, Value>,
    class: &ClassDefinition,
) -> Vec<ValidationIssue> {
    let required = class.required_fields();
    let mut issues = Vec::new();

    for field in &required {
        if !doc.contains_key(*field) {
            let message = format!("instance `{id}` is missing required field `{field}` of class `{}`", class.name);
            log::warn!("{message}");
            issues.push(
                ValidationIssue::warn("required-before-defaults", message)
                    .with_class(&class.name)
                    .with_instance(id)
                    .with_path(field),
            );
        }
    }

    for (field, default) in &class.properties {
        if RESERVED_CLASS_FIELDS.contains(&field.as_str())
            || default.is_null()
            || (required.contains(&field.as_str()) && !doc.contains_key(field))
        {
            continue;
        }
        let value = merge_value(default, doc.get(field));
        doc.insert(field.clone(), value);
    }
    issues
}

#[derive(Debug, Clone, Default)]
pub struct LoadedInstances {
    /// Global first, then the rest sorted by id.
    pub instances: Vec<Instance>,
    pub provenance: BTreeMap<String, Vec<Provenance>>,
    pub warnings: Vec<ValidationIssue>,
}

/// Fold, apply class defaults and split every record into an `Instance`.
pub fn load_instances(
    documents: &[SourceDocument],
    classes: &BTreeMap<ClassName, ClassDefinition>,
) -> Result<LoadedInstances> {
    let folded = fold_instances(documents)?;
    let mut warnings = Vec::new();
    let mut instances = Vec::with_capacity(folded.records.len() + 1);

    let records = std::iter::once((GLOBAL_ID.to_string(), folded.global)).chain(folded.records);
    for (id, mut doc) in records {
        let class_name = doc.get("class").and_then(Value::as_str).map(str::to_string);
        if let Some(name) = class_name {
            match classes.get(&name) {
                Some(class) => warnings.extend(apply_class_defaults(&id, &mut doc, class)),
                None => {
                    let message = format!("instance `{id}` references unknown class `{name}`");
                    log::warn!("{message}");
                    let mut issue = ValidationIssue::warn("unknown-class", message)
                        .with_class(&name)
                        .with_instance(&id);
                    if let Some(last) = folded.provenance.get(&id).and_then(|p| p.last()) {
                        issue = issue.with_file(&last.path);
                    }
                    warnings.push(issue);
                }
            }
        }
        let doc = match strip_directives(&Value::Object(doc)) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        instances.push(Instance::from_document(id, doc)?);
    }

    log::info!("loaded {} instance(s) including global", instances.len());
    Ok(LoadedInstances {
        instances,
        provenance: folded.provenance,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn doc(root_index: usize, path: &str, value: Value) -> SourceDocument {
        SourceDocument {
            provenance: Provenance {
                root_index,
                path: PathBuf::from(path),
            },
            value,
        }
    }

    fn class(name: &str, properties: Value, schema: Option<Value>) -> ClassDefinition {
        let mut class = ClassDefinition::new(name);
        class.properties = properties.as_object().cloned().unwrap_or_default();
        class.schema = schema;
        class
    }

    #[test]
    fn test_later_root_wins_per_field() {
        let docs = vec![
            doc(0, "r1/i1.json", json!({"id": "i1", "x": 1, "y": 2})),
            doc(1, "r2/i1.json", json!({"id": "i1", "y": 3})),
        ];
        let loaded = load_instances(&docs, &BTreeMap::new()).unwrap();
        let i1 = loaded.instances.iter().find(|i| i.id == "i1").unwrap();
        assert_eq!(Value::Object(i1.properties.clone()), json!({"x": 1, "y": 3}));
        assert_eq!(loaded.provenance["i1"].len(), 2);
    }

    #[test]
    fn test_idless_documents_fold_into_global() {
        let docs = vec![
            doc(0, "r1/site.json", json!({"title": "one", "nav": ["a"]})),
            doc(0, "r1/page.json", json!({"id": "page"})),
            doc(1, "r2/site.json", json!({"title": "two", "nav": ["b"]})),
        ];
        let loaded = load_instances(&docs, &BTreeMap::new()).unwrap();
        let global = &loaded.instances[0];
        assert!(global.is_global());
        assert_eq!(global.get("title"), Some(&json!("two")));
        assert_eq!(global.get("nav"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_global_always_present_and_first() {
        let docs = vec![
            doc(0, "b.json", json!({"id": "b"})),
            doc(0, "a.json", json!({"id": "a"})),
        ];
        let loaded = load_instances(&docs, &BTreeMap::new()).unwrap();
        let ids: Vec<&str> = loaded.instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["global", "a", "b"]);
    }

    #[test]
    fn test_required_field_never_filled() {
        let mut classes = BTreeMap::new();
        classes.insert(
            "post".to_string(),
            class(
                "post",
                json!({"f": "fallback", "layout": "default"}),
                Some(json!({"required": ["f"]})),
            ),
        );
        let docs = vec![doc(0, "i1.json", json!({"id": "i1", "class": "post"}))];
        let loaded = load_instances(&docs, &classes).unwrap();
        let i1 = &loaded.instances[1];
        assert!(i1.get("f").is_none());
        assert_eq!(i1.get("layout"), Some(&json!("default")));
        assert_eq!(loaded.warnings.len(), 1);
        assert_eq!(loaded.warnings[0].code, "required-before-defaults");
    }

    #[test]
    fn test_defaults_merge_with_instance_values() {
        let mut defaults = class(
            "page",
            json!({"tags": ["site"], "meta": {"lang": "en", "robots": "index"}, "nothing": null, "id": "x"}),
            None,
        );
        defaults.parents = vec!["base".to_string()];
        let mut doc = json!({"tags": ["news"], "meta": {"robots": "noindex"}})
            .as_object()
            .cloned()
            .unwrap();
        let issues = apply_class_defaults("p", &mut doc, &defaults);
        assert!(issues.is_empty());
        assert_eq!(doc["tags"], json!(["site", "news"]));
        assert_eq!(doc["meta"], json!({"lang": "en", "robots": "noindex"}));
        assert!(!doc.contains_key("nothing"));
        assert!(!doc.contains_key("id"));
    }

    #[test]
    fn test_required_fields_present_still_merge_defaults() {
        let defaults = class(
            "page",
            json!({"tags": ["site"], "meta": {"lang": "en"}, "title": "Untitled"}),
            Some(json!({"type": "object", "required": ["tags", "meta", "title"]})),
        );
        let mut doc = json!({"tags": ["news"], "meta": {"robots": "noindex"}})
            .as_object()
            .cloned()
            .unwrap();
        let issues = apply_class_defaults("p", &mut doc, &defaults);

        assert_eq!(doc["tags"], json!(["site", "news"]));
        assert_eq!(doc["meta"], json!({"lang": "en", "robots": "noindex"}));
        // only the absent required field stays unfilled
        assert!(!doc.contains_key("title"));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path.as_deref(), Some("title"));
    }

    #[test]
    fn test_reset_replaces_class_default() {
        let mut classes = BTreeMap::new();
        classes.insert("post".to_string(), class("post", json!({"tags": ["a"], "nav": ["n"]}), None));
        let docs = vec![
            doc(0, "r1/p.json", json!({"id": "p", "class": "post", "tags": {"$reset": true, "value": ["x"]}})),
            doc(1, "r2/p.json", json!({"id": "p", "tags": ["y"], "nav": ["m"]})),
        ];
        let loaded = load_instances(&docs, &classes).unwrap();
        let p = loaded.instances.iter().find(|i| i.id == "p").unwrap();
        assert_eq!(p.get("tags"), Some(&json!(["x", "y"])));
        assert_eq!(p.get("nav"), Some(&json!(["n", "m"])));
    }

    #[test]
    fn test_unknown_class_is_warning() {
        let docs = vec![doc(0, "i.json", json!({"id": "i", "class": "ghost", "x": 1}))];
        let loaded = load_instances(&docs, &BTreeMap::new()).unwrap();
        assert_eq!(loaded.instances[1].class_ref.as_deref(), Some("ghost"));
        assert_eq!(loaded.warnings[0].code, "unknown-class");
        assert_eq!(loaded.warnings[0].file.as_deref(), Some("i.json"));
    }

    #[test]
    fn test_build_directives_parse() {
        let directives =
            parse_build_directives(&json!(["pages/post.html", {"feeds/rss": "/feed.xml", "x": "y"}])).unwrap();
        assert_eq!(
            directives,
            vec![
                BuildDirective::bare("pages/post.html"),
                BuildDirective::named("feeds/rss", "/feed.xml"),
                BuildDirective::named("x", "y"),
            ]
        );
        assert!(parse_build_directives(&json!("nope")).is_err());
        assert!(parse_build_directives(&json!([1])).is_err());
    }

    #[test]
    fn test_document_form_round_trips_envelope() {
        let mut doc = json!({"id": "i", "class": "post", "build": ["t"], "title": "x"})
            .as_object()
            .cloned()
            .unwrap();
        doc.remove("id");
        let instance = Instance::from_document("i".to_string(), doc).unwrap();
        assert_eq!(instance.class_ref.as_deref(), Some("post"));
        assert_eq!(instance.build, vec![BuildDirective::bare("t")]);
        assert_eq!(
            instance.to_document(),
            json!({"id": "i", "class": "post", "build": ["t"], "title": "x"})
        );
    }

    #[test]
    fn test_non_string_id_is_parse_error() {
        let docs = vec![doc(0, "bad.json", json!({"id": 7}))];
        assert!(matches!(fold_instances(&docs).unwrap_err(), BuildError::Parse(_)));
    }
}
