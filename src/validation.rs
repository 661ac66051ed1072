//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured issues.
//! Policy (strict mode) decides their level.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::classes::{ClassDefinition, ClassName};
use crate::instances::Instance;
use crate::merge::merge_maps;
use crate::snapshot::CanonicalSnapshot;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static VALIDATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_validation_call_count() -> u32 {
    VALIDATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_validation_call_count() {
    VALIDATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ClassName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Every instance involved when an issue spans several, such as a
    /// collision. `instance` holds the first of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ValidationIssue {
    pub fn new(level: IssueLevel, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            code: code.into(),
            class: None,
            instance: None,
            instances: Vec::new(),
            keyword: None,
            path: None,
            file: None,
        }
    }

    pub fn warn(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(IssueLevel::Warn, code, message)
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(IssueLevel::Error, code, message)
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn with_instance(mut self, instance: &str) -> Self {
        self.instance = Some(instance.to_string());
        self
    }

    pub fn with_instances<I, S>(mut self, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instances = instances.into_iter().map(Into::into).collect();
        if self.instance.is_none() {
            self.instance = self.instances.first().cloned();
        }
        self
    }

    pub fn with_keyword(mut self, keyword: &str) -> Self {
        self.keyword = Some(keyword.to_string());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_file(mut self, file: &Path) -> Self {
        self.file = Some(file.display().to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == IssueLevel::Error
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = ValidationIssue>) {
        self.issues.extend(issues);
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(ValidationIssue::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_error()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues.len() - self.error_count()
    }

    pub fn with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a ValidationIssue> + 'a {
        self.issues.iter().filter(move |i| i.code == code)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOptions {
    /// Promote every rule issue to `error`.
    #[serde(default)]
    pub strict: bool,
    /// Report fields the class schema does not declare.
    #[serde(default)]
    pub report_extra_fields: bool,
}

/// Validation rule trait - produces issues at `warn` level
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, instance: &Instance, class: &ClassDefinition) -> Vec<ValidationIssue>;
}

/// The document a class schema sees: the instance's own fields, without the
/// `id`/`class`/`build` envelope.
fn validation_document(instance: &Instance) -> Value {
    Value::Object(instance.properties.clone())
}

// --- Concrete Rules ---

/// Structural validation against each class's compiled schema.
pub struct SchemaRule {
    compiled: HashMap<ClassName, jsonschema::Validator>,
}

impl SchemaRule {
    /// Compile every class schema once. Schemas that fail to compile are
    /// reported and their classes skip structural validation.
    pub fn compile(classes: &BTreeMap<ClassName, ClassDefinition>) -> (Self, Vec<ValidationIssue>) {
        let mut compiled = HashMap::new();
        let mut issues = Vec::new();
        for (name, class) in classes {
            let Some(schema) = &class.schema else { continue };
            match jsonschema::validator_for(schema) {
                Ok(validator) => {
                    compiled.insert(name.clone(), validator);
                }
                Err(e) => issues.push(
                    ValidationIssue::error("schema-invalid", format!("schema for class `{name}` does not compile: {e}"))
                        .with_class(name),
                ),
            }
        }
        (Self { compiled }, issues)
    }

    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }
}

impl ValidationRule for SchemaRule {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn validate(&self, instance: &Instance, class: &ClassDefinition) -> Vec<ValidationIssue> {
        let Some(validator) = self.compiled.get(&class.name) else {
            return vec![];
        };
        let doc = validation_document(instance);
        validator
            .iter_errors(&doc)
            .map(|err| {
                let schema_path = err.schema_path.to_string();
                let keyword = schema_keyword(&schema_path);
                let path = err.instance_path.to_string();
                ValidationIssue::warn(format!("schema-{keyword}"), format!("{}: {}", instance.id, err))
                    .with_class(&class.name)
                    .with_instance(&instance.id)
                    .with_keyword(keyword)
                    .with_path(&path)
            })
            .collect()
    }
}

/// Last non-index segment of a schema pointer, e.g. `/properties/a/type`
/// gives `type`.
fn schema_keyword(schema_path: &str) -> &str {
    schema_path
        .rsplit('/')
        .find(|segment| !segment.is_empty() && !segment.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or("schema")
}

/// Extra-field detection: fields present on the instance that the schema
/// never declares.
pub struct ExtraFieldRule;

impl ValidationRule for ExtraFieldRule {
    fn name(&self) -> &'static str {
        "extra_fields"
    }

    fn validate(&self, instance: &Instance, class: &ClassDefinition) -> Vec<ValidationIssue> {
        let Some(schema) = &class.schema else {
            return vec![];
        };
        collect_extra_fields(&validation_document(instance), schema, "")
            .into_iter()
            .map(|path| {
                ValidationIssue::warn(
                    "extra-field",
                    format!("{}: field `{}` is not declared by class `{}`", instance.id, path, class.name),
                )
                .with_class(&class.name)
                .with_instance(&instance.id)
                .with_path(&path)
            })
            .collect()
    }
}

const COMPOSITION_KEYWORDS: [&str; 3] = ["anyOf", "oneOf", "allOf"];

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Walk `value` against `schema` and return the dotted paths of undeclared
/// fields. Composed schemas keep the branch with the fewest extras; the
/// first-declared branch wins ties.
pub fn collect_extra_fields(value: &Value, schema: &Value, path: &str) -> Vec<String> {
    let Some(node) = schema.as_object() else {
        return vec![];
    };

    for keyword in COMPOSITION_KEYWORDS {
        let Some(Value::Array(branches)) = node.get(keyword) else {
            continue;
        };
        let mut rest = node.clone();
        rest.remove(keyword);
        let mut best: Option<Vec<String>> = None;
        for branch in branches {
            let effective = match branch {
                Value::Object(branch) => Value::Object(merge_maps(&rest, branch)),
                _ => Value::Object(rest.clone()),
            };
            let extras = collect_extra_fields(value, &effective, path);
            if best.as_ref().map_or(true, |b| extras.len() < b.len()) {
                best = Some(extras);
            }
        }
        return best.unwrap_or_default();
    }

    match value {
        Value::Array(items) => {
            let prefix = node.get("prefixItems").and_then(Value::as_array);
            let rest = node.get("items");
            items
                .iter()
                .enumerate()
                .flat_map(|(i, item)| {
                    let item_schema = prefix.and_then(|p| p.get(i)).or(rest);
                    match item_schema {
                        Some(item_schema) => collect_extra_fields(item, item_schema, &format!("{path}[{i}]")),
                        None => vec![],
                    }
                })
                .collect()
        }
        Value::Object(map) => collect_object_extras(map, node, path),
        _ => vec![],
    }
}

fn collect_object_extras(map: &Map<String, Value>, node: &Map<String, Value>, path: &str) -> Vec<String> {
    let declared = node.get("properties").and_then(Value::as_object);
    let patterns: Vec<(Regex, &Value)> = node
        .get("patternProperties")
        .and_then(Value::as_object)
        .map(|patterns| {
            patterns
                .iter()
                .filter_map(|(pattern, sub)| Regex::new(pattern).ok().map(|re| (re, sub)))
                .collect()
        })
        .unwrap_or_default();
    let additional = node.get("additionalProperties");
    let judged = declared.is_some() || !patterns.is_empty();

    let mut extras = Vec::new();
    for (key, child) in map {
        let next = child_path(path, key);
        if let Some(sub) = declared.and_then(|d| d.get(key)) {
            extras.extend(collect_extra_fields(child, sub, &next));
        } else if let Some((_, sub)) = patterns.iter().find(|(re, _)| re.is_match(key)) {
            extras.extend(collect_extra_fields(child, sub, &next));
        } else {
            match additional {
                // the schema itself rejects these; the validator reports them
                Some(Value::Bool(false)) => {}
                Some(sub @ Value::Object(_)) => extras.extend(collect_extra_fields(child, sub, &next)),
                _ if judged => extras.push(next),
                _ => {}
            }
        }
    }
    extras
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
    compile_issues: Vec<ValidationIssue>,
    options: ValidationOptions,
}

impl Validator {
    pub fn new(classes: &BTreeMap<ClassName, ClassDefinition>, options: ValidationOptions) -> Self {
        let (schema_rule, compile_issues) = SchemaRule::compile(classes);
        log::debug!("compiled {} class schema(s)", schema_rule.compiled_count());

        let mut rules: Vec<Box<dyn ValidationRule>> = vec![Box::new(schema_rule)];
        if options.report_extra_fields {
            rules.push(Box::new(ExtraFieldRule));
        }
        Self {
            rules,
            compile_issues,
            options,
        }
    }

    pub fn validate(&self, snapshot: &CanonicalSnapshot) -> ValidationReport {
        #[cfg(feature = "test-hooks")]
        VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        let mut report = ValidationReport::new();
        report.extend(self.compile_issues.iter().cloned());

        for instance in &snapshot.instances {
            let Some(class) = instance.class_ref.as_ref().and_then(|name| snapshot.classes.get(name)) else {
                continue;
            };
            for rule in &self.rules {
                let issues = rule.validate(instance, class);
                if !issues.is_empty() {
                    log::debug!("rule {} reported {} issue(s) for {}", rule.name(), issues.len(), instance.id);
                }
                report.extend(issues.into_iter().map(|issue| self.apply_policy(issue)));
            }
        }

        log::info!(
            "validation finished: {} error(s), {} warning(s)",
            report.error_count(),
            report.warning_count()
        );
        report
    }

    fn apply_policy(&self, mut issue: ValidationIssue) -> ValidationIssue {
        if self.options.strict {
            issue.level = IssueLevel::Error;
        }
        issue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn class_with_schema(name: &str, schema: Value) -> ClassDefinition {
        let mut class = ClassDefinition::new(name);
        class.schema = Some(schema);
        class
    }

    fn instance(id: &str, class: &str, properties: Value) -> Instance {
        Instance {
            id: id.to_string(),
            class_ref: Some(class.to_string()),
            properties: properties.as_object().cloned().unwrap_or_default(),
            build: vec![],
        }
    }

    #[test]
    fn test_schema_keyword_from_pointer() {
        assert_eq!(schema_keyword("/properties/title/type"), "type");
        assert_eq!(schema_keyword("/required"), "required");
        assert_eq!(schema_keyword("/anyOf/1"), "anyOf");
        assert_eq!(schema_keyword(""), "schema");
    }

    #[test]
    fn test_missing_required_is_reported() {
        let class = class_with_schema("post", json!({"type": "object", "required": ["title"]}));
        let mut classes = BTreeMap::new();
        classes.insert("post".to_string(), class.clone());
        let (rule, issues) = SchemaRule::compile(&classes);
        assert!(issues.is_empty());

        let found = rule.validate(&instance("p1", "post", json!({"body": "x"})), &class);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "schema-required");
        assert_eq!(found[0].keyword.as_deref(), Some("required"));
        assert_eq!(found[0].instance.as_deref(), Some("p1"));
        assert_eq!(found[0].level, IssueLevel::Warn);
    }

    #[test]
    fn test_invalid_schema_is_compile_issue() {
        let mut classes = BTreeMap::new();
        classes.insert("bad".to_string(), class_with_schema("bad", json!({"type": 12})));
        let (rule, issues) = SchemaRule::compile(&classes);
        assert_eq!(rule.compiled_count(), 0);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "schema-invalid");
        assert!(issues[0].is_error());
    }

    #[test]
    fn test_extra_fields_flat() {
        let schema = json!({"properties": {"title": {}, "meta": {"properties": {"author": {}}}}});
        let value = json!({"title": "t", "draft": true, "meta": {"author": "a", "mood": "x"}});
        let mut extras = collect_extra_fields(&value, &schema, "");
        extras.sort();
        assert_eq!(extras, vec!["draft", "meta.mood"]);
    }

    #[test]
    fn test_extra_fields_skip_forbidden_additional() {
        let schema = json!({"properties": {"a": {}}, "additionalProperties": false});
        assert!(collect_extra_fields(&json!({"a": 1, "b": 2}), &schema, "").is_empty());
    }

    #[test]
    fn test_extra_fields_recurse_into_additional_schema() {
        let schema = json!({
            "properties": {},
            "additionalProperties": {"properties": {"x": {}}}
        });
        let extras = collect_extra_fields(&json!({"k": {"x": 1, "y": 2}}), &schema, "");
        assert_eq!(extras, vec!["k.y"]);
    }

    #[test]
    fn test_extra_fields_array_items() {
        let schema = json!({"properties": {"links": {"items": {"properties": {"href": {}}}}}});
        let value = json!({"links": [{"href": "a"}, {"href": "b", "rel": "c"}]});
        assert_eq!(collect_extra_fields(&value, &schema, ""), vec!["links[1].rel"]);
    }

    #[test]
    fn test_extra_fields_pattern_properties_declare() {
        let schema = json!({"properties": {}, "patternProperties": {"^x-": {}}});
        let extras = collect_extra_fields(&json!({"x-a": 1, "y": 2}), &schema, "");
        assert_eq!(extras, vec!["y"]);
    }

    #[test]
    fn test_extra_fields_composition_picks_closest_branch() {
        let schema = json!({
            "anyOf": [
                {"properties": {"a": {}}},
                {"properties": {"a": {}, "b": {}}}
            ]
        });
        assert!(collect_extra_fields(&json!({"a": 1, "b": 2}), &schema, "").is_empty());

        let tie = json!({
            "oneOf": [
                {"properties": {"a": {}}},
                {"properties": {"b": {}}}
            ]
        });
        assert_eq!(collect_extra_fields(&json!({"a": 1, "b": 2}), &tie, ""), vec!["b"]);
    }

    #[test]
    fn test_extra_fields_composition_keeps_node_properties() {
        let schema = json!({
            "properties": {"id": {}},
            "allOf": [{"properties": {"title": {}}}]
        });
        let extras = collect_extra_fields(&json!({"id": 1, "title": "t", "x": 0}), &schema, "");
        assert_eq!(extras, vec!["x"]);
    }

    fn snapshot_with_extra_field() -> CanonicalSnapshot {
        let class = class_with_schema("post", json!({"properties": {"title": {}}}));
        let mut classes = BTreeMap::new();
        classes.insert("post".to_string(), class);
        let instances = vec![instance("p1", "post", json!({"title": "t", "draft": true}))];
        CanonicalSnapshot::assemble(Default::default(), classes, instances, BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_extra_fields_off_unless_requested() {
        let snapshot = snapshot_with_extra_field();
        let quiet = Validator::new(&snapshot.classes, ValidationOptions::default()).validate(&snapshot);
        assert_eq!(quiet.with_code("extra-field").count(), 0);

        let options = ValidationOptions {
            report_extra_fields: true,
            ..ValidationOptions::default()
        };
        let report = Validator::new(&snapshot.classes, options).validate(&snapshot);
        let extras: Vec<_> = report.with_code("extra-field").collect();
        assert_eq!(extras.len(), 1);
        assert_eq!(extras[0].path.as_deref(), Some("draft"));
        assert_eq!(extras[0].level, IssueLevel::Warn);
        assert!(!report.has_errors());
    }

    #[test]
    fn test_strict_promotes_extra_fields() {
        let snapshot = snapshot_with_extra_field();
        let options = ValidationOptions {
            strict: true,
            report_extra_fields: true,
        };
        let report = Validator::new(&snapshot.classes, options).validate(&snapshot);
        let extras: Vec<_> = report.with_code("extra-field").collect();
        assert_eq!(extras.len(), 1);
        assert!(extras[0].is_error());
        assert_eq!(report.error_count(), 1);
    }

    #[test]
    fn test_with_instances_keeps_first_as_instance() {
        let issue = ValidationIssue::warn("output-collision", "x").with_instances(["a", "b"]);
        assert_eq!(issue.instance.as_deref(), Some("a"));
        assert_eq!(issue.instances, vec!["a", "b"]);
        let value = serde_json::to_value(&issue).unwrap();
        assert_eq!(value["instances"], json!(["a", "b"]));
        assert!(serde_json::to_value(ValidationIssue::warn("c", "m")).unwrap().get("instances").is_none());
    }

    #[test]
    fn test_unjudged_level_reports_nothing() {
        let schema = json!({"required": ["a"]});
        assert!(collect_extra_fields(&json!({"a": 1, "b": 2}), &schema, "").is_empty());
    }
}
