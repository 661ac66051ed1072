//! Class Resolution - fold fragments, then flatten inheritance
//!
//! Fragments sharing a class name fold in `(root index, path)` order.
//! Resolution walks parents with an explicit work stack; a class reached
//! again while still on the stack is a fatal cycle.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::document::{Provenance, SourceDocument};
use crate::error::{BuildError, ParseError, Result};
use crate::merge::{layer, merge, merge_maps, strip_directives};
use crate::validation::ValidationIssue;

pub type ClassName = String;

pub const SCHEMA_SIDECAR_SUFFIX: &str = ".schema.json";

/// Fields a class document uses for itself rather than as instance defaults.
pub const RESERVED_CLASS_FIELDS: [&str; 5] = ["class", "parent", "parents", "id", "schema"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassDefinition {
    #[serde(rename = "class")]
    pub name: ClassName,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<ClassName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
    #[serde(skip)]
    pub provenance: Option<Provenance>,
}

impl ClassDefinition {
    pub fn new(name: impl Into<ClassName>) -> Self {
        Self {
            name: name.into(),
            parents: Vec::new(),
            schema: None,
            properties: Map::new(),
            provenance: None,
        }
    }

    /// Top-level `required` entries of the merged schema.
    pub fn required_fields(&self) -> Vec<&str> {
        self.schema
            .as_ref()
            .and_then(|s| s.get("required"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Build a definition from a folded class document.
    fn from_document(name: ClassName, mut doc: Map<String, Value>, provenance: Provenance) -> Self {
        let parents = normalize_parents(doc.get("parent"), doc.get("parents"));
        let schema = doc.remove("schema");
        for key in ["class", "parent", "parents"] {
            doc.remove(key);
        }
        Self {
            name,
            parents,
            schema,
            properties: doc,
            provenance: Some(provenance),
        }
    }

    /// Layer `other` on top of `self`: properties and schema deep-merge,
    /// `other` dominant.
    fn layered(&self, other: &ClassDefinition) -> ClassDefinition {
        let schema = match (&self.schema, &other.schema) {
            (Some(base), Some(overlay)) => Some(merge(base, overlay)),
            (None, Some(schema)) | (Some(schema), None) => Some(strip_directives(schema)),
            (None, None) => None,
        };
        ClassDefinition {
            name: other.name.clone(),
            parents: other.parents.clone(),
            schema,
            properties: merge_maps(&self.properties, &other.properties),
            provenance: other.provenance.clone(),
        }
    }
}

/// Collapse `parent` and `parents` (each a string or an array) into one
/// ordered list without duplicates, `parent` entries first.
pub fn normalize_parents(parent: Option<&Value>, parents: Option<&Value>) -> Vec<ClassName> {
    let mut out: Vec<ClassName> = Vec::new();
    for value in [parent, parents].into_iter().flatten() {
        let names: Vec<&str> = match value {
            Value::String(name) => vec![name.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        for name in names {
            if !name.is_empty() && !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        }
    }
    out
}

/// Turn one class-root document into a `(class name, fragment)` pair.
/// Sidecar schema files merge into the `schema` sub-document and may take
/// their class name from the file name.
fn fragment_of(doc: &SourceDocument) -> Result<(ClassName, Map<String, Value>)> {
    let path = &doc.provenance.path;
    let Value::Object(body) = &doc.value else {
        return Err(ParseError::invalid(path, "class document must be an object").into());
    };

    if let Some(stem) = sidecar_class_name(path) {
        let mut schema = body.clone();
        let name = match schema.remove("class") {
            Some(Value::String(name)) => name,
            _ => stem,
        };
        let mut fragment = Map::new();
        fragment.insert("schema".to_string(), Value::Object(schema));
        return Ok((name, fragment));
    }

    match body.get("class") {
        Some(Value::String(name)) if !name.is_empty() => Ok((name.clone(), body.clone())),
        _ => Err(ParseError::invalid(path, "class document requires a string `class` field").into()),
    }
}

fn sidecar_class_name(path: &Path) -> Option<ClassName> {
    let file_name = path.file_name()?.to_str()?;
    file_name
        .strip_suffix(SCHEMA_SIDECAR_SUFFIX)
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

/// Fold all class fragments by name. The result holds unresolved
/// definitions (own fields only, parents normalized).
pub fn fold_classes(documents: &[SourceDocument]) -> Result<BTreeMap<ClassName, ClassDefinition>> {
    let mut ordered: Vec<&SourceDocument> = documents.iter().collect();
    ordered.sort_by(|a, b| a.provenance.cmp(&b.provenance));

    let mut folded: BTreeMap<ClassName, (Value, Provenance)> = BTreeMap::new();
    for doc in ordered {
        let (name, fragment) = fragment_of(doc)?;
        let fragment = Value::Object(fragment);
        let entry = folded
            .entry(name)
            .or_insert_with(|| (Value::Object(Map::new()), doc.provenance.clone()));
        entry.0 = layer(&entry.0, &fragment);
        entry.1 = doc.provenance.clone();
    }

    folded
        .into_iter()
        .map(|(name, (doc, provenance))| match doc {
            Value::Object(map) => {
                let def = ClassDefinition::from_document(name.clone(), map, provenance);
                Ok((name, def))
            }
            _ => Err(BuildError::Merge(format!("class `{name}` did not fold to an object"))),
        })
        .collect()
}

struct Frame {
    index: usize,
    next_parent: usize,
}

/// Memoized inheritance resolution over folded class definitions.
pub struct ClassResolver {
    names: Vec<ClassName>,
    index: HashMap<ClassName, usize>,
    own: Vec<ClassDefinition>,
    resolved: Vec<Option<ClassDefinition>>,
    warnings: Vec<ValidationIssue>,
}

impl ClassResolver {
    pub fn new(classes: BTreeMap<ClassName, ClassDefinition>) -> Self {
        let mut names = Vec::with_capacity(classes.len());
        let mut own = Vec::with_capacity(classes.len());
        for (name, def) in classes {
            names.push(name);
            own.push(def);
        }
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let count = names.len();
        Self {
            names,
            index,
            own,
            resolved: vec![None; count],
            warnings: Vec::new(),
        }
    }

    /// Resolve one class. Returns `None` for an unknown name.
    pub fn resolve(&mut self, name: &str) -> Result<Option<&ClassDefinition>> {
        let Some(&start) = self.index.get(name) else {
            return Ok(None);
        };
        if self.resolved[start].is_none() {
            self.resolve_index(start)?;
        }
        Ok(self.resolved[start].as_ref())
    }

    fn resolve_index(&mut self, start: usize) -> Result<()> {
        let mut on_path = vec![false; self.names.len()];
        let mut stack = vec![Frame { index: start, next_parent: 0 }];
        on_path[start] = true;

        while let Some(frame) = stack.last_mut() {
            let current = frame.index;
            let parents = &self.own[current].parents;

            if frame.next_parent < parents.len() {
                let parent = &parents[frame.next_parent];
                frame.next_parent += 1;

                match self.index.get(parent).copied() {
                    None => {
                        let message =
                            format!("class `{}` references unknown parent `{}`", self.names[current], parent);
                        log::warn!("{message}");
                        self.warnings.push(
                            ValidationIssue::warn("unknown-parent", message).with_class(&self.names[current]),
                        );
                    }
                    Some(p) if self.resolved[p].is_some() => {}
                    Some(p) if on_path[p] => {
                        let from = stack.iter().position(|f| f.index == p).unwrap_or(0);
                        let mut path: Vec<ClassName> =
                            stack[from..].iter().map(|f| self.names[f.index].clone()).collect();
                        path.push(self.names[p].clone());
                        return Err(BuildError::ClassCycle { path });
                    }
                    Some(p) => {
                        on_path[p] = true;
                        stack.push(Frame { index: p, next_parent: 0 });
                    }
                }
                continue;
            }

            let mut flattened = ClassDefinition::new(self.names[current].clone());
            for parent in &self.own[current].parents {
                if let Some(resolved) = self.index.get(parent).and_then(|&p| self.resolved[p].as_ref()) {
                    flattened = flattened.layered(resolved);
                }
            }
            let mut flattened = flattened.layered(&self.own[current]);
            if let Some(schema) = flattened.schema.as_mut() {
                dedupe_required(schema);
            }

            self.resolved[current] = Some(flattened);
            on_path[current] = false;
            stack.pop();
        }
        Ok(())
    }

    /// Resolve every class and hand back the flattened set plus the
    /// warnings collected on the way.
    pub fn resolve_all(mut self) -> Result<ResolvedClasses> {
        for i in 0..self.names.len() {
            if self.resolved[i].is_none() {
                self.resolve_index(i)?;
            }
        }
        let classes = self
            .names
            .into_iter()
            .zip(self.resolved)
            .filter_map(|(name, def)| def.map(|def| (name, def)))
            .collect();
        Ok(ResolvedClasses {
            classes,
            warnings: self.warnings,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedClasses {
    pub classes: BTreeMap<ClassName, ClassDefinition>,
    pub warnings: Vec<ValidationIssue>,
}

/// Fold and resolve in one step.
pub fn resolve_classes(documents: &[SourceDocument]) -> Result<ResolvedClasses> {
    let folded = fold_classes(documents)?;
    log::info!("folded {} class(es)", folded.len());
    ClassResolver::new(folded).resolve_all()
}

/// Merged schemas append `required` lists; keep each name once.
fn dedupe_required(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if key == "required" {
                    if let Value::Array(items) = value {
                        let mut seen: Vec<Value> = Vec::with_capacity(items.len());
                        items.retain(|item| {
                            if seen.contains(item) {
                                false
                            } else {
                                seen.push(item.clone());
                                true
                            }
                        });
                        continue;
                    }
                }
                dedupe_required(value);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(dedupe_required),
        _ => {}
    }
}
