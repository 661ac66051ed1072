//! Canonical Snapshot - the assembled, read-only model
//!
//! `Snapshot` is the shared read view. `SnapshotDraft` is the only way to
//! change a model after load, and `commit` turns it back into a new
//! `Snapshot` with every derived index recomputed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::classes::{ClassDefinition, ClassName};
use crate::document::Provenance;
use crate::error::Result;
use crate::hashing::compute_content_hash;
use crate::instances::{Instance, GLOBAL_ID};
use crate::ENGINE_VERSION;

pub const SNAPSHOT_VERSION: &str = "1.0.0";
pub const SNAPSHOT_STABILITY: &str = "stable";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRoots {
    pub classes: Vec<PathBuf>,
    pub instances: Vec<PathBuf>,
    pub templates: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMeta {
    pub build_id: Uuid,
    pub engine_version: String,
    pub source_roots: SourceRoots,
    pub content_hash: String,
    pub built_at: DateTime<Utc>,
}

/// One node of the class-inheritance forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassNode {
    pub name: ClassName,
    pub parents: Vec<ClassName>,
    pub children: Vec<ClassNode>,
    /// Set when this node already appears on its own ancestor chain; such a
    /// node is not expanded further.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cycle: bool,
}

/// Build the hierarchy forest from each class's `parents` list. Roots are
/// classes without known parents; classes unreachable from any root (pure
/// cycles) are appended as extra roots so nothing is dropped.
pub fn class_hierarchy(classes: &BTreeMap<ClassName, ClassDefinition>) -> Vec<ClassNode> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots = Vec::new();
    for (name, class) in classes {
        let known: Vec<&str> = class
            .parents
            .iter()
            .map(String::as_str)
            .filter(|p| classes.contains_key(*p))
            .collect();
        if known.is_empty() {
            roots.push(name.as_str());
        }
        for parent in known {
            children.entry(parent).or_default().push(name.as_str());
        }
    }

    let mut visited = HashSet::new();
    let mut forest: Vec<ClassNode> = roots
        .iter()
        .map(|root| hierarchy_node(*root, classes, &children, &mut Vec::new(), &mut visited))
        .collect();
    for name in classes.keys() {
        if !visited.contains(name.as_str()) {
            forest.push(hierarchy_node(name, classes, &children, &mut Vec::new(), &mut visited));
        }
    }
    forest
}

fn hierarchy_node<'a>(
    name: &'a str,
    classes: &'a BTreeMap<ClassName, ClassDefinition>,
    children: &HashMap<&'a str, Vec<&'a str>>,
    ancestors: &mut Vec<&'a str>,
    visited: &mut HashSet<&'a str>,
) -> ClassNode {
    let parents = classes.get(name).map(|c| c.parents.clone()).unwrap_or_default();
    if ancestors.contains(&name) {
        return ClassNode {
            name: name.to_string(),
            parents,
            children: Vec::new(),
            cycle: true,
        };
    }
    visited.insert(name);
    ancestors.push(name);
    let nodes = children
        .get(name)
        .map(|kids| {
            kids.iter()
                .map(|kid| hierarchy_node(*kid, classes, children, ancestors, visited))
                .collect()
        })
        .unwrap_or_default();
    ancestors.pop();
    ClassNode {
        name: name.to_string(),
        parents,
        children: nodes,
        cycle: false,
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalSnapshot {
    pub version: String,
    pub stability: String,
    pub build_meta: BuildMeta,
    pub classes: BTreeMap<ClassName, ClassDefinition>,
    pub class_hierarchy: Vec<ClassNode>,
    /// Global first, then sorted by id.
    pub instances: Vec<Instance>,
    pub instances_by_id: HashMap<String, usize>,
    /// Side table: which documents contributed to each instance. Never
    /// serialized.
    pub provenance: BTreeMap<String, Vec<Provenance>>,
}

impl CanonicalSnapshot {
    /// Assemble a snapshot from loaded parts and compute every derived field.
    pub fn assemble(
        source_roots: SourceRoots,
        classes: BTreeMap<ClassName, ClassDefinition>,
        instances: Vec<Instance>,
        provenance: BTreeMap<String, Vec<Provenance>>,
    ) -> Result<Self> {
        let mut snapshot = Self {
            version: SNAPSHOT_VERSION.to_string(),
            stability: SNAPSHOT_STABILITY.to_string(),
            build_meta: BuildMeta {
                build_id: Uuid::new_v4(),
                engine_version: ENGINE_VERSION.to_string(),
                source_roots,
                content_hash: String::new(),
                built_at: Utc::now(),
            },
            classes,
            class_hierarchy: Vec::new(),
            instances,
            instances_by_id: HashMap::new(),
            provenance,
        };
        snapshot.reindex()?;
        Ok(snapshot)
    }

    /// Restore ordering and recompute the id index, hierarchy and hash.
    fn reindex(&mut self) -> Result<()> {
        if !self.instances.iter().any(Instance::is_global) {
            self.instances.push(Instance::empty_global());
        }
        self.instances
            .sort_by(|a, b| (!a.is_global(), &a.id).cmp(&(!b.is_global(), &b.id)));
        self.instances.dedup_by(|later, earlier| later.id == earlier.id);
        self.instances_by_id = self
            .instances
            .iter()
            .enumerate()
            .map(|(i, instance)| (instance.id.clone(), i))
            .collect();
        self.class_hierarchy = class_hierarchy(&self.classes);
        self.build_meta.content_hash = compute_content_hash(self.classes.values(), &self.instances)?;
        Ok(())
    }

    pub fn global(&self) -> &Instance {
        // reindex guarantees the global record sits at index 0
        &self.instances[0]
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances_by_id.get(id).map(|&i| &self.instances[i])
    }

    pub fn class(&self, name: &str) -> Option<&ClassDefinition> {
        self.classes.get(name)
    }

    pub fn instances_of<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a Instance> + 'a {
        self.instances
            .iter()
            .filter(move |i| i.class_ref.as_deref() == Some(class))
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDocument<'a> {
    version: &'a str,
    stability: &'a str,
    build_meta: &'a BuildMeta,
    global: &'a Instance,
    classes: &'a BTreeMap<ClassName, ClassDefinition>,
    class_hierarchy: &'a [ClassNode],
    instances: &'a [Instance],
    instances_by_id: BTreeMap<&'a str, &'a Instance>,
}

impl Serialize for CanonicalSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        SnapshotDocument {
            version: &self.version,
            stability: &self.stability,
            build_meta: &self.build_meta,
            global: self.global(),
            classes: &self.classes,
            class_hierarchy: &self.class_hierarchy,
            instances: &self.instances,
            instances_by_id: self.instances.iter().map(|i| (i.id.as_str(), i)).collect(),
        }
        .serialize(serializer)
    }
}

/// Read-only view over a frozen snapshot. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<CanonicalSnapshot>,
}

impl Snapshot {
    pub fn new(snapshot: CanonicalSnapshot) -> Self {
        Self {
            inner: Arc::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> &CanonicalSnapshot {
        &self.inner
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.inner.instance(id)
    }

    pub fn class(&self, name: &str) -> Option<&ClassDefinition> {
        self.inner.class(name)
    }

    pub fn global(&self) -> &Instance {
        self.inner.global()
    }

    pub fn instances(&self) -> &[Instance] {
        &self.inner.instances
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDefinition> {
        self.inner.classes.values()
    }

    pub fn instances_of<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a Instance> + 'a {
        self.inner.instances_of(class)
    }

    /// Open the post-load mutation window. Consumes this view; other clones
    /// keep seeing the old model.
    pub fn into_draft(self) -> SnapshotDraft {
        let working = Arc::try_unwrap(self.inner).unwrap_or_else(|shared| (*shared).clone());
        SnapshotDraft { working }
    }
}

/// Private working copy for post-load enrichment.
pub struct SnapshotDraft {
    working: CanonicalSnapshot,
}

impl SnapshotDraft {
    pub fn snapshot(&self) -> &CanonicalSnapshot {
        &self.working
    }

    /// Insert or replace an instance by id. Returns the replaced instance.
    pub fn upsert_instance(&mut self, instance: Instance) -> Option<Instance> {
        match self.working.instances.iter().position(|i| i.id == instance.id) {
            Some(i) => Some(std::mem::replace(&mut self.working.instances[i], instance)),
            None => {
                self.working.instances.push(instance);
                None
            }
        }
    }

    /// Remove an instance. The global record cannot be removed; use
    /// `set_global` to replace it.
    pub fn remove_instance(&mut self, id: &str) -> Option<Instance> {
        if id == GLOBAL_ID {
            return None;
        }
        let position = self.working.instances.iter().position(|i| i.id == id)?;
        self.working.provenance.remove(id);
        Some(self.working.instances.remove(position))
    }

    pub fn upsert_class(&mut self, class: ClassDefinition) -> Option<ClassDefinition> {
        self.working.classes.insert(class.name.clone(), class)
    }

    pub fn remove_class(&mut self, name: &str) -> Option<ClassDefinition> {
        self.working.classes.remove(name)
    }

    pub fn set_global(&mut self, mut global: Instance) -> Option<Instance> {
        global.id = GLOBAL_ID.to_string();
        self.upsert_instance(global)
    }

    /// Freeze the draft into a new snapshot. `validate` runs against the
    /// reindexed model before it is frozen; its error aborts the commit.
    pub fn commit(mut self, validate: Option<&dyn Fn(&CanonicalSnapshot) -> Result<()>>) -> Result<Snapshot> {
        self.working.reindex()?;
        if let Some(validate) = validate {
            validate(&self.working)?;
        }
        Ok(Snapshot::new(self.working))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use serde_json::json;

    fn class(name: &str, parents: &[&str]) -> ClassDefinition {
        let mut class = ClassDefinition::new(name);
        class.parents = parents.iter().map(|p| p.to_string()).collect();
        class
    }

    fn classes(defs: Vec<ClassDefinition>) -> BTreeMap<ClassName, ClassDefinition> {
        defs.into_iter().map(|c| (c.name.clone(), c)).collect()
    }

    fn sample() -> Snapshot {
        let mut post = Instance::new("post-1");
        post.class_ref = Some("post".into());
        let mut page = Instance::new("about");
        page.class_ref = Some("page".into());
        let snapshot = CanonicalSnapshot::assemble(
            SourceRoots::default(),
            classes(vec![class("base", &[]), class("post", &["base"]), class("page", &["base"])]),
            vec![post, page],
            BTreeMap::new(),
        )
        .unwrap();
        Snapshot::new(snapshot)
    }

    #[test]
    fn test_global_first_then_sorted() {
        let view = sample();
        let ids: Vec<&str> = view.instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["global", "about", "post-1"]);
        assert!(view.global().properties.is_empty());
        assert_eq!(view.instance("about").unwrap().id, "about");
        assert_eq!(view.instances_of("post").count(), 1);
    }

    #[test]
    fn test_hierarchy_forest() {
        let view = sample();
        let forest = &view.snapshot().class_hierarchy;
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].name, "base");
        let kids: Vec<&str> = forest[0].children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(kids, vec!["page", "post"]);
    }

    #[test]
    fn test_hierarchy_flags_cycles() {
        let forest = class_hierarchy(&classes(vec![class("A", &["B"]), class("B", &["A"])]));
        assert_eq!(forest.len(), 1);
        let a = &forest[0];
        assert_eq!(a.name, "A");
        assert_eq!(a.children[0].name, "B");
        assert!(a.children[0].children[0].cycle);
    }

    #[test]
    fn test_serialized_shape() {
        let view = sample();
        let doc = view.snapshot().to_value().unwrap();
        assert_eq!(doc["version"], json!(SNAPSHOT_VERSION));
        assert_eq!(doc["global"]["id"], json!("global"));
        assert_eq!(doc["instancesById"]["about"]["class"], json!("page"));
        assert!(doc["buildMeta"]["contentHash"].as_str().unwrap().len() == 64);
        assert!(doc.get("provenance").is_none());
    }

    #[test]
    fn test_draft_commit_reindexes() {
        let view = sample();
        let before = view.snapshot().build_meta.content_hash.clone();
        let mut draft = view.clone().into_draft();

        let mut extra = Instance::new("aaa");
        extra.properties.insert("title".into(), json!("first"));
        assert!(draft.upsert_instance(extra).is_none());
        assert!(draft.remove_instance("post-1").is_some());
        assert!(draft.remove_instance(GLOBAL_ID).is_none());
        let mut global = Instance::new("ignored");
        global.properties.insert("site".into(), json!("x"));
        draft.set_global(global);

        let committed = draft.commit(None).unwrap();
        let ids: Vec<&str> = committed.instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["global", "aaa", "about"]);
        assert_eq!(committed.global().get("site"), Some(&json!("x")));
        assert_ne!(committed.snapshot().build_meta.content_hash, before);

        // the original view is untouched
        assert!(view.instance("post-1").is_some());
    }

    #[test]
    fn test_commit_runs_validation_callback() {
        let draft = sample().into_draft();
        let err = draft
            .commit(Some(&|_: &CanonicalSnapshot| Err(BuildError::Config("rejected".into()))))
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[test]
    fn test_class_mutations() {
        let mut draft = sample().into_draft();
        draft.upsert_class(class("news", &["post"]));
        assert!(draft.remove_class("page").is_some());
        let committed = draft.commit(None).unwrap();
        assert!(committed.class("news").is_some());
        assert!(committed.class("page").is_none());
        let base = &committed.snapshot().class_hierarchy[0];
        assert_eq!(base.children[0].name, "post");
        assert_eq!(base.children[0].children[0].name, "news");
    }
}
