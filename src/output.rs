//! Output Planning - safe paths and collision detection
//!
//! Every output path is derived and checked before anything is written.
//! Collisions are detected twice: once across the whole plan, and again at
//! render time for files emitted from inside templates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::error::{BuildError, Result};
use crate::instances::{BuildDirective, Instance};
use crate::snapshot::CanonicalSnapshot;
use crate::templates::TemplateSet;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputPathError {
    #[error("filename is empty")]
    Empty,

    #[error("absolute path `{0}` not allowed")]
    Absolute(String),

    #[error("parent segment `..` not allowed in `{0}`")]
    ParentSegment(String),

    #[error("empty or `.` segment not allowed in `{0}`")]
    EmptySegment(String),

    #[error("`{0}` resolves outside the build root")]
    EscapesRoot(String),
}

/// Resolve a directive's filename to a path under `build_root`.
///
/// A leading `/` is build-root-relative. A filename without a directory
/// component inherits the first path segment of the template key, so
/// `pages/post.html` + `a.html` lands in `pages/a.html`.
pub fn resolve_output_path(
    template_key: &str,
    filename: &str,
    build_root: &Path,
) -> std::result::Result<PathBuf, OutputPathError> {
    if filename.is_empty() {
        return Err(OutputPathError::Empty);
    }
    if filename.contains('\\') || has_drive_prefix(filename) {
        return Err(OutputPathError::Absolute(filename.to_string()));
    }

    let (rooted, relative) = match filename.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, filename),
    };
    if relative.starts_with('/') {
        return Err(OutputPathError::Absolute(filename.to_string()));
    }

    let segments: Vec<&str> = relative.split('/').collect();
    for segment in &segments {
        match *segment {
            ".." => return Err(OutputPathError::ParentSegment(filename.to_string())),
            "" | "." => return Err(OutputPathError::EmptySegment(filename.to_string())),
            _ => {}
        }
    }

    let mut rel = PathBuf::new();
    if !rooted && segments.len() == 1 {
        if let Some(category) = template_category(template_key) {
            rel.push(category);
        }
    }
    rel.extend(&segments);

    let resolved = build_root.join(&rel);
    let inside = resolved.starts_with(build_root)
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !inside {
        return Err(OutputPathError::EscapesRoot(filename.to_string()));
    }
    Ok(resolved)
}

/// `C:` alone or `C:/...`. A colon later in a plain name is allowed.
fn has_drive_prefix(filename: &str) -> bool {
    match filename.as_bytes() {
        [drive, b':'] => drive.is_ascii_alphabetic(),
        [drive, b':', b'/', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

/// First segment of a multi-segment template key.
fn template_category(template_key: &str) -> Option<&str> {
    match template_key.split_once('/') {
        Some((category, _)) if !category.is_empty() && category != "." && category != ".." => Some(category),
        _ => None,
    }
}

/// Filename for a bare directive: the instance id plus the extension of the
/// template key's last segment.
pub fn default_filename(template_key: &str, instance_id: &str) -> String {
    let leaf = template_key.rsplit('/').next().unwrap_or(template_key);
    match leaf.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => format!("{instance_id}.{ext}"),
        _ => instance_id.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimOrigin {
    Directive,
    Emitted,
}

/// Who wants to write a given path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputClaim {
    pub template: String,
    pub instance_id: String,
    pub origin: ClaimOrigin,
}

impl OutputClaim {
    fn same_owner(&self, other: &OutputClaim) -> bool {
        self.template == other.template && self.instance_id == other.instance_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub path: PathBuf,
    pub claims: Vec<OutputClaim>,
}

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owners: Vec<String> = self
            .claims
            .iter()
            .map(|c| format!("{} ({})", c.instance_id, c.template))
            .collect();
        write!(f, "{} claimed by {}", self.path.display(), owners.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedOutput {
    pub path: PathBuf,
    pub template: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputPlan {
    pub outputs: Vec<PlannedOutput>,
    pub collisions: Vec<Collision>,
}

impl OutputPlan {
    pub fn has_collisions(&self) -> bool {
        !self.collisions.is_empty()
    }
}

fn plan_directive(
    instance: &Instance,
    directive: &BuildDirective,
    build_root: &Path,
) -> Result<PathBuf> {
    let filename = directive
        .filename
        .clone()
        .unwrap_or_else(|| default_filename(&directive.template, &instance.id));
    resolve_output_path(&directive.template, &filename, build_root).map_err(|source| BuildError::OutputPath {
        template: directive.template.clone(),
        instance: instance.id.clone(),
        source,
    })
}

/// Dry-run pass: resolve every directive of every instance and report all
/// paths claimed by more than one template/instance pair. Nothing is
/// written.
pub fn plan_outputs(snapshot: &CanonicalSnapshot, templates: &TemplateSet, build_root: &Path) -> Result<OutputPlan> {
    let mut outputs = Vec::new();
    let mut claims: BTreeMap<PathBuf, Vec<OutputClaim>> = BTreeMap::new();

    for instance in &snapshot.instances {
        for directive in &instance.build {
            let template = templates.key_for(&directive.template)
                .ok_or_else(|| BuildError::TemplateNotFound(directive.template.clone()))?;
            let directive = BuildDirective {
                template: template.to_string(),
                filename: directive.filename.clone(),
            };
            let path = plan_directive(instance, &directive, build_root)?;
            let claim = OutputClaim {
                template: directive.template.clone(),
                instance_id: instance.id.clone(),
                origin: ClaimOrigin::Directive,
            };

            let existing = claims.entry(path.clone()).or_default();
            if existing.iter().any(|c| c.same_owner(&claim)) {
                continue;
            }
            existing.push(claim);
            outputs.push(PlannedOutput {
                path,
                template: directive.template,
                instance_id: instance.id.clone(),
            });
        }
    }

    let collisions: Vec<Collision> = claims
        .into_iter()
        .filter(|(_, claims)| claims.len() > 1)
        .map(|(path, claims)| Collision { path, claims })
        .collect();
    for collision in &collisions {
        log::warn!("output collision: {collision}");
    }

    log::info!("planned {} output(s), {} collision(s)", outputs.len(), collisions.len());
    Ok(OutputPlan { outputs, collisions })
}

/// Render-time collision check, seeded with the planned outputs.
#[derive(Debug, Default)]
pub struct CollisionTracker {
    claims: HashMap<PathBuf, Vec<OutputClaim>>,
}

impl CollisionTracker {
    pub fn from_plan(plan: &OutputPlan) -> Self {
        let mut tracker = Self::default();
        for output in &plan.outputs {
            tracker.claims.entry(output.path.clone()).or_default().push(OutputClaim {
                template: output.template.clone(),
                instance_id: output.instance_id.clone(),
                origin: ClaimOrigin::Directive,
            });
        }
        tracker
    }

    /// Record a claim for an emitted file. Any earlier claim on the path is a
    /// collision, including the emitting template's own planned output.
    pub fn claim(&mut self, path: &Path, claim: OutputClaim) -> Option<Collision> {
        let existing = self.claims.entry(path.to_path_buf()).or_default();
        let clash = !existing.is_empty();
        existing.push(claim);
        clash.then(|| Collision {
            path: path.to_path_buf(),
            claims: existing.clone(),
        })
    }
}
