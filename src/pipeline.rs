//! Build Pipeline - Single Entry Point
//!
//! CRITICAL: build MUST validate the committed snapshot. No bypass.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::classes::resolve_classes;
use crate::config::BuildConfig;
use crate::document::load_roots;
use crate::error::{BuildError, Result};
use crate::hashing::canonical_value;
use crate::instances::load_instances;
use crate::output::{plan_outputs, Collision, OutputPlan};
use crate::render::{RenderSummary, Renderer};
use crate::snapshot::{CanonicalSnapshot, Snapshot, SnapshotDraft};
use crate::templates::TemplateSet;
use crate::validation::{ValidationIssue, ValidationReport, Validator};

pub const SOURCE_EXTENSION: &str = "json";

/// A loaded model plus the recoverable issues found while loading it.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub snapshot: Snapshot,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub snapshot: Snapshot,
    pub report: ValidationReport,
    pub plan: OutputPlan,
    pub render: RenderSummary,
}

/// The build pipeline - single entry point for all build operations
pub struct BuildPipeline {
    config: BuildConfig,
}

impl BuildPipeline {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Scan, fold, resolve, merge instances and assemble the snapshot.
    pub fn load(&self) -> Result<LoadOutcome> {
        self.config.check()?;

        let class_docs = load_roots(&self.config.class_roots, SOURCE_EXTENSION)?;
        let resolved = resolve_classes(&class_docs)?;

        let instance_docs = load_roots(&self.config.instance_roots, SOURCE_EXTENSION)?;
        let loaded = load_instances(&instance_docs, &resolved.classes)?;

        let mut issues = resolved.warnings;
        issues.extend(loaded.warnings);

        let snapshot = CanonicalSnapshot::assemble(
            self.config.source_roots(),
            resolved.classes,
            loaded.instances,
            loaded.provenance,
        )?;
        log::info!(
            "snapshot assembled: {} class(es), {} instance(s), hash {}",
            snapshot.classes.len(),
            snapshot.instances.len(),
            snapshot.build_meta.content_hash
        );

        Ok(LoadOutcome {
            snapshot: Snapshot::new(snapshot),
            issues,
        })
    }

    /// Validate a snapshot against its classes' schemas.
    ///
    /// This is the ONLY validation entry point.
    pub fn validate(&self, snapshot: &Snapshot) -> ValidationReport {
        Validator::new(&snapshot.snapshot().classes, self.config.validation_options()).validate(snapshot.snapshot())
    }

    /// Dry run: resolve every output path and report collisions.
    pub fn plan(&self, snapshot: &Snapshot) -> Result<OutputPlan> {
        let templates = TemplateSet::load_from_roots(&self.config.template_roots)?;
        plan_outputs(snapshot.snapshot(), &templates, &self.config.build_root)
    }

    pub fn build(&self) -> Result<BuildOutcome> {
        self.build_with(|_| Ok(()))
    }

    /// Full build with a post-load enrichment window.
    ///
    /// CRITICAL: the committed snapshot is ALWAYS validated before any
    /// template output is written.
    pub fn build_with<F>(&self, enrich: F) -> Result<BuildOutcome>
    where
        F: FnOnce(&mut SnapshotDraft) -> Result<()>,
    {
        let loaded = self.load()?;
        let mut draft = loaded.snapshot.into_draft();
        enrich(&mut draft)?;
        let snapshot = draft.commit(None)?;

        // MANDATORY: validation always runs on what will be rendered.
        let mut report = ValidationReport::new();
        report.extend(loaded.issues);
        report.extend(self.validate(&snapshot).issues);

        if self.config.write_artifacts {
            self.write_snapshot_artifacts(snapshot.snapshot())?;
        }

        if report.has_errors() {
            self.write_report(&report)?;
            return Err(BuildError::ValidationFailed {
                errors: report.error_count(),
                report: Box::new(report),
            });
        }

        let templates = TemplateSet::load_from_roots(&self.config.template_roots)?;
        let plan = plan_outputs(snapshot.snapshot(), &templates, &self.config.build_root)?;
        report.extend(plan.collisions.iter().map(collision_issue));
        if self.config.strict_collisions {
            if let Some(collision) = plan.collisions.first() {
                self.write_report(&report)?;
                return Err(BuildError::Collision(collision.clone()));
            }
        }

        let renderer = Renderer::new(&templates, &self.config.build_root, self.config.strict_collisions)?;
        let render = match renderer.render_plan(snapshot.snapshot(), &plan) {
            Ok(render) => render,
            Err(err) => {
                if let BuildError::Collision(collision) = &err {
                    report.push(collision_issue(collision));
                }
                self.write_report(&report)?;
                return Err(err);
            }
        };
        report.extend(render.collisions.iter().map(collision_issue));

        self.write_report(&report)?;
        self.write_artifact("outputs.json", &render.written)?;

        log::info!(
            "build finished: {} file(s), {} warning(s)",
            render.written.len(),
            report.warning_count()
        );
        Ok(BuildOutcome {
            snapshot,
            report,
            plan,
            render,
        })
    }

    fn write_snapshot_artifacts(&self, snapshot: &CanonicalSnapshot) -> Result<()> {
        self.write_artifact("snapshot.json", snapshot)?;
        for (name, class) in &snapshot.classes {
            self.write_artifact(&format!("classes/{name}.json"), class)?;
            if let Some(schema) = &class.schema {
                self.write_artifact(&format!("classes/{name}.schema.json"), schema)?;
            }
        }
        Ok(())
    }

    fn write_report(&self, report: &ValidationReport) -> Result<()> {
        self.write_artifact("validation.json", report)
    }

    fn write_artifact<T: Serialize + ?Sized>(&self, relative: &str, value: &T) -> Result<()> {
        if !self.config.write_artifacts {
            return Ok(());
        }
        let path = self.config.artifacts_dir().join(relative);
        write_json(&path, value)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    let text = serde_json::to_string_pretty(&canonical_value(value)?)?;
    fs::write(path, text).map_err(|e| BuildError::io(path, e))?;
    log::debug!("wrote artifact {}", path.display());
    Ok(())
}

fn collision_issue(collision: &Collision) -> ValidationIssue {
    let mut owners: Vec<&str> = Vec::new();
    for claim in &collision.claims {
        if !owners.contains(&claim.instance_id.as_str()) {
            owners.push(&claim.instance_id);
        }
    }
    ValidationIssue::warn("output-collision", format!("output collision: {collision}"))
        .with_path(&collision.path.to_string_lossy())
        .with_instances(owners)
}
