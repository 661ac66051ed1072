//! Build Configuration - defaults and config file
//!
//! Relative roots are resolved against the config file's directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::snapshot::SourceRoots;
use crate::validation::ValidationOptions;

pub const DEFAULT_BUILD_ROOT: &str = "build";
pub const DEFAULT_ARTIFACTS_DIR: &str = "_artifacts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub class_roots: Vec<PathBuf>,
    pub instance_roots: Vec<PathBuf>,
    pub template_roots: Vec<PathBuf>,
    pub build_root: PathBuf,
    /// Defaults to `<build_root>/_artifacts`.
    pub artifacts_dir: Option<PathBuf>,
    pub write_artifacts: bool,
    /// Warnings-as-errors for validation issues.
    pub strict: bool,
    /// Any output collision aborts the pass.
    pub strict_collisions: bool,
    pub report_extra_fields: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            class_roots: Vec::new(),
            instance_roots: Vec::new(),
            template_roots: Vec::new(),
            build_root: PathBuf::from(DEFAULT_BUILD_ROOT),
            artifacts_dir: None,
            write_artifacts: true,
            strict: false,
            strict_collisions: false,
            report_extra_fields: false,
        }
    }
}

impl BuildConfig {
    /// Load defaults, then the config file if one is given. The format
    /// follows the file extension. Relative paths in a file resolve against
    /// the file's directory.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = builder.add_source(config::Config::try_from(&BuildConfig::default())?);

        if let Some(file) = file {
            if !file.is_file() {
                return Err(BuildError::Config(format!("config file {} not found", file.display())));
            }
            builder = builder.add_source(config::File::from(file.to_path_buf()).required(true));
        }

        let mut loaded: BuildConfig = builder.build()?.try_deserialize()?;
        if let Some(base) = file.and_then(Path::parent) {
            loaded.rebase(base);
        }
        log::debug!("loaded build config: {loaded:?}");
        Ok(loaded)
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        self.class_roots.iter_mut().for_each(join);
        self.instance_roots.iter_mut().for_each(join);
        self.template_roots.iter_mut().for_each(join);
        join(&mut self.build_root);
        if let Some(dir) = self.artifacts_dir.as_mut() {
            join(dir);
        }
    }

    /// Every listed root must be an existing directory, and there must be
    /// something to load.
    pub fn check(&self) -> Result<()> {
        if self.class_roots.is_empty() && self.instance_roots.is_empty() {
            return Err(BuildError::Config(
                "at least one class root or instance root is required".to_string(),
            ));
        }
        for root in self
            .class_roots
            .iter()
            .chain(&self.instance_roots)
            .chain(&self.template_roots)
        {
            if !root.is_dir() {
                let reason = if root.exists() {
                    "not a directory"
                } else {
                    "does not exist"
                };
                return Err(BuildError::Path {
                    path: root.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| self.build_root.join(DEFAULT_ARTIFACTS_DIR))
    }

    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            strict: self.strict,
            report_extra_fields: self.report_extra_fields,
        }
    }

    pub fn source_roots(&self) -> SourceRoots {
        SourceRoots {
            classes: self.class_roots.clone(),
            instances: self.instance_roots.clone(),
            templates: self.template_roots.clone(),
        }
    }
}
