//! Template System - ordered template roots
//!
//! A template's key is its root-relative path without the `.hbs` suffix.
//! Later roots override earlier ones key by key.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::document::scan;
use crate::error::{BuildError, Result};

pub type TemplateKey = String;

pub const TEMPLATE_EXTENSION: &str = "hbs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub key: TemplateKey,
    pub source: String,
    /// `None` for templates registered in memory.
    pub path: Option<PathBuf>,
}

/// Template set - loads and caches template sources
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: BTreeMap<TemplateKey, TemplateSource>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_roots(roots: &[PathBuf]) -> Result<Self> {
        let mut set = Self::new();
        for root in roots {
            for path in scan(root, TEMPLATE_EXTENSION)? {
                let key = template_key(root, &path)?;
                let source = fs::read_to_string(&path).map_err(|e| BuildError::io(&path, e))?;
                if set.templates.contains_key(&key) {
                    log::debug!("template {} overridden by {}", key, path.display());
                }
                set.templates.insert(
                    key.clone(),
                    TemplateSource {
                        key,
                        source,
                        path: Some(path),
                    },
                );
            }
        }
        log::info!("loaded {} template(s)", set.templates.len());
        Ok(set)
    }

    pub fn get(&self, key: &str) -> Option<&TemplateSource> {
        self.templates.get(normalize_key(key))
    }

    /// Canonical key for a directive's template reference, which may carry
    /// the `.hbs` suffix.
    pub fn key_for(&self, reference: &str) -> Option<&str> {
        self.get(reference).map(|t| t.key.as_str())
    }

    pub fn list(&self) -> Vec<&TemplateSource> {
        self.templates.values().collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn register(&mut self, key: impl Into<TemplateKey>, source: impl Into<String>) {
        let key = key.into();
        let key = normalize_key(&key).to_string();
        self.templates.insert(
            key.clone(),
            TemplateSource {
                key,
                source: source.into(),
                path: None,
            },
        );
    }
}

fn normalize_key(key: &str) -> &str {
    let key = key.strip_prefix('/').unwrap_or(key);
    key.strip_suffix(".hbs").unwrap_or(key)
}

fn template_key(root: &Path, path: &Path) -> Result<TemplateKey> {
    let relative = path.strip_prefix(root).map_err(|_| BuildError::Path {
        path: path.to_path_buf(),
        reason: format!("not under template root {}", root.display()),
    })?;
    let joined: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(normalize_key(&joined.join("/")).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_later_root_overrides_key() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        fs::create_dir_all(first.path().join("pages")).unwrap();
        fs::create_dir_all(second.path().join("pages")).unwrap();
        fs::write(first.path().join("pages/post.html.hbs"), "one").unwrap();
        fs::write(first.path().join("index.html.hbs"), "index").unwrap();
        fs::write(second.path().join("pages/post.html.hbs"), "two").unwrap();

        let set =
            TemplateSet::load_from_roots(&[first.path().to_path_buf(), second.path().to_path_buf()]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("pages/post.html").unwrap().source, "two");
        assert_eq!(set.key_for("pages/post.html.hbs"), Some("pages/post.html"));
        assert_eq!(set.get("index.html").unwrap().source, "index");
    }

    #[test]
    fn test_register_normalizes_key() {
        let mut set = TemplateSet::new();
        set.register("feeds/rss.xml.hbs", "x");
        assert!(set.get("feeds/rss.xml").is_some());
        assert!(set.get("missing").is_none());
    }
}
