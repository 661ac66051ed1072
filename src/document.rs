//! Source Documents - scanning and reading
//!
//! Scan order is load-bearing: files of a directory come first
//! (alphabetically), then its subdirectories, each explored depth-first.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use walkdir::{DirEntry, WalkDir};

use crate::error::{BuildError, ParseError, Result};

/// Where a document came from. Used for deterministic fold ordering only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub root_index: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub provenance: Provenance,
    pub value: Value,
}

/// List every file under `root` with the given extension, in scan order.
pub fn scan(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(BuildError::Path {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut paths = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by(scan_order)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    for entry in walker {
        let entry = entry.map_err(|e| BuildError::Path {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            reason: e.to_string(),
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().map_or(false, |e| e == extension)
        {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

fn scan_order(a: &DirEntry, b: &DirEntry) -> Ordering {
    (a.file_type().is_dir(), a.file_name()).cmp(&(b.file_type().is_dir(), b.file_name()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map_or(false, |name| name.starts_with('.'))
}

/// Read and parse one JSON document.
pub fn read_document(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| ParseError::from_json(path, &e).into())
}

/// Load every document from the ordered roots: root order first, then scan
/// order within each root.
pub fn load_roots(roots: &[PathBuf], extension: &str) -> Result<Vec<SourceDocument>> {
    let mut documents = Vec::new();
    for (root_index, root) in roots.iter().enumerate() {
        let paths = scan(root, extension)?;
        log::debug!("scanned {} document(s) under {}", paths.len(), root.display());
        for path in paths {
            let value = read_document(&path)?;
            documents.push(SourceDocument {
                provenance: Provenance { root_index, path },
                value,
            });
        }
    }
    Ok(documents)
}
