//! Error Taxonomy
//!
//! Structural load errors are fatal. Unknown class and parent references are
//! not errors at all; they surface as warnings in the validation report.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::output::{Collision, OutputPathError};
use crate::validation::ValidationReport;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid source directory {path}: {reason}")]
    Path { path: PathBuf, reason: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Class inheritance cycle: {}", .path.join(" -> "))]
    ClassCycle { path: Vec<String> },

    #[error("Validation failed with {errors} error(s)")]
    ValidationFailed {
        errors: usize,
        report: Box<ValidationReport>,
    },

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template error in {template}: {message}")]
    Template { template: String, message: String },

    #[error("Invalid output path for template {template} (instance {instance}): {source}")]
    OutputPath {
        template: String,
        instance: String,
        #[source]
        source: OutputPathError,
    },

    #[error("Output collision: {0}")]
    Collision(Collision),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<config::ConfigError> for BuildError {
    fn from(err: config::ConfigError) -> Self {
        BuildError::Config(err.to_string())
    }
}

/// A malformed document. Line and column are 1-based and only present when
/// the failure came from the JSON parser itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub path: PathBuf,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub message: String,
}

impl ParseError {
    pub fn from_json(path: impl Into<PathBuf>, err: &serde_json::Error) -> Self {
        Self {
            path: path.into(),
            line: Some(err.line()),
            column: Some(err.column()),
            message: err.to_string(),
        }
    }

    pub fn invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line: None,
            column: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(
                f,
                "Parse error at {}:{}:{}: {}",
                self.path.display(),
                line,
                column,
                self.message
            ),
            _ => write!(f, "Parse error in {}: {}", self.path.display(), self.message),
        }
    }
}

impl std::error::Error for ParseError {}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;
