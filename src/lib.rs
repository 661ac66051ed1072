//! DocForge Core - Document Model Compiler
//!
//! # The Five Rules (Non-Negotiable)
//! 1. Later Sources Win
//! 2. Arrays Append Unless Reset
//! 3. The Build Always Validates
//! 4. Nothing Is Written Outside The Build Root
//! 5. Identical Sources Hash Identically

pub mod error;
pub mod merge;
pub mod document;
pub mod classes;
pub mod instances;
pub mod snapshot;
pub mod validation;
pub mod hashing;
pub mod templates;
pub mod output;
pub mod render;
pub mod config;
pub mod pipeline;

pub use error::{BuildError, ParseError, Result};
pub use merge::{merge, merge_value};
pub use classes::{ClassDefinition, ClassResolver, ResolvedClasses, resolve_classes};
pub use instances::{BuildDirective, Instance, GLOBAL_ID};
pub use snapshot::{CanonicalSnapshot, Snapshot, SnapshotDraft};
pub use validation::{IssueLevel, ValidationIssue, ValidationOptions, ValidationReport, Validator};
pub use hashing::{canonical_json, canonical_value, compute_content_hash};
pub use templates::TemplateSet;
pub use output::{resolve_output_path, Collision, OutputPathError, OutputPlan};
pub use config::BuildConfig;
pub use pipeline::{BuildOutcome, BuildPipeline, LoadOutcome};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
