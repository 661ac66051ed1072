//! DocForge CLI - build driver
//!
//! Commands: build, validate, snapshot, plan
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on validation failure or a fatal collision

use clap::{Parser, Subcommand};
use log::LevelFilter;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;

use docforge_core::{BuildConfig, BuildError, BuildPipeline, ValidationReport};

#[derive(Parser)]
#[command(name = "docforge-cli")]
#[command(about = "DocForge CLI - Document Model Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Class root, repeatable; replaces the config file's list
    #[arg(long = "class-root", global = true)]
    class_roots: Vec<PathBuf>,

    /// Instance root, repeatable; replaces the config file's list
    #[arg(long = "instance-root", global = true)]
    instance_roots: Vec<PathBuf>,

    /// Template root, repeatable; replaces the config file's list
    #[arg(long = "template-root", global = true)]
    template_roots: Vec<PathBuf>,

    #[arg(long, global = true)]
    build_root: Option<PathBuf>,

    /// Treat validation warnings as errors
    #[arg(long, global = true)]
    strict: bool,

    /// Abort on the first output collision
    #[arg(long, global = true)]
    strict_collisions: bool,

    /// Report fields not declared by the class schema
    #[arg(long, global = true)]
    extra_fields: bool,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and render everything
    Build,

    /// Load and validate; print the report
    Validate,

    /// Load and print the canonical snapshot
    Snapshot,

    /// Load and print planned outputs and collisions
    Plan,
}

impl Cli {
    fn build_config(&self) -> Result<BuildConfig, BuildError> {
        let mut config = BuildConfig::load(self.config.as_deref())?;
        if !self.class_roots.is_empty() {
            config.class_roots = self.class_roots.clone();
        }
        if !self.instance_roots.is_empty() {
            config.instance_roots = self.instance_roots.clone();
        }
        if !self.template_roots.is_empty() {
            config.template_roots = self.template_roots.clone();
        }
        if let Some(build_root) = &self.build_root {
            config.build_root = build_root.clone();
        }
        config.strict |= self.strict;
        config.strict_collisions |= self.strict_collisions;
        config.report_extra_fields |= self.extra_fields;
        Ok(config)
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => println!(r#"{{"success": false, "error": "{e}"}}"#),
    }
}

fn failure(err: &BuildError) -> ExitCode {
    let mut output = json!({
        "success": false,
        "error": err.to_string(),
    });
    if let BuildError::ValidationFailed { report, .. } = err {
        output["report"] = json!(report);
    }
    print_json(&output);
    match err {
        BuildError::ValidationFailed { .. } | BuildError::Collision(_) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn run(cli: &Cli) -> Result<ExitCode, BuildError> {
    let pipeline = BuildPipeline::new(cli.build_config()?);

    match cli.command {
        Commands::Build => {
            let outcome = pipeline.build()?;
            print_json(&json!({
                "success": true,
                "contentHash": outcome.snapshot.snapshot().build_meta.content_hash,
                "written": outcome.render.written,
                "report": outcome.report,
            }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate => {
            let loaded = pipeline.load()?;
            let mut report = ValidationReport { issues: loaded.issues };
            report.extend(pipeline.validate(&loaded.snapshot).issues);
            print_json(&json!(report));
            if report.has_errors() {
                Ok(ExitCode::from(2))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }

        Commands::Snapshot => {
            let loaded = pipeline.load()?;
            print_json(&loaded.snapshot.snapshot().to_value()?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Plan => {
            let loaded = pipeline.load()?;
            let plan = pipeline.plan(&loaded.snapshot)?;
            print_json(&json!(plan));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => failure(&e),
    }
}
