//! Conductor CLI.
//!
//! `conductor run` creates one project, drives it to a terminal status, and
//! prints the final project snapshot as JSON. `conductor init-config` writes a
//! default `conductor.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use conductor::core::types::ProjectStatus;
use conductor::exit_codes;
use conductor::io::config::{ConductorConfig, load_config, write_config};
use conductor::logging;
use conductor::orchestrator::Orchestrator;
use tracing::{debug, info};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Coordinate language-model agents that build a project from a description"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "conductor.toml")]
    config: PathBuf,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a project and run its agents until it completes or fails.
    Run {
        /// Project name; characters outside `[A-Za-z0-9_-]` become `_`.
        #[arg(long)]
        name: String,
        /// Natural-language project description.
        #[arg(long)]
        description: String,
        /// Override `projects_root` from the config file.
        #[arg(long)]
        projects_root: Option<PathBuf>,
    },
    /// Write a default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            name,
            description,
            projects_root,
        } => cmd_run(&cli.config, &name, &description, projects_root),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

fn cmd_run(
    config_path: &Path,
    name: &str,
    description: &str,
    projects_root: Option<PathBuf>,
) -> Result<i32> {
    let mut config = load_config(config_path)?;
    if let Some(root) = projects_root {
        config.projects_root = root;
        config.validate()?;
    }
    debug!(config = %config_path.display(), "configuration loaded");

    let orchestrator = Orchestrator::from_config(config);
    let created = orchestrator.create_project(name, description)?;
    let project_id = created.project.id.clone();
    info!(project = %project_id, workdir = %created.project.workdir.display(), "project started");

    let status = orchestrator.wait(&project_id)?;
    let snapshot = orchestrator
        .project(&project_id)
        .context("project missing after run")?;
    let payload = serde_json::to_string_pretty(&snapshot).context("serialize project")?;
    println!("{payload}");

    Ok(match status {
        ProjectStatus::Completed => exit_codes::OK,
        _ => exit_codes::PROJECT_FAILED,
    })
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    write_config(path, &ConductorConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}
