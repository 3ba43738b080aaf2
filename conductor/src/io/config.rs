//! Conductor configuration stored in `conductor.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::git::GitIdentity;

/// Conductor configuration (TOML).
///
/// Missing fields default to the values the agents were tuned with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Parent directory of per-project working directories.
    pub projects_root: PathBuf,

    /// Timeout for each shell command issued by an agent.
    pub command_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    pub query: QueryConfig,
    pub worker: WorkerConfig,
    pub coordinator: CoordinatorConfig,
    pub git: GitIdentity,
    pub completion: CompletionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueryConfig {
    /// Model call attempts per query.
    pub max_attempts: u32,
    /// Delay before attempt `i` (0-based) is `backoff_base_secs^i` seconds.
    pub backoff_base_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Query/apply steps before the worker gives up and completes leniently.
    pub max_steps: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_steps: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interval between status digests while a phase runs.
    pub poll_interval_secs: u64,
    /// Wall-clock budget for one phase.
    pub phase_timeout_secs: u64,
    /// Diagnostic run-commands executed per status digest.
    pub monitor_action_cap: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            phase_timeout_secs: 60 * 60,
            monitor_action_cap: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    /// Command that reads a JSON conversation on stdin and prints the reply.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm-complete".to_string()],
            timeout_secs: 60,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("projects"),
            command_timeout_secs: 30,
            output_limit_bytes: 100_000,
            query: QueryConfig::default(),
            worker: WorkerConfig::default(),
            coordinator: CoordinatorConfig::default(),
            git: GitIdentity::default(),
            completion: CompletionConfig::default(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.projects_root.as_os_str().is_empty() {
            return Err(anyhow!("projects_root must not be empty"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.query.max_attempts == 0 {
            return Err(anyhow!("query.max_attempts must be > 0"));
        }
        if self.query.backoff_base_secs == 0 {
            return Err(anyhow!("query.backoff_base_secs must be > 0"));
        }
        if self.worker.max_steps == 0 {
            return Err(anyhow!("worker.max_steps must be > 0"));
        }
        if self.coordinator.poll_interval_secs == 0 {
            return Err(anyhow!("coordinator.poll_interval_secs must be > 0"));
        }
        if self.coordinator.phase_timeout_secs == 0 {
            return Err(anyhow!("coordinator.phase_timeout_secs must be > 0"));
        }
        if self.coordinator.monitor_action_cap == 0 {
            return Err(anyhow!("coordinator.monitor_action_cap must be > 0"));
        }
        if self.completion.timeout_secs == 0 {
            return Err(anyhow!("completion.timeout_secs must be > 0"));
        }
        if self.completion.command.is_empty() || self.completion.command[0].trim().is_empty() {
            return Err(anyhow!("completion.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.coordinator.poll_interval_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator.phase_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
