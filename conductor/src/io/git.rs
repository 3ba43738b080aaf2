//! Version-control adapter for project working directories.
//!
//! Every git invocation goes through the [`ShellExecutor`], so failures come
//! back as captured output the caller can log or feed to the model.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::shell::{ExecutionResult, ShellExecutor, shell_quote};

/// Author identity written into the repository config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitIdentity {
    pub user_name: String,
    pub user_email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            user_name: "SWE-Agent".to_string(),
            user_email: "agent@example.com".to_string(),
        }
    }
}

/// Wrapper for executing git commands in a project directory.
#[derive(Debug, Clone)]
pub struct Git<'a> {
    shell: &'a ShellExecutor,
    workdir: PathBuf,
}

impl<'a> Git<'a> {
    pub fn new(shell: &'a ShellExecutor, workdir: impl Into<PathBuf>) -> Self {
        Self {
            shell,
            workdir: workdir.into(),
        }
    }

    /// Create the repository, set the identity, and commit a placeholder README.
    ///
    /// Stops at the first failing command and returns its captured output as the error.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn init_repository(
        &self,
        project_name: &str,
        identity: &GitIdentity,
    ) -> Result<Vec<ExecutionResult>> {
        let mut results = Vec::new();
        for command in setup_commands(project_name, identity) {
            let result = self.shell.run(&command, &self.workdir);
            debug!(succeeded = result.succeeded, command = %command, "setup command");
            if !result.succeeded {
                warn!(command = %command, "repository setup failed");
                return Err(anyhow!("repository setup failed:\n{}", result.output));
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Stage everything and commit. Returns each step's result; the caller decides
    /// whether a failed commit matters.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Vec<ExecutionResult> {
        let mut results = Vec::new();
        for command in commit_commands(message) {
            let result = self.shell.run(&command, &self.workdir);
            let succeeded = result.succeeded;
            results.push(result);
            if !succeeded {
                break;
            }
        }
        results
    }
}

/// The fixed repository bootstrap sequence.
pub fn setup_commands(project_name: &str, identity: &GitIdentity) -> Vec<String> {
    vec![
        "git init".to_string(),
        format!("git config user.name {}", shell_quote(&identity.user_name)),
        format!("git config user.email {}", shell_quote(&identity.user_email)),
        format!("echo {} > README.md", shell_quote(&format!("# {project_name}"))),
        "git add README.md".to_string(),
        format!("git commit -m {}", shell_quote("Initial commit")),
    ]
}

pub fn commit_commands(message: &str) -> Vec<String> {
    vec![
        "git add -A".to_string(),
        format!("git commit -m {}", shell_quote(message)),
    ]
}
