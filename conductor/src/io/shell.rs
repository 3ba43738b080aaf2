//! Command Executor: runs one shell command and reports the outcome as data.
//!
//! The captured output string is fed back into the model conversation verbatim,
//! so its layout is fixed:
//!
//! ```text
//! $ <command>
//! <stdout>
//! STDERR: <stderr>
//! Exit code: <n>
//! ```
//!
//! The stdout and stderr sections are omitted when empty.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::parser::preview;
use crate::io::process::run_command_with_timeout;

/// Exit code reported when the command never produced one (launch error, timeout, signal).
pub const NO_EXIT_CODE: i32 = -1;

/// Outcome of a single shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub output: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    fn failure(command: &str, message: &str) -> Self {
        Self {
            succeeded: false,
            output: format!("$ {command}\nERROR: {message}"),
            exit_code: NO_EXIT_CODE,
        }
    }
}

/// Stateless shell runner shared by every agent.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ShellExecutor {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
        }
    }

    /// Run `command` in `workdir` with the default timeout.
    pub fn run(&self, command: &str, workdir: &Path) -> ExecutionResult {
        self.run_with_timeout(command, workdir, self.timeout)
    }

    /// Run `command` in `workdir`, creating the directory if absent. Never fails:
    /// launch errors and timeouts are reported inside the result.
    #[instrument(skip_all, fields(command = %preview(command, 100), timeout_secs = timeout.as_secs()))]
    pub fn run_with_timeout(
        &self,
        command: &str,
        workdir: &Path,
        timeout: Duration,
    ) -> ExecutionResult {
        debug!(workdir = %workdir.display(), "executing shell command");
        if let Err(e) = fs::create_dir_all(workdir) {
            warn!(err = %e, "failed to create working directory");
            return ExecutionResult::failure(command, &e.to_string());
        }

        let mut cmd = shell_command(command);
        cmd.current_dir(workdir);
        let output = match run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes) {
            Ok(output) => output,
            Err(e) => return ExecutionResult::failure(command, &format!("{e:#}")),
        };

        if output.timed_out {
            return ExecutionResult::failure(
                command,
                &format!("Command timed out after {} seconds", timeout.as_secs()),
            );
        }

        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        let exit_code = output.status.code().unwrap_or(NO_EXIT_CODE);

        let mut text = format!("$ {command}\n");
        if !stdout.is_empty() {
            text.push_str(&stdout);
            text.push('\n');
        }
        if !stderr.is_empty() {
            text.push_str("STDERR: ");
            text.push_str(&stderr);
            text.push('\n');
        }
        text.push_str(&format!("Exit code: {exit_code}\n"));

        let succeeded = output.status.success();
        debug!(succeeded, exit_code, "shell command finished");
        ExecutionResult {
            succeeded,
            output: text,
            exit_code,
        }
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Quote `value` as a single shell word.
#[cfg(unix)]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(windows)]
pub fn shell_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "'"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor() -> ShellExecutor {
        ShellExecutor::new(Duration::from_secs(10), 100_000)
    }

    #[test]
    fn echo_output_has_exact_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = executor().run("echo hi", temp.path());
        assert!(result.succeeded);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "$ echo hi\nhi\n\nExit code: 0\n");
    }

    #[test]
    fn stderr_and_exit_code_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = executor().run("echo oops >&2; exit 2", temp.path());
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 2);
        assert_eq!(
            result.output,
            "$ echo oops >&2; exit 2\nSTDERR: oops\n\nExit code: 2\n"
        );
    }

    #[test]
    fn creates_missing_working_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workdir = temp.path().join("a/b");
        let result = executor().run("pwd", &workdir);
        assert!(result.succeeded);
        assert!(workdir.is_dir());
    }

    #[test]
    fn timeout_is_a_failure_value() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = executor().run_with_timeout("sleep 5", temp.path(), Duration::from_secs(1));
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert_eq!(
            result.output,
            "$ sleep 5\nERROR: Command timed out after 1 seconds"
        );
    }

    #[test]
    fn background_process_returns_within_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let shell = ShellExecutor::new(Duration::from_secs(1), 100_000);
        let started = std::time::Instant::now();

        let result = shell.run("sleep 5 &", temp.path());

        assert!(
            started.elapsed() < Duration::from_secs(3),
            "{:?}",
            started.elapsed()
        );
        assert!(result.succeeded);
        assert_eq!(result.output, "$ sleep 5 &\nExit code: 0\n");
    }

    #[test]
    fn quoting_survives_single_quotes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let word = shell_quote("it's \"fine\"");
        let result = executor().run(&format!("printf %s {word}"), temp.path());
        assert!(result.output.contains("it's \"fine\""));
    }
}
