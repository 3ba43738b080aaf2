//! Language-model transport boundary.
//!
//! The [`CompletionClient`] trait decouples agents from the actual model
//! backend. The bundled [`CommandCompletionClient`] pipes the conversation as
//! JSON into an external command and reads the reply from its stdout. Tests
//! use scripted clients that return predetermined replies.

use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::Message;
use crate::io::process::run_command_with_timeout;

/// Typed failure of a single completion attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("rate limit: {0}")]
    RateLimited(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

impl CompletionError {
    /// Classify a free-text failure message by the condition it describes.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
            CompletionError::RateLimited(message)
        } else if lower.contains("timeout") || lower.contains("timed out") {
            CompletionError::Timeout(message)
        } else {
            CompletionError::Other(message)
        }
    }

    /// Rate limits and timeouts are transient and worth backing off for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimited(_) | CompletionError::Timeout(_)
        )
    }
}

/// Abstraction over model backends.
pub trait CompletionClient: Send + Sync {
    /// Produce the assistant reply for `conversation`.
    fn complete(&self, conversation: &[Message]) -> Result<String, CompletionError>;
}

/// Completion client that spawns a command per request.
///
/// The conversation is written to stdin as a JSON array of
/// `{"role": ..., "content": ...}` objects; stdout is the reply.
#[derive(Debug, Clone)]
pub struct CommandCompletionClient {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandCompletionClient {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl CompletionClient for CommandCompletionClient {
    #[instrument(skip_all, fields(messages = conversation.len(), timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, conversation: &[Message]) -> Result<String, CompletionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| CompletionError::Other("completion command is empty".to_string()))?;
        let payload = serde_json::to_vec(conversation)
            .map_err(|e| CompletionError::Other(format!("serialize conversation: {e}")))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| CompletionError::Other(format!("{e:#}")))?;

        if output.timed_out {
            warn!("completion command timed out");
            return Err(CompletionError::Timeout(format!(
                "completion command timed out after {} seconds",
                self.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "completion command failed");
            return Err(CompletionError::classify(format!(
                "completion command exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let reply = output.stdout_lossy();
        if reply.trim().is_empty() {
            return Err(CompletionError::Other(
                "completion command produced no output".to_string(),
            ));
        }
        debug!(chars = reply.len(), "completion received");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_transient_failures() {
        assert!(matches!(
            CompletionError::classify("Rate limit exceeded"),
            CompletionError::RateLimited(_)
        ));
        assert!(matches!(
            CompletionError::classify("HTTP 429 Too Many Requests"),
            CompletionError::RateLimited(_)
        ));
        assert!(matches!(
            CompletionError::classify("Request timed out"),
            CompletionError::Timeout(_)
        ));
        let other = CompletionError::classify("invalid api key");
        assert!(!other.is_transient());
        assert_eq!(other.to_string(), "invalid api key");
    }

    #[cfg(unix)]
    fn client(script: &str) -> CommandCompletionClient {
        CommandCompletionClient::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(10),
            100_000,
        )
    }

    #[cfg(unix)]
    #[test]
    fn command_client_receives_conversation_json() {
        let reply = client("cat")
            .complete(&[Message::system("sys"), Message::user("hello")])
            .expect("reply");
        let parsed: Vec<Message> = serde_json::from_str(&reply).expect("json");
        assert_eq!(parsed, vec![Message::system("sys"), Message::user("hello")]);
    }

    #[cfg(unix)]
    #[test]
    fn command_client_classifies_stderr() {
        let err = client("cat >/dev/null; echo 'rate limit reached' >&2; exit 1")
            .complete(&[Message::user("x")])
            .unwrap_err();
        assert!(matches!(err, CompletionError::RateLimited(_)));
    }

    #[cfg(unix)]
    #[test]
    fn stalled_command_with_large_conversation_is_a_timeout() {
        let client = CommandCompletionClient::new(
            vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            Duration::from_secs(1),
            100_000,
        );
        let started = std::time::Instant::now();

        let err = client
            .complete(&[Message::user("x".repeat(200_000))])
            .unwrap_err();

        assert!(matches!(err, CompletionError::Timeout(_)), "{err:?}");
        assert!(err.is_transient());
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "{:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_client_rejects_empty_reply() {
        let err = client("cat >/dev/null")
            .complete(&[Message::user("x")])
            .unwrap_err();
        assert!(matches!(err, CompletionError::Other(_)));
    }
}
