//! Test-only model clients, sleepers, and context builders.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agents::{AgentContext, Sleeper};
use crate::core::types::{Message, Role};
use crate::io::completion::{CompletionClient, CompletionError};
use crate::io::config::{ConductorConfig, CoordinatorConfig, WorkerConfig};

/// Returns queued results in order, then the fallback for every later call.
pub struct ScriptedClient {
    queue: Mutex<VecDeque<Result<String, CompletionError>>>,
    fallback: Result<String, CompletionError>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    pub fn new(results: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            queue: Mutex::new(results.into()),
            fallback: Err(CompletionError::Other(
                "scripted replies exhausted".to_string(),
            )),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue successful replies only.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|reply| Ok(reply.into())).collect())
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Ok(reply.into());
        self
    }

    /// Every conversation the client was asked to complete.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl CompletionClient for ScriptedClient {
    fn complete(&self, conversation: &[Message]) -> Result<String, CompletionError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(conversation.to_vec());
        self.queue
            .lock()
            .expect("queue lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

type Responder = dyn Fn(&[Message]) -> Result<String, CompletionError> + Send + Sync;

/// Answers each call with a closure over the conversation.
///
/// Suited to multi-agent runs where call order across threads is not fixed.
pub struct FnClient {
    responder: Box<Responder>,
}

impl FnClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, CompletionError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
        }
    }
}

impl CompletionClient for FnClient {
    fn complete(&self, conversation: &[Message]) -> Result<String, CompletionError> {
        (self.responder)(conversation)
    }
}

/// Content of the most recent user message.
pub fn last_user_message(conversation: &[Message]) -> &str {
    conversation
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map_or("", |message| message.content.as_str())
}

/// Records requested delays instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().expect("delays lock").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().expect("delays lock").push(duration);
    }
}

/// Config rooted at `root` with short timeouts and few worker steps.
pub fn test_config(root: &Path) -> ConductorConfig {
    ConductorConfig {
        projects_root: root.join("projects"),
        command_timeout_secs: 10,
        worker: WorkerConfig { max_steps: 3 },
        coordinator: CoordinatorConfig {
            poll_interval_secs: 1,
            phase_timeout_secs: 60,
            monitor_action_cap: 3,
        },
        ..ConductorConfig::default()
    }
}

/// Context over [`test_config`] that never sleeps between retries.
pub fn test_context(root: &Path, client: Arc<dyn CompletionClient>) -> AgentContext {
    AgentContext::new(test_config(root), client)
        .with_sleeper(Arc::new(RecordingSleeper::default()))
}
