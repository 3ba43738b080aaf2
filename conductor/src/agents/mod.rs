//! Coordinator and worker agents.
//!
//! Both behaviors share one [`AgentContext`]: the registry, the model client,
//! the shell executor, prompts, and configuration.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::io::completion::CompletionClient;
use crate::io::config::ConductorConfig;
use crate::io::prompt::PromptEngine;
use crate::io::shell::ShellExecutor;
use crate::registry::Registry;

pub mod coordinator;
pub mod worker;

/// Blocking delay used between model query attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Services shared by every agent of every project.
#[derive(Clone)]
pub struct AgentContext {
    pub registry: Arc<Registry>,
    pub client: Arc<dyn CompletionClient>,
    pub sleeper: Arc<dyn Sleeper>,
    pub shell: ShellExecutor,
    pub prompts: Arc<PromptEngine>,
    pub config: Arc<ConductorConfig>,
}

impl AgentContext {
    pub fn new(config: ConductorConfig, client: Arc<dyn CompletionClient>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            client,
            sleeper: Arc::new(ThreadSleeper),
            shell: ShellExecutor::new(config.command_timeout(), config.output_limit_bytes),
            prompts: Arc::new(PromptEngine::new()),
            config: Arc::new(config),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}
