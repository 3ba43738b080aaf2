//! Prompt rendering for coordinator and worker conversations.

use std::path::Path;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::AgentRole;

const COORDINATOR_SYSTEM: &str = include_str!("prompts/coordinator_system.md");
const WORKER_SYSTEM: &str = include_str!("prompts/worker_system.md");
const REQUIREMENTS_TEMPLATE: &str = include_str!("prompts/requirements.md");
const PLANNING_PROMPT: &str = include_str!("prompts/planning.md");
const STATUS_DIGEST_TEMPLATE: &str = include_str!("prompts/status_digest.md");
const WORKER_TASK_TEMPLATE: &str = include_str!("prompts/worker_task.md");

/// Prompt used for every worker step after the first.
pub const WORKER_CONTINUE_PROMPT: &str = "Continue with the implementation. What's next?";

/// Fixed role instructions that open every conversation.
pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Coordinator => COORDINATOR_SYSTEM,
        AgentRole::Worker => WORKER_SYSTEM,
    }
}

pub fn planning_prompt() -> &'static str {
    PLANNING_PROMPT
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("requirements", REQUIREMENTS_TEMPLATE)
            .expect("requirements template should be valid");
        env.add_template("status_digest", STATUS_DIGEST_TEMPLATE)
            .expect("status digest template should be valid");
        env.add_template("worker_task", WORKER_TASK_TEMPLATE)
            .expect("worker task template should be valid");
        Self { env }
    }

    pub fn requirements(&self, name: &str, description: &str) -> Result<String> {
        let template = self.env.get_template("requirements")?;
        Ok(template.render(context! { name => name, description => description.trim() })?)
    }

    pub fn status_digest(&self, phase: u32, lines: &[String]) -> Result<String> {
        let template = self.env.get_template("status_digest")?;
        Ok(template.render(context! { phase => phase, lines => lines })?)
    }

    pub fn worker_task(
        &self,
        description: &str,
        branch: &str,
        workdir: &Path,
        phase: u32,
    ) -> Result<String> {
        let template = self.env.get_template("worker_task")?;
        Ok(template.render(context! {
            description => description,
            branch => branch,
            workdir => workdir.display().to_string(),
            phase => phase,
        })?)
    }
}
