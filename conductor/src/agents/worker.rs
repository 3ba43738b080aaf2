//! Worker agent: implements one task through a bounded query/apply loop.
//!
//! A step queries the model (the task prompt first, a fixed continuation
//! prompt afterwards) and applies the reply. The task is done when an action's
//! output or the reply itself carries a completion phrase; the work is then
//! committed. Running out of steps still completes the task, without a commit.

use std::sync::Arc;

use anyhow::Result;
use tracing::{instrument, warn};

use crate::agents::AgentContext;
use crate::core::completion::{outputs_signal_completion, reply_signals_completion};
use crate::core::types::{AgentRole, AgentStatus, LogLevel, TaskStatus};
use crate::io::git::Git;
use crate::io::prompt::WORKER_CONTINUE_PROMPT;
use crate::io::workspace::Workspace;
use crate::session::AgentSession;

/// Everything a worker needs to know about its task.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub project_id: String,
    pub worker_id: String,
    pub task_id: String,
    pub description: String,
    pub branch: String,
    pub phase: u32,
    pub workspace: Arc<Workspace>,
}

impl WorkerAssignment {
    fn commit_message(&self) -> String {
        format!("Phase {}: {}", self.phase, self.description)
    }
}

/// Run the worker to a terminal state and return the task's final status.
#[instrument(skip_all, fields(task = %assignment.task_id, phase = assignment.phase))]
pub fn run_worker(ctx: AgentContext, assignment: WorkerAssignment) -> TaskStatus {
    let mut session = AgentSession::new(
        assignment.worker_id.clone(),
        AgentRole::Worker,
        ctx.clone(),
        Arc::clone(&assignment.workspace),
    );
    match execute(&ctx, &assignment, &mut session) {
        Ok(result) => finish(&ctx, &assignment, TaskStatus::Completed, result),
        Err(err) => {
            let message = format!("Task failed: {err:#}");
            session.log(LogLevel::Error, message.clone());
            finish(&ctx, &assignment, TaskStatus::Failed, Some(message))
        }
    }
}

/// The step loop. Returns the task result text.
fn execute(
    ctx: &AgentContext,
    assignment: &WorkerAssignment,
    session: &mut AgentSession,
) -> Result<Option<String>> {
    ctx.registry.update_agent(&assignment.worker_id, |agent| {
        agent.status = AgentStatus::Working;
        agent.current_task = Some(assignment.task_id.clone());
    })?;
    ctx.registry.update_assigned_task(
        &assignment.project_id,
        &assignment.task_id,
        &assignment.worker_id,
        |task| {
            if !task.status.is_terminal() {
                task.status = TaskStatus::InProgress;
            }
        },
    )?;
    session.log(
        LogLevel::Info,
        format!("Starting task: {}", assignment.description),
    );

    let max_steps = ctx.config.worker.max_steps;
    for step in 0..max_steps {
        let prompt = if step == 0 {
            ctx.prompts.worker_task(
                &assignment.description,
                &assignment.branch,
                assignment.workspace.root(),
                assignment.phase,
            )?
        } else {
            WORKER_CONTINUE_PROMPT.to_string()
        };

        let reply = session.query(&prompt);
        let applied = session.apply_reply(&reply);

        if outputs_signal_completion(applied.outputs()) || reply_signals_completion(&reply) {
            session.log(
                LogLevel::Info,
                format!("Task completion detected at step {}", step + 1),
            );
            commit(ctx, assignment, session);
            return Ok(Some(reply));
        }
    }

    session.log(
        LogLevel::Warning,
        format!("Reached maximum steps ({max_steps}) without explicit completion"),
    );
    Ok(None)
}

/// Stage and commit the task's work. A failed commit is logged, never fatal.
fn commit(ctx: &AgentContext, assignment: &WorkerAssignment, session: &AgentSession) {
    let git = Git::new(&ctx.shell, assignment.workspace.root());
    let message = assignment.commit_message();
    let results = git.commit_all(&message);
    match results.last() {
        Some(result) if !result.succeeded => session.log(
            LogLevel::Warning,
            format!("Commit failed:\n{}", result.output),
        ),
        _ => session.log(LogLevel::Info, format!("Committed: {message}")),
    }
}

/// Record the terminal state. A task already made terminal by the coordinator
/// keeps its status; the returned status is whatever the task ends up with.
fn finish(
    ctx: &AgentContext,
    assignment: &WorkerAssignment,
    status: TaskStatus,
    result: Option<String>,
) -> TaskStatus {
    let recorded = ctx.registry.update_assigned_task(
        &assignment.project_id,
        &assignment.task_id,
        &assignment.worker_id,
        |task| {
            if !task.status.is_terminal() {
                task.status = status;
                task.result = result;
            }
            task.status
        },
    );
    let final_status = match recorded {
        Ok(final_status) => final_status,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "could not record task outcome");
            TaskStatus::Failed
        }
    };

    let agent_status = match final_status {
        TaskStatus::Completed => AgentStatus::Completed,
        _ => AgentStatus::Failed,
    };
    if let Err(err) = ctx.registry.set_agent_status(&assignment.worker_id, agent_status) {
        warn!(err = %format!("{err:#}"), "could not record worker status");
    }
    final_status
}
