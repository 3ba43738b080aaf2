//! Coordinator agent: drives one project from setup to its last phase.
//!
//! States run in order: repository setup, requirements drafting, planning,
//! then one running state per phase. Each phase fans out one worker thread per
//! task and waits on a channel the workers signal when they finish. While
//! waiting, every quiet poll interval produces a status digest for the model,
//! whose diagnostic actions are applied for observability only.
//!
//! The phase fails once every task is terminal and at least one failed, or
//! when the phase deadline passes. Either way the project fails.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::agents::AgentContext;
use crate::agents::worker::{WorkerAssignment, run_worker};
use crate::core::parser::{SpawnRequest, parse_reply};
use crate::core::phase::{PhaseOutcome, phase_outcome, status_lines};
use crate::core::plan::{PhasePlan, build_plan};
use crate::core::types::{
    AgentRecord, AgentRole, AgentStatus, LogLevel, ProjectStatus, Task, TaskStatus, short_id,
};
use crate::io::git::Git;
use crate::io::prompt::planning_prompt;
use crate::io::workspace::Workspace;
use crate::session::{ActionScope, AgentSession};

/// Run the coordinator of `project_id` to completion and return the project's final status.
#[instrument(skip_all, fields(project = %short_id(&project_id)))]
pub fn run_coordinator(
    ctx: AgentContext,
    project_id: String,
    coordinator_id: String,
) -> ProjectStatus {
    match Coordinator::new(ctx.clone(), &project_id, &coordinator_id) {
        Ok(mut coordinator) => coordinator.run(),
        Err(err) => {
            error!(err = %format!("{err:#}"), "coordinator could not start");
            let failed = ctx
                .registry
                .set_project_status(&project_id, ProjectStatus::Failed);
            if let Err(err) = failed {
                debug!(err = %format!("{err:#}"), "project vanished before its coordinator started");
            }
            ProjectStatus::Failed
        }
    }
}

pub struct Coordinator {
    ctx: AgentContext,
    project_id: String,
    coordinator_id: String,
    name: String,
    description: String,
    workspace: Arc<Workspace>,
    session: AgentSession,
}

impl Coordinator {
    pub fn new(ctx: AgentContext, project_id: &str, coordinator_id: &str) -> Result<Self> {
        let project = ctx
            .registry
            .project(project_id)
            .ok_or_else(|| anyhow!("project not found: {project_id}"))?;
        let workspace = Arc::new(Workspace::new(project.workdir.clone()));
        let session = AgentSession::new(
            coordinator_id,
            AgentRole::Coordinator,
            ctx.clone(),
            Arc::clone(&workspace),
        );
        Ok(Self {
            ctx,
            project_id: project_id.to_string(),
            coordinator_id: coordinator_id.to_string(),
            name: project.name,
            description: project.description,
            workspace,
            session,
        })
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    /// Drive every state. Errors end in the `failed` status for both the
    /// coordinator and the project.
    pub fn run(&mut self) -> ProjectStatus {
        self.set_agent_status(AgentStatus::Working);
        let (project_status, agent_status) = match self.drive() {
            Ok(()) => {
                self.session
                    .log(LogLevel::Info, "Project completed successfully");
                (ProjectStatus::Completed, AgentStatus::Completed)
            }
            Err(err) => {
                self.session
                    .log(LogLevel::Error, format!("Project failed: {err:#}"));
                (ProjectStatus::Failed, AgentStatus::Failed)
            }
        };
        self.set_project_status(project_status);
        self.set_agent_status(agent_status);
        self.ctx
            .registry
            .project(&self.project_id)
            .map_or(project_status, |project| project.status)
    }

    fn drive(&mut self) -> Result<()> {
        self.setup_repository()?;
        self.draft_requirements()?;
        let plan = self.plan_tasks()?;
        self.ctx
            .registry
            .set_project_status(&self.project_id, ProjectStatus::InProgress)?;
        for (phase, spawns) in &plan.phases {
            self.run_phase(*phase, spawns)?;
        }
        Ok(())
    }

    fn setup_repository(&mut self) -> Result<()> {
        self.workspace.ensure_root()?;
        let git = Git::new(&self.ctx.shell, self.workspace.root());
        git.init_repository(&self.name, &self.ctx.config.git)
            .context("set up project repository")?;
        self.session.log(
            LogLevel::Info,
            format!("Project setup completed at {}", self.workspace.root().display()),
        );
        Ok(())
    }

    fn draft_requirements(&mut self) -> Result<()> {
        self.ctx
            .registry
            .set_project_status(&self.project_id, ProjectStatus::Planning)?;
        let prompt = self
            .ctx
            .prompts
            .requirements(&self.name, &self.description)
            .context("render requirements prompt")?;
        let reply = self.session.query(&prompt);
        self.session.apply_reply(&reply);
        Ok(())
    }

    fn plan_tasks(&mut self) -> Result<PhasePlan> {
        let reply = self.session.query(planning_prompt());
        let parsed = parse_reply(&reply);
        let spawns = parsed.spawns.clone();
        self.session
            .apply_actions(parsed, ActionScope::WITHOUT_FILES);

        let plan = build_plan(spawns);
        if plan.used_default {
            self.session.log(
                LogLevel::Warning,
                "No worker directives found in planning reply; using the default plan",
            );
        }
        for warning in &plan.warnings {
            self.session
                .log(LogLevel::Warning, format!("Warning: {warning}"));
        }
        self.session.log(
            LogLevel::Info,
            format!(
                "Created {} tasks across {} phases",
                plan.task_count(),
                plan.phases.len()
            ),
        );
        Ok(plan)
    }

    fn run_phase(&mut self, phase: u32, spawns: &[SpawnRequest]) -> Result<()> {
        self.session.log(
            LogLevel::Info,
            format!("Starting phase {phase} with {} tasks", spawns.len()),
        );
        let (tx, rx) = mpsc::channel();
        let mut workers = Vec::with_capacity(spawns.len());
        for spawn in spawns {
            let worker_id = Uuid::new_v4().to_string();
            let mut task = Task::new(&spawn.task_id, &spawn.description, &spawn.branch, phase);
            task.assigned_to = Some(worker_id.clone());
            let worker = AgentRecord::new(&worker_id, AgentRole::Worker, &self.project_id);
            self.ctx
                .registry
                .register_worker(&self.project_id, task, worker)?;

            let assignment = WorkerAssignment {
                project_id: self.project_id.clone(),
                worker_id: worker_id.clone(),
                task_id: spawn.task_id.clone(),
                description: spawn.description.clone(),
                branch: spawn.branch.clone(),
                phase,
                workspace: Arc::clone(&self.workspace),
            };
            let ctx = self.ctx.clone();
            let signal = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", short_id(&worker_id)))
                .spawn(move || {
                    let status = run_worker(ctx, assignment);
                    // The coordinator stops listening once the phase is decided.
                    let _ = signal.send(status);
                });
            match spawned {
                Ok(handle) => workers.push((worker_id.clone(), handle)),
                Err(err) => {
                    self.ctx.registry.fail_unfinished_tasks(
                        &self.project_id,
                        phase,
                        "worker could not be started",
                    )?;
                    self.reap_workers(phase, workers, &rx);
                    return Err(err)
                        .with_context(|| format!("start worker for {}", spawn.task_id));
                }
            }
            self.session.log(
                LogLevel::Info,
                format!(
                    "Created worker {} for task: {}",
                    short_id(&worker_id),
                    spawn.description
                ),
            );
        }
        drop(tx);
        let outcome = self.wait_for_phase(phase, &rx);
        self.reap_workers(phase, workers, &rx);
        outcome
    }

    /// Join the phase's workers once it is decided, surfacing panics. A worker
    /// still running (its task failed by the deadline) is detached.
    fn reap_workers(
        &self,
        phase: u32,
        workers: Vec<(String, JoinHandle<()>)>,
        signals: &Receiver<TaskStatus>,
    ) {
        let all_exited = senders_dropped(signals);
        for (worker_id, handle) in workers {
            let exiting = all_exited
                || handle.is_finished()
                || self
                    .ctx
                    .registry
                    .agent(&worker_id)
                    .is_some_and(|agent| agent.status.is_terminal());
            if !exiting {
                self.session.log(
                    LogLevel::Warning,
                    format!(
                        "Worker {} still running after phase {phase} was decided",
                        short_id(&worker_id)
                    ),
                );
                continue;
            }
            if handle.join().is_err() {
                self.session.log(
                    LogLevel::Error,
                    format!("Worker {} panicked", short_id(&worker_id)),
                );
                if let Err(err) = self
                    .ctx
                    .registry
                    .set_agent_status(&worker_id, AgentStatus::Failed)
                {
                    debug!(err = %format!("{err:#}"), "worker removed while running");
                }
            }
        }
    }

    /// Block until `phase` is decided.
    pub fn wait_for_phase(&mut self, phase: u32, signals: &Receiver<TaskStatus>) -> Result<()> {
        let deadline = Instant::now() + self.ctx.config.phase_timeout();
        let poll_interval = self.ctx.config.poll_interval();
        let mut workers_gone = false;
        loop {
            let tasks = self.ctx.registry.tasks(&self.project_id)?;
            match phase_outcome(&tasks, phase) {
                PhaseOutcome::Completed => {
                    self.session
                        .log(LogLevel::Info, format!("Phase {phase} completed"));
                    return Ok(());
                }
                PhaseOutcome::Failed(ids) => {
                    return Err(anyhow!("phase {phase} failed: {}", ids.join(", ")));
                }
                PhaseOutcome::Running => {}
            }

            if workers_gone {
                let ids = self.ctx.registry.fail_unfinished_tasks(
                    &self.project_id,
                    phase,
                    "worker exited without reporting",
                )?;
                self.session.log(
                    LogLevel::Error,
                    format!("Workers exited without finishing: {}", ids.join(", ")),
                );
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let ids = self.ctx.registry.fail_unfinished_tasks(
                    &self.project_id,
                    phase,
                    "phase deadline exceeded",
                )?;
                return Err(anyhow!(
                    "phase {phase} deadline exceeded with unfinished tasks: {}",
                    ids.join(", ")
                ));
            }

            match signals.recv_timeout(poll_interval.min(remaining)) {
                Ok(status) => debug!(phase, %status, "worker finished"),
                Err(RecvTimeoutError::Timeout) => self.monitor(phase)?,
                Err(RecvTimeoutError::Disconnected) => workers_gone = true,
            }
        }
    }

    /// Send a status digest and apply the capped diagnostic actions it returns.
    fn monitor(&mut self, phase: u32) -> Result<()> {
        let tasks = self.ctx.registry.tasks(&self.project_id)?;
        let prompt = self
            .ctx
            .prompts
            .status_digest(phase, &status_lines(&tasks, phase))
            .context("render status digest")?;
        let reply = self.session.query(&prompt);
        let cap = self.ctx.config.coordinator.monitor_action_cap;
        self.session
            .apply_actions(parse_reply(&reply), ActionScope::diagnostics(cap));
        Ok(())
    }

    fn set_project_status(&self, status: ProjectStatus) {
        if let Err(err) = self.ctx.registry.set_project_status(&self.project_id, status) {
            debug!(err = %format!("{err:#}"), "project removed while running");
        }
    }

    fn set_agent_status(&self, status: AgentStatus) {
        if let Err(err) = self.ctx.registry.set_agent_status(&self.coordinator_id, status) {
            debug!(err = %format!("{err:#}"), "coordinator removed while running");
        }
    }
}

/// Drain pending signals; true once every worker has dropped its sender.
fn senders_dropped(signals: &Receiver<TaskStatus>) -> bool {
    loop {
        match signals.try_recv() {
            Ok(_) => {}
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Message, Project};
    use crate::io::completion::{CompletionClient, CompletionError};
    use crate::test_support::{FnClient, ScriptedClient, test_context};
    use std::sync::mpsc::Sender;

    struct Fixture {
        _temp: tempfile::TempDir,
        ctx: AgentContext,
    }

    fn fixture(client: Arc<dyn CompletionClient>, statuses: &[TaskStatus]) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path(), client);
        let workdir = temp.path().join("projects/demo");
        let mut project = Project::new("p1", "demo", "a demo", workdir);
        project.coordinator_id = Some("coord".to_string());
        for (i, status) in statuses.iter().enumerate() {
            let mut task = Task::new(
                format!("phase1_t{i}"),
                format!("task {i}"),
                format!("feature/t{i}"),
                1,
            );
            task.assigned_to = Some(format!("w{i}"));
            task.status = *status;
            project.tasks.push(task);
        }
        ctx.registry.insert_project(project);
        ctx.registry
            .insert_agent(AgentRecord::new("coord", AgentRole::Coordinator, "p1"));
        Fixture { _temp: temp, ctx }
    }

    fn coordinator(f: &Fixture) -> Coordinator {
        Coordinator::new(f.ctx.clone(), "p1", "coord").expect("coordinator")
    }

    fn silent_channel() -> (Sender<TaskStatus>, Receiver<TaskStatus>) {
        mpsc::channel()
    }

    #[test]
    fn completed_phase_returns_without_querying() {
        let client = Arc::new(ScriptedClient::new(Vec::new()));
        let f = fixture(client.clone(), &[TaskStatus::Completed, TaskStatus::Completed]);
        let (_tx, rx) = silent_channel();

        coordinator(&f).wait_for_phase(1, &rx).expect("phase");

        assert_eq!(client.call_count(), 0);
    }

    #[test]
    fn failed_task_fails_the_phase_once_all_are_terminal() {
        let f = fixture(
            Arc::new(ScriptedClient::new(Vec::new())),
            &[TaskStatus::Completed, TaskStatus::Failed],
        );
        let (_tx, rx) = silent_channel();

        let err = coordinator(&f).wait_for_phase(1, &rx).unwrap_err();

        assert!(err.to_string().contains("phase1_t1"), "{err}");
    }

    #[test]
    fn expired_deadline_fails_unfinished_tasks() {
        let mut f = fixture(
            Arc::new(ScriptedClient::new(Vec::new())),
            &[TaskStatus::Completed, TaskStatus::InProgress],
        );
        let mut config = (*f.ctx.config).clone();
        config.coordinator.phase_timeout_secs = 0;
        f.ctx.config = Arc::new(config);
        let (_tx, rx) = silent_channel();

        let err = coordinator(&f).wait_for_phase(1, &rx).unwrap_err();

        assert!(format!("{err:#}").contains("deadline"), "{err:#}");
        let tasks = f.ctx.registry.tasks("p1").expect("tasks");
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert_eq!(tasks[1].result.as_deref(), Some("phase deadline exceeded"));
    }

    #[test]
    fn vanished_workers_fail_the_phase() {
        let f = fixture(
            Arc::new(ScriptedClient::new(Vec::new())),
            &[TaskStatus::Pending],
        );
        let (tx, rx) = silent_channel();
        drop(tx);

        let err = coordinator(&f).wait_for_phase(1, &rx).unwrap_err();

        assert!(err.to_string().contains("phase1_t0"), "{err}");
        let tasks = f.ctx.registry.tasks("p1").expect("tasks");
        assert_eq!(
            tasks[0].result.as_deref(),
            Some("worker exited without reporting")
        );
    }

    #[cfg(unix)]
    #[test]
    fn quiet_poll_sends_digest_and_caps_diagnostics() {
        let mut f = fixture(
            Arc::new(ScriptedClient::new(Vec::new())),
            &[TaskStatus::InProgress],
        );
        let registry = Arc::clone(&f.ctx.registry);
        f.ctx.client = Arc::new(FnClient::new(move |conversation: &[Message]| {
            registry
                .update_assigned_task("p1", "phase1_t0", "w0", |task| {
                    task.status = TaskStatus::Completed;
                })
                .expect("complete task");
            let digest = crate::test_support::last_user_message(conversation);
            assert!(digest.contains("- task 0: in_progress"), "{digest}");
            Ok("```bash\necho 1\necho 2\necho 3\necho 4\n```".to_string())
        }));
        let (_tx, rx) = silent_channel();
        let mut coordinator = coordinator(&f);

        coordinator.wait_for_phase(1, &rx).expect("phase");

        let executed = coordinator
            .session()
            .conversation()
            .iter()
            .filter(|message| message.content.starts_with("Command executed:"))
            .count();
        assert_eq!(executed, 3);
    }

    #[test]
    fn panicking_worker_is_joined_and_reported() {
        let mut f = fixture(Arc::new(ScriptedClient::new(Vec::new())), &[]);
        f.ctx.client = Arc::new(FnClient::new(
            |_: &[Message]| -> Result<String, CompletionError> {
                panic!("model transport crashed")
            },
        ));
        let mut coordinator = coordinator(&f);

        let err = coordinator
            .run_phase(
                1,
                &[SpawnRequest::new("phase1_api", "Build the API", "feature/api")],
            )
            .unwrap_err();

        assert!(err.to_string().contains("phase1_api"), "{err}");
        let project = f.ctx.registry.project("p1").expect("project");
        assert_eq!(
            project.tasks[0].result.as_deref(),
            Some("worker exited without reporting")
        );
        let worker_id = project.worker_ids[0].clone();
        assert_eq!(
            f.ctx.registry.agent(&worker_id).expect("worker").status,
            AgentStatus::Failed
        );
        assert!(
            f.ctx
                .registry
                .logs("coord")
                .iter()
                .any(|entry| entry.message.ends_with("panicked"))
        );
    }

    #[test]
    fn finished_workers_are_joined_without_detaching() {
        let mut f = fixture(Arc::new(ScriptedClient::new(Vec::new())), &[]);
        f.ctx.client = Arc::new(FnClient::new(|_: &[Message]| {
            Ok("Task completed.".to_string())
        }));
        let mut coordinator = coordinator(&f);

        coordinator
            .run_phase(
                1,
                &[SpawnRequest::new("phase1_api", "Build the API", "feature/api")],
            )
            .expect("phase");

        assert!(
            !f.ctx
                .registry
                .logs("coord")
                .iter()
                .any(|entry| entry.message.contains("still running"))
        );
    }

    #[test]
    fn setup_failure_fails_project_and_coordinator() {
        let f = fixture(Arc::new(ScriptedClient::new(Vec::new())), &[]);
        let projects_root = f.ctx.config.projects_root.clone();
        std::fs::write(&projects_root, "not a directory").expect("block projects root");

        let status = coordinator(&f).run();

        assert_eq!(status, ProjectStatus::Failed);
        assert_eq!(
            f.ctx.registry.agent("coord").expect("agent").status,
            AgentStatus::Failed
        );
        assert!(
            f.ctx
                .registry
                .logs("coord")
                .iter()
                .any(|entry| entry.message.starts_with("Project failed"))
        );
    }
}
