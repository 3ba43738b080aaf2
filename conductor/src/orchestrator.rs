//! Library control surface: create, observe, and discard projects.
//!
//! Each project gets one coordinator thread. Observers read cloned snapshots
//! from the registry and never block the agents.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::AgentContext;
use crate::agents::coordinator::run_coordinator;
use crate::core::types::{AgentRecord, AgentRole, LogEntry, Project, ProjectStatus, short_id};
use crate::io::completion::CommandCompletionClient;
use crate::io::config::ConductorConfig;
use crate::registry::Registry;

/// An agent record together with its audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub agent: AgentRecord,
    pub logs: Vec<LogEntry>,
}

/// A project with its tasks and every agent working on it.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSnapshot {
    #[serde(flatten)]
    pub project: Project,
    pub coordinator: Option<AgentSnapshot>,
    pub workers: Vec<AgentSnapshot>,
}

/// Audit logs of one project, workers keyed by agent id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectLogs {
    pub coordinator: Vec<LogEntry>,
    pub workers: BTreeMap<String, Vec<LogEntry>>,
}

pub struct Orchestrator {
    ctx: AgentContext,
    coordinators: Mutex<HashMap<String, JoinHandle<ProjectStatus>>>,
}

impl Orchestrator {
    pub fn new(ctx: AgentContext) -> Self {
        Self {
            ctx,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    /// Orchestrator backed by the configured completion command.
    pub fn from_config(config: ConductorConfig) -> Self {
        let client = CommandCompletionClient::new(
            config.completion.command.clone(),
            config.completion_timeout(),
            config.output_limit_bytes,
        );
        Self::new(AgentContext::new(config, Arc::new(client)))
    }

    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// Register a project and start its coordinator.
    pub fn create_project(&self, name: &str, description: &str) -> Result<ProjectSnapshot> {
        if name.trim().is_empty() {
            bail!("project name must not be empty");
        }
        let name = sanitize_name(name.trim());
        let workdir = project_dir(&self.ctx.config.projects_root, &name)?;
        let project_id = Uuid::new_v4().to_string();
        let coordinator_id = Uuid::new_v4().to_string();

        let mut project = Project::new(&project_id, &name, description, workdir);
        project.coordinator_id = Some(coordinator_id.clone());
        self.ctx.registry.insert_project(project);
        self.ctx.registry.insert_agent(AgentRecord::new(
            &coordinator_id,
            AgentRole::Coordinator,
            &project_id,
        ));

        let ctx = self.ctx.clone();
        let thread_project_id = project_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("coordinator-{}", short_id(&project_id)))
            .spawn(move || run_coordinator(ctx, thread_project_id, coordinator_id));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.ctx
                    .registry
                    .set_project_status(&project_id, ProjectStatus::Failed)?;
                return Err(err).context("start coordinator thread");
            }
        };
        self.handles().insert(project_id.clone(), handle);
        info!(project = %short_id(&project_id), name = %name, "project created");

        self.project(&project_id)
            .ok_or_else(|| anyhow!("project disappeared after creation: {project_id}"))
    }

    pub fn project(&self, project_id: &str) -> Option<ProjectSnapshot> {
        let project = self.ctx.registry.project(project_id)?;
        Some(self.snapshot(project))
    }

    /// Every project, oldest first.
    pub fn projects(&self) -> Vec<ProjectSnapshot> {
        self.ctx
            .registry
            .projects()
            .into_iter()
            .map(|project| self.snapshot(project))
            .collect()
    }

    /// Discard a project, its agents, and their logs. Running threads are not
    /// stopped; their later writes are dropped by the registry.
    pub fn delete_project(&self, project_id: &str) -> bool {
        let removed = self.ctx.registry.remove_project(project_id);
        if removed {
            self.handles().remove(project_id);
            info!(project = %short_id(project_id), "project deleted");
        }
        removed
    }

    pub fn project_logs(&self, project_id: &str) -> Option<ProjectLogs> {
        let project = self.ctx.registry.project(project_id)?;
        let coordinator = project
            .coordinator_id
            .as_deref()
            .map(|id| self.ctx.registry.logs(id))
            .unwrap_or_default();
        let workers = project
            .worker_ids
            .iter()
            .map(|id| (id.clone(), self.ctx.registry.logs(id)))
            .collect();
        Some(ProjectLogs {
            coordinator,
            workers,
        })
    }

    /// Block until the project's coordinator thread exits.
    pub fn wait(&self, project_id: &str) -> Result<ProjectStatus> {
        let handle = self.handles().remove(project_id);
        match handle {
            Some(handle) => handle.join().map_err(|_| {
                warn!(project = %short_id(project_id), "coordinator thread panicked");
                anyhow!("coordinator thread panicked for project {project_id}")
            }),
            None => self
                .ctx
                .registry
                .project(project_id)
                .map(|project| project.status)
                .ok_or_else(|| anyhow!("project not found: {project_id}")),
        }
    }

    fn snapshot(&self, project: Project) -> ProjectSnapshot {
        let coordinator = project
            .coordinator_id
            .as_deref()
            .and_then(|id| self.agent_snapshot(id));
        let workers = project
            .worker_ids
            .iter()
            .filter_map(|id| self.agent_snapshot(id))
            .collect();
        ProjectSnapshot {
            project,
            coordinator,
            workers,
        }
    }

    fn agent_snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let agent = self.ctx.registry.agent(agent_id)?;
        Some(AgentSnapshot {
            agent,
            logs: self.ctx.registry.logs(agent_id),
        })
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<ProjectStatus>>> {
        self.coordinators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Absolute working directory for a project: `root/<name lowercased>`.
pub fn project_dir(root: &Path, name: &str) -> Result<PathBuf> {
    let dir = root.join(name.to_lowercase());
    std::path::absolute(&dir).with_context(|| format!("resolve {}", dir.display()))
}
