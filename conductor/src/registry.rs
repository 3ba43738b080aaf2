//! Process-wide store of projects, tasks, agents, and audit logs.
//!
//! Every record sits behind its own mutex; the maps themselves sit behind
//! `RwLock`s so inserting a record is exclusive while lookups run in parallel.
//! Callers only ever receive cloned snapshots, and all writes go through the
//! accessors below.
//!
//! Tasks live inside their project record. A worker may mutate a task only
//! while it holds the task's assignment ([`Registry::update_assigned_task`]);
//! the coordinator uses [`Registry::fail_unfinished_tasks`] for terminal
//! bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use crate::core::types::{
    AgentRecord, AgentStatus, LogEntry, Project, ProjectStatus, Task, TaskStatus,
};

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(record: &Mutex<T>) -> MutexGuard<'_, T> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_map<K, V>(map: &RwLock<HashMap<K, V>>) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_map<K, V>(
    map: &RwLock<HashMap<K, V>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<K, V>> {
    map.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct Registry {
    projects: RwLock<HashMap<String, Shared<Project>>>,
    agents: RwLock<HashMap<String, Shared<AgentRecord>>>,
    logs: RwLock<HashMap<String, Shared<Vec<LogEntry>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- projects ----

    pub fn insert_project(&self, project: Project) {
        debug!(project_id = %project.id, name = %project.name, "registering project");
        write_map(&self.projects).insert(project.id.clone(), Arc::new(Mutex::new(project)));
    }

    fn project_record(&self, project_id: &str) -> Result<Shared<Project>> {
        read_map(&self.projects)
            .get(project_id)
            .cloned()
            .ok_or_else(|| anyhow!("project not found: {project_id}"))
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        let record = self.project_record(project_id).ok()?;
        let project = lock(&record).clone();
        Some(project)
    }

    /// Snapshot of every project, oldest first.
    pub fn projects(&self) -> Vec<Project> {
        let records: Vec<Shared<Project>> = read_map(&self.projects).values().cloned().collect();
        let mut projects: Vec<Project> = records.iter().map(|r| lock(r).clone()).collect();
        projects.sort_by_key(|project| project.created_at);
        projects
    }

    pub fn update_project<R>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut Project) -> R,
    ) -> Result<R> {
        let record = self.project_record(project_id)?;
        let mut project = lock(&record);
        Ok(f(&mut project))
    }

    /// Move a project to `status` if the transition is forward (or to `Failed`).
    ///
    /// Returns whether the status changed.
    pub fn set_project_status(&self, project_id: &str, status: ProjectStatus) -> Result<bool> {
        self.update_project(project_id, |project| {
            if project.status == status {
                return false;
            }
            if !project.status.can_transition_to(status) {
                warn!(from = ?project.status, to = ?status, "ignoring backward project transition");
                return false;
            }
            project.status = status;
            true
        })
    }

    /// Remove a project together with its agents and their logs.
    pub fn remove_project(&self, project_id: &str) -> bool {
        let Some(record) = write_map(&self.projects).remove(project_id) else {
            return false;
        };
        let agent_ids: Vec<String> = {
            let project = lock(&record);
            project
                .coordinator_id
                .iter()
                .chain(project.worker_ids.iter())
                .cloned()
                .collect()
        };
        let mut agents = write_map(&self.agents);
        let mut logs = write_map(&self.logs);
        for agent_id in &agent_ids {
            agents.remove(agent_id);
            logs.remove(agent_id);
        }
        debug!(project_id, agents = agent_ids.len(), "removed project");
        true
    }

    // ---- tasks ----

    pub fn tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.update_project(project_id, |project| project.tasks.clone())
    }

    /// Persist a new task together with the worker assigned to it.
    pub fn register_worker(&self, project_id: &str, task: Task, worker: AgentRecord) -> Result<()> {
        if task.assigned_to.as_deref() != Some(worker.id.as_str()) {
            return Err(anyhow!(
                "task {} is not assigned to worker {}",
                task.id,
                worker.id
            ));
        }
        let worker_id = worker.id.clone();
        self.update_project(project_id, |project| {
            project.tasks.push(task);
            project.worker_ids.push(worker_id);
        })?;
        self.insert_agent(worker);
        Ok(())
    }

    /// Mutate the task `task_id` on behalf of `agent_id`, which must hold its assignment.
    pub fn update_assigned_task<R>(
        &self,
        project_id: &str,
        task_id: &str,
        agent_id: &str,
        f: impl FnOnce(&mut Task) -> R,
    ) -> Result<R> {
        self.update_project(project_id, |project| {
            let mut candidates = project.tasks.iter_mut().filter(|task| task.id == task_id);
            let task = candidates
                .find(|task| task.assigned_to.as_deref() == Some(agent_id))
                .ok_or_else(|| anyhow!("agent {agent_id} does not hold task {task_id}"))?;
            Ok(f(task))
        })?
    }

    /// Mark every non-terminal task of `phase` as failed. Returns the affected ids.
    pub fn fail_unfinished_tasks(
        &self,
        project_id: &str,
        phase: u32,
        reason: &str,
    ) -> Result<Vec<String>> {
        self.update_project(project_id, |project| {
            let mut failed = Vec::new();
            for task in project.tasks.iter_mut().filter(|task| task.phase == phase) {
                if task.status.is_terminal() {
                    continue;
                }
                task.status = TaskStatus::Failed;
                task.result = Some(reason.to_string());
                failed.push(task.id.clone());
            }
            failed
        })
    }

    // ---- agents ----

    pub fn insert_agent(&self, agent: AgentRecord) {
        let agent_id = agent.id.clone();
        write_map(&self.logs)
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        write_map(&self.agents).insert(agent_id, Arc::new(Mutex::new(agent)));
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        let record = read_map(&self.agents).get(agent_id).cloned()?;
        let agent = lock(&record).clone();
        Some(agent)
    }

    pub fn update_agent<R>(
        &self,
        agent_id: &str,
        f: impl FnOnce(&mut AgentRecord) -> R,
    ) -> Result<R> {
        let record = read_map(&self.agents)
            .get(agent_id)
            .cloned()
            .ok_or_else(|| anyhow!("agent not found: {agent_id}"))?;
        let mut agent = lock(&record);
        Ok(f(&mut agent))
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        self.update_agent(agent_id, |agent| agent.status = status)
    }

    // ---- logs ----

    /// Append an audit entry. Entries for unknown (e.g. deleted) agents are dropped.
    pub fn append_log(&self, agent_id: &str, entry: LogEntry) {
        let record = read_map(&self.logs).get(agent_id).cloned();
        match record {
            Some(record) => lock(&record).push(entry),
            None => debug!(agent_id, "dropping log entry for unknown agent"),
        }
    }

    pub fn logs(&self, agent_id: &str) -> Vec<LogEntry> {
        read_map(&self.logs)
            .get(agent_id)
            .map(|record| lock(record).clone())
            .unwrap_or_default()
    }
}
