//! Phase completion rules.

use crate::core::types::{Task, TaskStatus};

/// Where a phase stands after inspecting its tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// At least one task is still pending or in progress.
    Running,
    /// Every task in the phase is completed.
    Completed,
    /// Every task is terminal and these task ids failed.
    Failed(Vec<String>),
}

/// True iff every task whose `phase` equals `phase` is completed.
///
/// Tasks of other phases are ignored. A phase with no tasks is complete.
pub fn phase_complete(tasks: &[Task], phase: u32) -> bool {
    tasks
        .iter()
        .filter(|task| task.phase == phase)
        .all(|task| task.status == TaskStatus::Completed)
}

/// Classify a phase. A failed task only decides the outcome once no other task
/// in the phase is still running.
pub fn phase_outcome(tasks: &[Task], phase: u32) -> PhaseOutcome {
    if phase_complete(tasks, phase) {
        return PhaseOutcome::Completed;
    }
    let in_phase: Vec<&Task> = tasks.iter().filter(|task| task.phase == phase).collect();
    if in_phase.iter().any(|task| !task.status.is_terminal()) {
        return PhaseOutcome::Running;
    }
    PhaseOutcome::Failed(
        in_phase
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(|task| task.id.clone())
            .collect(),
    )
}

/// Render the status digest lines for a phase (`- description: status`).
pub fn status_lines(tasks: &[Task], phase: u32) -> Vec<String> {
    tasks
        .iter()
        .filter(|task| task.phase == phase)
        .map(|task| format!("- {}: {}", task.description, task.status))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, phase: u32, status: TaskStatus) -> Task {
        let mut task = Task::new(id, format!("{id} work"), format!("feature/{id}"), phase);
        task.status = status;
        task
    }

    #[test]
    fn phase_complete_only_considers_its_own_tasks() {
        let tasks = vec![
            task("a", 1, TaskStatus::Completed),
            task("b", 1, TaskStatus::Completed),
            task("c", 2, TaskStatus::Failed),
            task("d", 2, TaskStatus::Pending),
        ];
        assert!(phase_complete(&tasks, 1));
        assert!(!phase_complete(&tasks, 2));
    }

    #[test]
    fn single_incomplete_task_blocks_phase() {
        let tasks = vec![
            task("a", 1, TaskStatus::Completed),
            task("b", 1, TaskStatus::InProgress),
        ];
        assert!(!phase_complete(&tasks, 1));
        assert_eq!(phase_outcome(&tasks, 1), PhaseOutcome::Running);
    }

    #[test]
    fn failed_task_fails_phase_once_others_are_terminal() {
        let mut tasks = vec![
            task("a", 1, TaskStatus::Failed),
            task("b", 1, TaskStatus::InProgress),
        ];
        assert_eq!(phase_outcome(&tasks, 1), PhaseOutcome::Running);
        tasks[1].status = TaskStatus::Completed;
        assert_eq!(
            phase_outcome(&tasks, 1),
            PhaseOutcome::Failed(vec!["a".to_string()])
        );
    }

    #[test]
    fn status_lines_list_phase_tasks() {
        let tasks = vec![
            task("a", 1, TaskStatus::InProgress),
            task("b", 2, TaskStatus::Pending),
        ];
        assert_eq!(status_lines(&tasks, 1), vec!["- a work: in_progress"]);
    }
}
