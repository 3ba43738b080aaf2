//! Grouping of spawn directives into ordered phases.

use std::collections::{BTreeMap, HashSet};

use crate::core::parser::SpawnRequest;

/// Spawn requests grouped by phase number, ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhasePlan {
    pub phases: BTreeMap<u32, Vec<SpawnRequest>>,
    /// Duplicate task ids or branches. Logged, never fatal.
    pub warnings: Vec<String>,
    /// True when the model produced no directives and the default plan was used.
    pub used_default: bool,
}

impl PhasePlan {
    pub fn task_count(&self) -> usize {
        self.phases.values().map(Vec::len).sum()
    }
}

/// Fallback used when the planning reply contains no spawn directives:
/// scaffolding first, then core and UI in parallel.
pub fn default_plan() -> Vec<SpawnRequest> {
    vec![
        SpawnRequest::new(
            "phase1_setup",
            "Create project structure and basic files",
            "feature/scaffolding",
        ),
        SpawnRequest::new(
            "phase2_core",
            "Implement core functionality",
            "feature/core",
        ),
        SpawnRequest::new(
            "phase2_ui",
            "Add user interface components",
            "feature/ui",
        ),
    ]
}

/// Parse the phase number embedded in a task id (`phase2_core` -> 2).
///
/// The digits between the first `phase` and the next `_` are used. Anything
/// unparsable, including zero, maps to phase 1.
pub fn phase_from_task_id(task_id: &str) -> u32 {
    task_id
        .split_once("phase")
        .and_then(|(_, rest)| rest.split('_').next())
        .and_then(|digits| digits.parse::<u32>().ok())
        .filter(|phase| *phase >= 1)
        .unwrap_or(1)
}

/// Build the phase plan from extracted directives, falling back to [`default_plan`].
pub fn build_plan(spawns: Vec<SpawnRequest>) -> PhasePlan {
    let used_default = spawns.is_empty();
    let spawns = if used_default { default_plan() } else { spawns };

    let mut plan = PhasePlan {
        used_default,
        ..PhasePlan::default()
    };
    let mut seen_ids = HashSet::new();
    let mut seen_branches = HashSet::new();
    for spawn in spawns {
        if !seen_ids.insert(spawn.task_id.clone()) {
            plan.warnings
                .push(format!("duplicate task_id found: {}", spawn.task_id));
        }
        if !seen_branches.insert(spawn.branch.clone()) {
            plan.warnings
                .push(format!("duplicate branch name found: {}", spawn.branch));
        }
        plan.phases
            .entry(phase_from_task_id(&spawn.task_id))
            .or_default()
            .push(spawn);
    }
    plan
}
