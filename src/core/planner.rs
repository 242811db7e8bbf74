//! Step planner: which steps are eligible to start next.
//!
//! A pure function of a [`PipelineExecution`] and its definition. It never
//! touches the log; the plan command records its result as a
//! `pipeline_planned` event.

use tracing::warn;

use crate::domain::PipelineExecution;

use super::pipeline::{PipelineDefinition, StepDefinition};

/// Names of steps that may start now, in declaration order.
///
/// A step is eligible when it has not been planned before and every
/// dependency is met. Self dependencies and dependencies on unknown steps
/// are ignored.
pub fn next_steps(pe: &PipelineExecution, definition: &PipelineDefinition) -> Vec<String> {
    definition
        .steps
        .iter()
        .filter(|step| {
            !pe.step_status
                .get(&step.name)
                .map_or(false, |s| s.has_begun())
        })
        .filter(|step| dependencies_met(pe, definition, step))
        .map(|step| step.name.clone())
        .collect()
}

/// Whether every dependency of `step` is met
pub fn dependencies_met(
    pe: &PipelineExecution,
    definition: &PipelineDefinition,
    step: &StepDefinition,
) -> bool {
    step.depends_on.iter().all(|dep| {
        if dep == &step.name {
            warn!(step = %step.name, "Ignoring self dependency");
            return true;
        }
        let Some(dep_definition) = definition.step(dep) else {
            warn!(step = %step.name, dependency = %dep, "Ignoring dependency on unknown step");
            return true;
        };
        dependency_met(pe, dep_definition)
    })
}

/// A dependency is met once all of its executions are terminal and none
/// failed, or failures are ignored by its error policy
fn dependency_met(pe: &PipelineExecution, dependency: &StepDefinition) -> bool {
    match pe.step_status.get(&dependency.name) {
        Some(status) if status.is_complete() => {
            !status.has_failures() || dependency.error.ignore
        }
        _ => false,
    }
}
