//! Definition validation and action prerequisite computation.
//!
//! Phase dependencies are checked against declared order only: a phase may
//! depend on earlier phases, and the executor runs phases in list order.

use std::collections::HashSet;

use regex::Regex;

use super::{AwaitState, OrchestrationMode, PhaseDefinition, PipelineDefinition, Trigger};
use crate::errors::ValidationError;

/// An action must reach `state` on action `index` before the dependent starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerequisite {
    pub index: usize,
    pub state: AwaitState,
}

/// Compute the start prerequisites of every action in a phase.
///
/// Consecutive sequential-trigger actions marked parallel (or every
/// sequential-trigger action when the phase is parallel) form one group.
/// A sequential action waits for every member of the group before it to
/// settle; awaiting actions wait on their named target; immediate actions
/// wait on nothing.
pub fn prerequisites(phase: &PhaseDefinition) -> Vec<Vec<Prerequisite>> {
    let mut result = Vec::with_capacity(phase.actions.len());
    // Members of the previous group and the group being built.
    let mut previous: Vec<usize> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_parallel = false;

    for (i, action) in phase.actions.iter().enumerate() {
        let parallel = matches!(action.trigger, Trigger::Sequential)
            && (action.parallel || phase.execution.parallel);

        if !(parallel && current_parallel) && !current.is_empty() {
            previous = std::mem::take(&mut current);
        }
        current.push(i);
        current_parallel = parallel;

        let prereqs = match &action.trigger {
            Trigger::Sequential => previous
                .iter()
                .map(|&index| Prerequisite {
                    index,
                    state: AwaitState::Settled,
                })
                .collect(),
            Trigger::Await { action, state } => phase
                .action_index(action)
                .map(|index| {
                    vec![Prerequisite {
                        index,
                        state: *state,
                    }]
                })
                .unwrap_or_default(),
            Trigger::Immediate => Vec::new(),
        };
        result.push(prereqs);
    }

    result
}

impl PipelineDefinition {
    /// Validate the definition. Called once before a run starts.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyPipelineId);
        }
        if self.phases.is_empty() {
            return Err(ValidationError::NoPhases {
                pipeline: self.id.clone(),
            });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for phase in &self.phases {
            for dependency in &phase.depends_on {
                // Only phases already seen (declared earlier) are valid.
                if !seen.contains(dependency.as_str()) {
                    return Err(ValidationError::InvalidDependency {
                        phase: phase.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(ValidationError::DuplicatePhase {
                    phase: phase.id.clone(),
                });
            }
            self.validate_phase(phase)?;
        }

        Ok(())
    }

    fn validate_phase(&self, phase: &PhaseDefinition) -> Result<(), ValidationError> {
        if phase.actions.is_empty() {
            return Err(ValidationError::NoActions {
                phase: phase.id.clone(),
            });
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for action in &phase.actions {
            if !ids.insert(action.id.as_str()) {
                return Err(ValidationError::DuplicateAction {
                    phase: phase.id.clone(),
                    action: action.id.clone(),
                });
            }
            let participants = &action.participants;
            if participants.workers.is_empty() && participants.teams.is_empty() {
                return Err(ValidationError::NoParticipants {
                    phase: phase.id.clone(),
                    action: action.id.clone(),
                });
            }
            if matches!(
                participants.mode,
                OrchestrationMode::RoundRobin | OrchestrationMode::Consensus
            ) && participants.max_rounds == 0
            {
                return Err(ValidationError::InvalidRounds {
                    phase: phase.id.clone(),
                    action: action.id.clone(),
                });
            }
            if let Trigger::Await { action: target, .. } = &action.trigger
                && (target == &action.id || phase.action(target).is_none())
            {
                return Err(ValidationError::UnknownAwaitTarget {
                    phase: phase.id.clone(),
                    action: action.id.clone(),
                    target: target.clone(),
                });
            }
        }

        detect_trigger_cycle(phase)?;

        for binding in &phase.context.persistent_refs {
            if !self.bindings.contains_key(binding) {
                return Err(ValidationError::UnknownBinding {
                    phase: phase.id.clone(),
                    binding: binding.clone(),
                });
            }
        }

        if let Some(gavel) = &phase.gavel
            && let Some(action) = &gavel.action_id
            && phase.action(action).is_none()
        {
            return Err(ValidationError::UnknownGavelAction {
                phase: phase.id.clone(),
                action: action.clone(),
            });
        }

        for rule in &phase.extract {
            if let Some(pattern) = &rule.pattern {
                Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
                    phase: phase.id.clone(),
                    key: rule.key.clone(),
                    message: e.to_string(),
                })?;
            }
        }

        if let Some(rag) = &phase.rag
            && rag.enabled
            && rag.query.trim().is_empty()
        {
            return Err(ValidationError::InvalidPhase {
                phase: phase.id.clone(),
                message: "RAG is enabled but the query template is empty".to_string(),
            });
        }

        if phase.execution.timeout_ms == Some(0) {
            return Err(ValidationError::InvalidPhase {
                phase: phase.id.clone(),
                message: "timeout_ms must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn detect_trigger_cycle(phase: &PhaseDefinition) -> Result<(), ValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        node: usize,
        edges: &[Vec<Prerequisite>],
        marks: &mut [Mark],
    ) -> Result<(), usize> {
        match marks[node] {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(node),
            Mark::Unvisited => {}
        }
        marks[node] = Mark::InProgress;
        for prereq in &edges[node] {
            visit(prereq.index, edges, marks)?;
        }
        marks[node] = Mark::Done;
        Ok(())
    }

    let edges = prerequisites(phase);
    let mut marks = vec![Mark::Unvisited; edges.len()];
    for node in 0..edges.len() {
        visit(node, &edges, &mut marks).map_err(|index| ValidationError::TriggerCycle {
            phase: phase.id.clone(),
            action: phase.actions[index].id.clone(),
        })?;
    }
    Ok(())
}
