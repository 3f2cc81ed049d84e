//! The event reducer: fold a time-sorted event stream into a specification.
//!
//! `replay` is pure. Given the same base state and the same events it
//! produces bit-identical output: the sort is stable (ties break on original
//! index), every handler is deterministic, and derived collections are kept
//! in sorted order.

use thiserror::Error;

use crate::types::{
    ChangelogEvent, EventId, EventKind, Specification, ValidationError,
};

/// A replay failure, identifying the offending event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("event {event_id}: requirement {id} already exists")]
    DuplicateRequirement { event_id: EventId, id: String },
    #[error("event {event_id}: requirement {id} not found")]
    MissingRequirement { event_id: EventId, id: String },
    #[error("event {event_id}: criterion {criterion_id} already exists on requirement {requirement_id}")]
    DuplicateCriterion {
        event_id: EventId,
        requirement_id: String,
        criterion_id: String,
    },
    #[error("event {event_id}: criterion {criterion_id} not found on requirement {requirement_id}")]
    MissingCriterion {
        event_id: EventId,
        requirement_id: String,
        criterion_id: String,
    },
    #[error("event {event_id}: category {category} is still referenced by {count} requirement(s)")]
    CategoryInUse {
        event_id: EventId,
        category: String,
        count: usize,
    },
    #[error("event {event_id}: expected current version {expected}, found {actual}")]
    VersionMismatch {
        event_id: EventId,
        expected: String,
        actual: String,
    },
    #[error("event {event_id}: version must strictly increase, got {old} -> {new}")]
    VersionNotIncreasing {
        event_id: EventId,
        old: String,
        new: String,
    },
    #[error("event {event_id}: invalid entity")]
    InvalidEntity {
        event_id: EventId,
        #[source]
        source: ValidationError,
    },
}

/// Apply `events` to `state` in timestamp order and return the final state.
///
/// Events are not assumed to arrive sorted; the log records append order,
/// and the reducer is the single place ordering is decided.
pub fn replay(
    state: Specification,
    events: &[ChangelogEvent],
) -> Result<Specification, ReplayError> {
    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by_key(|&i| (events[i].timestamp, i));

    let mut state = state;
    for i in order {
        state = apply(state, &events[i])?;
    }
    Ok(state)
}

fn apply(mut state: Specification, event: &ChangelogEvent) -> Result<Specification, ReplayError> {
    let event_id = &event.event_id;
    match &event.kind {
        EventKind::RequirementAdded { requirement } => {
            if state.requirement(&requirement.id).is_some() {
                return Err(ReplayError::DuplicateRequirement {
                    event_id: event_id.clone(),
                    id: requirement.id.to_string(),
                });
            }
            requirement
                .validate()
                .map_err(|source| ReplayError::InvalidEntity {
                    event_id: event_id.clone(),
                    source,
                })?;
            state.requirements.push(requirement.clone());
            state.rebuild_categories();
        }
        EventKind::RequirementDeleted { requirement_id, .. } => {
            let before = state.requirements.len();
            state.requirements.retain(|r| &r.id != requirement_id);
            if state.requirements.len() == before {
                return Err(ReplayError::MissingRequirement {
                    event_id: event_id.clone(),
                    id: requirement_id.to_string(),
                });
            }
            // Categories pinned by an explicit add survive their last
            // referencing requirement; implicit ones fall away here.
            state.rebuild_categories();
        }
        EventKind::AcceptanceCriterionAdded {
            requirement_id,
            criterion,
        } => {
            criterion
                .validate()
                .map_err(|source| ReplayError::InvalidEntity {
                    event_id: event_id.clone(),
                    source,
                })?;
            let req = state
                .requirements
                .iter_mut()
                .find(|r| &r.id == requirement_id)
                .ok_or_else(|| ReplayError::MissingRequirement {
                    event_id: event_id.clone(),
                    id: requirement_id.to_string(),
                })?;
            if req.criterion(&criterion.id).is_some() {
                return Err(ReplayError::DuplicateCriterion {
                    event_id: event_id.clone(),
                    requirement_id: requirement_id.to_string(),
                    criterion_id: criterion.id.to_string(),
                });
            }
            req.acceptance_criteria.push(criterion.clone());
        }
        EventKind::AcceptanceCriterionDeleted {
            requirement_id,
            criterion_id,
            ..
        } => {
            let req = state
                .requirements
                .iter_mut()
                .find(|r| &r.id == requirement_id)
                .ok_or_else(|| ReplayError::MissingRequirement {
                    event_id: event_id.clone(),
                    id: requirement_id.to_string(),
                })?;
            let before = req.acceptance_criteria.len();
            req.acceptance_criteria.retain(|c| &c.id != criterion_id);
            if req.acceptance_criteria.len() == before {
                return Err(ReplayError::MissingCriterion {
                    event_id: event_id.clone(),
                    requirement_id: requirement_id.to_string(),
                    criterion_id: criterion_id.to_string(),
                });
            }
        }
        EventKind::CategoryAdded { category } => {
            // Re-adding an existing category is a no-op, not an error.
            state.explicit_categories.insert(category.clone());
            state.rebuild_categories();
        }
        EventKind::CategoryDeleted { category } => {
            let count = state
                .requirements
                .iter()
                .filter(|r| &r.category == category)
                .count();
            if count > 0 {
                return Err(ReplayError::CategoryInUse {
                    event_id: event_id.clone(),
                    category: category.clone(),
                    count,
                });
            }
            state.explicit_categories.remove(category);
            state.rebuild_categories();
        }
        EventKind::CategoryRenamed { old_name, new_name } => {
            // Only the bare category strings move; requirement identifiers
            // keep their embedded segment, so a renamed category decouples
            // from the ids of requirements created before the rename.
            for req in &mut state.requirements {
                if &req.category == old_name {
                    req.category = new_name.clone();
                }
            }
            if state.explicit_categories.remove(old_name) {
                state.explicit_categories.insert(new_name.clone());
            }
            state.rebuild_categories();
        }
        EventKind::ProjectMetadataUpdated { new_metadata, .. } => {
            new_metadata
                .validate()
                .map_err(|source| ReplayError::InvalidEntity {
                    event_id: event_id.clone(),
                    source,
                })?;
            state.metadata = new_metadata.clone();
        }
        EventKind::VersionBumped {
            old_version,
            new_version,
            ..
        } => {
            if old_version != &state.metadata.version {
                return Err(ReplayError::VersionMismatch {
                    event_id: event_id.clone(),
                    expected: old_version.to_string(),
                    actual: state.metadata.version.to_string(),
                });
            }
            if new_version <= old_version {
                return Err(ReplayError::VersionNotIncreasing {
                    event_id: event_id.clone(),
                    old: old_version.to_string(),
                    new: new_version.to_string(),
                });
            }
            state.metadata.version = new_version.clone();
        }
    }
    Ok(state)
}
