//! The deployment lifecycle state machine.
//!
//! Every status mutation in the system goes through [`can_transition`]
//! inside a store transaction. Anything not listed is rejected.

use crate::model::DeploymentStatus;

/// Returns true if `from -> to` is a legal status transition.
///
/// The table:
///
/// - `PENDING   -> RUNNING | FAILED | DELETED`
/// - `RUNNING   -> PREEMPTED | FAILED | COMPLETED | DELETED`
/// - `PREEMPTED -> PENDING | FAILED | DELETED`
/// - `FAILED`, `COMPLETED`, `DELETED` are terminal.
pub fn can_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    use DeploymentStatus::*;

    match (from, to) {
        (Pending, Running) => true,
        (Pending, Failed) => true,
        (Pending, Deleted) => true,
        (Running, Preempted) => true,
        (Running, Failed) => true,
        (Running, Completed) => true,
        (Running, Deleted) => true,
        (Preempted, Pending) => true,
        (Preempted, Failed) => true,
        (Preempted, Deleted) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    const ALL: [DeploymentStatus; 6] = [Pending, Running, Preempted, Failed, Completed, Deleted];

    #[test]
    fn test_terminal_states_never_transition() {
        for from in [Failed, Completed, Deleted] {
            for to in ALL {
                assert!(!can_transition(from, to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_pending_transitions() {
        assert!(can_transition(Pending, Running));
        assert!(can_transition(Pending, Failed));
        assert!(can_transition(Pending, Deleted));
        assert!(!can_transition(Pending, Preempted));
        assert!(!can_transition(Pending, Completed));
        assert!(!can_transition(Pending, Pending));
    }

    #[test]
    fn test_running_transitions() {
        assert!(can_transition(Running, Preempted));
        assert!(can_transition(Running, Failed));
        assert!(can_transition(Running, Completed));
        assert!(can_transition(Running, Deleted));
        assert!(!can_transition(Running, Pending));
    }

    #[test]
    fn test_preempted_transitions() {
        assert!(can_transition(Preempted, Pending));
        assert!(can_transition(Preempted, Failed));
        assert!(can_transition(Preempted, Deleted));
        assert!(!can_transition(Preempted, Running));
        assert!(!can_transition(Preempted, Completed));
    }
}
