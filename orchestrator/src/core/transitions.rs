//! Allowed run status transitions and status replay from events.

use thiserror::Error;

use crate::core::events::{EventKind, RunEvent};
use crate::core::types::RunStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Forward transitions of the run lifecycle. Operator retry (`failed -> pending`)
/// goes through [`can_retry`] instead.
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), TransitionError> {
    use RunStatus::{AwaitingApproval, Cancelled, Completed, Failed, Pending, Running};

    let allowed = matches!(
        (from, to),
        (Pending, Running | Failed | Cancelled)
            | (Running, AwaitingApproval | Completed | Failed | Cancelled)
            | (AwaitingApproval, Running | Failed | Cancelled)
    );
    if allowed {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Only failed runs may be sent back to `pending` by an operator.
pub fn can_retry(status: RunStatus) -> bool {
    status == RunStatus::Failed
}

/// Reconstruct a run's status from its event stream. Events are applied in
/// `seq` order; a run with no `status_changed` events is `pending`.
pub fn replay_status(events: &[RunEvent]) -> RunStatus {
    let mut ordered: Vec<&RunEvent> = events.iter().collect();
    ordered.sort_by_key(|event| event.seq);
    ordered
        .into_iter()
        .filter_map(|event| match &event.event {
            EventKind::StatusChanged { to, .. } => Some(*to),
            _ => None,
        })
        .next_back()
        .unwrap_or(RunStatus::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NewEvent;
    use crate::core::types::RunId;

    #[test]
    fn lifecycle_paths_are_allowed() {
        use RunStatus::{AwaitingApproval, Cancelled, Completed, Failed, Pending, Running};
        for (from, to) in [
            (Pending, Running),
            (Running, AwaitingApproval),
            (AwaitingApproval, Running),
            (Running, Completed),
            (Running, Failed),
            (AwaitingApproval, Cancelled),
            (Pending, Cancelled),
        ] {
            assert!(validate_transition(from, to).is_ok(), "{from} -> {to}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use RunStatus::{Cancelled, Completed, Failed, Pending, Running};
        for from in [Completed, Failed, Cancelled] {
            for to in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(validate_transition(from, to).is_err(), "{from} -> {to}");
            }
        }
        assert!(can_retry(Failed));
        assert!(!can_retry(Completed));
        assert!(!can_retry(Cancelled));
    }

    #[test]
    fn replay_uses_latest_status_change_by_seq() {
        let run_id = RunId::new("run-1");
        let event = |seq: u64, kind: EventKind| {
            RunEvent::from_new(
                NewEvent {
                    run_id: run_id.clone(),
                    project_id: "p".to_string(),
                    task_id: "t".to_string(),
                    kind,
                },
                seq,
            )
        };
        let events = vec![
            event(3, EventKind::StepDispatched { step_index: 0 }),
            event(
                4,
                EventKind::StatusChanged {
                    from: RunStatus::Running,
                    to: RunStatus::Completed,
                    reason: None,
                },
            ),
            event(
                2,
                EventKind::StatusChanged {
                    from: RunStatus::Pending,
                    to: RunStatus::Running,
                    reason: None,
                },
            ),
            event(1, EventKind::RunCreated),
        ];
        assert_eq!(replay_status(&events), RunStatus::Completed);
        assert_eq!(replay_status(&events[..1]), RunStatus::Pending);
    }
}
