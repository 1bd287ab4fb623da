//! Board state machine for issue status moves.
//!
//! The column set is the full legal-state set: any column-to-column move
//! is allowed, forwards or backwards. Only BLOCKED has rules — it is
//! reachable from any non-DONE status, remembers where the issue came
//! from, and resuming without an explicit target returns there.

use crate::errors::{ServiceError, ServiceResult};
use crate::models::IssueStatus;

/// Outcome of applying a move: the status to persist and the new value of
/// the `blocked_from` bookkeeping field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: IssueStatus,
    pub blocked_from: Option<IssueStatus>,
}

/// Validate a move from `current` to `target` and compute the resulting
/// transition. `blocked_from` is the currently remembered pre-BLOCKED
/// status, if any.
pub fn apply_move(
    current: IssueStatus,
    blocked_from: Option<IssueStatus>,
    target: IssueStatus,
) -> ServiceResult<Transition> {
    if target == IssueStatus::Blocked {
        if current == IssueStatus::Done {
            return Err(ServiceError::Validation(
                "A DONE issue cannot be blocked".into(),
            ));
        }
        if current == IssueStatus::Blocked {
            return Err(ServiceError::Validation(
                "Issue is already blocked".into(),
            ));
        }
        return Ok(Transition {
            status: IssueStatus::Blocked,
            blocked_from: Some(current),
        });
    }

    // Any non-BLOCKED target is legal from anywhere; leaving BLOCKED
    // clears the bookkeeping.
    Ok(Transition {
        status: target,
        blocked_from: None,
    })
}

/// Status to resume when unblocking without an explicit target. Falls back
/// to TO_DO if the remembered status was lost.
pub fn resume_status(blocked_from: Option<IssueStatus>) -> IssueStatus {
    blocked_from.unwrap_or(IssueStatus::ToDo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_column_to_column_move_is_legal() {
        // Permissive by design: the reference workflow allows skipping and
        // reversing stages, so backwards jumps must keep working.
        let t = apply_move(IssueStatus::Qa, None, IssueStatus::ToDo).unwrap();
        assert_eq!(t.status, IssueStatus::ToDo);

        let t = apply_move(IssueStatus::ToDo, None, IssueStatus::Done).unwrap();
        assert_eq!(t.status, IssueStatus::Done);

        let t = apply_move(IssueStatus::Done, None, IssueStatus::InProgress).unwrap();
        assert_eq!(t.status, IssueStatus::InProgress);
    }

    #[test]
    fn blocking_remembers_prior_status() {
        let t = apply_move(IssueStatus::Qa, None, IssueStatus::Blocked).unwrap();
        assert_eq!(t.status, IssueStatus::Blocked);
        assert_eq!(t.blocked_from, Some(IssueStatus::Qa));
    }

    #[test]
    fn unblocking_back_to_remembered_status_clears_bookkeeping() {
        let blocked = apply_move(IssueStatus::Qa, None, IssueStatus::Blocked).unwrap();
        let resumed = resume_status(blocked.blocked_from);
        assert_eq!(resumed, IssueStatus::Qa);

        let t = apply_move(IssueStatus::Blocked, blocked.blocked_from, resumed).unwrap();
        assert_eq!(t.status, IssueStatus::Qa);
        assert_eq!(t.blocked_from, None);
    }

    #[test]
    fn done_cannot_be_blocked() {
        let err = apply_move(IssueStatus::Done, None, IssueStatus::Blocked).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn double_block_rejected() {
        let err = apply_move(
            IssueStatus::Blocked,
            Some(IssueStatus::Qa),
            IssueStatus::Blocked,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn explicit_target_overrides_remembered_status() {
        let t = apply_move(
            IssueStatus::Blocked,
            Some(IssueStatus::Qa),
            IssueStatus::CodeReview,
        )
        .unwrap();
        assert_eq!(t.status, IssueStatus::CodeReview);
        assert_eq!(t.blocked_from, None);
    }

    #[test]
    fn resume_falls_back_to_todo() {
        assert_eq!(resume_status(None), IssueStatus::ToDo);
    }
}
