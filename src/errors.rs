//! Typed error hierarchy for the backlog & board service.
//!
//! `ServiceError` is the single taxonomy every operation surfaces:
//! - validation failures are rejected before any persistence
//! - not-found covers both missing ids and parent mismatches
//! - conflicts carry a machine-readable `ConflictKind` so callers can tell
//!   "nothing you can do from here" apart from "supply a replacement"
//! - transient wraps store I/O failures that are safe to retry

use thiserror::Error;

use crate::models::Role;

/// Machine-readable reason attached to `ServiceError::Conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// No remediation possible from this call (e.g. sole PO of an active
    /// project).
    CriticalDependency,
    /// Remediation possible by supplying a replacement actor.
    ReassignmentNeeded,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CriticalDependency => "CRITICAL_DEPENDENCY",
            Self::ReassignmentNeeded => "REASSIGNMENT_NEEDED",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Epic {id} not found")]
    EpicNotFound { id: i64 },

    #[error("Story {id} not found")]
    StoryNotFound { id: i64 },

    #[error("Issue {id} not found")]
    IssueNotFound { id: i64 },

    #[error("Sprint {id} not found")]
    SprintNotFound { id: i64 },

    #[error("User {id} not found")]
    UserNotFound { id: i64 },

    #[error("Sprint {sprint_id} does not belong to the same project as issue {issue_id}")]
    SprintProjectMismatch { sprint_id: i64, issue_id: i64 },

    #[error("Operation requires one of roles: {}", fmt_roles(.required))]
    Forbidden { required: Vec<Role> },

    #[error("{message}")]
    Conflict {
        kind: ConflictKind,
        message: String,
    },

    #[error("Store I/O failure: {0}")]
    Transient(#[source] anyhow::Error),
}

impl ServiceError {
    pub fn forbidden(required: &[Role]) -> Self {
        Self::Forbidden {
            required: required.to_vec(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::CriticalDependency,
            message: message.into(),
        }
    }

    pub fn needs_reassignment(message: impl Into<String>) -> Self {
        Self::Conflict {
            kind: ConflictKind::ReassignmentNeeded,
            message: message.into(),
        }
    }

    /// Wire-level error tag, surfaced as the `type` field in API bodies.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::ProjectNotFound { .. }
            | Self::EpicNotFound { .. }
            | Self::StoryNotFound { .. }
            | Self::IssueNotFound { .. }
            | Self::SprintNotFound { .. }
            | Self::UserNotFound { .. }
            | Self::SprintProjectMismatch { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Conflict { kind, .. } => kind.as_str(),
            Self::Transient(_) => "TRANSIENT",
        }
    }
}

fn fmt_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_carry_ids() {
        let err = ServiceError::StoryNotFound { id: 42 };
        match &err {
            ServiceError::StoryNotFound { id } => assert_eq!(*id, 42),
            _ => panic!("Expected StoryNotFound"),
        }
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn conflict_kinds_are_distinguishable() {
        let critical = ServiceError::critical("sole PO of project Alpha");
        let reassign = ServiceError::needs_reassignment("3 unfinished issues");
        assert_eq!(critical.kind_str(), "CRITICAL_DEPENDENCY");
        assert_eq!(reassign.kind_str(), "REASSIGNMENT_NEEDED");
        assert!(matches!(
            critical,
            ServiceError::Conflict {
                kind: ConflictKind::CriticalDependency,
                ..
            }
        ));
    }

    #[test]
    fn forbidden_names_required_roles_in_wire_casing() {
        let err = ServiceError::forbidden(&[Role::Owner, Role::Admin]);
        assert_eq!(err.kind_str(), "FORBIDDEN");
        assert_eq!(
            err.to_string(),
            "Operation requires one of roles: OWNER, ADMIN"
        );
    }

    #[test]
    fn mismatch_is_a_not_found_kind() {
        let err = ServiceError::SprintProjectMismatch {
            sprint_id: 7,
            issue_id: 9,
        };
        assert_eq!(err.kind_str(), "NOT_FOUND");
        assert!(err.to_string().contains('7'));
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ServiceError::Validation("missing title".into()));
        assert_std_error(&ServiceError::Transient(anyhow::anyhow!("disk full")));
    }
}
