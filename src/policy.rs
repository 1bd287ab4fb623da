//! Access policy: who may do what.
//!
//! Pure checks over the calling user and the entities involved. Handlers
//! run these before touching the store, so a forbidden call never gets as
//! far as a write. OWNER and ADMIN pass every gate; the narrower roles are
//! scoped to the projects they are responsible for.

use crate::errors::{ServiceError, ServiceResult};
use crate::models::{Issue, Project, Role, User};

/// The authenticated caller for one request.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
}

impl Session {
    pub fn new(user: User) -> Self {
        Self { user }
    }
}

/// Every operation, reads included, requires an active account.
pub fn require_active(session: &Session) -> ServiceResult<()> {
    if session.user.is_active {
        Ok(())
    } else {
        Err(ServiceError::forbidden(&[
            Role::Owner,
            Role::Admin,
            Role::Po,
            Role::Sm,
            Role::Dev,
        ]))
    }
}

/// User administration (create, update, deactivate, reactivate).
pub fn require_user_admin(session: &Session) -> ServiceResult<()> {
    require_active(session)?;
    if session.user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::forbidden(&[Role::Owner, Role::Admin]))
    }
}

/// Project creation and top-level project edits.
pub fn require_project_admin(session: &Session) -> ServiceResult<()> {
    require_active(session)?;
    if session.user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::forbidden(&[Role::Owner, Role::Admin]))
    }
}

/// Backlog shaping (epics and stories) within a project: the project's
/// product owner, or an admin.
pub fn require_backlog_editor(session: &Session, project: &Project) -> ServiceResult<()> {
    require_active(session)?;
    if session.user.is_admin() {
        return Ok(());
    }
    if session.user.has_role(Role::Po) && project.owner_id == Some(session.user.id) {
        return Ok(());
    }
    Err(ServiceError::forbidden(&[Role::Owner, Role::Admin, Role::Po]))
}

/// Delivery coordination (sprints, issue CRUD, membership) within a
/// project: the project's scrum master, or an admin.
pub fn require_delivery_lead(session: &Session, project: &Project) -> ServiceResult<()> {
    require_active(session)?;
    if session.user.is_admin() {
        return Ok(());
    }
    if session.user.has_role(Role::Sm) && project.scrum_master_id == Some(session.user.id) {
        return Ok(());
    }
    Err(ServiceError::forbidden(&[Role::Owner, Role::Admin, Role::Sm]))
}

/// Moving an issue across the board: delivery lead rules, plus a developer
/// may move issues assigned to them.
pub fn require_board_mover(
    session: &Session,
    project: &Project,
    issue: &Issue,
) -> ServiceResult<()> {
    require_active(session)?;
    if require_delivery_lead(session, project).is_ok() {
        return Ok(());
    }
    if session.user.has_role(Role::Dev) && issue.assignee_ids.contains(&session.user.id) {
        return Ok(());
    }
    Err(ServiceError::forbidden(&[
        Role::Owner,
        Role::Admin,
        Role::Sm,
        Role::Dev,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IssueCategory, IssueStatus, ProjectStatus};

    fn user(id: i64, roles: &[Role], active: bool) -> User {
        User {
            id,
            full_name: format!("user {}", id),
            email: format!("u{}@example.com", id),
            roles: roles.to_vec(),
            is_active: active,
            created_at: String::new(),
        }
    }

    fn project(owner_id: Option<i64>, scrum_master_id: Option<i64>) -> Project {
        Project {
            id: 1,
            name: "Alpha".into(),
            description: String::new(),
            icon: None,
            status: ProjectStatus::Active,
            owner_id,
            scrum_master_id,
            member_ids: vec![],
            start_date: None,
            end_date: None,
            created_at: String::new(),
        }
    }

    fn issue(assignees: &[i64]) -> Issue {
        Issue {
            id: 1,
            story_id: 1,
            sprint_id: None,
            title: "task".into(),
            description: String::new(),
            category: IssueCategory::Backend,
            status: IssueStatus::ToDo,
            blocked_from: None,
            time_estimate: 0.0,
            assignee_ids: assignees.to_vec(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn inactive_user_fails_every_gate() {
        let session = Session::new(user(1, &[Role::Owner], false));
        assert!(require_active(&session).is_err());
        assert!(require_user_admin(&session).is_err());
        assert!(require_project_admin(&session).is_err());
    }

    #[test]
    fn admin_and_owner_pass_everything() {
        let p = project(None, None);
        let i = issue(&[]);
        for role in [Role::Owner, Role::Admin] {
            let session = Session::new(user(1, &[role], true));
            assert!(require_user_admin(&session).is_ok());
            assert!(require_project_admin(&session).is_ok());
            assert!(require_backlog_editor(&session, &p).is_ok());
            assert!(require_delivery_lead(&session, &p).is_ok());
            assert!(require_board_mover(&session, &p, &i).is_ok());
        }
    }

    #[test]
    fn po_edits_backlog_only_in_own_project() {
        let po = Session::new(user(5, &[Role::Po], true));
        assert!(require_backlog_editor(&po, &project(Some(5), None)).is_ok());

        let err = require_backlog_editor(&po, &project(Some(6), None)).unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden { .. }));
        // PO is not a delivery role.
        assert!(require_delivery_lead(&po, &project(Some(5), None)).is_err());
    }

    #[test]
    fn sm_runs_delivery_only_in_own_project() {
        let sm = Session::new(user(7, &[Role::Sm], true));
        assert!(require_delivery_lead(&sm, &project(None, Some(7))).is_ok());
        assert!(require_delivery_lead(&sm, &project(None, Some(8))).is_err());
        // SM does not shape the backlog.
        assert!(require_backlog_editor(&sm, &project(None, Some(7))).is_err());
    }

    #[test]
    fn dev_moves_only_own_issues() {
        let dev = Session::new(user(9, &[Role::Dev], true));
        let p = project(None, None);
        assert!(require_board_mover(&dev, &p, &issue(&[9])).is_ok());

        let err = require_board_mover(&dev, &p, &issue(&[10])).unwrap_err();
        assert_eq!(err.kind_str(), "FORBIDDEN");
        // And never the rest of the delivery surface.
        assert!(require_delivery_lead(&dev, &p).is_err());
        assert!(require_user_admin(&dev).is_err());
    }

    #[test]
    fn sm_may_move_any_issue_in_own_project() {
        let sm = Session::new(user(7, &[Role::Sm], true));
        let p = project(None, Some(7));
        assert!(require_board_mover(&sm, &p, &issue(&[])).is_ok());
    }
}
