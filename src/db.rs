//! Entity store: SQLite persistence for users, projects, epics, stories,
//! issues and sprints.
//!
//! All access goes through [`DbHandle`], which wraps the store behind
//! `Arc<Mutex>` and runs closures on tokio's blocking thread pool so
//! synchronous SQLite I/O never ties up async worker threads.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};

use crate::board;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::*;
use crate::priority;

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Transient(anyhow::Error::new(e).context("sqlite operation failed"))
    }
}

/// Async-safe handle to the store.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> ServiceResult<R>
    where
        F: FnOnce(&Store) -> ServiceResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| ServiceError::Transient(anyhow::anyhow!("store lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| ServiceError::Transient(anyhow::Error::new(e).context("store task panicked")))?
    }

    /// Acquire the store mutex synchronously. For startup initialization
    /// and tests only, never from a hot async path.
    pub fn lock_sync(&self) -> ServiceResult<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| ServiceError::Transient(anyhow::anyhow!("store lock poisoned: {}", e)))
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    full_name TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE,
                    roles TEXT NOT NULL DEFAULT '[]',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    icon TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    owner_id INTEGER REFERENCES users(id),
                    scrum_master_id INTEGER REFERENCES users(id),
                    start_date TEXT,
                    end_date TEXT,
                    next_epic_number INTEGER NOT NULL DEFAULT 1,
                    next_story_number INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS project_members (
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id),
                    PRIMARY KEY (project_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS epics (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    epic_number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'BACKLOG',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE (project_id, epic_number)
                );

                CREATE TABLE IF NOT EXISTS stories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    epic_id INTEGER REFERENCES epics(id) ON DELETE CASCADE,
                    story_number INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                    business_value INTEGER NOT NULL DEFAULT 0,
                    urgency INTEGER NOT NULL DEFAULT 0,
                    story_points INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'BACKLOG',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE (project_id, story_number)
                );

                CREATE TABLE IF NOT EXISTS sprints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    goal TEXT NOT NULL DEFAULT '',
                    start_date TEXT NOT NULL,
                    end_date TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    story_id INTEGER NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
                    sprint_id INTEGER REFERENCES sprints(id) ON DELETE SET NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    category TEXT NOT NULL DEFAULT 'BACKEND',
                    status TEXT NOT NULL DEFAULT 'TO_DO',
                    blocked_from TEXT,
                    time_estimate REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS issue_assignees (
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id),
                    PRIMARY KEY (issue_id, user_id)
                );

                CREATE INDEX IF NOT EXISTS idx_epics_project ON epics(project_id);
                CREATE INDEX IF NOT EXISTS idx_stories_project ON stories(project_id);
                CREATE INDEX IF NOT EXISTS idx_stories_epic ON stories(epic_id);
                CREATE INDEX IF NOT EXISTS idx_issues_story ON issues(story_id);
                CREATE INDEX IF NOT EXISTS idx_issues_sprint ON issues(sprint_id);
                CREATE INDEX IF NOT EXISTS idx_sprints_project ON sprints(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── User CRUD ─────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        full_name: &str,
        email: &str,
        roles: &[Role],
    ) -> ServiceResult<User> {
        if full_name.trim().is_empty() {
            return Err(ServiceError::Validation("User full_name is required".into()));
        }
        if email.trim().is_empty() {
            return Err(ServiceError::Validation("User email is required".into()));
        }
        if roles.is_empty() {
            return Err(ServiceError::Validation("User needs at least one role".into()));
        }
        let roles_json = roles_to_json(roles);
        self.conn.execute(
            "INSERT INTO users (full_name, email, roles) VALUES (?1, ?2, ?3)",
            params![full_name.trim(), email.trim(), roles_json],
        )?;
        self.get_user(self.conn.last_insert_rowid())
    }

    pub fn list_users(&self) -> ServiceResult<Vec<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, full_name, email, roles, is_active, created_at FROM users ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_user_row)?;
        collect_rows(rows)
    }

    pub fn get_user(&self, id: i64) -> ServiceResult<User> {
        self.find_user(id)?.ok_or(ServiceError::UserNotFound { id })
    }

    pub fn find_user(&self, id: i64) -> ServiceResult<Option<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, full_name, email, roles, is_active, created_at FROM users WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], map_user_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn update_user(
        &self,
        id: i64,
        full_name: Option<&str>,
        email: Option<&str>,
        roles: Option<&[Role]>,
    ) -> ServiceResult<User> {
        self.get_user(id)?;
        let tx = self.conn.unchecked_transaction()?;
        if let Some(name) = full_name {
            if name.trim().is_empty() {
                return Err(ServiceError::Validation("User full_name is required".into()));
            }
            tx.execute(
                "UPDATE users SET full_name = ?1 WHERE id = ?2",
                params![name.trim(), id],
            )?;
        }
        if let Some(email) = email {
            tx.execute(
                "UPDATE users SET email = ?1 WHERE id = ?2",
                params![email.trim(), id],
            )?;
        }
        if let Some(roles) = roles {
            if roles.is_empty() {
                return Err(ServiceError::Validation("User needs at least one role".into()));
            }
            tx.execute(
                "UPDATE users SET roles = ?1 WHERE id = ?2",
                params![roles_to_json(roles), id],
            )?;
        }
        tx.commit()?;
        self.get_user(id)
    }

    /// Deactivate a user, enforcing the dependency rules:
    /// being owner or scrum master of an active project blocks outright;
    /// unfinished issue assignments need an explicit active replacement.
    /// The reassignment and the flag flip commit in one transaction.
    pub fn deactivate_user(&self, id: i64, replacement_id: Option<i64>) -> ServiceResult<User> {
        let user = self.get_user(id)?;
        if !user.is_active {
            return Ok(user);
        }

        let critical: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM projects
                 WHERE status = 'active' AND (owner_id = ?1 OR scrum_master_id = ?1)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            collect_rows(rows)?
        };
        if !critical.is_empty() {
            return Err(ServiceError::critical(format!(
                "User {} is the responsible PO/SM of active project(s): {}",
                user.full_name,
                critical.join(", ")
            )));
        }

        let unfinished: Vec<(i64, String)> = {
            let mut stmt = self.conn.prepare(
                "SELECT i.id, i.title FROM issues i
                 JOIN issue_assignees a ON a.issue_id = i.id
                 WHERE a.user_id = ?1 AND i.status != 'DONE'
                 ORDER BY i.id",
            )?;
            let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            collect_rows(rows)?
        };

        let tx = self.conn.unchecked_transaction()?;
        if !unfinished.is_empty() {
            let replacement_id = match replacement_id {
                Some(rid) => rid,
                None => {
                    let titles: Vec<String> =
                        unfinished.iter().map(|(_, t)| t.clone()).collect();
                    return Err(ServiceError::needs_reassignment(format!(
                        "User {} still has {} unfinished issue(s): {}. Supply a replacement developer.",
                        user.full_name,
                        unfinished.len(),
                        titles.join(", ")
                    )));
                }
            };
            let replacement = self.get_user(replacement_id)?;
            if !replacement.is_active || !replacement.has_role(Role::Dev) {
                return Err(ServiceError::Validation(format!(
                    "Replacement user {} must be an active developer",
                    replacement_id
                )));
            }
            for (issue_id, _) in &unfinished {
                tx.execute(
                    "DELETE FROM issue_assignees WHERE issue_id = ?1 AND user_id = ?2",
                    params![issue_id, id],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO issue_assignees (issue_id, user_id) VALUES (?1, ?2)",
                    params![issue_id, replacement_id],
                )?;
            }
        }
        tx.execute("UPDATE users SET is_active = 0 WHERE id = ?1", params![id])?;
        tx.commit()?;
        self.get_user(id)
    }

    pub fn activate_user(&self, id: i64) -> ServiceResult<User> {
        self.get_user(id)?;
        self.conn
            .execute("UPDATE users SET is_active = 1 WHERE id = ?1", params![id])?;
        self.get_user(id)
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_project(
        &self,
        name: &str,
        description: &str,
        icon: Option<&str>,
        owner_id: Option<i64>,
        scrum_master_id: Option<i64>,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> ServiceResult<Project> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("Project name is required".into()));
        }
        if let Some(uid) = owner_id {
            self.get_user(uid)?;
        }
        if let Some(uid) = scrum_master_id {
            self.get_user(uid)?;
        }
        self.conn.execute(
            "INSERT INTO projects (name, description, icon, owner_id, scrum_master_id, start_date, end_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![name.trim(), description, icon, owner_id, scrum_master_id, start_date, end_date],
        )?;
        self.get_project(self.conn.last_insert_rowid())
    }

    pub fn list_projects(&self) -> ServiceResult<Vec<Project>> {
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare("SELECT id FROM projects ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            collect_rows(rows)?
        };
        ids.into_iter().map(|id| self.get_project(id)).collect()
    }

    pub fn get_project(&self, id: i64) -> ServiceResult<Project> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, icon, status, owner_id, scrum_master_id,
                    start_date, end_date, created_at
             FROM projects WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;
        let raw = match rows.next() {
            Some(row) => row?,
            None => return Err(ServiceError::ProjectNotFound { id }),
        };
        let member_ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(
                "SELECT user_id FROM project_members WHERE project_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            collect_rows(rows)?
        };
        Ok(Project {
            id: raw.0,
            name: raw.1,
            description: raw.2,
            icon: raw.3,
            status: parse_stored(&raw.4)?,
            owner_id: raw.5,
            scrum_master_id: raw.6,
            member_ids,
            start_date: raw.7,
            end_date: raw.8,
            created_at: raw.9,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        icon: Option<&str>,
        status: Option<ProjectStatus>,
        owner_id: Option<i64>,
        scrum_master_id: Option<i64>,
    ) -> ServiceResult<Project> {
        self.get_project(id)?;
        let tx = self.conn.unchecked_transaction()?;
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(ServiceError::Validation("Project name is required".into()));
            }
            tx.execute(
                "UPDATE projects SET name = ?1 WHERE id = ?2",
                params![name.trim(), id],
            )?;
        }
        if let Some(description) = description {
            tx.execute(
                "UPDATE projects SET description = ?1 WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(icon) = icon {
            tx.execute("UPDATE projects SET icon = ?1 WHERE id = ?2", params![icon, id])?;
        }
        if let Some(status) = status {
            tx.execute(
                "UPDATE projects SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        if let Some(uid) = owner_id {
            self.get_user(uid)?;
            tx.execute(
                "UPDATE projects SET owner_id = ?1 WHERE id = ?2",
                params![uid, id],
            )?;
        }
        if let Some(uid) = scrum_master_id {
            self.get_user(uid)?;
            tx.execute(
                "UPDATE projects SET scrum_master_id = ?1 WHERE id = ?2",
                params![uid, id],
            )?;
        }
        tx.commit()?;
        self.get_project(id)
    }

    pub fn add_project_member(&self, project_id: i64, user_id: i64) -> ServiceResult<Project> {
        self.get_project(project_id)?;
        self.get_user(user_id)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?1, ?2)",
            params![project_id, user_id],
        )?;
        self.get_project(project_id)
    }

    // ── Epic CRUD ─────────────────────────────────────────────────────

    /// Epic numbers come from a per-project counter that only moves
    /// forward, so a number is never reused after deletion.
    pub fn create_epic(
        &self,
        project_id: i64,
        title: &str,
        description: &str,
    ) -> ServiceResult<Epic> {
        if title.trim().is_empty() {
            return Err(ServiceError::Validation("Epic title is required".into()));
        }
        self.get_project(project_id)?;
        let tx = self.conn.unchecked_transaction()?;
        let number: i64 = tx.query_row(
            "SELECT next_epic_number FROM projects WHERE id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO epics (project_id, epic_number, title, description) VALUES (?1, ?2, ?3, ?4)",
            params![project_id, number, title.trim(), description],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE projects SET next_epic_number = next_epic_number + 1 WHERE id = ?1",
            params![project_id],
        )?;
        tx.commit()?;
        self.get_epic(id)
    }

    pub fn list_epics(&self, project_id: i64) -> ServiceResult<Vec<Epic>> {
        self.get_project(project_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, epic_number, title, description, status, created_at
             FROM epics WHERE project_id = ?1 ORDER BY epic_number",
        )?;
        let rows = stmt.query_map(params![project_id], map_epic_row)?;
        let epics: Vec<RawEpic> = collect_rows(rows)?;
        epics.into_iter().map(RawEpic::into_epic).collect()
    }

    pub fn get_epic(&self, id: i64) -> ServiceResult<Epic> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, epic_number, title, description, status, created_at
             FROM epics WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], map_epic_row)?;
        match rows.next() {
            Some(row) => row?.into_epic(),
            None => Err(ServiceError::EpicNotFound { id }),
        }
    }

    pub fn update_epic(
        &self,
        id: i64,
        title: Option<&str>,
        description: Option<&str>,
        status: Option<StoryStatus>,
    ) -> ServiceResult<Epic> {
        self.get_epic(id)?;
        let tx = self.conn.unchecked_transaction()?;
        if let Some(title) = title {
            if title.trim().is_empty() {
                return Err(ServiceError::Validation("Epic title is required".into()));
            }
            tx.execute(
                "UPDATE epics SET title = ?1 WHERE id = ?2",
                params![title.trim(), id],
            )?;
        }
        if let Some(description) = description {
            tx.execute(
                "UPDATE epics SET description = ?1 WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(status) = status {
            tx.execute(
                "UPDATE epics SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        tx.commit()?;
        self.get_epic(id)
    }

    /// Deletes the epic and, via FK cascade, every story under it (and
    /// their issues). This is the destructive path the UI confirms.
    pub fn delete_epic(&self, id: i64) -> ServiceResult<()> {
        self.get_epic(id)?;
        self.conn
            .execute("DELETE FROM epics WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Story CRUD ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_story(
        &self,
        project_id: i64,
        epic_id: Option<i64>,
        title: &str,
        description: &str,
        acceptance_criteria: &[String],
        business_value: i64,
        urgency: i64,
        story_points: i64,
    ) -> ServiceResult<Story> {
        if title.trim().is_empty() {
            return Err(ServiceError::Validation("Story title is required".into()));
        }
        validate_story_fields(business_value, urgency, story_points)?;
        self.get_project(project_id)?;
        if let Some(eid) = epic_id {
            let epic = self.get_epic(eid)?;
            if epic.project_id != project_id {
                return Err(ServiceError::Validation(format!(
                    "Epic {} belongs to a different project",
                    eid
                )));
            }
        }
        let criteria_json = serde_json::to_string(acceptance_criteria)
            .map_err(|e| ServiceError::Transient(e.into()))?;
        let tx = self.conn.unchecked_transaction()?;
        let number: i64 = tx.query_row(
            "SELECT next_story_number FROM projects WHERE id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO stories (project_id, epic_id, story_number, title, description,
                                  acceptance_criteria, business_value, urgency, story_points)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project_id,
                epic_id,
                number,
                title.trim(),
                description,
                criteria_json,
                business_value,
                urgency,
                story_points
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE projects SET next_story_number = next_story_number + 1 WHERE id = ?1",
            params![project_id],
        )?;
        tx.commit()?;
        self.get_story(id)
    }

    pub fn list_stories(&self, project_id: i64) -> ServiceResult<Vec<Story>> {
        self.get_project(project_id)?;
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 ORDER BY story_number",
            STORY_SELECT
        ))?;
        let rows = stmt.query_map(params![project_id], map_story_row)?;
        let raw: Vec<RawStory> = collect_rows(rows)?;
        raw.into_iter().map(RawStory::into_story).collect()
    }

    /// Project backlog: all stories, ranked by the priority engine.
    pub fn ranked_backlog(&self, project_id: i64) -> ServiceResult<Vec<Story>> {
        let mut stories = self.list_stories(project_id)?;
        priority::rank(&mut stories);
        Ok(stories)
    }

    pub fn get_story(&self, id: i64) -> ServiceResult<Story> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", STORY_SELECT))?;
        let mut rows = stmt.query_map(params![id], map_story_row)?;
        match rows.next() {
            Some(row) => row?.into_story(),
            None => Err(ServiceError::StoryNotFound { id }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_story(
        &self,
        id: i64,
        title: Option<&str>,
        description: Option<&str>,
        acceptance_criteria: Option<&[String]>,
        business_value: Option<i64>,
        urgency: Option<i64>,
        story_points: Option<i64>,
        status: Option<StoryStatus>,
        epic_id: Option<Option<i64>>,
    ) -> ServiceResult<Story> {
        let current = self.get_story(id)?;
        validate_story_fields(
            business_value.unwrap_or(current.business_value),
            urgency.unwrap_or(current.urgency),
            story_points.unwrap_or(current.story_points),
        )?;
        if let Some(Some(eid)) = epic_id {
            let epic = self.get_epic(eid)?;
            if epic.project_id != current.project_id {
                return Err(ServiceError::Validation(format!(
                    "Epic {} belongs to a different project",
                    eid
                )));
            }
        }
        let tx = self.conn.unchecked_transaction()?;
        if let Some(title) = title {
            if title.trim().is_empty() {
                return Err(ServiceError::Validation("Story title is required".into()));
            }
            tx.execute(
                "UPDATE stories SET title = ?1 WHERE id = ?2",
                params![title.trim(), id],
            )?;
        }
        if let Some(description) = description {
            tx.execute(
                "UPDATE stories SET description = ?1 WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(criteria) = acceptance_criteria {
            let json = serde_json::to_string(criteria)
                .map_err(|e| ServiceError::Transient(e.into()))?;
            tx.execute(
                "UPDATE stories SET acceptance_criteria = ?1 WHERE id = ?2",
                params![json, id],
            )?;
        }
        if let Some(v) = business_value {
            tx.execute(
                "UPDATE stories SET business_value = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(v) = urgency {
            tx.execute("UPDATE stories SET urgency = ?1 WHERE id = ?2", params![v, id])?;
        }
        if let Some(v) = story_points {
            tx.execute(
                "UPDATE stories SET story_points = ?1 WHERE id = ?2",
                params![v, id],
            )?;
        }
        if let Some(status) = status {
            tx.execute(
                "UPDATE stories SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        if let Some(eid) = epic_id {
            tx.execute("UPDATE stories SET epic_id = ?1 WHERE id = ?2", params![eid, id])?;
        }
        tx.commit()?;
        self.get_story(id)
    }

    pub fn delete_story(&self, id: i64) -> ServiceResult<()> {
        self.get_story(id)?;
        self.conn
            .execute("DELETE FROM stories WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// A story is complete iff it has at least one issue and all of them
    /// are DONE, or its own status is DONE.
    pub fn is_story_complete(&self, story: &Story) -> ServiceResult<bool> {
        if story.status == StoryStatus::Done {
            return Ok(true);
        }
        let (total, done): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'DONE'), 0) FROM issues WHERE story_id = ?1",
            params![story.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(total > 0 && done == total)
    }

    // ── Issue CRUD ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_issue(
        &self,
        story_id: i64,
        title: &str,
        description: &str,
        category: IssueCategory,
        time_estimate: f64,
        assignee_ids: &[i64],
        sprint_id: Option<i64>,
    ) -> ServiceResult<Issue> {
        if title.trim().is_empty() {
            return Err(ServiceError::Validation("Issue title is required".into()));
        }
        if time_estimate < 0.0 {
            return Err(ServiceError::Validation(
                "Issue time_estimate must be >= 0".into(),
            ));
        }
        let story = self.get_story(story_id)?;
        if let Some(sid) = sprint_id {
            let sprint = self.get_sprint(sid)?;
            if sprint.project_id != story.project_id {
                return Err(ServiceError::Validation(format!(
                    "Sprint {} belongs to a different project than story {}",
                    sid, story_id
                )));
            }
        }
        for uid in assignee_ids {
            self.get_user(*uid)?;
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO issues (story_id, sprint_id, title, description, category, time_estimate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                story_id,
                sprint_id,
                title.trim(),
                description,
                category.as_str(),
                time_estimate
            ],
        )?;
        let id = tx.last_insert_rowid();
        for uid in assignee_ids {
            tx.execute(
                "INSERT OR IGNORE INTO issue_assignees (issue_id, user_id) VALUES (?1, ?2)",
                params![id, uid],
            )?;
        }
        tx.commit()?;
        self.get_issue(id)
    }

    pub fn list_issues_for_story(&self, story_id: i64) -> ServiceResult<Vec<Issue>> {
        self.get_story(story_id)?;
        let ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM issues WHERE story_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![story_id], |row| row.get(0))?;
            collect_rows(rows)?
        };
        ids.into_iter().map(|id| self.get_issue(id)).collect()
    }

    pub fn list_issues_for_project(&self, project_id: i64) -> ServiceResult<Vec<Issue>> {
        self.get_project(project_id)?;
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(
                "SELECT i.id FROM issues i JOIN stories s ON s.id = i.story_id
                 WHERE s.project_id = ?1 ORDER BY i.id",
            )?;
            let rows = stmt.query_map(params![project_id], |row| row.get(0))?;
            collect_rows(rows)?
        };
        ids.into_iter().map(|id| self.get_issue(id)).collect()
    }

    pub fn get_issue(&self, id: i64) -> ServiceResult<Issue> {
        let mut stmt = self.conn.prepare(
            "SELECT id, story_id, sprint_id, title, description, category, status,
                    blocked_from, time_estimate, created_at, updated_at
             FROM issues WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(RawIssue {
                id: row.get(0)?,
                story_id: row.get(1)?,
                sprint_id: row.get(2)?,
                title: row.get(3)?,
                description: row.get(4)?,
                category: row.get(5)?,
                status: row.get(6)?,
                blocked_from: row.get(7)?,
                time_estimate: row.get(8)?,
                created_at: row.get(9)?,
                updated_at: row.get(10)?,
            })
        })?;
        let raw = match rows.next() {
            Some(row) => row?,
            None => return Err(ServiceError::IssueNotFound { id }),
        };
        let assignee_ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(
                "SELECT user_id FROM issue_assignees WHERE issue_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            collect_rows(rows)?
        };
        raw.into_issue(assignee_ids)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_issue(
        &self,
        id: i64,
        title: Option<&str>,
        description: Option<&str>,
        category: Option<IssueCategory>,
        time_estimate: Option<f64>,
        assignee_ids: Option<&[i64]>,
    ) -> ServiceResult<Issue> {
        self.get_issue(id)?;
        if let Some(t) = time_estimate {
            if t < 0.0 {
                return Err(ServiceError::Validation(
                    "Issue time_estimate must be >= 0".into(),
                ));
            }
        }
        if let Some(uids) = assignee_ids {
            for uid in uids {
                self.get_user(*uid)?;
            }
        }
        let tx = self.conn.unchecked_transaction()?;
        if let Some(title) = title {
            if title.trim().is_empty() {
                return Err(ServiceError::Validation("Issue title is required".into()));
            }
            tx.execute(
                "UPDATE issues SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![title.trim(), id],
            )?;
        }
        if let Some(description) = description {
            tx.execute(
                "UPDATE issues SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(category) = category {
            tx.execute(
                "UPDATE issues SET category = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![category.as_str(), id],
            )?;
        }
        if let Some(t) = time_estimate {
            tx.execute(
                "UPDATE issues SET time_estimate = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![t, id],
            )?;
        }
        if let Some(uids) = assignee_ids {
            tx.execute(
                "DELETE FROM issue_assignees WHERE issue_id = ?1",
                params![id],
            )?;
            for uid in uids {
                tx.execute(
                    "INSERT OR IGNORE INTO issue_assignees (issue_id, user_id) VALUES (?1, ?2)",
                    params![id, uid],
                )?;
            }
        }
        tx.commit()?;
        self.get_issue(id)
    }

    /// Move an issue to a target status through the board state machine.
    /// Assignees and estimates are untouched; only status and the BLOCKED
    /// bookkeeping change.
    pub fn move_issue(&self, id: i64, target: IssueStatus) -> ServiceResult<Issue> {
        let issue = self.get_issue(id)?;
        let transition = board::apply_move(issue.status, issue.blocked_from, target)?;
        self.conn.execute(
            "UPDATE issues SET status = ?1, blocked_from = ?2, updated_at = datetime('now')
             WHERE id = ?3",
            params![
                transition.status.as_str(),
                transition.blocked_from.map(|s| s.as_str()),
                id
            ],
        )?;
        self.get_issue(id)
    }

    /// Assign the issue to a sprint (or clear with None). The sprint must
    /// belong to the same project as the issue's story.
    pub fn assign_issue_to_sprint(
        &self,
        id: i64,
        sprint_id: Option<i64>,
    ) -> ServiceResult<Issue> {
        let issue = self.get_issue(id)?;
        if let Some(sid) = sprint_id {
            let sprint = self.get_sprint(sid)?;
            let story = self.get_story(issue.story_id)?;
            if sprint.project_id != story.project_id {
                return Err(ServiceError::SprintProjectMismatch {
                    sprint_id: sid,
                    issue_id: id,
                });
            }
        }
        self.conn.execute(
            "UPDATE issues SET sprint_id = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![sprint_id, id],
        )?;
        self.get_issue(id)
    }

    pub fn delete_issue(&self, id: i64) -> ServiceResult<()> {
        self.get_issue(id)?;
        self.conn
            .execute("DELETE FROM issues WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Sprint CRUD ───────────────────────────────────────────────────

    pub fn create_sprint(
        &self,
        project_id: i64,
        name: &str,
        goal: &str,
        start_date: &str,
        end_date: &str,
    ) -> ServiceResult<Sprint> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("Sprint name is required".into()));
        }
        let (start, end) = (parse_date(start_date)?, parse_date(end_date)?);
        if end < start {
            return Err(ServiceError::Validation(
                "Sprint end_date must not precede start_date".into(),
            ));
        }
        self.get_project(project_id)?;
        self.conn.execute(
            "INSERT INTO sprints (project_id, name, goal, start_date, end_date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project_id, name.trim(), goal, start_date, end_date],
        )?;
        self.get_sprint(self.conn.last_insert_rowid())
    }

    pub fn list_sprints(&self, project_id: i64) -> ServiceResult<Vec<Sprint>> {
        self.get_project(project_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, name, goal, start_date, end_date, created_at
             FROM sprints WHERE project_id = ?1 ORDER BY start_date, id",
        )?;
        let rows = stmt.query_map(params![project_id], map_sprint_row)?;
        let raw: Vec<RawSprint> = collect_rows(rows)?;
        raw.into_iter().map(RawSprint::into_sprint).collect()
    }

    pub fn get_sprint(&self, id: i64) -> ServiceResult<Sprint> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, name, goal, start_date, end_date, created_at
             FROM sprints WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], map_sprint_row)?;
        match rows.next() {
            Some(row) => row?.into_sprint(),
            None => Err(ServiceError::SprintNotFound { id }),
        }
    }

    /// The board payload: a sprint together with its issues.
    pub fn get_sprint_detail(&self, id: i64) -> ServiceResult<SprintDetail> {
        let sprint = self.get_sprint(id)?;
        let ids: Vec<i64> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM issues WHERE sprint_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            collect_rows(rows)?
        };
        let issues = ids
            .into_iter()
            .map(|iid| self.get_issue(iid))
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(SprintDetail { sprint, issues })
    }

    pub fn delete_sprint(&self, id: i64) -> ServiceResult<()> {
        self.get_sprint(id)?;
        // Issues fall back to the unassigned pool via ON DELETE SET NULL.
        self.conn
            .execute("DELETE FROM sprints WHERE id = ?1", params![id])?;
        Ok(())
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

const STORY_SELECT: &str = "SELECT id, project_id, epic_id, story_number, title, description,
        acceptance_criteria, business_value, urgency, story_points, status, created_at
 FROM stories";

struct RawEpic {
    id: i64,
    project_id: i64,
    epic_number: i64,
    title: String,
    description: String,
    status: String,
    created_at: String,
}

fn map_epic_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEpic> {
    Ok(RawEpic {
        id: row.get(0)?,
        project_id: row.get(1)?,
        epic_number: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl RawEpic {
    fn into_epic(self) -> ServiceResult<Epic> {
        Ok(Epic {
            id: self.id,
            project_id: self.project_id,
            epic_number: self.epic_number,
            title: self.title,
            description: self.description,
            status: parse_stored(&self.status)?,
            created_at: self.created_at,
        })
    }
}

struct RawStory {
    id: i64,
    project_id: i64,
    epic_id: Option<i64>,
    story_number: i64,
    title: String,
    description: String,
    acceptance_criteria: String,
    business_value: i64,
    urgency: i64,
    story_points: i64,
    status: String,
    created_at: String,
}

fn map_story_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawStory> {
    Ok(RawStory {
        id: row.get(0)?,
        project_id: row.get(1)?,
        epic_id: row.get(2)?,
        story_number: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        acceptance_criteria: row.get(6)?,
        business_value: row.get(7)?,
        urgency: row.get(8)?,
        story_points: row.get(9)?,
        status: row.get(10)?,
        created_at: row.get(11)?,
    })
}

impl RawStory {
    fn into_story(self) -> ServiceResult<Story> {
        let criteria: Vec<String> = serde_json::from_str(&self.acceptance_criteria)
            .map_err(|e| ServiceError::Transient(e.into()))?;
        // The derived score is computed at read time, never persisted.
        let score = priority::compute_score(self.business_value, self.urgency, self.story_points);
        Ok(Story {
            id: self.id,
            project_id: self.project_id,
            epic_id: self.epic_id,
            story_number: self.story_number,
            title: self.title,
            description: self.description,
            acceptance_criteria: criteria,
            business_value: self.business_value,
            urgency: self.urgency,
            story_points: self.story_points,
            status: parse_stored(&self.status)?,
            priority_score: score,
            created_at: self.created_at,
        })
    }
}

struct RawIssue {
    id: i64,
    story_id: i64,
    sprint_id: Option<i64>,
    title: String,
    description: String,
    category: String,
    status: String,
    blocked_from: Option<String>,
    time_estimate: f64,
    created_at: String,
    updated_at: String,
}

impl RawIssue {
    fn into_issue(self, assignee_ids: Vec<i64>) -> ServiceResult<Issue> {
        let blocked_from = match &self.blocked_from {
            Some(s) => Some(parse_stored::<IssueStatus>(s)?),
            None => None,
        };
        Ok(Issue {
            id: self.id,
            story_id: self.story_id,
            sprint_id: self.sprint_id,
            title: self.title,
            description: self.description,
            category: parse_stored(&self.category)?,
            status: parse_stored(&self.status)?,
            blocked_from,
            time_estimate: self.time_estimate,
            assignee_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct RawSprint {
    id: i64,
    project_id: i64,
    name: String,
    goal: String,
    start_date: String,
    end_date: String,
    created_at: String,
}

fn map_sprint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSprint> {
    Ok(RawSprint {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        goal: row.get(3)?,
        start_date: row.get(4)?,
        end_date: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl RawSprint {
    fn into_sprint(self) -> ServiceResult<Sprint> {
        let today = Utc::now().date_naive();
        let active = parse_date(&self.start_date)? <= today && today <= parse_date(&self.end_date)?;
        Ok(Sprint {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            goal: self.goal,
            start_date: self.start_date,
            end_date: self.end_date,
            active,
            created_at: self.created_at,
        })
    }
}

/// Parse a stored enum tag, treating corruption as a transient store error
/// rather than a panic.
fn parse_stored<T: FromStr<Err = String>>(s: &str) -> ServiceResult<T> {
    s.parse()
        .map_err(|e: String| ServiceError::Transient(anyhow::anyhow!(e)))
}

/// Dates are date-only (`YYYY-MM-DD`); a full RFC 3339 timestamp is
/// accepted and truncated to its date.
fn parse_date(s: &str) -> ServiceResult<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.date_naive())
        .map_err(|_| ServiceError::Validation(format!("Invalid date: {}", s)))
}

fn roles_to_json(roles: &[Role]) -> String {
    let tags: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
    serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string())
}

fn map_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let roles_json: String = row.get(3)?;
    let tags: Vec<String> = serde_json::from_str(&roles_json).unwrap_or_default();
    let roles = tags.iter().filter_map(|t| t.parse().ok()).collect();
    Ok(User {
        id: row.get(0)?,
        full_name: row.get(1)?,
        email: row.get(2)?,
        roles,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> ServiceResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}


fn validate_story_fields(
    business_value: i64,
    urgency: i64,
    story_points: i64,
) -> ServiceResult<()> {
    if !(0..=100).contains(&business_value) {
        return Err(ServiceError::Validation(
            "business_value must be within [0, 100]".into(),
        ));
    }
    if !(0..=100).contains(&urgency) {
        return Err(ServiceError::Validation(
            "urgency must be within [0, 100]".into(),
        ));
    }
    if !valid_story_points(story_points) {
        return Err(ServiceError::Validation(format!(
            "story_points must be one of {:?}",
            STORY_POINT_SET
        )));
    }
    Ok(())
}
