use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical role set. Incoming role strings are folded into this enum at
/// the parse boundary; the store only ever holds canonical tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Owner,
    Admin,
    Po,
    Sm,
    Dev,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Admin => "ADMIN",
            Self::Po => "PO",
            Self::Sm => "SM",
            Self::Dev => "DEV",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    /// Accepts the synonym spellings seen in the wild (`ROLE_` prefixes,
    /// long forms) and folds them into the closed set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        let tag = tag.strip_prefix("ROLE_").unwrap_or(&tag);
        match tag {
            "OWNER" => Ok(Self::Owner),
            "ADMIN" | "ADMINISTRATOR" => Ok(Self::Admin),
            "PO" | "PRODUCT_OWNER" => Ok(Self::Po),
            "SM" | "SCRUM_MASTER" => Ok(Self::Sm),
            "DEV" | "DEVELOPER" => Ok(Self::Dev),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Completed,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryStatus {
    Backlog,
    Todo,
    Doing,
    Testing,
    Done,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "BACKLOG",
            Self::Todo => "TODO",
            Self::Doing => "DOING",
            Self::Testing => "TESTING",
            Self::Done => "DONE",
        }
    }
}

impl FromStr for StoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BACKLOG" => Ok(Self::Backlog),
            "TODO" => Ok(Self::Todo),
            "DOING" => Ok(Self::Doing),
            "TESTING" => Ok(Self::Testing),
            "DONE" => Ok(Self::Done),
            _ => Err(format!("Invalid story status: {}", s)),
        }
    }
}

/// Board columns. BLOCKED is a parking state, not a column in the forward
/// flow; `Issue::blocked_from` remembers where the issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    ToDo,
    InProgress,
    CodeReview,
    Qa,
    Blocked,
    Done,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToDo => "TO_DO",
            Self::InProgress => "IN_PROGRESS",
            Self::CodeReview => "CODE_REVIEW",
            Self::Qa => "QA",
            Self::Blocked => "BLOCKED",
            Self::Done => "DONE",
        }
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TO_DO" => Ok(Self::ToDo),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "CODE_REVIEW" => Ok(Self::CodeReview),
            "QA" => Ok(Self::Qa),
            "BLOCKED" => Ok(Self::Blocked),
            "DONE" => Ok(Self::Done),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCategory {
    Backend,
    Frontend,
    Database,
    Qa,
    Design,
    Bug,
    Devops,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "BACKEND",
            Self::Frontend => "FRONTEND",
            Self::Database => "DATABASE",
            Self::Qa => "QA",
            Self::Design => "DESIGN",
            Self::Bug => "BUG",
            Self::Devops => "DEVOPS",
        }
    }
}

impl FromStr for IssueCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BACKEND" => Ok(Self::Backend),
            "FRONTEND" => Ok(Self::Frontend),
            "DATABASE" => Ok(Self::Database),
            "QA" => Ok(Self::Qa),
            "DESIGN" => Ok(Self::Design),
            "BUG" => Ok(Self::Bug),
            "DEVOPS" => Ok(Self::Devops),
            _ => Err(format!("Invalid issue category: {}", s)),
        }
    }
}

/// Story points are Fibonacci; 0 means "not estimated yet".
pub const STORY_POINT_SET: [i64; 8] = [0, 1, 2, 3, 5, 8, 13, 21];

pub fn valid_story_points(points: i64) -> bool {
    STORY_POINT_SET.contains(&points)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub full_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub is_active: bool,
    pub created_at: String,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Owner) || self.has_role(Role::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: Option<String>,
    pub status: ProjectStatus,
    pub owner_id: Option<i64>,
    pub scrum_master_id: Option<i64>,
    pub member_ids: Vec<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: i64,
    pub project_id: i64,
    pub epic_number: i64,
    pub title: String,
    pub description: String,
    pub status: StoryStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: i64,
    pub project_id: i64,
    pub epic_id: Option<i64>,
    pub story_number: i64,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub business_value: i64,
    pub urgency: i64,
    pub story_points: i64,
    pub status: StoryStatus,
    /// Derived on every read; never persisted.
    pub priority_score: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub story_id: i64,
    pub sprint_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub category: IssueCategory,
    pub status: IssueStatus,
    /// Status the issue held before entering BLOCKED; null otherwise.
    pub blocked_from: Option<IssueStatus>,
    pub time_estimate: f64,
    pub assignee_ids: Vec<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sprint {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub goal: String,
    pub start_date: String,
    pub end_date: String,
    /// Derived: start_date <= now <= end_date.
    pub active: bool,
    pub created_at: String,
}

// API view types

/// Sprint plus its issues — the board payload the Kanban view renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprintDetail {
    #[serde(flatten)]
    pub sprint: Sprint,
    pub issues: Vec<Issue>,
}
