//! HTTP surface: axum handlers and the API router.
//!
//! Handlers are thin: resolve the session from `X-User-Id`, run the policy
//! gate and the store operation inside one `db.call` closure (so checks and
//! writes see the same state), serialize the result. All failures flow
//! through [`ApiError`], which renders the `{"type", "message"}` body the
//! clients match on.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Deserializer};

use crate::db::DbHandle;
use crate::errors::ServiceError;
use crate::models::*;
use crate::policy::{self, Session};
use crate::reports;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized(String),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self::Service(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::Service(err) => {
                let status = match &err {
                    ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
                    ServiceError::ProjectNotFound { .. }
                    | ServiceError::EpicNotFound { .. }
                    | ServiceError::StoryNotFound { .. }
                    | ServiceError::IssueNotFound { .. }
                    | ServiceError::SprintNotFound { .. }
                    | ServiceError::UserNotFound { .. }
                    | ServiceError::SprintProjectMismatch { .. } => StatusCode::NOT_FOUND,
                    ServiceError::Forbidden { .. } => StatusCode::FORBIDDEN,
                    ServiceError::Conflict { .. } => StatusCode::CONFLICT,
                    ServiceError::Transient(_) => {
                        tracing::error!(error = %err, "store failure");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                };
                (status, err.kind_str(), err.to_string())
            }
        };
        (
            status,
            Json(serde_json::json!({"type": kind, "message": message})),
        )
            .into_response()
    }
}

// ── Session ───────────────────────────────────────────────────────────

const USER_HEADER: &str = "x-user-id";

/// Resolve the calling user from the `X-User-Id` header. Unknown ids are
/// 401, not 404: the caller failed to identify, nothing was looked up on
/// their behalf.
async fn session(state: &SharedState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let raw = headers
        .get(USER_HEADER)
        .ok_or_else(|| ApiError::Unauthorized("Missing X-User-Id header".into()))?;
    let id: i64 = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| ApiError::Unauthorized("Invalid X-User-Id header".into()))?;
    let user = state
        .db
        .call(move |db| db.get_user(id))
        .await
        .map_err(|e| match e {
            ServiceError::UserNotFound { id } => {
                ApiError::Unauthorized(format!("Unknown user {}", id))
            }
            other => ApiError::Service(other),
        })?;
    let session = Session::new(user);
    policy::require_active(&session)?;
    Ok(session)
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub full_name: String,
    pub email: String,
    pub roles: Vec<String>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub roles: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct DeactivateQuery {
    pub replacement_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub icon: Option<String>,
    pub owner_id: Option<i64>,
    pub scrum_master_id: Option<i64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub status: Option<ProjectStatus>,
    pub owner_id: Option<i64>,
    pub scrum_master_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
}

#[derive(Deserialize)]
pub struct CreateEpicRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
pub struct UpdateEpicRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<StoryStatus>,
}

#[derive(Deserialize)]
pub struct CreateStoryRequest {
    pub epic_id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub business_value: i64,
    #[serde(default)]
    pub urgency: i64,
    #[serde(default)]
    pub story_points: i64,
}

/// Distinguishes "field absent" (no change) from "field null" (clear the
/// epic link) for PATCH bodies.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

#[derive(Deserialize)]
pub struct UpdateStoryRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub business_value: Option<i64>,
    pub urgency: Option<i64>,
    pub story_points: Option<i64>,
    pub status: Option<StoryStatus>,
    #[serde(default, deserialize_with = "double_option")]
    pub epic_id: Option<Option<i64>>,
}

#[derive(Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<IssueCategory>,
    #[serde(default)]
    pub time_estimate: f64,
    #[serde(default)]
    pub assignee_ids: Vec<i64>,
    pub sprint_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateIssueRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<IssueCategory>,
    pub time_estimate: Option<f64>,
    pub assignee_ids: Option<Vec<i64>>,
}

#[derive(Deserialize)]
pub struct MoveIssueRequest {
    pub status: IssueStatus,
}

#[derive(Deserialize)]
pub struct AssignSprintRequest {
    pub sprint_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateSprintRequest {
    pub name: String,
    #[serde(default)]
    pub goal: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Deserialize)]
pub struct TopStoriesQuery {
    pub n: Option<usize>,
}

#[derive(Deserialize)]
pub struct PortfolioQuery {
    pub ids: String,
}

fn parse_roles(raw: &[String]) -> Result<Vec<Role>, ApiError> {
    raw.iter()
        .map(|s| s.parse::<Role>())
        .collect::<Result<Vec<_>, String>>()
        .map_err(|e| ApiError::Service(ServiceError::Validation(e)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{id}", patch(update_user).delete(deactivate_user))
        .route("/api/users/{id}/activate", put(activate_user))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project).patch(update_project))
        .route("/api/projects/{id}/members", post(add_member))
        .route("/api/projects/{id}/epics", get(list_epics).post(create_epic))
        .route(
            "/api/epics/{id}",
            patch(update_epic).delete(delete_epic).get(get_epic),
        )
        .route("/api/projects/{id}/stories", post(create_story))
        .route("/api/projects/{id}/backlog", get(get_backlog))
        .route(
            "/api/stories/{id}",
            get(get_story).patch(update_story).delete(delete_story),
        )
        .route(
            "/api/stories/{id}/issues",
            get(list_story_issues).post(create_issue),
        )
        .route(
            "/api/issues/{id}",
            get(get_issue).patch(update_issue).delete(delete_issue),
        )
        .route("/api/issues/{id}/status", patch(move_issue))
        .route("/api/issues/{id}/sprint", patch(assign_issue_sprint))
        .route(
            "/api/projects/{id}/sprints",
            get(list_sprints).post(create_sprint),
        )
        .route("/api/sprints/{id}", get(get_sprint).delete(delete_sprint))
        .route("/api/projects/{id}/progress", get(project_progress))
        .route("/api/projects/{id}/backlog-health", get(backlog_health))
        .route("/api/projects/{id}/top-stories", get(top_stories))
        .route(
            "/api/projects/{id}/unassigned-stories",
            get(unassigned_stories),
        )
        .route(
            "/api/projects/{id}/status-distribution",
            get(status_distribution),
        )
        .route("/api/projects/{id}/sprint-metrics", get(sprint_metrics))
        .route("/api/reports/progress", get(portfolio_progress))
        .route("/health", get(health_check))
}

async fn health_check() -> &'static str {
    "ok"
}

// ── User handlers ─────────────────────────────────────────────────────

async fn list_users(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>, ApiError> {
    session(&state, &headers).await?;
    let users = state.db.call(|db| db.list_users()).await?;
    Ok(Json(users))
}

async fn create_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let session = session(&state, &headers).await?;
    policy::require_user_admin(&session)?;
    let roles = parse_roles(&req.roles)?;
    let user = state
        .db
        .call(move |db| db.create_user(&req.full_name, &req.email, &roles))
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<User>, ApiError> {
    let session = session(&state, &headers).await?;
    policy::require_user_admin(&session)?;
    let roles = match &req.roles {
        Some(raw) => Some(parse_roles(raw)?),
        None => None,
    };
    let user = state
        .db
        .call(move |db| {
            db.update_user(id, req.full_name.as_deref(), req.email.as_deref(), roles.as_deref())
        })
        .await?;
    Ok(Json(user))
}

async fn deactivate_user(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<DeactivateQuery>,
    headers: HeaderMap,
) -> Result<Json<User>, ApiError> {
    let session = session(&state, &headers).await?;
    policy::require_user_admin(&session)?;
    let user = state
        .db
        .call(move |db| db.deactivate_user(id, query.replacement_id))
        .await?;
    Ok(Json(user))
}

async fn activate_user(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<User>, ApiError> {
    let session = session(&state, &headers).await?;
    policy::require_user_admin(&session)?;
    let user = state.db.call(move |db| db.activate_user(id)).await?;
    Ok(Json(user))
}

// ── Project handlers ──────────────────────────────────────────────────

async fn list_projects(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Project>>, ApiError> {
    session(&state, &headers).await?;
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let session = session(&state, &headers).await?;
    policy::require_project_admin(&session)?;
    let project = state
        .db
        .call(move |db| {
            db.create_project(
                &req.name,
                &req.description,
                req.icon.as_deref(),
                req.owner_id,
                req.scrum_master_id,
                req.start_date.as_deref(),
                req.end_date.as_deref(),
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Project>, ApiError> {
    session(&state, &headers).await?;
    let project = state.db.call(move |db| db.get_project(id)).await?;
    Ok(Json(project))
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    let session = session(&state, &headers).await?;
    policy::require_project_admin(&session)?;
    let project = state
        .db
        .call(move |db| {
            db.update_project(
                id,
                req.name.as_deref(),
                req.description.as_deref(),
                req.icon.as_deref(),
                req.status,
                req.owner_id,
                req.scrum_master_id,
            )
        })
        .await?;
    Ok(Json(project))
}

async fn add_member(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<Project>, ApiError> {
    let session = session(&state, &headers).await?;
    let project = state
        .db
        .call(move |db| {
            let project = db.get_project(id)?;
            policy::require_delivery_lead(&session, &project)?;
            db.add_project_member(id, req.user_id)
        })
        .await?;
    Ok(Json(project))
}

// ── Epic handlers ─────────────────────────────────────────────────────

async fn list_epics(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<Epic>>, ApiError> {
    session(&state, &headers).await?;
    let epics = state.db.call(move |db| db.list_epics(project_id)).await?;
    Ok(Json(epics))
}

async fn create_epic(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateEpicRequest>,
) -> Result<(StatusCode, Json<Epic>), ApiError> {
    let session = session(&state, &headers).await?;
    let epic = state
        .db
        .call(move |db| {
            let project = db.get_project(project_id)?;
            policy::require_backlog_editor(&session, &project)?;
            db.create_epic(project_id, &req.title, &req.description)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(epic)))
}

async fn get_epic(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Epic>, ApiError> {
    session(&state, &headers).await?;
    let epic = state.db.call(move |db| db.get_epic(id)).await?;
    Ok(Json(epic))
}

async fn update_epic(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateEpicRequest>,
) -> Result<Json<Epic>, ApiError> {
    let session = session(&state, &headers).await?;
    let epic = state
        .db
        .call(move |db| {
            let epic = db.get_epic(id)?;
            let project = db.get_project(epic.project_id)?;
            policy::require_backlog_editor(&session, &project)?;
            db.update_epic(id, req.title.as_deref(), req.description.as_deref(), req.status)
        })
        .await?;
    Ok(Json(epic))
}

async fn delete_epic(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session = session(&state, &headers).await?;
    state
        .db
        .call(move |db| {
            let epic = db.get_epic(id)?;
            let project = db.get_project(epic.project_id)?;
            policy::require_backlog_editor(&session, &project)?;
            db.delete_epic(id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Story handlers ────────────────────────────────────────────────────

async fn create_story(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateStoryRequest>,
) -> Result<(StatusCode, Json<Story>), ApiError> {
    let session = session(&state, &headers).await?;
    let story = state
        .db
        .call(move |db| {
            let project = db.get_project(project_id)?;
            policy::require_backlog_editor(&session, &project)?;
            db.create_story(
                project_id,
                req.epic_id,
                &req.title,
                &req.description,
                &req.acceptance_criteria,
                req.business_value,
                req.urgency,
                req.story_points,
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(story)))
}

/// Ranked backlog: every story of the project in priority order.
async fn get_backlog(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<Story>>, ApiError> {
    session(&state, &headers).await?;
    let stories = state.db.call(move |db| db.ranked_backlog(project_id)).await?;
    Ok(Json(stories))
}

async fn get_story(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Story>, ApiError> {
    session(&state, &headers).await?;
    let story = state.db.call(move |db| db.get_story(id)).await?;
    Ok(Json(story))
}

async fn update_story(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateStoryRequest>,
) -> Result<Json<Story>, ApiError> {
    let session = session(&state, &headers).await?;
    let story = state
        .db
        .call(move |db| {
            let story = db.get_story(id)?;
            let project = db.get_project(story.project_id)?;
            policy::require_backlog_editor(&session, &project)?;
            db.update_story(
                id,
                req.title.as_deref(),
                req.description.as_deref(),
                req.acceptance_criteria.as_deref(),
                req.business_value,
                req.urgency,
                req.story_points,
                req.status,
                req.epic_id,
            )
        })
        .await?;
    Ok(Json(story))
}

async fn delete_story(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session = session(&state, &headers).await?;
    state
        .db
        .call(move |db| {
            let story = db.get_story(id)?;
            let project = db.get_project(story.project_id)?;
            policy::require_backlog_editor(&session, &project)?;
            db.delete_story(id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Issue handlers ────────────────────────────────────────────────────

async fn list_story_issues(
    State(state): State<SharedState>,
    Path(story_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<Issue>>, ApiError> {
    session(&state, &headers).await?;
    let issues = state
        .db
        .call(move |db| db.list_issues_for_story(story_id))
        .await?;
    Ok(Json(issues))
}

async fn create_issue(
    State(state): State<SharedState>,
    Path(story_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateIssueRequest>,
) -> Result<(StatusCode, Json<Issue>), ApiError> {
    let session = session(&state, &headers).await?;
    let issue = state
        .db
        .call(move |db| {
            let story = db.get_story(story_id)?;
            let project = db.get_project(story.project_id)?;
            policy::require_delivery_lead(&session, &project)?;
            db.create_issue(
                story_id,
                &req.title,
                &req.description,
                req.category.unwrap_or(IssueCategory::Backend),
                req.time_estimate,
                &req.assignee_ids,
                req.sprint_id,
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

async fn get_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Issue>, ApiError> {
    session(&state, &headers).await?;
    let issue = state.db.call(move |db| db.get_issue(id)).await?;
    Ok(Json(issue))
}

async fn update_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateIssueRequest>,
) -> Result<Json<Issue>, ApiError> {
    let session = session(&state, &headers).await?;
    let issue = state
        .db
        .call(move |db| {
            let issue = db.get_issue(id)?;
            let story = db.get_story(issue.story_id)?;
            let project = db.get_project(story.project_id)?;
            policy::require_delivery_lead(&session, &project)?;
            db.update_issue(
                id,
                req.title.as_deref(),
                req.description.as_deref(),
                req.category,
                req.time_estimate,
                req.assignee_ids.as_deref(),
            )
        })
        .await?;
    Ok(Json(issue))
}

/// Board move: status is the only thing the caller chooses; BLOCKED
/// bookkeeping is handled by the state machine.
async fn move_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<MoveIssueRequest>,
) -> Result<Json<Issue>, ApiError> {
    let session = session(&state, &headers).await?;
    let issue = state
        .db
        .call(move |db| {
            let issue = db.get_issue(id)?;
            let story = db.get_story(issue.story_id)?;
            let project = db.get_project(story.project_id)?;
            policy::require_board_mover(&session, &project, &issue)?;
            db.move_issue(id, req.status)
        })
        .await?;
    Ok(Json(issue))
}

async fn assign_issue_sprint(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<AssignSprintRequest>,
) -> Result<Json<Issue>, ApiError> {
    let session = session(&state, &headers).await?;
    let issue = state
        .db
        .call(move |db| {
            let issue = db.get_issue(id)?;
            let story = db.get_story(issue.story_id)?;
            let project = db.get_project(story.project_id)?;
            policy::require_delivery_lead(&session, &project)?;
            db.assign_issue_to_sprint(id, req.sprint_id)
        })
        .await?;
    Ok(Json(issue))
}

async fn delete_issue(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session = session(&state, &headers).await?;
    state
        .db
        .call(move |db| {
            let issue = db.get_issue(id)?;
            let story = db.get_story(issue.story_id)?;
            let project = db.get_project(story.project_id)?;
            policy::require_delivery_lead(&session, &project)?;
            db.delete_issue(id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Sprint handlers ───────────────────────────────────────────────────

async fn list_sprints(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<Sprint>>, ApiError> {
    session(&state, &headers).await?;
    let sprints = state.db.call(move |db| db.list_sprints(project_id)).await?;
    Ok(Json(sprints))
}

async fn create_sprint(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateSprintRequest>,
) -> Result<(StatusCode, Json<Sprint>), ApiError> {
    let session = session(&state, &headers).await?;
    let sprint = state
        .db
        .call(move |db| {
            let project = db.get_project(project_id)?;
            policy::require_delivery_lead(&session, &project)?;
            db.create_sprint(project_id, &req.name, &req.goal, &req.start_date, &req.end_date)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(sprint)))
}

/// The board payload: sprint fields plus its issues.
async fn get_sprint(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<SprintDetail>, ApiError> {
    session(&state, &headers).await?;
    let detail = state.db.call(move |db| db.get_sprint_detail(id)).await?;
    Ok(Json(detail))
}

async fn delete_sprint(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session = session(&state, &headers).await?;
    state
        .db
        .call(move |db| {
            let sprint = db.get_sprint(id)?;
            let project = db.get_project(sprint.project_id)?;
            policy::require_delivery_lead(&session, &project)?;
            db.delete_sprint(id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Report handlers ───────────────────────────────────────────────────

async fn project_progress(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<reports::ProjectProgress>, ApiError> {
    session(&state, &headers).await?;
    let progress = state
        .db
        .call(move |db| reports::project_progress(db, project_id))
        .await?;
    Ok(Json(progress))
}

async fn backlog_health(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<reports::BacklogHealth>, ApiError> {
    session(&state, &headers).await?;
    let health = state
        .db
        .call(move |db| reports::backlog_health(db, project_id))
        .await?;
    Ok(Json(health))
}

async fn top_stories(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    Query(query): Query<TopStoriesQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Story>>, ApiError> {
    session(&state, &headers).await?;
    let limit = query.n.unwrap_or(reports::DEFAULT_TOP_STORIES);
    let stories = state
        .db
        .call(move |db| reports::top_stories(db, project_id, limit))
        .await?;
    Ok(Json(stories))
}

async fn unassigned_stories(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<Story>>, ApiError> {
    session(&state, &headers).await?;
    let stories = state
        .db
        .call(move |db| reports::stories_without_issues(db, project_id))
        .await?;
    Ok(Json(stories))
}

async fn status_distribution(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<std::collections::BTreeMap<String, usize>>, ApiError> {
    session(&state, &headers).await?;
    let counts = state
        .db
        .call(move |db| reports::status_distribution(db, project_id))
        .await?;
    Ok(Json(counts))
}

async fn sprint_metrics(
    State(state): State<SharedState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<reports::SprintMetrics>>, ApiError> {
    session(&state, &headers).await?;
    let metrics = state
        .db
        .call(move |db| reports::sprint_metrics(db, project_id))
        .await?;
    Ok(Json(metrics))
}

async fn portfolio_progress(
    State(state): State<SharedState>,
    Query(query): Query<PortfolioQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<reports::PortfolioEntry>>, ApiError> {
    session(&state, &headers).await?;
    let ids = query
        .ids
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<i64>()
                .map_err(|_| ServiceError::Validation(format!("Invalid project id: {}", s)))
        })
        .collect::<Result<Vec<i64>, _>>()
        .map_err(ApiError::Service)?;
    let entries = state
        .db
        .call(move |db| Ok(reports::portfolio_progress(db, &ids)))
        .await?;
    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Router plus the id of a seeded OWNER account.
    fn test_app() -> (Router, i64) {
        let store = Store::open_in_memory().unwrap();
        let owner = store
            .create_user("Root Owner", "owner@example.com", &[Role::Owner])
            .unwrap();
        let state = Arc::new(AppState {
            db: DbHandle::new(store),
        });
        (api_router().with_state(state), owner.id)
    }

    fn request(method: &str, uri: &str, user_id: i64, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user_id.to_string());
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let value = body_json(response.into_body()).await;
        (status, value)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/projects")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["type"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_create_user_requires_admin() {
        let (app, owner) = test_app();
        let (status, dev) = send(
            &app,
            request(
                "POST",
                "/api/users",
                owner,
                Some(serde_json::json!({
                    "full_name": "Dana Dev",
                    "email": "dana@example.com",
                    // Synonym spelling folds to DEV.
                    "roles": ["ROLE_DEVELOPER"]
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(dev["roles"], serde_json::json!(["DEV"]));
        let dev_id = dev["id"].as_i64().unwrap();

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/users",
                dev_id,
                Some(serde_json::json!({
                    "full_name": "Eve",
                    "email": "eve@example.com",
                    "roles": ["DEV"]
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["type"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_backlog_is_ranked() {
        let (app, owner) = test_app();
        let (status, project) = send(
            &app,
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": "Alpha"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let pid = project["id"].as_i64().unwrap();

        for (title, value, points) in [("low", 10, 8), ("high", 80, 2), ("mid", 40, 5)] {
            let (status, _) = send(
                &app,
                request(
                    "POST",
                    &format!("/api/projects/{}/stories", pid),
                    owner,
                    Some(serde_json::json!({
                        "title": title,
                        "business_value": value,
                        "urgency": value,
                        "story_points": points
                    })),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, backlog) = send(
            &app,
            request("GET", &format!("/api/projects/{}/backlog", pid), owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let titles: Vec<&str> = backlog
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["high", "mid", "low"]);
        // Scores ride along on the wire.
        assert_eq!(backlog[0]["priority_score"], 80.0);
    }

    #[tokio::test]
    async fn test_invalid_story_points_rejected() {
        let (app, owner) = test_app();
        let (_, project) = send(
            &app,
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": "Alpha"})),
            ),
        )
        .await;
        let pid = project["id"].as_i64().unwrap();

        let (status, body) = send(
            &app,
            request(
                "POST",
                &format!("/api/projects/{}/stories", pid),
                owner,
                Some(serde_json::json!({"title": "bad", "story_points": 4})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_blocked_roundtrip_preserves_issue_fields() {
        let (app, owner) = test_app();
        let (_, project) = send(
            &app,
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": "Alpha"})),
            ),
        )
        .await;
        let pid = project["id"].as_i64().unwrap();
        let (_, story) = send(
            &app,
            request(
                "POST",
                &format!("/api/projects/{}/stories", pid),
                owner,
                Some(serde_json::json!({"title": "login", "story_points": 5})),
            ),
        )
        .await;
        let sid = story["id"].as_i64().unwrap();
        let (_, issue) = send(
            &app,
            request(
                "POST",
                &format!("/api/stories/{}/issues", sid),
                owner,
                Some(serde_json::json!({
                    "title": "api task",
                    "category": "BACKEND",
                    "time_estimate": 6.5,
                    "assignee_ids": [owner]
                })),
            ),
        )
        .await;
        let iid = issue["id"].as_i64().unwrap();

        let move_to = |status: &str| {
            request(
                "PATCH",
                &format!("/api/issues/{}/status", iid),
                owner,
                Some(serde_json::json!({"status": status})),
            )
        };

        let (status, moved) = send(&app, move_to("QA")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["status"], "QA");

        let (status, blocked) = send(&app, move_to("BLOCKED")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(blocked["status"], "BLOCKED");
        assert_eq!(blocked["blocked_from"], "QA");

        let (status, resumed) = send(&app, move_to("QA")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resumed["status"], "QA");
        assert_eq!(resumed["blocked_from"], serde_json::Value::Null);
        assert_eq!(resumed["assignee_ids"], serde_json::json!([owner]));
        assert_eq!(resumed["time_estimate"], 6.5);

        // Once DONE, blocking is rejected.
        let (status, _) = send(&app, move_to("DONE")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, move_to("BLOCKED")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "VALIDATION");
    }

    #[tokio::test]
    async fn test_deactivation_conflicts_surface_as_409() {
        let (app, owner) = test_app();
        let (_, po) = send(
            &app,
            request(
                "POST",
                "/api/users",
                owner,
                Some(serde_json::json!({
                    "full_name": "Pat PO",
                    "email": "pat@example.com",
                    "roles": ["PRODUCT_OWNER"]
                })),
            ),
        )
        .await;
        let po_id = po["id"].as_i64().unwrap();
        send(
            &app,
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": "Alpha", "owner_id": po_id})),
            ),
        )
        .await;

        let (status, body) = send(
            &app,
            request("DELETE", &format!("/api/users/{}", po_id), owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "CRITICAL_DEPENDENCY");
        assert!(body["message"].as_str().unwrap().contains("Alpha"));
    }

    #[tokio::test]
    async fn test_deactivation_reassigns_with_replacement() {
        let (app, owner) = test_app();
        let mk_dev = |name: &str, email: &str| {
            request(
                "POST",
                "/api/users",
                owner,
                Some(serde_json::json!({"full_name": name, "email": email, "roles": ["DEV"]})),
            )
        };
        let (_, dana) = send(&app, mk_dev("Dana", "dana@example.com")).await;
        let (_, omar) = send(&app, mk_dev("Omar", "omar@example.com")).await;
        let (dana_id, omar_id) = (dana["id"].as_i64().unwrap(), omar["id"].as_i64().unwrap());

        let (_, project) = send(
            &app,
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": "Alpha"})),
            ),
        )
        .await;
        let pid = project["id"].as_i64().unwrap();
        let (_, story) = send(
            &app,
            request(
                "POST",
                &format!("/api/projects/{}/stories", pid),
                owner,
                Some(serde_json::json!({"title": "login", "story_points": 3})),
            ),
        )
        .await;
        let (_, issue) = send(
            &app,
            request(
                "POST",
                &format!("/api/stories/{}/issues", story["id"].as_i64().unwrap()),
                owner,
                Some(serde_json::json!({"title": "task", "assignee_ids": [dana_id]})),
            ),
        )
        .await;

        let (status, body) = send(
            &app,
            request("DELETE", &format!("/api/users/{}", dana_id), owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["type"], "REASSIGNMENT_NEEDED");

        let (status, deactivated) = send(
            &app,
            request(
                "DELETE",
                &format!("/api/users/{}?replacement_id={}", dana_id, omar_id),
                owner,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deactivated["is_active"], false);

        let (_, issue) = send(
            &app,
            request(
                "GET",
                &format!("/api/issues/{}", issue["id"].as_i64().unwrap()),
                owner,
                None,
            ),
        )
        .await;
        assert_eq!(issue["assignee_ids"], serde_json::json!([omar_id]));

        // A deactivated account cannot call anything.
        let (status, _) = send(&app, request("GET", "/api/projects", dana_id, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, reactivated) = send(
            &app,
            request(
                "PUT",
                &format!("/api/users/{}/activate", dana_id),
                owner,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reactivated["is_active"], true);
    }

    #[tokio::test]
    async fn test_sprint_board_payload_and_cross_project_guard() {
        let (app, owner) = test_app();
        let mk_project = |name: &str| {
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": name})),
            )
        };
        let (_, alpha) = send(&app, mk_project("Alpha")).await;
        let (_, beta) = send(&app, mk_project("Beta")).await;
        let (alpha_id, beta_id) = (alpha["id"].as_i64().unwrap(), beta["id"].as_i64().unwrap());

        let (_, story) = send(
            &app,
            request(
                "POST",
                &format!("/api/projects/{}/stories", alpha_id),
                owner,
                Some(serde_json::json!({"title": "login", "story_points": 3})),
            ),
        )
        .await;
        let (_, issue) = send(
            &app,
            request(
                "POST",
                &format!("/api/stories/{}/issues", story["id"].as_i64().unwrap()),
                owner,
                Some(serde_json::json!({"title": "task", "time_estimate": 2.0})),
            ),
        )
        .await;
        let iid = issue["id"].as_i64().unwrap();

        let mk_sprint = |pid: i64| {
            request(
                "POST",
                &format!("/api/projects/{}/sprints", pid),
                owner,
                Some(serde_json::json!({
                    "name": "Sprint 1",
                    "start_date": "2026-01-01",
                    "end_date": "2026-01-14"
                })),
            )
        };
        let (_, own_sprint) = send(&app, mk_sprint(alpha_id)).await;
        let (_, foreign_sprint) = send(&app, mk_sprint(beta_id)).await;

        let (status, body) = send(
            &app,
            request(
                "PATCH",
                &format!("/api/issues/{}/sprint", iid),
                owner,
                Some(serde_json::json!({"sprint_id": foreign_sprint["id"]})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "NOT_FOUND");

        let (status, _) = send(
            &app,
            request(
                "PATCH",
                &format!("/api/issues/{}/sprint", iid),
                owner,
                Some(serde_json::json!({"sprint_id": own_sprint["id"]})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, board) = send(
            &app,
            request(
                "GET",
                &format!("/api/sprints/{}", own_sprint["id"].as_i64().unwrap()),
                owner,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(board["name"], "Sprint 1");
        assert_eq!(board["issues"].as_array().unwrap().len(), 1);
        assert_eq!(board["issues"][0]["id"], iid);
    }

    #[tokio::test]
    async fn test_portfolio_report_is_fail_soft() {
        let (app, owner) = test_app();
        let (_, project) = send(
            &app,
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": "Alpha"})),
            ),
        )
        .await;
        let pid = project["id"].as_i64().unwrap();

        let (status, entries) = send(
            &app,
            request(
                "GET",
                &format!("/api/reports/progress?ids={},999", pid),
                owner,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let entries = entries.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["progress"]["project_name"], "Alpha");
        assert!(entries[1]["error"].as_str().unwrap().contains("999"));
    }

    #[tokio::test]
    async fn test_missing_entities_are_404() {
        let (app, owner) = test_app();
        let (status, body) = send(&app, request("GET", "/api/projects/42", owner, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "NOT_FOUND");

        let (status, _) = send(&app, request("GET", "/api/issues/42", owner, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_project_progress_empty_is_zero() {
        let (app, owner) = test_app();
        let (_, project) = send(
            &app,
            request(
                "POST",
                "/api/projects",
                owner,
                Some(serde_json::json!({"name": "Alpha"})),
            ),
        )
        .await;
        let pid = project["id"].as_i64().unwrap();
        let (status, progress) = send(
            &app,
            request("GET", &format!("/api/projects/{}/progress", pid), owner, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["total_hours"], 0.0);
        assert_eq!(progress["percent_complete"], 0.0);
    }
}
