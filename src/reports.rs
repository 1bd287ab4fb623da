//! Aggregation and reporting over the store.
//!
//! Read-only rollups computed on demand from current rows. Hours come from
//! issue time estimates; story completion follows the same rule the board
//! uses (all issues DONE, or the story itself marked DONE).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::db::Store;
use crate::errors::ServiceResult;
use crate::models::{IssueStatus, Sprint, Story, StoryStatus};
use crate::priority::{self, PriorityTier};

pub const DEFAULT_TOP_STORIES: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectProgress {
    pub project_id: i64,
    pub project_name: String,
    pub total_hours: f64,
    pub completed_hours: f64,
    /// 0.0 when there are no estimated hours at all.
    pub percent_complete: f64,
    pub total_issues: usize,
    pub done_issues: usize,
    pub total_stories: usize,
    pub completed_stories: usize,
}

/// Rollup over the active (non-complete) stories of a project. A story
/// whose issues are all DONE drops out of these numbers on the next read.
#[derive(Debug, Clone, Serialize)]
pub struct BacklogHealth {
    pub project_id: i64,
    pub active_stories: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Active stories with 0 story points.
    pub unestimated: usize,
    /// Percent of active stories with story points > 0; 0 when there are
    /// no active stories.
    pub estimated_percent: f64,
    pub average_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SprintMetrics {
    #[serde(flatten)]
    pub sprint: Sprint,
    pub total_issues: usize,
    pub done_issues: usize,
    pub total_hours: f64,
    pub completed_hours: f64,
    pub percent_complete: f64,
}

/// One portfolio row. A project that errors out reports the failure
/// inline instead of failing the whole portfolio call.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioEntry {
    pub project_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProjectProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Whole-number percentage; 0 when the denominator is empty.
fn percent(completed: f64, total: f64) -> f64 {
    if total <= 0.0 {
        0.0
    } else {
        (completed / total * 100.0).round()
    }
}

pub fn project_progress(store: &Store, project_id: i64) -> ServiceResult<ProjectProgress> {
    let project = store.get_project(project_id)?;
    let issues = store.list_issues_for_project(project_id)?;
    let stories = store.list_stories(project_id)?;

    let total_hours: f64 = issues.iter().map(|i| i.time_estimate).sum();
    let completed_hours: f64 = issues
        .iter()
        .filter(|i| i.status == IssueStatus::Done)
        .map(|i| i.time_estimate)
        .sum();
    let done_issues = issues
        .iter()
        .filter(|i| i.status == IssueStatus::Done)
        .count();

    let mut completed_stories = 0;
    for story in &stories {
        if store.is_story_complete(story)? {
            completed_stories += 1;
        }
    }

    Ok(ProjectProgress {
        project_id,
        project_name: project.name,
        total_hours,
        completed_hours,
        percent_complete: percent(completed_hours, total_hours),
        total_issues: issues.len(),
        done_issues,
        total_stories: stories.len(),
        completed_stories,
    })
}

fn active_stories(store: &Store, project_id: i64) -> ServiceResult<Vec<Story>> {
    let mut active = Vec::new();
    for story in store.ranked_backlog(project_id)? {
        if !store.is_story_complete(&story)? {
            active.push(story);
        }
    }
    Ok(active)
}

pub fn backlog_health(store: &Store, project_id: i64) -> ServiceResult<BacklogHealth> {
    let stories = active_stories(store, project_id)?;
    let mut health = BacklogHealth {
        project_id,
        active_stories: stories.len(),
        high: 0,
        medium: 0,
        low: 0,
        unestimated: 0,
        estimated_percent: 0.0,
        average_score: 0.0,
    };
    let mut score_sum = 0.0;
    for story in &stories {
        score_sum += story.priority_score;
        match priority::tier(story.priority_score) {
            PriorityTier::P1 => health.high += 1,
            PriorityTier::P2 => health.medium += 1,
            PriorityTier::P3 => health.low += 1,
        }
        if story.story_points == 0 {
            health.unestimated += 1;
        }
    }
    if !stories.is_empty() {
        let estimated = stories.len() - health.unestimated;
        health.estimated_percent = percent(estimated as f64, stories.len() as f64);
        health.average_score = score_sum / stories.len() as f64;
    }
    Ok(health)
}

/// The highest-ranked active stories of the project backlog. Complete
/// stories never surface here, whatever their score.
pub fn top_stories(store: &Store, project_id: i64, limit: usize) -> ServiceResult<Vec<Story>> {
    let mut stories = active_stories(store, project_id)?;
    stories.truncate(limit);
    Ok(stories)
}

/// Active stories that have no issues yet, in backlog rank order. These
/// are the refinement candidates a PO works through first.
pub fn stories_without_issues(store: &Store, project_id: i64) -> ServiceResult<Vec<Story>> {
    let stories = store.ranked_backlog(project_id)?;
    let mut out = Vec::new();
    for story in stories {
        if story.status != StoryStatus::Done && store.list_issues_for_story(story.id)?.is_empty() {
            out.push(story);
        }
    }
    Ok(out)
}

/// Issue count per board status across the whole project. Every status
/// appears, zero counts included, so charts get a stable shape.
pub fn status_distribution(
    store: &Store,
    project_id: i64,
) -> ServiceResult<BTreeMap<String, usize>> {
    let issues = store.list_issues_for_project(project_id)?;
    let mut counts: BTreeMap<String, usize> = [
        IssueStatus::ToDo,
        IssueStatus::InProgress,
        IssueStatus::CodeReview,
        IssueStatus::Qa,
        IssueStatus::Blocked,
        IssueStatus::Done,
    ]
    .iter()
    .map(|s| (s.as_str().to_string(), 0))
    .collect();
    for issue in &issues {
        *counts.entry(issue.status.as_str().to_string()).or_default() += 1;
    }
    Ok(counts)
}

/// Per-sprint rollups, active sprints first, then by end date descending.
pub fn sprint_metrics(store: &Store, project_id: i64) -> ServiceResult<Vec<SprintMetrics>> {
    let sprints = store.list_sprints(project_id)?;
    let mut metrics = Vec::with_capacity(sprints.len());
    for sprint in sprints {
        let detail = store.get_sprint_detail(sprint.id)?;
        let total_hours: f64 = detail.issues.iter().map(|i| i.time_estimate).sum();
        let completed_hours: f64 = detail
            .issues
            .iter()
            .filter(|i| i.status == IssueStatus::Done)
            .map(|i| i.time_estimate)
            .sum();
        let done_issues = detail
            .issues
            .iter()
            .filter(|i| i.status == IssueStatus::Done)
            .count();
        metrics.push(SprintMetrics {
            total_issues: detail.issues.len(),
            done_issues,
            total_hours,
            completed_hours,
            percent_complete: percent(completed_hours, total_hours),
            sprint: detail.sprint,
        });
    }
    metrics.sort_by(|a, b| {
        b.sprint
            .active
            .cmp(&a.sprint.active)
            .then(b.sprint.end_date.cmp(&a.sprint.end_date))
    });
    Ok(metrics)
}

/// Portfolio view across a set of projects. Fail-soft: a missing or broken
/// project becomes an error row, the rest still report.
pub fn portfolio_progress(store: &Store, project_ids: &[i64]) -> Vec<PortfolioEntry> {
    project_ids
        .iter()
        .map(|&project_id| match project_progress(store, project_id) {
            Ok(progress) => PortfolioEntry {
                project_id,
                progress: Some(progress),
                error: None,
            },
            Err(e) => PortfolioEntry {
                project_id,
                progress: None,
                error: Some(e.to_string()),
            },
        })
        .collect()
}
