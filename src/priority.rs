//! WSJF-style priority engine.
//!
//! Score = (business_value + urgency) / max(story_points, 1). Pure
//! functions over current field values; nothing here caches or mutates.

use crate::models::Story;

/// Score at or above which a story is P1 ("high").
pub const HIGH_THRESHOLD: f64 = 10.0;
/// Score at or above which (but below [`HIGH_THRESHOLD`]) a story is P2.
pub const MEDIUM_THRESHOLD: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PriorityTier {
    P1,
    P2,
    P3,
}

impl PriorityTier {
    pub fn label(&self) -> &'static str {
        match self {
            Self::P1 => "high",
            Self::P2 => "medium",
            Self::P3 => "low",
        }
    }
}

/// Compute the WSJF score. Story points of 0 (unestimated) divide by 1
/// instead; negative inputs clamp to 0 so the result is always >= 0.
pub fn compute_score(business_value: i64, urgency: i64, story_points: i64) -> f64 {
    let value = business_value.max(0) + urgency.max(0);
    let effort = story_points.max(1);
    value as f64 / effort as f64
}

pub fn tier(score: f64) -> PriorityTier {
    if score >= HIGH_THRESHOLD {
        PriorityTier::P1
    } else if score >= MEDIUM_THRESHOLD {
        PriorityTier::P2
    } else {
        PriorityTier::P3
    }
}

/// Sort stories descending by score, ties broken by ascending story
/// number. Deterministic: ranking an already-ranked list is a no-op.
pub fn rank(stories: &mut [Story]) {
    stories.sort_by(|a, b| {
        b.priority_score
            .partial_cmp(&a.priority_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.story_number.cmp(&b.story_number))
    });
}
