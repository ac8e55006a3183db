use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::GeoPoint;

/// Lifecycle of a recommendation run. Transitions are enforced by the
/// store layer; anything not listed in `can_transition` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Legal transitions: pending -> running|cancelled,
    /// running -> succeeded|failed|cancelled. No skipping, no leaving a
    /// terminal state.
    pub fn can_transition(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

/// Personal runs belong to one user; template runs carry no user-specific
/// signal and may be served to many cold-start users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Personal,
    Template,
}

/// Caller-supplied context for one pipeline invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    /// Optional geographic anchor; enables the distance factor
    pub location: Option<GeoPoint>,
}

/// One invocation of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRun {
    pub id: Uuid,
    pub user_id: Uuid,
    pub run_type: RunType,
    pub status: RunStatus,
    pub context: RunContext,
    /// Structured failure cause, set on the failed transition
    pub cause: Option<String>,
    /// Candidate sources that yielded nothing this run
    pub degraded_sources: Vec<String>,
    /// Whether the expected-popularity snapshot was stale during this run
    pub model_stale: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecommendationRun {
    pub fn new(user_id: Uuid, run_type: RunType, context: RunContext) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            run_type,
            status: RunStatus::Pending,
            context,
            cause: None,
            degraded_sources: Vec::new(),
            model_stale: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Labeled partition of the composed feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedRow {
    Taste,
    Social,
    Trending,
    HiddenGem,
}

impl FeedRow {
    pub fn label(&self) -> &'static str {
        match self {
            FeedRow::Taste => "For your taste",
            FeedRow::Social => "From your circle",
            FeedRow::Trending => "Trending now",
            FeedRow::HiddenGem => "Hidden gems",
        }
    }
}

/// Normalized per-factor scores, all in [0, 1] where present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub taste: f64,
    pub friend: f64,
    pub group: f64,
    pub trend_app: f64,
    pub trend_social: f64,
    pub quality: f64,
    pub freshness: f64,
    /// Present only when the run context supplied a location
    pub distance: Option<f64>,
    /// Additive hidden-gem promotion, capped by configuration
    pub hidden_gem_bonus: f64,
}

/// Explanation payload attached to each item. Used for display only;
/// never an input to scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reason {
    pub row: FeedRow,
    /// Tag slugs that contributed most to the taste factor
    pub tags: Vec<String>,
    /// Distinct followees whose saves contributed
    pub friend_count: usize,
    /// Groups whose venues contributed
    pub group_count: usize,
}

/// One ranked entry of a run's feed. Write-once; immutable after the run
/// reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub run_id: Uuid,
    pub venue_id: i64,
    /// 1-based, contiguous within a run
    pub rank: i32,
    pub final_score: f64,
    pub factors: FactorScores,
    pub reason: Reason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(RunStatus::Pending.can_transition(RunStatus::Running));
        assert!(RunStatus::Running.can_transition(RunStatus::Succeeded));
        assert!(RunStatus::Running.can_transition(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition(RunStatus::Cancelled));
        assert!(RunStatus::Pending.can_transition(RunStatus::Cancelled));
    }

    #[test]
    fn test_illegal_transitions() {
        // No skipping pending -> succeeded
        assert!(!RunStatus::Pending.can_transition(RunStatus::Succeeded));
        // Terminal states are final
        assert!(!RunStatus::Succeeded.can_transition(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition(RunStatus::Running));
        assert!(!RunStatus::Cancelled.can_transition(RunStatus::Running));
        // No self-loops
        assert!(!RunStatus::Running.can_transition(RunStatus::Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_new_run_starts_pending() {
        let run = RecommendationRun::new(Uuid::new_v4(), RunType::Personal, RunContext::default());
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.cause.is_none());
    }
}
