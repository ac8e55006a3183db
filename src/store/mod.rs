use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    ExpectedPopularityRecord, Group, GroupVenue, PopularityCounters, RecommendationItem,
    RecommendationRun, RunStatus, SocialEdge, Tag, UserAction, UserTagAffinity, Venue,
    VenueTagScore,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemorySignalStore;
pub use postgres::PgSignalStore;

/// Read/write contract against the signal store. Reads are snapshot-consistent
/// within a single run; the orchestrator bounds every call with a timeout.
///
/// Implementations must enforce the run state machine in `transition_run` and
/// must never expose items of a run that has not reached `Succeeded`
/// (write-then-publish).
#[async_trait]
pub trait SignalStore: Send + Sync {
    // --- reads ---

    async fn venue(&self, venue_id: i64) -> AppResult<Option<Venue>>;

    async fn all_venues(&self) -> AppResult<Vec<Venue>>;

    async fn all_tags(&self) -> AppResult<Vec<Tag>>;

    /// Every (venue, tag, source) score row; resolution happens in the pipeline
    async fn all_tag_scores(&self) -> AppResult<Vec<VenueTagScore>>;

    async fn affinities_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserTagAffinity>>;

    async fn edges_for_follower(&self, user_id: Uuid) -> AppResult<Vec<SocialEdge>>;

    async fn groups_for_user(&self, user_id: Uuid) -> AppResult<Vec<Group>>;

    async fn venues_for_groups(&self, group_ids: &[Uuid]) -> AppResult<Vec<GroupVenue>>;

    async fn actions_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserAction>>;

    async fn actions_for_users(&self, user_ids: &[Uuid]) -> AppResult<Vec<UserAction>>;

    async fn all_popularity_counters(&self) -> AppResult<Vec<PopularityCounters>>;

    /// Latest-version expected-popularity records, one per venue
    async fn latest_expected_popularity(&self) -> AppResult<Vec<ExpectedPopularityRecord>>;

    /// Venues the user has already been shown in prior succeeded runs
    async fn shown_venues(&self, user_id: Uuid) -> AppResult<Vec<i64>>;

    async fn run(&self, run_id: Uuid) -> AppResult<Option<RecommendationRun>>;

    async fn latest_succeeded_run(&self, user_id: Uuid) -> AppResult<Option<RecommendationRun>>;

    /// Items of one run, rank order. Empty unless the run has succeeded.
    async fn items_for_run(&self, run_id: Uuid) -> AppResult<Vec<RecommendationItem>>;

    // --- writes ---

    async fn create_run(&self, run: &RecommendationRun) -> AppResult<()>;

    /// Applies one FSM transition; rejects anything `RunStatus::can_transition`
    /// does not allow
    async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        cause: Option<String>,
    ) -> AppResult<()>;

    async fn set_run_metadata(
        &self,
        run_id: Uuid,
        degraded_sources: &[String],
        model_stale: bool,
    ) -> AppResult<()>;

    /// Bulk insert of one run's items. Write-once per run.
    async fn insert_items(&self, run_id: Uuid, items: &[RecommendationItem]) -> AppResult<()>;

    /// Wholesale replacement of the expected-popularity snapshot.
    /// Readers see either the previous or the new version, never a mix.
    async fn replace_expected_popularity(
        &self,
        records: &[ExpectedPopularityRecord],
    ) -> AppResult<()>;

    /// Flags the current snapshot stale after a skipped refresh
    async fn mark_expected_popularity_stale(&self) -> AppResult<()>;

    /// Supersedes a user's affinity rows (one per user x tag)
    async fn replace_affinities(&self, user_id: Uuid, rows: &[UserTagAffinity]) -> AppResult<()>;

    // --- derived ---

    /// Ordered items of the user's most recent succeeded run
    async fn latest_feed(&self, user_id: Uuid) -> AppResult<Vec<RecommendationItem>> {
        match self.latest_succeeded_run(user_id).await? {
            Some(run) => self.items_for_run(run.id).await,
            None => Ok(Vec::new()),
        }
    }
}
