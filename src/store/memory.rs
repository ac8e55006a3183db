use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    ExpectedPopularityRecord, Group, GroupVenue, PopularityCounters, RecommendationItem,
    RecommendationRun, RunStatus, SocialEdge, Tag, UserAction, UserTagAffinity, Venue,
    VenueTagScore,
};
use crate::store::SignalStore;

/// In-memory signal store backed by RwLock'd maps. Used by the test suite and
/// for seeding demo data; implements the same contract as the Postgres store,
/// including FSM enforcement and write-then-publish.
#[derive(Clone, Default)]
pub struct InMemorySignalStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    venues: HashMap<i64, Venue>,
    tags: Vec<Tag>,
    tag_scores: Vec<VenueTagScore>,
    affinities: Vec<UserTagAffinity>,
    edges: Vec<SocialEdge>,
    group_members: Vec<(Uuid, Uuid)>, // (user_id, group_id)
    groups: HashMap<Uuid, Group>,
    group_venues: Vec<GroupVenue>,
    actions: Vec<UserAction>,
    counters: HashMap<i64, PopularityCounters>,
    expected: HashMap<i64, ExpectedPopularityRecord>,
    runs: HashMap<Uuid, RecommendationRun>,
    items: HashMap<Uuid, Vec<RecommendationItem>>,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_venue(&self, venue: Venue) {
        self.inner.write().await.venues.insert(venue.id, venue);
    }

    pub async fn insert_tag(&self, tag: Tag) {
        self.inner.write().await.tags.push(tag);
    }

    pub async fn insert_tag_score(&self, score: VenueTagScore) {
        self.inner.write().await.tag_scores.push(score);
    }

    pub async fn insert_affinity(&self, affinity: UserTagAffinity) {
        self.inner.write().await.affinities.push(affinity);
    }

    pub async fn insert_edge(&self, edge: SocialEdge) {
        self.inner.write().await.edges.push(edge);
    }

    pub async fn insert_group(&self, group: Group, members: Vec<Uuid>, venues: Vec<i64>) {
        let mut inner = self.inner.write().await;
        for user_id in members {
            inner.group_members.push((user_id, group.id));
        }
        for venue_id in venues {
            inner.group_venues.push(GroupVenue {
                group_id: group.id,
                venue_id,
            });
        }
        inner.groups.insert(group.id, group);
    }

    pub async fn insert_action(&self, action: UserAction) {
        self.inner.write().await.actions.push(action);
    }

    pub async fn insert_counters(&self, counters: PopularityCounters) {
        self.inner
            .write()
            .await
            .counters
            .insert(counters.venue_id, counters);
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn venue(&self, venue_id: i64) -> AppResult<Option<Venue>> {
        Ok(self.inner.read().await.venues.get(&venue_id).cloned())
    }

    async fn all_venues(&self) -> AppResult<Vec<Venue>> {
        let mut venues: Vec<Venue> = self.inner.read().await.venues.values().cloned().collect();
        venues.sort_by_key(|v| v.id);
        Ok(venues)
    }

    async fn all_tags(&self) -> AppResult<Vec<Tag>> {
        Ok(self.inner.read().await.tags.clone())
    }

    async fn all_tag_scores(&self) -> AppResult<Vec<VenueTagScore>> {
        Ok(self.inner.read().await.tag_scores.clone())
    }

    async fn affinities_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserTagAffinity>> {
        Ok(self
            .inner
            .read()
            .await
            .affinities
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn edges_for_follower(&self, user_id: Uuid) -> AppResult<Vec<SocialEdge>> {
        Ok(self
            .inner
            .read()
            .await
            .edges
            .iter()
            .filter(|e| e.follower == user_id)
            .cloned()
            .collect())
    }

    async fn groups_for_user(&self, user_id: Uuid) -> AppResult<Vec<Group>> {
        let inner = self.inner.read().await;
        let mut groups: Vec<Group> = inner
            .group_members
            .iter()
            .filter(|(member, _)| *member == user_id)
            .filter_map(|(_, group_id)| inner.groups.get(group_id).cloned())
            .collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    async fn venues_for_groups(&self, group_ids: &[Uuid]) -> AppResult<Vec<GroupVenue>> {
        Ok(self
            .inner
            .read()
            .await
            .group_venues
            .iter()
            .filter(|gv| group_ids.contains(&gv.group_id))
            .cloned()
            .collect())
    }

    async fn actions_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserAction>> {
        Ok(self
            .inner
            .read()
            .await
            .actions
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn actions_for_users(&self, user_ids: &[Uuid]) -> AppResult<Vec<UserAction>> {
        Ok(self
            .inner
            .read()
            .await
            .actions
            .iter()
            .filter(|a| user_ids.contains(&a.user_id))
            .cloned()
            .collect())
    }

    async fn all_popularity_counters(&self) -> AppResult<Vec<PopularityCounters>> {
        let mut counters: Vec<PopularityCounters> =
            self.inner.read().await.counters.values().cloned().collect();
        counters.sort_by_key(|c| c.venue_id);
        Ok(counters)
    }

    async fn latest_expected_popularity(&self) -> AppResult<Vec<ExpectedPopularityRecord>> {
        let mut records: Vec<ExpectedPopularityRecord> =
            self.inner.read().await.expected.values().cloned().collect();
        records.sort_by_key(|r| r.venue_id);
        Ok(records)
    }

    async fn shown_venues(&self, user_id: Uuid) -> AppResult<Vec<i64>> {
        let inner = self.inner.read().await;
        let mut shown: Vec<i64> = inner
            .runs
            .values()
            .filter(|r| r.user_id == user_id && r.status == RunStatus::Succeeded)
            .filter_map(|r| inner.items.get(&r.id))
            .flatten()
            .map(|item| item.venue_id)
            .collect();
        shown.sort_unstable();
        shown.dedup();
        Ok(shown)
    }

    async fn run(&self, run_id: Uuid) -> AppResult<Option<RecommendationRun>> {
        Ok(self.inner.read().await.runs.get(&run_id).cloned())
    }

    async fn latest_succeeded_run(&self, user_id: Uuid) -> AppResult<Option<RecommendationRun>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.user_id == user_id && r.status == RunStatus::Succeeded)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn items_for_run(&self, run_id: Uuid) -> AppResult<Vec<RecommendationItem>> {
        let inner = self.inner.read().await;
        // Write-then-publish: items of non-succeeded runs stay invisible
        match inner.runs.get(&run_id) {
            Some(run) if run.status == RunStatus::Succeeded => {
                Ok(inner.items.get(&run_id).cloned().unwrap_or_default())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn create_run(&self, run: &RecommendationRun) -> AppResult<()> {
        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        cause: Option<String>,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::NotFound(format!("run {}", run_id)))?;
        if !run.status.can_transition(next) {
            return Err(AppError::IllegalTransition {
                from: run.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        run.status = next;
        run.cause = cause;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn set_run_metadata(
        &self,
        run_id: Uuid,
        degraded_sources: &[String],
        model_stale: bool,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::NotFound(format!("run {}", run_id)))?;
        run.degraded_sources = degraded_sources.to_vec();
        run.model_stale = model_stale;
        Ok(())
    }

    async fn insert_items(&self, run_id: Uuid, items: &[RecommendationItem]) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if inner.items.contains_key(&run_id) {
            return Err(AppError::Internal(format!(
                "items already written for run {}",
                run_id
            )));
        }
        inner.items.insert(run_id, items.to_vec());
        Ok(())
    }

    async fn replace_expected_popularity(
        &self,
        records: &[ExpectedPopularityRecord],
    ) -> AppResult<()> {
        // Swap-on-completion: build the new map fully, then replace
        let next: HashMap<i64, ExpectedPopularityRecord> =
            records.iter().map(|r| (r.venue_id, r.clone())).collect();
        self.inner.write().await.expected = next;
        Ok(())
    }

    async fn mark_expected_popularity_stale(&self) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        for record in inner.expected.values_mut() {
            record.stale = true;
        }
        Ok(())
    }

    async fn replace_affinities(&self, user_id: Uuid, rows: &[UserTagAffinity]) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.affinities.retain(|a| a.user_id != user_id);
        inner.affinities.extend_from_slice(rows);
        Ok(())
    }
}
