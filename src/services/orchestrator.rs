use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RecommendationConfig;
use crate::error::{AppError, AppResult};
use crate::models::run::{RecommendationRun, RunContext, RunStatus, RunType};
use crate::models::{recency_decay, resolve_tag_scores, ActionKind, EdgeStatus, RecommendationItem, UserTagAffinity};
use crate::services::candidates::CandidateGenerator;
use crate::services::composer::compose;
use crate::services::popularity_model::fit_expected_popularity;
use crate::services::scorer::{classify_user_state, score_candidates};
use crate::services::PipelineSnapshot;
use crate::store::SignalStore;

/// Drives the full pipeline: run lifecycle, snapshot loading, candidate
/// generation, scoring, composition, and publication. Also owns the model
/// refresh and affinity rebuild jobs.
pub struct Orchestrator {
    store: Arc<dyn SignalStore>,
    cfg: RecommendationConfig,
    /// user_id -> in-flight run id, for request coalescing
    in_flight: Mutex<HashMap<Uuid, Uuid>>,
    /// Serializes model refreshes (single writer)
    refresh_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SignalStore>, cfg: RecommendationConfig) -> Self {
        Self {
            store,
            cfg,
            in_flight: Mutex::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RecommendationConfig {
        &self.cfg
    }

    /// Bounds one store read with the configured timeout. A slow store
    /// surfaces as `StoreTimeout` and fails the run instead of hanging it.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        let ms = self.cfg.store_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(AppError::StoreTimeout(ms)),
        }
    }

    /// Executes one feed run for the user. If a run is already in flight for
    /// the same user the caller is coalesced onto it and gets that run id.
    ///
    /// Pipeline failures are recorded on the run (status `failed` with a
    /// cause) and still return the run id; only failures to create the run
    /// record at all surface as errors.
    pub async fn run_user_feed(&self, user_id: Uuid, ctx: RunContext) -> AppResult<Uuid> {
        let run_id = Uuid::new_v4();
        {
            let mut guard = self.in_flight.lock().await;
            if let Some(existing) = guard.get(&user_id) {
                tracing::info!(user_id = %user_id, run_id = %existing, "Coalesced onto in-flight run");
                return Ok(*existing);
            }
            guard.insert(user_id, run_id);
        }

        let result = self.execute_run(run_id, user_id, ctx).await;

        self.in_flight.lock().await.remove(&user_id);
        result
    }

    async fn execute_run(&self, run_id: Uuid, user_id: Uuid, ctx: RunContext) -> AppResult<Uuid> {
        let snapshot = match self.load_snapshot(user_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // Record the failure on a run so it is visible to callers
                let mut run = RecommendationRun::new(user_id, RunType::Personal, ctx);
                run.id = run_id;
                self.store.create_run(&run).await?;
                self.store.transition_run(run.id, RunStatus::Running, None).await?;
                self.store
                    .transition_run(run.id, RunStatus::Failed, Some(err.to_string()))
                    .await?;
                tracing::warn!(user_id = %user_id, run_id = %run.id, error = %err, "Run failed loading snapshot");
                return Ok(run.id);
            }
        };

        let run_type = if self.run_is_reusable(&snapshot) {
            RunType::Template
        } else {
            RunType::Personal
        };
        let mut run = RecommendationRun::new(user_id, run_type, ctx.clone());
        run.id = run_id;
        self.store.create_run(&run).await?;
        self.store.transition_run(run.id, RunStatus::Running, None).await?;

        match self.build_feed(&run, &ctx, &snapshot).await {
            Ok(items) => {
                self.store.insert_items(run.id, &items).await?;
                self.store
                    .transition_run(run.id, RunStatus::Succeeded, None)
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    run_id = %run.id,
                    items = items.len(),
                    run_type = ?run_type,
                    "Feed run succeeded"
                );
            }
            Err(err) => {
                self.store
                    .transition_run(run.id, RunStatus::Failed, Some(err.to_string()))
                    .await?;
                tracing::warn!(user_id = %user_id, run_id = %run.id, error = %err, "Feed run failed");
            }
        }
        Ok(run.id)
    }

    async fn build_feed(
        &self,
        run: &RecommendationRun,
        ctx: &RunContext,
        snapshot: &PipelineSnapshot,
    ) -> AppResult<Vec<RecommendationItem>> {
        let generated = CandidateGenerator::new(snapshot, &self.cfg, run.user_id).generate();
        let degraded: Vec<String> = generated
            .degraded
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        self.store
            .set_run_metadata(run.id, &degraded, snapshot.model_stale)
            .await?;

        if generated.candidates.is_empty() {
            return Err(AppError::RunFailed("no candidates from any source".to_string()));
        }

        let accepted_edges = snapshot.edges.len();
        let state = classify_user_state(
            snapshot.affinities.len(),
            accepted_edges,
            snapshot.action_count,
            &self.cfg,
        );
        let scored = score_candidates(&generated.candidates, snapshot, ctx, state, &self.cfg);
        let items = compose(run.id, &scored, &snapshot.venues, &self.cfg);
        if items.is_empty() {
            return Err(AppError::RunFailed("composer produced an empty feed".to_string()));
        }
        Ok(items)
    }

    /// True when no user-specific signal shapes the run, so its output is
    /// valid for any equally cold user. Prior run history counts: the
    /// seen-venue exclusion set personalizes the pool even when every
    /// affinity, edge, and group is absent.
    fn run_is_reusable(&self, snapshot: &PipelineSnapshot) -> bool {
        snapshot.affinities.is_empty()
            && snapshot.edges.is_empty()
            && snapshot.groups.is_empty()
            && snapshot.shown.is_empty()
    }

    async fn load_snapshot(&self, user_id: Uuid) -> AppResult<PipelineSnapshot> {
        let venues = self.bounded(self.store.all_venues()).await?;
        let tags = self.bounded(self.store.all_tags()).await?;
        let tag_scores = self.bounded(self.store.all_tag_scores()).await?;
        let affinities = self.bounded(self.store.affinities_for_user(user_id)).await?;
        let edges: Vec<_> = self
            .bounded(self.store.edges_for_follower(user_id))
            .await?
            .into_iter()
            .filter(|e| e.status == EdgeStatus::Accepted)
            .collect();
        let followees: Vec<Uuid> = edges.iter().map(|e| e.followee).collect();
        let followee_saves: Vec<_> = self
            .bounded(self.store.actions_for_users(&followees))
            .await?
            .into_iter()
            .filter(|a| matches!(a.kind, ActionKind::Save | ActionKind::Like))
            .collect();
        let groups = self.bounded(self.store.groups_for_user(user_id)).await?;
        let group_ids: Vec<Uuid> = groups.iter().map(|g| g.id).collect();
        let group_venues = self.bounded(self.store.venues_for_groups(&group_ids)).await?;
        let counters = self.bounded(self.store.all_popularity_counters()).await?;
        let residual_records = self.bounded(self.store.latest_expected_popularity()).await?;
        let shown = self.bounded(self.store.shown_venues(user_id)).await?;
        let actions = self.bounded(self.store.actions_for_user(user_id)).await?;

        let model_stale = residual_records.iter().any(|r| r.stale);

        Ok(PipelineSnapshot {
            venues: venues.into_iter().map(|v| (v.id, v)).collect(),
            venue_tags: resolve_tag_scores(&tag_scores),
            tag_slugs: tags.into_iter().map(|t| (t.id, t.slug)).collect(),
            affinities,
            edges,
            followee_saves,
            groups,
            group_venues,
            counters: counters.into_iter().map(|c| (c.venue_id, c)).collect(),
            residuals: residual_records
                .into_iter()
                .map(|r| (r.venue_id, r))
                .collect(),
            shown: shown.into_iter().collect::<HashSet<i64>>(),
            action_count: actions.len(),
            model_stale,
            now: Utc::now(),
        })
    }

    /// Items of the user's most recent succeeded run. Stale-but-available
    /// beats empty; an empty vec means the user has no succeeded run yet.
    pub async fn get_feed(&self, user_id: Uuid) -> AppResult<Vec<RecommendationItem>> {
        self.bounded(self.store.latest_feed(user_id)).await
    }

    pub async fn run(&self, run_id: Uuid) -> AppResult<RecommendationRun> {
        self.bounded(self.store.run(run_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {}", run_id)))
    }

    /// Marks a non-terminal run cancelled. Its items, if any were written,
    /// are never published.
    pub async fn cancel_run(&self, run_id: Uuid) -> AppResult<()> {
        self.store
            .transition_run(run_id, RunStatus::Cancelled, Some("cancelled by caller".to_string()))
            .await
    }

    /// Refits the expected-popularity model over the full venue set and
    /// swaps the snapshot on completion. Too little training data keeps the
    /// previous snapshot and flags it stale instead of failing the job.
    pub async fn refresh_popularity_model(&self) -> AppResult<()> {
        let _writer = self.refresh_lock.lock().await;

        let venues = self.bounded(self.store.all_venues()).await?;
        let counters: HashMap<i64, _> = self
            .bounded(self.store.all_popularity_counters())
            .await?
            .into_iter()
            .map(|c| (c.venue_id, c))
            .collect();
        let previous = self.bounded(self.store.latest_expected_popularity()).await?;
        let next_version = previous.iter().map(|r| r.model_version).max().unwrap_or(0) + 1;

        match fit_expected_popularity(
            &venues,
            &counters,
            self.cfg.popularity_source,
            self.cfg.regressor,
            self.cfg.min_training_rows,
            next_version,
            Utc::now(),
        ) {
            Ok(records) => {
                self.store.replace_expected_popularity(&records).await?;
                tracing::info!(version = next_version, venues = records.len(), "Popularity model refreshed");
                Ok(())
            }
            Err(AppError::InsufficientTrainingData { got, need }) => {
                self.store.mark_expected_popularity_stale().await?;
                tracing::warn!(got, need, "Popularity refresh skipped, snapshot marked stale");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Rebuilds the user's tag affinities wholesale from their recorded
    /// actions: each action contributes `action weight x recency decay x tag
    /// strength` to every tag of the acted-on venue, sums are normalized by
    /// the user's maximum, and only the top rows are kept.
    pub async fn rebuild_affinities(&self, user_id: Uuid) -> AppResult<usize> {
        let actions = self.bounded(self.store.actions_for_user(user_id)).await?;
        let tag_scores = self.bounded(self.store.all_tag_scores()).await?;
        let venue_tags = resolve_tag_scores(&tag_scores);
        let now = Utc::now();

        let mut sums: HashMap<i32, f64> = HashMap::new();
        for action in &actions {
            let Some(tags) = venue_tags.get(&action.venue_id) else {
                continue;
            };
            let age_days = (now - action.created_at).num_seconds() as f64 / 86_400.0;
            let weight = action.kind.weight() * recency_decay(age_days, self.cfg.recency_half_life_days);
            for (tag_id, strength) in tags {
                *sums.entry(*tag_id).or_default() += weight * strength;
            }
        }

        let max = sums.values().fold(0.0_f64, |m, v| m.max(*v));
        let mut rows: Vec<UserTagAffinity> = sums
            .into_iter()
            .filter(|(_, sum)| *sum > 0.0)
            .map(|(tag_id, sum)| UserTagAffinity {
                user_id,
                tag_id,
                affinity: if max > 0.0 { (sum / max).clamp(0.0, 1.0) } else { 0.0 },
                updated_at: now,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.affinity
                .partial_cmp(&a.affinity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.tag_id.cmp(&b.tag_id))
        });
        rows.truncate(self.cfg.max_affinities_per_user);

        self.store.replace_affinities(user_id, &rows).await?;
        tracing::info!(user_id = %user_id, rows = rows.len(), "Affinities rebuilt");
        Ok(rows.len())
    }
}
