use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum_test::TestServer;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use async_trait::async_trait;
use venuefeed::api::{create_router, AppState};
use venuefeed::config::RecommendationConfig;
use venuefeed::error::AppResult;
use venuefeed::models::run::{
    FeedRow, RecommendationItem, RecommendationRun, RunContext, RunStatus,
};
use venuefeed::models::{
    ActionKind, BusinessStatus, EdgeStatus, ExpectedPopularityRecord, Group, GroupVenue,
    PopularityCounters, SocialEdge, Tag, TagScoreSource, TagType, UserAction, UserTagAffinity,
    Venue, VenueTagScore,
};
use venuefeed::services::Orchestrator;
use venuefeed::store::{InMemorySignalStore, SignalStore};

fn venue(id: i64, cuisine: &str, rating: f64, rating_count: i64) -> Venue {
    Venue {
        id,
        place_key: format!("place-{}", id),
        name: format!("Venue {}", id),
        location: None,
        price_tier: Some(2),
        rating: Some(rating),
        rating_count,
        cuisine: Some(cuisine.to_string()),
        category: Some("restaurant".to_string()),
        address: Some(format!("{} High Street, Soho, London", id)),
        open_late: id % 2 == 0,
        open_early: false,
        open_sunday: true,
        business_status: BusinessStatus::Operational,
        updated_at: Utc::now(),
    }
}

const CUISINES: [&str; 4] = ["italian", "thai", "mexican", "korean"];

/// Seeds a store with enough venues, tags, and counters for the full
/// pipeline to exercise every source.
async fn seeded_store() -> Arc<InMemorySignalStore> {
    let store = Arc::new(InMemorySignalStore::new());

    for tag_id in 1..=4 {
        store
            .insert_tag(Tag {
                id: tag_id,
                slug: CUISINES[(tag_id - 1) as usize].to_string(),
                tag_type: TagType::Cuisine,
            })
            .await;
    }

    for id in 1..=80_i64 {
        let cuisine = CUISINES[(id % 4) as usize];
        store
            .insert_venue(venue(id, cuisine, 3.5 + (id % 3) as f64 * 0.5, 50 + id * 3))
            .await;
        store
            .insert_counters(PopularityCounters {
                venue_id: id,
                app_saves: (id % 20) * 15,
                social_mentions: (id % 7) * 10,
                app_updated_at: Utc::now(),
                social_updated_at: Utc::now(),
            })
            .await;
        store
            .insert_tag_score(VenueTagScore {
                venue_id: id,
                tag_id: (id % 4) as i32 + 1,
                strength: 0.4 + (id % 6) as f64 / 10.0,
                source: TagScoreSource::Deterministic,
                confidence: 0.9,
                updated_at: Utc::now(),
            })
            .await;
    }

    store
}

async fn seed_engaged_user(store: &InMemorySignalStore) -> Uuid {
    let user = Uuid::new_v4();
    for tag_id in 1..=3 {
        store
            .insert_affinity(UserTagAffinity {
                user_id: user,
                tag_id,
                affinity: 1.0 - tag_id as f64 * 0.2,
                updated_at: Utc::now(),
            })
            .await;
    }
    for i in 0..10 {
        store
            .insert_action(UserAction {
                user_id: user,
                venue_id: i % 5 + 1,
                kind: ActionKind::DetailView,
                created_at: Utc::now() - Duration::days(i),
            })
            .await;
    }
    user
}

fn assert_feed_shape(items: &[RecommendationItem], cfg: &RecommendationConfig) {
    assert!(!items.is_empty());
    assert!(items.len() <= cfg.feed_size);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item.rank, (i + 1) as i32, "ranks must be contiguous");
    }
    for pair in items.windows(2) {
        assert!(
            pair[0].final_score >= pair[1].final_score,
            "scores must be non-increasing with rank"
        );
    }
}

#[tokio::test]
async fn test_full_pipeline_produces_ranked_full_feed() {
    let store = seeded_store().await;
    let cfg = RecommendationConfig::default();
    let orchestrator = Orchestrator::new(store.clone(), cfg.clone());
    let user = seed_engaged_user(&store).await;

    let run_id = orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let run = orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);

    let items = orchestrator.get_feed(user).await.unwrap();
    assert_eq!(items.len(), cfg.feed_size);
    assert_feed_shape(&items, &cfg);
}

#[tokio::test]
async fn test_cold_start_user_gets_full_feed_without_social_rows() {
    let store = seeded_store().await;
    let cfg = RecommendationConfig::default();
    let orchestrator = Orchestrator::new(store.clone(), cfg.clone());
    let user = Uuid::new_v4(); // nothing seeded for this user

    orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let items = orchestrator.get_feed(user).await.unwrap();

    assert_eq!(items.len(), cfg.feed_size);
    assert_feed_shape(&items, &cfg);
    // no social signal exists, so no item may claim a social row
    assert!(items.iter().all(|i| i.reason.row != FeedRow::Social));
}

#[tokio::test]
async fn test_cuisine_diversity_ceiling_holds() {
    let store = seeded_store().await;
    let cfg = RecommendationConfig::default();
    let orchestrator = Orchestrator::new(store.clone(), cfg.clone());
    let user = seed_engaged_user(&store).await;

    orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let items = orchestrator.get_feed(user).await.unwrap();

    // four cuisines are available, so the cap never needs relaxing
    let cap = (cfg.diversity_cap * cfg.feed_size as f64).ceil() as usize;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for item in &items {
        let v = store.venue(item.venue_id).await.unwrap().unwrap();
        *counts.entry(v.cuisine.unwrap()).or_default() += 1;
    }
    for (cuisine, n) in counts {
        assert!(n <= cap, "{} holds {} slots, cap is {}", cuisine, n, cap);
    }
}

#[tokio::test]
async fn test_identical_cold_users_get_identical_feeds() {
    let store = seeded_store().await;
    let orchestrator = Orchestrator::new(store.clone(), RecommendationConfig::default());
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    orchestrator
        .run_user_feed(alice, RunContext::default())
        .await
        .unwrap();
    orchestrator
        .run_user_feed(bob, RunContext::default())
        .await
        .unwrap();

    let feed_a: Vec<i64> = orchestrator
        .get_feed(alice)
        .await
        .unwrap()
        .iter()
        .map(|i| i.venue_id)
        .collect();
    let feed_b: Vec<i64> = orchestrator
        .get_feed(bob)
        .await
        .unwrap()
        .iter()
        .map(|i| i.venue_id)
        .collect();
    assert_eq!(feed_a, feed_b);
}

#[tokio::test]
async fn test_friend_saves_surface_in_social_row() {
    let store = seeded_store().await;
    let orchestrator = Orchestrator::new(store.clone(), RecommendationConfig::default());
    let user = seed_engaged_user(&store).await;

    // a well-connected user whose friends all saved venue 42 recently
    for _ in 0..6 {
        let friend = Uuid::new_v4();
        store
            .insert_edge(SocialEdge {
                follower: user,
                followee: friend,
                status: EdgeStatus::Accepted,
                influence: 9,
            })
            .await;
        store
            .insert_action(UserAction {
                user_id: friend,
                venue_id: 42,
                kind: ActionKind::Save,
                created_at: Utc::now() - Duration::hours(6),
            })
            .await;
    }

    orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let items = orchestrator.get_feed(user).await.unwrap();

    let saved = items.iter().find(|i| i.venue_id == 42).expect("venue 42 in feed");
    assert_eq!(saved.reason.row, FeedRow::Social);
    assert_eq!(saved.reason.friend_count, 6);
}

#[tokio::test]
async fn test_pending_edges_never_contribute() {
    let store = seeded_store().await;
    let orchestrator = Orchestrator::new(store.clone(), RecommendationConfig::default());
    let user = Uuid::new_v4();

    let stranger = Uuid::new_v4();
    store
        .insert_edge(SocialEdge {
            follower: user,
            followee: stranger,
            status: EdgeStatus::Pending,
            influence: 10,
        })
        .await;
    store
        .insert_action(UserAction {
            user_id: stranger,
            venue_id: 7,
            kind: ActionKind::Save,
            created_at: Utc::now(),
        })
        .await;

    orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let items = orchestrator.get_feed(user).await.unwrap();
    for item in &items {
        assert_eq!(item.factors.friend, 0.0);
        assert_ne!(item.reason.row, FeedRow::Social);
    }
}

#[tokio::test]
async fn test_hidden_gems_appear_after_model_refresh() {
    let store = seeded_store().await;
    let orchestrator = Orchestrator::new(store.clone(), RecommendationConfig::default());
    let user = seed_engaged_user(&store).await;

    // counters follow structure except for a handful of sleepers whose
    // tags the user actually cares about
    for id in [4_i64, 9, 14] {
        store
            .insert_counters(PopularityCounters {
                venue_id: id,
                app_saves: 0,
                social_mentions: 0,
                app_updated_at: Utc::now(),
                social_updated_at: Utc::now(),
            })
            .await;
    }
    orchestrator.refresh_popularity_model().await.unwrap();

    orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let items = orchestrator.get_feed(user).await.unwrap();

    let gems: Vec<&RecommendationItem> = items
        .iter()
        .filter(|i| i.reason.row == FeedRow::HiddenGem)
        .collect();
    assert!(!gems.is_empty(), "expected at least one hidden gem");
    for gem in &gems {
        assert!(gem.factors.hidden_gem_bonus > 0.0);
    }
}

#[tokio::test]
async fn test_group_venues_reach_the_feed() {
    let store = seeded_store().await;
    let orchestrator = Orchestrator::new(store.clone(), RecommendationConfig::default());
    let user = seed_engaged_user(&store).await;

    store
        .insert_group(
            Group {
                id: Uuid::new_v4(),
                name: "Thursday supper club".to_string(),
                activity_level: 0.95,
            },
            vec![user],
            vec![55, 56],
        )
        .await;

    orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let items = orchestrator.get_feed(user).await.unwrap();
    let in_feed: HashSet<i64> = items.iter().map(|i| i.venue_id).collect();
    assert!(in_feed.contains(&55) || in_feed.contains(&56));
}

/// Store wrapper whose venue read stalls far past any reasonable timeout.
/// Everything else delegates, so the failure is attributable to the one
/// slow read.
struct StalledStore {
    inner: Arc<InMemorySignalStore>,
}

#[async_trait]
impl SignalStore for StalledStore {
    async fn venue(&self, venue_id: i64) -> AppResult<Option<Venue>> {
        self.inner.venue(venue_id).await
    }

    async fn all_venues(&self) -> AppResult<Vec<Venue>> {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        self.inner.all_venues().await
    }

    async fn all_tags(&self) -> AppResult<Vec<Tag>> {
        self.inner.all_tags().await
    }

    async fn all_tag_scores(&self) -> AppResult<Vec<VenueTagScore>> {
        self.inner.all_tag_scores().await
    }

    async fn affinities_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserTagAffinity>> {
        self.inner.affinities_for_user(user_id).await
    }

    async fn edges_for_follower(&self, user_id: Uuid) -> AppResult<Vec<SocialEdge>> {
        self.inner.edges_for_follower(user_id).await
    }

    async fn groups_for_user(&self, user_id: Uuid) -> AppResult<Vec<Group>> {
        self.inner.groups_for_user(user_id).await
    }

    async fn venues_for_groups(&self, group_ids: &[Uuid]) -> AppResult<Vec<GroupVenue>> {
        self.inner.venues_for_groups(group_ids).await
    }

    async fn actions_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserAction>> {
        self.inner.actions_for_user(user_id).await
    }

    async fn actions_for_users(&self, user_ids: &[Uuid]) -> AppResult<Vec<UserAction>> {
        self.inner.actions_for_users(user_ids).await
    }

    async fn all_popularity_counters(&self) -> AppResult<Vec<PopularityCounters>> {
        self.inner.all_popularity_counters().await
    }

    async fn latest_expected_popularity(&self) -> AppResult<Vec<ExpectedPopularityRecord>> {
        self.inner.latest_expected_popularity().await
    }

    async fn shown_venues(&self, user_id: Uuid) -> AppResult<Vec<i64>> {
        self.inner.shown_venues(user_id).await
    }

    async fn run(&self, run_id: Uuid) -> AppResult<Option<RecommendationRun>> {
        self.inner.run(run_id).await
    }

    async fn latest_succeeded_run(&self, user_id: Uuid) -> AppResult<Option<RecommendationRun>> {
        self.inner.latest_succeeded_run(user_id).await
    }

    async fn items_for_run(&self, run_id: Uuid) -> AppResult<Vec<RecommendationItem>> {
        self.inner.items_for_run(run_id).await
    }

    async fn create_run(&self, run: &RecommendationRun) -> AppResult<()> {
        self.inner.create_run(run).await
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        cause: Option<String>,
    ) -> AppResult<()> {
        self.inner.transition_run(run_id, next, cause).await
    }

    async fn set_run_metadata(
        &self,
        run_id: Uuid,
        degraded_sources: &[String],
        model_stale: bool,
    ) -> AppResult<()> {
        self.inner
            .set_run_metadata(run_id, degraded_sources, model_stale)
            .await
    }

    async fn insert_items(&self, run_id: Uuid, items: &[RecommendationItem]) -> AppResult<()> {
        self.inner.insert_items(run_id, items).await
    }

    async fn replace_expected_popularity(
        &self,
        records: &[ExpectedPopularityRecord],
    ) -> AppResult<()> {
        self.inner.replace_expected_popularity(records).await
    }

    async fn mark_expected_popularity_stale(&self) -> AppResult<()> {
        self.inner.mark_expected_popularity_stale().await
    }

    async fn replace_affinities(&self, user_id: Uuid, rows: &[UserTagAffinity]) -> AppResult<()> {
        self.inner.replace_affinities(user_id, rows).await
    }
}

#[tokio::test]
async fn test_slow_store_read_fails_run_with_timeout_cause() {
    let store = Arc::new(StalledStore {
        inner: seeded_store().await,
    });
    let cfg = RecommendationConfig {
        store_timeout_ms: 40,
        ..RecommendationConfig::default()
    };
    let orchestrator = Orchestrator::new(store, cfg);
    let user = Uuid::new_v4();

    let run_id = orchestrator
        .run_user_feed(user, RunContext::default())
        .await
        .unwrap();
    let run = orchestrator.run(run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let cause = run.cause.expect("failed run carries a cause");
    assert!(cause.contains("timed out"), "cause was: {}", cause);
    // nothing was published for the user
    assert!(orchestrator.get_feed(user).await.unwrap().is_empty());
}

// --- HTTP surface ---

async fn create_test_server() -> (TestServer, Arc<InMemorySignalStore>) {
    let store = seeded_store().await;
    let state = AppState::new(store.clone(), RecommendationConfig::default());
    let app = create_router(state);
    (TestServer::new(app).unwrap(), store)
}

#[tokio::test]
async fn test_health_check() {
    let (server, _) = create_test_server().await;
    let response = server.get("/health").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn test_trigger_run_and_fetch_feed() {
    let (server, _) = create_test_server().await;
    let user = Uuid::new_v4();

    let response = server
        .post("/api/v1/runs")
        .json(&json!({ "user_id": user }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let run: serde_json::Value = response.json();
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["user_id"], json!(user));

    let response = server.get(&format!("/api/v1/users/{}/feed", user)).await;
    response.assert_status_ok();
    let feed: serde_json::Value = response.json();
    assert_eq!(feed["items"].as_array().unwrap().len(), 20);
}

#[tokio::test]
async fn test_feed_before_any_run_is_empty() {
    let (server, _) = create_test_server().await;
    let response = server
        .get(&format!("/api/v1/users/{}/feed", Uuid::new_v4()))
        .await;
    response.assert_status_ok();
    let feed: serde_json::Value = response.json();
    assert!(feed["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_run_is_404() {
    let (server, _) = create_test_server().await;
    let response = server.get(&format!("/api/v1/runs/{}", Uuid::new_v4())).await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_succeeded_run_is_conflict() {
    let (server, _) = create_test_server().await;
    let user = Uuid::new_v4();

    let response = server
        .post("/api/v1/runs")
        .json(&json!({ "user_id": user }))
        .await;
    let run: serde_json::Value = response.json();
    let run_id = run["run_id"].as_str().unwrap();

    let response = server
        .post(&format!("/api/v1/runs/{}/cancel", run_id))
        .await;
    response.assert_status(axum::http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_affinity_rebuild_endpoint() {
    let (server, store) = create_test_server().await;
    let user = Uuid::new_v4();
    store
        .insert_action(UserAction {
            user_id: user,
            venue_id: 1,
            kind: ActionKind::Save,
            created_at: Utc::now(),
        })
        .await;

    let response = server
        .post(&format!("/api/v1/users/{}/affinities/rebuild", user))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["affinity_rows"], 1);
}

#[tokio::test]
async fn test_model_refresh_endpoint() {
    let (server, store) = create_test_server().await;
    let response = server.post("/api/v1/model/refresh").await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let records = store.latest_expected_popularity().await.unwrap();
    assert_eq!(records.len(), 80);
}
