use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    ActionKind, BusinessStatus, EdgeStatus, ExpectedPopularityRecord, FactorScores, GeoPoint,
    Group, GroupVenue, PopularityCounters, Reason, RecommendationItem, RecommendationRun,
    RunContext, RunStatus, RunType, SocialEdge, Tag, TagScoreSource, TagType, UserAction,
    UserTagAffinity, Venue, VenueTagScore,
};
use crate::store::SignalStore;

/// Creates a PostgreSQL connection pool
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// sqlx-backed signal store
pub struct PgSignalStore {
    pool: PgPool,
}

impl PgSignalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn venue_from_row(row: &PgRow) -> AppResult<Venue> {
    let lat: Option<f64> = row.try_get("lat")?;
    let lon: Option<f64> = row.try_get("lon")?;
    let status: String = row.try_get("business_status")?;
    Ok(Venue {
        id: row.try_get("id")?,
        place_key: row.try_get("place_key")?,
        name: row.try_get("name")?,
        location: match (lat, lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        },
        price_tier: row.try_get("price_tier")?,
        rating: row.try_get("rating")?,
        rating_count: row.try_get("rating_count")?,
        cuisine: row.try_get("cuisine")?,
        category: row.try_get("category")?,
        address: row.try_get("address")?,
        open_late: row.try_get("open_late")?,
        open_early: row.try_get("open_early")?,
        open_sunday: row.try_get("open_sunday")?,
        business_status: BusinessStatus::parse(&status),
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> AppResult<RecommendationRun> {
    let status: String = row.try_get("status")?;
    let run_type: String = row.try_get("run_type")?;
    let context: String = row.try_get("context")?;
    let degraded: Vec<String> = row.try_get("degraded_sources")?;
    Ok(RecommendationRun {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        run_type: match run_type.as_str() {
            "template" => RunType::Template,
            _ => RunType::Personal,
        },
        status: RunStatus::parse(&status)
            .ok_or_else(|| AppError::Internal(format!("unknown run status {}", status)))?,
        context: serde_json::from_str::<RunContext>(&context)
            .map_err(|e| AppError::Internal(format!("bad run context: {}", e)))?,
        cause: row.try_get("cause")?,
        degraded_sources: degraded,
        model_stale: row.try_get("model_stale")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn item_from_row(row: &PgRow) -> AppResult<RecommendationItem> {
    let factors: String = row.try_get("factors")?;
    let reason: String = row.try_get("reason")?;
    Ok(RecommendationItem {
        run_id: row.try_get("run_id")?,
        venue_id: row.try_get("venue_id")?,
        rank: row.try_get("rank")?,
        final_score: row.try_get("final_score")?,
        factors: serde_json::from_str::<FactorScores>(&factors)
            .map_err(|e| AppError::Internal(format!("bad factor payload: {}", e)))?,
        reason: serde_json::from_str::<Reason>(&reason)
            .map_err(|e| AppError::Internal(format!("bad reason payload: {}", e)))?,
    })
}

const VENUE_COLUMNS: &str = "id, place_key, name, lat, lon, price_tier, rating, rating_count, \
     cuisine, category, address, open_late, open_early, open_sunday, business_status, updated_at";

#[async_trait]
impl SignalStore for PgSignalStore {
    async fn venue(&self, venue_id: i64) -> AppResult<Option<Venue>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM venues WHERE id = $1",
            VENUE_COLUMNS
        ))
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(venue_from_row).transpose()
    }

    async fn all_venues(&self) -> AppResult<Vec<Venue>> {
        let rows = sqlx::query(&format!("SELECT {} FROM venues ORDER BY id", VENUE_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(venue_from_row).collect()
    }

    async fn all_tags(&self) -> AppResult<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, slug, tag_type FROM tags ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let tag_type: String = row.try_get("tag_type")?;
                Ok(Tag {
                    id: row.try_get("id")?,
                    slug: row.try_get("slug")?,
                    tag_type: TagType::parse(&tag_type)
                        .ok_or_else(|| AppError::Internal(format!("unknown tag type {}", tag_type)))?,
                })
            })
            .collect()
    }

    async fn all_tag_scores(&self) -> AppResult<Vec<VenueTagScore>> {
        let rows = sqlx::query(
            "SELECT venue_id, tag_id, strength, source, confidence, updated_at \
             FROM venue_tag_scores",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let source: String = row.try_get("source")?;
                Ok(VenueTagScore {
                    venue_id: row.try_get("venue_id")?,
                    tag_id: row.try_get("tag_id")?,
                    strength: row.try_get("strength")?,
                    source: TagScoreSource::parse(&source).ok_or_else(|| {
                        AppError::Internal(format!("unknown tag score source {}", source))
                    })?,
                    confidence: row.try_get("confidence")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn affinities_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserTagAffinity>> {
        let rows = sqlx::query(
            "SELECT user_id, tag_id, affinity, updated_at \
             FROM user_tag_affinities WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(UserTagAffinity {
                    user_id: row.try_get("user_id")?,
                    tag_id: row.try_get("tag_id")?,
                    affinity: row.try_get("affinity")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn edges_for_follower(&self, user_id: Uuid) -> AppResult<Vec<SocialEdge>> {
        let rows = sqlx::query(
            "SELECT follower, followee, status, influence \
             FROM social_edges WHERE follower = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(SocialEdge {
                    follower: row.try_get("follower")?,
                    followee: row.try_get("followee")?,
                    status: match status.as_str() {
                        "accepted" => EdgeStatus::Accepted,
                        "blocked" => EdgeStatus::Blocked,
                        _ => EdgeStatus::Pending,
                    },
                    influence: row.try_get("influence")?,
                })
            })
            .collect()
    }

    async fn groups_for_user(&self, user_id: Uuid) -> AppResult<Vec<Group>> {
        let rows = sqlx::query(
            "SELECT g.id, g.name, g.activity_level FROM groups g \
             JOIN group_members m ON m.group_id = g.id \
             WHERE m.user_id = $1 ORDER BY g.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Group {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    activity_level: row.try_get("activity_level")?,
                })
            })
            .collect()
    }

    async fn venues_for_groups(&self, group_ids: &[Uuid]) -> AppResult<Vec<GroupVenue>> {
        let rows = sqlx::query(
            "SELECT group_id, venue_id FROM group_venues WHERE group_id = ANY($1)",
        )
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(GroupVenue {
                    group_id: row.try_get("group_id")?,
                    venue_id: row.try_get("venue_id")?,
                })
            })
            .collect()
    }

    async fn actions_for_user(&self, user_id: Uuid) -> AppResult<Vec<UserAction>> {
        self.actions_for_users(&[user_id]).await
    }

    async fn actions_for_users(&self, user_ids: &[Uuid]) -> AppResult<Vec<UserAction>> {
        let rows = sqlx::query(
            "SELECT user_id, venue_id, action, created_at \
             FROM user_actions WHERE user_id = ANY($1)",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let action: String = row.try_get("action")?;
                Ok(UserAction {
                    user_id: row.try_get("user_id")?,
                    venue_id: row.try_get("venue_id")?,
                    kind: ActionKind::parse(&action)
                        .ok_or_else(|| AppError::Internal(format!("unknown action {}", action)))?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn all_popularity_counters(&self) -> AppResult<Vec<PopularityCounters>> {
        let rows = sqlx::query(
            "SELECT venue_id, app_saves, social_mentions, app_updated_at, social_updated_at \
             FROM popularity_counters ORDER BY venue_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PopularityCounters {
                    venue_id: row.try_get("venue_id")?,
                    app_saves: row.try_get("app_saves")?,
                    social_mentions: row.try_get("social_mentions")?,
                    app_updated_at: row.try_get("app_updated_at")?,
                    social_updated_at: row.try_get("social_updated_at")?,
                })
            })
            .collect()
    }

    async fn latest_expected_popularity(&self) -> AppResult<Vec<ExpectedPopularityRecord>> {
        let rows = sqlx::query(
            "SELECT venue_id, expected_popularity, residual_popularity, model_version, stale, \
             computed_at FROM expected_popularity ORDER BY venue_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ExpectedPopularityRecord {
                    venue_id: row.try_get("venue_id")?,
                    expected_popularity: row.try_get("expected_popularity")?,
                    residual_popularity: row.try_get("residual_popularity")?,
                    model_version: row.try_get("model_version")?,
                    stale: row.try_get("stale")?,
                    computed_at: row.try_get("computed_at")?,
                })
            })
            .collect()
    }

    async fn shown_venues(&self, user_id: Uuid) -> AppResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT i.venue_id FROM recommendation_items i \
             JOIN recommendation_runs r ON r.id = i.run_id \
             WHERE r.user_id = $1 AND r.status = 'succeeded'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<i64, _>("venue_id")?))
            .collect()
    }

    async fn run(&self, run_id: Uuid) -> AppResult<Option<RecommendationRun>> {
        let row = sqlx::query(
            "SELECT id, user_id, run_type, status, context, cause, degraded_sources, \
             model_stale, created_at, updated_at FROM recommendation_runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_succeeded_run(&self, user_id: Uuid) -> AppResult<Option<RecommendationRun>> {
        let row = sqlx::query(
            "SELECT id, user_id, run_type, status, context, cause, degraded_sources, \
             model_stale, created_at, updated_at FROM recommendation_runs \
             WHERE user_id = $1 AND status = 'succeeded' \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn items_for_run(&self, run_id: Uuid) -> AppResult<Vec<RecommendationItem>> {
        let rows = sqlx::query(
            "SELECT i.run_id, i.venue_id, i.rank, i.final_score, i.factors, i.reason \
             FROM recommendation_items i \
             JOIN recommendation_runs r ON r.id = i.run_id \
             WHERE i.run_id = $1 AND r.status = 'succeeded' \
             ORDER BY i.rank",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn create_run(&self, run: &RecommendationRun) -> AppResult<()> {
        let context = serde_json::to_string(&run.context)
            .map_err(|e| AppError::Internal(format!("context serialization: {}", e)))?;
        let run_type = match run.run_type {
            RunType::Personal => "personal",
            RunType::Template => "template",
        };
        sqlx::query(
            "INSERT INTO recommendation_runs \
             (id, user_id, run_type, status, context, cause, degraded_sources, model_stale, \
              created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(run.id)
        .bind(run.user_id)
        .bind(run_type)
        .bind(run.status.as_str())
        .bind(context)
        .bind(&run.cause)
        .bind(&run.degraded_sources)
        .bind(run.model_stale)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        cause: Option<String>,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM recommendation_runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {}", run_id)))?;
        let current: String = row.try_get("status")?;
        let current = RunStatus::parse(&current)
            .ok_or_else(|| AppError::Internal(format!("unknown run status {}", current)))?;

        if !current.can_transition(next) {
            return Err(AppError::IllegalTransition {
                from: current.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        sqlx::query(
            "UPDATE recommendation_runs SET status = $2, cause = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(next.as_str())
        .bind(cause)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_run_metadata(
        &self,
        run_id: Uuid,
        degraded_sources: &[String],
        model_stale: bool,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE recommendation_runs SET degraded_sources = $2, model_stale = $3 \
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(degraded_sources)
        .bind(model_stale)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_items(&self, run_id: Uuid, items: &[RecommendationItem]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            let factors = serde_json::to_string(&item.factors)
                .map_err(|e| AppError::Internal(format!("factor serialization: {}", e)))?;
            let reason = serde_json::to_string(&item.reason)
                .map_err(|e| AppError::Internal(format!("reason serialization: {}", e)))?;
            sqlx::query(
                "INSERT INTO recommendation_items \
                 (run_id, venue_id, rank, final_score, factors, reason) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(run_id)
            .bind(item.venue_id)
            .bind(item.rank)
            .bind(item.final_score)
            .bind(factors)
            .bind(reason)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_expected_popularity(
        &self,
        records: &[ExpectedPopularityRecord],
    ) -> AppResult<()> {
        // One transaction so readers see the old or the new snapshot, never a mix
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM expected_popularity")
            .execute(&mut *tx)
            .await?;
        for record in records {
            sqlx::query(
                "INSERT INTO expected_popularity \
                 (venue_id, expected_popularity, residual_popularity, model_version, stale, \
                  computed_at) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(record.venue_id)
            .bind(record.expected_popularity)
            .bind(record.residual_popularity)
            .bind(record.model_version)
            .bind(record.stale)
            .bind(record.computed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_expected_popularity_stale(&self) -> AppResult<()> {
        sqlx::query("UPDATE expected_popularity SET stale = TRUE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_affinities(&self, user_id: Uuid, rows: &[UserTagAffinity]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_tag_affinities WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO user_tag_affinities (user_id, tag_id, affinity, updated_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(row.user_id)
            .bind(row.tag_id)
            .bind(row.affinity)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
