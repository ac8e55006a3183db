use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub mod run;

pub use run::{
    FactorScores, FeedRow, Reason, RecommendationItem, RecommendationRun, RunContext, RunStatus,
    RunType,
};

/// Operating status of a venue, as reported by ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStatus {
    Operational,
    ClosedTemporarily,
    ClosedPermanently,
    Unknown,
}

impl BusinessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessStatus::Operational => "operational",
            BusinessStatus::ClosedTemporarily => "closed_temporarily",
            BusinessStatus::ClosedPermanently => "closed_permanently",
            BusinessStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "operational" => BusinessStatus::Operational,
            "closed_temporarily" => BusinessStatus::ClosedTemporarily,
            "closed_permanently" => BusinessStatus::ClosedPermanently,
            _ => BusinessStatus::Unknown,
        }
    }
}

/// A geographic point with great-circle distance support
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Haversine distance to another point, in kilometers
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;

        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * a.sqrt().asin() * EARTH_RADIUS_KM
    }
}

/// A physical venue. Identity (`place_key`) is immutable; attributes are
/// created and updated by ingestion and read-only to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venue {
    pub id: i64,
    /// External place key (e.g. a Google place id)
    pub place_key: String,
    pub name: String,
    pub location: Option<GeoPoint>,
    /// Price tier 0-4
    pub price_tier: Option<i16>,
    /// Google rating on a 0-5 scale
    pub rating: Option<f64>,
    pub rating_count: i64,
    pub cuisine: Option<String>,
    pub category: Option<String>,
    pub address: Option<String>,
    pub open_late: bool,
    pub open_early: bool,
    pub open_sunday: bool,
    pub business_status: BusinessStatus,
    pub updated_at: DateTime<Utc>,
}

impl Venue {
    /// Coarse area token derived from the free-text address: the next-to-last
    /// comma-separated segment, lowercased ("12 Foo St, Soho, London" -> "soho").
    pub fn area_token(&self) -> String {
        let Some(address) = &self.address else {
            return "unknown".to_string();
        };
        let segments: Vec<&str> = address
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if segments.len() < 2 {
            return "unknown".to_string();
        }
        segments[segments.len() - 2].to_lowercase()
    }
}

/// Controlled vocabulary categories for tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    Cuisine,
    Dietary,
    Vibe,
    Occasion,
    Drinks,
    Schedule,
    Value,
    Category,
}

impl TagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagType::Cuisine => "cuisine",
            TagType::Dietary => "dietary",
            TagType::Vibe => "vibe",
            TagType::Occasion => "occasion",
            TagType::Drinks => "drinks",
            TagType::Schedule => "schedule",
            TagType::Value => "value",
            TagType::Category => "category",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cuisine" => Some(TagType::Cuisine),
            "dietary" => Some(TagType::Dietary),
            "vibe" => Some(TagType::Vibe),
            "occasion" => Some(TagType::Occasion),
            "drinks" => Some(TagType::Drinks),
            "schedule" => Some(TagType::Schedule),
            "value" => Some(TagType::Value),
            "category" => Some(TagType::Category),
            _ => None,
        }
    }
}

/// A controlled-vocabulary tag with a stable slug
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: i32,
    pub slug: String,
    pub tag_type: TagType,
}

/// Where a venue-tag score came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagScoreSource {
    Deterministic,
    ReviewDerived,
    Embedding,
}

impl TagScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagScoreSource::Deterministic => "deterministic",
            TagScoreSource::ReviewDerived => "review_derived",
            TagScoreSource::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deterministic" => Some(TagScoreSource::Deterministic),
            "review_derived" => Some(TagScoreSource::ReviewDerived),
            "embedding" => Some(TagScoreSource::Embedding),
            _ => None,
        }
    }
}

/// Strength of a (venue, tag) association from one source.
/// Multiple sources may coexist for the same pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueTagScore {
    pub venue_id: i64,
    pub tag_id: i32,
    /// Association strength in [0, 1]
    pub strength: f64,
    pub source: TagScoreSource,
    /// Source confidence in [0, 1]
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

/// Resolves multi-source tag scores into one strength per (venue, tag).
/// Higher confidence wins; on a tie, the most recently updated score wins.
pub fn resolve_tag_scores(scores: &[VenueTagScore]) -> HashMap<i64, HashMap<i32, f64>> {
    let mut winners: HashMap<(i64, i32), &VenueTagScore> = HashMap::new();
    for score in scores {
        let key = (score.venue_id, score.tag_id);
        match winners.get(&key) {
            Some(current)
                if (current.confidence, current.updated_at)
                    >= (score.confidence, score.updated_at) => {}
            _ => {
                winners.insert(key, score);
            }
        }
    }

    let mut resolved: HashMap<i64, HashMap<i32, f64>> = HashMap::new();
    for ((venue_id, tag_id), score) in winners {
        resolved
            .entry(venue_id)
            .or_default()
            .insert(tag_id, score.strength);
    }
    resolved
}

/// A user's affinity for one tag, in [0, 1]. One row per user x tag;
/// rebuilt wholesale from weighted, recency-decayed actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTagAffinity {
    pub user_id: Uuid,
    pub tag_id: i32,
    pub affinity: f64,
    pub updated_at: DateTime<Utc>,
}

/// Status of a follower -> followee edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    Pending,
    Accepted,
    Blocked,
}

/// Directed social edge with a bounded influence weight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialEdge {
    pub follower: Uuid,
    pub followee: Uuid,
    pub status: EdgeStatus,
    /// Influence weight in 1..=MAX_INFLUENCE
    pub influence: i16,
}

impl SocialEdge {
    pub const MAX_INFLUENCE: i16 = 10;

    /// Influence normalized to (0, 1]
    pub fn influence_norm(&self) -> f64 {
        f64::from(self.influence.clamp(1, Self::MAX_INFLUENCE)) / f64::from(Self::MAX_INFLUENCE)
    }
}

/// A group a user belongs to, with an activity level in [0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub activity_level: f64,
}

/// A venue associated with a group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupVenue {
    pub group_id: Uuid,
    pub venue_id: i64,
}

/// Which channel feeds the expected-popularity target. Exactly one channel
/// per model fit; blending is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopularitySource {
    /// Google-sourced rating counts (bootstrap phase)
    GoogleRatings,
    /// In-app save counts (steady state)
    InAppSaves,
}

/// Per-venue popularity counts from the two independent channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopularityCounters {
    pub venue_id: i64,
    pub app_saves: i64,
    pub social_mentions: i64,
    pub app_updated_at: DateTime<Utc>,
    pub social_updated_at: DateTime<Utc>,
}

/// Output of one expected-popularity model pass for one venue.
/// `residual_popularity = log1p(observed) - expected` in log space;
/// negative means under-exposed relative to structural expectation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedPopularityRecord {
    pub venue_id: i64,
    pub expected_popularity: f64,
    pub residual_popularity: f64,
    pub model_version: i32,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
}

/// Behavioral actions a user can take on a venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Save,
    Like,
    Share,
    DetailView,
    Impression,
    Dismiss,
}

impl ActionKind {
    /// Base weight of the action when folding into tag affinities
    pub fn weight(&self) -> f64 {
        match self {
            ActionKind::Save => 3.0,
            ActionKind::Like => 2.0,
            ActionKind::Share => 2.5,
            ActionKind::DetailView => 0.5,
            ActionKind::Impression => 0.1,
            ActionKind::Dismiss => -1.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Save => "save",
            ActionKind::Like => "like",
            ActionKind::Share => "share",
            ActionKind::DetailView => "detail_view",
            ActionKind::Impression => "impression",
            ActionKind::Dismiss => "dismiss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "save" => Some(ActionKind::Save),
            "like" => Some(ActionKind::Like),
            "share" => Some(ActionKind::Share),
            "detail_view" => Some(ActionKind::DetailView),
            "impression" => Some(ActionKind::Impression),
            "dismiss" => Some(ActionKind::Dismiss),
            _ => None,
        }
    }
}

/// One recorded user action on a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAction {
    pub user_id: Uuid,
    pub venue_id: i64,
    pub kind: ActionKind,
    pub created_at: DateTime<Utc>,
}

/// Exponential half-life decay with value 1.0 at age zero
pub fn recency_decay(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_days.max(0.0) / half_life_days)
}
