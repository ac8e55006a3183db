use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{
    ExpectedPopularityRecord, Group, GroupVenue, PopularityCounters, SocialEdge, UserAction,
    UserTagAffinity, Venue,
};

pub mod candidates;
pub mod composer;
pub mod orchestrator;
pub mod popularity_model;
pub mod scorer;

pub use orchestrator::Orchestrator;

/// Everything one run reads from the signal store, fetched up front so the
/// generator, scorer, and composer operate on a single consistent snapshot.
pub struct PipelineSnapshot {
    pub venues: HashMap<i64, Venue>,
    /// Resolved (venue -> tag -> strength) after multi-source resolution
    pub venue_tags: HashMap<i64, HashMap<i32, f64>>,
    /// Tag id -> slug, for reason payloads
    pub tag_slugs: HashMap<i32, String>,
    pub affinities: Vec<UserTagAffinity>,
    /// Accepted edges only
    pub edges: Vec<SocialEdge>,
    /// Save/like actions of the user's accepted followees
    pub followee_saves: Vec<UserAction>,
    pub groups: Vec<Group>,
    pub group_venues: Vec<GroupVenue>,
    pub counters: HashMap<i64, PopularityCounters>,
    pub residuals: HashMap<i64, ExpectedPopularityRecord>,
    /// Venues the user has been shown in prior succeeded runs
    pub shown: HashSet<i64>,
    /// Total recorded actions by this user
    pub action_count: usize,
    /// Whether the expected-popularity snapshot is flagged stale
    pub model_stale: bool,
    pub now: DateTime<Utc>,
}

impl PipelineSnapshot {
    /// Strongest single affinity x tag-strength product for a venue, in
    /// [0, 1]. Both the exploration source and the hidden-gem floor gate on
    /// this raw value; pool-relative normalization never touches it, so a
    /// weak pool cannot inflate an irrelevant venue past the floor.
    pub fn taste_match(&self, venue_id: i64) -> f64 {
        let Some(tags) = self.venue_tags.get(&venue_id) else {
            return 0.0;
        };
        self.affinities
            .iter()
            .filter_map(|a| tags.get(&a.tag_id).map(|s| a.affinity * s))
            .fold(0.0, f64::max)
    }
}
