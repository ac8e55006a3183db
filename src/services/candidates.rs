use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::RecommendationConfig;
use crate::models::{recency_decay, BusinessStatus, EdgeStatus};
use crate::services::PipelineSnapshot;

/// Provenance of a candidate. A venue may be surfaced by several sources;
/// all contributions are kept for the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    Taste,
    Friend,
    Group,
    TrendingApp,
    TrendingSocial,
    Exploration,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::Taste => "taste",
            CandidateSource::Friend => "friend",
            CandidateSource::Group => "group",
            CandidateSource::TrendingApp => "trending_app",
            CandidateSource::TrendingSocial => "trending_social",
            CandidateSource::Exploration => "exploration",
        }
    }
}

/// One source's raw (pre-normalization) signal for a venue
#[derive(Debug, Clone)]
pub struct SourceContribution {
    pub source: CandidateSource,
    pub raw_score: f64,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub venue_id: i64,
    pub contributions: Vec<SourceContribution>,
    /// Distinct accepted followees whose actions surfaced this venue
    pub friend_count: usize,
    /// Distinct groups that surfaced this venue
    pub group_count: usize,
}

impl Candidate {
    pub fn contribution(&self, source: CandidateSource) -> Option<f64> {
        self.contributions
            .iter()
            .find(|c| c.source == source)
            .map(|c| c.raw_score)
    }
}

#[derive(Debug)]
pub struct GeneratedCandidates {
    pub candidates: Vec<Candidate>,
    /// Sources that produced nothing for this user
    pub degraded: Vec<CandidateSource>,
}

/// Builds the bounded, deduplicated candidate pool for one run.
///
/// Each source contributes at most `source_top_k` venues, selected by raw
/// score descending with venue id as the tie-break, so the pool is a pure
/// function of the snapshot.
pub struct CandidateGenerator<'a> {
    snapshot: &'a PipelineSnapshot,
    cfg: &'a RecommendationConfig,
    user_id: Uuid,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(snapshot: &'a PipelineSnapshot, cfg: &'a RecommendationConfig, user_id: Uuid) -> Self {
        Self {
            snapshot,
            cfg,
            user_id,
        }
    }

    pub fn generate(&self) -> GeneratedCandidates {
        let mut pool: BTreeMap<i64, Vec<SourceContribution>> = BTreeMap::new();
        let mut degraded = Vec::new();

        let sources: [(CandidateSource, Vec<(i64, f64)>); 6] = [
            (CandidateSource::Taste, self.taste_source()),
            (CandidateSource::Friend, self.friend_source()),
            (CandidateSource::Group, self.group_source()),
            (
                CandidateSource::TrendingApp,
                self.trending_source(|c| c.0, |c| c.1),
            ),
            (
                CandidateSource::TrendingSocial,
                self.trending_source(|c| c.2, |c| c.3),
            ),
            (CandidateSource::Exploration, self.exploration_source()),
        ];

        for (source, mut scored) in sources {
            if scored.is_empty() {
                tracing::debug!(
                    user_id = %self.user_id,
                    source = source.as_str(),
                    "Candidate source produced nothing"
                );
                degraded.push(source);
                continue;
            }
            scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            scored.truncate(self.cfg.source_top_k);
            for (venue_id, raw_score) in scored {
                pool.entry(venue_id)
                    .or_default()
                    .push(SourceContribution { source, raw_score });
            }
        }

        let friend_counts = self.friend_counts();
        let group_counts = self.group_counts();
        let candidates: Vec<Candidate> = pool
            .into_iter()
            .map(|(venue_id, contributions)| Candidate {
                venue_id,
                contributions,
                friend_count: friend_counts.get(&venue_id).copied().unwrap_or(0),
                group_count: group_counts.get(&venue_id).copied().unwrap_or(0),
            })
            .collect();

        tracing::debug!(
            user_id = %self.user_id,
            candidates = candidates.len(),
            degraded = degraded.len(),
            "Candidate pool generated"
        );

        GeneratedCandidates {
            candidates,
            degraded,
        }
    }

    /// A venue is eligible unless permanently closed or already shown to
    /// the user in a prior succeeded run.
    fn eligible(&self, venue_id: i64) -> bool {
        if self.snapshot.shown.contains(&venue_id) {
            return false;
        }
        self.snapshot
            .venues
            .get(&venue_id)
            .map(|v| v.business_status != BusinessStatus::ClosedPermanently)
            .unwrap_or(false)
    }

    /// Weighted dot product of the user's top affinities against resolved
    /// venue tag strengths, over the shared tags.
    fn taste_source(&self) -> Vec<(i64, f64)> {
        let mut top: Vec<_> = self.snapshot.affinities.iter().collect();
        top.sort_by(|a, b| {
            b.affinity
                .partial_cmp(&a.affinity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.tag_id.cmp(&b.tag_id))
        });
        top.truncate(self.cfg.top_affinities);
        if top.is_empty() {
            return Vec::new();
        }

        self.snapshot
            .venue_tags
            .iter()
            .filter(|(venue_id, _)| self.eligible(**venue_id))
            .filter_map(|(venue_id, tags)| {
                let score: f64 = top
                    .iter()
                    .filter_map(|a| tags.get(&a.tag_id).map(|s| a.affinity * s))
                    .sum();
                (score > 0.0).then_some((*venue_id, score))
            })
            .collect()
    }

    /// Saves and likes of accepted followees, weighted by edge influence and
    /// action recency.
    fn friend_source(&self) -> Vec<(i64, f64)> {
        let mut scores: BTreeMap<i64, f64> = BTreeMap::new();
        for action in &self.snapshot.followee_saves {
            if !self.eligible(action.venue_id) {
                continue;
            }
            let Some(edge) = self
                .snapshot
                .edges
                .iter()
                .find(|e| e.status == EdgeStatus::Accepted && e.followee == action.user_id)
            else {
                continue;
            };
            let age_days = (self.snapshot.now - action.created_at).num_seconds() as f64 / 86_400.0;
            let decay = recency_decay(age_days, self.cfg.recency_half_life_days);
            *scores.entry(action.venue_id).or_default() += edge.influence_norm() * decay;
        }
        scores.into_iter().collect()
    }

    fn group_source(&self) -> Vec<(i64, f64)> {
        let mut scores: BTreeMap<i64, f64> = BTreeMap::new();
        for gv in &self.snapshot.group_venues {
            if !self.eligible(gv.venue_id) {
                continue;
            }
            let Some(group) = self.snapshot.groups.iter().find(|g| g.id == gv.group_id) else {
                continue;
            };
            *scores.entry(gv.venue_id).or_default() += group.activity_level;
        }
        scores.into_iter().collect()
    }

    /// One trending source per channel; channels never blend. Counts are
    /// log-damped and decayed by how recently the channel was refreshed.
    fn trending_source(
        &self,
        count: impl Fn(&(i64, chrono::DateTime<chrono::Utc>, i64, chrono::DateTime<chrono::Utc>)) -> i64,
        updated: impl Fn(
            &(i64, chrono::DateTime<chrono::Utc>, i64, chrono::DateTime<chrono::Utc>),
        ) -> chrono::DateTime<chrono::Utc>,
    ) -> Vec<(i64, f64)> {
        self.snapshot
            .counters
            .iter()
            .filter(|(venue_id, _)| self.eligible(**venue_id))
            .filter_map(|(venue_id, c)| {
                let tuple = (c.app_saves, c.app_updated_at, c.social_mentions, c.social_updated_at);
                let n = count(&tuple);
                if n <= 0 {
                    return None;
                }
                let age_days =
                    (self.snapshot.now - updated(&tuple)).num_seconds() as f64 / 86_400.0;
                let decay = recency_decay(age_days, self.cfg.recency_half_life_days);
                Some((*venue_id, (n as f64).ln_1p() * decay))
            })
            .collect()
    }

    /// Never-shown venues biased toward the most negative popularity
    /// residual, gated on a minimal taste match so the exploration slice is
    /// still plausibly relevant.
    fn exploration_source(&self) -> Vec<(i64, f64)> {
        let budget =
            ((self.cfg.source_top_k as f64) * self.cfg.exploration_fraction).ceil() as usize;
        let mut pool: Vec<(i64, f64)> = self
            .snapshot
            .residuals
            .iter()
            .filter(|(venue_id, _)| self.eligible(**venue_id))
            .filter(|(venue_id, _)| self.snapshot.taste_match(**venue_id) >= self.cfg.taste_floor)
            .map(|(venue_id, r)| (*venue_id, r.residual_popularity))
            .collect();
        // most under-exposed first
        pool.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        pool.truncate(budget);
        // raw score: how far below expectation, as a positive magnitude
        pool.into_iter()
            .map(|(venue_id, residual)| (venue_id, (-residual).max(0.0)))
            .filter(|(_, s)| *s > 0.0)
            .collect()
    }

    fn friend_counts(&self) -> BTreeMap<i64, usize> {
        let mut per_venue: BTreeMap<i64, std::collections::BTreeSet<Uuid>> = BTreeMap::new();
        for action in &self.snapshot.followee_saves {
            per_venue
                .entry(action.venue_id)
                .or_default()
                .insert(action.user_id);
        }
        per_venue.into_iter().map(|(v, s)| (v, s.len())).collect()
    }

    fn group_counts(&self) -> BTreeMap<i64, usize> {
        let mut per_venue: BTreeMap<i64, usize> = BTreeMap::new();
        for gv in &self.snapshot.group_venues {
            *per_venue.entry(gv.venue_id).or_default() += 1;
        }
        per_venue
    }

}
