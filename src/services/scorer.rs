use std::collections::HashMap;

use crate::config::{RecommendationConfig, WeightVector};
use crate::models::run::{FactorScores, FeedRow, RunContext};
use crate::models::recency_decay;
use crate::services::candidates::{Candidate, CandidateSource};
use crate::services::PipelineSnapshot;

/// Discrete engagement bucket driving adaptive weight selection. Identical
/// inputs always classify identically, so scoring stays reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    ColdStart,
    SociallyConnected,
    HighEngagement,
    Default,
}

pub fn classify_user_state(
    affinity_count: usize,
    accepted_edges: usize,
    action_count: usize,
    cfg: &RecommendationConfig,
) -> UserState {
    if affinity_count == 0 || action_count <= cfg.cold_start_max_actions {
        UserState::ColdStart
    } else if action_count >= cfg.high_engagement_actions {
        UserState::HighEngagement
    } else if accepted_edges >= cfg.high_friend_count {
        UserState::SociallyConnected
    } else {
        UserState::Default
    }
}

pub fn weights_for(state: UserState, cfg: &RecommendationConfig) -> WeightVector {
    match state {
        UserState::ColdStart => cfg.weights.cold_start,
        UserState::SociallyConnected => cfg.weights.socially_connected,
        UserState::HighEngagement => cfg.weights.high_engagement,
        UserState::Default => cfg.weights.default,
    }
}

/// One fully scored candidate, ready for composition
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub venue_id: i64,
    pub factors: FactorScores,
    pub final_score: f64,
    pub row: FeedRow,
    /// Top contributing tag slugs, for the reason payload
    pub taste_tags: Vec<String>,
    pub friend_count: usize,
    pub group_count: usize,
}

/// Scores the candidate pool against one weight vector.
///
/// Source raw scores are max-normalized across the pool so every factor
/// lands in [0, 1] before blending; quality and freshness come straight
/// from venue attributes. Distance only participates when the run carries
/// a geo context, and its weight is redistributed otherwise.
pub fn score_candidates(
    candidates: &[Candidate],
    snapshot: &PipelineSnapshot,
    ctx: &RunContext,
    state: UserState,
    cfg: &RecommendationConfig,
) -> Vec<ScoredCandidate> {
    let weights = weights_for(state, cfg);
    let max_of = |source: CandidateSource| -> f64 {
        candidates
            .iter()
            .filter_map(|c| c.contribution(source))
            .fold(0.0, f64::max)
    };
    let max_taste = max_of(CandidateSource::Taste);
    let max_friend = max_of(CandidateSource::Friend);
    let max_group = max_of(CandidateSource::Group);
    let max_trend_app = max_of(CandidateSource::TrendingApp);
    let max_trend_social = max_of(CandidateSource::TrendingSocial);
    let norm = |raw: Option<f64>, max: f64| -> f64 {
        match raw {
            Some(v) if max > 0.0 => (v / max).clamp(0.0, 1.0),
            _ => 0.0,
        }
    };

    candidates
        .iter()
        .filter_map(|candidate| {
            let venue = snapshot.venues.get(&candidate.venue_id)?;

            let taste = norm(candidate.contribution(CandidateSource::Taste), max_taste);
            let friend = norm(candidate.contribution(CandidateSource::Friend), max_friend);
            let group = norm(candidate.contribution(CandidateSource::Group), max_group);
            let trend_app = norm(
                candidate.contribution(CandidateSource::TrendingApp),
                max_trend_app,
            );
            let trend_social = norm(
                candidate.contribution(CandidateSource::TrendingSocial),
                max_trend_social,
            );

            let quality = bayesian_quality(
                venue.rating,
                venue.rating_count,
                cfg.quality_smoothing_count,
                cfg.quality_rating_prior,
            );
            let age_days =
                (snapshot.now - venue.updated_at).num_seconds() as f64 / 86_400.0;
            let freshness = recency_decay(age_days, cfg.freshness_half_life_days);

            let distance = match (&ctx.location, &venue.location) {
                (Some(here), Some(there)) => Some(1.0 / (1.0 + here.haversine_km(there))),
                _ => None,
            };

            // The floor gates on the raw taste match, not the normalized
            // factor: in a weak pool normalization inflates the best taste
            // score to 1.0, which must not unlock promotion by itself.
            let raw_taste = snapshot.taste_match(candidate.venue_id);
            let hidden_gem_bonus = snapshot
                .residuals
                .get(&candidate.venue_id)
                .map(|r| hidden_gem_bonus(r.residual_popularity, raw_taste, cfg))
                .unwrap_or(0.0);

            let factors = FactorScores {
                taste,
                friend,
                group,
                trend_app,
                trend_social,
                quality,
                freshness,
                distance,
                hidden_gem_bonus,
            };
            let final_score = blend(&factors, &weights) + hidden_gem_bonus;
            let row = assign_row(&factors, &weights);

            Some(ScoredCandidate {
                venue_id: candidate.venue_id,
                factors,
                final_score,
                row,
                taste_tags: top_taste_tags(candidate.venue_id, snapshot, 3),
                friend_count: candidate.friend_count,
                group_count: candidate.group_count,
            })
        })
        .collect()
}

/// Blend of present factors; when distance is absent its weight is spread
/// across the others so the final score still tops out at 1 (plus bonus).
fn blend(factors: &FactorScores, w: &WeightVector) -> f64 {
    let mut score = w.taste * factors.taste
        + w.friend * factors.friend
        + w.group * factors.group
        + w.trend_app * factors.trend_app
        + w.trend_social * factors.trend_social
        + w.quality * factors.quality
        + w.freshness * factors.freshness;
    let mut total_weight = w.taste
        + w.friend
        + w.group
        + w.trend_app
        + w.trend_social
        + w.quality
        + w.freshness;
    if let Some(distance) = factors.distance {
        score += w.distance * distance;
        total_weight += w.distance;
    }
    if total_weight > 0.0 {
        score / total_weight
    } else {
        0.0
    }
}

/// Bayesian-smoothed rating on a [0, 1] scale. Venues with few ratings are
/// pulled toward the prior so a 5.0 over 2 ratings cannot outrank a 4.6
/// over 500.
pub fn bayesian_quality(rating: Option<f64>, rating_count: i64, c: f64, prior: f64) -> f64 {
    let n = rating_count.max(0) as f64;
    let r = rating.unwrap_or(prior).clamp(0.0, 5.0);
    let smoothed = (c * prior + n * r) / (c + n);
    (smoothed / 5.0).clamp(0.0, 1.0)
}

/// Additive promotion for venues performing well below their structural
/// expectation, gated on a minimum taste match. Scales linearly with how far
/// the residual sits below the threshold and saturates at the cap.
pub fn hidden_gem_bonus(residual: f64, taste_match: f64, cfg: &RecommendationConfig) -> f64 {
    if residual >= cfg.residual_threshold || taste_match < cfg.taste_floor {
        return 0.0;
    }
    let depth = (cfg.residual_threshold - residual) / cfg.residual_threshold.abs();
    cfg.hidden_gem_bonus_cap * depth.min(1.0)
}

/// Dominant-signal row assignment. The bonus takes precedence; otherwise the
/// largest weighted signal group wins, with ties resolved in a fixed order
/// (taste, social, trending).
fn assign_row(factors: &FactorScores, w: &WeightVector) -> FeedRow {
    if factors.hidden_gem_bonus > 0.0 {
        return FeedRow::HiddenGem;
    }
    let taste = w.taste * factors.taste;
    let social = w.friend * factors.friend + w.group * factors.group;
    let trending = w.trend_app * factors.trend_app + w.trend_social * factors.trend_social;
    if taste >= social && taste >= trending {
        FeedRow::Taste
    } else if social >= trending {
        FeedRow::Social
    } else {
        FeedRow::Trending
    }
}

fn top_taste_tags(venue_id: i64, snapshot: &PipelineSnapshot, limit: usize) -> Vec<String> {
    let Some(tags) = snapshot.venue_tags.get(&venue_id) else {
        return Vec::new();
    };
    let affinity_by_tag: HashMap<i32, f64> = snapshot
        .affinities
        .iter()
        .map(|a| (a.tag_id, a.affinity))
        .collect();
    let mut contributions: Vec<(i32, f64)> = tags
        .iter()
        .filter_map(|(tag_id, strength)| {
            affinity_by_tag
                .get(tag_id)
                .map(|a| (*tag_id, a * strength))
        })
        .filter(|(_, c)| *c > 0.0)
        .collect();
    contributions.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    contributions
        .into_iter()
        .take(limit)
        .filter_map(|(tag_id, _)| snapshot.tag_slugs.get(&tag_id).cloned())
        .collect()
}
