use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::config::RecommendationConfig;
use crate::models::run::{FeedRow, Reason, RecommendationItem};
use crate::models::Venue;
use crate::services::scorer::ScoredCandidate;

/// Assembles the final feed from scored candidates.
///
/// Row quotas decide feed membership: each row claims up to its quota in
/// score order, leftover slots fall back to the best remaining candidates
/// regardless of row. A cuisine may hold at most
/// `ceil(diversity_cap * feed_size)` slots; when the pool lacks variety the
/// cap is relaxed rather than shipping a short feed. The selected set is then
/// ranked globally by final score so rank order and score order agree.
pub fn compose(
    run_id: Uuid,
    scored: &[ScoredCandidate],
    venues: &HashMap<i64, Venue>,
    cfg: &RecommendationConfig,
) -> Vec<RecommendationItem> {
    let feed_size = cfg.feed_size.min(scored.len());
    let cuisine_cap = ((cfg.diversity_cap * cfg.feed_size as f64).ceil() as usize).max(1);

    let mut by_row: HashMap<FeedRow, Vec<&ScoredCandidate>> = HashMap::new();
    for candidate in scored {
        by_row.entry(candidate.row).or_default().push(candidate);
    }
    for row in by_row.values_mut() {
        row.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.venue_id.cmp(&b.venue_id))
        });
    }

    let cuisine_of = |venue_id: i64| -> String {
        venues
            .get(&venue_id)
            .and_then(|v| v.cuisine.as_deref())
            .map(str::to_lowercase)
            .unwrap_or_else(|| "unknown".to_string())
    };

    let mut picked: HashSet<i64> = HashSet::new();
    let mut cuisine_counts: HashMap<String, usize> = HashMap::new();
    let mut selected: Vec<&ScoredCandidate> = Vec::with_capacity(feed_size);

    let quota_for = |row: FeedRow| -> usize {
        match row {
            FeedRow::Taste => cfg.row_quotas.taste,
            FeedRow::Social => cfg.row_quotas.social,
            FeedRow::Trending => cfg.row_quotas.trending,
            FeedRow::HiddenGem => cfg.row_quotas.hidden_gem,
        }
    };

    // Quota pass: each row claims its slots in score order, skipping
    // candidates that would breach the cuisine ceiling.
    for row in [
        FeedRow::Taste,
        FeedRow::Social,
        FeedRow::Trending,
        FeedRow::HiddenGem,
    ] {
        let Some(row_candidates) = by_row.get(&row) else {
            continue;
        };
        let mut taken = 0;
        for candidate in row_candidates {
            if taken >= quota_for(row) || selected.len() >= feed_size {
                break;
            }
            if picked.contains(&candidate.venue_id) {
                continue;
            }
            let cuisine = cuisine_of(candidate.venue_id);
            if cuisine_counts.get(&cuisine).copied().unwrap_or(0) >= cuisine_cap {
                continue;
            }
            picked.insert(candidate.venue_id);
            *cuisine_counts.entry(cuisine).or_default() += 1;
            selected.push(candidate);
            taken += 1;
        }
    }

    // Fallback pass: unfilled quotas redistribute to the best remaining
    // candidates across all rows, still honoring the cuisine ceiling.
    let mut remaining: Vec<&ScoredCandidate> = scored
        .iter()
        .filter(|c| !picked.contains(&c.venue_id))
        .collect();
    remaining.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.venue_id.cmp(&b.venue_id))
    });
    for candidate in &remaining {
        if selected.len() >= feed_size {
            break;
        }
        let cuisine = cuisine_of(candidate.venue_id);
        if cuisine_counts.get(&cuisine).copied().unwrap_or(0) >= cuisine_cap {
            continue;
        }
        picked.insert(candidate.venue_id);
        *cuisine_counts.entry(cuisine).or_default() += 1;
        selected.push(candidate);
    }

    // Cap-relaxed pass: a short feed is worse than an unbalanced one
    for candidate in &remaining {
        if selected.len() >= feed_size {
            break;
        }
        if picked.contains(&candidate.venue_id) {
            continue;
        }
        picked.insert(candidate.venue_id);
        selected.push(candidate);
    }

    // Global rank order: score desc, lower venue id on exact ties
    selected.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.venue_id.cmp(&b.venue_id))
    });

    selected
        .into_iter()
        .enumerate()
        .map(|(i, candidate)| RecommendationItem {
            run_id,
            venue_id: candidate.venue_id,
            rank: (i + 1) as i32,
            final_score: candidate.final_score,
            factors: candidate.factors.clone(),
            reason: Reason {
                row: candidate.row,
                tags: candidate.taste_tags.clone(),
                friend_count: candidate.friend_count,
                group_count: candidate.group_count,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::run::FactorScores;
    use crate::models::BusinessStatus;
    use chrono::Utc;

    fn venue(id: i64, cuisine: &str) -> Venue {
        Venue {
            id,
            place_key: format!("p{}", id),
            name: format!("v{}", id),
            location: None,
            price_tier: Some(2),
            rating: Some(4.0),
            rating_count: 100,
            cuisine: Some(cuisine.to_string()),
            category: Some("restaurant".to_string()),
            address: None,
            open_late: false,
            open_early: false,
            open_sunday: true,
            business_status: BusinessStatus::Operational,
            updated_at: Utc::now(),
        }
    }

    fn scored(venue_id: i64, score: f64, row: FeedRow) -> ScoredCandidate {
        ScoredCandidate {
            venue_id,
            factors: FactorScores::default(),
            final_score: score,
            row,
            taste_tags: Vec::new(),
            friend_count: 0,
            group_count: 0,
        }
    }

    fn venue_map(cuisines: &[(i64, &str)]) -> HashMap<i64, Venue> {
        cuisines
            .iter()
            .map(|(id, cuisine)| (*id, venue(*id, cuisine)))
            .collect()
    }

    #[test]
    fn test_ranks_are_contiguous_and_scores_non_increasing() {
        let pool: Vec<ScoredCandidate> = (1..=30)
            .map(|i| scored(i, 1.0 / i as f64, FeedRow::Taste))
            .collect();
        let venues = venue_map(
            &(1..=30)
                .map(|i| (i, if i % 2 == 0 { "thai" } else { "italian" }))
                .collect::<Vec<_>>(),
        );
        let cfg = RecommendationConfig::default();
        let items = compose(Uuid::new_v4(), &pool, &venues, &cfg);

        assert_eq!(items.len(), cfg.feed_size);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.rank, (i + 1) as i32);
        }
        for pair in items.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
    }

    #[test]
    fn test_quota_reserves_slots_for_each_row() {
        // 17 strong taste candidates vs 3 weaker hidden gems: the gems must
        // still make the feed because their quota reserves membership.
        let mut pool: Vec<ScoredCandidate> = (1..=17)
            .map(|i| scored(i, 0.9 - i as f64 * 0.001, FeedRow::Taste))
            .collect();
        pool.extend((100..103).map(|i| scored(i, 0.1, FeedRow::HiddenGem)));
        let mut ids: Vec<(i64, &str)> = (1..=17)
            .map(|i| (i, ["thai", "italian", "mexican", "korean"][i as usize % 4]))
            .collect();
        ids.extend([(100, "peruvian"), (101, "georgian"), (102, "laotian")]);
        let venues = venue_map(&ids);

        let cfg = RecommendationConfig::default();
        let items = compose(Uuid::new_v4(), &pool, &venues, &cfg);
        let gems: Vec<i64> = items
            .iter()
            .filter(|i| i.reason.row == FeedRow::HiddenGem)
            .map(|i| i.venue_id)
            .collect();
        assert_eq!(gems.len(), 3);
    }

    #[test]
    fn test_cuisine_diversity_cap_enforced_when_pool_is_varied() {
        // Three cuisines of 20, all taste row. Cap is ceil(0.35 * 20) = 7,
        // and 3 * 7 >= 20 so the cap never needs relaxing.
        let pool: Vec<ScoredCandidate> = (1..=60)
            .map(|i| scored(i, 1.0 - i as f64 * 0.001, FeedRow::Taste))
            .collect();
        let venues = venue_map(
            &(1..=60)
                .map(|i| {
                    (
                        i,
                        if i <= 20 {
                            "italian"
                        } else if i <= 40 {
                            "thai"
                        } else {
                            "mexican"
                        },
                    )
                })
                .collect::<Vec<_>>(),
        );
        let cfg = RecommendationConfig::default();
        let items = compose(Uuid::new_v4(), &pool, &venues, &cfg);

        assert_eq!(items.len(), cfg.feed_size);
        let cap = ((cfg.diversity_cap * cfg.feed_size as f64).ceil()) as usize;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for item in &items {
            let cuisine = venues[&item.venue_id].cuisine.clone().unwrap();
            *counts.entry(cuisine).or_default() += 1;
        }
        for (cuisine, n) in counts {
            assert!(n <= cap, "{} occupies {} > cap {}", cuisine, n, cap);
        }
    }

    #[test]
    fn test_cap_relaxes_rather_than_shipping_short_feed() {
        // Monoculture pool: everything is italian
        let pool: Vec<ScoredCandidate> = (1..=25)
            .map(|i| scored(i, 1.0 - i as f64 * 0.01, FeedRow::Taste))
            .collect();
        let venues = venue_map(&(1..=25).map(|i| (i, "italian")).collect::<Vec<_>>());
        let cfg = RecommendationConfig::default();
        let items = compose(Uuid::new_v4(), &pool, &venues, &cfg);
        assert_eq!(items.len(), cfg.feed_size);
    }

    #[test]
    fn test_short_pool_yields_short_but_ranked_feed() {
        let pool = vec![
            scored(5, 0.8, FeedRow::Taste),
            scored(2, 0.9, FeedRow::Trending),
        ];
        let venues = venue_map(&[(5, "thai"), (2, "italian")]);
        let cfg = RecommendationConfig::default();
        let items = compose(Uuid::new_v4(), &pool, &venues, &cfg);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].venue_id, 2);
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[1].venue_id, 5);
        assert_eq!(items[1].rank, 2);
    }

    #[test]
    fn test_equal_scores_tie_break_on_lower_venue_id() {
        let pool = vec![
            scored(9, 0.5, FeedRow::Taste),
            scored(3, 0.5, FeedRow::Taste),
        ];
        let venues = venue_map(&[(9, "thai"), (3, "italian")]);
        let cfg = RecommendationConfig::default();
        let items = compose(Uuid::new_v4(), &pool, &venues, &cfg);
        assert_eq!(items[0].venue_id, 3);
        assert_eq!(items[1].venue_id, 9);
    }

    #[test]
    fn test_composition_is_deterministic() {
        let pool: Vec<ScoredCandidate> = (1..=40)
            .map(|i| scored(i, (i as f64 * 7.0).sin().abs(), FeedRow::Taste))
            .collect();
        let venues = venue_map(
            &(1..=40)
                .map(|i| (i, ["thai", "italian", "mexican"][i as usize % 3]))
                .collect::<Vec<_>>(),
        );
        let cfg = RecommendationConfig::default();
        let run = Uuid::new_v4();
        let a = compose(run, &pool, &venues, &cfg);
        let b = compose(run, &pool, &venues, &cfg);
        let ids_a: Vec<i64> = a.iter().map(|i| i.venue_id).collect();
        let ids_b: Vec<i64> = b.iter().map(|i| i.venue_id).collect();
        assert_eq!(ids_a, ids_b);
    }
}
