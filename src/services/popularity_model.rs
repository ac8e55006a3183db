use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::{ExpectedPopularityRecord, PopularityCounters, PopularitySource, Venue};

/// Which regression family backs the expected-popularity baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressorKind {
    Ridge,
    GradientBoosted,
}

/// Pluggable fit/predict strategy. Callers depend only on this interface so
/// the model family can change without touching the scorer or orchestrator.
pub trait PopularityRegressor: Send + Sync {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> AppResult<()>;
    fn predict_row(&self, x: &Array1<f64>) -> f64;
}

pub fn regressor_for(kind: RegressorKind) -> Box<dyn PopularityRegressor> {
    match kind {
        RegressorKind::Ridge => Box::new(RidgeRegressor::new(1.0)),
        RegressorKind::GradientBoosted => Box::new(GradientBoostedStumps::new(200, 0.1)),
    }
}

/// Maps structural venue attributes onto a dense feature vector. Categorical
/// vocabularies (cuisine, category, area token) are frozen at fit time;
/// unseen values one-hot to all zeros.
pub struct FeatureSpace {
    cuisines: Vec<String>,
    categories: Vec<String>,
    areas: Vec<String>,
}

impl FeatureSpace {
    pub fn from_venues(venues: &[Venue]) -> Self {
        let mut cuisines: Vec<String> = venues
            .iter()
            .filter_map(|v| v.cuisine.clone())
            .map(|c| c.to_lowercase())
            .collect();
        cuisines.sort();
        cuisines.dedup();

        let mut categories: Vec<String> = venues
            .iter()
            .filter_map(|v| v.category.clone())
            .map(|c| c.to_lowercase())
            .collect();
        categories.sort();
        categories.dedup();

        let mut areas: Vec<String> = venues.iter().map(|v| v.area_token()).collect();
        areas.sort();
        areas.dedup();

        Self {
            cuisines,
            categories,
            areas,
        }
    }

    pub fn dim(&self) -> usize {
        // bias, price tier, three schedule flags, then the one-hot blocks
        5 + self.cuisines.len() + self.categories.len() + self.areas.len()
    }

    pub fn vectorize(&self, venue: &Venue) -> Array1<f64> {
        let mut x = Array1::zeros(self.dim());
        x[0] = 1.0;
        x[1] = venue.price_tier.map(f64::from).unwrap_or(2.0);
        x[2] = f64::from(u8::from(venue.open_late));
        x[3] = f64::from(u8::from(venue.open_early));
        x[4] = f64::from(u8::from(venue.open_sunday));

        let mut offset = 5;
        if let Some(cuisine) = venue.cuisine.as_deref() {
            let cuisine = cuisine.to_lowercase();
            if let Ok(i) = self.cuisines.binary_search(&cuisine) {
                x[offset + i] = 1.0;
            }
        }
        offset += self.cuisines.len();
        if let Some(category) = venue.category.as_deref() {
            let category = category.to_lowercase();
            if let Ok(i) = self.categories.binary_search(&category) {
                x[offset + i] = 1.0;
            }
        }
        offset += self.categories.len();
        if let Ok(i) = self.areas.binary_search(&venue.area_token()) {
            x[offset + i] = 1.0;
        }
        x
    }
}

/// Ridge regression solved by the normal equations (X'X + lambda I) w = X'y
pub struct RidgeRegressor {
    lambda: f64,
    weights: Option<Array1<f64>>,
}

impl RidgeRegressor {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda,
            weights: None,
        }
    }
}

impl PopularityRegressor for RidgeRegressor {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> AppResult<()> {
        let d = x.ncols();
        let mut gram = x.t().dot(x);
        for i in 0..d {
            gram[[i, i]] += self.lambda;
        }
        let xty = x.t().dot(y);
        let weights = gauss_solve(gram, xty)
            .ok_or_else(|| AppError::Internal("singular design matrix in ridge fit".to_string()))?;
        self.weights = Some(weights);
        Ok(())
    }

    fn predict_row(&self, x: &Array1<f64>) -> f64 {
        match &self.weights {
            Some(w) => w.dot(x),
            None => 0.0,
        }
    }
}

/// Solves `a w = b` by Gaussian elimination with partial pivoting.
/// Returns None when the matrix is effectively singular.
fn gauss_solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[[i, col]]
                .abs()
                .partial_cmp(&a[[j, col]].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([pivot, k], [col, k]);
            }
            b.swap(pivot, col);
        }
        for row in (col + 1)..n {
            let factor = a[[row, col]] / a[[col, col]];
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut w = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[[row, k]] * w[k];
        }
        w[row] = sum / a[[row, row]];
    }
    Some(w)
}

#[derive(Debug, Clone)]
struct Stump {
    feature: usize,
    threshold: f64,
    left: f64,
    right: f64,
}

impl Stump {
    fn predict(&self, x: &Array1<f64>) -> f64 {
        if x[self.feature] <= self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

/// Gradient-boosted depth-1 trees over squared error. Deterministic: split
/// candidates are quantile midpoints over each feature.
pub struct GradientBoostedStumps {
    rounds: usize,
    learning_rate: f64,
    base: f64,
    stumps: Vec<Stump>,
}

impl GradientBoostedStumps {
    pub fn new(rounds: usize, learning_rate: f64) -> Self {
        Self {
            rounds,
            learning_rate,
            base: 0.0,
            stumps: Vec::new(),
        }
    }

    fn best_stump(x: &Array2<f64>, residual: &Array1<f64>) -> Option<Stump> {
        const MAX_SPLITS: usize = 8;
        let n = x.nrows();
        let mut best: Option<(f64, Stump)> = None;

        for feature in 0..x.ncols() {
            let mut values: Vec<f64> = (0..n).map(|i| x[[i, feature]]).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            values.dedup();
            if values.len() < 2 {
                continue;
            }
            let step = (values.len() - 1).div_ceil(MAX_SPLITS).max(1);
            for pair in values.windows(2).step_by(step) {
                let threshold = (pair[0] + pair[1]) / 2.0;
                let (mut left_sum, mut left_n, mut right_sum, mut right_n) = (0.0, 0usize, 0.0, 0usize);
                for i in 0..n {
                    if x[[i, feature]] <= threshold {
                        left_sum += residual[i];
                        left_n += 1;
                    } else {
                        right_sum += residual[i];
                        right_n += 1;
                    }
                }
                if left_n == 0 || right_n == 0 {
                    continue;
                }
                let left = left_sum / left_n as f64;
                let right = right_sum / right_n as f64;
                let mut sse = 0.0;
                for i in 0..n {
                    let pred = if x[[i, feature]] <= threshold { left } else { right };
                    sse += (residual[i] - pred).powi(2);
                }
                if best.as_ref().map(|(s, _)| sse < *s).unwrap_or(true) {
                    best = Some((
                        sse,
                        Stump {
                            feature,
                            threshold,
                            left,
                            right,
                        },
                    ));
                }
            }
        }
        best.map(|(_, stump)| stump)
    }
}

impl PopularityRegressor for GradientBoostedStumps {
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> AppResult<()> {
        let n = x.nrows();
        if n == 0 {
            return Err(AppError::Internal("empty training set".to_string()));
        }
        self.base = y.mean().unwrap_or(0.0);
        self.stumps.clear();
        let mut residual = y - self.base;

        for _ in 0..self.rounds {
            let Some(stump) = Self::best_stump(x, &residual) else {
                break;
            };
            for i in 0..n {
                let row = x.row(i).to_owned();
                residual[i] -= self.learning_rate * stump.predict(&row);
            }
            self.stumps.push(stump);
        }
        Ok(())
    }

    fn predict_row(&self, x: &Array1<f64>) -> f64 {
        self.base
            + self
                .stumps
                .iter()
                .map(|s| self.learning_rate * s.predict(x))
                .sum::<f64>()
    }
}

/// Fits the expected-popularity baseline over all venues and returns one
/// record per venue with `residual = log1p(observed) - expected`.
///
/// The observed channel is selected by `source` and never mixed. Below
/// `min_rows` training venues the fit is refused with
/// `InsufficientTrainingData`; the caller keeps the prior snapshot and flags
/// it stale instead of crashing the pipeline.
pub fn fit_expected_popularity(
    venues: &[Venue],
    counters: &HashMap<i64, PopularityCounters>,
    source: PopularitySource,
    kind: RegressorKind,
    min_rows: usize,
    model_version: i32,
    now: DateTime<Utc>,
) -> AppResult<Vec<ExpectedPopularityRecord>> {
    let observed: Vec<(usize, f64)> = venues
        .iter()
        .enumerate()
        .map(|(i, venue)| {
            let count = match source {
                PopularitySource::GoogleRatings => venue.rating_count,
                PopularitySource::InAppSaves => counters
                    .get(&venue.id)
                    .map(|c| c.app_saves)
                    .unwrap_or(0),
            };
            (i, (count.max(0) as f64).ln_1p())
        })
        .collect();

    if observed.len() < min_rows {
        return Err(AppError::InsufficientTrainingData {
            got: observed.len(),
            need: min_rows,
        });
    }

    let space = FeatureSpace::from_venues(venues);
    let mut x = Array2::zeros((observed.len(), space.dim()));
    let mut y = Array1::zeros(observed.len());
    for (row, &(venue_idx, target)) in observed.iter().enumerate() {
        x.row_mut(row).assign(&space.vectorize(&venues[venue_idx]));
        y[row] = target;
    }

    let mut model = regressor_for(kind);
    model.fit(&x, &y)?;

    tracing::info!(
        rows = observed.len(),
        features = space.dim(),
        source = ?source,
        version = model_version,
        "Expected-popularity model fitted"
    );

    Ok(observed
        .iter()
        .map(|&(venue_idx, target)| {
            let venue = &venues[venue_idx];
            let expected = model.predict_row(&space.vectorize(venue));
            ExpectedPopularityRecord {
                venue_id: venue.id,
                expected_popularity: expected,
                residual_popularity: target - expected,
                model_version,
                stale: false,
                computed_at: now,
            }
        })
        .collect())
}
