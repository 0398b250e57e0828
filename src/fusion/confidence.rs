use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::normal_mass;
use super::weighting::percentile_sorted;
use crate::model::{Side, Strike};

const PROB_FLOOR: f64 = 0.01;
const PROB_CEIL: f64 = 0.99;

/// 95% bootstrap interval around the fused mean and the YES probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceInterval {
    pub mean_point: f64,
    pub mean_lower: f64,
    pub mean_upper: f64,
    pub prob_point: f64,
    pub prob_lower: f64,
    pub prob_upper: f64,
}

impl ConfidenceInterval {
    pub fn mean_width(&self) -> f64 {
        self.mean_upper - self.mean_lower
    }

    pub fn width(&self) -> f64 {
        self.prob_upper - self.prob_lower
    }

    /// True when the market-implied probability lies outside the interval.
    pub fn excludes(&self, implied_probability: f64) -> bool {
        implied_probability < self.prob_lower || implied_probability > self.prob_upper
    }

    /// Re-express the probability bounds for the given side.
    pub fn for_side(&self, side: Side) -> ConfidenceInterval {
        match side {
            Side::Yes => *self,
            Side::No => ConfidenceInterval {
                prob_point: 1.0 - self.prob_point,
                prob_lower: 1.0 - self.prob_upper,
                prob_upper: 1.0 - self.prob_lower,
                ..*self
            },
        }
    }
}

pub struct BootstrapEstimator {
    samples: usize,
    rng: StdRng,
}

impl BootstrapEstimator {
    /// `seed == 0` draws from system entropy.
    pub fn new(samples: usize, seed: u64) -> Self {
        let rng = if seed > 0 {
            StdRng::seed_from_u64(seed)
        } else {
            StdRng::from_entropy()
        };
        Self {
            samples: samples.max(1),
            rng,
        }
    }

    /// Resample `estimates` with replacement and read the 2.5/97.5 percentiles
    /// of the resampled weighted mean and of the settlement probability.
    pub fn interval(
        &mut self,
        estimates: &[f64],
        weights: &[f64],
        spread: f64,
        strike: &Strike,
    ) -> ConfidenceInterval {
        let point_mean = weighted_mean(estimates, weights, None).unwrap_or(f64::NAN);
        let prob_point = settle_probability(point_mean, spread, strike);

        if estimates.len() < 2 {
            return ConfidenceInterval {
                mean_point: point_mean,
                mean_lower: point_mean,
                mean_upper: point_mean,
                prob_point,
                prob_lower: 0.0,
                prob_upper: 1.0,
            };
        }

        let n = estimates.len();
        let mut means = Vec::with_capacity(self.samples);
        let mut probs = Vec::with_capacity(self.samples);
        let mut idx = vec![0usize; n];
        for _ in 0..self.samples {
            for slot in idx.iter_mut() {
                *slot = self.rng.gen_range(0..n);
            }
            let Some(mean) = weighted_mean(estimates, weights, Some(&idx)) else {
                continue;
            };
            means.push(mean);
            probs.push(settle_probability(mean, spread, strike));
        }
        if means.is_empty() {
            return ConfidenceInterval {
                mean_point: point_mean,
                mean_lower: point_mean,
                mean_upper: point_mean,
                prob_point,
                prob_lower: 0.0,
                prob_upper: 1.0,
            };
        }
        means.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        probs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        ConfidenceInterval {
            mean_point: point_mean,
            mean_lower: percentile_sorted(&means, 0.025),
            mean_upper: percentile_sorted(&means, 0.975),
            prob_point,
            prob_lower: percentile_sorted(&probs, 0.025),
            prob_upper: percentile_sorted(&probs, 0.975),
        }
    }
}

fn weighted_mean(values: &[f64], weights: &[f64], idx: Option<&[usize]>) -> Option<f64> {
    let weight_at = |i: usize| weights.get(i).copied().filter(|w| *w > 0.0).unwrap_or(1.0);
    let (sum, wsum) = match idx {
        Some(idx) => idx.iter().fold((0.0, 0.0), |(s, ws), &i| {
            let w = weight_at(i);
            (s + values[i] * w, ws + w)
        }),
        None => values
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(s, ws), (i, v)| {
                let w = weight_at(i);
                (s + v * w, ws + w)
            }),
    };
    (wsum > 0.0).then(|| sum / wsum).filter(|m| m.is_finite())
}

fn settle_probability(mean: f64, spread: f64, strike: &Strike) -> f64 {
    if !mean.is_finite() {
        return 0.5;
    }
    let p = match *strike {
        Strike::Above { threshold } => normal_mass(mean, spread, threshold, f64::INFINITY),
        Strike::Below { threshold } => normal_mass(mean, spread, f64::NEG_INFINITY, threshold),
        Strike::Between { low, high } => normal_mass(mean, spread, low, high),
    };
    p.clamp(PROB_FLOOR, PROB_CEIL)
}
