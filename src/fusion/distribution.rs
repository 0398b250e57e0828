use serde::Serialize;

use super::bias::{period_bucket, BiasTable};
use super::weighting::{trim_members, WeightedRecord};
use super::{normal_cdf, normal_mass};
use crate::config::FusionConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::Strike;

const MASS_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bin {
    /// May be `-inf` for the lower tail bin.
    pub lower: f64,
    /// May be `+inf` for the upper tail bin.
    pub upper: f64,
    pub mass: f64,
}

impl Bin {
    fn is_finite(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    /// Normal kernel around the fused mean.
    Parametric,
    /// Mixture over pooled ensemble members.
    Empirical,
}

/// Discretized outcome distribution. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbabilityDistribution {
    bins: Vec<Bin>,
    mean: f64,
    spread: f64,
    kind: DistributionKind,
}

impl ProbabilityDistribution {
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn spread(&self) -> f64 {
        self.spread
    }

    pub fn kind(&self) -> DistributionKind {
        self.kind
    }

    pub fn total_mass(&self) -> f64 {
        self.bins.iter().map(|b| b.mass).sum()
    }

    /// P(lo <= X < hi), splitting partially covered bins.
    pub fn probability_between(&self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return 0.0;
        }
        let p: f64 = self
            .bins
            .iter()
            .map(|bin| bin.mass * self.overlap_fraction(bin, lo, hi))
            .sum();
        p.clamp(0.0, 1.0)
    }

    /// Probability that the contract settles YES.
    pub fn probability_of(&self, strike: &Strike) -> f64 {
        match *strike {
            Strike::Above { threshold } => self.probability_between(threshold, f64::INFINITY),
            Strike::Below { threshold } => self.probability_between(f64::NEG_INFINITY, threshold),
            Strike::Between { low, high } => self.probability_between(low, high),
        }
    }

    fn overlap_fraction(&self, bin: &Bin, lo: f64, hi: f64) -> f64 {
        let a = bin.lower.max(lo);
        let b = bin.upper.min(hi);
        if b <= a {
            return 0.0;
        }
        if a == bin.lower && b == bin.upper {
            return 1.0;
        }
        if bin.is_finite() {
            return (b - a) / (bin.upper - bin.lower);
        }
        // Tail bins have no width; split them by the normal shape instead.
        let whole = normal_mass(self.mean, self.spread, bin.lower, bin.upper);
        if whole <= 0.0 {
            return 0.0;
        }
        (normal_mass(self.mean, self.spread, a, b) / whole).clamp(0.0, 1.0)
    }
}

/// Fused view of one (segment, target time): the distribution plus the
/// bias-corrected inputs it was built from.
#[derive(Debug, Clone)]
pub struct FusedEstimate {
    pub distribution: ProbabilityDistribution,
    /// (source_id, corrected point estimate, weight) per retained record.
    pub corrected: Vec<(String, f64, f64)>,
    /// Raw point estimate per source, averaged when a source sent several.
    pub raw_by_source: Vec<(String, f64)>,
    pub weighted_std: f64,
    pub ensemble_std: Option<f64>,
}

impl FusedEstimate {
    pub fn estimates(&self) -> Vec<f64> {
        self.corrected.iter().map(|(_, v, _)| *v).collect()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.corrected.iter().map(|(_, _, w)| *w).collect()
    }

    pub fn source_count(&self) -> usize {
        self.raw_by_source.len()
    }
}

#[derive(Debug, Clone)]
pub struct DistributionBuilder {
    cfg: FusionConfig,
}

impl DistributionBuilder {
    pub fn new(cfg: FusionConfig) -> Self {
        Self { cfg }
    }

    pub fn horizon_floor(&self, hours_to_target: f64) -> f64 {
        self.cfg.horizon_floor_base
            + self.cfg.horizon_floor_per_day * hours_to_target.max(0.0) / 24.0
    }

    /// Fuse weighted records for one segment and target time.
    ///
    /// `segment_floor` is the learned per-segment/season spread floor.
    pub fn build(
        &self,
        segment_id: &str,
        records: &[WeightedRecord],
        bias: &BiasTable,
        segment_floor: f64,
        hours_to_target: f64,
    ) -> EngineResult<FusedEstimate> {
        if records.is_empty() {
            return Err(EngineError::degenerate(segment_id, "no forecast records"));
        }

        let total_weight: f64 = records.iter().map(|r| r.weight.max(0.0)).sum();
        let equal_weights = !(total_weight.is_finite() && total_weight > 1e-12);

        let mut corrected = Vec::with_capacity(records.len());
        // (value, weight) per ensemble member after bias correction
        let mut members: Vec<(f64, f64)> = Vec::new();
        // mixture atoms: ensemble members, or the point itself for point-only sources
        let mut atoms: Vec<(f64, f64)> = Vec::new();
        let mut raw: Vec<(String, f64, usize)> = Vec::new();
        for r in records {
            let rec = &r.record;
            let weight = if equal_weights { 1.0 } else { r.weight.max(0.0) };
            let c = bias.correction(rec.source_id(), segment_id, period_bucket(rec.target_time()));
            corrected.push((rec.source_id().to_string(), rec.point_estimate() - c, weight));
            let trimmed = rec.ensemble_members().map(|m| {
                trim_members(
                    m,
                    self.cfg.outlier_iqr_multiplier,
                    self.cfg.min_records_for_outlier_filter,
                )
            });
            if let Some(m) = trimmed.as_deref().filter(|m| !m.is_empty()) {
                if m.len() < rec.ensemble_members().map_or(0, <[f64]>::len) {
                    tracing::debug!(
                        source = rec.source_id(),
                        segment = %segment_id,
                        kept = m.len(),
                        "outlier ensemble members discarded"
                    );
                }
                let each = weight / m.len() as f64;
                members.extend(m.iter().map(|v| (v - c, each)));
                atoms.extend(m.iter().map(|v| (v - c, each)));
            } else {
                atoms.push((rec.point_estimate() - c, weight));
            }
            match raw.iter_mut().find(|(s, _, _)| s == rec.source_id()) {
                Some((_, sum, n)) => {
                    *sum += rec.point_estimate();
                    *n += 1;
                }
                None => raw.push((rec.source_id().to_string(), rec.point_estimate(), 1)),
            }
        }

        let weight_sum: f64 = corrected.iter().map(|(_, _, w)| w).sum();
        let mean = corrected.iter().map(|(_, v, w)| v * w).sum::<f64>() / weight_sum;
        if !mean.is_finite() {
            return Err(EngineError::degenerate(segment_id, "weighted mean is not finite"));
        }
        let weighted_var = corrected
            .iter()
            .map(|(_, v, w)| w * (v - mean).powi(2))
            .sum::<f64>()
            / weight_sum;
        let weighted_std = weighted_var.sqrt();

        let ensemble_std = pooled_std(&members);
        let spread = [
            weighted_std,
            self.horizon_floor(hours_to_target),
            ensemble_std.unwrap_or(0.0),
            segment_floor,
            self.cfg.min_spread,
        ]
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(0.0_f64, f64::max)
        .max(1e-6);

        let distribution = if members.len() >= 2 {
            self.empirical(segment_id, &atoms, spread, ensemble_std.unwrap_or(0.0))?
        } else {
            self.parametric(segment_id, mean, spread)?
        };

        Ok(FusedEstimate {
            distribution,
            corrected,
            raw_by_source: raw
                .into_iter()
                .map(|(s, sum, n)| (s, sum / n as f64))
                .collect(),
            weighted_std,
            ensemble_std,
        })
    }

    /// Bin edges aligned to the bin width. At most `max_bins` finite bins are
    /// laid out around the mean; the open tails carry the rest.
    fn edges(&self, mean: f64, spread: f64) -> Vec<f64> {
        let width = self.cfg.bin_width;
        let max_bins = self.cfg.max_bins.max(2);
        let span = self.cfg.bin_span_sigmas.max(1.0) * spread;
        let mut lo = ((mean - span) / width).floor() * width;
        let hi = ((mean + span) / width).ceil() * width;
        let wanted = ((hi - lo) / width).round();
        let n = if wanted.is_finite() && wanted <= max_bins as f64 {
            (wanted as usize).max(1)
        } else {
            let half = max_bins / 2;
            lo = (mean / width).round() * width - half as f64 * width;
            half * 2
        };
        (0..=n).map(|i| lo + i as f64 * width).collect()
    }

    fn bins_from<F: Fn(f64, f64) -> f64>(&self, edges: &[f64], mass: F) -> Vec<Bin> {
        let mut bins = Vec::with_capacity(edges.len() + 1);
        let first = edges[0];
        let last = edges[edges.len() - 1];
        bins.push(Bin {
            lower: f64::NEG_INFINITY,
            upper: first,
            mass: mass(f64::NEG_INFINITY, first),
        });
        for pair in edges.windows(2) {
            bins.push(Bin {
                lower: pair[0],
                upper: pair[1],
                mass: mass(pair[0], pair[1]),
            });
        }
        bins.push(Bin {
            lower: last,
            upper: f64::INFINITY,
            mass: mass(last, f64::INFINITY),
        });
        bins
    }

    fn parametric(
        &self,
        segment_id: &str,
        mean: f64,
        spread: f64,
    ) -> EngineResult<ProbabilityDistribution> {
        let edges = self.edges(mean, spread);
        let bins = self.bins_from(&edges, |lo, hi| {
            normal_cdf((hi - mean) / spread) - normal_cdf((lo - mean) / spread)
        });
        normalized(segment_id, bins, mean, spread, DistributionKind::Parametric)
    }

    /// Mixture of narrow normals over pooled members. Point-only sources join
    /// as single atoms. The kernel width tops the mixture variance up to `spread`.
    fn empirical(
        &self,
        segment_id: &str,
        atoms: &[(f64, f64)],
        spread: f64,
        ensemble_std: f64,
    ) -> EngineResult<ProbabilityDistribution> {
        let total: f64 = atoms.iter().map(|(_, w)| w).sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(EngineError::degenerate(segment_id, "ensemble weights are degenerate"));
        }
        let mean = atoms.iter().map(|(v, w)| v * w).sum::<f64>() / total;
        let kernel = (spread * spread - ensemble_std * ensemble_std)
            .max(self.cfg.ensemble_kernel_std.powi(2))
            .sqrt();

        let edges = self.edges(mean, spread);
        let bins = self.bins_from(&edges, |lo, hi| {
            atoms
                .iter()
                .map(|(v, w)| w * normal_mass(*v, kernel, lo, hi))
                .sum::<f64>()
                / total
        });
        normalized(segment_id, bins, mean, spread, DistributionKind::Empirical)
    }
}

fn pooled_std(members: &[(f64, f64)]) -> Option<f64> {
    if members.len() < 2 {
        return None;
    }
    let n = members.len() as f64;
    let mean = members.iter().map(|(v, _)| v).sum::<f64>() / n;
    let var = members.iter().map(|(v, _)| (v - mean).powi(2)).sum::<f64>() / n;
    Some(var.sqrt())
}

fn normalized(
    segment_id: &str,
    mut bins: Vec<Bin>,
    mean: f64,
    spread: f64,
    kind: DistributionKind,
) -> EngineResult<ProbabilityDistribution> {
    for bin in bins.iter_mut() {
        if !bin.mass.is_finite() || bin.mass < 0.0 {
            bin.mass = 0.0;
        }
    }
    let total: f64 = bins.iter().map(|b| b.mass).sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(EngineError::degenerate(segment_id, "distribution has no mass"));
    }
    for bin in bins.iter_mut() {
        bin.mass /= total;
    }
    let dist = ProbabilityDistribution {
        bins,
        mean,
        spread,
        kind,
    };
    debug_assert!((dist.total_mass() - 1.0).abs() < MASS_TOLERANCE);
    Ok(dist)
}
