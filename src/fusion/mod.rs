pub mod bias;
pub mod confidence;
pub mod distribution;
pub mod spread_floor;
pub mod weighting;

pub use bias::{period_bucket, BiasKey, BiasTable};
pub use confidence::{BootstrapEstimator, ConfidenceInterval};
pub use distribution::{
    Bin, DistributionBuilder, DistributionKind, FusedEstimate, ProbabilityDistribution,
};
pub use spread_floor::{Season, SpreadFloorTable};
pub use weighting::{filter_outliers, quartiles, trim_members, SourceWeighting, WeightedRecord};

pub fn normal_cdf(x: f64) -> f64 {
    if x == f64::INFINITY {
        return 1.0;
    }
    if x == f64::NEG_INFINITY {
        return 0.0;
    }
    0.5 * (1.0 + erf_approx(x / 2f64.sqrt()))
}

/// Mass of N(mean, sd) on [lo, hi). Bounds may be infinite.
pub fn normal_mass(mean: f64, sd: f64, lo: f64, hi: f64) -> f64 {
    let sd = sd.max(1e-9);
    (normal_cdf((hi - mean) / sd) - normal_cdf((lo - mean) / sd)).max(0.0)
}

// Abramowitz-Stegun 7.1.26, absolute error below 1.5e-7.
fn erf_approx(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let y = 1.0 - (((((a5 * t + a4) * t + a3) * t + a2) * t + a1) * t * (-x * x).exp());
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_cdf_is_symmetric_and_bounded() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
        assert_eq!(normal_cdf(f64::INFINITY), 1.0);
        assert!((normal_mass(70.0, 2.0, f64::NEG_INFINITY, f64::INFINITY) - 1.0).abs() < 1e-9);
    }
}
