use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::OutcomeRecord;

const BUCKETS: usize = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CalibrationBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_predicted: f64,
    pub observed_rate: f64,
}

/// `count`, `brier` and `win_rate` cover settled rows only; `realized_pnl`
/// also includes positions closed early.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SegmentCalibration {
    pub count: usize,
    pub brier: f64,
    pub win_rate: f64,
    pub realized_pnl: f64,
    pub closed_early: usize,
}

/// Reliability of entry probabilities against settled results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CalibrationReport {
    pub count: usize,
    /// Mean squared error of the entry probability; lower is better.
    pub brier: Option<f64>,
    pub buckets: Vec<CalibrationBucket>,
    /// Positions sold before settlement; excluded from the score.
    pub closed_early: usize,
    pub by_segment: BTreeMap<String, SegmentCalibration>,
}

pub fn calibration_report(records: &[OutcomeRecord]) -> CalibrationReport {
    let mut sums = [(0usize, 0.0f64, 0usize); BUCKETS];
    let mut by_segment: BTreeMap<String, SegmentCalibration> = BTreeMap::new();
    let mut total_sq = 0.0;
    let mut count = 0usize;
    let mut closed_early = 0usize;

    for record in records {
        let seg = by_segment.entry(record.segment_id.clone()).or_default();
        seg.realized_pnl += record.pnl;
        if !record.is_settled() {
            seg.closed_early += 1;
            closed_early += 1;
            continue;
        }
        let p = record.model_probability_at_entry;
        if !p.is_finite() {
            continue;
        }
        let p = p.clamp(0.0, 1.0);
        let outcome = if record.won() { 1.0 } else { 0.0 };
        let sq = (p - outcome).powi(2);
        total_sq += sq;
        count += 1;

        let idx = ((p * BUCKETS as f64) as usize).min(BUCKETS - 1);
        let slot = &mut sums[idx];
        slot.0 += 1;
        slot.1 += p;
        slot.2 += record.won() as usize;

        seg.count += 1;
        seg.brier += sq;
        seg.win_rate += record.won() as usize as f64;
    }

    let buckets = sums
        .iter()
        .enumerate()
        .filter(|(_, (n, _, _))| *n > 0)
        .map(|(i, (n, p_sum, wins))| CalibrationBucket {
            lower: i as f64 / BUCKETS as f64,
            upper: (i + 1) as f64 / BUCKETS as f64,
            count: *n,
            mean_predicted: p_sum / *n as f64,
            observed_rate: *wins as f64 / *n as f64,
        })
        .collect();

    CalibrationReport {
        count,
        brier: (count > 0).then(|| total_sq / count as f64),
        buckets,
        closed_early,
        by_segment: by_segment
            .into_iter()
            .map(|(segment, mut seg)| {
                // Sums so far; turn them into means.
                if seg.count > 0 {
                    seg.brier /= seg.count as f64;
                    seg.win_rate /= seg.count as f64;
                }
                (segment, seg)
            })
            .collect(),
    }
}
