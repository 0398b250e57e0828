use chrono::{TimeZone, Utc};

use forecast_edge::calibration::calibration_report;
use forecast_edge::model::{OutcomeRecord, Side};

fn outcome(contract_id: &str, segment: &str, prob: f64, won: bool) -> OutcomeRecord {
    OutcomeRecord::new(
        contract_id,
        segment,
        Side::Yes,
        40,
        1,
        if won { 100 } else { 0 },
        0.05,
        prob,
        Utc.with_ymd_and_hms(2026, 7, 14, 23, 0, 0).unwrap(),
    )
}

#[test]
/// Verifies the Brier score is the mean squared gap between the entry
/// probability and the settled result.
fn brier_score_over_mixed_outcomes() {
    let records = vec![
        outcome("A-1", "NY", 0.8, true),
        outcome("A-2", "NY", 0.8, false),
        outcome("A-3", "MIA", 0.3, false),
        outcome("A-4", "MIA", 0.3, true),
    ];
    let report = calibration_report(&records);
    assert_eq!(report.count, 4);
    let brier = report.brier.expect("brier present");
    assert!((brier - 0.315).abs() < 1e-9);

    assert_eq!(report.buckets.len(), 2);
    let high = report
        .buckets
        .iter()
        .find(|b| b.lower == 0.8)
        .expect("0.8 bucket");
    assert_eq!(high.count, 2);
    assert!((high.mean_predicted - 0.8).abs() < 1e-9);
    assert!((high.observed_rate - 0.5).abs() < 1e-9);

    let ny = &report.by_segment["NY"];
    assert_eq!(ny.count, 2);
    assert!((ny.brier - 0.34).abs() < 1e-9);
    assert!((ny.win_rate - 0.5).abs() < 1e-9);
}

#[test]
/// Verifies an empty outcome log yields no score rather than zero.
fn empty_log_has_no_score() {
    let report = calibration_report(&[]);
    assert_eq!(report.count, 0);
    assert!(report.brier.is_none());
    assert!(report.buckets.is_empty());
}

#[test]
/// Verifies positions sold before settlement add to realized P&L but stay out
/// of the probability score.
fn early_exits_are_excluded_from_score() {
    let closed_at = Utc.with_ymd_and_hms(2026, 7, 14, 15, 0, 0).unwrap();
    let records = vec![
        outcome("A-1", "NY", 0.8, true),
        OutcomeRecord::closed("A-2", "NY", Side::Yes, 40, 2, 50, 0.05, 0.9, closed_at),
    ];
    let report = calibration_report(&records);
    assert_eq!(report.count, 1);
    assert_eq!(report.closed_early, 1);
    assert!((report.brier.expect("brier present") - 0.04).abs() < 1e-9);

    let ny = &report.by_segment["NY"];
    assert_eq!(ny.count, 1);
    assert_eq!(ny.closed_early, 1);
    assert!((ny.win_rate - 1.0).abs() < 1e-9);
    // settled: 1.00 - 0.40 - 0.05; exit: 2 * 0.50 - 0.80 - 0.05
    assert!((ny.realized_pnl - (0.55 + 0.15)).abs() < 1e-9);
}
