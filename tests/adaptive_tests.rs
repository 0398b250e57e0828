use std::path::PathBuf;

use chrono::{DateTime, Duration, TimeZone, Utc};

use forecast_edge::adaptive::{SegmentManager, SegmentStatus};
use forecast_edge::config::AdaptiveConfig;
use forecast_edge::decision::ReasonCode;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 14, 12, 0, 0).unwrap()
}

fn temp_dir(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = std::env::temp_dir().join(format!("forecast-edge-adaptive-{}-{}", name, nanos));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn losing_segment(manager: &mut SegmentManager, segment: &str) {
    for i in 0..10 {
        manager
            .record_outcome(segment, i < 3, if i < 3 { 0.5 } else { -0.25 }, t0())
            .unwrap();
    }
}

#[test]
/// Verifies a segment below the win-rate floor is disabled on the very next
/// evaluation and its gate closes with the disabled reason.
fn underperforming_segment_is_disabled_on_next_evaluation() {
    let mut manager = SegmentManager::new(AdaptiveConfig::default()).unwrap();
    losing_segment(&mut manager, "NY");

    let gate = manager.gate("NY", t0()).unwrap();
    assert!(!gate.allowed);
    assert_eq!(gate.multiplier, 0.0);
    assert_eq!(gate.code, Some(ReasonCode::AdaptiveSegmentDisabled));
    assert_eq!(
        manager.state("NY").status,
        SegmentStatus::Disabled {
            until: t0() + Duration::hours(24)
        }
    );
    assert!(manager.gate("MIA", t0()).unwrap().allowed);
}

#[test]
/// Verifies fewer than the minimum trades never disables a segment,
/// however bad the record.
fn small_sample_never_disables() {
    let mut manager = SegmentManager::new(AdaptiveConfig::default()).unwrap();
    for _ in 0..9 {
        manager.record_outcome("PHIL", false, -1.0, t0()).unwrap();
    }
    assert_eq!(manager.evaluate("PHIL", t0()).unwrap(), SegmentStatus::Enabled);
    assert_eq!(manager.position_multiplier("PHIL"), 1.0);
}

#[test]
/// Verifies the trial cycle: after the cooldown the segment trades on a
/// limited allowance, and a good trial re-enables it with counters reset to
/// the trial window.
fn trial_allowance_then_reenable() {
    let cfg = AdaptiveConfig::default();
    let mut manager = SegmentManager::new(cfg.clone()).unwrap();
    losing_segment(&mut manager, "NY");
    manager.evaluate("NY", t0()).unwrap();

    let after = t0() + Duration::hours(25);
    let gate = manager.gate("NY", after).unwrap();
    assert!(gate.allowed);
    assert!(manager.state("NY").trial_mode());

    for _ in 0..cfg.trial_trades {
        manager.record_entry("NY").unwrap();
    }
    let exhausted = manager.gate("NY", after).unwrap();
    assert!(!exhausted.allowed);
    assert_eq!(exhausted.code, Some(ReasonCode::AdaptiveTrialExhausted));

    for i in 0..cfg.trial_trades {
        manager.record_outcome("NY", i % 2 == 0, 0.1, after).unwrap();
    }
    assert_eq!(manager.evaluate("NY", after).unwrap(), SegmentStatus::Enabled);
    let state = manager.state("NY");
    assert_eq!(state.trade_count, cfg.trial_trades);
    assert_eq!(state.win_count, cfg.trial_trades / 2);
    assert!(manager.gate("NY", after).unwrap().allowed);
}

#[test]
/// Verifies a failed trial sends the segment back to a fresh cooldown.
fn failed_trial_disables_again() {
    let mut manager = SegmentManager::new(AdaptiveConfig::default()).unwrap();
    losing_segment(&mut manager, "MIA");
    manager.evaluate("MIA", t0()).unwrap();
    let after = t0() + Duration::hours(25);
    manager.evaluate("MIA", after).unwrap();

    for i in 0..10 {
        manager.record_outcome("MIA", i == 0, -0.2, after).unwrap();
    }
    assert_eq!(
        manager.evaluate("MIA", after).unwrap(),
        SegmentStatus::Disabled {
            until: after + Duration::hours(24)
        }
    );
}

#[test]
/// Verifies segment state survives a restart unchanged.
fn segment_state_round_trips_through_disk() {
    let dir = temp_dir("roundtrip");
    let path = dir.join("segments.json");
    let expected = {
        let mut manager = SegmentManager::open(&path, AdaptiveConfig::default()).unwrap();
        losing_segment(&mut manager, "NY");
        manager.record_outcome("MIA", true, 0.6, t0()).unwrap();
        manager.evaluate("NY", t0()).unwrap();
        manager.snapshot()
    };

    let reloaded = SegmentManager::open(&path, AdaptiveConfig::default()).unwrap();
    assert!(!reloaded.is_corrupt());
    assert_eq!(reloaded.snapshot(), expected);
    assert!(!reloaded.state("NY").enabled());

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
/// Verifies an unparseable state file closes every gate with the
/// inconsistent-state code and is never overwritten.
fn corrupt_state_file_fails_closed() {
    let dir = temp_dir("corrupt");
    let path = dir.join("segments.json");
    std::fs::write(&path, "{ this is not json").unwrap();

    let mut manager = SegmentManager::open(&path, AdaptiveConfig::default()).unwrap();
    assert!(manager.is_corrupt());
    let gate = manager.gate("NY", t0()).unwrap();
    assert!(!gate.allowed);
    assert_eq!(gate.code, Some(ReasonCode::AdaptiveInconsistentState));

    manager.record_outcome("NY", true, 1.0, t0()).unwrap();
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert_eq!(on_disk, "{ this is not json");

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
/// Verifies a single contradictory row is quarantined without affecting other
/// segments, and an explicit reset clears it.
fn contradictory_row_is_quarantined() {
    let dir = temp_dir("quarantine");
    let path = dir.join("segments.json");
    let payload = serde_json::json!({
        "NY": {
            "enabled": false,
            "trial_mode": true,
            "trade_count": 12,
            "win_count": 3,
            "realized_pnl": -4.0,
            "disabled_until": "2026-07-15T12:00:00Z"
        },
        "MIA": {
            "enabled": true,
            "trial_mode": false,
            "trade_count": 4,
            "win_count": 3,
            "realized_pnl": 1.5,
            "disabled_until": null
        }
    });
    std::fs::write(&path, payload.to_string()).unwrap();

    let mut manager = SegmentManager::open(&path, AdaptiveConfig::default()).unwrap();
    assert!(!manager.is_corrupt());
    assert!(manager.inconsistency("NY").is_some());
    let gate = manager.gate("NY", t0()).unwrap();
    assert_eq!(gate.code, Some(ReasonCode::AdaptiveInconsistentState));
    assert!(manager.gate("MIA", t0()).unwrap().allowed);
    assert_eq!(manager.state("MIA").win_count, 3);

    manager.reset_segment("NY").unwrap();
    assert!(manager.gate("NY", t0()).unwrap().allowed);

    let _ = std::fs::remove_dir_all(dir);
}

#[test]
/// Verifies a quarantined row is written back verbatim when another segment
/// changes, so the segment stays blocked after a restart.
fn quarantined_row_survives_rewrite_and_restart() {
    let dir = temp_dir("quarantine-restart");
    let path = dir.join("segments.json");
    let bad_row = serde_json::json!({
        "enabled": false,
        "trial_mode": false,
        "trade_count": 14,
        "win_count": 4,
        "realized_pnl": -6.0,
        "disabled_until": null
    });
    let payload = serde_json::json!({
        "NY": bad_row,
        "LAX": {
            "enabled": true,
            "trial_mode": false,
            "trade_count": 2,
            "win_count": 1,
            "realized_pnl": 0.3,
            "disabled_until": null
        }
    });
    std::fs::write(&path, payload.to_string()).unwrap();

    {
        let mut manager = SegmentManager::open(&path, AdaptiveConfig::default()).unwrap();
        assert!(!manager.gate("NY", t0()).unwrap().allowed);
        manager.record_outcome("LAX", true, 0.4, t0()).unwrap();
        manager.record_outcome("NY", false, -0.5, t0()).unwrap();
    }

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["NY"], bad_row);
    assert_eq!(on_disk["LAX"]["trade_count"], 3);

    let mut reopened = SegmentManager::open(&path, AdaptiveConfig::default()).unwrap();
    let gate = reopened.gate("NY", t0()).unwrap();
    assert!(!gate.allowed);
    assert_eq!(gate.code, Some(ReasonCode::AdaptiveInconsistentState));
    assert_eq!(reopened.state("LAX").trade_count, 3);

    reopened.reset_segment("NY").unwrap();
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["NY"]["enabled"], true);
    assert_eq!(on_disk["NY"]["trade_count"], 0);

    let _ = std::fs::remove_dir_all(dir);
}
