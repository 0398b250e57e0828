use chrono::{DateTime, Duration, TimeZone, Utc};

use forecast_edge::config::Config;
use forecast_edge::fusion::period_bucket;
use forecast_edge::model::Side;
use forecast_edge::persistence::OutcomeLog;
use forecast_edge::risk::RiskGovernor;
use forecast_edge::settlement::{
    EntryContext, SettlementEvent, SettlementOutcome, SettlementProcessor,
};
use forecast_edge::state::LearningState;

fn target() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 14, 21, 0, 0).unwrap()
}

fn entry(contract_id: &str, side: Side, price: u32) -> EntryContext {
    EntryContext {
        contract_id: contract_id.to_string(),
        segment_id: "NY".to_string(),
        side,
        entry_price_cents: price,
        contracts: 3,
        model_probability: 0.72,
        fused_mean: 86.5,
        source_estimates: vec![("nws".to_string(), 87.0), ("ens".to_string(), 85.0)],
        target_time: target(),
        entered_at: None,
    }
}

fn event(entry: EntryContext, settled_yes: bool, actual: Option<f64>) -> SettlementEvent {
    SettlementEvent {
        entry,
        settled_yes,
        actual_value: actual,
        settled_at: target() + Duration::hours(3),
    }
}

fn fixture() -> (Config, SettlementProcessor, LearningState, RiskGovernor) {
    let config = Config::default();
    let processor = SettlementProcessor::new(
        OutcomeLog::open_in_memory().expect("in-memory log"),
        config.edge.fee_rate,
        config.fusion.max_source_rmse,
    );
    let state = LearningState::in_memory(&config, target()).expect("state");
    let governor = RiskGovernor::new(config.risk.clone()).expect("governor");
    (config, processor, state, governor)
}

#[test]
/// Verifies a settlement updates every learned table exactly once:
/// segment counters, the risk ledger, and per-source bias history.
fn settlement_updates_learning_state() {
    let (_, processor, mut state, governor) = fixture();
    let ev = event(entry("HIGHNY-26JUL14-T85", Side::Yes, 40), true, Some(86.0));

    let outcome = processor.apply(&ev, &mut state, &governor).unwrap();
    let SettlementOutcome::Applied(record) = outcome else {
        panic!("first settlement must apply");
    };
    assert!(record.won());
    // 3 * (1.00 - 0.40) - 3 * 0.05
    assert!((record.pnl - 1.65).abs() < 1e-9);

    let segment = state.segments.state("NY");
    assert_eq!(segment.trade_count, 1);
    assert_eq!(segment.win_count, 1);
    assert!((state.risk.state().daily_realized_pnl - 1.65).abs() < 1e-9);
    assert_eq!(state.risk.state().consecutive_losses, 0);

    let bucket = period_bucket(target());
    let key = forecast_edge::fusion::BiasKey::new("nws", "NY", bucket);
    let history = state.bias.entry(&key).expect("bias history for nws");
    assert_eq!(history.errors.len(), 1);
    assert!((history.errors[0] - 1.0).abs() < 1e-9);
    assert_eq!(processor.log().count().unwrap(), 1);
}

#[test]
/// Verifies settlement replay is idempotent: applying the same event twice
/// leaves trade counts, bias history and risk counters unchanged.
fn replayed_settlement_is_a_no_op() {
    let (_, processor, mut state, governor) = fixture();
    let ev = event(entry("HIGHNY-26JUL14-T85", Side::Yes, 40), false, Some(84.0));

    assert!(matches!(
        processor.apply(&ev, &mut state, &governor).unwrap(),
        SettlementOutcome::Applied(_)
    ));
    let segments_before = state.segments.snapshot();
    let risk_before = state.risk.state().clone();
    let bucket = period_bucket(target());
    let key = forecast_edge::fusion::BiasKey::new("ens", "NY", bucket);
    let bias_before = state.bias.entry(&key).cloned();

    assert_eq!(
        processor.apply(&ev, &mut state, &governor).unwrap(),
        SettlementOutcome::Duplicate
    );
    assert_eq!(state.segments.snapshot(), segments_before);
    assert_eq!(state.risk.state(), &risk_before);
    assert_eq!(state.bias.entry(&key).cloned(), bias_before);
    assert_eq!(processor.log().count().unwrap(), 1);
}

#[test]
/// Verifies NO-side entries settle on the inverse outcome and a loss feeds
/// the losing streak.
fn no_side_loss_counts_against_streak() {
    let (_, processor, mut state, governor) = fixture();
    let ev = event(entry("HIGHNY-26JUL14-T85", Side::No, 30), true, None);
    assert_eq!(ev.settlement_value_cents(), 0);

    let SettlementOutcome::Applied(record) = processor.apply(&ev, &mut state, &governor).unwrap()
    else {
        panic!("settlement must apply");
    };
    assert!(!record.won());
    assert!((record.pnl + 0.9).abs() < 1e-9);
    assert_eq!(state.risk.state().consecutive_losses, 1);
    assert_eq!(state.segments.state("NY").win_count, 0);
    // no observed value: bias tables untouched
    assert!(state.bias.is_empty());
}

#[test]
/// Verifies distinct holdings on the same contract settle independently.
fn different_entries_on_same_contract_both_apply() {
    let (_, processor, mut state, governor) = fixture();
    let first = event(entry("HIGHNY-26JUL14-T85", Side::Yes, 40), true, None);
    let second = event(entry("HIGHNY-26JUL14-T85", Side::Yes, 35), true, None);
    assert!(matches!(
        processor.apply(&first, &mut state, &governor).unwrap(),
        SettlementOutcome::Applied(_)
    ));
    assert!(matches!(
        processor.apply(&second, &mut state, &governor).unwrap(),
        SettlementOutcome::Applied(_)
    ));
    assert_eq!(state.segments.state("NY").trade_count, 2);
    assert_eq!(processor.log().all().unwrap().len(), 2);
}

#[test]
/// Verifies a state directory that cannot be written still leaves every
/// in-memory table updated, so a later replay is safe to skip.
fn persist_failure_still_updates_segment_and_risk() {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let root = std::env::temp_dir().join(format!("forecast-edge-settle-blocked-{}", nanos));
    std::fs::create_dir_all(&root).expect("create temp dir");
    // A regular file where the state directory's parent should be.
    let blocker = root.join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let mut config = Config::default();
    config.persistence.state_dir = blocker.join("state").to_string_lossy().into_owned();
    let mut state = LearningState::open(&config, target()).expect("open with missing files");
    let processor = SettlementProcessor::new(
        OutcomeLog::open_in_memory().expect("in-memory log"),
        config.edge.fee_rate,
        config.fusion.max_source_rmse,
    );
    let governor = RiskGovernor::new(config.risk.clone()).expect("governor");
    let ev = event(entry("HIGHNY-26JUL14-T85", Side::Yes, 40), false, Some(84.0));

    let err = processor.apply(&ev, &mut state, &governor).unwrap_err();
    assert!(format!("{err:#}").contains("failed to persist"));
    assert_eq!(state.segments.state("NY").trade_count, 1);
    assert_eq!(state.risk.state().consecutive_losses, 1);
    let key = forecast_edge::fusion::BiasKey::new("nws", "NY", period_bucket(target()));
    assert_eq!(state.bias.entry(&key).map(|e| e.errors.len()), Some(1));

    assert_eq!(
        processor.apply(&ev, &mut state, &governor).unwrap(),
        SettlementOutcome::Duplicate
    );
    assert_eq!(state.segments.state("NY").trade_count, 1);
    assert_eq!(state.risk.state().consecutive_losses, 1);

    let _ = std::fs::remove_dir_all(root);
}
