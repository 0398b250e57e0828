use chrono::{DateTime, Duration, TimeZone, Utc};

use forecast_edge::adaptive::SegmentGate;
use forecast_edge::config::SizingConfig;
use forecast_edge::decision::ReasonCode;
use forecast_edge::edge::{AcceptanceMode, TradeCandidate};
use forecast_edge::fusion::ConfidenceInterval;
use forecast_edge::model::{OrderBook, PriceLevel, Side};
use forecast_edge::risk::RiskDecision;
use forecast_edge::sizing::{HeldPosition, PositionSizer, SizingInput, SizingPath};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 14, 8, 0, 0).unwrap()
}

fn candidate(source_count: usize, hours_out: i64) -> TradeCandidate {
    TradeCandidate {
        segment_id: "NY".to_string(),
        contract_id: "HIGHNY-26JUL14-T85".to_string(),
        event_id: "HIGHNY-26JUL14".to_string(),
        side: Side::Yes,
        model_probability: 0.80,
        confidence_interval: ConfidenceInterval {
            mean_point: 88.0,
            mean_lower: 87.0,
            mean_upper: 89.0,
            prob_point: 0.80,
            prob_lower: 0.75,
            prob_upper: 0.85,
        },
        market_price_cents: 40,
        fill_price_cents: 40.0,
        limit_price_cents: 40,
        edge_pct: 40.0,
        expected_value: 0.36,
        mode: AcceptanceMode::Standard,
        recommended_size_hint: 1,
        source_count,
        settles_at: now() + Duration::hours(hours_out),
    }
}

fn deep_book() -> OrderBook {
    OrderBook {
        yes: vec![PriceLevel {
            price_cents: 40,
            size: 500,
        }],
        no: vec![],
    }
}

fn open_gate() -> SegmentGate {
    SegmentGate {
        allowed: true,
        multiplier: 1.0,
        code: None,
        reason: None,
    }
}

fn approved(max_contracts: u32, max_dollars: f64, size_multiplier: f64) -> RiskDecision {
    RiskDecision {
        approved: true,
        max_contracts,
        max_dollars,
        size_multiplier,
        reason_code: None,
        reason: None,
    }
}

fn sizer() -> PositionSizer {
    PositionSizer::new(SizingConfig::default(), 0.05, 55)
}

#[test]
/// Verifies the contract cap binds Kelly sizing:
/// a large bankroll still yields at most the per-market contract headroom.
fn kelly_size_is_capped_by_contract_headroom() {
    let c = candidate(3, 6);
    let book = deep_book();
    let gate = open_gate();
    let risk = approved(10, 5.0, 1.0);
    let decision = sizer().size(&SizingInput {
        candidate: &c,
        book: &book,
        held: &[],
        bankroll_dollars: 100.0,
        gate: &gate,
        risk: &risk,
        now: now(),
    });
    assert_eq!(decision.contracts, 10);
    let breakdown = decision.breakdown.expect("breakdown present");
    assert_eq!(breakdown.path, SizingPath::Kelly);
    assert_eq!(breakdown.cap, 10);
}

#[test]
/// Verifies the dollar headroom binds at the walked fill price:
/// $2.00 of room at 40c allows 5 contracts even when the contract cap allows 10.
fn size_never_exceeds_dollar_headroom() {
    let c = candidate(3, 6);
    let book = deep_book();
    let gate = open_gate();
    let risk = approved(10, 2.0, 1.0);
    let decision = sizer().size(&SizingInput {
        candidate: &c,
        book: &book,
        held: &[],
        bankroll_dollars: 100.0,
        gate: &gate,
        risk: &risk,
        now: now(),
    });
    assert_eq!(decision.contracts, 5);
    assert!(decision.contracts as f64 * decision.fill_price_cents / 100.0 <= 2.0 + 1e-9);
}

#[test]
/// Verifies a closed segment gate forces size zero with the gate's reason.
fn disabled_segment_sizes_to_zero() {
    let c = candidate(3, 6);
    let book = deep_book();
    let gate = SegmentGate {
        allowed: false,
        multiplier: 0.0,
        code: Some(ReasonCode::AdaptiveSegmentDisabled),
        reason: Some("disabled".to_string()),
    };
    let risk = approved(10, 5.0, 1.0);
    let decision = sizer().size(&SizingInput {
        candidate: &c,
        book: &book,
        held: &[],
        bankroll_dollars: 100.0,
        gate: &gate,
        risk: &risk,
        now: now(),
    });
    assert_eq!(decision.contracts, 0);
    assert_eq!(decision.reason_code, Some(ReasonCode::AdaptiveSegmentDisabled));
}

#[test]
/// Verifies the drawdown multiplier scales Kelly size:
/// 8 contracts at full size become 4 at a 0.5 multiplier.
fn drawdown_multiplier_scales_size() {
    let c = candidate(3, 6);
    let book = deep_book();
    let gate = open_gate();
    let sized = |multiplier: f64| {
        let risk = approved(20, 50.0, multiplier);
        sizer()
            .size(&SizingInput {
                candidate: &c,
                book: &book,
                held: &[],
                bankroll_dollars: 20.0,
                gate: &gate,
                risk: &risk,
                now: now(),
            })
            .contracts
    };
    assert_eq!(sized(1.0), 8);
    assert_eq!(sized(0.5), 4);
}

#[test]
/// Verifies the low-confidence path: a single source falls back to the
/// confidence score and sizes from the base contract count.
fn single_source_uses_confidence_score() {
    let c = candidate(1, 6);
    let book = deep_book();
    let gate = open_gate();
    let risk = approved(10, 5.0, 1.0);
    let decision = sizer().size(&SizingInput {
        candidate: &c,
        book: &book,
        held: &[],
        bankroll_dollars: 100.0,
        gate: &gate,
        risk: &risk,
        now: now(),
    });
    assert_eq!(decision.contracts, 1);
    let breakdown = decision.breakdown.expect("breakdown present");
    assert_eq!(breakdown.path, SizingPath::ConfidenceScore);
    let score = sizer().confidence_score(&c);
    assert!((0.1..=1.0).contains(&score));
}

#[test]
/// Verifies correlated holdings and distant settlement both shrink size.
fn correlation_and_time_decay_shrink_size() {
    let s = sizer();
    let c = candidate(3, 48);
    let held = vec![HeldPosition {
        contract_id: "HIGHNY-26JUL14-T83".to_string(),
        event_id: "HIGHNY-26JUL14".to_string(),
        segment_id: Some("NY".to_string()),
        side: Side::Yes,
        count: 10,
    }];
    assert!((s.correlation(&c, &held[0]) - 0.95).abs() < 1e-12);
    assert!((s.correlation_discount(&c, &held) - 0.5).abs() < 1e-12);

    let book = deep_book();
    let gate = open_gate();
    let risk = approved(50, 50.0, 1.0);
    let decision = s.size(&SizingInput {
        candidate: &c,
        book: &book,
        held: &held,
        bankroll_dollars: 20.0,
        gate: &gate,
        risk: &risk,
        now: now(),
    });
    let breakdown = decision.breakdown.expect("breakdown present");
    assert!((breakdown.time_decay - 0.75).abs() < 1e-12);
    assert!((breakdown.correlation - 0.5).abs() < 1e-12);
    // floor(8.18 * 0.75 * 0.5)
    assert_eq!(decision.contracts, 3);
}

#[test]
/// Verifies thin books are rechecked at final size: walking into a 90c level
/// pushes the average past the price cap and the trade is dropped.
fn thin_book_collapses_ev_at_size() {
    let c = candidate(3, 6);
    let book = OrderBook {
        yes: vec![
            PriceLevel {
                price_cents: 40,
                size: 1,
            },
            PriceLevel {
                price_cents: 90,
                size: 50,
            },
        ],
        no: vec![],
    };
    let gate = open_gate();
    let risk = approved(10, 5.0, 1.0);
    let decision = sizer().size(&SizingInput {
        candidate: &c,
        book: &book,
        held: &[],
        bankroll_dollars: 100.0,
        gate: &gate,
        risk: &risk,
        now: now(),
    });
    assert_eq!(decision.contracts, 0);
    assert_eq!(decision.reason_code, Some(ReasonCode::SizingEvCollapsedAtSize));
}
