use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};

use forecast_edge::error::EngineError;
use forecast_edge::gateway::{
    with_retry, BreakerState, MarketGateway, MarketSettlement, PaperBook, PaperGateway,
    RetryPolicy, SubmitBreaker,
};
use forecast_edge::model::{MarketContract, OrderBook, OrderRequest, PriceLevel, Side, Strike};

fn paper() -> PaperGateway {
    let contract = MarketContract {
        contract_id: "HIGHNY-26JUL14-T85".to_string(),
        segment_id: "NY".to_string(),
        event_id: "HIGHNY-26JUL14".to_string(),
        strike: Strike::Above { threshold: 85.0 },
        settles_at: Utc.with_ymd_and_hms(2026, 7, 14, 23, 59, 0).unwrap(),
    };
    let mut books = HashMap::new();
    books.insert(
        contract.contract_id.clone(),
        OrderBook {
            yes: vec![
                PriceLevel {
                    price_cents: 30,
                    size: 2,
                },
                PriceLevel {
                    price_cents: 33,
                    size: 5,
                },
            ],
            no: vec![PriceLevel {
                price_cents: 72,
                size: 5,
            }],
        },
    );
    PaperGateway::new(PaperBook {
        markets: vec![contract],
        books,
        settlements: vec![],
    })
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(200),
        max_attempts,
        initial: Duration::from_millis(1),
        max: Duration::from_millis(4),
        factor: 2.0,
    }
}

#[test]
/// Verifies the submit breaker trips after three consecutive failures, blocks
/// submissions while open, and the per-cycle reset closes it again.
fn breaker_trips_after_three_failures_and_resets() {
    let breaker = SubmitBreaker::new(3);
    assert!(!breaker.record_failure("timeout"));
    assert!(!breaker.record_failure("timeout"));
    assert!(breaker.can_submit());
    assert!(breaker.record_failure("timeout"));
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.can_submit());

    breaker.reset();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.can_submit());
    let stats = breaker.stats();
    assert_eq!(stats.total_trips, 1);
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test]
/// Verifies paper fills walk the book up to the limit and the remainder rests.
async fn paper_order_fills_then_rests() {
    let gateway = paper();
    let order = OrderRequest::new("HIGHNY-26JUL14-T85", Side::Yes, 5, 30);
    let ack = gateway.place_order(&order).await.unwrap();
    assert_eq!(ack.filled, 2);
    assert_eq!(ack.client_order_id, order.client_order_id);

    let positions = gateway.get_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].count, 2);
    assert!((positions[0].cost_basis - 0.60).abs() < 1e-9);

    let resting = gateway.get_resting_orders().await.unwrap();
    assert_eq!(resting.len(), 1);
    assert_eq!(resting[0].remaining, 3);
    assert_eq!(resting[0].price_cents, 30);

    let book = gateway.get_orderbook("HIGHNY-26JUL14-T85").await.unwrap();
    assert_eq!(book.best_ask(Side::Yes), Some(33));
}

#[tokio::test]
/// Verifies settled contracts drop out of discovery and are reported once
/// asked for.
async fn paper_settlement_is_reported() {
    let gateway = paper();
    assert_eq!(gateway.list_markets("NY").await.unwrap().len(), 1);
    gateway
        .settle(MarketSettlement {
            contract_id: "HIGHNY-26JUL14-T85".to_string(),
            settled_yes: true,
            actual_value: Some(87.0),
            settled_at: Utc.with_ymd_and_hms(2026, 7, 15, 1, 0, 0).unwrap(),
        })
        .unwrap();
    assert!(gateway.list_markets("NY").await.unwrap().is_empty());
    let settled = gateway
        .get_settlements(&["HIGHNY-26JUL14-T85".to_string()])
        .await
        .unwrap();
    assert_eq!(settled.len(), 1);
    assert!(settled[0].settled_yes);
    assert!(gateway.get_settlements(&[]).await.unwrap().is_empty());
}

#[tokio::test]
/// Verifies recoverable failures are retried with backoff until success.
async fn retry_recovers_from_transient_failures() {
    let calls = AtomicU32::new(0);
    let result = with_retry(&fast_policy(3), "get_orderbook", || {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(EngineError::external("get_orderbook", "flaky"))
            } else {
                Ok(n)
            }
        }
    })
    .await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
/// Verifies retries stop at the attempt limit and non-recoverable errors are
/// returned immediately.
async fn retry_gives_up_and_skips_permanent_errors() {
    let calls = AtomicU32::new(0);
    let exhausted: Result<(), EngineError> = with_retry(&fast_policy(2), "get_orderbook", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(EngineError::external("get_orderbook", "down")) }
    })
    .await;
    assert!(exhausted.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let calls = AtomicU32::new(0);
    let permanent: Result<(), EngineError> = with_retry(&fast_policy(5), "get_orderbook", || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(EngineError::inconsistent("get_orderbook", "bad state")) }
    })
    .await;
    assert!(permanent.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
/// Verifies a hung call is cut off by the per-attempt timeout.
async fn retry_times_out_hung_calls() {
    let policy = RetryPolicy {
        timeout: Duration::from_millis(20),
        ..fast_policy(1)
    };
    let result: Result<(), EngineError> = with_retry(&policy, "get_orderbook", || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("timed out"));
}
