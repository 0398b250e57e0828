use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EdgeConfig;
use crate::decision::ReasonCode;
use crate::fusion::ConfidenceInterval;
use crate::model::{MarketContract, OrderBook, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptanceMode {
    /// Cheap contract, high model certainty, large edge.
    Asymmetric,
    /// Moderate edge with positive EV.
    Standard,
}

impl AcceptanceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AcceptanceMode::Asymmetric => "asymmetric",
            AcceptanceMode::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeCandidate {
    pub segment_id: String,
    pub contract_id: String,
    pub event_id: String,
    pub side: Side,
    /// Probability that `side` pays out.
    pub model_probability: f64,
    pub confidence_interval: ConfidenceInterval,
    /// Best ask on `side`.
    pub market_price_cents: u32,
    /// Depth-walked average for `recommended_size_hint` contracts.
    pub fill_price_cents: f64,
    pub limit_price_cents: u32,
    pub edge_pct: f64,
    /// Dollars per contract, net of fee on the winning payout.
    pub expected_value: f64,
    pub mode: AcceptanceMode,
    pub recommended_size_hint: u32,
    pub source_count: usize,
    pub settles_at: DateTime<Utc>,
}

impl TradeCandidate {
    pub fn cost_dollars(&self) -> f64 {
        self.fill_price_cents / 100.0
    }

    pub fn implied_probability(&self) -> f64 {
        self.market_price_cents as f64 / 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decline {
    pub side: Option<Side>,
    pub code: ReasonCode,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum EdgeOutcome {
    Accepted(TradeCandidate),
    Declined(Decline),
}

/// Per-side inputs to an evaluation.
pub struct EdgeInput<'a> {
    pub contract: &'a MarketContract,
    pub p_yes: f64,
    pub interval: &'a ConfidenceInterval,
    pub distribution_mean: f64,
    pub book: &'a OrderBook,
    pub size_hint: u32,
    pub source_count: usize,
    /// Raises the standard-mode edge minimum during a drawdown.
    pub edge_multiplier: f64,
}

pub fn edge_pct(probability: f64, cost_dollars: f64) -> f64 {
    (probability - cost_dollars) * 100.0
}

/// EV per $1-payout contract; fee applies to the winning payout only.
pub fn expected_value(probability: f64, cost_dollars: f64, fee_rate: f64) -> f64 {
    let payout = 1.0;
    probability * (payout - cost_dollars - fee_rate * payout) - (1.0 - probability) * cost_dollars
}

pub struct EdgeEvaluator {
    cfg: EdgeConfig,
    depth_penalty_cents: f64,
}

impl EdgeEvaluator {
    pub fn new(cfg: EdgeConfig, depth_penalty_cents: f64) -> Self {
        Self {
            cfg,
            depth_penalty_cents,
        }
    }

    /// Mode check in priority order: asymmetric, then standard.
    pub fn classify(
        &self,
        probability: f64,
        cost_cents: f64,
        edge_multiplier: f64,
    ) -> Result<AcceptanceMode, Decline> {
        let cost = cost_cents / 100.0;
        let edge = edge_pct(probability, cost);
        let ev = expected_value(probability, cost, self.cfg.fee_rate);

        if cost_cents <= self.cfg.asymmetric_max_price_cents as f64
            && probability >= self.cfg.asymmetric_min_probability
            && edge >= self.cfg.asymmetric_min_edge_pct
            && ev > 0.0
        {
            return Ok(AcceptanceMode::Asymmetric);
        }

        let min_edge = self.cfg.min_edge_pct * edge_multiplier.max(1.0);
        if cost_cents > self.cfg.max_buy_price_cents as f64 {
            return Err(Decline {
                side: None,
                code: ReasonCode::EdgePriceAboveCap,
                reason: format!(
                    "cost {:.1}c above cap {}c",
                    cost_cents, self.cfg.max_buy_price_cents
                ),
            });
        }
        if edge < min_edge {
            return Err(Decline {
                side: None,
                code: ReasonCode::EdgeBelowMinimum,
                reason: format!("edge {:.1}% below {:.1}%", edge, min_edge),
            });
        }
        if ev < self.cfg.min_ev {
            return Err(Decline {
                side: None,
                code: ReasonCode::EdgeEvBelowFloor,
                reason: format!("EV ${:.4} below ${:.4}", ev, self.cfg.min_ev),
            });
        }
        Ok(AcceptanceMode::Standard)
    }

    /// Evaluate both sides of a contract and keep the accepted side with the best EV.
    pub fn evaluate(&self, input: &EdgeInput<'_>) -> EdgeOutcome {
        let contract = input.contract;
        if self.cfg.min_distance_from_threshold > 0.0 {
            let distance = contract.strike.distance_from(input.distribution_mean);
            if distance < self.cfg.min_distance_from_threshold {
                return EdgeOutcome::Declined(Decline {
                    side: None,
                    code: ReasonCode::EdgeNearThreshold,
                    reason: format!(
                        "mean {:.1} within {:.1} of strike",
                        input.distribution_mean, self.cfg.min_distance_from_threshold
                    ),
                });
            }
        }

        let mut best: Option<TradeCandidate> = None;
        let mut best_decline: Option<(f64, Decline)> = None;
        for side in Side::BOTH {
            let probability = side.probability(input.p_yes);
            let (Some(best_ask), Some(fill)) = (
                input.book.best_ask(side),
                input
                    .book
                    .walk_fill_price(side, input.size_hint, self.depth_penalty_cents),
            ) else {
                let decline = Decline {
                    side: Some(side),
                    code: ReasonCode::EdgeNoLiquidity,
                    reason: format!("no {} asks", side),
                };
                if best_decline.is_none() {
                    best_decline = Some((f64::NEG_INFINITY, decline));
                }
                continue;
            };

            let cost = fill.cost_dollars();
            let edge = edge_pct(probability, cost);
            match self.classify(probability, fill.avg_price_cents, input.edge_multiplier) {
                Ok(mode) => {
                    let candidate = TradeCandidate {
                        segment_id: contract.segment_id.clone(),
                        contract_id: contract.contract_id.clone(),
                        event_id: contract.event_id.clone(),
                        side,
                        model_probability: probability,
                        confidence_interval: input.interval.for_side(side),
                        market_price_cents: best_ask,
                        fill_price_cents: fill.avg_price_cents,
                        limit_price_cents: fill.limit_price_cents,
                        edge_pct: edge,
                        expected_value: expected_value(probability, cost, self.cfg.fee_rate),
                        mode,
                        recommended_size_hint: input.size_hint.max(1),
                        source_count: input.source_count,
                        settles_at: contract.settles_at,
                    };
                    if best
                        .as_ref()
                        .map(|b| candidate.expected_value > b.expected_value)
                        .unwrap_or(true)
                    {
                        best = Some(candidate);
                    }
                }
                Err(mut decline) => {
                    decline.side = Some(side);
                    decline.reason = format!("{} {}", side, decline.reason);
                    let replace = best_decline
                        .as_ref()
                        .map(|(e, _)| edge > *e)
                        .unwrap_or(true);
                    if replace {
                        best_decline = Some((edge, decline));
                    }
                }
            }
        }

        match (best, best_decline) {
            (Some(candidate), _) => EdgeOutcome::Accepted(candidate),
            (None, Some((_, decline))) => EdgeOutcome::Declined(decline),
            (None, None) => EdgeOutcome::Declined(Decline {
                side: None,
                code: ReasonCode::EdgeNoLiquidity,
                reason: "empty order book".to_string(),
            }),
        }
    }

    /// Edge still carried by a held `side`, priced at what buying it again
    /// would cost now. Falls back to the bid when the side has no asks.
    pub fn holding_edge_pct(&self, side: Side, p_yes: f64, book: &OrderBook) -> Option<f64> {
        let price = book.best_ask(side).or_else(|| book.best_bid(side))?;
        Some(edge_pct(side.probability(p_yes), price as f64 / 100.0))
    }

    /// Holding edge below the standard entry minimum means it is gone.
    pub fn edge_gone(&self, side: Side, p_yes: f64, book: &OrderBook) -> Option<f64> {
        self.holding_edge_pct(side, p_yes, book)
            .filter(|edge| *edge < self.cfg.min_edge_pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ev_formula_matches_hand_computation() {
        // 0.95 * (1 - 0.05 - 0.05) - 0.05 * 0.05
        let ev = expected_value(0.95, 0.05, 0.05);
        assert!((ev - 0.8525).abs() < 1e-12);
        assert!((edge_pct(0.95, 0.05) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_multiplier_raises_standard_edge_minimum() {
        let evaluator = EdgeEvaluator::new(EdgeConfig::default(), 0.1);
        // edge 9%, EV comfortably positive
        assert_eq!(
            evaluator.classify(0.49, 40.0, 1.0),
            Ok(AcceptanceMode::Standard)
        );
        let declined = evaluator.classify(0.49, 40.0, 1.2).unwrap_err();
        assert_eq!(declined.code, ReasonCode::EdgeBelowMinimum);
    }

    #[test]
    fn held_side_loses_edge_when_model_meets_price() {
        use crate::model::PriceLevel;
        let evaluator = EdgeEvaluator::new(EdgeConfig::default(), 0.1);
        let book = OrderBook {
            yes: vec![PriceLevel { price_cents: 60, size: 5 }],
            no: vec![PriceLevel { price_cents: 45, size: 5 }],
        };
        assert!(evaluator.edge_gone(Side::Yes, 0.75, &book).is_none());
        let gone = evaluator.edge_gone(Side::Yes, 0.62, &book).unwrap();
        assert!((gone - 2.0).abs() < 1e-9);

        let one_sided = OrderBook {
            yes: vec![],
            no: vec![PriceLevel { price_cents: 45, size: 5 }],
        };
        // Bid of 55 stands in for the missing YES ask.
        assert!((evaluator.holding_edge_pct(Side::Yes, 0.75, &one_sided).unwrap() - 20.0).abs()
            < 1e-9);
        assert!(evaluator.holding_edge_pct(Side::Yes, 0.75, &OrderBook::default()).is_none());
    }
}
