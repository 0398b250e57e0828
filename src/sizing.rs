use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adaptive::SegmentGate;
use crate::config::SizingConfig;
use crate::decision::ReasonCode;
use crate::edge::{expected_value, AcceptanceMode, TradeCandidate};
use crate::model::{OrderBook, Side};
use crate::risk::RiskDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingPath {
    Kelly,
    ConfidenceScore,
}

/// A held or resting position, resolved to its event and segment.
#[derive(Debug, Clone)]
pub struct HeldPosition {
    pub contract_id: String,
    pub event_id: String,
    pub segment_id: Option<String>,
    pub side: Side,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizingBreakdown {
    pub path: SizingPath,
    pub base: f64,
    pub time_decay: f64,
    pub correlation: f64,
    pub adaptive: f64,
    pub drawdown: f64,
    pub cap: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizingDecision {
    pub contracts: u32,
    pub fill_price_cents: f64,
    pub limit_price_cents: u32,
    pub breakdown: Option<SizingBreakdown>,
    pub reason_code: Option<ReasonCode>,
    pub reason: Option<String>,
}

impl SizingDecision {
    fn zero(code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            contracts: 0,
            fill_price_cents: 0.0,
            limit_price_cents: 0,
            breakdown: None,
            reason_code: Some(code),
            reason: Some(reason.into()),
        }
    }
}

pub struct SizingInput<'a> {
    pub candidate: &'a TradeCandidate,
    pub book: &'a OrderBook,
    pub held: &'a [HeldPosition],
    pub bankroll_dollars: f64,
    pub gate: &'a SegmentGate,
    pub risk: &'a RiskDecision,
    pub now: DateTime<Utc>,
}

pub struct PositionSizer {
    cfg: SizingConfig,
    fee_rate: f64,
    max_buy_price_cents: u32,
}

impl PositionSizer {
    pub fn new(cfg: SizingConfig, fee_rate: f64, max_buy_price_cents: u32) -> Self {
        Self {
            cfg,
            fee_rate,
            max_buy_price_cents,
        }
    }

    /// Fractional Kelly share of bankroll; `None` when the bet has no edge.
    pub fn kelly_fraction(
        &self,
        probability: f64,
        cost_dollars: f64,
        mode: AcceptanceMode,
    ) -> Option<f64> {
        if cost_dollars <= 0.0 || cost_dollars >= 1.0 {
            return None;
        }
        let b = (1.0 - cost_dollars - self.fee_rate) / cost_dollars;
        if b <= 0.0 {
            return None;
        }
        let full = (probability * b - (1.0 - probability)) / b;
        if full <= 0.0 {
            return None;
        }
        let scale = match mode {
            AcceptanceMode::Asymmetric => self.cfg.kelly_fraction_asymmetric,
            AcceptanceMode::Standard => self.cfg.kelly_fraction_standard,
        };
        Some((full * scale).min(self.cfg.max_bankroll_fraction))
    }

    /// Heuristic confidence in [0.1, 1] for candidates that miss the Kelly gate.
    pub fn confidence_score(&self, candidate: &TradeCandidate) -> f64 {
        let edge = (candidate.edge_pct / 50.0).min(1.0);
        let tightness = (1.0 - 2.0 * candidate.confidence_interval.width()).max(0.2);
        let sources = (0.3 + 0.2 * candidate.source_count as f64).min(1.0);
        let ev = (0.2 + 1.6 * candidate.expected_value).min(1.0);
        let score = match candidate.mode {
            AcceptanceMode::Asymmetric => 0.4 * edge + 0.2 * tightness + 0.2 * sources + 0.2 * ev,
            AcceptanceMode::Standard => 0.3 * edge + 0.3 * tightness + 0.2 * sources + 0.2 * ev,
        };
        score.clamp(0.1, 1.0)
    }

    fn score_multiplier(&self, score: f64, mode: AcceptanceMode) -> f64 {
        match mode {
            AcceptanceMode::Asymmetric => 1.0 + 4.0 * score,
            AcceptanceMode::Standard => 0.5 + score,
        }
    }

    /// 1.0 up to the full window, linear down to the floor factor.
    pub fn time_decay(&self, hours_to_settlement: f64) -> f64 {
        let full = self.cfg.time_decay_full_hours;
        let floor = self.cfg.time_decay_floor_hours.max(full);
        let min = self.cfg.time_decay_min_factor;
        if hours_to_settlement <= full {
            1.0
        } else if hours_to_settlement >= floor || floor <= full {
            min
        } else {
            1.0 - (1.0 - min) * (hours_to_settlement - full) / (floor - full)
        }
    }

    /// Signed correlation between the candidate and one held position.
    pub fn correlation(&self, candidate: &TradeCandidate, held: &HeldPosition) -> f64 {
        let sign = if candidate.side == held.side { 1.0 } else { -1.0 };
        if held.contract_id == candidate.contract_id {
            return sign;
        }
        if held.event_id == candidate.event_id {
            return 0.95 * sign;
        }
        let Some(held_segment) = held.segment_id.as_deref() else {
            return 0.0;
        };
        if held_segment == candidate.segment_id {
            return 0.5 * sign;
        }
        self.cfg
            .segment_correlations
            .iter()
            .find(|pair| {
                (pair.a == held_segment && pair.b == candidate.segment_id)
                    || (pair.b == held_segment && pair.a == candidate.segment_id)
            })
            .map(|pair| pair.correlation * sign)
            .unwrap_or(0.0)
    }

    /// Shrinks size as correlated holdings accumulate.
    pub fn correlation_discount(&self, candidate: &TradeCandidate, held: &[HeldPosition]) -> f64 {
        let correlated: u32 = held
            .iter()
            .filter(|h| self.correlation(candidate, h) > self.cfg.correlation_threshold)
            .map(|h| h.count)
            .sum();
        let saturation = self.cfg.correlation_saturation_contracts.max(1.0);
        let max = self.cfg.max_correlation_discount;
        1.0 - (correlated as f64 / saturation * max).min(max)
    }

    pub fn size(&self, input: &SizingInput<'_>) -> SizingDecision {
        let candidate = input.candidate;
        if !input.gate.allowed {
            return SizingDecision::zero(
                input.gate.code.unwrap_or(ReasonCode::AdaptiveSegmentDisabled),
                input.gate.reason.clone().unwrap_or_default(),
            );
        }
        if !input.risk.approved {
            return SizingDecision::zero(
                input.risk.reason_code.unwrap_or(ReasonCode::RiskMarketCapExceeded),
                input.risk.reason.clone().unwrap_or_default(),
            );
        }

        let high_confidence = candidate.source_count >= self.cfg.min_sources_for_kelly
            && candidate
                .confidence_interval
                .excludes(candidate.implied_probability());
        let (path, base) = if high_confidence {
            let Some(fraction) = self.kelly_fraction(
                candidate.model_probability,
                candidate.cost_dollars(),
                candidate.mode,
            ) else {
                return SizingDecision::zero(
                    ReasonCode::SizingNonPositiveKelly,
                    format!(
                        "no Kelly edge at p={:.3} cost={:.1}c",
                        candidate.model_probability, candidate.fill_price_cents
                    ),
                );
            };
            (
                SizingPath::Kelly,
                fraction * input.bankroll_dollars / candidate.cost_dollars(),
            )
        } else {
            let score = self.confidence_score(candidate);
            (
                SizingPath::ConfidenceScore,
                (self.cfg.base_contracts as f64 * self.score_multiplier(score, candidate.mode))
                    .round(),
            )
        };

        let hours = (candidate.settles_at - input.now).num_seconds() as f64 / 3600.0;
        let time_decay = self.time_decay(hours);
        let correlation = self.correlation_discount(candidate, input.held);
        let adaptive = input.gate.multiplier;
        let drawdown = input.risk.size_multiplier;
        let adjusted = base * time_decay * correlation * adaptive * drawdown;
        let mut contracts = match path {
            SizingPath::Kelly => adjusted.floor(),
            SizingPath::ConfidenceScore => adjusted.round(),
        }
        .max(0.0) as u32;
        let cap = input.risk.max_contracts;
        contracts = contracts.min(cap);

        let breakdown = SizingBreakdown {
            path,
            base,
            time_decay,
            correlation,
            adaptive,
            drawdown,
            cap,
        };
        if contracts < self.cfg.min_order_contracts.max(1) {
            let mut decision = SizingDecision::zero(
                ReasonCode::SizingBelowMinimum,
                format!("sized to {} contracts (raw {:.2})", contracts, adjusted),
            );
            decision.breakdown = Some(breakdown);
            return decision;
        }

        let min_order = self.cfg.min_order_contracts.max(1);
        let walk = |n: u32| {
            input
                .book
                .walk_fill_price(candidate.side, n, self.cfg.depth_penalty_cents)
        };
        let Some(mut fill) = walk(contracts) else {
            return SizingDecision::zero(
                ReasonCode::SizingEvCollapsedAtSize,
                format!("no {} asks left to fill", candidate.side),
            );
        };
        // Depth raises the average cost; fit the dollar headroom at the walked price.
        let affordable = (input.risk.max_dollars / fill.cost_dollars() + 1e-9).floor() as u32;
        if affordable < contracts {
            contracts = affordable;
            if contracts < min_order {
                let mut decision = SizingDecision::zero(
                    ReasonCode::SizingBelowMinimum,
                    format!("${:.2} headroom buys {} contracts", input.risk.max_dollars, contracts),
                );
                decision.breakdown = Some(breakdown);
                return decision;
            }
            match walk(contracts) {
                Some(smaller) => fill = smaller,
                None => {
                    return SizingDecision::zero(
                        ReasonCode::SizingEvCollapsedAtSize,
                        format!("no {} asks left to fill", candidate.side),
                    )
                }
            }
        }

        let cost = fill.cost_dollars();
        let ev = expected_value(candidate.model_probability, cost, self.fee_rate);
        let within_cap = candidate.mode == AcceptanceMode::Asymmetric
            || fill.avg_price_cents <= self.max_buy_price_cents as f64;
        if ev <= 0.0 || !within_cap {
            let mut decision = SizingDecision::zero(
                ReasonCode::SizingEvCollapsedAtSize,
                format!(
                    "{} contracts fill at {:.2}c, EV ${:.4}",
                    contracts, fill.avg_price_cents, ev
                ),
            );
            decision.breakdown = Some(breakdown);
            return decision;
        }
        SizingDecision {
            contracts,
            fill_price_cents: fill.avg_price_cents,
            limit_price_cents: fill.limit_price_cents,
            breakdown: Some(breakdown),
            reason_code: None,
            reason: None,
        }
    }
}
