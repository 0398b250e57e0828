use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::order::Side;

/// Settlement condition on the underlying value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strike {
    Above { threshold: f64 },
    Below { threshold: f64 },
    Between { low: f64, high: f64 },
}

impl Strike {
    pub fn thresholds(&self) -> Vec<f64> {
        match *self {
            Strike::Above { threshold } | Strike::Below { threshold } => vec![threshold],
            Strike::Between { low, high } => vec![low, high],
        }
    }

    /// Whether an observed value settles this contract YES.
    pub fn settles_yes(&self, value: f64) -> bool {
        match *self {
            Strike::Above { threshold } => value > threshold,
            Strike::Below { threshold } => value < threshold,
            Strike::Between { low, high } => value >= low && value <= high,
        }
    }

    /// Distance from `value` to the nearest strike boundary.
    pub fn distance_from(&self, value: f64) -> f64 {
        self.thresholds()
            .into_iter()
            .map(|t| (value - t).abs())
            .fold(f64::INFINITY, f64::min)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContract {
    pub contract_id: String,
    pub segment_id: String,
    /// Groups sibling contracts that settle on the same observation.
    pub event_id: String,
    pub strike: Strike,
    pub settles_at: DateTime<Utc>,
}

impl MarketContract {
    pub fn target_date(&self) -> NaiveDate {
        self.settles_at.date_naive()
    }
}

/// Market key used for per-market caps: the contract id without its strike suffix.
pub fn market_key(contract_id: &str) -> &str {
    match contract_id.rsplit_once('-') {
        Some((event, _)) if !event.is_empty() => event,
        _ => contract_id,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price_cents: u32,
    pub size: u32,
}

/// Asks per side, ascending by price.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub yes: Vec<PriceLevel>,
    pub no: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillEstimate {
    pub avg_price_cents: f64,
    /// Limit price that would sweep the whole requested size.
    pub limit_price_cents: u32,
    pub available_depth: u32,
}

impl FillEstimate {
    pub fn cost_dollars(&self) -> f64 {
        self.avg_price_cents / 100.0
    }
}

impl OrderBook {
    pub fn asks(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    pub fn best_ask(&self, side: Side) -> Option<u32> {
        self.asks(side)
            .iter()
            .filter(|l| l.size > 0 && (1..=99).contains(&l.price_cents))
            .map(|l| l.price_cents)
            .min()
    }

    /// Best price a holder of `side` can sell at: a resting ask on the
    /// opposite side at `p` is a bid on this side at `100 - p`.
    pub fn best_bid(&self, side: Side) -> Option<u32> {
        self.best_ask(side.opposite())
            .map(|p| 100 - p)
            .filter(|p| (1..=99).contains(p))
    }

    /// Contracts of `side` a seller can hit at `price_cents` or better.
    pub fn bid_depth_at_or_above(&self, side: Side, price_cents: u32) -> u32 {
        self.asks(side.opposite())
            .iter()
            .filter(|l| l.size > 0 && (1..=99).contains(&l.price_cents))
            .filter(|l| 100 - l.price_cents >= price_cents)
            .map(|l| l.size)
            .sum()
    }

    /// Average fill price for `count` contracts walking the ask depth.
    /// Contracts beyond visible depth are priced at the worst level plus
    /// `depth_penalty_cents` per extra contract.
    pub fn walk_fill_price(
        &self,
        side: Side,
        count: u32,
        depth_penalty_cents: f64,
    ) -> Option<FillEstimate> {
        let mut levels: Vec<PriceLevel> = self
            .asks(side)
            .iter()
            .copied()
            .filter(|l| l.size > 0 && (1..=99).contains(&l.price_cents))
            .collect();
        if levels.is_empty() {
            return None;
        }
        levels.sort_by_key(|l| l.price_cents);
        let count = count.max(1);

        let mut remaining = count;
        let mut total_cents = 0.0;
        let mut worst = levels[0].price_cents as f64;
        let mut depth = 0u32;
        for level in &levels {
            depth = depth.saturating_add(level.size);
            if remaining == 0 {
                continue;
            }
            let take = remaining.min(level.size);
            total_cents += take as f64 * level.price_cents as f64;
            worst = level.price_cents as f64;
            remaining -= take;
        }
        for k in 1..=remaining {
            let price = (worst + depth_penalty_cents * k as f64).min(99.0);
            total_cents += price;
        }
        if remaining > 0 {
            worst = (worst + depth_penalty_cents * remaining as f64).min(99.0);
        }

        Some(FillEstimate {
            avg_price_cents: total_cents / count as f64,
            limit_price_cents: (worst.ceil() as u32).clamp(1, 99),
            available_depth: depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        OrderBook {
            yes: vec![
                PriceLevel { price_cents: 10, size: 3 },
                PriceLevel { price_cents: 12, size: 2 },
            ],
            no: vec![],
        }
    }

    #[test]
    fn walk_within_top_level_uses_best_ask() {
        let est = book().walk_fill_price(Side::Yes, 2, 0.1).unwrap();
        assert!((est.avg_price_cents - 10.0).abs() < 1e-9);
        assert_eq!(est.limit_price_cents, 10);
        assert_eq!(est.available_depth, 5);
    }

    #[test]
    fn walk_across_levels_averages_depth() {
        let est = book().walk_fill_price(Side::Yes, 5, 0.1).unwrap();
        assert!((est.avg_price_cents - 10.8).abs() < 1e-9);
        assert_eq!(est.limit_price_cents, 12);
    }

    #[test]
    fn walk_beyond_depth_adds_penalty() {
        let est = book().walk_fill_price(Side::Yes, 7, 0.5).unwrap();
        // 3@10 + 2@12 + 12.5 + 13.0
        assert!((est.avg_price_cents - (30.0 + 24.0 + 12.5 + 13.0) / 7.0).abs() < 1e-9);
        assert_eq!(est.limit_price_cents, 13);
    }

    #[test]
    fn empty_side_has_no_estimate() {
        assert!(book().walk_fill_price(Side::No, 1, 0.1).is_none());
        assert_eq!(book().best_ask(Side::No), None);
    }

    #[test]
    fn bid_is_complement_of_opposite_ask() {
        assert_eq!(book().best_bid(Side::No), Some(90));
        assert_eq!(book().best_bid(Side::Yes), None);
        assert_eq!(book().bid_depth_at_or_above(Side::No, 89), 3);
        assert_eq!(book().bid_depth_at_or_above(Side::No, 88), 5);
    }

    #[test]
    fn market_key_strips_strike_suffix() {
        assert_eq!(market_key("HIGHNY-26OCT19-B71.5"), "HIGHNY-26OCT19");
        assert_eq!(market_key("PLAIN"), "PLAIN");
    }

    #[test]
    fn strike_settlement_and_distance() {
        let range = Strike::Between { low: 70.0, high: 71.0 };
        assert!(range.settles_yes(70.5));
        assert!(!range.settles_yes(72.0));
        assert!((range.distance_from(73.0) - 2.0).abs() < 1e-9);
        assert!(Strike::Above { threshold: 80.0 }.settles_yes(81.0));
        assert!(Strike::Below { threshold: 40.0 }.settles_yes(39.0));
    }
}
