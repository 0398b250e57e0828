use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::market::market_key;
use super::order::{RestingOrder, Side};

/// Filled holding as reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPosition {
    pub contract_id: String,
    pub side: Side,
    pub count: u32,
    /// Total dollars paid for `count` contracts.
    pub cost_basis: f64,
}

impl GatewayPosition {
    pub fn avg_price_cents(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.cost_basis * 100.0 / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub dollars: f64,
    pub contracts: u32,
}

impl Exposure {
    fn add(&mut self, dollars: f64, contracts: u32) {
        self.dollars += dollars;
        self.contracts = self.contracts.saturating_add(contracts);
    }
}

/// Filled plus resting exposure, aggregated per market key and per contract side.
#[derive(Debug, Clone, Default)]
pub struct ExposureBook {
    by_market: HashMap<String, Exposure>,
    sides_by_contract: HashMap<String, HashSet<Side>>,
    positions: Vec<GatewayPosition>,
}

impl ExposureBook {
    pub fn from_snapshot(positions: &[GatewayPosition], resting: &[RestingOrder]) -> Self {
        let mut book = Self::default();
        for p in positions.iter().filter(|p| p.count > 0) {
            book.by_market
                .entry(market_key(&p.contract_id).to_string())
                .or_default()
                .add(p.cost_basis, p.count);
            book.sides_by_contract
                .entry(p.contract_id.clone())
                .or_default()
                .insert(p.side);
            book.positions.push(p.clone());
        }
        for o in resting.iter().filter(|o| o.remaining > 0) {
            book.by_market
                .entry(market_key(&o.contract_id).to_string())
                .or_default()
                .add(o.remaining as f64 * o.price_cents as f64 / 100.0, o.remaining);
            book.sides_by_contract
                .entry(o.contract_id.clone())
                .or_default()
                .insert(o.side);
        }
        book
    }

    pub fn market(&self, market_key: &str) -> Exposure {
        self.by_market.get(market_key).copied().unwrap_or_default()
    }

    pub fn holds_side(&self, contract_id: &str, side: Side) -> bool {
        self.sides_by_contract
            .get(contract_id)
            .map(|sides| sides.contains(&side))
            .unwrap_or(false)
    }

    pub fn positions(&self) -> &[GatewayPosition] {
        &self.positions
    }

    pub fn markets(&self) -> &HashMap<String, Exposure> {
        &self.by_market
    }
}
