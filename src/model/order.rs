use std::fmt;

use serde::{Deserialize, Serialize};

/// Binary contract side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Yes, Side::No];

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    /// Probability that this side pays out, given P(YES).
    pub fn probability(self, p_yes: f64) -> f64 {
        match self {
            Side::Yes => p_yes,
            Side::No => 1.0 - p_yes,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Yes => write!(f, "YES"),
            Side::No => write!(f, "NO"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    #[default]
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "buy",
            OrderAction::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub contract_id: String,
    pub side: Side,
    #[serde(default)]
    pub action: OrderAction,
    pub count: u32,
    /// Limit price in cents, 1..=99.
    pub price_cents: u32,
}

impl OrderRequest {
    pub fn new(contract_id: &str, side: Side, count: u32, price_cents: u32) -> Self {
        Self {
            client_order_id: format!("fe-{}", &uuid::Uuid::new_v4().to_string()[..12]),
            contract_id: contract_id.to_string(),
            side,
            action: OrderAction::Buy,
            count,
            price_cents: price_cents.clamp(1, 99),
        }
    }

    /// Sell `count` held contracts of `side` at no less than `price_cents`.
    pub fn sell(contract_id: &str, side: Side, count: u32, price_cents: u32) -> Self {
        Self {
            action: OrderAction::Sell,
            ..Self::new(contract_id, side, count, price_cents)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    /// Contracts filled immediately. A buy remainder rests on the book; a sell
    /// remainder is cancelled.
    pub filled: u32,
    /// Average price of the immediate fill.
    #[serde(default)]
    pub avg_price_cents: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestingOrder {
    pub order_id: String,
    pub contract_id: String,
    pub side: Side,
    pub remaining: u32,
    pub price_cents: u32,
}
