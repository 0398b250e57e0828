pub mod circuit_breaker;
pub mod paper;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::model::{
    GatewayPosition, MarketContract, OrderAck, OrderBook, OrderRequest, RestingOrder,
};

pub use circuit_breaker::{BreakerState, SubmitBreaker};
pub use paper::{PaperBook, PaperGateway};
pub use retry::{with_retry, RetryPolicy};

/// Final result of a settled contract as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSettlement {
    pub contract_id: String,
    pub settled_yes: bool,
    /// Observed value of the underlying, when the venue publishes it.
    pub actual_value: Option<f64>,
    pub settled_at: DateTime<Utc>,
}

/// Trading venue for binary contracts.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn list_markets(&self, segment_id: &str) -> EngineResult<Vec<MarketContract>>;

    async fn get_orderbook(&self, contract_id: &str) -> EngineResult<OrderBook>;

    async fn get_positions(&self) -> EngineResult<Vec<GatewayPosition>>;

    async fn get_resting_orders(&self) -> EngineResult<Vec<RestingOrder>>;

    async fn place_order(&self, order: &OrderRequest) -> EngineResult<OrderAck>;

    /// Settlements for the given contracts that have resolved.
    async fn get_settlements(
        &self,
        _contract_ids: &[String],
    ) -> EngineResult<Vec<MarketSettlement>> {
        Ok(Vec::new())
    }
}
