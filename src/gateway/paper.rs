use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{MarketGateway, MarketSettlement};
use crate::error::{EngineError, EngineResult};
use crate::model::{
    GatewayPosition, MarketContract, OrderAck, OrderAction, OrderBook, OrderRequest, PriceLevel,
    RestingOrder, Side,
};

/// Snapshot of markets and books the paper gateway trades against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperBook {
    pub markets: Vec<MarketContract>,
    #[serde(default)]
    pub books: HashMap<String, OrderBook>,
    #[serde(default)]
    pub settlements: Vec<MarketSettlement>,
}

impl PaperBook {
    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read paper book {}", path.display()))?;
        serde_json::from_str(&payload)
            .with_context(|| format!("failed to parse paper book {}", path.display()))
    }
}

#[derive(Default)]
struct PaperAccount {
    positions: HashMap<(String, Side), GatewayPosition>,
    resting: Vec<RestingOrder>,
}

/// In-memory venue. Orders fill against the book up to their limit; any
/// remainder rests.
pub struct PaperGateway {
    book: Mutex<PaperBook>,
    account: Mutex<PaperAccount>,
    next_order: AtomicU32,
    fail_submissions: AtomicU32,
}

impl PaperGateway {
    pub fn new(book: PaperBook) -> Self {
        Self {
            book: Mutex::new(book),
            account: Mutex::new(PaperAccount::default()),
            next_order: AtomicU32::new(1),
            fail_submissions: AtomicU32::new(0),
        }
    }

    /// The next `n` submissions fail with `ExternalFailure`.
    pub fn fail_next_submissions(&self, n: u32) {
        self.fail_submissions.store(n, Ordering::SeqCst);
    }

    pub fn settle(&self, settlement: MarketSettlement) -> EngineResult<()> {
        let mut book = self
            .book
            .lock()
            .map_err(|_| EngineError::inconsistent("paper", "book lock poisoned"))?;
        book.settlements.retain(|s| s.contract_id != settlement.contract_id);
        book.settlements.push(settlement);
        Ok(())
    }

    /// Replace the book for one contract, e.g. to replay a price move.
    pub fn set_book(&self, contract_id: &str, book: OrderBook) -> EngineResult<()> {
        self.lock_book()?
            .books
            .insert(contract_id.to_string(), book);
        Ok(())
    }

    pub fn seed_position(&self, position: GatewayPosition) -> EngineResult<()> {
        let mut account = self.lock_account()?;
        account
            .positions
            .insert((position.contract_id.clone(), position.side), position);
        Ok(())
    }

    fn lock_account(&self) -> EngineResult<std::sync::MutexGuard<'_, PaperAccount>> {
        self.account
            .lock()
            .map_err(|_| EngineError::inconsistent("paper", "account lock poisoned"))
    }

    /// Contracts filled and their total price in cents.
    fn fill_buy(&self, order: &OrderRequest, order_id: &str) -> EngineResult<(u32, f64)> {
        let mut filled = 0u32;
        let mut cost_cents = 0.0;
        {
            let mut book = self.lock_book()?;
            let levels = side_levels(&mut book, &order.contract_id, order.side)?;
            levels.sort_by_key(|l| l.price_cents);
            for level in levels.iter_mut() {
                if filled == order.count || level.price_cents > order.price_cents {
                    break;
                }
                let take = (order.count - filled).min(level.size);
                level.size -= take;
                filled += take;
                cost_cents += take as f64 * level.price_cents as f64;
            }
            levels.retain(|l| l.size > 0);
        }

        let mut account = self.lock_account()?;
        if filled > 0 {
            let position = account
                .positions
                .entry((order.contract_id.clone(), order.side))
                .or_insert_with(|| GatewayPosition {
                    contract_id: order.contract_id.clone(),
                    side: order.side,
                    count: 0,
                    cost_basis: 0.0,
                });
            position.count += filled;
            position.cost_basis += cost_cents / 100.0;
        }
        if filled < order.count {
            account.resting.push(RestingOrder {
                order_id: order_id.to_string(),
                contract_id: order.contract_id.clone(),
                side: order.side,
                remaining: order.count - filled,
                price_cents: order.price_cents,
            });
        }
        Ok((filled, cost_cents))
    }

    /// Sells never rest: whatever the opposite asks cannot absorb at the
    /// limit is cancelled.
    fn fill_sell(&self, order: &OrderRequest) -> EngineResult<(u32, f64)> {
        let mut account = self.lock_account()?;
        let key = (order.contract_id.clone(), order.side);
        let held = account.positions.get(&key).map(|p| p.count).unwrap_or(0);
        let wanted = order.count.min(held);
        if wanted == 0 {
            return Err(EngineError::inconsistent(
                "paper",
                format!("no {} position in {} to sell", order.side, order.contract_id),
            ));
        }

        let mut filled = 0u32;
        let mut proceeds_cents = 0.0;
        {
            let mut book = self.lock_book()?;
            let levels = side_levels(&mut book, &order.contract_id, order.side.opposite())?;
            levels.sort_by_key(|l| l.price_cents);
            for level in levels.iter_mut() {
                if filled == wanted || 100 - level.price_cents.min(100) < order.price_cents {
                    break;
                }
                let take = (wanted - filled).min(level.size);
                level.size -= take;
                filled += take;
                proceeds_cents += take as f64 * (100 - level.price_cents) as f64;
            }
            levels.retain(|l| l.size > 0);
        }

        if filled > 0 {
            if let Some(position) = account.positions.get_mut(&key) {
                let kept = position.count - filled;
                position.cost_basis *= kept as f64 / position.count as f64;
                position.count = kept;
                if kept == 0 {
                    account.positions.remove(&key);
                }
            }
        }
        Ok((filled, proceeds_cents))
    }

    fn lock_book(&self) -> EngineResult<std::sync::MutexGuard<'_, PaperBook>> {
        self.book
            .lock()
            .map_err(|_| EngineError::inconsistent("paper", "book lock poisoned"))
    }
}

fn side_levels<'a>(
    book: &'a mut PaperBook,
    contract_id: &str,
    side: Side,
) -> EngineResult<&'a mut Vec<PriceLevel>> {
    book.books
        .get_mut(contract_id)
        .map(|b| match side {
            Side::Yes => &mut b.yes,
            Side::No => &mut b.no,
        })
        .ok_or_else(|| EngineError::external("paper", format!("unknown contract {contract_id}")))
}

#[async_trait]
impl MarketGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn list_markets(&self, segment_id: &str) -> EngineResult<Vec<MarketContract>> {
        let book = self.lock_book()?;
        let settled: Vec<&str> = book.settlements.iter().map(|s| s.contract_id.as_str()).collect();
        Ok(book
            .markets
            .iter()
            .filter(|m| m.segment_id == segment_id && !settled.contains(&m.contract_id.as_str()))
            .cloned()
            .collect())
    }

    async fn get_orderbook(&self, contract_id: &str) -> EngineResult<OrderBook> {
        let book = self.lock_book()?;
        book.books
            .get(contract_id)
            .cloned()
            .ok_or_else(|| EngineError::external("paper", format!("no book for {contract_id}")))
    }

    async fn get_positions(&self) -> EngineResult<Vec<GatewayPosition>> {
        let account = self.lock_account()?;
        let mut positions: Vec<GatewayPosition> = account.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.contract_id.cmp(&b.contract_id));
        Ok(positions)
    }

    async fn get_resting_orders(&self) -> EngineResult<Vec<RestingOrder>> {
        Ok(self.lock_account()?.resting.clone())
    }

    async fn place_order(&self, order: &OrderRequest) -> EngineResult<OrderAck> {
        let remaining_failures = self.fail_submissions.load(Ordering::SeqCst);
        if remaining_failures > 0 {
            self.fail_submissions
                .store(remaining_failures - 1, Ordering::SeqCst);
            return Err(EngineError::external("paper", "injected submission failure"));
        }

        let order_id = format!("paper-{}", self.next_order.fetch_add(1, Ordering::SeqCst));
        let (filled, value_cents) = match order.action {
            OrderAction::Buy => self.fill_buy(order, &order_id)?,
            OrderAction::Sell => self.fill_sell(order)?,
        };
        Ok(OrderAck {
            order_id,
            client_order_id: order.client_order_id.clone(),
            filled,
            avg_price_cents: (filled > 0).then(|| value_cents / filled as f64),
        })
    }

    async fn get_settlements(
        &self,
        contract_ids: &[String],
    ) -> EngineResult<Vec<MarketSettlement>> {
        let book = self.lock_book()?;
        Ok(book
            .settlements
            .iter()
            .filter(|s| contract_ids.contains(&s.contract_id))
            .cloned()
            .collect())
    }
}
