pub mod forecast;
pub mod market;
pub mod order;
pub mod outcome;
pub mod position;

pub use forecast::{ForecastRecord, SourceProfile};
pub use market::{market_key, FillEstimate, MarketContract, OrderBook, PriceLevel, Strike};
pub use order::{OrderAck, OrderAction, OrderRequest, RestingOrder, Side};
pub use outcome::{outcome_record_id, OutcomeRecord};
pub use position::{Exposure, ExposureBook, GatewayPosition};
