//! Broker API surface: the capability trait, the Kite REST client and the
//! streaming ticker.

pub mod frame;
pub mod kite;
pub mod ticker;

pub use kite::{KiteClient, LtpQuote, PositionBook};
pub use ticker::{TickerConnector, TickerEvent, TickerHandle};

use crate::types::{OrderParams, TrackedOrder};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// REST capabilities the engine needs from a broker.
///
/// Brokers are duck-typed behind this trait; concrete clients are selected
/// by the factory from the account's `broker_id`. The streaming ticker is a
/// separate capability — a broker may provide both, or only REST, in which
/// case the engine falls back to LTP polling.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Fetch the net/day position books.
    async fn positions(&self) -> Result<PositionBook>;

    /// Fetch the day's order book.
    async fn orders(&self) -> Result<Vec<TrackedOrder>>;

    /// Fetch last traded prices for `EXCHANGE:SYMBOL` keys.
    async fn ltp(&self, instruments: &[String]) -> Result<HashMap<String, LtpQuote>>;

    /// Place an order, returning the broker's order id.
    async fn place_order(&self, params: &OrderParams) -> Result<String>;
}
