//! Order types: exit-order parameters and the broker's order book rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// BUY or SELL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
        }
    }
}

/// Order type used for exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }
}

/// Parameters for placing an order at the broker.
#[derive(Debug, Clone, Serialize)]
pub struct OrderParams {
    /// Order variety; the engine always places `regular` orders.
    pub variety: String,
    pub exchange: String,
    pub trading_symbol: String,
    pub transaction_type: TransactionType,
    pub quantity: u32,
    pub product: String,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    /// Idempotency/observability marker, e.g. `TP_a1b2c3d4`.
    pub tag: Option<String>,
}

/// An order observed in the broker's order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub order_id: String,
    pub exchange_order_id: Option<String>,
    pub trading_symbol: String,
    pub exchange: String,
    pub transaction_type: String,
    pub order_type: String,
    pub product: String,
    pub variety: String,
    pub status: String,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub price: f64,
    pub average_price: f64,
    pub trigger_price: Option<f64>,
    pub tag: Option<String>,
    pub order_timestamp: Option<DateTime<Utc>>,
}

impl TrackedOrder {
    pub fn is_complete(&self) -> bool {
        self.status == "COMPLETE"
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status.as_str(),
            "OPEN" | "TRIGGER PENDING" | "AMO REQ RECEIVED"
        )
    }

    pub fn symbol_key(&self) -> String {
        format!("{}:{}", self.exchange, self.trading_symbol)
    }
}
