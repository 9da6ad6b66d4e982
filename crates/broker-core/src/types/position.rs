//! Tracked position types mirrored from the broker's net-position book.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a position, derived from the sign of its quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionType {
    Long,
    Short,
    Flat,
}

impl PositionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionType::Long => "LONG",
            PositionType::Short => "SHORT",
            PositionType::Flat => "FLAT",
        }
    }
}

/// A position observed at the broker, keyed by `(exchange, trading_symbol)`.
///
/// `quantity` is the signed net quantity (positive = long, negative = short)
/// and is authoritative; the buy/sell breakdown is only used to derive the
/// entry price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub instrument_token: u32,
    pub trading_symbol: String,
    pub exchange: String,
    /// Broker product class (MIS, CNC, NRML, CO), carried verbatim through
    /// exit orders.
    pub product: String,
    pub quantity: i64,
    pub average_price: f64,
    pub last_price: f64,
    pub pnl: f64,
    pub buy_quantity: i64,
    pub sell_quantity: i64,
    pub buy_price: f64,
    pub sell_price: f64,
    pub multiplier: i64,
    /// When the position was first detected.
    pub first_seen: DateTime<Utc>,
    /// When the position was last refreshed by a poll.
    pub last_updated: DateTime<Utc>,
}

impl TrackedPosition {
    pub fn position_type(&self) -> PositionType {
        if self.quantity > 0 {
            PositionType::Long
        } else if self.quantity < 0 {
            PositionType::Short
        } else {
            PositionType::Flat
        }
    }

    /// Entry price for exit-condition math: buy side for longs, sell side
    /// for shorts, average otherwise.
    pub fn entry_price(&self) -> f64 {
        match self.position_type() {
            PositionType::Long => self.buy_price,
            PositionType::Short => self.sell_price,
            PositionType::Flat => self.average_price,
        }
    }

    pub fn abs_quantity(&self) -> u32 {
        self.quantity.unsigned_abs() as u32
    }

    /// Unique key in `EXCHANGE:SYMBOL` form, also used for LTP requests.
    pub fn symbol_key(&self) -> String {
        format!("{}:{}", self.exchange, self.trading_symbol)
    }
}
