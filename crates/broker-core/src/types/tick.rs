//! Market tick types produced by the streaming ticker.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Streaming mode for an instrument subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    Ltp,
    Quote,
    Full,
}

impl TickMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickMode::Ltp => "ltp",
            TickMode::Quote => "quote",
            TickMode::Full => "full",
        }
    }
}

/// Day OHLC carried by quote/full packets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One level of market depth (12 bytes on the wire: quantity, price, orders,
/// two bytes of padding).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DepthLevel {
    pub quantity: u32,
    pub price: f64,
    pub orders: u16,
}

/// Five-level buy/sell depth from full-mode packets.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MarketDepth {
    pub buy: Vec<DepthLevel>,
    pub sell: Vec<DepthLevel>,
}

/// A parsed market tick.
#[derive(Debug, Clone, Serialize)]
pub struct Tick {
    pub mode: TickMode,
    pub instrument_token: u32,
    /// Index-segment instruments stream prices but cannot be traded.
    pub tradable: bool,
    pub last_price: f64,
    pub last_traded_quantity: Option<u32>,
    pub average_traded_price: Option<f64>,
    pub volume_traded: Option<u32>,
    pub total_buy_quantity: Option<u32>,
    pub total_sell_quantity: Option<u32>,
    pub ohlc: Option<Ohlc>,
    /// Percent change against the day close.
    pub change: Option<f64>,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub oi: Option<u32>,
    pub oi_day_high: Option<u32>,
    pub oi_day_low: Option<u32>,
    pub exchange_timestamp: Option<DateTime<Utc>>,
    pub depth: Option<MarketDepth>,
}

impl Tick {
    /// A minimal LTP-mode tick.
    pub fn ltp(instrument_token: u32, tradable: bool, last_price: f64) -> Self {
        Self {
            mode: TickMode::Ltp,
            instrument_token,
            tradable,
            last_price,
            last_traded_quantity: None,
            average_traded_price: None,
            volume_traded: None,
            total_buy_quantity: None,
            total_sell_quantity: None,
            ohlc: None,
            change: None,
            last_trade_time: None,
            oi: None,
            oi_day_high: None,
            oi_day_low: None,
            exchange_timestamp: None,
            depth: None,
        }
    }
}
