//! Trigger evaluation for active trades.
//!
//! Every price update runs one pass of [`evaluate`]: watermarks first, then
//! the decision ladder — time window, square-off, trailing TP, static TP,
//! trailing SL, static SL. The first firing condition wins. A triggered
//! trade is terminal and never re-evaluated.

use crate::rules::ExitRule;
use broker_core::events::EventType;
use broker_core::types::{PositionType, TrackedPosition};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;

/// Lifecycle of an active trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeState {
    /// Matched to a rule, no price update seen yet.
    Created,
    /// Receiving price updates and being evaluated.
    Tracking,
    /// An exit condition fired; terminal.
    Triggered,
    /// The position disappeared at the broker before any trigger; terminal.
    ClosedExternal,
}

/// Which exit condition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    Tp,
    Sl,
    SquareOff,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Tp => "TP",
            TriggerKind::Sl => "SL",
            TriggerKind::SquareOff => "SQUARE_OFF",
        }
    }

    /// Prefix used in exit-order tags.
    pub fn tag_prefix(&self) -> &'static str {
        match self {
            TriggerKind::Tp => "TP",
            TriggerKind::Sl => "SL",
            TriggerKind::SquareOff => "SQ",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            TriggerKind::Tp => EventType::TpTriggered,
            TriggerKind::Sl => EventType::SlTriggered,
            TriggerKind::SquareOff => EventType::TimeTrigger,
        }
    }
}

/// A position matched to a rule and monitored for exit conditions.
///
/// The rule reference is a snapshot: edits to the stored rule never affect a
/// live trade. Watermarks are monotonic in their direction for the life of
/// the trade.
#[derive(Debug, Clone)]
pub struct ActiveTrade {
    pub position: TrackedPosition,
    pub rule: Arc<ExitRule>,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub current_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub state: TradeState,
    pub trigger: Option<TriggerKind>,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl ActiveTrade {
    pub fn new(position: TrackedPosition, rule: Arc<ExitRule>) -> Self {
        let entry = position.entry_price();
        let position_type = position.position_type();
        let tp_price = rule.calc_tp(entry, position_type);
        let sl_price = rule.calc_sl(entry, position_type);
        let last_price = position.last_price;
        Self {
            position,
            rule,
            tp_price,
            sl_price,
            current_price: last_price,
            highest_price: last_price,
            lowest_price: last_price,
            state: TradeState::Created,
            trigger: None,
            triggered_at: None,
        }
    }

    pub fn symbol_key(&self) -> String {
        self.position.symbol_key()
    }

    /// Apply a price update to the watermarks.
    fn update_price(&mut self, price: f64) {
        self.current_price = price;
        if price > self.highest_price {
            self.highest_price = price;
        }
        if self.lowest_price == 0.0 || price < self.lowest_price {
            self.lowest_price = price;
        }
        if self.state == TradeState::Created {
            self.state = TradeState::Tracking;
        }
    }

    /// Terminal transition; the caller owns placing the exit order.
    pub fn mark_triggered(&mut self, trigger: TriggerKind, at: DateTime<Utc>) {
        self.state = TradeState::Triggered;
        self.trigger = Some(trigger);
        self.triggered_at = Some(at);
    }

    /// Unrealized P&L at the current price.
    pub fn pnl(&self) -> f64 {
        (self.current_price - self.position.entry_price()) * self.position.quantity as f64
    }

    /// Point-in-time view for status APIs.
    pub fn snapshot(&self) -> TradeSnapshot {
        TradeSnapshot {
            symbol: self.position.trading_symbol.clone(),
            exchange: self.position.exchange.clone(),
            position_type: self.position.position_type(),
            quantity: self.position.quantity,
            entry_price: self.position.entry_price(),
            current_price: self.current_price,
            tp_price: self.tp_price,
            sl_price: self.sl_price,
            pnl: self.pnl(),
            rule_id: self.rule.rule_id.clone(),
            state: self.state,
            trigger: self.trigger,
        }
    }
}

/// Serializable view of an [`ActiveTrade`].
#[derive(Debug, Clone, Serialize)]
pub struct TradeSnapshot {
    pub symbol: String,
    pub exchange: String,
    pub position_type: PositionType,
    pub quantity: i64,
    pub entry_price: f64,
    pub current_price: f64,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub pnl: f64,
    pub rule_id: String,
    pub state: TradeState,
    pub trigger: Option<TriggerKind>,
}

/// Evaluate one trade against a new price. Returns the trigger to act on,
/// if any. Triggered trades are skipped.
pub fn evaluate(trade: &mut ActiveTrade, price: f64, now: DateTime<Tz>) -> Option<TriggerKind> {
    if trade.state == TradeState::Triggered {
        return None;
    }
    trade.update_price(price);

    let rule = trade.rule.clone();
    let position_type = trade.position.position_type();
    let entry_price = trade.position.entry_price();

    if let Some(tc) = &rule.time_conditions {
        if !tc.is_within_window(now) {
            return None;
        }
        if tc.should_square_off(now) {
            return Some(TriggerKind::SquareOff);
        }
    }

    // Take-profit: trailing arms at the TP price, then gives back trail_step
    // from the best watermark.
    if let Some(tp) = rule.take_profit.as_ref().filter(|tp| tp.enabled && tp.trail) {
        let step = tp.trail_step.unwrap_or(0.0);
        if let Some(tp_price) = trade.tp_price {
            match position_type {
                PositionType::Long => {
                    if trade.highest_price >= tp_price && price <= trade.highest_price - step {
                        return Some(TriggerKind::Tp);
                    }
                }
                PositionType::Short => {
                    if trade.lowest_price <= tp_price && price >= trade.lowest_price + step {
                        return Some(TriggerKind::Tp);
                    }
                }
                PositionType::Flat => {}
            }
        }
    } else if rule.check_tp(price, entry_price, position_type) {
        return Some(TriggerKind::Tp);
    }

    // Stop-loss: trailing follows the best watermark at a fixed distance.
    if let Some(sl) = rule.stop_loss.as_ref().filter(|sl| sl.enabled && sl.trail) {
        match position_type {
            PositionType::Long => {
                if price <= trade.highest_price - sl.stop {
                    return Some(TriggerKind::Sl);
                }
            }
            PositionType::Short => {
                if price >= trade.lowest_price + sl.stop {
                    return Some(TriggerKind::Sl);
                }
            }
            PositionType::Flat => {}
        }
    } else if rule.check_sl(price, entry_price, position_type) {
        return Some(TriggerKind::Sl);
    }

    None
}
