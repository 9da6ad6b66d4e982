//! Exit rule schema, validation and matching.
//!
//! Rules arrive from the repository as untyped JSON. Everything is validated
//! here before it can reach evaluation: unknown condition types, malformed
//! `HH:MM` strings or bad patterns make the whole rule invalid, and the
//! caller skips it.

use broker_core::db::RuleRecord;
use broker_core::types::{OrderType, PositionType};
use broker_core::{Error, Result};
use chrono::{DateTime, Datelike, NaiveTime, Timelike};
use chrono_tz::Tz;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::sync::Arc;

/// How a target/stop scalar maps to a trigger price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    /// Fixed price target.
    Absolute,
    /// Offset from the entry price.
    Relative,
    /// Percentage of the entry price.
    Percentage,
}

/// Which position sides a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyTo {
    Long,
    Short,
    #[default]
    All,
}

impl ApplyTo {
    fn matches(&self, position_type: PositionType) -> bool {
        match self {
            ApplyTo::All => true,
            ApplyTo::Long => position_type == PositionType::Long,
            ApplyTo::Short => position_type == PositionType::Short,
        }
    }
}

/// Take-profit condition.
#[derive(Debug, Clone)]
pub struct TakeProfit {
    pub enabled: bool,
    pub condition_type: ConditionType,
    pub target: f64,
    pub order_type: OrderType,
    pub trail: bool,
    pub trail_step: Option<f64>,
}

/// Stop-loss condition.
#[derive(Debug, Clone)]
pub struct StopLoss {
    pub enabled: bool,
    pub condition_type: ConditionType,
    pub stop: f64,
    pub order_type: OrderType,
    pub trail: bool,
    pub trail_step: Option<f64>,
}

/// Trading window and square-off schedule, in the user's local time.
///
/// Comparisons are within one calendar day; windows spanning midnight are
/// not supported.
#[derive(Debug, Clone)]
pub struct TimeCondition {
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub square_off_time: Option<NaiveTime>,
    /// Active weekdays, 0 = Monday .. 4 = Friday.
    pub active_days: Vec<u8>,
}

impl TimeCondition {
    /// Whether trading is allowed at `now`.
    pub fn is_within_window(&self, now: DateTime<Tz>) -> bool {
        let weekday = now.weekday().num_days_from_monday() as u8;
        if !self.active_days.contains(&weekday) {
            return false;
        }
        // Compare at minute precision, like the broker UI presents times.
        let current = now.time().with_second(0).unwrap().with_nanosecond(0).unwrap();
        if let Some(start) = self.start_time {
            if current < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if current > end {
                return false;
            }
        }
        true
    }

    /// Whether the square-off deadline has passed at `now`.
    pub fn should_square_off(&self, now: DateTime<Tz>) -> bool {
        match self.square_off_time {
            Some(square_off) => now.time() >= square_off,
            None => false,
        }
    }
}

/// Compiled symbol pattern. Globs (`*`, `?`) translate to a full-match
/// regex; anything else matches literally. Matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct SymbolPattern {
    pattern: String,
    regex: Regex,
}

impl SymbolPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        let body = if pattern.contains('*') || pattern.contains('?') {
            pattern.replace('*', ".*").replace('?', ".")
        } else {
            regex::escape(pattern)
        };
        let regex = RegexBuilder::new(&format!("^{body}$"))
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Input(format!("bad symbol pattern {pattern:?}: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, symbol: &str) -> bool {
        self.regex.is_match(symbol)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// A validated exit rule.
#[derive(Debug, Clone)]
pub struct ExitRule {
    pub rule_id: String,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub symbol_pattern: SymbolPattern,
    /// `None` matches every exchange.
    pub exchange: Option<String>,
    pub apply_to: ApplyTo,
    pub take_profit: Option<TakeProfit>,
    pub stop_loss: Option<StopLoss>,
    pub time_conditions: Option<TimeCondition>,
}

impl ExitRule {
    /// Validate a stored rule record.
    pub fn from_record(record: &RuleRecord) -> Result<Self> {
        let pattern = record
            .symbol_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or("*");
        let apply_to = match record.position_type.as_deref() {
            None | Some("ALL") | Some("") => ApplyTo::All,
            Some("LONG") => ApplyTo::Long,
            Some("SHORT") => ApplyTo::Short,
            Some(other) => {
                return Err(Error::Input(format!("unknown position_type {other:?}")));
            }
        };

        Ok(Self {
            rule_id: record.id.clone(),
            name: record.name.clone(),
            enabled: record.is_active,
            priority: record.priority,
            symbol_pattern: SymbolPattern::compile(pattern)?,
            exchange: record.exchange.clone().filter(|e| !e.is_empty()),
            apply_to,
            take_profit: parse_take_profit(record.take_profit.as_ref())?,
            stop_loss: parse_stop_loss(record.stop_loss.as_ref())?,
            time_conditions: parse_time_conditions(record.time_conditions.as_ref())?,
        })
    }

    /// Whether this rule applies to a position.
    pub fn matches(&self, symbol: &str, exchange: &str, position_type: PositionType) -> bool {
        if let Some(rule_exchange) = &self.exchange {
            if rule_exchange != exchange {
                return false;
            }
        }
        if !self.apply_to.matches(position_type) {
            return false;
        }
        self.symbol_pattern.matches(symbol)
    }

    /// Take-profit trigger price for a given entry, or `None` if disabled.
    pub fn calc_tp(&self, entry_price: f64, position_type: PositionType) -> Option<f64> {
        let tp = self.take_profit.as_ref().filter(|tp| tp.enabled)?;
        Some(target_price(
            tp.condition_type,
            tp.target,
            entry_price,
            position_type,
            Direction::Favourable,
        ))
    }

    /// Stop-loss trigger price for a given entry, or `None` if disabled.
    pub fn calc_sl(&self, entry_price: f64, position_type: PositionType) -> Option<f64> {
        let sl = self.stop_loss.as_ref().filter(|sl| sl.enabled)?;
        Some(target_price(
            sl.condition_type,
            sl.stop,
            entry_price,
            position_type,
            Direction::Adverse,
        ))
    }

    /// Whether static take-profit fires at `price`.
    pub fn check_tp(&self, price: f64, entry_price: f64, position_type: PositionType) -> bool {
        match self.calc_tp(entry_price, position_type) {
            Some(tp) => match position_type {
                PositionType::Short => price <= tp,
                _ => price >= tp,
            },
            None => false,
        }
    }

    /// Whether static stop-loss fires at `price`.
    pub fn check_sl(&self, price: f64, entry_price: f64, position_type: PositionType) -> bool {
        match self.calc_sl(entry_price, position_type) {
            Some(sl) => match position_type {
                PositionType::Short => price >= sl,
                _ => price <= sl,
            },
            None => false,
        }
    }
}

/// Whether the scalar moves the trigger with or against the position.
#[derive(Clone, Copy)]
enum Direction {
    Favourable,
    Adverse,
}

fn target_price(
    condition_type: ConditionType,
    value: f64,
    entry_price: f64,
    position_type: PositionType,
    direction: Direction,
) -> f64 {
    // A favourable move for a long is an adverse move for a short.
    let sign = match (position_type, direction) {
        (PositionType::Short, Direction::Favourable) => -1.0,
        (PositionType::Short, Direction::Adverse) => 1.0,
        (_, Direction::Favourable) => 1.0,
        (_, Direction::Adverse) => -1.0,
    };
    match condition_type {
        ConditionType::Absolute => value,
        ConditionType::Relative => entry_price + sign * value,
        ConditionType::Percentage => entry_price * (1.0 + sign * value / 100.0),
    }
}

/// A user's rule set, ordered by ascending priority.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    pub version: String,
    rules: Vec<Arc<ExitRule>>,
}

impl RuleSet {
    pub fn new(version: impl Into<String>, mut rules: Vec<Arc<ExitRule>>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self {
            version: version.into(),
            rules,
        }
    }

    /// First enabled rule matching the position, in priority order.
    pub fn find_match(
        &self,
        symbol: &str,
        exchange: &str,
        position_type: PositionType,
    ) -> Option<Arc<ExitRule>> {
        self.rules
            .iter()
            .find(|rule| rule.enabled && rule.matches(symbol, exchange, position_type))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// Raw condition payloads as stored in the database.

#[derive(Debug, Deserialize)]
struct RawPriceCondition {
    #[serde(default = "default_true")]
    enabled: bool,
    condition_type: Option<String>,
    target: Option<f64>,
    stop: Option<f64>,
    #[serde(default)]
    order_type: Option<String>,
    #[serde(default)]
    trail: bool,
    trail_step: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTimeCondition {
    start_time: Option<String>,
    end_time: Option<String>,
    square_off_time: Option<String>,
    active_days: Option<Vec<u8>>,
}

fn default_true() -> bool {
    true
}

fn parse_condition_type(raw: Option<&str>) -> Result<ConditionType> {
    match raw.unwrap_or("relative") {
        "absolute" => Ok(ConditionType::Absolute),
        "relative" => Ok(ConditionType::Relative),
        "percentage" => Ok(ConditionType::Percentage),
        other => Err(Error::Input(format!("unknown condition_type {other:?}"))),
    }
}

fn parse_order_type(raw: Option<&str>) -> Result<OrderType> {
    match raw.unwrap_or("MARKET") {
        "MARKET" => Ok(OrderType::Market),
        "LIMIT" => Ok(OrderType::Limit),
        other => Err(Error::Input(format!("unknown order_type {other:?}"))),
    }
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| Error::Input(format!("bad HH:MM time {raw:?}")))
}

fn is_empty_payload(value: &serde_json::Value) -> bool {
    value.is_null() || value.as_object().is_some_and(|o| o.is_empty())
}

fn parse_take_profit(value: Option<&serde_json::Value>) -> Result<Option<TakeProfit>> {
    let Some(value) = value.filter(|v| !is_empty_payload(v)) else {
        return Ok(None);
    };
    let raw: RawPriceCondition = serde_json::from_value(value.clone())
        .map_err(|e| Error::Input(format!("bad take_profit payload: {e}")))?;
    if !raw.enabled {
        return Ok(None);
    }
    Ok(Some(TakeProfit {
        enabled: true,
        condition_type: parse_condition_type(raw.condition_type.as_deref())?,
        target: raw
            .target
            .ok_or_else(|| Error::Input("take_profit.target missing".to_string()))?,
        order_type: parse_order_type(raw.order_type.as_deref())?,
        trail: raw.trail,
        trail_step: raw.trail_step,
    }))
}

fn parse_stop_loss(value: Option<&serde_json::Value>) -> Result<Option<StopLoss>> {
    let Some(value) = value.filter(|v| !is_empty_payload(v)) else {
        return Ok(None);
    };
    let raw: RawPriceCondition = serde_json::from_value(value.clone())
        .map_err(|e| Error::Input(format!("bad stop_loss payload: {e}")))?;
    if !raw.enabled {
        return Ok(None);
    }
    Ok(Some(StopLoss {
        enabled: true,
        condition_type: parse_condition_type(raw.condition_type.as_deref())?,
        stop: raw
            .stop
            .ok_or_else(|| Error::Input("stop_loss.stop missing".to_string()))?,
        order_type: parse_order_type(raw.order_type.as_deref())?,
        trail: raw.trail,
        trail_step: raw.trail_step,
    }))
}

fn parse_time_conditions(value: Option<&serde_json::Value>) -> Result<Option<TimeCondition>> {
    let Some(value) = value.filter(|v| !is_empty_payload(v)) else {
        return Ok(None);
    };
    let raw: RawTimeCondition = serde_json::from_value(value.clone())
        .map_err(|e| Error::Input(format!("bad time_conditions payload: {e}")))?;

    let parse_opt = |raw: Option<&String>| -> Result<Option<NaiveTime>> {
        raw.map(|s| parse_hhmm(s)).transpose()
    };

    Ok(Some(TimeCondition {
        start_time: parse_opt(raw.start_time.as_ref())?,
        end_time: parse_opt(raw.end_time.as_ref())?,
        square_off_time: parse_opt(raw.square_off_time.as_ref())?,
        active_days: raw.active_days.unwrap_or_else(|| vec![0, 1, 2, 3, 4]),
    }))
}
