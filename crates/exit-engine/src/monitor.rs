//! Position and order monitoring.
//!
//! Each poll of the broker's net positions is diffed against the last
//! observed set, keyed by `(exchange, trading_symbol)`. Order polling is an
//! auxiliary concern: it only distinguishes system-placed exits (tagged
//! `TP_`/`SL_`/`SQ_`) from manual orders for observability.

use broker_core::types::{TrackedOrder, TrackedPosition};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Outcome of one position diff.
#[derive(Debug, Clone)]
pub enum PositionDelta {
    /// A new key with non-zero quantity appeared.
    Opened(TrackedPosition),
    /// An existing key changed quantity, both sides non-zero.
    Updated {
        position: TrackedPosition,
        previous_quantity: i64,
    },
    /// An existing key went to zero quantity or disappeared.
    Closed(TrackedPosition),
}

/// Tag prefixes marking orders the engine itself placed.
const SYSTEM_TAG_PREFIXES: [&str; 3] = ["TP_", "SL_", "SQ_"];

/// Diffing tracker over the broker's positions and orders.
#[derive(Default)]
pub struct PositionMonitor {
    positions: HashMap<String, TrackedPosition>,
    orders: HashMap<String, TrackedOrder>,
    completed_order_ids: HashSet<String>,
}

impl PositionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an order tag marks a system-generated exit.
    pub fn is_system_tag(tag: &str) -> bool {
        SYSTEM_TAG_PREFIXES.iter().any(|p| tag.starts_with(p))
    }

    /// Diff freshly fetched net positions against the tracked set.
    ///
    /// Zero-quantity rows for unknown keys are ignored; they are never
    /// tracked. `first_seen` survives across polls, `last_updated` is
    /// refreshed on every confirmed sighting.
    pub fn apply_positions(&mut self, fetched: Vec<TrackedPosition>) -> Vec<PositionDelta> {
        let mut deltas = Vec::new();
        let mut seen_keys: HashSet<String> = HashSet::new();

        for mut position in fetched {
            let key = position.symbol_key();

            if position.quantity == 0 {
                if let Some(closed) = self.positions.remove(&key) {
                    info!(symbol = %closed.trading_symbol, "Position closed");
                    deltas.push(PositionDelta::Closed(closed));
                }
                continue;
            }

            seen_keys.insert(key.clone());
            match self.positions.get(&key) {
                None => {
                    info!(
                        symbol = %position.trading_symbol,
                        position_type = %position.position_type().as_str(),
                        quantity = position.quantity,
                        "New position"
                    );
                    self.positions.insert(key, position.clone());
                    deltas.push(PositionDelta::Opened(position));
                }
                Some(existing) => {
                    let previous_quantity = existing.quantity;
                    position.first_seen = existing.first_seen;
                    position.last_updated = Utc::now();
                    self.positions.insert(key, position.clone());
                    if position.quantity != previous_quantity {
                        info!(
                            symbol = %position.trading_symbol,
                            from = previous_quantity,
                            to = position.quantity,
                            "Position quantity changed"
                        );
                        deltas.push(PositionDelta::Updated {
                            position,
                            previous_quantity,
                        });
                    }
                }
            }
        }

        let vanished: Vec<String> = self
            .positions
            .keys()
            .filter(|key| !seen_keys.contains(*key))
            .cloned()
            .collect();
        for key in vanished {
            if let Some(closed) = self.positions.remove(&key) {
                info!(symbol = %closed.trading_symbol, "Position disappeared");
                deltas.push(PositionDelta::Closed(closed));
            }
        }

        deltas
    }

    /// Track order completions. Returns orders that completed since the last
    /// poll and were *not* placed by the engine.
    pub fn apply_orders(&mut self, fetched: Vec<TrackedOrder>) -> Vec<TrackedOrder> {
        let mut manual_completions = Vec::new();

        for order in fetched {
            let newly_complete =
                order.is_complete() && !self.completed_order_ids.contains(&order.order_id);
            if newly_complete {
                self.completed_order_ids.insert(order.order_id.clone());
                let system = order
                    .tag
                    .as_deref()
                    .is_some_and(Self::is_system_tag);
                if system {
                    debug!(
                        order_id = %order.order_id,
                        tag = order.tag.as_deref().unwrap_or(""),
                        "System exit order completed"
                    );
                } else {
                    info!(
                        order_id = %order.order_id,
                        symbol = %order.trading_symbol,
                        side = %order.transaction_type,
                        price = order.average_price,
                        "Order complete"
                    );
                    manual_completions.push(order.clone());
                }
            }
            self.orders.insert(order.order_id.clone(), order);
        }

        manual_completions
    }

    pub fn positions(&self) -> &HashMap<String, TrackedPosition> {
        &self.positions
    }

    pub fn position(&self, symbol_key: &str) -> Option<&TrackedPosition> {
        self.positions.get(symbol_key)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Instrument tokens of every tracked position, for price subscriptions.
    pub fn instrument_tokens(&self) -> Vec<u32> {
        self.positions.values().map(|p| p.instrument_token).collect()
    }
}
