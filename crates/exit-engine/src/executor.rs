//! Exit order execution.
//!
//! Turns a triggered trade into exactly one square-off order at the broker:
//! side inverted, quantity and product carried from the position, tagged so
//! the position monitor can recognize the order as system-placed. Transient
//! broker failures are retried with backoff; permanent failures emit
//! `ORDER_REJECTED` and leave the trade in its terminal triggered state.

use crate::evaluator::{ActiveTrade, TriggerKind};
use broker_core::api::BrokerApi;
use broker_core::db::{TradeLogEntry, TradeLogRepository};
use broker_core::events::{EventBus, EventType};
use broker_core::types::{OrderParams, OrderType, PositionType, TransactionType};
use broker_core::{Error, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Retry policy for exit order placement.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Retries after the initial attempt, for transient failures only.
    pub max_retries: u32,
    /// First retry delay; doubles on every further retry.
    pub retry_base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Places square-off orders for triggered trades.
pub struct ExitExecutor {
    bus: Arc<EventBus>,
    trade_log: Option<Arc<dyn TradeLogRepository>>,
    config: ExecutorConfig,
}

impl ExitExecutor {
    pub fn new(bus: Arc<EventBus>, config: ExecutorConfig) -> Self {
        Self {
            bus,
            trade_log: None,
            config,
        }
    }

    pub fn with_trade_log(mut self, trade_log: Arc<dyn TradeLogRepository>) -> Self {
        self.trade_log = Some(trade_log);
        self
    }

    /// Build the order tag: trigger prefix plus the first eight characters
    /// of the rule id.
    fn order_tag(trigger: TriggerKind, rule_id: &str) -> String {
        let short: String = rule_id.chars().take(8).collect();
        format!("{}_{}", trigger.tag_prefix(), short)
    }

    /// Place the exit order for a triggered trade. Emits exactly one
    /// `ORDER_PLACED` or `ORDER_REJECTED` event.
    pub async fn execute(
        &self,
        broker: &dyn BrokerApi,
        user_id: &str,
        trade: &ActiveTrade,
        trigger: TriggerKind,
    ) -> Result<String> {
        let position = &trade.position;

        let transaction_type = match position.position_type() {
            PositionType::Long => TransactionType::Sell,
            PositionType::Short => TransactionType::Buy,
            PositionType::Flat => {
                return Err(Error::Input(format!(
                    "cannot exit flat position {}",
                    position.trading_symbol
                )));
            }
        };

        // Square-offs are always market orders; TP/SL honour the rule.
        let order_type = match trigger {
            TriggerKind::SquareOff => OrderType::Market,
            TriggerKind::Tp => trade
                .rule
                .take_profit
                .as_ref()
                .map(|tp| tp.order_type)
                .unwrap_or_default(),
            TriggerKind::Sl => trade
                .rule
                .stop_loss
                .as_ref()
                .map(|sl| sl.order_type)
                .unwrap_or_default(),
        };
        let price = match order_type {
            OrderType::Limit => Some(trade.current_price),
            OrderType::Market => None,
        };

        let params = OrderParams {
            variety: "regular".to_string(),
            exchange: position.exchange.clone(),
            trading_symbol: position.trading_symbol.clone(),
            transaction_type,
            quantity: position.abs_quantity(),
            product: position.product.clone(),
            order_type,
            price,
            trigger_price: None,
            tag: Some(Self::order_tag(trigger, &trade.rule.rule_id)),
        };

        info!(
            user_id,
            symbol = %params.trading_symbol,
            trigger = trigger.as_str(),
            side = transaction_type.as_str(),
            quantity = params.quantity,
            order_type = order_type.as_str(),
            "Placing exit order"
        );

        let mut retries = 0;
        loop {
            match broker.place_order(&params).await {
                Ok(order_id) => {
                    self.bus
                        .emit(
                            EventType::OrderPlaced,
                            Some(user_id),
                            json!({
                                "order_id": &order_id,
                                "symbol": &params.trading_symbol,
                                "exchange": &params.exchange,
                                "transaction_type": transaction_type.as_str(),
                                "quantity": params.quantity,
                                "order_type": order_type.as_str(),
                                "trigger_type": trigger.as_str(),
                                "trigger_price": trade.current_price,
                                "tag": &params.tag,
                            }),
                        )
                        .await;
                    self.log_trade(user_id, trade, trigger, &params, Some(&order_id), "PLACED", None)
                        .await;
                    return Ok(order_id);
                }
                Err(e) if e.is_transient() && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = self.config.retry_base_delay * 2u32.pow(retries - 1);
                    warn!(
                        user_id,
                        symbol = %params.trading_symbol,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Exit order attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        user_id,
                        symbol = %params.trading_symbol,
                        trigger = trigger.as_str(),
                        error = %e,
                        "Exit order rejected"
                    );
                    self.bus
                        .emit(
                            EventType::OrderRejected,
                            Some(user_id),
                            json!({
                                "symbol": &params.trading_symbol,
                                "exchange": &params.exchange,
                                "transaction_type": transaction_type.as_str(),
                                "quantity": params.quantity,
                                "trigger_type": trigger.as_str(),
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                    self.log_trade(
                        user_id,
                        trade,
                        trigger,
                        &params,
                        None,
                        "REJECTED",
                        Some(e.to_string()),
                    )
                    .await;
                    return Err(e);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_trade(
        &self,
        user_id: &str,
        trade: &ActiveTrade,
        trigger: TriggerKind,
        params: &OrderParams,
        order_id: Option<&str>,
        status: &str,
        error_message: Option<String>,
    ) {
        let Some(trade_log) = &self.trade_log else {
            return;
        };
        let entry = TradeLogEntry {
            user_id: user_id.to_string(),
            rule_id: Some(trade.rule.rule_id.clone()),
            symbol: params.trading_symbol.clone(),
            exchange: params.exchange.clone(),
            side: params.transaction_type.as_str().to_string(),
            quantity: params.quantity as i64,
            price: trade.current_price,
            order_id: order_id.map(str::to_string),
            order_type: params.order_type.as_str().to_string(),
            trigger_type: Some(trigger.as_str().to_string()),
            trigger_price: Some(trade.current_price),
            pnl: Some(trade.pnl()),
            status: status.to_string(),
            error_message,
            executed_at: Utc::now(),
        };
        if let Err(e) = trade_log.log_trade(&entry).await {
            error!(user_id, error = %e, "Failed to write trade log");
        }
    }
}
