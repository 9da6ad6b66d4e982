//! Repository for the trade execution log.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// One executed (or rejected) exit, as written to the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct TradeLogEntry {
    pub user_id: String,
    pub rule_id: Option<String>,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub quantity: i64,
    pub price: f64,
    pub order_id: Option<String>,
    pub order_type: String,
    pub trigger_type: Option<String>,
    pub trigger_price: Option<f64>,
    pub pnl: Option<f64>,
    pub status: String,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeLogRepository: Send + Sync {
    /// Append an entry, returning its id.
    async fn log_trade(&self, entry: &TradeLogEntry) -> Result<String>;
}

/// Postgres-backed trade log.
pub struct PostgresTradeLogRepository {
    pool: PgPool,
}

impl PostgresTradeLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeLogRepository for PostgresTradeLogRepository {
    async fn log_trade(&self, entry: &TradeLogEntry) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO trade_logs (
                id, user_id, rule_id, symbol, exchange, side, quantity,
                price, order_id, order_type, trigger_type, trigger_price,
                pnl, status, error_message, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&id)
        .bind(&entry.user_id)
        .bind(&entry.rule_id)
        .bind(&entry.symbol)
        .bind(&entry.exchange)
        .bind(&entry.side)
        .bind(entry.quantity)
        .bind(entry.price)
        .bind(&entry.order_id)
        .bind(&entry.order_type)
        .bind(&entry.trigger_type)
        .bind(entry.trigger_price)
        .bind(entry.pnl)
        .bind(&entry.status)
        .bind(&entry.error_message)
        .bind(entry.executed_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}
