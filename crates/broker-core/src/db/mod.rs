//! Database access layer for PostgreSQL.

pub mod broker_accounts;
pub mod rules;
pub mod trade_log;

pub use broker_accounts::{BrokerAccountRepository, PostgresBrokerAccountRepository};
pub use rules::{PostgresRulesRepository, RuleRecord, RuleSetRecord, RulesRepository};
pub use trade_log::{PostgresTradeLogRepository, TradeLogEntry, TradeLogRepository};

use crate::config::DatabaseConfig;
use crate::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    Ok(pool)
}
