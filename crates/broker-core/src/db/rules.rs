//! Repository for user-defined exit rules.
//!
//! Condition payloads are stored as JSON and validated by the engine on
//! load, never here.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

/// One stored rule, conditions still untyped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub priority: i32,
    pub symbol_pattern: Option<String>,
    pub exchange: Option<String>,
    pub position_type: Option<String>,
    pub take_profit: Option<serde_json::Value>,
    pub stop_loss: Option<serde_json::Value>,
    pub time_conditions: Option<serde_json::Value>,
}

/// A user's full rule set, ordered by ascending priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetRecord {
    pub version: String,
    pub rules: Vec<RuleRecord>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RulesRepository: Send + Sync {
    /// Fetch all rules for a user, or `None` if the user has none.
    async fn get_rules(&self, user_id: &str) -> Result<Option<RuleSetRecord>>;
}

/// Postgres-backed rules repository.
pub struct PostgresRulesRepository {
    pool: PgPool,
}

impl PostgresRulesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RulesRepository for PostgresRulesRepository {
    async fn get_rules(&self, user_id: &str) -> Result<Option<RuleSetRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, name, is_active, priority, symbol_pattern, exchange,
                position_type, take_profit, stop_loss, time_conditions
            FROM trading_rules
            WHERE user_id = $1
            ORDER BY priority
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let rules = rows
            .iter()
            .map(|r| RuleRecord {
                id: r.get("id"),
                name: r.get("name"),
                is_active: r.get("is_active"),
                priority: r.get("priority"),
                symbol_pattern: r.get("symbol_pattern"),
                exchange: r.get("exchange"),
                position_type: r.get("position_type"),
                take_profit: r.get("take_profit"),
                stop_loss: r.get("stop_loss"),
                time_conditions: r.get("time_conditions"),
            })
            .collect();

        Ok(Some(RuleSetRecord {
            version: "2.0".to_string(),
            rules,
        }))
    }
}
