//! Repository for broker account credentials.

use crate::types::BrokerAccount;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerAccountRepository: Send + Sync {
    async fn get_by_user_and_broker(
        &self,
        user_id: &str,
        broker_id: &str,
    ) -> Result<Option<BrokerAccount>>;

    /// Insert or update a user's account for one broker. Returns the
    /// account id.
    async fn create_or_update(&self, account: &BrokerAccount) -> Result<String>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Postgres-backed broker account repository.
pub struct PostgresBrokerAccountRepository {
    pool: PgPool,
}

impl PostgresBrokerAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_account(row: &sqlx::postgres::PgRow) -> BrokerAccount {
        BrokerAccount {
            id: row.get("id"),
            user_id: row.get("user_id"),
            broker_id: row.get("broker_id"),
            api_key: row.get("api_key"),
            api_secret: row.get::<Option<String>, _>("api_secret").unwrap_or_default(),
            access_token: row
                .get::<Option<String>, _>("access_token")
                .unwrap_or_default(),
            refresh_token: row.get("refresh_token"),
            token_expires_at: row.get::<Option<DateTime<Utc>>, _>("token_expires_at"),
            is_active: row.get("is_active"),
        }
    }
}

#[async_trait]
impl BrokerAccountRepository for PostgresBrokerAccountRepository {
    async fn get_by_user_and_broker(
        &self,
        user_id: &str,
        broker_id: &str,
    ) -> Result<Option<BrokerAccount>> {
        let row = sqlx::query(
            r#"
            SELECT
                id, user_id, broker_id, api_key, api_secret, access_token,
                refresh_token, token_expires_at, is_active
            FROM broker_accounts
            WHERE user_id = $1 AND broker_id = $2
            "#,
        )
        .bind(user_id)
        .bind(broker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Self::row_to_account(&r)))
    }

    async fn create_or_update(&self, account: &BrokerAccount) -> Result<String> {
        let id = if account.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            account.id.clone()
        };

        sqlx::query(
            r#"
            INSERT INTO broker_accounts (
                id, user_id, broker_id, api_key, api_secret, access_token,
                refresh_token, token_expires_at, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, broker_id) DO UPDATE SET
                api_key = EXCLUDED.api_key,
                api_secret = EXCLUDED.api_secret,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                token_expires_at = EXCLUDED.token_expires_at,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(&id)
        .bind(&account.user_id)
        .bind(&account.broker_id)
        .bind(&account.api_key)
        .bind(&account.api_secret)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.token_expires_at)
        .bind(account.is_active)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM broker_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
