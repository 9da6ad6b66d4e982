//! Per-user broker client factory.
//!
//! Builds authenticated broker clients from encrypted account credentials
//! and caches them per `(user, broker)`. A cached client is only handed out
//! while its account snapshot still carries a valid token; credential
//! updates must go through [`BrokerClientFactory::invalidate`].

use crate::api::{BrokerApi, KiteClient, TickerConnector};
use crate::config::{BrokerConfig, TickerConfig};
use crate::crypto::CredentialCipher;
use crate::db::BrokerAccountRepository;
use crate::types::BrokerAccount;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// An authenticated broker session: the REST capability plus, when the
/// broker offers streaming, a connector for the ticker.
#[derive(Clone)]
pub struct BrokerSession {
    pub api: Arc<dyn BrokerApi>,
    pub ticker: Option<TickerConnector>,
}

struct CachedSession {
    session: BrokerSession,
    account: BrokerAccount,
}

/// Issues and invalidates broker sessions. The engine depends on this seam
/// rather than on the concrete factory.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Get or create a broker session for a user. `None` means the user has
    /// no usable account (missing, inactive, or token invalid).
    async fn get_client(&self, user_id: &str, broker_id: &str) -> Result<Option<BrokerSession>>;

    /// Purge any cached session for a user.
    async fn invalidate(&self, user_id: &str, broker_id: &str);
}

/// Factory and cache for per-user broker sessions.
pub struct BrokerClientFactory {
    accounts: Arc<dyn BrokerAccountRepository>,
    cipher: Arc<CredentialCipher>,
    broker_config: BrokerConfig,
    ticker_config: TickerConfig,
    cache: RwLock<HashMap<(String, String), CachedSession>>,
}

impl BrokerClientFactory {
    pub fn new(
        accounts: Arc<dyn BrokerAccountRepository>,
        cipher: Arc<CredentialCipher>,
        broker_config: BrokerConfig,
        ticker_config: TickerConfig,
    ) -> Self {
        Self {
            accounts,
            cipher,
            broker_config,
            ticker_config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a broker session for a user. Returns `None` when the
    /// user has no account, the account is inactive, or its token is
    /// missing or expired.
    pub async fn get_client(
        &self,
        user_id: &str,
        broker_id: &str,
    ) -> Result<Option<BrokerSession>> {
        let key = (user_id.to_string(), broker_id.to_string());

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.account.has_valid_token() {
                    return Ok(Some(cached.session.clone()));
                }
            }
        }

        let Some(account) = self
            .accounts
            .get_by_user_and_broker(user_id, broker_id)
            .await?
        else {
            warn!(user_id, broker_id, "No broker account found");
            return Ok(None);
        };

        if !account.is_active {
            warn!(user_id, broker_id, "Broker account is inactive");
            return Ok(None);
        }
        if !account.has_valid_token() {
            warn!(user_id, broker_id, "Broker token missing or expired");
            return Ok(None);
        }

        let Some(session) = self.build_session(&account)? else {
            return Ok(None);
        };

        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CachedSession {
                session: session.clone(),
                account,
            },
        );
        info!(user_id, broker_id, "Created broker client");
        Ok(Some(session))
    }

    fn build_session(&self, account: &BrokerAccount) -> Result<Option<BrokerSession>> {
        let api_key = self.cipher.decrypt(&account.api_key)?;
        let access_token = self.cipher.decrypt(&account.access_token)?;

        match account.broker_id.as_str() {
            "kite" => {
                let api = Arc::new(KiteClient::new(
                    self.broker_config.api_base.clone(),
                    api_key.clone(),
                    access_token.clone(),
                    self.broker_config.http_timeout,
                )?);
                let ticker = self.broker_config.ws_url.as_ref().map(|ws_url| {
                    TickerConnector::new(
                        ws_url.clone(),
                        api_key,
                        access_token,
                        self.ticker_config.clone(),
                    )
                });
                Ok(Some(BrokerSession { api, ticker }))
            }
            other => {
                warn!(broker_id = other, "Unknown broker id");
                Ok(None)
            }
        }
    }

    /// Purge the cached session for a user. Call whenever credentials are
    /// updated, tokens refreshed or OAuth is redone.
    pub async fn invalidate(&self, user_id: &str, broker_id: &str) {
        let key = (user_id.to_string(), broker_id.to_string());
        if self.cache.write().await.remove(&key).is_some() {
            info!(user_id, broker_id, "Invalidated broker client cache");
        }
    }

    /// Drop every cached session.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
        info!("Cleared broker client cache");
    }
}

#[async_trait]
impl ClientProvider for BrokerClientFactory {
    async fn get_client(&self, user_id: &str, broker_id: &str) -> Result<Option<BrokerSession>> {
        BrokerClientFactory::get_client(self, user_id, broker_id).await
    }

    async fn invalidate(&self, user_id: &str, broker_id: &str) {
        BrokerClientFactory::invalidate(self, user_id, broker_id).await;
    }
}
