//! Engine supervisor: per-user lifecycle over the trading engines.

use crate::engine::{EngineStatus, TradingEngine};
use crate::evaluator::TradeSnapshot;
use crate::executor::ExitExecutor;
use broker_core::config::EngineConfig;
use broker_core::db::RulesRepository;
use broker_core::events::{EventBus, EventType};
use broker_core::factory::ClientProvider;
use broker_core::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Owns one [`TradingEngine`] per started user. Separate users share only
/// the process singletons (bus, factory, repositories); their engines never
/// share mutable state.
pub struct EngineSupervisor {
    factory: Arc<dyn ClientProvider>,
    rules_repo: Arc<dyn RulesRepository>,
    executor: Arc<ExitExecutor>,
    bus: Arc<EventBus>,
    config: EngineConfig,
    broker_id: String,
    engines: RwLock<HashMap<String, Arc<TradingEngine>>>,
}

impl EngineSupervisor {
    pub fn new(
        factory: Arc<dyn ClientProvider>,
        rules_repo: Arc<dyn RulesRepository>,
        executor: Arc<ExitExecutor>,
        bus: Arc<EventBus>,
        config: EngineConfig,
        broker_id: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            rules_repo,
            executor,
            bus,
            config,
            broker_id: broker_id.into(),
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Start the engine for a user. Idempotent while already running; fails
    /// with [`Error::NotConfigured`] when the user has no usable broker
    /// account.
    pub async fn start(&self, user_id: &str) -> Result<()> {
        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(user_id) {
            if engine.is_running() {
                return Ok(());
            }
        }

        let session = self
            .factory
            .get_client(user_id, &self.broker_id)
            .await?
            .ok_or_else(|| Error::NotConfigured(user_id.to_string()))?;

        let engine = TradingEngine::new(
            user_id,
            self.broker_id.clone(),
            session,
            self.rules_repo.clone(),
            self.factory.clone(),
            self.executor.clone(),
            self.bus.clone(),
            self.config.clone(),
        );
        engine.start().await?;
        engines.insert(user_id.to_string(), engine);
        drop(engines);

        info!(user_id, "Engine started");
        self.bus
            .emit(EventType::EngineStarted, Some(user_id), json!({}))
            .await;
        Ok(())
    }

    /// Stop and drop the engine for a user. Idempotent while stopped.
    pub async fn stop(&self, user_id: &str) {
        let engine = self.engines.write().await.remove(user_id);
        if let Some(engine) = engine {
            engine.stop().await;
            info!(user_id, "Engine stopped");
            self.bus
                .emit(EventType::EngineStopped, Some(user_id), json!({}))
                .await;
        }
    }

    /// Stop every running engine (application shutdown).
    pub async fn stop_all(&self) {
        let engines: Vec<(String, Arc<TradingEngine>)> =
            self.engines.write().await.drain().collect();
        for (user_id, engine) in engines {
            engine.stop().await;
            self.bus
                .emit(EventType::EngineStopped, Some(user_id.as_str()), json!({}))
                .await;
        }
    }

    pub async fn status(&self, user_id: &str) -> EngineStatus {
        match self.engines.read().await.get(user_id) {
            Some(engine) => engine.status(),
            None => EngineStatus::default(),
        }
    }

    /// Point-in-time snapshot of a user's ActiveTrade set.
    pub async fn active_trades(&self, user_id: &str) -> Vec<TradeSnapshot> {
        match self.engines.read().await.get(user_id) {
            Some(engine) => engine.active_trades(),
            None => Vec::new(),
        }
    }

    pub async fn running_users(&self) -> Vec<String> {
        self.engines
            .read()
            .await
            .iter()
            .filter(|(_, engine)| engine.is_running())
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use async_trait::async_trait;
    use broker_core::api::{BrokerApi, LtpQuote, PositionBook};
    use broker_core::db::{RuleSetRecord, RulesRepository};
    use broker_core::factory::BrokerSession;
    use broker_core::types::{OrderParams, TrackedOrder};
    use std::time::Duration;

    struct IdleBroker;

    #[async_trait]
    impl BrokerApi for IdleBroker {
        async fn positions(&self) -> broker_core::Result<PositionBook> {
            Ok(PositionBook::default())
        }

        async fn orders(&self) -> broker_core::Result<Vec<TrackedOrder>> {
            Ok(Vec::new())
        }

        async fn ltp(
            &self,
            _instruments: &[String],
        ) -> broker_core::Result<std::collections::HashMap<String, LtpQuote>> {
            Ok(std::collections::HashMap::new())
        }

        async fn place_order(&self, _params: &OrderParams) -> broker_core::Result<String> {
            Ok("order-1".to_string())
        }
    }

    struct FakeProvider {
        configured_users: Vec<String>,
    }

    #[async_trait]
    impl ClientProvider for FakeProvider {
        async fn get_client(
            &self,
            user_id: &str,
            _broker_id: &str,
        ) -> broker_core::Result<Option<BrokerSession>> {
            if self.configured_users.iter().any(|u| u == user_id) {
                Ok(Some(BrokerSession {
                    api: Arc::new(IdleBroker),
                    ticker: None,
                }))
            } else {
                Ok(None)
            }
        }

        async fn invalidate(&self, _user_id: &str, _broker_id: &str) {}
    }

    struct EmptyRules;

    #[async_trait]
    impl RulesRepository for EmptyRules {
        async fn get_rules(&self, _user_id: &str) -> broker_core::Result<Option<RuleSetRecord>> {
            Ok(None)
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            position_poll_interval: Duration::from_millis(10),
            price_poll_interval: Duration::from_millis(10),
            rules_refresh_interval: Duration::from_millis(10),
            reconnect_probe_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        }
    }

    fn supervisor(configured_users: Vec<&str>) -> EngineSupervisor {
        let bus = Arc::new(EventBus::new());
        EngineSupervisor::new(
            Arc::new(FakeProvider {
                configured_users: configured_users.iter().map(|u| u.to_string()).collect(),
            }),
            Arc::new(EmptyRules),
            Arc::new(ExitExecutor::new(bus.clone(), ExecutorConfig::default())),
            bus,
            fast_config(),
            "kite",
        )
    }

    #[tokio::test]
    async fn test_start_requires_configured_account() {
        let supervisor = supervisor(vec![]);
        let result = supervisor.start("user-1").await;
        assert!(matches!(result, Err(Error::NotConfigured(_))));
        assert!(!supervisor.status("user-1").await.running);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let supervisor = supervisor(vec!["user-1"]);
        supervisor.start("user-1").await.unwrap();
        supervisor.start("user-1").await.unwrap();

        assert!(supervisor.status("user-1").await.running);
        assert_eq!(supervisor.running_users().await, vec!["user-1".to_string()]);

        supervisor.stop("user-1").await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let supervisor = supervisor(vec!["user-1"]);
        supervisor.start("user-1").await.unwrap();

        supervisor.stop("user-1").await;
        supervisor.stop("user-1").await;
        assert!(!supervisor.status("user-1").await.running);
    }

    #[tokio::test]
    async fn test_start_stop_start_yields_running_engine() {
        let supervisor = supervisor(vec!["user-1"]);
        supervisor.start("user-1").await.unwrap();
        supervisor.stop("user-1").await;
        supervisor.start("user-1").await.unwrap();

        let status = supervisor.status("user-1").await;
        assert!(status.running);
        assert!(status.started_at.is_some());

        supervisor.stop("user-1").await;
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let supervisor = supervisor(vec!["user-1", "user-2"]);
        supervisor.start("user-1").await.unwrap();
        supervisor.start("user-2").await.unwrap();

        supervisor.stop("user-1").await;
        assert!(!supervisor.status("user-1").await.running);
        assert!(supervisor.status("user-2").await.running);

        supervisor.stop_all().await;
        assert!(!supervisor.status("user-2").await.running);
    }

    #[tokio::test]
    async fn test_status_for_unknown_user_is_default() {
        let supervisor = supervisor(vec![]);
        let status = supervisor.status("nobody").await;
        assert!(!status.running);
        assert_eq!(status.active_trades, 0);
        assert!(supervisor.active_trades("nobody").await.is_empty());
    }
}
