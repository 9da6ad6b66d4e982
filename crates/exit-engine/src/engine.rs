//! Per-user trading engine.
//!
//! One engine owns one user's control loops: position polling, price
//! updates (streaming ticker or LTP polling fallback, chosen at startup)
//! and rules refresh, all sharing a single cancellation token. Trigger
//! evaluation runs on every price update. The ActiveTrade set sits behind a
//! mutex taken only for short critical sections; broker calls always happen
//! outside it, and the triggered transition is a compare-and-set under that
//! lock so the executor runs at most once per trade.

use crate::evaluator::{evaluate, ActiveTrade, TradeSnapshot, TradeState, TriggerKind};
use crate::executor::ExitExecutor;
use crate::monitor::{PositionDelta, PositionMonitor};
use crate::prices::PriceCache;
use crate::rules::{ExitRule, RuleSet};
use broker_core::api::{BrokerApi, TickerConnector, TickerEvent, TickerHandle};
use broker_core::config::EngineConfig;
use broker_core::db::RulesRepository;
use broker_core::events::{EventBus, EventType};
use broker_core::factory::{BrokerSession, ClientProvider};
use broker_core::types::{TickMode, TrackedPosition};
use broker_core::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Point-in-time engine status.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub active_trades: usize,
    pub positions_monitored: usize,
    pub rules_loaded: usize,
    pub ticker_connected: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            running: false,
            active_trades: 0,
            positions_monitored: 0,
            rules_loaded: 0,
            ticker_connected: false,
            started_at: None,
        }
    }
}

/// Automated exit management for a single user.
pub struct TradingEngine {
    user_id: String,
    broker_id: String,
    config: EngineConfig,
    bus: Arc<EventBus>,
    factory: Arc<dyn ClientProvider>,
    rules_repo: Arc<dyn RulesRepository>,
    executor: Arc<ExitExecutor>,
    api: AsyncRwLock<Arc<dyn BrokerApi>>,
    ticker: Option<TickerConnector>,
    ticker_handle: StdMutex<Option<TickerHandle>>,
    ticker_connected: AtomicBool,
    monitor: StdMutex<PositionMonitor>,
    trades: StdMutex<HashMap<String, ActiveTrade>>,
    rules: StdRwLock<Arc<RuleSet>>,
    reported_invalid_rules: StdMutex<HashSet<String>>,
    prices: Arc<PriceCache>,
    shutdown: CancellationToken,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    started_at: StdMutex<Option<DateTime<Utc>>>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        broker_id: impl Into<String>,
        session: BrokerSession,
        rules_repo: Arc<dyn RulesRepository>,
        factory: Arc<dyn ClientProvider>,
        executor: Arc<ExitExecutor>,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            broker_id: broker_id.into(),
            config,
            bus,
            factory,
            rules_repo,
            executor,
            api: AsyncRwLock::new(session.api),
            ticker: session.ticker,
            ticker_handle: StdMutex::new(None),
            ticker_connected: AtomicBool::new(false),
            monitor: StdMutex::new(PositionMonitor::new()),
            trades: StdMutex::new(HashMap::new()),
            rules: StdRwLock::new(Arc::new(RuleSet::default())),
            reported_invalid_rules: StdMutex::new(HashSet::new()),
            prices: Arc::new(PriceCache::new()),
            shutdown: CancellationToken::new(),
            tasks: AsyncMutex::new(Vec::new()),
            running: AtomicBool::new(false),
            started_at: StdMutex::new(None),
        })
    }

    /// Start the control loops. Idempotent while already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.load_rules().await?;
        *self.started_at.lock().unwrap() = Some(Utc::now());

        let mut tasks = self.tasks.lock().await;

        let engine = self.clone();
        tasks.push(self.spawn_supervised("position-poll", async move {
            engine.position_loop().await;
        }));

        if let Some(connector) = &self.ticker {
            let (handle, events) = connector.spawn(self.shutdown.clone());
            *self.ticker_handle.lock().unwrap() = Some(handle);
            let engine = self.clone();
            tasks.push(self.spawn_supervised("ticker", async move {
                engine.ticker_loop(events).await;
            }));
        } else {
            info!(user_id = %self.user_id, "No ticker configured, using LTP polling");
            let engine = self.clone();
            tasks.push(self.spawn_supervised("price-poll", async move {
                engine.price_poll_loop().await;
            }));
        }

        let engine = self.clone();
        tasks.push(self.spawn_supervised("rules-refresh", async move {
            engine.rules_loop().await;
        }));

        info!(user_id = %self.user_id, "Trading engine started");
        Ok(())
    }

    /// Stop all loops, drain them, and unsubscribe every tracked token.
    /// Idempotent while already stopped.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let tokens: Vec<u32> = {
            let trades = self.trades.lock().unwrap();
            trades
                .values()
                .map(|t| t.position.instrument_token)
                .collect()
        };
        let handle = self.ticker_handle.lock().unwrap().clone();
        if let Some(handle) = handle {
            if !tokens.is_empty() {
                let _ = handle.unsubscribe(tokens).await;
            }
        }

        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        self.trades.lock().unwrap().clear();
        *self.ticker_handle.lock().unwrap() = None;
        self.ticker_connected.store(false, Ordering::SeqCst);
        *self.started_at.lock().unwrap() = None;
        info!(user_id = %self.user_id, "Trading engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.is_running(),
            active_trades: self.trades.lock().unwrap().len(),
            positions_monitored: self.monitor.lock().unwrap().position_count(),
            rules_loaded: self.rules.read().unwrap().len(),
            ticker_connected: self.ticker_connected.load(Ordering::SeqCst),
            started_at: *self.started_at.lock().unwrap(),
        }
    }

    /// Snapshot of the ActiveTrade set.
    pub fn active_trades(&self) -> Vec<TradeSnapshot> {
        self.trades
            .lock()
            .unwrap()
            .values()
            .map(ActiveTrade::snapshot)
            .collect()
    }

    /// Spawn an activity whose panics become `SYSTEM_ERROR` events instead
    /// of killing sibling activities.
    fn spawn_supervised(
        &self,
        activity: &'static str,
        fut: impl Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let message = panic_message(&panic);
                error!(user_id = %user_id, activity, message = %message, "Engine activity panicked");
                bus.emit(
                    EventType::SystemError,
                    Some(user_id.as_str()),
                    json!({"activity": activity, "error": message}),
                )
                .await;
            }
        })
    }

    // Position polling

    async fn position_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.position_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let api = self.api.read().await.clone();
            match api.positions().await {
                Ok(book) => {
                    consecutive_errors = 0;
                    let deltas = self.monitor.lock().unwrap().apply_positions(book.net);
                    for delta in deltas {
                        self.handle_delta(delta).await;
                    }
                    match api.orders().await {
                        Ok(orders) => {
                            self.monitor.lock().unwrap().apply_orders(orders);
                        }
                        Err(e) => debug!(user_id = %self.user_id, error = %e, "Order poll failed"),
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        user_id = %self.user_id,
                        consecutive_errors,
                        error = %e,
                        "Position poll failed"
                    );
                    if e.is_auth() || consecutive_errors >= self.config.auth_failure_threshold {
                        consecutive_errors = 0;
                        self.wait_for_fresh_client(&e).await;
                    }
                }
            }
        }
    }

    /// Pause until the factory re-issues a client with a valid token.
    async fn wait_for_fresh_client(&self, cause: &Error) {
        warn!(user_id = %self.user_id, cause = %cause, "Broker disconnected, waiting for fresh client");
        self.bus
            .emit(
                EventType::BrokerDisconnected,
                Some(self.user_id.as_str()),
                json!({"error": cause.to_string()}),
            )
            .await;
        self.factory.invalidate(&self.user_id, &self.broker_id).await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(self.config.reconnect_probe_interval) => {}
            }
            match self.factory.get_client(&self.user_id, &self.broker_id).await {
                Ok(Some(session)) => {
                    *self.api.write().await = session.api;
                    info!(user_id = %self.user_id, "Broker client re-issued");
                    self.bus
                        .emit(EventType::BrokerConnected, Some(self.user_id.as_str()), json!({}))
                        .await;
                    return;
                }
                Ok(None) => debug!(user_id = %self.user_id, "Still waiting for a valid broker token"),
                Err(e) => warn!(user_id = %self.user_id, error = %e, "Client re-issue failed"),
            }
        }
    }

    async fn handle_delta(self: &Arc<Self>, delta: PositionDelta) {
        match delta {
            PositionDelta::Opened(position) => self.on_position_opened(position).await,
            PositionDelta::Updated {
                position,
                previous_quantity,
            } => {
                self.bus
                    .emit(
                        EventType::PositionUpdated,
                        Some(self.user_id.as_str()),
                        json!({
                            "symbol": &position.trading_symbol,
                            "exchange": &position.exchange,
                            "quantity": position.quantity,
                            "previous_quantity": previous_quantity,
                        }),
                    )
                    .await;
                let key = position.symbol_key();
                let mut trades = self.trades.lock().unwrap();
                if let Some(trade) = trades.get_mut(&key) {
                    // Exit quantity follows the position; the rule snapshot
                    // and trigger prices stay fixed.
                    trade.position = position;
                }
            }
            PositionDelta::Closed(position) => self.on_position_closed(position).await,
        }
    }

    async fn on_position_opened(self: &Arc<Self>, position: TrackedPosition) {
        self.bus
            .emit(
                EventType::PositionOpened,
                Some(self.user_id.as_str()),
                json!({
                    "symbol": &position.trading_symbol,
                    "exchange": &position.exchange,
                    "position_type": position.position_type().as_str(),
                    "quantity": position.quantity,
                    "entry_price": position.entry_price(),
                }),
            )
            .await;

        let rule = {
            let rules = self.rules.read().unwrap().clone();
            rules.find_match(
                &position.trading_symbol,
                &position.exchange,
                position.position_type(),
            )
        };
        let Some(rule) = rule else {
            info!(
                user_id = %self.user_id,
                symbol = %position.trading_symbol,
                "No rule for position, skipping"
            );
            return;
        };

        let token = position.instrument_token;
        let trade = ActiveTrade::new(position, rule.clone());
        info!(
            user_id = %self.user_id,
            symbol = %trade.position.trading_symbol,
            rule_id = %rule.rule_id,
            entry = trade.position.entry_price(),
            tp = ?trade.tp_price,
            sl = ?trade.sl_price,
            "Tracking position"
        );
        self.bus
            .emit(
                EventType::RuleMatched,
                Some(self.user_id.as_str()),
                json!({
                    "symbol": &trade.position.trading_symbol,
                    "rule_id": &rule.rule_id,
                    "rule_name": &rule.name,
                    "tp_price": trade.tp_price,
                    "sl_price": trade.sl_price,
                }),
            )
            .await;

        let key = trade.symbol_key();
        self.trades.lock().unwrap().insert(key, trade);

        let handle = self.ticker_handle.lock().unwrap().clone();
        if let Some(handle) = handle {
            if let Err(e) = handle.subscribe(vec![token]).await {
                warn!(user_id = %self.user_id, error = %e, "Ticker subscribe failed");
            } else if let Err(e) = handle.set_mode(TickMode::Ltp, vec![token]).await {
                warn!(user_id = %self.user_id, error = %e, "Ticker mode change failed");
            }
        }
    }

    async fn on_position_closed(self: &Arc<Self>, position: TrackedPosition) {
        self.bus
            .emit(
                EventType::PositionClosed,
                Some(self.user_id.as_str()),
                json!({
                    "symbol": &position.trading_symbol,
                    "exchange": &position.exchange,
                }),
            )
            .await;

        let key = position.symbol_key();
        let removed = {
            let mut trades = self.trades.lock().unwrap();
            trades.remove(&key).map(|mut trade| {
                if trade.state != TradeState::Triggered {
                    trade.state = TradeState::ClosedExternal;
                }
                trade
            })
        };

        if let Some(trade) = removed {
            info!(
                user_id = %self.user_id,
                symbol = %trade.position.trading_symbol,
                state = ?trade.state,
                "Stopped tracking closed position"
            );
            let token = trade.position.instrument_token;
            self.prices.remove(token);
            let handle = self.ticker_handle.lock().unwrap().clone();
            if let Some(handle) = handle {
                let _ = handle.unsubscribe(vec![token]).await;
            }
        }
    }

    // Price handling

    async fn ticker_loop(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<TickerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(TickerEvent::Tick(tick)) => {
                    self.prices.update(tick.instrument_token, tick.last_price);
                    self.evaluate_token(tick.instrument_token, tick.last_price)
                        .await;
                }
                Some(TickerEvent::Connected) => {
                    self.ticker_connected.store(true, Ordering::SeqCst);
                }
                Some(TickerEvent::Disconnected) => {
                    self.ticker_connected.store(false, Ordering::SeqCst);
                }
                Some(TickerEvent::Reconnecting { attempt }) => {
                    debug!(user_id = %self.user_id, attempt, "Ticker reconnecting");
                }
                Some(TickerEvent::Error(message)) => {
                    warn!(user_id = %self.user_id, message = %message, "Ticker error");
                    self.bus
                        .emit(
                            EventType::SystemError,
                            Some(self.user_id.as_str()),
                            json!({"source": "ticker", "error": message}),
                        )
                        .await;
                }
                None => break,
            }
        }
    }

    async fn price_poll_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.price_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let keys: Vec<String> = {
                let trades = self.trades.lock().unwrap();
                trades.values().map(|t| t.position.symbol_key()).collect()
            };
            if keys.is_empty() {
                continue;
            }

            let api = self.api.read().await.clone();
            match api.ltp(&keys).await {
                Ok(quotes) => {
                    for quote in quotes.values() {
                        self.prices.update(quote.instrument_token, quote.last_price);
                    }
                }
                Err(e) => error!(user_id = %self.user_id, error = %e, "LTP fetch failed"),
            }

            // Evaluate everything, falling back to the position's carried
            // last price when the cache has no fresher value.
            let targets: Vec<(u32, f64)> = {
                let trades = self.trades.lock().unwrap();
                let mut seen = HashSet::new();
                trades
                    .values()
                    .filter(|t| t.state != TradeState::Triggered)
                    .filter(|t| seen.insert(t.position.instrument_token))
                    .map(|t| {
                        let token = t.position.instrument_token;
                        let price = self.prices.get(token).unwrap_or(t.position.last_price);
                        (token, price)
                    })
                    .collect()
            };
            for (token, price) in targets {
                self.evaluate_token(token, price).await;
            }
        }
    }

    /// Evaluate every trade holding this token against a new price. The
    /// triggered transition happens under the trades lock; order placement
    /// happens strictly after it is released.
    async fn evaluate_token(self: &Arc<Self>, instrument_token: u32, price: f64) {
        self.bus
            .emit(
                EventType::PriceUpdate,
                Some(self.user_id.as_str()),
                json!({"instrument_token": instrument_token, "last_price": price}),
            )
            .await;

        let now = Utc::now().with_timezone(&self.config.timezone);
        let fired: Vec<(ActiveTrade, TriggerKind)> = {
            let mut trades = self.trades.lock().unwrap();
            let mut fired = Vec::new();
            for trade in trades
                .values_mut()
                .filter(|t| t.position.instrument_token == instrument_token)
            {
                if let Some(kind) = evaluate(trade, price, now) {
                    trade.mark_triggered(kind, Utc::now());
                    fired.push((trade.clone(), kind));
                }
            }
            fired
        };

        for (trade, kind) in fired {
            self.fire_exit(trade, kind).await;
        }
    }

    async fn fire_exit(self: &Arc<Self>, trade: ActiveTrade, kind: TriggerKind) {
        let position = &trade.position;
        info!(
            user_id = %self.user_id,
            symbol = %position.trading_symbol,
            trigger = kind.as_str(),
            price = trade.current_price,
            entry = position.entry_price(),
            "Exit triggered"
        );
        self.bus
            .emit(
                kind.event_type(),
                Some(self.user_id.as_str()),
                json!({
                    "symbol": &position.trading_symbol,
                    "exchange": &position.exchange,
                    "trigger_type": kind.as_str(),
                    "price": trade.current_price,
                    "entry_price": position.entry_price(),
                    "quantity": position.quantity,
                    "rule_id": &trade.rule.rule_id,
                }),
            )
            .await;

        let api = self.api.read().await.clone();
        if let Err(e) = self
            .executor
            .execute(api.as_ref(), &self.user_id, &trade, kind)
            .await
        {
            // ORDER_REJECTED is already on the bus; the trade stays
            // triggered and is never retried automatically.
            error!(
                user_id = %self.user_id,
                symbol = %position.trading_symbol,
                error = %e,
                "Exit order failed"
            );
        }
    }

    // Rules

    async fn rules_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.rules_refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.load_rules().await {
                error!(user_id = %self.user_id, error = %e, "Rules refresh failed");
            }
        }
    }

    /// Rebuild the rule set from the repository and swap it in atomically.
    /// Live trades keep their rule snapshots; only future matches see the
    /// new set.
    async fn load_rules(&self) -> Result<()> {
        let record = self.rules_repo.get_rules(&self.user_id).await?;

        let mut version = "2.0".to_string();
        let mut rules: Vec<Arc<ExitRule>> = Vec::new();
        if let Some(set) = record {
            version = set.version;
            for record in &set.rules {
                if !record.is_active {
                    continue;
                }
                match ExitRule::from_record(record) {
                    Ok(rule) => rules.push(Arc::new(rule)),
                    Err(e) => {
                        warn!(
                            user_id = %self.user_id,
                            rule_id = %record.id,
                            error = %e,
                            "Skipping invalid rule"
                        );
                        let first_report = self
                            .reported_invalid_rules
                            .lock()
                            .unwrap()
                            .insert(record.id.clone());
                        if first_report {
                            self.bus
                                .emit(
                                    EventType::SystemError,
                                    Some(self.user_id.as_str()),
                                    json!({"rule_id": &record.id, "error": e.to_string()}),
                                )
                                .await;
                        }
                    }
                }
            }
        }

        let count = rules.len();
        *self.rules.write().unwrap() = Arc::new(RuleSet::new(version, rules));
        debug!(user_id = %self.user_id, count, "Rules loaded");
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use async_trait::async_trait;
    use broker_core::api::{LtpQuote, PositionBook};
    use broker_core::db::{RuleRecord, RuleSetRecord};
    use broker_core::events::Event;
    use broker_core::types::{OrderParams, TrackedOrder, TransactionType};
    use std::time::Duration;

    const TOKEN: u32 = 273924;

    /// Broker double: positions and the last price are test-controlled.
    struct FakeBroker {
        net: StdMutex<Vec<TrackedPosition>>,
        price: StdMutex<f64>,
        placed: StdMutex<Vec<OrderParams>>,
    }

    impl FakeBroker {
        fn new(net: Vec<TrackedPosition>, price: f64) -> Arc<Self> {
            Arc::new(Self {
                net: StdMutex::new(net),
                price: StdMutex::new(price),
                placed: StdMutex::new(Vec::new()),
            })
        }

        fn set_price(&self, price: f64) {
            *self.price.lock().unwrap() = price;
        }

        fn set_positions(&self, net: Vec<TrackedPosition>) {
            *self.net.lock().unwrap() = net;
        }

        fn placed(&self) -> Vec<OrderParams> {
            self.placed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerApi for FakeBroker {
        async fn positions(&self) -> Result<PositionBook> {
            Ok(PositionBook {
                net: self.net.lock().unwrap().clone(),
                day: Vec::new(),
            })
        }

        async fn orders(&self) -> Result<Vec<TrackedOrder>> {
            Ok(Vec::new())
        }

        async fn ltp(&self, instruments: &[String]) -> Result<HashMap<String, LtpQuote>> {
            let price = *self.price.lock().unwrap();
            Ok(instruments
                .iter()
                .map(|key| {
                    (
                        key.clone(),
                        LtpQuote {
                            instrument_token: TOKEN,
                            last_price: price,
                        },
                    )
                })
                .collect())
        }

        async fn place_order(&self, params: &OrderParams) -> Result<String> {
            self.placed.lock().unwrap().push(params.clone());
            Ok("230714000000001".to_string())
        }
    }

    struct FakeRules {
        record: StdMutex<Option<RuleSetRecord>>,
    }

    impl FakeRules {
        fn new(record: Option<RuleSetRecord>) -> Arc<Self> {
            Arc::new(Self {
                record: StdMutex::new(record),
            })
        }

        fn replace(&self, record: Option<RuleSetRecord>) {
            *self.record.lock().unwrap() = record;
        }
    }

    #[async_trait]
    impl RulesRepository for FakeRules {
        async fn get_rules(&self, _user_id: &str) -> Result<Option<RuleSetRecord>> {
            Ok(self.record.lock().unwrap().clone())
        }
    }

    struct FakeProvider {
        api: Arc<FakeBroker>,
    }

    #[async_trait]
    impl ClientProvider for FakeProvider {
        async fn get_client(
            &self,
            _user_id: &str,
            _broker_id: &str,
        ) -> Result<Option<BrokerSession>> {
            Ok(Some(BrokerSession {
                api: self.api.clone(),
                ticker: None,
            }))
        }

        async fn invalidate(&self, _user_id: &str, _broker_id: &str) {}
    }

    fn position(quantity: i64, entry: f64) -> TrackedPosition {
        TrackedPosition {
            instrument_token: TOKEN,
            trading_symbol: "SENSEX25D0486000CE".to_string(),
            exchange: "BFO".to_string(),
            product: "NRML".to_string(),
            quantity,
            average_price: entry,
            last_price: entry,
            pnl: 0.0,
            buy_quantity: quantity.max(0),
            sell_quantity: (-quantity).max(0),
            buy_price: entry,
            sell_price: entry,
            multiplier: 1,
            first_seen: Utc::now(),
            last_updated: Utc::now(),
        }
    }

    fn rule_record(id: &str, take_profit: serde_json::Value) -> RuleRecord {
        RuleRecord {
            id: id.to_string(),
            name: "sensex options".to_string(),
            is_active: true,
            priority: 100,
            symbol_pattern: Some("SENSEX*".to_string()),
            exchange: None,
            position_type: None,
            take_profit: Some(take_profit),
            stop_loss: None,
            time_conditions: None,
        }
    }

    fn rule_set(rules: Vec<RuleRecord>) -> Option<RuleSetRecord> {
        Some(RuleSetRecord {
            version: "2.0".to_string(),
            rules,
        })
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

    fn build_engine(
        broker: Arc<FakeBroker>,
        rules: Arc<FakeRules>,
        bus: Arc<EventBus>,
    ) -> Arc<TradingEngine> {
        TradingEngine::new(
            "user-1",
            "kite",
            BrokerSession {
                api: broker.clone(),
                ticker: None,
            },
            rules,
            Arc::new(FakeProvider { api: broker }),
            Arc::new(ExitExecutor::new(
                bus.clone(),
                ExecutorConfig {
                    max_retries: 3,
                    retry_base_delay: Duration::from_millis(1),
                },
            )),
            bus,
            fast_config(),
        )
    }

    fn record_events(bus: &EventBus, event_type: EventType) -> Arc<StdMutex<Vec<Event>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(
            event_type,
            Arc::new(move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                    Ok(())
                }
                .boxed()
            }),
        );
        events
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn test_position_flows_to_single_exit_order() {
        let broker = FakeBroker::new(vec![position(1000, 366.89)], 370.0);
        let rules = FakeRules::new(rule_set(vec![rule_record(
            "a1b2c3d4-e5f6-7890-abcd-ef0123456789",
            serde_json::json!({"condition_type": "relative", "target": 100.0}),
        )]));
        let bus = Arc::new(EventBus::new());
        let placed_events = record_events(&bus, EventType::OrderPlaced);
        let tp_events = record_events(&bus, EventType::TpTriggered);

        let engine = build_engine(broker.clone(), rules, bus);
        engine.start().await.unwrap();
        settle().await;

        // Below TP: tracking, no orders.
        assert_eq!(engine.active_trades().len(), 1);
        assert!(broker.placed().is_empty());

        // Cross the TP and stay above it for several polls.
        broker.set_price(467.0);
        settle().await;

        let placed = broker.placed();
        assert_eq!(placed.len(), 1, "exactly one exit order");
        assert_eq!(placed[0].transaction_type, TransactionType::Sell);
        assert_eq!(placed[0].quantity, 1000);
        assert_eq!(placed[0].variety, "regular");
        assert_eq!(placed[0].tag.as_deref(), Some("TP_a1b2c3d4"));

        assert_eq!(tp_events.lock().unwrap().len(), 1);
        assert_eq!(placed_events.lock().unwrap().len(), 1);

        let trades = engine.active_trades();
        assert_eq!(trades[0].state, TradeState::Triggered);

        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_zero_quantity_position_is_ignored() {
        let broker = FakeBroker::new(vec![position(0, 366.89)], 370.0);
        let rules = FakeRules::new(rule_set(vec![rule_record(
            "a1b2c3d4-e5f6-7890-abcd-ef0123456789",
            serde_json::json!({"condition_type": "relative", "target": 1.0}),
        )]));
        let bus = Arc::new(EventBus::new());
        let opened = record_events(&bus, EventType::PositionOpened);

        let engine = build_engine(broker.clone(), rules, bus);
        engine.start().await.unwrap();
        settle().await;

        assert!(opened.lock().unwrap().is_empty());
        assert!(engine.active_trades().is_empty());
        assert!(broker.placed().is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_closed_position_stops_tracking() {
        let broker = FakeBroker::new(vec![position(1000, 366.89)], 370.0);
        let rules = FakeRules::new(rule_set(vec![rule_record(
            "a1b2c3d4-e5f6-7890-abcd-ef0123456789",
            serde_json::json!({"condition_type": "relative", "target": 1000.0}),
        )]));
        let bus = Arc::new(EventBus::new());
        let closed = record_events(&bus, EventType::PositionClosed);

        let engine = build_engine(broker.clone(), rules, bus);
        engine.start().await.unwrap();
        settle().await;
        assert_eq!(engine.active_trades().len(), 1);

        broker.set_positions(Vec::new());
        settle().await;

        assert!(engine.active_trades().is_empty());
        assert_eq!(closed.lock().unwrap().len(), 1);
        assert!(broker.placed().is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_rule_edits_do_not_affect_live_trades() {
        let broker = FakeBroker::new(vec![position(1000, 366.89)], 370.0);
        let rules = FakeRules::new(rule_set(vec![rule_record(
            "a1b2c3d4-e5f6-7890-abcd-ef0123456789",
            serde_json::json!({"condition_type": "relative", "target": 100.0}),
        )]));
        let bus = Arc::new(EventBus::new());

        let engine = build_engine(broker.clone(), rules.clone(), bus);
        engine.start().await.unwrap();
        settle().await;
        assert_eq!(engine.active_trades().len(), 1);

        // Tighten the stored rule to TP +10 while the trade is live.
        rules.replace(rule_set(vec![rule_record(
            "a1b2c3d4-e5f6-7890-abcd-ef0123456789",
            serde_json::json!({"condition_type": "relative", "target": 10.0}),
        )]));
        settle().await;

        // 380 satisfies the edited rule but not the snapshot; no exit.
        broker.set_price(380.0);
        settle().await;
        assert!(broker.placed().is_empty());

        // The original snapshot target still fires.
        broker.set_price(467.0);
        settle().await;
        assert_eq!(broker.placed().len(), 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_rule_skipped_with_system_error() {
        let broker = FakeBroker::new(Vec::new(), 100.0);
        let rules = FakeRules::new(rule_set(vec![RuleRecord {
            id: "broken-rule".to_string(),
            name: "broken".to_string(),
            is_active: true,
            priority: 1,
            symbol_pattern: Some("*".to_string()),
            exchange: None,
            position_type: None,
            take_profit: Some(serde_json::json!({"condition_type": "fibonacci", "target": 1.0})),
            stop_loss: None,
            time_conditions: None,
        }]));
        let bus = Arc::new(EventBus::new());
        let errors = record_events(&bus, EventType::SystemError);

        let engine = build_engine(broker, rules, bus);
        engine.start().await.unwrap();
        settle().await;

        assert_eq!(engine.status().rules_loaded, 0);
        // Reported once, not once per refresh.
        assert_eq!(errors.lock().unwrap().len(), 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_engine_start_is_idempotent() {
        let broker = FakeBroker::new(Vec::new(), 100.0);
        let rules = FakeRules::new(None);
        let bus = Arc::new(EventBus::new());

        let engine = build_engine(broker, rules, bus);
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
        assert!(engine.status().started_at.is_none());
    }
}
