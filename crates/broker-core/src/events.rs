//! In-process event bus for decoupled communication between components.
//!
//! Handlers subscribe globally, per event type, or per `(event type, user)`.
//! A publish dispatches to global handlers first, then type-scoped, then
//! user-scoped, awaiting each in turn; a failing handler never affects the
//! others or the publisher.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Standard event types in the trading system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "position.opened")]
    PositionOpened,
    #[serde(rename = "position.closed")]
    PositionClosed,
    #[serde(rename = "position.updated")]
    PositionUpdated,
    #[serde(rename = "order.placed")]
    OrderPlaced,
    #[serde(rename = "order.filled")]
    OrderFilled,
    #[serde(rename = "order.cancelled")]
    OrderCancelled,
    #[serde(rename = "order.rejected")]
    OrderRejected,
    #[serde(rename = "price.update")]
    PriceUpdate,
    #[serde(rename = "trigger.tp")]
    TpTriggered,
    #[serde(rename = "trigger.sl")]
    SlTriggered,
    #[serde(rename = "trigger.time")]
    TimeTrigger,
    #[serde(rename = "rule.matched")]
    RuleMatched,
    #[serde(rename = "rule.created")]
    RuleCreated,
    #[serde(rename = "rule.updated")]
    RuleUpdated,
    #[serde(rename = "rule.deleted")]
    RuleDeleted,
    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.expired")]
    SessionExpired,
    #[serde(rename = "system.error")]
    SystemError,
    #[serde(rename = "broker.connected")]
    BrokerConnected,
    #[serde(rename = "broker.disconnected")]
    BrokerDisconnected,
    #[serde(rename = "engine.started")]
    EngineStarted,
    #[serde(rename = "engine.stopped")]
    EngineStopped,
}

/// An event flowing through the bus.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, user_id: Option<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            user_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Async event handler. Errors are logged by the bus and isolated from the
/// publisher and from other handlers.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

/// Central publish/subscribe bus.
#[derive(Default)]
pub struct EventBus {
    global: RwLock<Vec<EventHandler>>,
    typed: RwLock<HashMap<EventType, Vec<EventHandler>>>,
    user: RwLock<HashMap<(EventType, String), Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self, handler: EventHandler) {
        self.global.write().unwrap().push(handler);
    }

    /// Subscribe to one event type.
    pub fn subscribe(&self, event_type: EventType, handler: EventHandler) {
        self.typed
            .write()
            .unwrap()
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Subscribe to one event type for a single user.
    pub fn subscribe_user(&self, event_type: EventType, user_id: &str, handler: EventHandler) {
        self.user
            .write()
            .unwrap()
            .entry((event_type, user_id.to_string()))
            .or_default()
            .push(handler);
    }

    /// Drop all user-scoped handlers for a user.
    pub fn remove_user_handlers(&self, user_id: &str) {
        self.user
            .write()
            .unwrap()
            .retain(|(_, uid), _| uid != user_id);
    }

    /// Publish an event. Delivery completes before this returns.
    pub async fn publish(&self, event: Event) {
        let mut handlers: Vec<EventHandler> = Vec::new();
        handlers.extend(self.global.read().unwrap().iter().cloned());
        if let Some(typed) = self.typed.read().unwrap().get(&event.event_type) {
            handlers.extend(typed.iter().cloned());
        }
        if let Some(user_id) = &event.user_id {
            let key = (event.event_type, user_id.clone());
            if let Some(scoped) = self.user.read().unwrap().get(&key) {
                handlers.extend(scoped.iter().cloned());
            }
        }

        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                warn!(event_type = ?event.event_type, error = %e, "Event handler failed");
            }
        }
    }

    /// Convenience wrapper around [`publish`](Self::publish).
    pub async fn emit(
        &self,
        event_type: EventType,
        user_id: Option<&str>,
        data: serde_json::Value,
    ) {
        self.publish(Event::new(event_type, user_id.map(str::to_string), data))
            .await;
    }
}
