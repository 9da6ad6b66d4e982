//! Exit Engine
//!
//! Per-user automated exit management: reconciles broker positions against
//! user-defined exit rules, tracks real-time prices, and squares off the
//! instant a take-profit, stop-loss or time condition fires.

pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod monitor;
pub mod prices;
pub mod rules;
pub mod supervisor;

pub use engine::{EngineStatus, TradingEngine};
pub use evaluator::{ActiveTrade, TradeState, TriggerKind};
pub use executor::ExitExecutor;
pub use monitor::{PositionDelta, PositionMonitor};
pub use prices::PriceCache;
pub use rules::{ApplyTo, ConditionType, ExitRule, RuleSet, StopLoss, TakeProfit, TimeCondition};
pub use supervisor::EngineSupervisor;
