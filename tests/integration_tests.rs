//! Integration tests for component interactions.
//!
//! These tests verify that the major components work together correctly:
//! stored rule records flowing through validation into trigger evaluation,
//! binary ticker frames feeding the price cache, credential encryption
//! backing broker accounts, and the event bus carrying trigger payloads.

use broker_core::api::frame::parse_frame;
use broker_core::crypto::CredentialCipher;
use broker_core::db::RuleRecord;
use broker_core::events::{EventBus, EventType};
use broker_core::types::{BrokerAccount, PositionType, TrackedPosition};
use chrono::{TimeZone, Utc};
use exit_engine::evaluator::{evaluate, ActiveTrade, TradeState, TriggerKind};
use exit_engine::prices::PriceCache;
use exit_engine::rules::ExitRule;
use std::sync::Arc;

fn sensex_position(quantity: i64, entry: f64) -> TrackedPosition {
    TrackedPosition {
        instrument_token: 273924,
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

fn rule_from_db(json: serde_json::Value) -> Arc<ExitRule> {
    let record: RuleRecord = serde_json::from_value(json).unwrap();
    Arc::new(ExitRule::from_record(&record).unwrap())
}

fn market_hours() -> chrono::DateTime<chrono_tz::Tz> {
    chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2025, 12, 4, 11, 0, 0)
        .unwrap()
}

/// A stored rule record validates, matches a live position, and drives the
/// full take-profit evaluation sequence.
#[test]
fn test_rule_record_to_trigger_pipeline() {
    let rule = rule_from_db(serde_json::json!({
        "id": "a1b2c3d4-e5f6-7890-abcd-ef0123456789",
        "name": "sensex options",
        "is_active": true,
        "priority": 100,
        "symbol_pattern": "SENSEX*",
        "exchange": "BFO",
        "position_type": "LONG",
        "take_profit": {"condition_type": "relative", "target": 100.0},
        "stop_loss": {"condition_type": "relative", "stop": 40.0},
        "time_conditions": null
    }));

    let position = sensex_position(1000, 366.89);
    assert!(rule.matches(
        &position.trading_symbol,
        &position.exchange,
        position.position_type()
    ));

    let mut trade = ActiveTrade::new(position, rule);
    assert_eq!(trade.tp_price, Some(466.89));
    assert_eq!(trade.sl_price, Some(326.89));

    let now = market_hours();
    let mut triggers = Vec::new();
    for price in [370.0, 420.0, 466.0, 467.0] {
        if let Some(kind) = evaluate(&mut trade, price, now) {
            trade.mark_triggered(kind, Utc::now());
            triggers.push((price, kind));
        }
    }

    assert_eq!(triggers, vec![(467.0, TriggerKind::Tp)]);
    assert_eq!(trade.state, TradeState::Triggered);

    // Terminal: the same trade never fires again.
    assert_eq!(evaluate(&mut trade, 500.0, now), None);
}

/// Percentage take-profit on a short position (entry 200, TP at 140).
#[test]
fn test_percentage_short_pipeline() {
    let rule = rule_from_db(serde_json::json!({
        "id": "b2c3d4e5-0000-0000-0000-000000000000",
        "name": "nifty shorts",
        "is_active": true,
        "priority": 100,
        "symbol_pattern": "NIFTY*",
        "exchange": null,
        "position_type": "SHORT",
        "take_profit": {"condition_type": "percentage", "target": 30.0},
        "stop_loss": null,
        "time_conditions": null
    }));

    let mut position = sensex_position(-500, 200.0);
    position.trading_symbol = "NIFTY25NOV24500CE".to_string();
    position.exchange = "NFO".to_string();

    let mut trade = ActiveTrade::new(position, rule);
    assert!((trade.tp_price.unwrap() - 140.0).abs() < 1e-9);

    let now = market_hours();
    let mut fired = None;
    for price in [180.0, 160.0, 140.0, 139.0] {
        if let Some(kind) = evaluate(&mut trade, price, now) {
            trade.mark_triggered(kind, Utc::now());
            fired = Some((price, kind));
            break;
        }
    }

    let (price, kind) = fired.unwrap();
    assert_eq!(kind, TriggerKind::Tp);
    assert!(price <= 140.0);
    assert_eq!(trade.position.abs_quantity(), 500);
    assert_eq!(trade.position.position_type(), PositionType::Short);
}

/// Square-off fires on the clock edge regardless of price.
#[test]
fn test_square_off_clock_edge() {
    let rule = rule_from_db(serde_json::json!({
        "id": "c3d4e5f6-0000-0000-0000-000000000000",
        "name": "eod square off",
        "is_active": true,
        "priority": 100,
        "symbol_pattern": "*",
        "exchange": null,
        "position_type": null,
        "take_profit": null,
        "stop_loss": null,
        "time_conditions": {"square_off_time": "15:20"}
    }));

    let mut trade = ActiveTrade::new(sensex_position(1000, 366.89), rule);

    let before = chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2025, 12, 4, 15, 19, 59)
        .unwrap();
    assert_eq!(evaluate(&mut trade, 370.0, before), None);

    let after = chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2025, 12, 4, 15, 20, 1)
        .unwrap();
    assert_eq!(
        evaluate(&mut trade, 370.0, after),
        Some(TriggerKind::SquareOff)
    );
}

/// A binary LTP frame flows through the parser into the price cache.
#[test]
fn test_frame_to_price_cache() {
    let token: u32 = (273924 << 8) | 5; // BFO-style segment byte, divisor 100
    let mut frame = Vec::new();
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&8u16.to_be_bytes());
    frame.extend_from_slice(&token.to_be_bytes());
    frame.extend_from_slice(&46_700u32.to_be_bytes());

    let ticks = parse_frame(&frame);
    assert_eq!(ticks.len(), 1);

    let cache = PriceCache::new();
    for tick in &ticks {
        cache.update(tick.instrument_token, tick.last_price);
    }
    assert_eq!(cache.get(token), Some(467.0));
}

/// Encrypted credentials round-trip through a broker account record.
#[test]
fn test_account_credential_round_trip() {
    let cipher = CredentialCipher::derive("process-secret", "trading-api-salt", 1_000);

    let account = BrokerAccount {
        id: "acc-1".to_string(),
        user_id: "user-1".to_string(),
        broker_id: "kite".to_string(),
        api_key: cipher.encrypt("kite-api-key").unwrap(),
        api_secret: cipher.encrypt("kite-api-secret").unwrap(),
        access_token: cipher.encrypt("daily-access-token").unwrap(),
        refresh_token: None,
        token_expires_at: Some(Utc::now() + chrono::Duration::hours(8)),
        is_active: true,
    };

    assert!(account.has_valid_token());
    assert_ne!(account.api_key, "kite-api-key");
    assert_eq!(cipher.decrypt(&account.api_key).unwrap(), "kite-api-key");
    assert_eq!(
        cipher.decrypt(&account.access_token).unwrap(),
        "daily-access-token"
    );
}

/// Trigger events carry their payloads through the bus in subscription
/// scope order.
#[tokio::test]
async fn test_trigger_event_delivery() {
    use futures_util::FutureExt;
    use std::sync::Mutex;

    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    bus.subscribe(
        EventType::TpTriggered,
        Arc::new(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(("typed", event.data["symbol"].to_string()));
                Ok(())
            }
            .boxed()
        }),
    );
    let sink = seen.clone();
    bus.subscribe_user(
        EventType::TpTriggered,
        "user-1",
        Arc::new(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(("user", event.data["symbol"].to_string()));
                Ok(())
            }
            .boxed()
        }),
    );

    bus.emit(
        EventType::TpTriggered,
        Some("user-1"),
        serde_json::json!({"symbol": "SENSEX25D0486000CE", "price": 467.0}),
    )
    .await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, "typed");
    assert_eq!(seen[1].0, "user");
    assert!(seen[0].1.contains("SENSEX25D0486000CE"));
}
