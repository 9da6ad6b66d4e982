//! Latency benchmarks for the hot path: tick parsing, rule matching and
//! trigger evaluation.
//!
//! Run with: `cargo bench --bench latency`

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use broker_core::api::frame::parse_frame;
use broker_core::db::RuleRecord;
use broker_core::types::TrackedPosition;
use exit_engine::evaluator::{evaluate, ActiveTrade};
use exit_engine::rules::{ExitRule, RuleSet};
use std::sync::Arc;

fn position(symbol: &str, quantity: i64, entry: f64) -> TrackedPosition {
    TrackedPosition {
        instrument_token: 273924,
        trading_symbol: symbol.to_string(),
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

fn rule(id: &str, priority: i32, pattern: &str) -> Arc<ExitRule> {
    let record: RuleRecord = serde_json::from_value(serde_json::json!({
        "id": id,
        "name": id,
        "is_active": true,
        "priority": priority,
        "symbol_pattern": pattern,
        "exchange": null,
        "position_type": null,
        "take_profit": {"condition_type": "relative", "target": 100.0},
        "stop_loss": {"condition_type": "relative", "stop": 40.0, "trail": true},
        "time_conditions": {"start_time": "09:15", "end_time": "15:15", "square_off_time": "15:20"}
    }))
    .unwrap();
    Arc::new(ExitRule::from_record(&record).unwrap())
}

/// Build a frame of `n` LTP packets.
fn ltp_frame(n: u16) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&n.to_be_bytes());
    for i in 0..n {
        frame.extend_from_slice(&8u16.to_be_bytes());
        let token: u32 = ((1000 + i as u32) << 8) | 2;
        frame.extend_from_slice(&token.to_be_bytes());
        frame.extend_from_slice(&(36_689u32 + i as u32).to_be_bytes());
    }
    frame
}

fn bench_frame_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parsing");
    for packets in [1u16, 10, 100].iter() {
        let frame = ltp_frame(*packets);
        group.throughput(Throughput::Elements(*packets as u64));
        group.bench_with_input(BenchmarkId::new("ltp", packets), &frame, |b, frame| {
            b.iter(|| black_box(parse_frame(black_box(frame))))
        });
    }
    group.finish();
}

fn bench_rule_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_matching");
    for count in [1usize, 10, 100].iter() {
        let rules = (0..*count)
            .map(|i| rule(&format!("rule-{i}"), i as i32, "NIFTY*"))
            .chain(std::iter::once(rule("rule-sensex", 1000, "SENSEX*")))
            .collect();
        let set = RuleSet::new("2.0", rules);

        group.bench_with_input(BenchmarkId::new("worst_case", count), &set, |b, set| {
            b.iter(|| {
                black_box(set.find_match(
                    black_box("SENSEX25D0486000CE"),
                    "BFO",
                    broker_core::types::PositionType::Long,
                ))
            })
        });
    }
    group.finish();
}

fn bench_trigger_evaluation(c: &mut Criterion) {
    let now = chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(2025, 12, 4, 11, 0, 0)
        .unwrap();
    let rule = rule("bench-rule", 100, "SENSEX*");

    c.bench_function("evaluate_no_trigger", |b| {
        let mut trade = ActiveTrade::new(position("SENSEX25D0486000CE", 1000, 366.89), rule.clone());
        let mut price = 380.0;
        b.iter(|| {
            // Oscillate inside the band so the trade never triggers.
            price = if price > 381.0 { 380.0 } else { 382.0 };
            black_box(evaluate(black_box(&mut trade), black_box(price), now))
        })
    });
}

criterion_group!(
    benches,
    bench_frame_parsing,
    bench_rule_matching,
    bench_trigger_evaluation
);
criterion_main!(benches);
