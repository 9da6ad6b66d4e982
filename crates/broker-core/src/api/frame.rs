//! Binary tick frame parsing.
//!
//! A frame starts with a big-endian u16 packet count, followed by that many
//! length-prefixed packets. The first four bytes of every packet hold the
//! instrument token; its low byte selects the exchange segment, which fixes
//! the price divisor and tradability. Packet length selects the mode:
//! 8 = LTP, 28/32 = index quote/full, 44 = quote, 184 = full with depth.

use crate::types::{DepthLevel, MarketDepth, Ohlc, Tick, TickMode};
use chrono::{DateTime, Utc};
use tracing::debug;

// Exchange segment codes carried in the token's low byte.
const SEGMENT_CDS: u32 = 3;
const SEGMENT_BCD: u32 = 6;
const SEGMENT_INDICES: u32 = 9;

/// Parse one websocket frame into ticks. Malformed packets are dropped
/// individually; the rest of the frame still parses.
pub fn parse_frame(data: &[u8]) -> Vec<Tick> {
    let mut ticks = Vec::new();
    if data.len() < 2 {
        return ticks;
    }

    let count = u16::from_be_bytes([data[0], data[1]]) as usize;
    let mut offset = 2;
    for _ in 0..count {
        if offset + 2 > data.len() {
            debug!("Truncated frame header, dropping remainder");
            break;
        }
        let length = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;
        if offset + length > data.len() {
            debug!(length, "Truncated packet, dropping remainder");
            break;
        }
        if let Some(tick) = parse_packet(&data[offset..offset + length]) {
            ticks.push(tick);
        }
        offset += length;
    }

    ticks
}

fn parse_packet(packet: &[u8]) -> Option<Tick> {
    let token = read_u32(packet, 0)?;
    let segment = token & 0xFF;
    let divisor = match segment {
        SEGMENT_CDS => 10_000_000.0,
        SEGMENT_BCD => 10_000.0,
        _ => 100.0,
    };
    let tradable = segment != SEGMENT_INDICES;
    let price = |offset: usize| read_u32(packet, offset).map(|v| v as f64 / divisor);

    match packet.len() {
        8 => Some(Tick::ltp(token, tradable, price(4)?)),
        28 | 32 => {
            // Index packets: last price then high/low/open/close.
            let mut tick = Tick::ltp(token, tradable, price(4)?);
            tick.mode = if packet.len() == 28 {
                TickMode::Quote
            } else {
                TickMode::Full
            };
            let ohlc = Ohlc {
                high: price(8)?,
                low: price(12)?,
                open: price(16)?,
                close: price(20)?,
            };
            tick.change = percent_change(tick.last_price, ohlc.close);
            tick.ohlc = Some(ohlc);
            if packet.len() == 32 {
                tick.exchange_timestamp = read_timestamp(packet, 28);
            }
            Some(tick)
        }
        44 | 184 => {
            let mut tick = Tick::ltp(token, tradable, price(4)?);
            tick.mode = if packet.len() == 44 {
                TickMode::Quote
            } else {
                TickMode::Full
            };
            tick.last_traded_quantity = read_u32(packet, 8);
            tick.average_traded_price = price(12);
            tick.volume_traded = read_u32(packet, 16);
            tick.total_buy_quantity = read_u32(packet, 20);
            tick.total_sell_quantity = read_u32(packet, 24);
            let ohlc = Ohlc {
                open: price(28)?,
                high: price(32)?,
                low: price(36)?,
                close: price(40)?,
            };
            tick.change = percent_change(tick.last_price, ohlc.close);
            tick.ohlc = Some(ohlc);

            if packet.len() == 184 {
                tick.last_trade_time = read_timestamp(packet, 44);
                tick.oi = read_u32(packet, 48);
                tick.oi_day_high = read_u32(packet, 52);
                tick.oi_day_low = read_u32(packet, 56);
                tick.exchange_timestamp = read_timestamp(packet, 60);

                let mut depth = MarketDepth::default();
                for (i, entry_offset) in (64..184).step_by(12).enumerate() {
                    let level = DepthLevel {
                        quantity: read_u32(packet, entry_offset)?,
                        price: price(entry_offset + 4)?,
                        orders: read_u16(packet, entry_offset + 8)?,
                    };
                    if i < 5 {
                        depth.buy.push(level);
                    } else {
                        depth.sell.push(level);
                    }
                }
                tick.depth = Some(depth);
            }
            Some(tick)
        }
        other => {
            debug!(length = other, token, "Unknown packet length, dropping tick");
            None
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn read_timestamp(data: &[u8], offset: usize) -> Option<DateTime<Utc>> {
    let secs = read_u32(data, offset)?;
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
}

fn percent_change(last_price: f64, close: f64) -> Option<f64> {
    if close == 0.0 {
        Some(0.0)
    } else {
        Some((last_price - close) * 100.0 / close)
    }
}
