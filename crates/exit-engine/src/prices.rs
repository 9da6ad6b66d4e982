//! Last-price cache shared between the price source and evaluation.

use dashmap::DashMap;

/// Most recent price per instrument token. Written by the price source task,
/// read by trigger evaluation. Holds only the latest value; a missing token
/// means evaluation falls back to the position's own `last_price`.
#[derive(Default)]
pub struct PriceCache {
    prices: DashMap<u32, f64>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, instrument_token: u32, price: f64) {
        self.prices.insert(instrument_token, price);
    }

    pub fn get(&self, instrument_token: u32) -> Option<f64> {
        self.prices.get(&instrument_token).map(|p| *p)
    }

    pub fn remove(&self, instrument_token: u32) {
        self.prices.remove(&instrument_token);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}
