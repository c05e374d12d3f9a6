//! Read-mostly market price cache. Written by the hourly market-data
//! refresh job under a single writer; readers observe a consistent
//! snapshot without taking a lock per symbol (§5).

use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;

pub struct MarketDataCache {
    prices: RwLock<HashMap<String, Decimal>>,
}

impl MarketDataCache {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, symbol: &str, price: Decimal) {
        self.prices.write().insert(symbol.to_uppercase(), price);
    }

    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.prices.read().get(&symbol.to_uppercase()).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, Decimal> {
        self.prices.read().clone()
    }
}

impl Default for MarketDataCache {
    fn default() -> Self {
        Self::new()
    }
}
