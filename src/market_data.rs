use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Aggregated depth of the limit order book at one instant.
///
/// Levels are `(price, total quantity)`; bids are ordered highest first, asks lowest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }
}

/// Read-only view of the order book.
pub trait MarketData: Send + Sync {
    fn snapshot(&self) -> BookSnapshot;
}

/// Market data fed by whoever owns the book: the publisher pushes the latest snapshot
/// through a watch channel and readers always see the most recent one.
#[derive(Clone)]
pub struct WatchMarketData {
    rx: watch::Receiver<BookSnapshot>,
}

impl WatchMarketData {
    pub fn channel() -> (watch::Sender<BookSnapshot>, Self) {
        let (tx, rx) = watch::channel(BookSnapshot::default());
        (tx, Self { rx })
    }
}

impl MarketData for WatchMarketData {
    fn snapshot(&self) -> BookSnapshot {
        self.rx.borrow().clone()
    }
}
