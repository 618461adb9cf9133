use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// An execution reported back to a participant by the external matching engine.
///
/// - `order_id` is the participant's own order that traded.
/// - `price` is the execution price, which may differ from the order's limit.
/// - A single order can receive several fills (partial executions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: SystemTime,
}

impl Fill {
    pub fn new(order_id: u64, price: f64, quantity: f64) -> Self {
        Self {
            order_id,
            price,
            quantity,
            timestamp: SystemTime::now(),
        }
    }
}
