use std::{fmt, str::FromStr, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::errors::OrderError;

/// Symbol used by single-instrument sessions.
pub const DEFAULT_SYMBOL: &str = "SMBL";

/// Client id carried by orders that have no assigned participant.
pub const HUMAN_CLIENT: &str = "HUMAN";

/// Represents which side of the market the order is on.
///
/// - `Bid`: the participant wants to buy. Demand-side schedules price these.
/// - `Ask`: the participant wants to sell. Supply-side schedules price these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "BID",
            Side::Ask => "ASK",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BID" | "BUY" => Ok(Side::Bid),
            "ASK" | "SELL" => Ok(Side::Ask),
            _ => Err(OrderError::InvalidSide(s.to_string())),
        }
    }
}

/// Specifies whether an order is a Limit or Market order.
///
/// - `Limit`: carries a caller-supplied, non-negative price
/// - `Market`: price is fixed at 0 and the order takes whatever the book offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Lifecycle state of an order.
///
/// ```text
/// New -> Booked -> PartialFill <-> PartialFill -> Filled
///  |       |            |
///  +-------+------------+--> Cancelled
///  +--> Rejected
/// ```
/// `Filled`, `Cancelled` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    New,
    Booked,
    #[serde(rename = "partial")]
    PartialFill,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::New => "new",
            OrderState::Booked => "booked",
            OrderState::PartialFill => "partial",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// An order owned by a participant.
///
/// Identity fields (`id`, `client_id`, `symbol`, `side`, `timestamp`) are fixed at
/// construction; only `remaining` and `state` change afterwards, and only through the
/// transition methods below. A `New` limit order may still be re-quoted at another price
/// with [`Order::requoted`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    id: u64,
    client_id: String,
    symbol: String,
    side: Side,
    order_type: OrderType,
    quantity: f64,
    remaining: f64,
    price: f64,
    timestamp: SystemTime,
    state: OrderState,
}

impl Order {
    /// Builds a limit order. Fails on a negative (or non-finite) price or a non-positive quantity.
    pub fn limit(
        id: u64,
        client_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Self, OrderError> {
        if !price.is_finite() || price < 0.0 {
            return Err(OrderError::InvalidPrice(price));
        }
        Self::build(id, client_id.into(), symbol.into(), side, OrderType::Limit, quantity, price)
    }

    /// Builds a market order; the price is always 0.
    pub fn market(
        id: u64,
        client_id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
    ) -> Result<Self, OrderError> {
        Self::build(id, client_id.into(), symbol.into(), side, OrderType::Market, quantity, 0.0)
    }

    fn build(
        id: u64,
        client_id: String,
        symbol: String,
        side: Side,
        order_type: OrderType,
        quantity: f64,
        price: f64,
    ) -> Result<Self, OrderError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        Ok(Self {
            id,
            client_id,
            symbol,
            side,
            order_type,
            quantity,
            remaining: quantity,
            price,
            timestamp: SystemTime::now(),
            state: OrderState::New,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// The same order quoted at `price` for sending to the exchange.
    ///
    /// Keeps the id, timestamp and remaining quantity, so the quote and the assignment it
    /// came from are one order. Only a `New` limit order can be re-quoted.
    pub fn requoted(&self, price: f64) -> Result<Order, OrderError> {
        if self.state != OrderState::New || self.order_type != OrderType::Limit {
            return Err(OrderError::InvalidTransition {
                from: self.state,
                to: OrderState::Booked,
            });
        }
        if !price.is_finite() || price < 0.0 {
            return Err(OrderError::InvalidPrice(price));
        }
        Ok(Order {
            price,
            ..self.clone()
        })
    }

    /// `New -> Booked`
    pub fn book(&mut self) -> Result<(), OrderError> {
        self.transition(OrderState::Booked, &[OrderState::New])
    }

    /// `New -> Rejected`
    pub fn reject(&mut self) -> Result<(), OrderError> {
        self.transition(OrderState::Rejected, &[OrderState::New])
    }

    /// `New | Booked | PartialFill -> Cancelled`
    pub fn cancel(&mut self) -> Result<(), OrderError> {
        self.transition(
            OrderState::Cancelled,
            &[OrderState::New, OrderState::Booked, OrderState::PartialFill],
        )
    }

    /// Applies an execution of `qty` units.
    ///
    /// Moves to `Filled` once nothing remains, `PartialFill` otherwise. A fill larger than
    /// `remaining` is refused and leaves the order untouched.
    pub fn fill(&mut self, qty: f64) -> Result<(), OrderError> {
        let target = if qty >= self.remaining {
            OrderState::Filled
        } else {
            OrderState::PartialFill
        };
        if !matches!(self.state, OrderState::Booked | OrderState::PartialFill) {
            return Err(OrderError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        if !qty.is_finite() || qty <= 0.0 {
            return Err(OrderError::InvalidQuantity(qty));
        }
        if qty > self.remaining {
            return Err(OrderError::Overfill {
                requested: qty,
                remaining: self.remaining,
            });
        }
        self.remaining = (self.remaining - qty).max(0.0);
        self.state = target;
        Ok(())
    }

    fn transition(&mut self, to: OrderState, allowed_from: &[OrderState]) -> Result<(), OrderError> {
        if !allowed_from.contains(&self.state) {
            return Err(OrderError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.order_type {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        };
        write!(
            f,
            "[{} {} {} {} P={:.2} Q={} R={}]",
            self.id, kind, self.symbol, self.side, self.price, self.quantity, self.remaining
        )
    }
}
