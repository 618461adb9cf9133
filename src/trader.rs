//! Participant capability consumed by the session, plus two reference participants.
//!
//! The session only ever talks to `dyn Trader`. Concrete participants keep their own
//! book of assignments in an [`OrderLedger`] and decide how to quote through a
//! [`Strategy`]:
//! - [`Giveaway`] (`GVWY`) quotes its assignment's limit price unchanged.
//! - [`Shaver`] (`SHVR`) improves the best same-side price by one tick, never past its limit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    errors::OrderError,
    market_data::BookSnapshot,
    orders::{Order, OrderState, Side},
    trade::Fill,
};

/// What the session needs from a participant.
pub trait Trader: Send + Sync {
    fn id(&self) -> &str;

    /// Short type code used to group participants in the session report.
    fn trader_type(&self) -> &str;

    /// Asks for an order to send to the exchange, given the fraction of session time
    /// left and the current book. `None` means nothing to trade right now.
    fn propose_order(&self, remaining_fraction: f64, book: &BookSnapshot) -> Option<Order>;

    fn submit_order(&self, order: Order);

    /// Delivers a scheduler-generated limit order into the participant's own book.
    fn accept_limit_order(&self, order: Order);

    /// Cancels every live order. Orders already inactive are left alone.
    fn cancel_all_live(&self);

    fn balance(&self) -> f64;

    fn trade_count(&self) -> u64;
}

#[derive(Debug, Default)]
struct LedgerInner {
    orders: Vec<Order>,
    balance: f64,
    trades: u64,
}

/// A participant's assignments, surplus and trade count behind one lock.
#[derive(Debug, Default)]
pub struct OrderLedger {
    inner: Mutex<LedgerInner>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn accept(&self, order: Order) {
        self.lock().orders.push(order);
    }

    /// Oldest assignment not yet sent to the exchange.
    pub fn next_unsubmitted(&self) -> Option<Order> {
        self.lock()
            .orders
            .iter()
            .find(|o| o.state() == OrderState::New)
            .cloned()
    }

    /// Marks an assignment as resting at the exchange. Returns `false` for unknown ids.
    pub fn mark_booked(&self, order_id: u64) -> Result<bool, OrderError> {
        let mut inner = self.lock();
        match inner.orders.iter_mut().find(|o| o.id() == order_id) {
            Some(order) => order.book().map(|_| true),
            None => Ok(false),
        }
    }

    /// Applies an execution and books the surplus against the assignment's limit price.
    pub fn record_fill(&self, fill: &Fill) -> Result<bool, OrderError> {
        let mut inner = self.lock();
        let Some(order) = inner.orders.iter_mut().find(|o| o.id() == fill.order_id) else {
            return Ok(false);
        };
        order.fill(fill.quantity)?;
        let surplus = match order.side() {
            Side::Bid => order.price() - fill.price,
            Side::Ask => fill.price - order.price(),
        } * fill.quantity;
        inner.balance += surplus;
        inner.trades += 1;
        Ok(true)
    }

    /// Cancels every active order and returns how many were cancelled.
    pub fn cancel_all_live(&self) -> usize {
        let mut inner = self.lock();
        let mut cancelled = 0;
        for order in inner.orders.iter_mut().filter(|o| o.is_active()) {
            match order.cancel() {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(order_id = order.id(), error = %e, "cancel refused"),
            }
        }
        cancelled
    }

    pub fn orders(&self) -> Vec<Order> {
        self.lock().orders.clone()
    }

    pub fn balance(&self) -> f64 {
        self.lock().balance
    }

    pub fn trade_count(&self) -> u64 {
        self.lock().trades
    }
}

/// Quoting rule of a participant.
pub trait Strategy: Send + Sync {
    fn code(&self) -> &'static str;

    /// Price to send for `assignment`, or `None` to hold back.
    fn quote(&self, assignment: &Order, book: &BookSnapshot, remaining_fraction: f64) -> Option<f64>;
}

/// Quotes exactly the assigned limit price.
#[derive(Debug, Clone, Copy, Default)]
pub struct Giveaway;

impl Strategy for Giveaway {
    fn code(&self) -> &'static str {
        "GVWY"
    }

    fn quote(&self, assignment: &Order, _book: &BookSnapshot, _remaining_fraction: f64) -> Option<f64> {
        Some(assignment.price())
    }
}

/// Shaves one tick off the best same-side price, bounded by the assignment's limit.
#[derive(Debug, Clone, Copy)]
pub struct Shaver {
    pub tick: f64,
}

impl Default for Shaver {
    fn default() -> Self {
        Self { tick: 0.01 }
    }
}

impl Strategy for Shaver {
    fn code(&self) -> &'static str {
        "SHVR"
    }

    fn quote(&self, assignment: &Order, book: &BookSnapshot, _remaining_fraction: f64) -> Option<f64> {
        let limit = assignment.price();
        let quote = match assignment.side() {
            Side::Bid => book.best_bid().map_or(limit, |b| (b + self.tick).min(limit)),
            Side::Ask => book.best_ask().map_or(limit, |a| (a - self.tick).max(limit)),
        };
        Some(quote)
    }
}

/// A participant: an id, a quoting strategy, its ledger and the exchange outbox.
pub struct Agent<S> {
    id: String,
    strategy: S,
    ledger: OrderLedger,
    outbox: Option<mpsc::UnboundedSender<Order>>,
}

impl<S: Strategy> Agent<S> {
    pub fn new(id: impl Into<String>, strategy: S) -> Self {
        Self {
            id: id.into(),
            strategy,
            ledger: OrderLedger::new(),
            outbox: None,
        }
    }

    /// Forwards submitted orders to `outbox`.
    pub fn with_outbox(mut self, outbox: mpsc::UnboundedSender<Order>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }
}

impl<S: Strategy> Trader for Agent<S> {
    fn id(&self) -> &str {
        &self.id
    }

    fn trader_type(&self) -> &str {
        self.strategy.code()
    }

    fn propose_order(&self, remaining_fraction: f64, book: &BookSnapshot) -> Option<Order> {
        let assignment = self.ledger.next_unsubmitted()?;
        let price = self.strategy.quote(&assignment, book, remaining_fraction)?;
        assignment
            .requoted(price)
            .map_err(|e| warn!(trader = %self.id, error = %e, "could not build quote"))
            .ok()
    }

    fn submit_order(&self, order: Order) {
        match self.ledger.mark_booked(order.id()) {
            Ok(true) => {}
            Ok(false) => debug!(trader = %self.id, order_id = order.id(), "submitting unassigned order"),
            Err(e) => {
                warn!(trader = %self.id, order_id = order.id(), error = %e, "order already resolved");
                return;
            }
        }
        if let Some(outbox) = &self.outbox {
            if outbox.send(order).is_err() {
                warn!(trader = %self.id, "exchange outbox closed");
            }
        }
    }

    fn accept_limit_order(&self, order: Order) {
        debug!(trader = %self.id, %order, "assignment received");
        self.ledger.accept(order);
    }

    fn cancel_all_live(&self) {
        let n = self.ledger.cancel_all_live();
        if n > 0 {
            debug!(trader = %self.id, cancelled = n, "cancelled live orders");
        }
    }

    fn balance(&self) -> f64 {
        self.ledger.balance()
    }

    fn trade_count(&self) -> u64 {
        self.ledger.trade_count()
    }
}

/// Participant types that can be named in a session configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraderKind {
    #[serde(rename = "GVWY")]
    Giveaway,
    #[serde(rename = "SHVR")]
    Shaver,
}

impl TraderKind {
    pub fn build(
        &self,
        id: impl Into<String>,
        outbox: Option<mpsc::UnboundedSender<Order>>,
    ) -> Arc<dyn Trader> {
        match self {
            TraderKind::Giveaway => Arc::new(attach(Agent::new(id, Giveaway), outbox)),
            TraderKind::Shaver => Arc::new(attach(Agent::new(id, Shaver::default()), outbox)),
        }
    }
}

fn attach<S: Strategy>(agent: Agent<S>, outbox: Option<mpsc::UnboundedSender<Order>>) -> Agent<S> {
    match outbox {
        Some(tx) => agent.with_outbox(tx),
        None => agent,
    }
}
