use thiserror::Error;

use crate::orders::OrderState;

/// Failures raised while building or running a market session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Bad mode string, non-positive interval, a schedule that would divide by zero,
    /// duplicate participant ids. Surfaces before the session starts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Session time falls outside every configured zone; pricing cannot proceed.
    #[error("session time {session_time:.3}s is not within any configured zone")]
    NoMatchingZone { session_time: f64 },

    #[error(transparent)]
    Order(#[from] OrderError),
}

impl SessionError {
    pub fn config(msg: impl Into<String>) -> Self {
        SessionError::InvalidConfiguration(msg.into())
    }

    /// Errors that leave the session unable to price further orders.
    pub fn halts_session(&self) -> bool {
        matches!(self, SessionError::NoMatchingZone { .. })
    }
}

/// Order construction and lifecycle errors. All of these are recoverable: the order is
/// left in the state it had before the failed call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: OrderState, to: OrderState },

    #[error("invalid price: {0}")]
    InvalidPrice(f64),

    #[error("quantity must be > 0, got {0}")]
    InvalidQuantity(f64),

    #[error("fill of {requested} exceeds remaining {remaining}")]
    Overfill { requested: f64, remaining: f64 },

    #[error("invalid side: `{0}`")]
    InvalidSide(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
