//! Crate-wide error taxonomy (§7).
//!
//! Validation errors are returned to the message issuer as response
//! payloads and are never fatal (see [`OrderErrorCode`]). Invariant,
//! scheduler and I/O failures unwind via [`EngineError`].

use crate::ids::{BookId, OrderId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable discriminant for order-placement/cancellation rejections.
/// Carried verbatim in `ErrorResponsePayload` (§7) so callers can match on
/// it without parsing a message string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum OrderErrorCode {
    Valid,
    InvalidVolume,
    InvalidPrice,
    InvalidLeverage,
    InvalidCurrency,
    InvalidStpFlag,
    InvalidSettleFlag,
    UnknownBook,
    UnknownOrderId,
    InsufficientLiquidity,
    InsufficientBalance,
    PostOnlyViolation,
    FokViolation,
    ActiveOrderCapExceeded,
}

impl OrderErrorCode {
    pub fn is_valid(self) -> bool {
        matches!(self, OrderErrorCode::Valid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderErrorCode::Valid => "VALID",
            OrderErrorCode::InvalidVolume => "INVALID_VOLUME",
            OrderErrorCode::InvalidPrice => "INVALID_PRICE",
            OrderErrorCode::InvalidLeverage => "INVALID_LEVERAGE",
            OrderErrorCode::InvalidCurrency => "INVALID_CURRENCY",
            OrderErrorCode::InvalidStpFlag => "INVALID_STP_FLAG",
            OrderErrorCode::InvalidSettleFlag => "INVALID_SETTLE_FLAG",
            OrderErrorCode::UnknownBook => "UNKNOWN_BOOK",
            OrderErrorCode::UnknownOrderId => "UNKNOWN_ORDER_ID",
            OrderErrorCode::InsufficientLiquidity => "INSUFFICIENT_LIQUIDITY",
            OrderErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            OrderErrorCode::PostOnlyViolation => "POST_ONLY_VIOLATION",
            OrderErrorCode::FokViolation => "FOK_VIOLATION",
            OrderErrorCode::ActiveOrderCapExceeded => "ACTIVE_ORDER_CAP_EXCEEDED",
        }
    }
}

impl std::fmt::Display for OrderErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors from the [`crate::book::OrderBook`] itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BookError {
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("price {price} must be positive")]
    InvalidPrice { price: String },

    #[error("post-only order would have crossed the book at {0}")]
    PostOnlyWouldCross(String),

    #[error("fill-or-kill order could not be fully matched")]
    FokUnfillable,
}

/// Errors from [`crate::balance::Balance`] reservation bookkeeping (I1-I4).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BalanceError {
    #[error("cannot reserve {requested}: only {available} free")]
    InsufficientFree { requested: String, available: String },

    #[error("cannot free {requested} from reservation {order_id}: only {available} reserved")]
    InsufficientReservation {
        order_id: OrderId,
        requested: String,
        available: String,
    },

    #[error("deposit of {amount} would drive total negative")]
    NegativeDepositRejected { amount: String },
}

/// Non-recoverable engine failures: scheduler misrouting, I/O, and any
/// invariant violation the engine could not self-heal by clamping.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("unknown delivery target: {0}")]
    UnknownTarget(String),

    #[error("unknown book: {0}")]
    UnknownBook(BookId),

    #[error("balance error: {0}")]
    Balance(#[from] BalanceError),

    #[error("book error: {0}")]
    Book(#[from] BookError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("network error after exhausting retries: {0}")]
    Network(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
