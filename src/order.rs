//! Order types and the small enums that parametrize them (§3).

use crate::decimal::Decimal;
use crate::ids::{AgentId, OrderId, Timestamp};
use serde::{Deserialize, Serialize};

/// Buy or sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

/// Which currency a market order's `volume` is denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Base,
    Quote,
}

/// Self-trade prevention flag (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StpFlag {
    #[default]
    None,
    /// Cancel New: the aggressing order is cancelled in full.
    CancelNew,
    /// Cancel Old: the resting order is cancelled in full, matching continues.
    CancelOld,
    /// Cancel Both: both orders are cancelled in full.
    CancelBoth,
    /// Decrement and Cancel: the smaller side is cancelled, the larger is
    /// decremented by the smaller's size.
    DecrementCancel,
}

/// Settlement policy applied to a specific order's loan(s) after a fill,
/// or a specific order id whose loan should be closed preferentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettleFlag {
    None,
    Fifo,
    Order(OrderId),
}

/// Time-in-force for limit orders (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till cancelled.
    Gtc,
    /// Good till time: cancel any unfilled remainder at `arrival + expiry`.
    Gtt,
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
}

/// Context the book needs to route fills back to the issuing agent,
/// without owning a reference to the agent itself (see §9: cyclic
/// references are broken with typed indices, not back-pointers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderClientContext {
    pub agent_id: AgentId,
    pub client_order_id: Option<OrderId>,
}

/// A market order: matches immediately against the opposite side up to
/// available liquidity, never rests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOrder {
    pub id: OrderId,
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub volume: Decimal,
    pub leverage: Decimal,
    pub stp_flag: StpFlag,
    pub settle_flag: SettleFlag,
    pub currency: Currency,
}

impl MarketOrder {
    pub fn total_volume(&self) -> Decimal {
        self.volume.mul_1p(self.leverage)
    }
}

/// A limit order: matches immediately against crossing liquidity, then
/// rests on the book for any unfilled remainder (subject to `time_in_force`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitOrder {
    pub id: OrderId,
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub volume: Decimal,
    pub leverage: Decimal,
    pub stp_flag: StpFlag,
    pub settle_flag: SettleFlag,
    pub currency: Currency,
    pub price: Decimal,
    pub post_only: bool,
    pub time_in_force: TimeInForce,
    pub expiry_period: Option<u64>,
}

impl LimitOrder {
    pub fn total_volume(&self) -> Decimal {
        self.volume.mul_1p(self.leverage)
    }

    pub fn is_filled(&self) -> bool {
        self.volume.is_zero() || self.volume.is_negative()
    }
}

/// Either order variant, for code paths (validation, matching) that treat
/// both uniformly up to the fields they share.
#[derive(Debug, Clone)]
pub enum Order {
    Market(MarketOrder),
    Limit(LimitOrder),
}

impl Order {
    pub fn id(&self) -> OrderId {
        match self {
            Order::Market(o) => o.id,
            Order::Limit(o) => o.id,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Order::Market(o) => o.direction,
            Order::Limit(o) => o.direction,
        }
    }

    pub fn volume(&self) -> Decimal {
        match self {
            Order::Market(o) => o.volume,
            Order::Limit(o) => o.volume,
        }
    }

    pub fn leverage(&self) -> Decimal {
        match self {
            Order::Market(o) => o.leverage,
            Order::Limit(o) => o.leverage,
        }
    }

    pub fn total_volume(&self) -> Decimal {
        match self {
            Order::Market(o) => o.total_volume(),
            Order::Limit(o) => o.total_volume(),
        }
    }

    pub fn stp_flag(&self) -> StpFlag {
        match self {
            Order::Market(o) => o.stp_flag,
            Order::Limit(o) => o.stp_flag,
        }
    }

    pub fn settle_flag(&self) -> SettleFlag {
        match self {
            Order::Market(o) => o.settle_flag,
            Order::Limit(o) => o.settle_flag,
        }
    }
}
