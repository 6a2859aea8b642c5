//! L3 event record: an append-only, monotonically-numbered per-book log
//! of order/trade/cancellation events (§3, §6, C8).
//!
//! The record itself is a fully specified, serde-driven data shape; only
//! where it is persisted (file rotation, byte-size truncation on
//! checkpoint resume) is left to a `collaborators::L3Logger`.

use crate::decimal::Decimal;
use crate::ids::{AgentId, EventId, OrderId, Timestamp};
use crate::order::Direction;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub agent_id: AgentId,
    pub direction: Direction,
    pub volume: Decimal,
    pub price: Option<Decimal>,
}

/// Why a trade happened. Mirrors the `_MC`-suffixed message-type tag the
/// original exchange agent dispatches liquidation orders under: there the
/// suffix only ever routes/logs the synthetic order, so here it carries
/// the same information as a typed field on the event instead of a string
/// convention. `priority` is the margin-call dispatch's monotonically
/// increasing counter (§4.2), preserved so the event log can reconstruct
/// liquidation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeCause {
    Order,
    MarginCall { priority: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub aggressor_order_id: OrderId,
    pub resting_order_id: OrderId,
    pub aggressor_agent_id: AgentId,
    pub resting_agent_id: AgentId,
    pub direction: Direction,
    pub price: Decimal,
    pub volume: Decimal,
    pub cause: TradeCause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationEvent {
    pub order_id: OrderId,
    pub agent_id: AgentId,
    pub volume: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Order(OrderEvent),
    Trade(TradeEvent),
    Cancellation(CancellationEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

/// Per-book L3 log. `push` assigns the next monotonic id; `drain` clears
/// the log at each step boundary (per-step, not per-run: the checkpointed
/// record is whatever has accumulated since the last clear), matching the
/// "cleared each step boundary" contract in spec.md §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L3Record {
    next_id: u64,
    events: Vec<Event>,
}

impl L3Record {
    pub fn push(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId::new(self.next_id);
        self.next_id += 1;
        self.events.push(Event { id, timestamp, payload });
        id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Clears accumulated events at a step boundary, without resetting the
    /// monotonic id counter (ids remain unique for the life of the book).
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Restores the id counter from a checkpoint (`id`/`current` patching,
    /// §6).
    pub fn restore_next_id(&mut self, next_id: u64) {
        self.next_id = next_id;
    }
}
