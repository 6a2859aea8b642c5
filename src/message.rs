//! Wire message envelope and per-type payloads (§6).
//!
//! `Message` is the unit the [`crate::scheduler::Scheduler`] orders and
//! delivers; `MessagePayload` is the discriminated union the exchange
//! dispatches on. Encode/decode round-trips through `serde_json` by
//! construction (tagged enum, no custom byte-level framing), satisfying
//! the "decode∘encode is identity" property (§8 P-round-trip).

use crate::decimal::Decimal;
use crate::error::OrderErrorCode;
use crate::ids::{AgentId, BookId, OrderId, Timestamp};
use crate::order::{Currency, Direction, SettleFlag, StpFlag, TimeInForce};
use serde::{Deserialize, Serialize};

/// `(occurrence, arrival, source, targets, type, payload)`. `type` is
/// carried by `payload`'s own discriminant; `distributed_agent` records
/// whether this is a `DISTRIBUTED_`-prefixed wrapper and, if so, for
/// which remote agent — modeled as a flag on the envelope rather than a
/// parallel payload variant per type, since the wrapper only ever adds
/// one field around an otherwise-identical payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub occurrence: u64,
    pub arrival: Timestamp,
    /// Monotonically increasing per issuer; breaks ties at identical
    /// `arrival` (§4.6).
    pub secondary_priority: u64,
    pub source: String,
    pub targets: Vec<String>,
    pub distributed_agent: Option<AgentId>,
    pub payload: MessagePayload,
}

impl Message {
    /// Parses the wire `targets` field (`|`-delimited) into the list form
    /// used internally.
    pub fn parse_targets(raw: &str) -> Vec<String> {
        raw.split('|').map(str::to_owned).filter(|s| !s.is_empty()).collect()
    }

    /// Reconstructs the wire `targets` field from the internal list form.
    pub fn format_targets(&self) -> String {
        self.targets.join("|")
    }

    /// The wire `type` discriminant, `DISTRIBUTED_`-prefixed when this
    /// envelope wraps a remote agent's message.
    pub fn wire_type(&self) -> String {
        let base = self.payload.type_name();
        match self.distributed_agent {
            Some(_) => format!("DISTRIBUTED_{base}"),
            None => base.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    PlaceOrderMarket(PlaceOrderMarketPayload),
    PlaceOrderLimit(PlaceOrderLimitPayload),
    CancelOrders(CancelOrdersPayload),
    ClosePositions(ClosePositionsPayload),
    ResetAgent(ResetAgentPayload),
    RetrieveL1(RetrieveL1Payload),
    RetrieveL2(RetrieveL2Payload),
    RetrieveOrders(RetrieveOrdersPayload),
    SubscribeLimit,
    SubscribeMarket,
    SubscribeTrade,
    SubscribeTradeByOrder(SubscribeTradeByOrderPayload),
    UnsubscribeLimit,
    UnsubscribeMarket,
    UnsubscribeTrade,
    UnsubscribeTradeByOrder(SubscribeTradeByOrderPayload),
    OrderPlacedResponse(OrderPlacedResponsePayload),
    TradeResponse(TradeResponsePayload),
    CancelResponse(CancelResponsePayload),
    ClosePositionsResponse(ClosePositionsResponsePayload),
    L1Response(L1ResponsePayload),
    L2Response(L2ResponsePayload),
    OrdersResponse(OrdersResponsePayload),
    ErrorResponse(ErrorResponsePayload),
}

impl MessagePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagePayload::PlaceOrderMarket(_) => "PLACE_ORDER_MARKET",
            MessagePayload::PlaceOrderLimit(_) => "PLACE_ORDER_LIMIT",
            MessagePayload::CancelOrders(_) => "CANCEL_ORDERS",
            MessagePayload::ClosePositions(_) => "CLOSE_POSITIONS",
            MessagePayload::ResetAgent(_) => "RESET_AGENT",
            MessagePayload::RetrieveL1(_) => "RETRIEVE_L1",
            MessagePayload::RetrieveL2(_) => "RETRIEVE_L2",
            MessagePayload::RetrieveOrders(_) => "RETRIEVE_ORDERS",
            MessagePayload::SubscribeLimit => "SUBSCRIBE_LIMIT",
            MessagePayload::SubscribeMarket => "SUBSCRIBE_MARKET",
            MessagePayload::SubscribeTrade => "SUBSCRIBE_TRADE",
            MessagePayload::SubscribeTradeByOrder(_) => "SUBSCRIBE_TRADE_BY_ORDER",
            MessagePayload::UnsubscribeLimit => "UNSUBSCRIBE_LIMIT",
            MessagePayload::UnsubscribeMarket => "UNSUBSCRIBE_MARKET",
            MessagePayload::UnsubscribeTrade => "UNSUBSCRIBE_TRADE",
            MessagePayload::UnsubscribeTradeByOrder(_) => "UNSUBSCRIBE_TRADE_BY_ORDER",
            MessagePayload::OrderPlacedResponse(_) => "ORDER_PLACED_RESPONSE",
            MessagePayload::TradeResponse(_) => "TRADE_RESPONSE",
            MessagePayload::CancelResponse(_) => "CANCEL_RESPONSE",
            MessagePayload::ClosePositionsResponse(_) => "CLOSE_POSITIONS_RESPONSE",
            MessagePayload::L1Response(_) => "L1_RESPONSE",
            MessagePayload::L2Response(_) => "L2_RESPONSE",
            MessagePayload::OrdersResponse(_) => "ORDERS_RESPONSE",
            MessagePayload::ErrorResponse(_) => "ERROR_RESPONSE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderMarketPayload {
    pub book_id: BookId,
    pub direction: Direction,
    pub volume: Decimal,
    pub leverage: Decimal,
    pub stp_flag: StpFlag,
    pub settle_flag: SettleFlag,
    pub currency: Currency,
    pub client_order_id: Option<OrderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderLimitPayload {
    pub book_id: BookId,
    pub direction: Direction,
    pub volume: Decimal,
    pub price: Decimal,
    pub leverage: Decimal,
    pub stp_flag: StpFlag,
    pub settle_flag: SettleFlag,
    pub post_only: bool,
    pub time_in_force: TimeInForce,
    pub expiry_period: Option<u64>,
    pub currency: Currency,
    pub client_order_id: Option<OrderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrdersPayload {
    pub book_id: BookId,
    /// `(order_id, volume_to_cancel)`; `None` volume cancels the order in full.
    pub orders: Vec<(OrderId, Option<Decimal>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePositionsPayload {
    pub book_id: BookId,
    pub order_ids: Vec<OrderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetAgentPayload {
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveL1Payload {
    pub book_id: BookId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveL2Payload {
    pub book_id: BookId,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveOrdersPayload {
    pub book_id: BookId,
}

/// Shared by `SUBSCRIBE_TRADE_BY_ORDER`/`UNSUBSCRIBE_TRADE_BY_ORDER`: the
/// per-book subscriber set these key on is per `order_id`, not global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeTradeByOrderPayload {
    pub book_id: BookId,
    pub order_id: OrderId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedResponsePayload {
    pub book_id: BookId,
    pub order_id: OrderId,
    pub error: OrderErrorCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResponsePayload {
    pub book_id: BookId,
    pub aggressor_order_id: OrderId,
    pub resting_order_id: OrderId,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponsePayload {
    pub book_id: BookId,
    pub succeeded: Vec<(OrderId, Decimal)>,
    pub failed: Vec<OrderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePositionsResponsePayload {
    pub book_id: BookId,
    pub closed: Vec<OrderId>,
    pub failed: Vec<OrderId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1ResponsePayload {
    pub book_id: BookId,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2ResponsePayload {
    pub book_id: BookId,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersResponsePayload {
    pub book_id: BookId,
    pub order_ids: Vec<OrderId>,
}

/// `ErrorResponsePayload`: stable discriminant (§7), never fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponsePayload {
    pub code: OrderErrorCode,
    pub detail: String,
}
