//! Multi-book exchange: owns every book's matching/clearing/record
//! triple, a shared fee schedule and the accounts registry, and turns
//! inbound wire messages into book operations and outbound
//! response/broadcast messages (§4.5, C9).
//!
//! Grounded in `MultiBookExchangeAgent.cpp`'s per-message `handle*`
//! dispatch and its local subscriber-registry broadcast pattern
//! (`m_local{Market,Limit,Trade}OrderSubscribers`,
//! `m_localTradeByOrderSubscribers`). Order id assignment and
//! agent-name resolution are this crate's own: the source keeps a
//! `LocalAgentId` lookup on the same agent object, here folded into
//! `MultiBookExchange` since nothing else owns it.

use crate::account::AccountRegistry;
use crate::balances::RoundParams;
use crate::book::{OrderBook, PlacementOutcome};
use crate::clearing::{ClearingManager, ExchangeParams, MarginCallTrigger};
use crate::decimal::Decimal;
use crate::error::OrderErrorCode;
use crate::fees::{FeePolicy, FeeTier};
use crate::ids::{AgentId, BookId, OrderId, Timestamp};
use crate::message::*;
use crate::order::{Currency, Direction, OrderClientContext, SettleFlag, StpFlag, TimeInForce};
use crate::record::{L3Record, TradeCause};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Static per-book parameters: decimals plus the clearing limits.
#[derive(Debug, Clone, Copy)]
pub struct BookConfig {
    pub price_decimals: u32,
    pub volume_decimals: u32,
    pub params: ExchangeParams,
}

struct Book {
    order_book: OrderBook,
    clearing: ClearingManager,
    record: L3Record,
    next_order_id: u64,
}

impl Book {
    fn new(book_id: BookId, config: BookConfig) -> Self {
        Book {
            order_book: OrderBook::new(config.price_decimals, config.volume_decimals),
            clearing: ClearingManager::new(book_id, config.params),
            record: L3Record::default(),
            next_order_id: 0,
        }
    }

    fn next_order_id(&mut self) -> OrderId {
        let id = OrderId::new(self.next_order_id);
        self.next_order_id += 1;
        id
    }
}

/// Addressed but not yet scheduled: targets by agent name plus the
/// payload to deliver. The caller (a `Simulation`) wraps this into a
/// `Message` with its own `arrival`/`secondary_priority` (typically
/// `now + network latency`) before handing it to the `Scheduler`.
/// `source`/`delay` default to the caller's usual
/// `"EXCHANGE"`/network-latency convention; [`Outbound::scheduled`]
/// overrides both for self-dispatched messages like a GTT expiry
/// cancel, which must arrive as if sent by the order's own owner after
/// `expiryPeriod` rather than one network hop from the exchange.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub targets: Vec<String>,
    pub payload: MessagePayload,
    pub source: Option<String>,
    pub delay: Option<u64>,
}

impl Outbound {
    fn to(target: impl Into<String>, payload: MessagePayload) -> Self {
        Outbound { targets: vec![target.into()], payload, source: None, delay: None }
    }

    fn broadcast(targets: &HashSet<String>, payload: &MessagePayload) -> Vec<Self> {
        targets.iter().map(|t| Outbound::to(t.clone(), payload.clone())).collect()
    }

    /// A self-dispatched message scheduled `delay` ticks from now as if
    /// sent by `source`, rather than `"EXCHANGE"` one network hop out.
    fn scheduled(target: impl Into<String>, payload: MessagePayload, source: impl Into<String>, delay: u64) -> Self {
        Outbound { targets: vec![target.into()], payload, source: Some(source.into()), delay: Some(delay) }
    }
}

/// Per-event subscriber sets (§6): limit/market/trade are exchange-wide,
/// trade-by-order is keyed per `(book, order)` since order ids are only
/// unique within a book.
#[derive(Debug, Default)]
struct Subscriptions {
    limit: HashSet<String>,
    market: HashSet<String>,
    trade: HashSet<String>,
    trade_by_order: HashMap<(BookId, OrderId), HashSet<String>>,
}

/// Owns every book in one simulation block plus the accounts/fee
/// schedule shared across them. `handle` never queues onto a
/// `Scheduler` directly — the caller owns delivery timing.
pub struct MultiBookExchange {
    books: Vec<Book>,
    accounts: AccountRegistry,
    fees: FeePolicy,
    agent_ids: HashMap<String, AgentId>,
    subscriptions: Subscriptions,
}

impl MultiBookExchange {
    pub fn new(book_configs: Vec<BookConfig>, fee_tiers: Vec<FeeTier>, fee_window: u64) -> Self {
        let round_params: Vec<RoundParams> = book_configs
            .iter()
            .map(|c| RoundParams { base_decimals: c.volume_decimals, quote_decimals: c.price_decimals })
            .collect();
        let books = book_configs.iter().enumerate().map(|(i, c)| Book::new(BookId(i as u32), *c)).collect();
        MultiBookExchange {
            books,
            accounts: AccountRegistry::new(book_configs.len(), round_params),
            fees: FeePolicy::new(fee_tiers, fee_window),
            agent_ids: HashMap::new(),
            subscriptions: Subscriptions::default(),
        }
    }

    pub fn num_books(&self) -> usize {
        self.books.len()
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn fees(&self) -> &FeePolicy {
        &self.fees
    }

    pub fn fees_mut(&mut self) -> &mut FeePolicy {
        &mut self.fees
    }

    pub fn order_book(&self, book: BookId) -> Option<&OrderBook> {
        self.books.get(book.0 as usize).map(|b| &b.order_book)
    }

    pub fn l3_record(&self, book: BookId) -> Option<&L3Record> {
        self.books.get(book.0 as usize).map(|b| &b.record)
    }

    /// Clears every book's L3 record at a step boundary (§3).
    pub fn clear_records(&mut self) {
        for book in &mut self.books {
            book.record.clear();
        }
    }

    /// Registers an agent under `name`, giving it `initial[i] = (base,
    /// quote)` starting balances for book `i`. Re-registration is a
    /// no-op (matches `AccountRegistry::register`).
    pub fn register_agent(&mut self, name: impl Into<String>, agent_id: AgentId, initial: &[(Decimal, Decimal)]) {
        self.accounts.register(agent_id, initial);
        self.agent_ids.insert(name.into(), agent_id);
    }

    fn resolve(&self, name: &str) -> Option<AgentId> {
        self.agent_ids.get(name).copied()
    }

    /// Every registered agent name, for wildcard target expansion
    /// (`Scheduler::resolve_targets`'s `known_agents`).
    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agent_ids.keys().map(String::as_str)
    }

    /// Dispatches one inbound message's payload, returning every
    /// response/broadcast it produces.
    pub fn handle(&mut self, at: Timestamp, source: &str, payload: &MessagePayload) -> Vec<Outbound> {
        match payload {
            MessagePayload::PlaceOrderMarket(p) => self.handle_place_market(at, source, p),
            MessagePayload::PlaceOrderLimit(p) => self.handle_place_limit(at, source, p),
            MessagePayload::CancelOrders(p) => self.handle_cancel(at, source, p),
            MessagePayload::ClosePositions(p) => self.handle_close_positions(at, source, p),
            MessagePayload::ResetAgent(p) => self.handle_reset_agent(p),
            MessagePayload::RetrieveL1(p) => vec![self.handle_retrieve_l1(source, p)],
            MessagePayload::RetrieveL2(p) => vec![self.handle_retrieve_l2(source, p)],
            MessagePayload::RetrieveOrders(p) => vec![self.handle_retrieve_orders(source, p)],
            MessagePayload::SubscribeLimit => {
                self.subscriptions.limit.insert(source.to_string());
                vec![]
            }
            MessagePayload::SubscribeMarket => {
                self.subscriptions.market.insert(source.to_string());
                vec![]
            }
            MessagePayload::SubscribeTrade => {
                self.subscriptions.trade.insert(source.to_string());
                vec![]
            }
            MessagePayload::SubscribeTradeByOrder(p) => {
                self.subscriptions.trade_by_order.entry((p.book_id, p.order_id)).or_default().insert(source.to_string());
                vec![]
            }
            MessagePayload::UnsubscribeLimit => {
                self.subscriptions.limit.remove(source);
                vec![]
            }
            MessagePayload::UnsubscribeMarket => {
                self.subscriptions.market.remove(source);
                vec![]
            }
            MessagePayload::UnsubscribeTrade => {
                self.subscriptions.trade.remove(source);
                vec![]
            }
            MessagePayload::UnsubscribeTradeByOrder(p) => {
                if let Some(set) = self.subscriptions.trade_by_order.get_mut(&(p.book_id, p.order_id)) {
                    set.remove(source);
                }
                vec![]
            }
            // Response/broadcast variants never arrive as inbound traffic.
            _ => vec![],
        }
    }

    fn handle_place_market(&mut self, at: Timestamp, source: &str, p: &PlaceOrderMarketPayload) -> Vec<Outbound> {
        let Some(agent_id) = self.resolve(source) else {
            return vec![error_response(OrderErrorCode::UnknownOrderId, "unknown agent")];
        };
        let Some(book_idx) = self.books.get(p.book_id.0 as usize).map(|_| p.book_id.0 as usize) else {
            return vec![error_response(OrderErrorCode::UnknownBook, "unknown book")];
        };

        let volume = match p.currency {
            Currency::Base => p.volume,
            Currency::Quote => {
                let book = &self.books[book_idx].order_book;
                ClearingManager::quote_to_base_volume(book, p.direction, p.volume)
            }
        };

        let code = {
            let book = &self.books[book_idx];
            book.clearing.validate(&book.order_book, &self.accounts, agent_id, p.direction, None, volume, p.leverage, p.currency)
        };
        if !code.is_valid() {
            return vec![Outbound::to(
                source,
                MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id: OrderId::new(0), error: code }),
            )];
        }

        let reference_price = self.books[book_idx].order_book.mid_price();
        let order_id = self.books[book_idx].next_order_id();

        if let Err(e) = self.books[book_idx].clearing.reserve(&mut self.accounts, agent_id, order_id, p.direction, reference_price, volume, p.leverage) {
            debug!(%e, "reservation failed for market order");
            return vec![Outbound::to(
                source,
                MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id, error: OrderErrorCode::InsufficientBalance }),
            )];
        }

        let ctx = OrderClientContext { agent_id, client_order_id: p.client_order_id };
        let (order, outcome) = self.books[book_idx].order_book.place_market_order(
            p.direction,
            at,
            volume,
            p.leverage,
            ctx,
            p.stp_flag,
            p.settle_flag,
            p.currency,
            order_id,
        );

        let mut out = vec![Outbound::to(
            source,
            MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id, error: OrderErrorCode::Valid }),
        )];
        self.books[book_idx].clearing.on_order_created(&mut self.accounts, agent_id, order_id, &mut self.books[book_idx].record, at, p.direction, order.volume, None);
        if !self.subscriptions.market.is_empty() {
            out.extend(Outbound::broadcast(
                &self.subscriptions.market,
                &MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id, error: OrderErrorCode::Valid }),
            ));
        }
        out.extend(self.process_outcome(book_idx, at, agent_id, p.settle_flag, &outcome, TradeCause::Order));
        self.free_unfilled_remainder(book_idx, agent_id, order_id, p.direction, reference_price, volume.mul_1p(p.leverage), &outcome, true);
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_place_limit(&mut self, at: Timestamp, source: &str, p: &PlaceOrderLimitPayload) -> Vec<Outbound> {
        let Some(agent_id) = self.resolve(source) else {
            return vec![error_response(OrderErrorCode::UnknownOrderId, "unknown agent")];
        };
        let Some(book_idx) = self.books.get(p.book_id.0 as usize).map(|_| p.book_id.0 as usize) else {
            return vec![error_response(OrderErrorCode::UnknownBook, "unknown book")];
        };

        let code = {
            let book = &self.books[book_idx];
            book.clearing.validate(&book.order_book, &self.accounts, agent_id, p.direction, Some(p.price), p.volume, p.leverage, p.currency)
        };
        if !code.is_valid() {
            return vec![Outbound::to(
                source,
                MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id: OrderId::new(0), error: code }),
            )];
        }

        let order_id = self.books[book_idx].next_order_id();
        if let Err(e) = self.books[book_idx].clearing.reserve(&mut self.accounts, agent_id, order_id, p.direction, p.price, p.volume, p.leverage) {
            debug!(%e, "reservation failed for limit order");
            return vec![Outbound::to(
                source,
                MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id, error: OrderErrorCode::InsufficientBalance }),
            )];
        }

        let ctx = OrderClientContext { agent_id, client_order_id: p.client_order_id };
        let placed = self.books[book_idx].order_book.place_limit_order(
            p.direction,
            at,
            p.volume,
            p.price,
            p.leverage,
            ctx,
            p.stp_flag,
            p.settle_flag,
            p.post_only,
            p.time_in_force,
            p.expiry_period,
            p.currency,
            order_id,
        );

        let (order, outcome) = match placed {
            Ok(v) => v,
            Err(e) => {
                self.books[book_idx].clearing.on_unregister(&mut self.accounts, agent_id, order_id);
                let code = match e {
                    crate::error::BookError::PostOnlyWouldCross(_) => OrderErrorCode::PostOnlyViolation,
                    crate::error::BookError::FokUnfillable => OrderErrorCode::FokViolation,
                    _ => OrderErrorCode::UnknownOrderId,
                };
                return vec![Outbound::to(
                    source,
                    MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id, error: code }),
                )];
            }
        };

        let mut out = vec![Outbound::to(
            source,
            MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id, error: OrderErrorCode::Valid }),
        )];
        self.books[book_idx].clearing.on_order_created(&mut self.accounts, agent_id, order_id, &mut self.books[book_idx].record, at, p.direction, order.volume, Some(p.price));
        if !self.subscriptions.limit.is_empty() {
            out.extend(Outbound::broadcast(
                &self.subscriptions.limit,
                &MessagePayload::OrderPlacedResponse(OrderPlacedResponsePayload { book_id: p.book_id, order_id, error: OrderErrorCode::Valid }),
            ));
        }
        out.extend(self.process_outcome(book_idx, at, agent_id, p.settle_flag, &outcome, TradeCause::Order));
        self.free_unfilled_remainder(book_idx, agent_id, order_id, p.direction, p.price, p.volume.mul_1p(p.leverage), &outcome, outcome.rested.is_none());
        if outcome.rested == Some(order_id) && p.time_in_force == TimeInForce::Gtt {
            if let Some(expiry_period) = p.expiry_period {
                out.push(Outbound::scheduled(
                    "EXCHANGE",
                    MessagePayload::CancelOrders(CancelOrdersPayload { book_id: p.book_id, orders: vec![(order_id, None)] }),
                    source,
                    expiry_period,
                ));
            }
        }
        out
    }

    /// Folds every fill in `outcome` back into balances/fees/the L3
    /// record, charges the configured rates, and broadcasts a
    /// `TradeResponse` to every trade/trade-by-order subscriber.
    fn process_outcome(
        &mut self,
        book_idx: usize,
        at: Timestamp,
        aggressor_agent: AgentId,
        aggressor_settle_flag: SettleFlag,
        outcome: &PlacementOutcome,
        cause: TradeCause,
    ) -> Vec<Outbound> {
        let book_id = BookId(book_idx as u32);
        let mut out = Vec::new();

        // STP only fires when the resting order belongs to the aggressor's
        // own agent, so the cancelled order's owner is always `aggressor_agent`.
        for cancellation in &outcome.self_trade_cancellations {
            let book = &mut self.books[book_idx];
            book.clearing.on_cancel(&mut self.accounts, &mut book.record, at, aggressor_agent, cancellation.direction, cancellation.price, *cancellation);
        }

        for fill in &outcome.fills {
            let best_bid = self.books[book_idx].order_book.best_bid();
            let best_ask = self.books[book_idx].order_book.best_ask();
            let aggressor_call_price = self.books[book_idx].clearing.margin_call_price_for(fill.aggressor_id);
            let resting_call_price = self.books[book_idx].clearing.margin_call_price_for(fill.resting_id);
            let book = &mut self.books[book_idx];
            book.clearing.on_trade(
                &mut self.accounts,
                &mut self.fees,
                &mut book.record,
                at,
                fill,
                aggressor_agent,
                fill.resting_agent_id,
                aggressor_settle_flag,
                best_bid,
                best_ask,
                aggressor_call_price,
                resting_call_price,
                cause,
            );

            let payload = MessagePayload::TradeResponse(TradeResponsePayload {
                book_id,
                aggressor_order_id: fill.aggressor_id,
                resting_order_id: fill.resting_id,
                price: fill.price,
                volume: fill.volume,
            });
            out.extend(Outbound::broadcast(&self.subscriptions.trade, &payload));
            for order_id in [fill.aggressor_id, fill.resting_id] {
                if let Some(subs) = self.subscriptions.trade_by_order.get(&(book_id, order_id)) {
                    out.extend(Outbound::broadcast(subs, &payload));
                }
            }
        }

        out
    }

    /// Releases the unconsumed reservation for an order that will never
    /// rest (market orders always, IOC/FOK limit orders when told to).
    /// `total_volume_requested` and the fills it's compared against are
    /// both in `totalVolume` (leverage-inclusive) units.
    fn free_unfilled_remainder(&mut self, book_idx: usize, agent_id: AgentId, order_id: OrderId, direction: Direction, price: Decimal, total_volume_requested: Decimal, outcome: &PlacementOutcome, will_not_rest: bool) {
        if !will_not_rest {
            return;
        }
        let filled_total: Decimal = outcome.fills.iter().filter(|f| f.aggressor_id == order_id).fold(Decimal::ZERO, |acc, f| acc + f.volume);
        let leftover_total = (total_volume_requested - filled_total).max(Decimal::ZERO);
        if leftover_total.is_zero() {
            return;
        }
        let natural_amount = match direction {
            Direction::Buy => leftover_total * price,
            Direction::Sell => leftover_total,
        };
        if let Ok(account) = self.accounts.get_mut(agent_id) {
            if let Some(balances) = account.balances_mut(BookId(book_idx as u32)) {
                let _ = balances.free_reservation(order_id, price, direction, Some(natural_amount));
            }
        }
    }

    fn handle_cancel(&mut self, at: Timestamp, source: &str, p: &CancelOrdersPayload) -> Vec<Outbound> {
        let Some(agent_id) = self.resolve(source) else {
            return vec![error_response(OrderErrorCode::UnknownOrderId, "unknown agent")];
        };
        let Some(book_idx) = self.books.get(p.book_id.0 as usize).map(|_| p.book_id.0 as usize) else {
            return vec![error_response(OrderErrorCode::UnknownBook, "unknown book")];
        };

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        for &(order_id, volume) in &p.orders {
            let owner = self.books[book_idx].order_book.client_context(order_id).map(|c| c.agent_id);
            if owner != Some(agent_id) {
                failed.push(order_id);
                continue;
            }
            let Some(order) = self.books[book_idx].order_book.get_order(order_id).cloned() else {
                failed.push(order_id);
                continue;
            };
            match self.books[book_idx].order_book.cancel_order(order_id, volume) {
                Ok(cancelled) => {
                    let book = &mut self.books[book_idx];
                    book.clearing.on_cancel(&mut self.accounts, &mut book.record, at, agent_id, order.direction, order.price, crate::book::Cancellation { order_id, volume, direction: order.direction, price: order.price });
                    if !self.books[book_idx].order_book.try_get_order(order_id) {
                        self.books[book_idx].clearing.on_unregister(&mut self.accounts, agent_id, order_id);
                    }
                    succeeded.push((order_id, cancelled));
                }
                Err(_) => failed.push(order_id),
            }
        }

        vec![Outbound::to(source, MessagePayload::CancelResponse(CancelResponsePayload { book_id: p.book_id, succeeded, failed }))]
    }

    /// `CLOSE_POSITIONS`: issues an opposite-direction market order sized
    /// to each named order's outstanding loan, settling that specific
    /// loan (`SettleFlag::Order`).
    fn handle_close_positions(&mut self, at: Timestamp, source: &str, p: &ClosePositionsPayload) -> Vec<Outbound> {
        let Some(agent_id) = self.resolve(source) else {
            return vec![error_response(OrderErrorCode::UnknownOrderId, "unknown agent")];
        };
        let Some(book_idx) = self.books.get(p.book_id.0 as usize).map(|_| p.book_id.0 as usize) else {
            return vec![error_response(OrderErrorCode::UnknownBook, "unknown book")];
        };

        let mut closed = Vec::new();
        let mut failed = Vec::new();
        let mut outbound = Vec::new();

        for &order_id in &p.order_ids {
            let liquidation_direction = self
                .accounts
                .get(agent_id)
                .ok()
                .and_then(|account| account.balances(p.book_id))
                .and_then(|balances| balances.loan(order_id))
                .map(|loan| loan.direction.opposite());
            let Some(liquidation_direction) = liquidation_direction else {
                failed.push(order_id);
                continue;
            };
            match self.close_one_position(book_idx, at, agent_id, order_id, liquidation_direction, StpFlag::None, TradeCause::Order) {
                Some(mut more) => {
                    closed.push(order_id);
                    outbound.append(&mut more);
                }
                None => failed.push(order_id),
            }
        }

        outbound.push(Outbound::to(source, MessagePayload::ClosePositionsResponse(ClosePositionsResponsePayload { book_id: p.book_id, closed, failed })));
        outbound
    }

    /// Issues the closing market order for one loan. `liquidation_direction`
    /// and `stp_flag` are supplied by the caller rather than recomputed
    /// here: `evaluate_margin_calls` passes its trigger's own direction and
    /// `StpFlag::CancelOld` (§4.2's `stpFlag=CO`) so a margin-call
    /// liquidation never pairs against another resting order from the same
    /// agent, while a user-invoked `CLOSE_POSITIONS` keeps `StpFlag::None`.
    fn close_one_position(
        &mut self,
        book_idx: usize,
        at: Timestamp,
        agent_id: AgentId,
        order_id: OrderId,
        liquidation_direction: Direction,
        stp_flag: StpFlag,
        cause: TradeCause,
    ) -> Option<Vec<Outbound>> {
        let book_id = BookId(book_idx as u32);
        let loan = self.accounts.get(agent_id).ok()?.balances(book_id)?.loan(order_id)?.clone();
        if loan.amount.is_zero() {
            return None;
        }
        let volume = match loan.direction {
            Direction::Buy => ClearingManager::quote_to_base_volume(&self.books[book_idx].order_book, liquidation_direction, loan.amount),
            Direction::Sell => loan.amount,
        };
        if volume.is_zero() {
            return None;
        }

        let order_id_new = self.books[book_idx].next_order_id();
        let ctx = OrderClientContext { agent_id, client_order_id: None };
        let (_order, outcome) = self.books[book_idx].order_book.place_market_order(
            liquidation_direction,
            at,
            volume,
            Decimal::ZERO,
            ctx,
            stp_flag,
            SettleFlag::Order(order_id),
            Currency::Base,
            order_id_new,
        );
        Some(self.process_outcome(book_idx, at, agent_id, SettleFlag::Order(order_id), &outcome, cause))
    }

    /// Evaluates every book's margin calls (§4.2) and issues the closing
    /// market orders, returning every response/broadcast they produce.
    /// Each trigger's `priority` and `liquidation_direction` (both
    /// assigned by `ClearingManager::evaluate_margin_calls` in dispatch
    /// order) flow straight into the liquidation order and its trade
    /// event so the event log can tell a margin call apart from an
    /// ordinary trade and reconstruct the order liquidations were forced
    /// in.
    pub fn evaluate_margin_calls(&mut self, at: Timestamp) -> Vec<Outbound> {
        let mut out = Vec::new();
        for book_idx in 0..self.books.len() {
            let triggers: Vec<MarginCallTrigger> = {
                let book = &mut self.books[book_idx];
                book.clearing.evaluate_margin_calls(&book.order_book)
            };
            for trigger in triggers {
                if let Some(more) = self.close_one_position(
                    book_idx,
                    at,
                    trigger.agent_id,
                    trigger.order_id,
                    trigger.liquidation_direction,
                    StpFlag::CancelOld,
                    TradeCause::MarginCall { priority: trigger.priority },
                ) {
                    out.extend(more);
                }
            }
        }
        out
    }

    /// `RESET_AGENT`: releases every reservation and clears active-order
    /// bookkeeping across all books; the caller is responsible for also
    /// dropping the agent's future queued messages via
    /// `Scheduler::drop_agent_messages` and cancelling its resting orders
    /// book-side (this only clears balance/account state, matching
    /// `Account::release_all_reservations`'s documented contract).
    fn handle_reset_agent(&mut self, p: &ResetAgentPayload) -> Vec<Outbound> {
        if let Ok(account) = self.accounts.get_mut(p.agent_id) {
            account.release_all_reservations();
        }
        self.fees.reset_history(&[p.agent_id]);
        vec![]
    }

    fn handle_retrieve_l1(&self, source: &str, p: &RetrieveL1Payload) -> Outbound {
        let Some(book) = self.order_book(p.book_id) else {
            return error_response(OrderErrorCode::UnknownBook, "unknown book");
        };
        Outbound::to(source, MessagePayload::L1Response(L1ResponsePayload { book_id: p.book_id, best_bid: book.best_bid(), best_ask: book.best_ask() }))
    }

    fn handle_retrieve_l2(&self, source: &str, p: &RetrieveL2Payload) -> Outbound {
        let Some(book) = self.order_book(p.book_id) else {
            return error_response(OrderErrorCode::UnknownBook, "unknown book");
        };
        let bids: Vec<(Decimal, Decimal)> = book.buy_queue.iter().rev().take(p.depth as usize).map(|(price, level)| (*price, level.volume)).collect();
        let asks: Vec<(Decimal, Decimal)> = book.sell_queue.iter().take(p.depth as usize).map(|(price, level)| (*price, level.volume)).collect();
        Outbound::to(source, MessagePayload::L2Response(L2ResponsePayload { book_id: p.book_id, bids, asks }))
    }

    fn handle_retrieve_orders(&self, source: &str, p: &RetrieveOrdersPayload) -> Outbound {
        let Some(agent_id) = self.resolve(source) else {
            return error_response(OrderErrorCode::UnknownOrderId, "unknown agent");
        };
        let order_ids = self
            .accounts
            .get(agent_id)
            .ok()
            .and_then(|a| a.active_orders(p.book_id))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Outbound::to(source, MessagePayload::OrdersResponse(OrdersResponsePayload { book_id: p.book_id, order_ids }))
    }
}

fn error_response(code: OrderErrorCode, detail: &str) -> Outbound {
    Outbound { targets: vec![], payload: MessagePayload::ErrorResponse(ErrorResponsePayload { code, detail: detail.to_string() }), source: None, delay: None }
}
