//! Price-time priority order book (§4.1, C6).
//!
//! Two price-sorted sides of FIFO price levels (`TickContainer`s). The
//! matching algorithm itself lives in [`matching`]; self-trade prevention
//! in [`stp`]. This module owns the book's storage and its public
//! placement/cancellation/query contract.

mod matching;
mod stp;

use crate::decimal::Decimal;
use crate::error::BookError;
use crate::ids::{AgentId, OrderId, Timestamp};
use crate::order::{Currency, Direction, LimitOrder, MarketOrder, OrderClientContext, SettleFlag, StpFlag, TimeInForce};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// A single price level: FIFO queue of resting limit orders plus the
/// level's cached total remaining volume.
#[derive(Debug, Clone, Default)]
pub struct TickContainer {
    pub price: Decimal,
    pub volume: Decimal,
    pub orders: VecDeque<OrderId>,
}

impl TickContainer {
    fn new(price: Decimal) -> Self {
        TickContainer { price, volume: Decimal::ZERO, orders: VecDeque::new() }
    }
}

/// One matched fill produced while processing an aggressing order.
#[derive(Debug, Clone)]
pub struct Fill {
    pub aggressor_id: OrderId,
    pub resting_id: OrderId,
    /// Resting order's owner, captured before a fully-filled resting
    /// order is unregistered (and its client context dropped).
    pub resting_agent_id: AgentId,
    /// Resting order's own settlement policy, captured for the same
    /// reason as `resting_agent_id`.
    pub resting_settle_flag: SettleFlag,
    /// Direction of the aggressing side.
    pub direction: Direction,
    pub price: Decimal,
    /// Executed size, in `totalVolume` (leverage-inclusive) units.
    pub volume: Decimal,
    pub resting_fully_filled: bool,
}

/// A resting order cancelled (fully or partially) as a side effect of
/// matching (self-trade prevention) rather than an explicit cancel call.
#[derive(Debug, Clone, Copy)]
pub struct Cancellation {
    pub order_id: OrderId,
    pub volume: Option<Decimal>,
    /// Resting order's own direction and price, captured at cancellation
    /// time since a fully-cancelled order is unregistered before this
    /// reaches the caller.
    pub direction: Direction,
    pub price: Decimal,
}

/// Everything that happened while placing one order, for the clearing
/// manager (§4.2) to fold back into balances, fee history and the L3
/// record.
#[derive(Debug, Clone, Default)]
pub struct PlacementOutcome {
    pub fills: Vec<Fill>,
    pub self_trade_cancellations: Vec<Cancellation>,
    /// Set when the aggressing order itself rests on the book afterward.
    pub rested: Option<OrderId>,
}

/// Price-time priority limit order book for one tradable pair.
pub struct OrderBook {
    pub(crate) price_decimals: u32,
    pub(crate) volume_decimals: u32,
    pub(crate) buy_queue: BTreeMap<Decimal, TickContainer>,
    pub(crate) sell_queue: BTreeMap<Decimal, TickContainer>,
    pub(crate) order_id_map: HashMap<OrderId, LimitOrder>,
    pub(crate) order2client_ctx: HashMap<OrderId, OrderClientContext>,
}

impl OrderBook {
    pub fn new(price_decimals: u32, volume_decimals: u32) -> Self {
        OrderBook {
            price_decimals,
            volume_decimals,
            buy_queue: BTreeMap::new(),
            sell_queue: BTreeMap::new(),
            order_id_map: HashMap::new(),
            order2client_ctx: HashMap::new(),
        }
    }

    /// Highest resting buy price, or `Decimal::ZERO` if the buy side is empty.
    pub fn best_bid(&self) -> Decimal {
        self.buy_queue.keys().next_back().copied().unwrap_or(Decimal::ZERO)
    }

    /// Lowest resting sell price, or `Decimal::ZERO` if the sell side is empty.
    pub fn best_ask(&self) -> Decimal {
        self.sell_queue.keys().next().copied().unwrap_or(Decimal::ZERO)
    }

    pub fn mid_price(&self) -> Decimal {
        let (bid, ask) = (self.best_bid(), self.best_ask());
        if bid.is_zero() || ask.is_zero() {
            Decimal::ZERO
        } else {
            (bid + ask) / Decimal::from_int(2)
        }
    }

    pub fn get_order(&self, id: OrderId) -> Option<&LimitOrder> {
        self.order_id_map.get(&id)
    }

    pub fn client_context(&self, id: OrderId) -> Option<OrderClientContext> {
        self.order2client_ctx.get(&id).copied()
    }

    fn round_price(&self, price: Decimal) -> Decimal {
        let rounded = price.round(self.price_decimals);
        if rounded.is_negative() || rounded.is_zero() {
            Decimal::smallest_unit(self.price_decimals)
        } else {
            rounded
        }
    }

    fn round_volume(&self, volume: Decimal) -> Decimal {
        volume.round(self.volume_decimals)
    }

    pub(crate) fn register_limit_order(&mut self, order: LimitOrder, ctx: OrderClientContext) {
        self.order2client_ctx.insert(order.id, ctx);
        let side = match order.direction {
            Direction::Buy => &mut self.buy_queue,
            Direction::Sell => &mut self.sell_queue,
        };
        let level = side.entry(order.price).or_insert_with(|| TickContainer::new(order.price));
        level.volume += order.total_volume();
        level.orders.push_back(order.id);
        self.order_id_map.insert(order.id, order);
    }

    pub(crate) fn unregister_limit_order(&mut self, id: OrderId) {
        self.order_id_map.remove(&id);
        self.order2client_ctx.remove(&id);
    }

    /// `cancelOrder(id, volume?)`: cancels `min(volume_requested,
    /// order.volume)` (default: the whole order). Returns `false` if `id`
    /// is unknown.
    pub fn cancel_order(&mut self, id: OrderId, volume: Option<Decimal>) -> Result<Decimal, BookError> {
        let Some(order) = self.order_id_map.get(&id) else {
            return Err(BookError::OrderNotFound(id));
        };
        let direction = order.direction;
        let price = order.price;
        let to_cancel = self.round_volume(volume.unwrap_or(order.volume).min(order.volume));
        if to_cancel.is_zero() {
            return Ok(Decimal::ZERO);
        }

        let side = match direction {
            Direction::Buy => &mut self.buy_queue,
            Direction::Sell => &mut self.sell_queue,
        };

        let order_fully_cancelled = {
            let order = self.order_id_map.get_mut(&id).unwrap();
            order.volume -= to_cancel;
            order.is_filled()
        };

        let leverage = self.order_id_map[&id].leverage;
        let total_cancelled = to_cancel.mul_1p(leverage);

        if let Some(level) = side.get_mut(&price) {
            level.volume -= total_cancelled;
            if order_fully_cancelled {
                level.orders.retain(|o| *o != id);
            }
            if level.orders.is_empty() {
                side.remove(&price);
            }
        }

        if order_fully_cancelled {
            self.unregister_limit_order(id);
        }

        Ok(to_cancel)
    }

    pub fn try_get_order(&self, id: OrderId) -> bool {
        self.order_id_map.contains_key(&id)
    }

    /// `placeMarketOrder`: matches immediately against the opposite side;
    /// never rests.
    pub fn place_market_order(
        &mut self,
        direction: Direction,
        timestamp: Timestamp,
        volume: Decimal,
        leverage: Decimal,
        ctx: OrderClientContext,
        stp_flag: StpFlag,
        settle_flag: SettleFlag,
        currency: Currency,
        next_id: OrderId,
    ) -> (MarketOrder, PlacementOutcome) {
        let volume = self.round_volume(volume);
        let order = MarketOrder {
            id: next_id,
            timestamp,
            direction,
            volume,
            leverage: self.round_volume(leverage),
            stp_flag,
            settle_flag,
            currency,
        };
        self.order2client_ctx.insert(order.id, ctx);
        let mut aggressor = matching::Aggressor {
            id: order.id,
            agent_id: ctx.agent_id,
            direction,
            leverage: order.leverage,
            stp_flag,
            remaining_total_volume: order.total_volume(),
        };
        let outcome = matching::match_against_book(self, &mut aggressor, None);
        self.order2client_ctx.remove(&order.id);
        (order, outcome)
    }

    /// `placeLimitOrder`: matches any crossing liquidity immediately, then
    /// rests any remainder unless `IOC`/`FOK`/`postOnly` says otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn place_limit_order(
        &mut self,
        direction: Direction,
        timestamp: Timestamp,
        volume: Decimal,
        price: Decimal,
        leverage: Decimal,
        ctx: OrderClientContext,
        stp_flag: StpFlag,
        settle_flag: SettleFlag,
        post_only: bool,
        time_in_force: TimeInForce,
        expiry_period: Option<u64>,
        currency: Currency,
        next_id: OrderId,
    ) -> Result<(LimitOrder, PlacementOutcome), BookError> {
        let price = self.round_price(price);
        let volume = self.round_volume(volume);

        if post_only {
            let would_cross = match direction {
                Direction::Buy => !self.sell_queue.is_empty() && price >= self.best_ask(),
                Direction::Sell => !self.buy_queue.is_empty() && price <= self.best_bid(),
            };
            if would_cross {
                return Err(BookError::PostOnlyWouldCross(price.to_string()));
            }
        }

        let mut order = LimitOrder {
            id: next_id,
            timestamp,
            direction,
            volume,
            leverage: self.round_volume(leverage),
            stp_flag,
            settle_flag,
            currency,
            price,
            post_only,
            time_in_force,
            expiry_period,
        };

        if time_in_force == TimeInForce::Fok && !matching::is_fully_fillable(self, direction, price, order.total_volume()) {
            return Err(BookError::FokUnfillable);
        }

        self.order2client_ctx.insert(order.id, ctx);
        let mut aggressor = matching::Aggressor {
            id: order.id,
            agent_id: ctx.agent_id,
            direction,
            leverage: order.leverage,
            stp_flag,
            remaining_total_volume: order.total_volume(),
        };
        let mut outcome = matching::match_against_book(self, &mut aggressor, Some(price));

        order.volume = self.round_volume(
            aggressor
                .remaining_total_volume
                .checked_div(Decimal::ONE + order.leverage)
                .unwrap_or(Decimal::ZERO)
                .max(Decimal::ZERO),
        );

        if order.is_filled() || time_in_force == TimeInForce::Ioc || time_in_force == TimeInForce::Fok {
            self.order2client_ctx.remove(&order.id);
        } else {
            self.register_limit_order(order.clone(), ctx);
            outcome.rested = Some(order.id);
        }

        Ok((order, outcome))
    }
}
