//! Order validation, collateral reservation, trade settlement and
//! margin-call evaluation for one book (§4.2, C7).

use crate::account::AccountRegistry;
use crate::book::{Cancellation, Fill, OrderBook};
use crate::decimal::Decimal;
use crate::error::OrderErrorCode;
use crate::fees::FeePolicy;
use crate::ids::{AgentId, BookId, OrderId, Timestamp};
use crate::order::{Currency, Direction, SettleFlag};
use crate::record::{CancellationEvent, EventPayload, L3Record, OrderEvent, TradeCause, TradeEvent};
use std::collections::{BTreeMap, HashMap};

/// Per-book exchange parameters the clearing manager validates against.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeParams {
    pub price_decimals: u32,
    pub volume_decimals: u32,
    pub max_leverage: Decimal,
    pub maintenance_margin: Decimal,
    pub max_open_orders: usize,
}

/// `marginCallPrice·(1 - 1/(1+leverage) + maintenance)` for a margin buy,
/// symmetric for a margin sell. See spec scenario S6.
pub fn margin_call_price(entry_price: Decimal, leverage: Decimal, maintenance: Decimal, direction: Direction) -> Decimal {
    let inverse_exposure = Decimal::ONE.checked_div(Decimal::ONE + leverage).unwrap_or(Decimal::ONE);
    match direction {
        Direction::Buy => entry_price * (Decimal::ONE - inverse_exposure + maintenance),
        Direction::Sell => entry_price * (Decimal::ONE + inverse_exposure - maintenance),
    }
}

/// Fees charged to both sides of one trade.
#[derive(Debug, Clone, Copy)]
pub struct TradeFees {
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
}

/// A loan flagged for liquidation this step: close `remaining_volume` of
/// `agent_id`'s position at `order_id` with a market order in the
/// opposite direction of the original loan.
#[derive(Debug, Clone, Copy)]
pub struct MarginCallTrigger {
    pub order_id: OrderId,
    pub agent_id: AgentId,
    pub liquidation_direction: Direction,
    pub priority: u64,
}

/// Validates placements, reserves collateral ahead of matching, folds book
/// callbacks back into balances/fees/the L3 record, and evaluates margin
/// calls once per step.
pub struct ClearingManager {
    book_id: BookId,
    params: ExchangeParams,
    margin_buys: BTreeMap<Decimal, Vec<(OrderId, AgentId)>>,
    margin_sells: BTreeMap<Decimal, Vec<(OrderId, AgentId)>>,
    margin_call_counter: u64,
    /// Each leveraged order's margin-call price, fixed at the point the
    /// loan is first opened (`Loan::marginCallPrice` is likewise set once
    /// and never recomputed on later partial fills of the same order).
    order_margin_call_price: HashMap<OrderId, Decimal>,
}

impl ClearingManager {
    /// `calculatCorrespondingVolume`: converts a QUOTE-denominated market
    /// order's notional into a base volume by walking the opposite side of
    /// the book level by level, the same way the book itself would
    /// eventually consume it. Used only for validation/sizing before the
    /// order is handed to the book, which always matches in base units.
    pub fn quote_to_base_volume(book: &OrderBook, direction: Direction, quote_amount: Decimal) -> Decimal {
        let side = match direction {
            Direction::Buy => &book.sell_queue,
            Direction::Sell => &book.buy_queue,
        };
        let levels: Box<dyn Iterator<Item = (&Decimal, &crate::book::TickContainer)>> = match direction {
            Direction::Buy => Box::new(side.iter()),
            Direction::Sell => Box::new(side.iter().rev()),
        };

        let mut remaining_quote = quote_amount;
        let mut base_volume = Decimal::ZERO;
        for (price, level) in levels {
            if remaining_quote.is_zero() || remaining_quote.is_negative() {
                break;
            }
            let level_quote_value = level.volume * *price;
            if level_quote_value <= remaining_quote {
                base_volume += level.volume;
                remaining_quote -= level_quote_value;
            } else {
                base_volume += remaining_quote.checked_div(*price).unwrap_or(Decimal::ZERO);
                remaining_quote = Decimal::ZERO;
            }
        }
        base_volume
    }

    pub fn new(book_id: BookId, params: ExchangeParams) -> Self {
        ClearingManager {
            book_id,
            params,
            margin_buys: BTreeMap::new(),
            margin_sells: BTreeMap::new(),
            margin_call_counter: 0,
            order_margin_call_price: HashMap::new(),
        }
    }

    /// The margin-call price fixed for `order_id` at the point its loan
    /// was opened, or `Decimal::ZERO` for an unleveraged or unknown order
    /// (the value `commit`/`settle_loan` silently ignore in that case).
    pub fn margin_call_price_for(&self, order_id: OrderId) -> Decimal {
        self.order_margin_call_price.get(&order_id).copied().unwrap_or(Decimal::ZERO)
    }

    /// §4.2 pre-placement validation. Does not mutate anything; callers
    /// reserve only after this returns `OrderErrorCode::Valid`.
    pub fn validate(
        &self,
        book: &OrderBook,
        accounts: &AccountRegistry,
        agent_id: AgentId,
        direction: Direction,
        price: Option<Decimal>,
        volume: Decimal,
        leverage: Decimal,
        currency: Currency,
    ) -> OrderErrorCode {
        let volume_rounded = volume.round(self.params.volume_decimals);
        if volume_rounded.is_zero() || volume_rounded.is_negative() {
            return OrderErrorCode::InvalidVolume;
        }
        if let Some(price) = price {
            let price_rounded = price.round(self.params.price_decimals);
            if price_rounded.is_zero() || price_rounded.is_negative() {
                return OrderErrorCode::InvalidPrice;
            }
        }
        if leverage.is_negative() || leverage > self.params.max_leverage {
            return OrderErrorCode::InvalidLeverage;
        }

        if currency == Currency::Quote && direction == Direction::Buy {
            let reference_price = price.unwrap_or_else(|| book.best_ask());
            if reference_price.is_zero() {
                return OrderErrorCode::InsufficientLiquidity;
            }
        }

        let reference_price = price.unwrap_or_else(|| book.mid_price());
        if reference_price.is_zero() && leverage > Decimal::ZERO {
            return OrderErrorCode::InsufficientLiquidity;
        }

        if leverage > Decimal::ZERO && !reference_price.is_zero() {
            // `can_borrow` wants the natural-currency collateral amount:
            // quote for BUY, base for SELL (it converts SELL internally).
            let collateral_amount = match direction {
                Direction::Buy => volume_rounded * reference_price,
                Direction::Sell => volume_rounded,
            };
            let Ok(account) = accounts.get(agent_id) else {
                return OrderErrorCode::InsufficientBalance;
            };
            let Some(balances) = account.balances(self.book_id) else {
                return OrderErrorCode::InsufficientBalance;
            };
            if !balances.can_borrow(collateral_amount, reference_price, direction) {
                return OrderErrorCode::InsufficientBalance;
            }
        }

        if accounts
            .get(agent_id)
            .map(|a| a.active_order_count(self.book_id))
            .unwrap_or(0)
            >= self.params.max_open_orders
        {
            return OrderErrorCode::ActiveOrderCapExceeded;
        }

        OrderErrorCode::Valid
    }

    /// Reserves collateral ahead of matching (§4.2): the natural-currency
    /// notional of the order's full leveraged exposure. For a leveraged
    /// order this also fixes its margin-call price and registers it for
    /// per-step margin-call evaluation.
    pub fn reserve(
        &mut self,
        accounts: &mut AccountRegistry,
        agent_id: AgentId,
        order_id: OrderId,
        direction: Direction,
        price: Decimal,
        volume: Decimal,
        leverage: Decimal,
    ) -> Result<(), crate::error::EngineError> {
        let account = accounts.get_mut(agent_id)?;
        let balances = account
            .balances_mut(self.book_id)
            .ok_or(crate::error::EngineError::UnknownBook(self.book_id))?;
        let total_volume = volume.mul_1p(leverage);
        let amount = match direction {
            Direction::Buy => total_volume * price,
            Direction::Sell => total_volume,
        };
        balances.make_reservation(order_id, price, amount, leverage, direction)?;

        if leverage > Decimal::ZERO {
            let call_price = margin_call_price(price, leverage, self.params.maintenance_margin, direction);
            self.order_margin_call_price.insert(order_id, call_price);
            self.register_margin_call(order_id, agent_id, call_price, direction);
        }

        Ok(())
    }

    /// `orderCreated`: §4.2.
    pub fn on_order_created(&self, accounts: &mut AccountRegistry, agent_id: AgentId, order_id: OrderId, record: &mut L3Record, at: Timestamp, direction: Direction, volume: Decimal, price: Option<Decimal>) {
        if let Ok(account) = accounts.get_mut(agent_id) {
            account.register_active_order(self.book_id, order_id);
        }
        record.push(at, EventPayload::Order(OrderEvent { order_id, agent_id, direction, volume, price }));
    }

    /// `trade` → `handleTrade`: commits both sides' balances, charges
    /// tiered fees, updates fee history, and logs a `TradeEvent`.
    #[allow(clippy::too_many_arguments)]
    pub fn on_trade(
        &mut self,
        accounts: &mut AccountRegistry,
        fees: &mut FeePolicy,
        record: &mut L3Record,
        at: Timestamp,
        fill: &Fill,
        aggressor_agent: AgentId,
        resting_agent: AgentId,
        aggressor_settle_flag: SettleFlag,
        best_bid: Decimal,
        best_ask: Decimal,
        aggressor_margin_call_price: Decimal,
        resting_margin_call_price: Decimal,
        cause: TradeCause,
    ) -> TradeFees {
        let taker_rate = fees.rates(self.book_id, aggressor_agent).taker_rate;
        let maker_rate = fees.rates(self.book_id, resting_agent).maker_rate;
        let notional = fill.volume * fill.price;
        let taker_fee = notional * taker_rate;
        let maker_fee = notional * maker_rate;

        // `commit`'s `amount` is always in the natural currency for
        // `direction` (quote for BUY, base for SELL); `counter_amount` is
        // what the fill actually credits back in the other currency.
        let (buy_amount, buy_counter) = (fill.volume * fill.price, fill.volume);
        let (sell_amount, sell_counter) = (fill.volume, fill.volume * fill.price);

        let mut newly_closed: Vec<(OrderId, Decimal, Direction)> = Vec::new();

        if let Ok(account) = accounts.get_mut(aggressor_agent) {
            if let Some(balances) = account.balances_mut(self.book_id) {
                let (amount, counter_amount) = match fill.direction {
                    Direction::Buy => (buy_amount, buy_counter),
                    Direction::Sell => (sell_amount, sell_counter),
                };
                let closed = balances.commit(
                    fill.aggressor_id,
                    fill.direction,
                    amount,
                    counter_amount,
                    taker_fee,
                    best_bid,
                    best_ask,
                    aggressor_margin_call_price,
                    aggressor_settle_flag,
                );
                // `commit(direction, ...)` only ever settles loans of the
                // opposite direction (see `settle_loan`).
                newly_closed.extend(closed.into_iter().map(|(id, price)| (id, price, fill.direction.opposite())));
            }
        }

        if let Ok(account) = accounts.get_mut(resting_agent) {
            if let Some(balances) = account.balances_mut(self.book_id) {
                let resting_direction = fill.direction.opposite();
                let (amount, counter_amount) = match resting_direction {
                    Direction::Buy => (buy_amount, buy_counter),
                    Direction::Sell => (sell_amount, sell_counter),
                };
                let closed = balances.commit(
                    fill.resting_id,
                    resting_direction,
                    amount,
                    counter_amount,
                    maker_fee,
                    best_bid,
                    best_ask,
                    resting_margin_call_price,
                    fill.resting_settle_flag,
                );
                newly_closed.extend(closed.into_iter().map(|(id, price)| (id, price, resting_direction.opposite())));
            }
        }

        for (loan_id, loan_margin_call_price, loan_direction) in newly_closed {
            self.confirm_settlement(loan_id, loan_margin_call_price, loan_direction);
            self.order_margin_call_price.remove(&loan_id);
        }

        fees.record_volume(self.book_id, aggressor_agent, at, fill.volume);
        fees.record_volume(self.book_id, resting_agent, at, fill.volume);

        if fill.resting_fully_filled {
            if let Ok(account) = accounts.get_mut(resting_agent) {
                account.unregister_active_order(self.book_id, fill.resting_id);
            }
        }

        record.push(
            at,
            EventPayload::Trade(TradeEvent {
                aggressor_order_id: fill.aggressor_id,
                resting_order_id: fill.resting_id,
                aggressor_agent_id: aggressor_agent,
                resting_agent_id: resting_agent,
                direction: fill.direction,
                price: fill.price,
                volume: fill.volume,
                cause,
            }),
        );

        TradeFees { taker_fee, maker_fee }
    }

    /// `cancelOrderDetails` → frees the cancelled portion's reservation and
    /// logs a `CancellationEvent`.
    pub fn on_cancel(
        &self,
        accounts: &mut AccountRegistry,
        record: &mut L3Record,
        at: Timestamp,
        agent_id: AgentId,
        direction: Direction,
        price: Decimal,
        cancellation: Cancellation,
    ) {
        if let Ok(account) = accounts.get_mut(agent_id) {
            if let Some(balances) = account.balances_mut(self.book_id) {
                let _ = balances.free_reservation(cancellation.order_id, price, direction, cancellation.volume);
            }
        }
        record.push(
            at,
            EventPayload::Cancellation(CancellationEvent {
                order_id: cancellation.order_id,
                agent_id,
                volume: cancellation.volume,
            }),
        );
    }

    /// `unregister`: frees any reservation remaining for a fully-filled or
    /// fully-cancelled order and drops it from the agent's active set.
    pub fn on_unregister(&self, accounts: &mut AccountRegistry, agent_id: AgentId, order_id: OrderId) {
        if let Ok(account) = accounts.get_mut(agent_id) {
            account.unregister_active_order(self.book_id, order_id);
            if let Some(balances) = account.balances_mut(self.book_id) {
                balances.release_reservation(order_id);
            }
        }
    }

    /// Registers a newly opened leveraged position for margin-call
    /// tracking.
    pub fn register_margin_call(&mut self, order_id: OrderId, agent_id: AgentId, margin_call_price: Decimal, direction: Direction) {
        let map = match direction {
            Direction::Buy => &mut self.margin_buys,
            Direction::Sell => &mut self.margin_sells,
        };
        map.entry(margin_call_price).or_default().push((order_id, agent_id));
    }

    /// Only erases a margin-call entry once `settle_loan` has confirmed the
    /// loan actually closed (§9 open question, resolved: confirmed
    /// erasure over the source's eager best-effort erasure).
    pub fn confirm_settlement(&mut self, order_id: OrderId, margin_call_price: Decimal, direction: Direction) {
        let map = match direction {
            Direction::Buy => &mut self.margin_buys,
            Direction::Sell => &mut self.margin_sells,
        };
        if let Some(entries) = map.get_mut(&margin_call_price) {
            entries.retain(|(id, _)| *id != order_id);
            if entries.is_empty() {
                map.remove(&margin_call_price);
            }
        }
    }

    /// §4.2 margin-call evaluation: margin buys liquidate when
    /// `bid <= marginCallPrice` (inclusive), margin sells when
    /// `ask >= marginCallPrice` (inclusive). Returns triggers in
    /// increasing dispatch-priority order; the exchange turns each into a
    /// high-priority market order.
    pub fn evaluate_margin_calls(&mut self, book: &OrderBook) -> Vec<MarginCallTrigger> {
        let mut triggers = Vec::new();

        if !book.buy_queue.is_empty() {
            let best_bid = book.best_bid();
            for (_, entries) in self.margin_buys.range(best_bid..) {
                for &(order_id, agent_id) in entries {
                    triggers.push(MarginCallTrigger {
                        order_id,
                        agent_id,
                        liquidation_direction: Direction::Sell,
                        priority: self.margin_call_counter,
                    });
                    self.margin_call_counter += 1;
                }
            }
        }

        if !book.sell_queue.is_empty() {
            let best_ask = book.best_ask();
            for (_, entries) in self.margin_sells.range(..=best_ask) {
                for &(order_id, agent_id) in entries {
                    triggers.push(MarginCallTrigger {
                        order_id,
                        agent_id,
                        liquidation_direction: Direction::Buy,
                        priority: self.margin_call_counter,
                    });
                    self.margin_call_counter += 1;
                }
            }
        }

        triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balances::RoundParams;

    fn params() -> ExchangeParams {
        ExchangeParams {
            price_decimals: 4,
            volume_decimals: 4,
            max_leverage: Decimal::from_int(5),
            maintenance_margin: Decimal::from_f64(0.2),
            max_open_orders: 10,
        }
    }

    #[test]
    fn margin_buy_call_price_matches_scenario_s6() {
        let price = Decimal::from_int(100);
        let leverage = Decimal::from_f64(1.0);
        let maintenance = Decimal::from_f64(0.2);
        let mcp = margin_call_price(price, leverage, maintenance, Direction::Buy);
        // 100 * (1 - 0.5 + 0.2) = 70
        assert_eq!(mcp.round(4).to_f64(), 70.0);
    }

    #[test]
    fn validate_rejects_zero_volume() {
        let book = OrderBook::new(4, 4);
        let accounts = AccountRegistry::new(1, vec![RoundParams { base_decimals: 4, quote_decimals: 4 }]);
        let manager = ClearingManager::new(BookId(0), params());
        let code = manager.validate(
            &book,
            &accounts,
            AgentId(-1),
            Direction::Buy,
            Some(Decimal::from_int(100)),
            Decimal::ZERO,
            Decimal::ZERO,
            Currency::Quote,
        );
        assert_eq!(code, OrderErrorCode::InvalidVolume);
    }

    #[test]
    fn validate_rejects_excess_leverage() {
        let book = OrderBook::new(4, 4);
        let accounts = AccountRegistry::new(1, vec![RoundParams { base_decimals: 4, quote_decimals: 4 }]);
        let manager = ClearingManager::new(BookId(0), params());
        let code = manager.validate(
            &book,
            &accounts,
            AgentId(-1),
            Direction::Buy,
            Some(Decimal::from_int(100)),
            Decimal::from_int(1),
            Decimal::from_int(10),
            Currency::Quote,
        );
        assert_eq!(code, OrderErrorCode::InvalidLeverage);
    }

    #[test]
    fn margin_call_triggers_inclusive_bound() {
        let mut book = OrderBook::new(4, 4);
        let mut manager = ClearingManager::new(BookId(0), params());
        manager.register_margin_call(OrderId::new(1), AgentId(-1), Decimal::from_int(70), Direction::Buy);
        book.place_limit_order(
            Direction::Buy,
            Timestamp(0),
            Decimal::from_int(1),
            Decimal::from_int(70),
            Decimal::ZERO,
            crate::order::OrderClientContext { agent_id: AgentId(-2), client_order_id: None },
            crate::order::StpFlag::None,
            SettleFlag::None,
            false,
            crate::order::TimeInForce::Gtc,
            None,
            Currency::Quote,
            OrderId::new(2),
        )
        .unwrap();
        let triggers = manager.evaluate_margin_calls(&book);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].liquidation_direction, Direction::Sell);
    }
}
