//! Base + quote balances for one `(agent, book)` pair, with leverage and
//! loan bookkeeping (§3 C3, §4.3).
//!
//! Grounded in `examples/original_source/.../accounting/Balances.cpp`:
//! the reservation/commit/borrow/settleLoan algorithms are carried over
//! almost line for line, replacing exceptions and `checkNegative` log
//! lines with `Result`s and `tracing::warn!`.

use crate::balance::Balance;
use crate::decimal::Decimal;
use crate::error::BalanceError;
use crate::ids::OrderId;
use crate::order::{Direction, SettleFlag};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// How much of a reservation/free/commit landed in each currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationAmounts {
    pub base: Decimal,
    pub quote: Decimal,
}

/// Collateral backing a leveraged position, split across both currencies.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Collateral {
    pub base: Decimal,
    pub quote: Decimal,
}

impl Collateral {
    pub fn value_in_quote(&self, price: Decimal) -> Decimal {
        self.base * price + self.quote
    }

    pub fn value_in_base(&self, price: Decimal) -> Decimal {
        self.base + self.quote / price
    }
}

/// An outstanding leveraged position, closed by settlement or margin call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    pub amount: Decimal,
    pub direction: Direction,
    pub leverage: Decimal,
    pub collateral: Collateral,
    pub margin_call_price: Decimal,
}

/// Rounding precision for both currencies of a book.
#[derive(Debug, Clone, Copy)]
pub struct RoundParams {
    pub base_decimals: u32,
    pub quote_decimals: u32,
}

/// Base + quote [`Balance`]s for one `(agent, book)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balances {
    pub base: Balance,
    pub quote: Balance,
    #[serde(skip, default = "default_round_params")]
    round_params: RoundParams,
    buy_leverages: HashMap<OrderId, Decimal>,
    sell_leverages: HashMap<OrderId, Decimal>,
    loan_order: Vec<OrderId>,
    loans: HashMap<OrderId, Loan>,
    base_loan: Decimal,
    quote_loan: Decimal,
    base_collateral: Decimal,
    quote_collateral: Decimal,
}

fn default_round_params() -> RoundParams {
    RoundParams { base_decimals: 8, quote_decimals: 8 }
}

impl Balances {
    pub fn new(base: Decimal, quote: Decimal, round_params: RoundParams) -> Self {
        Balances {
            base: Balance::new(base),
            quote: Balance::new(quote),
            round_params,
            buy_leverages: HashMap::new(),
            sell_leverages: HashMap::new(),
            loan_order: Vec::new(),
            loans: HashMap::new(),
            base_loan: Decimal::ZERO,
            quote_loan: Decimal::ZERO,
            base_collateral: Decimal::ZERO,
            quote_collateral: Decimal::ZERO,
        }
    }

    pub fn base_loan(&self) -> Decimal {
        self.base_loan
    }

    pub fn quote_loan(&self) -> Decimal {
        self.quote_loan
    }

    pub fn base_collateral(&self) -> Decimal {
        self.base_collateral
    }

    pub fn quote_collateral(&self) -> Decimal {
        self.quote_collateral
    }

    pub fn loan(&self, id: OrderId) -> Option<&Loan> {
        self.loans.get(&id)
    }

    fn round_amount(&self, amount: Decimal, direction: Direction) -> Decimal {
        match direction {
            Direction::Buy => amount.round(self.round_params.quote_decimals),
            Direction::Sell => amount.round(self.round_params.base_decimals),
        }
    }

    fn round_up_base(&self, amount: Decimal) -> Decimal {
        amount.round_up(self.round_params.base_decimals)
    }

    fn round_up_quote(&self, amount: Decimal) -> Decimal {
        amount.round_up(self.round_params.quote_decimals)
    }

    fn round_base(&self, amount: Decimal) -> Decimal {
        amount.round(self.round_params.base_decimals)
    }

    fn round_quote(&self, amount: Decimal) -> Decimal {
        amount.round(self.round_params.quote_decimals)
    }

    pub fn get_leverage(&self, id: OrderId, direction: Direction) -> Decimal {
        let map = match direction {
            Direction::Buy => &self.buy_leverages,
            Direction::Sell => &self.sell_leverages,
        };
        map.get(&id).copied().unwrap_or(Decimal::ZERO)
    }

    /// `base.free * price + quote.free` — wealth available to back new
    /// leveraged orders.
    pub fn wealth(&self, price: Decimal) -> Decimal {
        self.base.free() * price + self.quote.free()
    }

    pub fn reservation_in_quote(&self, id: OrderId, price: Decimal) -> Decimal {
        let base_value = self.base.reservation(id).unwrap_or(Decimal::ZERO) * price;
        self.round_quote(base_value + self.quote.reservation(id).unwrap_or(Decimal::ZERO))
    }

    pub fn reservation_in_base(&self, id: OrderId, price: Decimal) -> Decimal {
        let quote_value = self.round_base(self.quote.reservation(id).unwrap_or(Decimal::ZERO) / price);
        self.base.reservation(id).unwrap_or(Decimal::ZERO) + quote_value
    }

    pub fn total_loan_in_quote(&self, price: Decimal) -> Decimal {
        self.base_loan * price + self.quote_loan
    }

    /// `canBorrow`: is there enough free wealth to post the collateral a
    /// new leveraged order at `price`/`direction` would require?
    pub fn can_borrow(&self, collateral_amount: Decimal, price: Decimal, direction: Direction) -> bool {
        let required = match direction {
            Direction::Buy => self.round_up_quote(collateral_amount),
            Direction::Sell => self.round_up_quote(collateral_amount * price),
        };
        required <= self.wealth(price)
    }

    /// §4.3 `makeReservation`.
    pub fn make_reservation(
        &mut self,
        id: OrderId,
        price: Decimal,
        amount: Decimal,
        leverage: Decimal,
        direction: Direction,
    ) -> Result<ReservationAmounts, BalanceError> {
        if self.round_amount(amount, direction).is_zero() {
            return Ok(ReservationAmounts::default());
        }

        if leverage.is_zero() {
            return Ok(match direction {
                Direction::Buy => ReservationAmounts {
                    quote: self.quote.make_reservation(id, amount)?,
                    base: Decimal::ZERO,
                },
                Direction::Sell => ReservationAmounts {
                    base: self.base.make_reservation(id, amount)?,
                    quote: Decimal::ZERO,
                },
            });
        }

        let reserved = match direction {
            Direction::Buy => {
                let reserved = if self.quote.can_reserve(amount) {
                    ReservationAmounts {
                        quote: self.quote.make_reservation(id, amount)?,
                        base: Decimal::ZERO,
                    }
                } else {
                    let required_base = self.round_up_base((amount - self.quote.free()) / price);
                    let quote_free = self.quote.free();
                    ReservationAmounts {
                        base: self.base.make_reservation(id, required_base)?,
                        quote: self.quote.make_reservation(id, quote_free)?,
                    }
                };
                self.buy_leverages.insert(id, leverage);
                reserved
            }
            Direction::Sell => {
                let reserved = if self.base.can_reserve(amount) {
                    ReservationAmounts {
                        base: self.base.make_reservation(id, amount)?,
                        quote: Decimal::ZERO,
                    }
                } else {
                    let required_quote = self.round_up_quote((amount - self.base.free()) * price);
                    let base_free = self.base.free();
                    ReservationAmounts {
                        base: self.base.make_reservation(id, base_free)?,
                        quote: self.quote.make_reservation(id, required_quote)?,
                    }
                };
                self.sell_leverages.insert(id, leverage);
                reserved
            }
        };

        Ok(reserved)
    }

    /// §4.3 `freeReservation`. The execution price is used for the
    /// currency-conversion clamp in the leveraged partial-free path (§9
    /// open question, resolved: always the execution price, never a
    /// separately-sampled best quote).
    pub fn free_reservation(
        &mut self,
        id: OrderId,
        price: Decimal,
        direction: Direction,
        amount: Option<Decimal>,
    ) -> Result<ReservationAmounts, BalanceError> {
        if self.get_leverage(id, direction).is_zero() {
            let freed = match direction {
                Direction::Buy => ReservationAmounts {
                    quote: self.quote.free_reservation(id, amount)?,
                    base: Decimal::ZERO,
                },
                Direction::Sell => ReservationAmounts {
                    base: self.base.free_reservation(id, amount)?,
                    quote: Decimal::ZERO,
                },
            };
            return Ok(freed);
        }

        let freed = match amount {
            None => ReservationAmounts {
                base: self.base.try_free_reservation(id, None),
                quote: self.quote.try_free_reservation(id, None),
            },
            Some(amount) => match direction {
                Direction::Buy => {
                    let base_quote_value =
                        self.round_quote(self.base.reservation(id).unwrap_or(Decimal::ZERO) * price);
                    if amount <= base_quote_value {
                        ReservationAmounts {
                            base: self.base.try_free_reservation(id, Some(amount)),
                            quote: Decimal::ZERO,
                        }
                    } else {
                        ReservationAmounts {
                            base: self.base.try_free_reservation(id, None),
                            quote: self.quote.try_free_reservation(id, Some(amount - base_quote_value)),
                        }
                    }
                }
                Direction::Sell => {
                    let quote_base_value =
                        self.round_base(self.quote.reservation(id).unwrap_or(Decimal::ZERO) / price);
                    if amount <= quote_base_value {
                        ReservationAmounts {
                            base: Decimal::ZERO,
                            quote: self.quote.try_free_reservation(id, Some(amount)),
                        }
                    } else {
                        ReservationAmounts {
                            base: self.base.try_free_reservation(id, Some(amount - quote_base_value)),
                            quote: self.quote.try_free_reservation(id, None),
                        }
                    }
                }
            },
        };

        if self.reservation_in_quote(id, price).is_zero() && !self.loans.contains_key(&id) {
            match direction {
                Direction::Buy => self.buy_leverages.remove(&id),
                Direction::Sell => self.sell_leverages.remove(&id),
            };
        }

        Ok(freed)
    }

    /// Frees every remaining reservation for `id` regardless of direction,
    /// used by cancellation and `RESET_AGENT` flows.
    pub fn release_reservation(&mut self, id: OrderId) {
        self.base.try_free_reservation(id, None);
        self.quote.try_free_reservation(id, None);
        if self.base.reservation(id).is_none()
            && self.quote.reservation(id).is_none()
            && !self.loans.contains_key(&id)
        {
            self.buy_leverages.remove(&id);
            self.sell_leverages.remove(&id);
        }
    }

    /// §4.3 `commit`: settles a fill's reservation (or converts it into a
    /// loan) and credits the counter-asset, then attempts `settleLoan`
    /// per `settle_flag`. Returns `(loan id, margin call price)` pairs for
    /// every loan fully closed by this settlement.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &mut self,
        id: OrderId,
        direction: Direction,
        amount: Decimal,
        counter_amount: Decimal,
        fee: Decimal,
        best_bid: Decimal,
        best_ask: Decimal,
        margin_call_price: Decimal,
        settle_flag: SettleFlag,
    ) -> Vec<(OrderId, Decimal)> {
        let amount = self.round_amount(amount, direction);
        let fee = self.round_amount(fee, Direction::Buy);
        let leverage = self.get_leverage(id, direction);

        if leverage.is_zero() {
            match direction {
                Direction::Buy => {
                    self.quote.void_reservation(id, amount + fee);
                    if let Err(e) = self.base.deposit(counter_amount) {
                        warn!(?e, "deposit rejected during commit");
                    }
                }
                Direction::Sell => {
                    self.base.void_reservation(id, amount);
                    if let Err(e) = self.quote.deposit(counter_amount - fee) {
                        warn!(?e, "deposit rejected during commit");
                    }
                }
            }
        } else {
            match direction {
                Direction::Buy => {
                    self.borrow(id, direction, amount + fee, leverage, best_bid, best_ask, margin_call_price);
                    if let Err(e) = self.base.deposit(counter_amount) {
                        warn!(?e, "deposit rejected during commit");
                    }
                }
                Direction::Sell => {
                    self.borrow(id, direction, amount, leverage, best_bid, best_ask, margin_call_price);
                    if let Err(e) = self.quote.deposit(counter_amount - fee) {
                        warn!(?e, "deposit rejected during commit");
                    }
                }
            }
        }

        match settle_flag {
            SettleFlag::None => vec![],
            SettleFlag::Fifo => {
                let settle_amount = if direction == Direction::Buy { counter_amount } else { counter_amount - fee };
                let settle_price = if direction == Direction::Buy { best_ask } else { best_bid };
                self.settle_loan(direction, settle_amount, settle_price, None)
            }
            SettleFlag::Order(margin_order_id) => {
                let settle_amount = if direction == Direction::Buy { counter_amount } else { counter_amount - fee };
                let settle_price = if direction == Direction::Buy { best_ask } else { best_bid };
                self.settle_loan(direction, settle_amount, settle_price, Some(margin_order_id))
            }
        }
    }

    /// §4.3 `settleLoan`: walks `loans` in insertion order (or a single
    /// `margin_order_id`), closing opposite-direction loans FIFO.
    pub fn settle_loan(
        &mut self,
        direction: Direction,
        mut amount: Decimal,
        price: Decimal,
        margin_order_id: Option<OrderId>,
    ) -> Vec<(OrderId, Decimal)> {
        if self.loans.is_empty() || amount <= Decimal::ZERO {
            return vec![];
        }

        let mut settled = vec![];

        let mut settle_one = |balances: &mut Balances, loan_id: OrderId, amount: &mut Decimal| -> bool {
            let Some(loan) = balances.loans.get(&loan_id) else { return false };
            if loan.direction == direction {
                return false;
            }
            let settle_amount = loan.amount.min(*amount);
            let (released_base, released_quote) = {
                let loan = balances.loans.get_mut(&loan_id).unwrap();
                let fraction = if loan.amount.is_zero() {
                    Decimal::ZERO
                } else {
                    settle_amount / loan.amount
                };
                let released = Collateral {
                    base: balances.round_base(loan.collateral.base * fraction),
                    quote: balances.round_quote(loan.collateral.quote * fraction),
                };
                loan.amount -= settle_amount;
                loan.collateral.base -= released.base;
                loan.collateral.quote -= released.quote;
                (released.base, released.quote)
            };

            *amount = balances.round_amount(*amount - settle_amount, balances.loans[&loan_id].direction);
            balances.base_collateral -= released_base;
            balances.quote_collateral -= released_quote;

            match direction {
                Direction::Buy => {
                    let _ = balances.base.deposit(released_base - settle_amount);
                    let _ = balances.quote.deposit(released_quote);
                    balances.base_loan -= settle_amount;
                }
                Direction::Sell => {
                    let _ = balances.base.deposit(released_base);
                    let _ = balances.quote.deposit(released_quote - settle_amount);
                    balances.quote_loan -= settle_amount;
                }
            }

            let loan_empty = balances.loans.get(&loan_id).map(|l| l.amount.is_zero()).unwrap_or(true);
            if loan_empty {
                let margin_call_price = balances.loans.get(&loan_id).map(|l| l.margin_call_price).unwrap_or(Decimal::ZERO);
                if balances.reservation_in_quote(loan_id, price).is_zero() {
                    match direction {
                        Direction::Buy => balances.sell_leverages.remove(&loan_id),
                        Direction::Sell => balances.buy_leverages.remove(&loan_id),
                    };
                }
                balances.loans.remove(&loan_id);
                balances.loan_order.retain(|i| *i != loan_id);
                settled.push((loan_id, margin_call_price));
            }
            true
        };

        if let Some(margin_order_id) = margin_order_id {
            settle_one(self, margin_order_id, &mut amount);
        } else {
            let mut idx = 0;
            while idx < self.loan_order.len() && amount > Decimal::ZERO {
                let loan_id = self.loan_order[idx];
                if settle_one(self, loan_id, &mut amount) {
                    // the settled loan (if removed) shifted indices down; restart scan
                    idx = 0;
                } else {
                    idx += 1;
                }
            }
        }

        self.check_negative(margin_order_id.unwrap_or(OrderId::new(0)));
        settled
    }

    /// §4.3 `borrow`: converts an order's remaining reservations into
    /// loan collateral, crediting any loan-amount rounding excess back to
    /// the order's quote reservation.
    #[allow(clippy::too_many_arguments)]
    fn borrow(
        &mut self,
        id: OrderId,
        direction: Direction,
        amount: Decimal,
        leverage: Decimal,
        best_bid: Decimal,
        best_ask: Decimal,
        margin_call_price: Decimal,
    ) {
        let collateral_amount = self.round_amount(amount / (Decimal::ONE + leverage), direction);
        let mut collateral = Collateral::default();

        match direction {
            Direction::Buy => {
                let quote_reserved = self.quote.reservation(id).unwrap_or(Decimal::ZERO);
                if quote_reserved >= collateral_amount {
                    collateral.quote = collateral_amount;
                } else {
                    let mut remaining_base = self.round_up_base((collateral_amount - quote_reserved) / best_ask);
                    let base_reserved = self.base.reservation(id).unwrap_or(Decimal::ZERO);
                    if remaining_base > base_reserved {
                        remaining_base = base_reserved;
                    }
                    collateral.base = remaining_base;
                    collateral.quote = quote_reserved;
                }
            }
            Direction::Sell => {
                let base_reserved = self.base.reservation(id).unwrap_or(Decimal::ZERO);
                if base_reserved >= collateral_amount {
                    collateral.base = collateral_amount;
                } else {
                    let mut remaining_quote = self.round_up_quote((collateral_amount - base_reserved) * best_bid);
                    let quote_reserved = self.quote.reservation(id).unwrap_or(Decimal::ZERO);
                    if remaining_quote > quote_reserved {
                        remaining_quote = quote_reserved;
                    }
                    collateral.base = base_reserved;
                    collateral.quote = remaining_quote;
                }
            }
        }

        self.base_collateral += collateral.base;
        self.quote_collateral += collateral.quote;

        let mut loan_amount = match direction {
            Direction::Buy => {
                let loan_amount = self.round_quote(collateral.value_in_quote(best_ask) * (Decimal::ONE + leverage));
                if loan_amount > amount {
                    let diff = self.round_quote((loan_amount - amount) / (Decimal::ONE + leverage));
                    let _ = self.quote.deposit(diff);
                    let _ = self.quote.make_reservation(id, diff);
                }
                loan_amount.min(amount)
            }
            Direction::Sell => {
                let loan_amount = self.round_base(collateral.value_in_base(best_bid) * (Decimal::ONE + leverage));
                if loan_amount > amount {
                    let diff = self.round_quote((loan_amount - amount) * best_bid / (Decimal::ONE + leverage));
                    let _ = self.quote.deposit(diff);
                    let _ = self.quote.make_reservation(id, diff);
                }
                loan_amount.min(amount)
            }
        };

        if collateral.base > Decimal::ZERO {
            self.base.void_reservation(id, collateral.base);
        }
        if collateral.quote > Decimal::ZERO {
            self.quote.void_reservation(id, collateral.quote);
        }

        if self.base.reservation(id).is_none() && self.quote.reservation(id).is_none() {
            loan_amount = amount;
        }

        match direction {
            Direction::Buy => self.quote_loan += loan_amount,
            Direction::Sell => self.base_loan += loan_amount,
        }

        match self.loans.get_mut(&id) {
            Some(existing) => {
                existing.amount += loan_amount;
                existing.collateral.base += collateral.base;
                existing.collateral.quote += collateral.quote;
            }
            None => {
                self.loan_order.push(id);
                self.loans.insert(
                    id,
                    Loan {
                        amount: loan_amount,
                        direction,
                        leverage,
                        collateral,
                        margin_call_price,
                    },
                );
            }
        }

        self.check_negative(id);
    }

    /// I5: clamp any rounding-induced negative aggregate to zero,
    /// compensating loans (which represent money owed to the balance) with
    /// a deposit so the clamp does not silently destroy value.
    fn check_negative(&mut self, id: OrderId) {
        if self.base_collateral.is_negative() {
            warn!(%id, value = %self.base_collateral, "base collateral went negative, clamping");
            self.base_collateral = Decimal::ZERO;
        }
        if self.quote_collateral.is_negative() {
            warn!(%id, value = %self.quote_collateral, "quote collateral went negative, clamping");
            self.quote_collateral = Decimal::ZERO;
        }
        if self.base_loan.is_negative() {
            warn!(%id, value = %self.base_loan, "base loan went negative, clamping and compensating");
            let _ = self.base.deposit(-self.base_loan);
            self.base_loan = Decimal::ZERO;
        }
        if self.quote_loan.is_negative() {
            warn!(%id, value = %self.quote_loan, "quote loan went negative, clamping and compensating");
            let _ = self.quote.deposit(-self.quote_loan);
            self.quote_loan = Decimal::ZERO;
        }
    }
}
