//! Aggressing-order matching loop (§4.1 step 2).
//!
//! Grounded in `PriceTimeBook::processAgainstThe{Buy,Sell}Queue`: round
//! both sides to the book's configured decimals at entry, walk price
//! levels from the best price outward, self-trade-prevent when the
//! resting order belongs to the same agent, fill `min(totalVolume)` at
//! the resting level's price, and pop exhausted orders/levels as they
//! empty.

use super::{Cancellation, Fill, OrderBook, PlacementOutcome};
use crate::decimal::Decimal;
use crate::ids::{AgentId, OrderId};
use crate::order::{Direction, StpFlag};

/// Mutable view of the order currently matching against the book. Lives
/// only for the duration of one placement; it becomes a resting
/// `LimitOrder` afterward if anything remains and the order is allowed to
/// rest.
pub(super) struct Aggressor {
    pub id: OrderId,
    pub agent_id: AgentId,
    pub direction: Direction,
    pub leverage: Decimal,
    pub stp_flag: StpFlag,
    pub remaining_total_volume: Decimal,
}

/// Matches `aggressor` against the opposite side of `book` up to
/// `max_price` (`None` = unbounded, i.e. a market order), mutating the
/// book in place and returning every fill/self-trade-cancellation that
/// occurred.
pub(super) fn match_against_book(
    book: &mut OrderBook,
    aggressor: &mut Aggressor,
    max_price: Option<Decimal>,
) -> PlacementOutcome {
    let mut outcome = PlacementOutcome::default();

    loop {
        if aggressor.remaining_total_volume.is_zero() || aggressor.remaining_total_volume.is_negative() {
            break;
        }

        let best_price = match aggressor.direction {
            Direction::Buy => book.sell_queue.keys().next().copied(),
            Direction::Sell => book.buy_queue.keys().next_back().copied(),
        };
        let Some(best_price) = best_price else { break };

        if let Some(max_price) = max_price {
            let out_of_range = match aggressor.direction {
                Direction::Buy => best_price > max_price,
                Direction::Sell => best_price < max_price,
            };
            if out_of_range {
                break;
            }
        }

        let resting_id = {
            let side = match aggressor.direction {
                Direction::Buy => &book.sell_queue,
                Direction::Sell => &book.buy_queue,
            };
            side.get(&best_price).and_then(|level| level.orders.front().copied())
        };
        let Some(resting_id) = resting_id else {
            remove_level_if_empty(book, aggressor.direction, best_price);
            continue;
        };

        let resting_agent = book.client_context(resting_id).map(|c| c.agent_id);
        let Some(resting_agent_id) = resting_agent else { break };
        if resting_agent == Some(aggressor.agent_id) && aggressor.stp_flag != StpFlag::None {
            let stopped = super::stp::prevent_self_trade(book, aggressor, resting_id, best_price, &mut outcome);
            if stopped {
                break;
            }
            continue;
        }

        let Some(resting_order) = book.order_id_map.get(&resting_id) else { break };
        let resting_total_volume = resting_order.total_volume();
        let resting_settle_flag = resting_order.settle_flag;
        let used_volume = aggressor.remaining_total_volume.min(resting_total_volume);

        if used_volume.is_zero() {
            break;
        }

        aggressor.remaining_total_volume -= used_volume;

        let resting_fully_filled = apply_fill_to_resting(book, aggressor.direction, resting_id, best_price, used_volume);

        outcome.fills.push(Fill {
            aggressor_id: aggressor.id,
            resting_id,
            resting_agent_id,
            resting_settle_flag,
            direction: aggressor.direction,
            price: best_price,
            volume: used_volume,
            resting_fully_filled,
        });

        if resting_fully_filled {
            unregister_from_level(book, aggressor.direction, best_price, resting_id);
        }

        remove_level_if_empty(book, aggressor.direction, best_price);
    }

    outcome
}

/// Reduces the resting order's (and its level's) remaining volume by
/// `used_volume`, returning whether the resting order is now fully filled.
fn apply_fill_to_resting(
    book: &mut OrderBook,
    aggressor_direction: Direction,
    resting_id: OrderId,
    price: Decimal,
    used_volume: Decimal,
) -> bool {
    let resting_side = aggressor_direction.opposite();
    let fully_filled = {
        let Some(order) = book.order_id_map.get_mut(&resting_id) else { return true };
        let pre_leverage_used = used_volume.checked_div(Decimal::ONE + order.leverage).unwrap_or(Decimal::ZERO);
        order.volume = (order.volume - pre_leverage_used).max(Decimal::ZERO);
        order.is_filled()
    };

    let side = match resting_side {
        Direction::Buy => &mut book.buy_queue,
        Direction::Sell => &mut book.sell_queue,
    };
    if let Some(level) = side.get_mut(&price) {
        level.volume = (level.volume - used_volume).max(Decimal::ZERO);
    }

    fully_filled
}

pub(super) fn unregister_from_level(book: &mut OrderBook, aggressor_direction: Direction, price: Decimal, order_id: OrderId) {
    let resting_side = aggressor_direction.opposite();
    let side = match resting_side {
        Direction::Buy => &mut book.buy_queue,
        Direction::Sell => &mut book.sell_queue,
    };
    if let Some(level) = side.get_mut(&price) {
        level.orders.retain(|id| *id != order_id);
    }
    book.unregister_limit_order(order_id);
}

fn remove_level_if_empty(book: &mut OrderBook, aggressor_direction: Direction, price: Decimal) {
    let resting_side = aggressor_direction.opposite();
    let side = match resting_side {
        Direction::Buy => &mut book.buy_queue,
        Direction::Sell => &mut book.sell_queue,
    };
    let empty = side.get(&price).map(|l| l.orders.is_empty()).unwrap_or(false);
    if empty {
        side.remove(&price);
    }
}

/// Cancels `volume` (or the whole order if `None`) from a resting order
/// found while processing self-trade prevention, returning whether the
/// cancellation removed the order entirely. This mirrors `Book::cancelOrderOpt`
/// but is invoked mid-match, so it operates on the same maps directly
/// rather than recursing through the public API.
pub(super) fn cancel_resting_for_stp(
    book: &mut OrderBook,
    aggressor_direction: Direction,
    resting_id: OrderId,
    price: Decimal,
    volume: Option<Decimal>,
) -> (bool, Cancellation) {
    let resting_side = aggressor_direction.opposite();
    let (to_cancel, fully_cancelled, leverage) = {
        let Some(order) = book.order_id_map.get_mut(&resting_id) else {
            return (false, Cancellation { order_id: resting_id, volume, direction: resting_side, price });
        };
        let to_cancel = volume.unwrap_or(order.volume).min(order.volume);
        order.volume -= to_cancel;
        (to_cancel, order.is_filled(), order.leverage)
    };

    let side = match resting_side {
        Direction::Buy => &mut book.buy_queue,
        Direction::Sell => &mut book.sell_queue,
    };
    if let Some(level) = side.get_mut(&price) {
        level.volume = (level.volume - to_cancel.mul_1p(leverage)).max(Decimal::ZERO);
        if fully_cancelled {
            level.orders.retain(|id| *id != resting_id);
        }
        if level.orders.is_empty() {
            side.remove(&price);
        }
    }

    if fully_cancelled {
        book.unregister_limit_order(resting_id);
    }

    (fully_cancelled, Cancellation { order_id: resting_id, volume, direction: resting_side, price })
}

/// `FOK` pre-check: would the order fill in full against the book as it
/// stands right now, without mutating anything?
pub(super) fn is_fully_fillable(book: &OrderBook, direction: Direction, max_price: Decimal, total_volume: Decimal) -> bool {
    let side = match direction {
        Direction::Buy => &book.sell_queue,
        Direction::Sell => &book.buy_queue,
    };
    let mut remaining = total_volume;
    let levels: Box<dyn Iterator<Item = (&Decimal, &super::TickContainer)>> = match direction {
        Direction::Buy => Box::new(side.iter()),
        Direction::Sell => Box::new(side.iter().rev()),
    };
    for (price, level) in levels {
        let in_range = match direction {
            Direction::Buy => *price <= max_price,
            Direction::Sell => *price >= max_price,
        };
        if !in_range {
            break;
        }
        remaining -= level.volume.min(remaining);
        if remaining.is_zero() {
            return true;
        }
    }
    remaining.is_zero()
}
