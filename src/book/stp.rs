//! Self-trade prevention (§4.1 STP flags), grounded in
//! `PriceTimeBook::preventSelfTrade`.

use super::matching::{cancel_resting_for_stp, Aggressor};
use super::{OrderBook, PlacementOutcome};
use crate::decimal::Decimal;
use crate::ids::OrderId;
use crate::order::StpFlag;

/// Applies `aggressor.stp_flag` against a same-agent resting order found at
/// the top of the book. Returns `true` if the match loop should stop
/// entirely (the aggressor has nothing left to match, or both sides were
/// cancelled); `false` means the loop should `continue` and re-examine the
/// (possibly now-different) best level.
pub(super) fn prevent_self_trade(
    book: &mut OrderBook,
    aggressor: &mut Aggressor,
    resting_id: OrderId,
    price: Decimal,
    outcome: &mut PlacementOutcome,
) -> bool {
    match aggressor.stp_flag {
        StpFlag::None => false,

        StpFlag::CancelNew => {
            aggressor.remaining_total_volume = Decimal::ZERO;
            true
        }

        StpFlag::CancelOld => {
            let (_, cancellation) = cancel_resting_for_stp(book, aggressor.direction, resting_id, price, None);
            outcome.self_trade_cancellations.push(cancellation);
            false
        }

        StpFlag::CancelBoth => {
            aggressor.remaining_total_volume = Decimal::ZERO;
            let (_, cancellation) = cancel_resting_for_stp(book, aggressor.direction, resting_id, price, None);
            outcome.self_trade_cancellations.push(cancellation);
            true
        }

        StpFlag::DecrementCancel => {
            let resting_total = book.order_id_map.get(&resting_id).map(|o| o.total_volume()).unwrap_or(Decimal::ZERO);
            let resting_leverage = book.order_id_map.get(&resting_id).map(|o| o.leverage).unwrap_or(Decimal::ZERO);

            if resting_total == aggressor.remaining_total_volume {
                aggressor.remaining_total_volume = Decimal::ZERO;
                let (_, cancellation) = cancel_resting_for_stp(book, aggressor.direction, resting_id, price, None);
                outcome.self_trade_cancellations.push(cancellation);
                true
            } else if resting_total < aggressor.remaining_total_volume {
                aggressor.remaining_total_volume -= resting_total;
                let (_, cancellation) = cancel_resting_for_stp(book, aggressor.direction, resting_id, price, None);
                outcome.self_trade_cancellations.push(cancellation);
                false
            } else {
                let pre_leverage = aggressor
                    .remaining_total_volume
                    .checked_div(Decimal::ONE + resting_leverage)
                    .unwrap_or(Decimal::ZERO);
                aggressor.remaining_total_volume = Decimal::ZERO;
                let (_, cancellation) =
                    cancel_resting_for_stp(book, aggressor.direction, resting_id, price, Some(pre_leverage));
                outcome.self_trade_cancellations.push(cancellation);
                true
            }
        }
    }
}
