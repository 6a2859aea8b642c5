//! Per-currency balance with per-order reservations (§3, C2).
//!
//! Invariants I1-I4 from spec.md §3 are enforced at the API boundary:
//! `make_reservation`/`free_reservation` return an error rather than ever
//! letting `free` or `reserved` go negative.

use crate::decimal::Decimal;
use crate::error::BalanceError;
use crate::ids::OrderId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Holdings of a single currency for one `(agent, book)` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    free: Decimal,
    reserved: Decimal,
    reservations: HashMap<OrderId, Decimal>,
}

impl Balance {
    pub fn new(initial: Decimal) -> Self {
        Balance {
            free: initial,
            reserved: Decimal::ZERO,
            reservations: HashMap::new(),
        }
    }

    pub fn free(&self) -> Decimal {
        self.free
    }

    pub fn reserved(&self) -> Decimal {
        self.reserved
    }

    /// `total = free + reserved` (I1).
    pub fn total(&self) -> Decimal {
        self.free + self.reserved
    }

    pub fn reservation(&self, id: OrderId) -> Option<Decimal> {
        self.reservations.get(&id).copied()
    }

    pub fn can_reserve(&self, amount: Decimal) -> bool {
        amount <= self.free
    }

    /// I3: `amount <= free`. Adds to any existing reservation under `id`.
    pub fn make_reservation(
        &mut self,
        id: OrderId,
        amount: Decimal,
    ) -> Result<Decimal, BalanceError> {
        if amount.is_zero() {
            return Ok(Decimal::ZERO);
        }
        if !self.can_reserve(amount) {
            return Err(BalanceError::InsufficientFree {
                requested: amount.to_string(),
                available: self.free.to_string(),
            });
        }
        self.free -= amount;
        self.reserved += amount;
        *self.reservations.entry(id).or_insert(Decimal::ZERO) += amount;
        Ok(amount)
    }

    /// I4: `amount <= reservations[id]`. Returns the freed amount to `free`
    /// and drops the reservation entry once it reaches zero. `amount =
    /// None` frees the entire reservation.
    pub fn free_reservation(
        &mut self,
        id: OrderId,
        amount: Option<Decimal>,
    ) -> Result<Decimal, BalanceError> {
        let available = self.reservations.get(&id).copied().unwrap_or(Decimal::ZERO);
        let amount = amount.unwrap_or(available);
        if amount.is_zero() {
            return Ok(Decimal::ZERO);
        }
        if amount > available {
            return Err(BalanceError::InsufficientReservation {
                order_id: id,
                requested: amount.to_string(),
                available: available.to_string(),
            });
        }
        self.reserved -= amount;
        self.free += amount;
        let remaining = available - amount;
        if remaining.is_zero() {
            self.reservations.remove(&id);
        } else {
            self.reservations.insert(id, remaining);
        }
        Ok(amount)
    }

    /// Same as [`Self::free_reservation`] but never errors: frees whatever
    /// is available (possibly zero) and returns the actual amount freed.
    /// Used by cleanup paths where the order may already be fully settled.
    pub fn try_free_reservation(&mut self, id: OrderId, amount: Option<Decimal>) -> Decimal {
        let available = self.reservations.get(&id).copied().unwrap_or(Decimal::ZERO);
        let requested = amount.unwrap_or(available).min(available);
        self.free_reservation(id, Some(requested)).unwrap_or(Decimal::ZERO)
    }

    /// Consumes `amount` from an existing reservation without returning it
    /// to `free` — the reserved funds have been spent (a trade settled, or
    /// converted into loan collateral). I2 holds because the reservation
    /// map is reduced in lockstep with `reserved`.
    pub fn void_reservation(&mut self, id: OrderId, amount: Decimal) -> Decimal {
        let available = self.reservations.get(&id).copied().unwrap_or(Decimal::ZERO);
        let voided = amount.min(available);
        self.reserved -= voided;
        let remaining = available - voided;
        if remaining.is_zero() {
            self.reservations.remove(&id);
        } else {
            self.reservations.insert(id, remaining);
        }
        voided
    }

    /// Atomic add that must not drive `total < 0` (§9 open question,
    /// resolved): a negative deposit whose magnitude exceeds `free` fails
    /// rather than clamping, since `free` itself must never go negative
    /// and nothing here touches `reserved`.
    pub fn deposit(&mut self, amount: Decimal) -> Result<(), BalanceError> {
        let new_free = self.free + amount;
        if new_free.is_negative() {
            return Err(BalanceError::NegativeDepositRejected {
                amount: amount.to_string(),
            });
        }
        self.free = new_free;
        Ok(())
    }

    /// Clamps a negative `free` to zero after a rounding-induced violation
    /// and reports it, per §7's invariant-violation policy: clamp and
    /// continue rather than unwind.
    pub fn clamp_non_negative(&mut self, context: &str) {
        if self.free.is_negative() {
            warn!(context, free = %self.free, "clamping negative free balance to zero");
            self.free = Decimal::ZERO;
        }
        if self.reserved.is_negative() {
            warn!(context, reserved = %self.reserved, "clamping negative reserved balance to zero");
            self.reserved = Decimal::ZERO;
        }
    }

    pub fn reservations_sum(&self) -> Decimal {
        self.reservations.values().fold(Decimal::ZERO, |acc, v| acc + *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u64) -> OrderId {
        OrderId::new(n)
    }

    #[test]
    fn reserve_then_total_unchanged() {
        let mut b = Balance::new(Decimal::from_int(100));
        b.make_reservation(oid(1), Decimal::from_int(40)).unwrap();
        assert_eq!(b.free().to_f64(), 60.0);
        assert_eq!(b.reserved().to_f64(), 40.0);
        assert_eq!(b.total().to_f64(), 100.0);
    }

    #[test]
    fn over_reserve_rejected() {
        let mut b = Balance::new(Decimal::from_int(10));
        let err = b.make_reservation(oid(1), Decimal::from_int(11));
        assert!(err.is_err());
    }

    #[test]
    fn free_reservation_partial() {
        let mut b = Balance::new(Decimal::from_int(100));
        b.make_reservation(oid(1), Decimal::from_int(40)).unwrap();
        b.free_reservation(oid(1), Some(Decimal::from_int(15))).unwrap();
        assert_eq!(b.free().to_f64(), 75.0);
        assert_eq!(b.reserved().to_f64(), 25.0);
        assert_eq!(b.reservation(oid(1)).unwrap().to_f64(), 25.0);
    }

    #[test]
    fn free_reservation_over_amount_rejected() {
        let mut b = Balance::new(Decimal::from_int(100));
        b.make_reservation(oid(1), Decimal::from_int(10)).unwrap();
        assert!(b.free_reservation(oid(1), Some(Decimal::from_int(11))).is_err());
    }

    #[test]
    fn void_reservation_does_not_return_to_free() {
        let mut b = Balance::new(Decimal::from_int(100));
        b.make_reservation(oid(1), Decimal::from_int(40)).unwrap();
        b.void_reservation(oid(1), Decimal::from_int(40));
        assert_eq!(b.free().to_f64(), 60.0);
        assert_eq!(b.reserved().to_f64(), 0.0);
        assert_eq!(b.total().to_f64(), 60.0);
    }

    #[test]
    fn negative_deposit_exceeding_free_rejected() {
        let mut b = Balance::new(Decimal::from_int(10));
        assert!(b.deposit(Decimal::from_int(-11)).is_err());
        assert!(b.deposit(Decimal::from_int(-10)).is_ok());
        assert_eq!(b.free().to_f64(), 0.0);
    }

    #[test]
    fn try_free_reservation_never_errors() {
        let mut b = Balance::new(Decimal::from_int(10));
        assert_eq!(b.try_free_reservation(oid(99), None).to_f64(), 0.0);
    }
}
