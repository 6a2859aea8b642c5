//! Fixed-decimal arithmetic for money and size.
//!
//! All monetary and size quantities in the engine are represented as
//! [`Decimal`], a scaled `i128` mantissa. Floating point is never used in
//! the matching/clearing core; `f64` only appears at serialization
//! boundaries (JSON logs, wire payloads) via [`Decimal::to_f64`] /
//! [`Decimal::from_f64`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Number of decimal places [`Decimal`] values carry internally, independent
/// of any particular currency's display precision. Matches the fixed
/// exponent used throughout `taosim`'s `decimal_t` so conversions between
/// differently-rounded quantities never lose precision before an explicit
/// [`Decimal::round`] call.
pub const SCALE: u32 = 18;

const SCALE_FACTOR: i128 = 1_000_000_000_000_000_000;

/// A fixed-point decimal number backed by a 128-bit mantissa at [`SCALE`]
/// decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Decimal(i128);

impl Decimal {
    pub const ZERO: Decimal = Decimal(0);
    pub const ONE: Decimal = Decimal(SCALE_FACTOR);

    /// Constructs a `Decimal` from an integer number of whole units.
    pub const fn from_int(units: i64) -> Self {
        Decimal(units as i128 * SCALE_FACTOR)
    }

    /// Constructs a `Decimal` directly from its scaled mantissa.
    pub const fn from_mantissa(mantissa: i128) -> Self {
        Decimal(mantissa)
    }

    pub const fn mantissa(self) -> i128 {
        self.0
    }

    /// Lossy conversion from `f64`, used only at log/JSON boundaries.
    pub fn from_f64(value: f64) -> Self {
        Decimal((value * SCALE_FACTOR as f64).round() as i128)
    }

    /// Lossy conversion to `f64`, used only at log/JSON boundaries.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE_FACTOR as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Decimal(self.0.abs())
    }

    pub fn min(self, other: Self) -> Self {
        if self.0 <= other.0 { self } else { other }
    }

    pub fn max(self, other: Self) -> Self {
        if self.0 >= other.0 { self } else { other }
    }

    /// Rounds half-away-from-zero to `decimals` places.
    pub fn round(self, decimals: u32) -> Self {
        round_mantissa(self.0, decimals, RoundMode::Nearest)
    }

    /// Rounds up (away from zero for positive values, toward zero for
    /// negative ones is *not* how `taosim::util::roundUp` behaves — it
    /// always rounds toward positive infinity) to `decimals` places.
    pub fn round_up(self, decimals: u32) -> Self {
        round_mantissa(self.0, decimals, RoundMode::Up)
    }

    /// Packs the value into a `u64` payload at the given number of decimal
    /// places, for compact wire/log encoding. Panics if the scaled value
    /// does not fit in 64 bits.
    pub fn pack(self, decimals: u32) -> u64 {
        let scaled = rescale(self.0, decimals);
        u64::try_from(scaled).expect("decimal value out of u64 packing range")
    }

    /// Inverse of [`Decimal::pack`].
    pub fn unpack(payload: u64, decimals: u32) -> Self {
        let factor = pow10(SCALE.saturating_sub(decimals));
        Decimal(payload as i128 * factor)
    }

    /// `10^(-decimals)`, the smallest representable increment at that
    /// precision — used to clamp a rounded-to-zero price back to a
    /// positive tick per spec §4.1 step 2b.
    pub fn smallest_unit(decimals: u32) -> Self {
        Decimal(pow10(SCALE.saturating_sub(decimals)))
    }

    /// `self * (1 + other)`, used pervasively for `totalVolume = volume *
    /// (1 + leverage)` and loan-amount scaling.
    pub fn mul_1p(self, other: Self) -> Self {
        self * (Decimal::ONE + other)
    }

    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        if rhs.0 == 0 {
            None
        } else {
            let numerator = self.0.checked_mul(SCALE_FACTOR)?;
            Some(Decimal(numerator / rhs.0))
        }
    }
}

#[derive(Clone, Copy)]
enum RoundMode {
    Nearest,
    Up,
}

fn pow10(exp: u32) -> i128 {
    10i128.pow(exp)
}

fn rescale(mantissa: i128, decimals: u32) -> i128 {
    let factor = pow10(SCALE.saturating_sub(decimals));
    mantissa / factor
}

fn round_mantissa(mantissa: i128, decimals: u32, mode: RoundMode) -> Decimal {
    if decimals >= SCALE {
        return Decimal(mantissa);
    }
    let factor = pow10(SCALE - decimals);
    let truncated = mantissa / factor;
    let remainder = mantissa % factor;
    let rounded = match mode {
        RoundMode::Nearest => {
            if remainder.abs() * 2 >= factor {
                truncated + remainder.signum()
            } else {
                truncated
            }
        }
        RoundMode::Up => {
            if remainder > 0 {
                truncated + 1
            } else {
                truncated
            }
        }
    };
    Decimal(rounded * factor)
}

impl Default for Decimal {
    fn default() -> Self {
        Decimal::ZERO
    }
}

impl Add for Decimal {
    type Output = Decimal;
    fn add(self, rhs: Self) -> Self::Output {
        Decimal(self.0 + rhs.0)
    }
}

impl Sub for Decimal {
    type Output = Decimal;
    fn sub(self, rhs: Self) -> Self::Output {
        Decimal(self.0 - rhs.0)
    }
}

impl Neg for Decimal {
    type Output = Decimal;
    fn neg(self) -> Self::Output {
        Decimal(-self.0)
    }
}

impl AddAssign for Decimal {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Decimal {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Decimal {
    type Output = Decimal;
    fn mul(self, rhs: Self) -> Self::Output {
        Decimal((self.0 * rhs.0) / SCALE_FACTOR)
    }
}

impl Div for Decimal {
    type Output = Decimal;
    fn div(self, rhs: Self) -> Self::Output {
        self.checked_div(rhs).expect("division by zero decimal")
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

impl From<i64> for Decimal {
    fn from(value: i64) -> Self {
        Decimal::from_int(value)
    }
}
