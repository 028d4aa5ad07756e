//! Scaled-integer values used for every physical quantity read from the meter.
//!
//! A [`Fixed<SCALE>`] stores a signed 32-bit magnitude with `SCALE` implied
//! decimal digits, so `Fixed::<2>::from_raw(23012)` is `230.12`. Arithmetic and
//! comparison never leave the integer domain.
//!
//! The module also carries the fixed-width ASCII codec used by telemetry lines:
//! [`Fixed::write_field`] renders a value right-justified into a [`Field`], and
//! the [`FromStr`] implementation parses the decimal form back.
//!
//! Rounding rule: when a value is rendered with fewer decimals than its scale it
//! is rounded half away from zero (`1.25` -> `1.3`, `-1.25` -> `-1.3`). A value
//! that does not fit its field saturates to all nines (`99.9`, `-99`).

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

const fn pow10(exp: u8) -> i64 {
    let mut value = 1i64;
    let mut i = 0;
    while i < exp {
        value *= 10;
        i += 1;
    }
    value
}

/// Divides `value` by `divisor`, rounding half away from zero.
fn div_round(value: i64, divisor: i64) -> i64 {
    let quotient = value / divisor;
    let remainder = value % divisor;
    if remainder.abs() * 2 >= divisor {
        quotient + value.signum()
    } else {
        quotient
    }
}

/// A signed fixed-point number with `SCALE` implied decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed<const SCALE: u8>(i32);

/// Phase voltage, 0.01 V resolution.
pub type Volts = Fixed<2>;
/// Phase current, 0.001 A resolution.
pub type Amps = Fixed<3>;
/// Active power, 0.01 W resolution.
pub type Watts = Fixed<2>;
/// Grid frequency, 0.01 Hz resolution.
pub type Hertz = Fixed<2>;
/// Cumulative energy, 0.001 kWh (1 Wh) resolution.
pub type KilowattHours = Fixed<3>;

impl<const SCALE: u8> Fixed<SCALE> {
    /// Magnitude reserved for "not currently known".
    pub const UNKNOWN: Self = Self(i32::MIN);
    pub const ZERO: Self = Self(0);
    /// `10^SCALE`, the raw value of `1`.
    pub const FACTOR: i64 = pow10(SCALE);

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Builds a value from an unsigned raw reading, saturating at `i32::MAX`.
    pub fn from_reading(raw: u32) -> Self {
        Self(i32::try_from(raw).unwrap_or(i32::MAX))
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn scale(self) -> u8 {
        SCALE
    }

    pub const fn is_known(self) -> bool {
        self.0 != i32::MIN
    }

    /// Converts to another scale, rounding half away from zero when precision is dropped.
    pub fn rescale<const TO: u8>(self) -> Fixed<TO> {
        if !self.is_known() {
            return Fixed::<TO>::UNKNOWN;
        }
        let raw = self.0 as i64;
        let scaled = if TO >= SCALE {
            raw.saturating_mul(pow10(TO - SCALE))
        } else {
            div_round(raw, pow10(SCALE - TO))
        };
        Fixed::<TO>(clamp_known(scaled))
    }

    /// Renders the value into a fixed-width field.
    ///
    /// Unknown values fill the field with `-`.
    pub fn write_field<W: fmt::Write>(self, out: &mut W, field: Field) -> fmt::Result {
        if !self.is_known() {
            return write_repeated(out, '-', field.width);
        }
        let raw = self.0 as i64;
        let shown = if field.decimals >= SCALE {
            raw * pow10(field.decimals - SCALE)
        } else {
            div_round(raw, pow10(SCALE - field.decimals))
        };
        let negative = shown < 0;
        let magnitude = shown.unsigned_abs();
        let divisor = pow10(field.decimals) as u64;
        let digits = if field.decimals == 0 {
            magnitude.to_string()
        } else {
            format!(
                "{}.{:0width$}",
                magnitude / divisor,
                magnitude % divisor,
                width = field.decimals as usize
            )
        };
        let sign = usize::from(negative);
        if digits.len() + sign > field.width {
            return write_saturated(out, field, negative);
        }
        let padding = field.width - digits.len() - sign;
        match field.pad {
            Pad::Space => {
                write_repeated(out, ' ', padding)?;
                if negative {
                    out.write_char('-')?;
                }
            }
            Pad::Zero => {
                if negative {
                    out.write_char('-')?;
                }
                write_repeated(out, '0', padding)?;
            }
        }
        out.write_str(&digits)
    }

    /// Convenience wrapper around [`Fixed::write_field`].
    pub fn render(self, field: Field) -> String {
        let mut out = String::with_capacity(field.width);
        // Writing into a String cannot fail.
        let _ = self.write_field(&mut out, field);
        out
    }
}

fn clamp_known(value: i64) -> i32 {
    value.clamp(i32::MIN as i64 + 1, i32::MAX as i64) as i32
}

fn write_repeated<W: fmt::Write>(out: &mut W, ch: char, count: usize) -> fmt::Result {
    for _ in 0..count {
        out.write_char(ch)?;
    }
    Ok(())
}

fn write_saturated<W: fmt::Write>(out: &mut W, field: Field, negative: bool) -> fmt::Result {
    let mut room = field.width;
    if negative && room > 1 {
        out.write_char('-')?;
        room -= 1;
    }
    let decimals = field.decimals as usize;
    if decimals > 0 && room > decimals + 1 {
        write_repeated(out, '9', room - decimals - 1)?;
        out.write_char('.')?;
        write_repeated(out, '9', decimals)
    } else {
        write_repeated(out, '9', room)
    }
}

impl<const SCALE: u8> Default for Fixed<SCALE> {
    fn default() -> Self {
        Self::ZERO
    }
}

impl<const SCALE: u8> Add for Fixed<SCALE> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        if !self.is_known() || !rhs.is_known() {
            return Self::UNKNOWN;
        }
        Self(clamp_known(self.0 as i64 + rhs.0 as i64))
    }
}

impl<const SCALE: u8> Sub for Fixed<SCALE> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        if !self.is_known() || !rhs.is_known() {
            return Self::UNKNOWN;
        }
        Self(clamp_known(self.0 as i64 - rhs.0 as i64))
    }
}

impl<const SCALE: u8> fmt::Display for Fixed<SCALE> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_known() {
            return f.write_str("-");
        }
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = (self.0 as i64).unsigned_abs();
        if SCALE == 0 {
            write!(f, "{sign}{magnitude}")
        } else {
            let divisor = Self::FACTOR as u64;
            write!(
                f,
                "{sign}{}.{:0width$}",
                magnitude / divisor,
                magnitude % divisor,
                width = SCALE as usize
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFixedError {
    #[error("'{0}' is not a decimal number")]
    Syntax(String),
    #[error("'{0}' has more than {1} decimal digits")]
    Precision(String, u8),
    #[error("'{0}' is out of range")]
    Range(String),
}

impl<const SCALE: u8> FromStr for Fixed<SCALE> {
    type Err = ParseFixedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (negative, unsigned) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if int_part.is_empty() || !all_digits(int_part) || !all_digits(frac_part) {
            return Err(ParseFixedError::Syntax(s.to_string()));
        }
        if frac_part.len() > SCALE as usize {
            return Err(ParseFixedError::Precision(s.to_string(), SCALE));
        }
        let int_value: i64 = int_part
            .parse()
            .map_err(|_| ParseFixedError::Range(s.to_string()))?;
        let frac_value: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse::<i64>().unwrap_or(0) * pow10(SCALE - frac_part.len() as u8)
        };
        let magnitude = int_value
            .checked_mul(Self::FACTOR)
            .and_then(|v| v.checked_add(frac_value))
            .ok_or_else(|| ParseFixedError::Range(s.to_string()))?;
        let value = if negative { -magnitude } else { magnitude };
        if value <= i32::MIN as i64 || value > i32::MAX as i64 {
            return Err(ParseFixedError::Range(s.to_string()));
        }
        Ok(Self(value as i32))
    }
}

/// Padding used to fill a field to its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pad {
    Space,
    Zero,
}

/// Layout of one numeric placeholder in a telemetry line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub width: usize,
    pub decimals: u8,
    pub pad: Pad,
}

impl Field {
    pub const fn new(width: usize, decimals: u8) -> Self {
        Self {
            width,
            decimals,
            pad: Pad::Space,
        }
    }

    pub const fn zero_padded(width: usize, decimals: u8) -> Self {
        Self {
            width,
            decimals,
            pad: Pad::Zero,
        }
    }
}
