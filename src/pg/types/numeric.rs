//! Arbitrary precision `numeric`.
//!
//! Values are kept in the server's own representation: base-10000 digit
//! groups, a weight (exponent of the first group) and a display scale, so text
//! and binary forms convert without any floating point step.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::pg::error::{PgError, PgResult};

const NBASE: i16 = 10000;
const DEC_DIGITS: usize = 4;

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

/// Server limits: 131072 digits before the point, 16383 after.
const MAX_INT_DIGITS: i64 = 131_072;
const MAX_DSCALE: i64 = 0x3FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericSign {
    Positive,
    Negative,
    NaN,
    PositiveInfinity,
    NegativeInfinity,
}

/// An exact decimal number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Numeric {
    sign: NumericSign,
    weight: i16,
    dscale: u16,
    digits: Vec<i16>,
}

impl Numeric {
    pub fn zero() -> Self {
        Numeric {
            sign: NumericSign::Positive,
            weight: 0,
            dscale: 0,
            digits: Vec::new(),
        }
    }

    pub fn nan() -> Self {
        Numeric {
            sign: NumericSign::NaN,
            ..Numeric::zero()
        }
    }

    pub fn sign(&self) -> NumericSign {
        self.sign
    }

    /// Number of digits after the decimal point.
    pub fn scale(&self) -> u16 {
        self.dscale
    }

    pub fn is_nan(&self) -> bool {
        self.sign == NumericSign::NaN
    }

    pub fn is_zero(&self) -> bool {
        self.digits.is_empty() && self.is_finite()
    }

    pub fn is_finite(&self) -> bool {
        matches!(self.sign, NumericSign::Positive | NumericSign::Negative)
    }

    /// Lossy conversion for display or arithmetic outside the driver.
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    fn digit(&self, index: i32) -> i16 {
        if index < 0 {
            return 0;
        }
        self.digits.get(index as usize).copied().unwrap_or(0)
    }

    /// Drop zero groups at both ends, shifting the weight for leading ones.
    fn normalize(mut self) -> Self {
        let leading = self.digits.iter().take_while(|d| **d == 0).count();
        if leading == self.digits.len() {
            self.digits.clear();
            self.weight = 0;
            if self.sign == NumericSign::Negative {
                self.sign = NumericSign::Positive;
            }
            return self;
        }
        self.digits.drain(..leading);
        self.weight -= leading as i16;
        while self.digits.last() == Some(&0) {
            self.digits.pop();
        }
        self
    }

    // ========================================================================
    // Binary format
    // ========================================================================

    /// Write the binary wire form.
    pub fn encode_binary(&self, buf: &mut BytesMut) {
        let sign = match self.sign {
            NumericSign::Positive => SIGN_POS,
            NumericSign::Negative => SIGN_NEG,
            NumericSign::NaN => SIGN_NAN,
            NumericSign::PositiveInfinity => SIGN_PINF,
            NumericSign::NegativeInfinity => SIGN_NINF,
        };
        buf.put_i16(self.digits.len() as i16);
        buf.put_i16(self.weight);
        buf.put_u16(sign);
        buf.put_u16(self.dscale);
        for digit in &self.digits {
            buf.put_i16(*digit);
        }
    }

    /// Parse the binary wire form.
    pub fn decode_binary(data: &[u8]) -> PgResult<Self> {
        if data.len() < 8 {
            return Err(PgError::decode(format!(
                "invalid NUMERIC length: {}",
                data.len()
            )));
        }
        let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
        let ndigits = word(0) as i16;
        let weight = word(2) as i16;
        let sign = match word(4) {
            SIGN_POS => NumericSign::Positive,
            SIGN_NEG => NumericSign::Negative,
            SIGN_NAN => NumericSign::NaN,
            SIGN_PINF => NumericSign::PositiveInfinity,
            SIGN_NINF => NumericSign::NegativeInfinity,
            other => {
                return Err(PgError::decode(format!(
                    "invalid NUMERIC sign: 0x{:04x}",
                    other
                )))
            }
        };
        let dscale = word(6);
        if ndigits < 0 || data.len() != 8 + 2 * ndigits as usize {
            return Err(PgError::decode(format!(
                "NUMERIC declares {} digits in {} bytes",
                ndigits,
                data.len()
            )));
        }
        let mut digits = Vec::with_capacity(ndigits as usize);
        for i in 0..ndigits as usize {
            let digit = word(8 + 2 * i) as i16;
            if !(0..NBASE).contains(&digit) {
                return Err(PgError::decode(format!("invalid NUMERIC digit: {}", digit)));
            }
            digits.push(digit);
        }
        if !matches!(sign, NumericSign::Positive | NumericSign::Negative) {
            return Ok(Numeric {
                sign,
                ..Numeric::zero()
            });
        }
        Ok(Numeric {
            sign,
            weight,
            dscale,
            digits,
        }
        .normalize())
    }
}

impl Default for Numeric {
    fn default() -> Self {
        Numeric::zero()
    }
}

// ============================================================================
// Text format
// ============================================================================

impl FromStr for Numeric {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        let s = s.trim();
        let invalid = || PgError::programming(format!("invalid numeric literal: {:?}", s));

        match s.to_ascii_lowercase().as_str() {
            "nan" => return Ok(Numeric::nan()),
            "infinity" | "+infinity" | "inf" | "+inf" => {
                return Ok(Numeric {
                    sign: NumericSign::PositiveInfinity,
                    ..Numeric::zero()
                })
            }
            "-infinity" | "-inf" => {
                return Ok(Numeric {
                    sign: NumericSign::NegativeInfinity,
                    ..Numeric::zero()
                })
            }
            _ => {}
        }

        let (negative, unsigned) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
            Some(pos) => {
                let exp: i64 = unsigned[pos + 1..].parse().map_err(|_| invalid())?;
                (&unsigned[..pos], exp)
            }
            None => (unsigned, 0),
        };
        let (int_part, frac_part) = match mantissa.find('.') {
            Some(pos) => (&mantissa[..pos], &mantissa[pos + 1..]),
            None => (mantissa, ""),
        };
        let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(invalid());
        }

        let out_of_range =
            || PgError::programming(format!("numeric literal out of range: {:?}", s));
        let dscale = (frac_part.len() as i64)
            .checked_sub(exponent)
            .ok_or_else(out_of_range)?
            .max(0);
        let point = (int_part.len() as i64)
            .checked_add(exponent)
            .ok_or_else(out_of_range)?;
        if dscale > MAX_DSCALE || point > MAX_INT_DIGITS || point < -MAX_DSCALE {
            return Err(out_of_range());
        }

        // Shift the decimal point by the exponent.
        let combined: String = [int_part, frac_part].concat();
        let (int_digits, frac_digits) = if point <= 0 {
            (String::new(), "0".repeat((-point) as usize) + &combined)
        } else if point as usize >= combined.len() {
            let pad = "0".repeat(point as usize - combined.len());
            (combined + &pad, String::new())
        } else {
            let (i, f) = combined.split_at(point as usize);
            (i.to_string(), f.to_string())
        };

        let int_digits = int_digits.trim_start_matches('0');
        let mut digits = Vec::new();
        let lead = (DEC_DIGITS - int_digits.len() % DEC_DIGITS) % DEC_DIGITS;
        let padded_int = "0".repeat(lead) + int_digits;
        for chunk in padded_int.as_bytes().chunks(DEC_DIGITS) {
            digits.push(group_value(chunk));
        }
        let weight = i16::try_from(digits.len() as i64 - 1).map_err(|_| out_of_range())?;

        let trail = (DEC_DIGITS - frac_digits.len() % DEC_DIGITS) % DEC_DIGITS;
        let padded_frac = frac_digits + &"0".repeat(trail);
        for chunk in padded_frac.as_bytes().chunks(DEC_DIGITS) {
            digits.push(group_value(chunk));
        }

        Ok(Numeric {
            sign: if negative {
                NumericSign::Negative
            } else {
                NumericSign::Positive
            },
            weight,
            dscale: dscale as u16,
            digits,
        }
        .normalize())
    }
}

fn group_value(chunk: &[u8]) -> i16 {
    chunk
        .iter()
        .fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16)
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sign {
            NumericSign::NaN => return f.write_str("NaN"),
            NumericSign::PositiveInfinity => return f.write_str("Infinity"),
            NumericSign::NegativeInfinity => return f.write_str("-Infinity"),
            NumericSign::Negative if !self.digits.is_empty() => f.write_str("-")?,
            _ => {}
        }

        let weight = self.weight as i32;
        if weight < 0 {
            f.write_str("0")?;
        } else {
            write!(f, "{}", self.digit(0))?;
            for i in 1..=weight {
                write!(f, "{:04}", self.digit(i))?;
            }
        }

        if self.dscale > 0 {
            let groups = (self.dscale as usize).div_ceil(DEC_DIGITS);
            let mut frac = String::with_capacity(groups * DEC_DIGITS);
            for e in 1..=groups as i32 {
                frac.push_str(&format!("{:04}", self.digit(weight + e)));
            }
            frac.truncate(self.dscale as usize);
            write!(f, ".{}", frac)?;
        }
        Ok(())
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        let mut n = v.unsigned_abs();
        let mut groups = Vec::new();
        while n > 0 {
            groups.push((n % NBASE as u64) as i16);
            n /= NBASE as u64;
        }
        groups.reverse();
        Numeric {
            sign: if v < 0 {
                NumericSign::Negative
            } else {
                NumericSign::Positive
            },
            weight: groups.len() as i16 - 1,
            dscale: 0,
            digits: groups,
        }
        .normalize()
    }
}

impl TryFrom<f64> for Numeric {
    type Error = PgError;

    /// Converts through the shortest decimal form that round-trips the float.
    fn try_from(v: f64) -> PgResult<Self> {
        if v.is_nan() {
            return Ok(Numeric::nan());
        }
        format!("{}", v).parse()
    }
}
