//! Amounts: exact rational quantities annotated with a commodity
//!
//! Amounts are immutable values. Arithmetic produces new amounts and is
//! checked: adding or subtracting across commodities is an error rather
//! than a silent merge (multi-commodity sums belong in [`crate::Balance`]).
//! Quantities are `BigRational`, so division never loses precision; the
//! display precision merely controls rounding at render time.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Neg;

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{Signed, Zero};
use thiserror::Error;

use crate::commodity::{CommodityFlags, CommodityRef};

/// Number of decimal places tracked for display
pub type Precision = u16;

/// Errors that can occur during amount operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    /// Addition or subtraction across different commodities
    #[error("cannot combine amounts with different commodities ({0} and {1})")]
    CommodityMismatch(String, String),
    /// Division by an exactly-zero amount
    #[error("division by zero")]
    DivisionByZero,
    /// Unparsable quantity text
    #[error("cannot parse amount from '{0}'")]
    Parse(String),
}

/// Result type for amount operations
pub type AmountResult<T> = Result<T, AmountError>;

/// An exact signed quantity with an optional commodity
#[derive(Debug, Clone)]
pub struct Amount {
    quantity: BigRational,
    commodity: Option<CommodityRef>,
    precision: Precision,
}

impl Amount {
    /// Create an amount from its parts
    pub fn new(quantity: BigRational, commodity: Option<CommodityRef>, precision: Precision) -> Self {
        Self { quantity, commodity, precision }
    }

    /// The zero amount with no commodity
    pub fn zero() -> Self {
        Self { quantity: BigRational::zero(), commodity: None, precision: 0 }
    }

    /// An integral amount with no commodity
    pub fn from_i64(value: i64) -> Self {
        Self {
            quantity: BigRational::from_integer(BigInt::from(value)),
            commodity: None,
            precision: 0,
        }
    }

    /// Attach a commodity, keeping quantity and precision
    pub fn with_commodity(mut self, commodity: CommodityRef) -> Self {
        self.commodity = Some(commodity);
        self
    }

    /// Parse a bare decimal quantity (no commodity, no separators)
    pub fn parse_quantity(text: &str) -> AmountResult<Self> {
        let trimmed = text.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::Parse(text.to_string()));
        }
        let joined: String = int_part.chars().chain(frac_part.chars()).collect();
        if joined.is_empty() || !joined.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Parse(text.to_string()));
        }
        let mut numerator: BigInt =
            joined.parse().map_err(|_| AmountError::Parse(text.to_string()))?;
        if negative {
            numerator = -numerator;
        }
        let denominator = num_traits::pow(BigInt::from(10), frac_part.len());
        Ok(Self {
            quantity: BigRational::new(numerator, denominator),
            commodity: None,
            precision: frac_part.len() as Precision,
        })
    }

    /// The exact quantity
    pub fn quantity(&self) -> &BigRational {
        &self.quantity
    }

    /// The commodity, if any
    pub fn commodity(&self) -> Option<&CommodityRef> {
        self.commodity.as_ref()
    }

    /// Symbol of the commodity, or "" for bare quantities
    pub fn symbol(&self) -> &str {
        self.commodity.as_ref().map(|c| c.symbol()).unwrap_or("")
    }

    /// Own display precision (ignoring the commodity's learned precision)
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Precision used when rendering: the wider of ours and the commodity's
    pub fn display_precision(&self) -> Precision {
        match &self.commodity {
            Some(c) => self.precision.max(c.precision()),
            None => self.precision,
        }
    }

    /// Whether the quantity is exactly zero
    pub fn is_zero(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Sign of the quantity: -1, 0 or 1
    pub fn sign(&self) -> i32 {
        if self.quantity.is_zero() {
            0
        } else if self.quantity.is_positive() {
            1
        } else {
            -1
        }
    }

    /// Absolute value
    pub fn abs(&self) -> Self {
        Self {
            quantity: self.quantity.abs(),
            commodity: self.commodity.clone(),
            precision: self.precision,
        }
    }

    /// Negated copy
    pub fn negated(&self) -> Self {
        Self {
            quantity: self.quantity.clone().neg(),
            commodity: self.commodity.clone(),
            precision: self.precision,
        }
    }

    /// Whether the two amounts carry the same commodity
    pub fn same_commodity(&self, other: &Amount) -> bool {
        self.symbol() == other.symbol()
    }

    /// Truncating integer view of the quantity
    pub fn to_i64(&self) -> Option<i64> {
        use num_traits::ToPrimitive;
        self.quantity.to_integer().to_i64()
    }

    /// Checked addition: commodities must match (bare absorbs either way)
    pub fn checked_add(&self, other: &Amount) -> AmountResult<Amount> {
        let commodity = self.combine_commodity(other)?;
        Ok(Self {
            quantity: &self.quantity + &other.quantity,
            commodity,
            precision: self.precision.max(other.precision),
        })
    }

    /// Checked subtraction, same commodity rules as addition
    pub fn checked_sub(&self, other: &Amount) -> AmountResult<Amount> {
        self.checked_add(&other.negated())
    }

    /// Multiply quantities; the left commodity wins, per-unit style
    pub fn multiplied_by(&self, other: &Amount) -> Amount {
        Self {
            quantity: &self.quantity * &other.quantity,
            commodity: self.commodity.clone().or_else(|| other.commodity.clone()),
            precision: self.precision.max(other.precision),
        }
    }

    /// Divide quantities; errors on a zero divisor
    pub fn divided_by(&self, other: &Amount) -> AmountResult<Amount> {
        if other.quantity.is_zero() {
            return Err(AmountError::DivisionByZero);
        }
        Ok(Self {
            quantity: &self.quantity / &other.quantity,
            commodity: self.commodity.clone(),
            precision: self.precision.max(other.precision),
        })
    }

    /// Re-express this quantity at a per-unit price: 2 STK at 10 USD = 20 USD
    pub fn value_in(&self, unit_price: &Amount) -> Amount {
        Self {
            quantity: &self.quantity * &unit_price.quantity,
            commodity: unit_price.commodity.clone(),
            precision: unit_price.display_precision(),
        }
    }

    /// A copy without lot annotations, sharing the base commodity
    pub fn stripped(&self, base: Option<CommodityRef>) -> Amount {
        match (&self.commodity, base) {
            (Some(c), Some(b)) if c.is_annotated() => Self {
                quantity: self.quantity.clone(),
                commodity: Some(b),
                precision: self.precision,
            },
            _ => self.clone(),
        }
    }

    fn combine_commodity(&self, other: &Amount) -> AmountResult<Option<CommodityRef>> {
        match (&self.commodity, &other.commodity) {
            (Some(a), Some(b)) => {
                if a.symbol() == b.symbol() {
                    Ok(Some(a.clone()))
                } else {
                    Err(AmountError::CommodityMismatch(
                        a.symbol().to_string(),
                        b.symbol().to_string(),
                    ))
                }
            }
            (Some(a), None) => Ok(Some(a.clone())),
            (None, Some(b)) => Ok(Some(b.clone())),
            (None, None) => Ok(None),
        }
    }

    /// Render just the quantity at a given precision, honouring style flags
    pub fn format_quantity(&self, precision: Precision, flags: CommodityFlags) -> String {
        let european = flags.contains(CommodityFlags::STYLE_EUROPEAN);
        let thousands = flags.contains(CommodityFlags::STYLE_THOUSANDS);
        let decimal_point = if european { ',' } else { '.' };
        let group_mark = if european { '.' } else { ',' };

        let negative = self.quantity.is_negative();
        let scale = num_traits::pow(BigInt::from(10), precision as usize);
        let scaled = (self.quantity.abs() * BigRational::from_integer(scale)).round();
        let digits = scaled.to_integer().to_string();

        let (int_digits, frac_digits) = if precision == 0 {
            (digits.as_str(), "")
        } else if digits.len() <= precision as usize {
            ("", digits.as_str())
        } else {
            digits.split_at(digits.len() - precision as usize)
        };

        let mut out = String::new();
        if negative && !scaled.is_zero() {
            out.push('-');
        }
        let int_digits = if int_digits.is_empty() { "0" } else { int_digits };
        if thousands {
            let bytes = int_digits.as_bytes();
            for (i, b) in bytes.iter().enumerate() {
                if i > 0 && (bytes.len() - i) % 3 == 0 {
                    out.push(group_mark);
                }
                out.push(*b as char);
            }
        } else {
            out.push_str(int_digits);
        }
        if precision > 0 {
            out.push(decimal_point);
            for _ in frac_digits.len()..precision as usize {
                out.push('0');
            }
            out.push_str(frac_digits);
        }
        out
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.commodity {
            None => write!(f, "{}", self.format_quantity(self.precision, CommodityFlags::empty())),
            Some(c) => {
                let quantity = self.format_quantity(self.display_precision(), c.flags());
                let sep = if c.flags().contains(CommodityFlags::STYLE_SEPARATED) { " " } else { "" };
                if c.flags().contains(CommodityFlags::STYLE_SUFFIXED) {
                    write!(f, "{}{}{}", quantity, sep, c.symbol())
                } else {
                    write!(f, "{}{}{}", c.symbol(), sep, quantity)
                }
            }
        }
    }
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        self.symbol() == other.symbol() && self.quantity == other.quantity
    }
}

impl Eq for Amount {}

impl PartialOrd for Amount {
    /// Ordering within one commodity; bare quantities compare numerically
    /// against anything
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.same_commodity(other)
            || self.commodity.is_none()
            || other.commodity.is_none()
            || self.is_zero()
            || other.is_zero()
        {
            self.quantity.partial_cmp(&other.quantity)
        } else {
            None
        }
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        self.negated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commodity::CommodityPool;

    fn usd_pool() -> (CommodityPool, CommodityRef) {
        let mut pool = CommodityPool::new();
        let usd = pool.find_or_create("USD");
        usd.observe(2, CommodityFlags::STYLE_SUFFIXED | CommodityFlags::STYLE_SEPARATED);
        (pool, usd)
    }

    #[test]
    fn parse_and_display_suffixed() {
        let (_pool, usd) = usd_pool();
        let amount = Amount::parse_quantity("10").unwrap().with_commodity(usd);
        assert_eq!(amount.to_string(), "10.00 USD");
    }

    #[test]
    fn parse_negative_fraction() {
        let amount = Amount::parse_quantity("-0.75").unwrap();
        assert_eq!(amount.sign(), -1);
        assert_eq!(amount.to_string(), "-0.75");
    }

    #[test]
    fn addition_requires_matching_commodity() {
        let (mut pool, usd) = usd_pool();
        let eur = pool.find_or_create("EUR");
        let a = Amount::from_i64(1).with_commodity(usd);
        let b = Amount::from_i64(2).with_commodity(eur);
        assert!(matches!(a.checked_add(&b), Err(AmountError::CommodityMismatch(_, _))));
    }

    #[test]
    fn sum_of_entry_legs_is_zero() {
        let (_pool, usd) = usd_pool();
        let a = Amount::parse_quantity("10.00").unwrap().with_commodity(usd.clone());
        let b = Amount::parse_quantity("-10.00").unwrap().with_commodity(usd);
        assert!(a.checked_add(&b).unwrap().is_zero());
    }

    #[test]
    fn value_in_converts_at_unit_price() {
        let (mut pool, usd) = usd_pool();
        let stk = pool.find_or_create("STK");
        let shares = Amount::from_i64(2).with_commodity(stk);
        let price = Amount::parse_quantity("10.50").unwrap().with_commodity(usd);
        let value = shares.value_in(&price);
        assert_eq!(value.to_string(), "21.00 USD");
    }

    #[test]
    fn thousands_grouping() {
        let amount = Amount::parse_quantity("1234567.8").unwrap();
        assert_eq!(
            amount.format_quantity(2, CommodityFlags::STYLE_THOUSANDS),
            "1,234,567.80"
        );
    }

    #[test]
    fn european_style() {
        let amount = Amount::parse_quantity("-1234.5").unwrap();
        assert_eq!(
            amount.format_quantity(
                2,
                CommodityFlags::STYLE_THOUSANDS | CommodityFlags::STYLE_EUROPEAN
            ),
            "-1.234,50"
        );
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        let amount = Amount::parse_quantity("2.345").unwrap();
        assert_eq!(amount.format_quantity(2, CommodityFlags::empty()), "2.35");
        let amount = Amount::parse_quantity("-2.345").unwrap();
        assert_eq!(amount.format_quantity(2, CommodityFlags::empty()), "-2.35");
    }
}
