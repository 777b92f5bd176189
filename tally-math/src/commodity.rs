//! Commodity definitions and the commodity pool
//!
//! A commodity is a unit of measure carried by amounts: a currency, a stock
//! symbol, a weight. Commodities are created lazily by the pool on first
//! reference and shared by `Arc`; display style (precision, symbol
//! placement, separators) is learned from the amounts observed during
//! parsing. The pool also records dated prices, which back market-value
//! conversion for reports.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::NaiveDate;

use crate::amount::Amount;

/// Reference-counted commodity for sharing between amounts
pub type CommodityRef = Arc<Commodity>;

/// Handle to the session-owned commodity pool
pub type PoolRef = Rc<std::cell::RefCell<CommodityPool>>;

bitflags! {
    /// Display style flags for a commodity
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommodityFlags: u8 {
        /// Symbol follows the quantity ("10.00 USD" rather than "$10.00")
        const STYLE_SUFFIXED  = 0x01;
        /// A space separates symbol and quantity
        const STYLE_SEPARATED = 0x02;
        /// Integer part is grouped with thousands separators
        const STYLE_THOUSANDS = 0x04;
        /// European style: "." groups thousands, "," marks decimals
        const STYLE_EUROPEAN  = 0x08;
        /// No market price should ever be recorded for this commodity
        const NOMARKET        = 0x10;
    }
}

/// Lot annotation attached to a commodity occurrence: price, date, tag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotation {
    /// Per-unit lot price ("{...}")
    pub price: Option<Amount>,
    /// Lot date ("[...]")
    pub date: Option<NaiveDate>,
    /// Lot tag ("(...)")
    pub tag: Option<String>,
}

impl Annotation {
    /// Whether no detail is set
    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.date.is_none() && self.tag.is_none()
    }
}

/// A unit of measure carried by amounts
///
/// Display precision and style are interior-mutable because they are
/// learned incrementally while parsing; the reporting core only reads them.
#[derive(Debug)]
pub struct Commodity {
    symbol: String,
    precision: Cell<u16>,
    flags: Cell<CommodityFlags>,
    annotation: Annotation,
}

impl Commodity {
    /// Create a new commodity with the given symbol
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            precision: Cell::new(0),
            flags: Cell::new(CommodityFlags::empty()),
            annotation: Annotation::default(),
        }
    }

    /// Create an annotated copy of a base commodity
    pub fn with_annotation(base: &Commodity, annotation: Annotation) -> Self {
        Self {
            symbol: base.symbol.clone(),
            precision: Cell::new(base.precision.get()),
            flags: Cell::new(base.flags.get()),
            annotation,
        }
    }

    /// The symbol of this commodity
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Display precision (number of decimal places)
    pub fn precision(&self) -> u16 {
        self.precision.get()
    }

    /// Display style flags
    pub fn flags(&self) -> CommodityFlags {
        self.flags.get()
    }

    /// The lot annotation, if any
    pub fn annotation(&self) -> &Annotation {
        &self.annotation
    }

    /// Whether this commodity carries lot details
    pub fn is_annotated(&self) -> bool {
        !self.annotation.is_empty()
    }

    /// Record an observed occurrence: widen precision, adopt style flags
    pub fn observe(&self, precision: u16, flags: CommodityFlags) {
        if precision > self.precision.get() {
            self.precision.set(precision);
        }
        self.flags.set(self.flags.get() | flags);
    }
}

impl PartialEq for Commodity {
    fn eq(&self, other: &Self) -> bool {
        self.symbol == other.symbol && self.annotation == other.annotation
    }
}

impl Eq for Commodity {}

impl fmt::Display for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

/// One dated price observation for a commodity
#[derive(Debug, Clone)]
pub struct PricePoint {
    /// Effective date of the quote
    pub date: NaiveDate,
    /// Per-unit price, in the quote commodity
    pub price: Amount,
}

/// Registry of commodities and their price histories
///
/// Owned by the session and passed around as an explicit handle. Lookup is
/// append-only while a report runs; entries live until the session ends.
#[derive(Debug, Default)]
pub struct CommodityPool {
    commodities: HashMap<String, CommodityRef>,
    prices: HashMap<String, Vec<PricePoint>>,
}

impl CommodityPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a commodity, creating it on first reference
    pub fn find_or_create(&mut self, symbol: &str) -> CommodityRef {
        if let Some(commodity) = self.commodities.get(symbol) {
            commodity.clone()
        } else {
            let commodity = Arc::new(Commodity::new(symbol));
            self.commodities.insert(symbol.to_string(), commodity.clone());
            commodity
        }
    }

    /// Find an existing commodity by symbol
    pub fn find(&self, symbol: &str) -> Option<CommodityRef> {
        self.commodities.get(symbol).cloned()
    }

    /// All known commodities, in symbol order
    pub fn commodities(&self) -> Vec<CommodityRef> {
        let mut all: Vec<_> = self.commodities.values().cloned().collect();
        all.sort_by(|a, b| a.symbol().cmp(b.symbol()));
        all
    }

    /// Record a dated price for a commodity, keeping the history sorted
    pub fn record_price(&mut self, symbol: &str, date: NaiveDate, price: Amount) {
        let history = self.prices.entry(symbol.to_string()).or_default();
        let pos = history.partition_point(|p| p.date <= date);
        history.insert(pos, PricePoint { date, price });
    }

    /// The most recent price at or before `date`
    pub fn price_at(&self, symbol: &str, date: NaiveDate) -> Option<&PricePoint> {
        let history = self.prices.get(symbol)?;
        history.iter().rev().find(|p| p.date <= date)
    }

    /// Market value of an amount at a date
    ///
    /// Multiplies the quantity by the latest known price; amounts with no
    /// commodity or no recorded price are returned unchanged.
    pub fn market_value(&self, amount: &Amount, date: NaiveDate) -> Amount {
        let Some(commodity) = amount.commodity() else {
            return amount.clone();
        };
        match self.price_at(commodity.symbol(), date) {
            Some(point) => amount.value_in(&point.price),
            None => amount.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn pool_creates_lazily_and_shares() {
        let mut pool = CommodityPool::new();
        let a = pool.find_or_create("USD");
        let b = pool.find_or_create("USD");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pool.find("EUR").is_none());
    }

    #[test]
    fn precision_only_widens() {
        let usd = Commodity::new("USD");
        usd.observe(2, CommodityFlags::STYLE_SUFFIXED);
        usd.observe(0, CommodityFlags::empty());
        assert_eq!(usd.precision(), 2);
        assert!(usd.flags().contains(CommodityFlags::STYLE_SUFFIXED));
    }

    #[test]
    fn price_lookup_picks_latest_before_date() {
        let mut pool = CommodityPool::new();
        let usd = pool.find_or_create("USD");
        pool.record_price("STK", date(2009, 1, 1), Amount::from_i64(10).with_commodity(usd.clone()));
        pool.record_price("STK", date(2009, 2, 1), Amount::from_i64(12).with_commodity(usd));

        assert_eq!(pool.price_at("STK", date(2009, 1, 15)).unwrap().date, date(2009, 1, 1));
        assert_eq!(pool.price_at("STK", date(2009, 3, 1)).unwrap().date, date(2009, 2, 1));
        assert!(pool.price_at("STK", date(2008, 12, 31)).is_none());
    }
}
