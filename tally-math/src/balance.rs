//! Multi-commodity balances
//!
//! A balance is the running-total carrier of the reporting core: it absorbs
//! amounts of any commodity, keeping one slot per symbol. Slots are held in
//! a `BTreeMap` so iteration and display order are deterministic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;

use crate::amount::Amount;
use crate::commodity::CommodityPool;

/// A mapping commodity → amount; the sum of arbitrarily many amounts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Balance {
    amounts: BTreeMap<String, Amount>,
}

impl Balance {
    /// Create an empty (zero) balance
    pub fn new() -> Self {
        Self::default()
    }

    /// A balance holding a single amount
    pub fn from_amount(amount: &Amount) -> Self {
        let mut balance = Self::new();
        balance.add_amount(amount);
        balance
    }

    /// Whether no commodity slot is non-zero
    pub fn is_zero(&self) -> bool {
        self.amounts.values().all(Amount::is_zero)
    }

    /// Whether the balance holds no slots at all
    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    /// Number of commodity slots
    pub fn commodity_count(&self) -> usize {
        self.amounts.len()
    }

    /// Add an amount into its commodity's slot
    pub fn add_amount(&mut self, amount: &Amount) {
        let slot = self.amounts.entry(amount.symbol().to_string());
        match slot {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                // same symbol by construction, cannot mismatch
                let sum = entry.get().checked_add(amount).expect("same-commodity add");
                entry.insert(sum);
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(amount.clone());
            }
        }
        self.amounts.retain(|_, a| !a.is_zero());
    }

    /// Subtract an amount from its commodity's slot
    pub fn sub_amount(&mut self, amount: &Amount) {
        self.add_amount(&amount.negated());
    }

    /// Add another balance slot-wise
    pub fn add_balance(&mut self, other: &Balance) {
        for amount in other.amounts.values() {
            self.add_amount(amount);
        }
    }

    /// Subtract another balance slot-wise
    pub fn sub_balance(&mut self, other: &Balance) {
        for amount in other.amounts.values() {
            self.sub_amount(amount);
        }
    }

    /// Negated copy
    pub fn negated(&self) -> Balance {
        let mut out = Balance::new();
        for amount in self.amounts.values() {
            out.add_amount(&amount.negated());
        }
        out
    }

    /// The single amount, when exactly one slot exists
    pub fn single_amount(&self) -> Option<&Amount> {
        if self.amounts.len() == 1 {
            self.amounts.values().next()
        } else {
            None
        }
    }

    /// The amount held for one commodity symbol
    pub fn amount_for(&self, symbol: &str) -> Option<&Amount> {
        self.amounts.get(symbol)
    }

    /// Iterate amounts in symbol order
    pub fn amounts(&self) -> impl Iterator<Item = &Amount> {
        self.amounts.values()
    }

    /// Re-express every slot at its market price on `date`
    ///
    /// Slots whose commodity has no recorded price pass through unchanged;
    /// converted slots merge into the price commodity's slot.
    pub fn market_value(&self, pool: &CommodityPool, date: NaiveDate) -> Balance {
        let mut out = Balance::new();
        for amount in self.amounts.values() {
            out.add_amount(&pool.market_value(amount, date));
        }
        out
    }
}

impl fmt::Display for Balance {
    /// Slots joined by ", "; the empty balance prints as "0"
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.amounts.is_empty() {
            return write!(f, "0");
        }
        for (i, amount) in self.amounts.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", amount)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commodity::{CommodityFlags, CommodityPool};

    fn pool() -> CommodityPool {
        let mut pool = CommodityPool::new();
        for symbol in ["USD", "EUR"] {
            let c = pool.find_or_create(symbol);
            c.observe(2, CommodityFlags::STYLE_SUFFIXED | CommodityFlags::STYLE_SEPARATED);
        }
        pool
    }

    fn amount(pool: &mut CommodityPool, text: &str, symbol: &str) -> Amount {
        let commodity = pool.find_or_create(symbol);
        Amount::parse_quantity(text).unwrap().with_commodity(commodity)
    }

    #[test]
    fn absorbs_multiple_commodities() {
        let mut pool = pool();
        let mut balance = Balance::new();
        balance.add_amount(&amount(&mut pool, "10", "USD"));
        balance.add_amount(&amount(&mut pool, "5", "EUR"));
        assert_eq!(balance.commodity_count(), 2);
        assert_eq!(balance.to_string(), "5.00 EUR, 10.00 USD");
    }

    #[test]
    fn cancelling_slots_vanish() {
        let mut pool = pool();
        let mut balance = Balance::new();
        balance.add_amount(&amount(&mut pool, "10", "USD"));
        balance.add_amount(&amount(&mut pool, "-10", "USD"));
        assert!(balance.is_zero());
        assert!(balance.is_empty());
        assert_eq!(balance.to_string(), "0");
    }

    #[test]
    fn negation_mirrors_every_slot() {
        let mut pool = pool();
        let mut balance = Balance::new();
        balance.add_amount(&amount(&mut pool, "10", "USD"));
        balance.add_amount(&amount(&mut pool, "-4", "EUR"));
        let negated = balance.negated();
        assert_eq!(negated.amount_for("USD").unwrap().sign(), -1);
        assert_eq!(negated.amount_for("EUR").unwrap().sign(), 1);
    }
}
