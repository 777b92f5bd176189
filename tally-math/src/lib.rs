//! Arbitrary precision mathematical operations for tally
//!
//! This crate provides the numeric foundation of the accounting engine:
//! exact `BigRational` amounts annotated with commodities, the commodity
//! pool with its price history, and multi-commodity balances.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod amount;
pub mod balance;
pub mod commodity;

pub use amount::{Amount, AmountError, AmountResult, Precision};
pub use balance::Balance;
pub use commodity::{
    Annotation, Commodity, CommodityFlags, CommodityPool, CommodityRef, PoolRef, PricePoint,
};

pub use num_bigint::BigInt;
pub use num_rational::BigRational;
