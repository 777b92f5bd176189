//! Postings: one leg of an entry
//!
//! Postings are immutable once the journal is finalised; every piece of
//! per-report state hangs off the report's side table instead, keyed by
//! the posting id. Stages that need a variant of a posting (inverted,
//! re-payeed, anonymised) synthesise a new one rather than mutate.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use chrono::NaiveDate;
use tally_math::Amount;

use crate::account::AccountRef;
use crate::entry::{Entry, EntryRef, EntryState};

/// Shared posting reference
pub type PostingRef = Rc<Posting>;

bitflags! {
    /// Posting flags, mirroring the journal syntax that produced them
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PostingFlags: u16 {
        /// Account written in (parens); excluded from balancing
        const VIRTUAL         = 0x0001;
        /// Account written in [brackets]; virtual but must balance
        const MUST_BALANCE    = 0x0002;
        /// Amount was derived rather than written
        const CALCULATED      = 0x0004;
        /// Cost was derived from an "@" unit price
        const COST_CALCULATED = 0x0008;
        /// Synthesised during a report
        const TEMP            = 0x0010;
        /// Identity was scrubbed by the anonymiser
        const ANONYMIZED      = 0x0020;
    }
}

/// One leg of an entry: an account, an amount, an optional cost
#[derive(Debug)]
pub struct Posting {
    /// Stable identity, the key into per-report posting data
    pub id: usize,
    /// Owning entry
    pub entry: Weak<RefCell<Entry>>,
    /// The account this leg touches
    pub account: AccountRef,
    /// Posted amount
    pub amount: Amount,
    /// Total cost in another commodity (signed like the amount)
    pub cost: Option<Amount>,
    /// Clearing state override; `None` inherits the entry's state
    pub state: Option<EntryState>,
    /// Per-posting effective date override
    pub effective_date: Option<NaiveDate>,
    /// Trailing note
    pub note: Option<String>,
    /// Flags
    pub flags: PostingFlags,
}

impl Posting {
    /// Create a posting; the caller wires it into its entry
    pub fn new(id: usize, entry: &EntryRef, account: AccountRef, amount: Amount) -> Self {
        Self {
            id,
            entry: Rc::downgrade(entry),
            account,
            amount,
            cost: None,
            state: None,
            effective_date: None,
            note: None,
            flags: PostingFlags::empty(),
        }
    }

    /// The owning entry; postings never outlive their entry
    pub fn entry(&self) -> EntryRef {
        self.entry.upgrade().expect("posting outlives its entry")
    }

    /// Reporting date: the entry's primary date
    pub fn date(&self) -> NaiveDate {
        self.entry().borrow().date
    }

    /// Effective date: posting override, else entry effective, else date
    pub fn effective_date(&self) -> NaiveDate {
        match self.effective_date {
            Some(date) => date,
            None => self.entry().borrow().effective(),
        }
    }

    /// Clearing state, inheriting from the entry when not overridden
    pub fn state(&self) -> EntryState {
        self.state.unwrap_or_else(|| self.entry().borrow().state)
    }

    /// The payee seen by reports (the entry's)
    pub fn payee(&self) -> String {
        self.entry().borrow().payee.clone()
    }

    /// The entry's code, if any
    pub fn code(&self) -> Option<String> {
        self.entry().borrow().code.clone()
    }

    /// Full name of the posting's account
    pub fn account_name(&self) -> String {
        self.account.borrow().fullname()
    }

    /// Whether this leg participates in entry balancing
    pub fn must_balance(&self) -> bool {
        !self.flags.contains(PostingFlags::VIRTUAL)
            || self.flags.contains(PostingFlags::MUST_BALANCE)
    }

    /// Whether the account was written in (parens)
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(PostingFlags::VIRTUAL)
    }

    /// The amount this leg contributes to the entry balance: cost if priced
    pub fn balancing_amount(&self) -> Amount {
        self.cost.clone().unwrap_or_else(|| self.amount.clone())
    }
}
