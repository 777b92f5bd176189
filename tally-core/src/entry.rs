//! Entries: dated journal records grouping postings that balance to zero

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use chrono::NaiveDate;

use crate::posting::PostingRef;

/// Shared entry reference
pub type EntryRef = Rc<RefCell<Entry>>;

/// Clearing state of an entry (or of a single posting override)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryState {
    /// No marker
    #[default]
    Uncleared,
    /// "!" marker
    Pending,
    /// "*" marker
    Cleared,
}

bitflags! {
    /// Entry provenance flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// Synthesised during a report; owned by the report's scratch data
        const TEMP      = 0x01;
        /// Produced by the engine rather than read from a file
        const GENERATED = 0x02;
    }
}

/// A dated journal record
#[derive(Debug)]
pub struct Entry {
    /// Stable identity
    pub id: usize,
    /// Primary date
    pub date: NaiveDate,
    /// Optional effective date ("date=edate" in the journal)
    pub effective_date: Option<NaiveDate>,
    /// Optional code ("(code)" in the header)
    pub code: Option<String>,
    /// Payee / description
    pub payee: String,
    /// Clearing state
    pub state: EntryState,
    /// Trailing note
    pub note: Option<String>,
    /// Postings in declaration order
    pub postings: Vec<PostingRef>,
    /// Provenance flags
    pub flags: EntryFlags,
}

impl Entry {
    /// Create an empty entry
    pub fn new(id: usize, date: NaiveDate, payee: impl Into<String>) -> Self {
        Self {
            id,
            date,
            effective_date: None,
            code: None,
            payee: payee.into(),
            state: EntryState::default(),
            note: None,
            postings: Vec::new(),
            flags: EntryFlags::empty(),
        }
    }

    /// The effective date, falling back to the primary date
    pub fn effective(&self) -> NaiveDate {
        self.effective_date.unwrap_or(self.date)
    }

    /// Whether this entry was synthesised during a report
    pub fn is_temp(&self) -> bool {
        self.flags.contains(EntryFlags::TEMP)
    }
}
