//! The journal: entries, the master account tree, the commodity pool handle

use std::rc::Rc;

use thiserror::Error;

use tally_math::{Balance, PoolRef};

use crate::account::{self, AccountFlags, AccountRef, Account};
use crate::entry::EntryRef;

/// Errors raised while assembling a journal
#[derive(Error, Debug)]
pub enum JournalError {
    /// An entry's balancing postings do not sum to zero per commodity
    #[error("entry '{payee}' does not balance (off by {residue})")]
    Unbalanced {
        /// Payee of the offending entry
        payee: String,
        /// Per-commodity remainder, rendered
        residue: String,
    },
}

/// All parsed entries plus the account tree and commodity pool handle
///
/// The journal is read-only while a report runs; the only sanctioned
/// mutation afterwards is pruning the TEMP accounts a report hung under
/// the master root.
pub struct Journal {
    /// Root of the account tree
    pub master: AccountRef,
    /// Entries in declaration order
    pub entries: Vec<EntryRef>,
    /// Session commodity pool
    pub pool: PoolRef,
    next_entry_id: usize,
    next_posting_id: usize,
    next_account_id: usize,
}

impl Journal {
    /// Create an empty journal sharing the session pool
    pub fn new(pool: PoolRef) -> Self {
        Self {
            master: Account::new_root(0),
            entries: Vec::new(),
            pool,
            next_entry_id: 0,
            next_posting_id: 0,
            next_account_id: 1,
        }
    }

    /// Allocate the next entry identity
    pub fn alloc_entry_id(&mut self) -> usize {
        let id = self.next_entry_id;
        self.next_entry_id += 1;
        id
    }

    /// Allocate the next posting identity
    pub fn alloc_posting_id(&mut self) -> usize {
        let id = self.next_posting_id;
        self.next_posting_id += 1;
        id
    }

    /// Find an account by full name, creating missing path segments
    pub fn find_account(&mut self, path: &str) -> AccountRef {
        let next_account_id = &mut self.next_account_id;
        let mut alloc = || {
            let id = *next_account_id;
            *next_account_id += 1;
            id
        };
        account::find_or_create(&self.master, path, &mut alloc, AccountFlags::KNOWN)
    }

    /// Find an existing account without creating it
    pub fn find_account_only(&self, path: &str) -> Option<AccountRef> {
        let mut current = self.master.clone();
        for segment in path.split(':') {
            let child = current.borrow().children.get(segment).cloned()?;
            current = child;
        }
        Some(current)
    }

    /// Verify the zero-sum invariant and append the entry
    pub fn add_entry(&mut self, entry: EntryRef) -> Result<(), JournalError> {
        let mut residue = Balance::new();
        for post in entry.borrow().postings.iter().filter(|p| p.must_balance()) {
            residue.add_amount(&post.balancing_amount());
        }
        if !residue.is_zero() {
            return Err(JournalError::Unbalanced {
                payee: entry.borrow().payee.clone(),
                residue: residue.to_string(),
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Watermarks for report-scratch id allocation: (posting, account)
    pub fn id_watermarks(&self) -> (usize, usize) {
        (self.next_posting_id, self.next_account_id)
    }

    /// Distinct commodity symbols observed on postings, sorted
    pub fn commodities(&self) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for entry in &self.entries {
            for post in &entry.borrow().postings {
                let symbol = post.amount.symbol();
                if !symbol.is_empty() && !symbols.iter().any(|s| s == symbol) {
                    symbols.push(symbol.to_string());
                }
            }
        }
        symbols.sort();
        symbols
    }

    /// Prune the TEMP accounts a report created under the master root
    pub fn clean_accounts(&self) {
        account::prune_temp(&self.master);
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("entries", &self.entries.len()).finish()
    }
}

/// Convenience alias used by reports, which share the journal read-only
pub type JournalRef = Rc<Journal>;
