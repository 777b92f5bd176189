//! Hierarchical account structure
//!
//! Accounts form a tree rooted at the session's master account. Children
//! are kept in a `BTreeMap` keyed by name, which doubles as declaration
//! order for the basic tree walk. Per-report totals do NOT live here; they
//! are held in the report's side table keyed by the account id.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use bitflags::bitflags;

/// Shared account reference
pub type AccountRef = Rc<RefCell<Account>>;
/// Weak parent reference, breaking the ownership cycle
pub type WeakAccountRef = Weak<RefCell<Account>>;

bitflags! {
    /// Account state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccountFlags: u8 {
        /// Declared or referenced by the journal
        const KNOWN = 0x01;
        /// Synthesised for one report; pruned by clean_accounts
        const TEMP  = 0x02;
    }
}

/// A node in the account tree
#[derive(Debug)]
pub struct Account {
    /// Leaf name (without the path)
    pub name: String,
    /// Parent account; `None` only for the master root
    pub parent: Option<WeakAccountRef>,
    /// Child accounts in name order
    pub children: BTreeMap<String, AccountRef>,
    /// Distance from the root (the root itself is 0)
    pub depth: usize,
    /// Stable identity, the key into per-report account data
    pub id: usize,
    /// State flags
    pub flags: AccountFlags,
}

impl Account {
    /// Create an account under the given parent
    pub fn new(name: impl Into<String>, parent: Option<WeakAccountRef>, id: usize) -> Self {
        let depth = parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|p| p.borrow().depth + 1)
            .unwrap_or(0);
        Self {
            name: name.into(),
            parent,
            children: BTreeMap::new(),
            depth,
            id,
            flags: AccountFlags::empty(),
        }
    }

    /// Create the master root account
    pub fn new_root(id: usize) -> AccountRef {
        Rc::new(RefCell::new(Self::new("", None, id)))
    }

    /// The ":"-joined path from the root (the root contributes nothing)
    pub fn fullname(&self) -> String {
        let mut segments = vec![self.name.clone()];
        let mut parent = self.parent.clone();
        while let Some(p) = parent.and_then(|w| w.upgrade()) {
            let p = p.borrow();
            if !p.name.is_empty() {
                segments.push(p.name.clone());
            }
            parent = p.parent.clone();
        }
        segments.reverse();
        segments.join(":")
    }

    /// Whether this account was synthesised for a report
    pub fn is_temp(&self) -> bool {
        self.flags.contains(AccountFlags::TEMP)
    }
}

/// Find a child path under `root`, creating missing accounts
///
/// `alloc_id` supplies identities for newly created nodes; `flags` marks
/// them (journal accounts KNOWN, report accounts TEMP).
pub fn find_or_create(
    root: &AccountRef,
    path: &str,
    alloc_id: &mut dyn FnMut() -> usize,
    flags: AccountFlags,
) -> AccountRef {
    let mut current = root.clone();
    for segment in path.split(':') {
        let existing = current.borrow().children.get(segment).cloned();
        let next = match existing {
            Some(child) => child,
            None => {
                let child = Rc::new(RefCell::new(Account::new(
                    segment,
                    Some(Rc::downgrade(&current)),
                    alloc_id(),
                )));
                child.borrow_mut().flags |= flags;
                current.borrow_mut().children.insert(segment.to_string(), child.clone());
                child
            }
        };
        current = next;
    }
    current
}

/// Remove TEMP children recursively, restoring the pre-report tree
pub fn prune_temp(root: &AccountRef) {
    let mut keep = BTreeMap::new();
    for (name, child) in std::mem::take(&mut root.borrow_mut().children) {
        if child.borrow().is_temp() {
            continue;
        }
        prune_temp(&child);
        keep.insert(name, child);
    }
    root.borrow_mut().children = keep;
}

/// Visit the tree in preorder, declaration (name) order
pub fn walk_preorder(root: &AccountRef, visit: &mut dyn FnMut(&AccountRef)) {
    visit(root);
    let children: Vec<_> = root.borrow().children.values().cloned().collect();
    for child in children {
        walk_preorder(&child, visit);
    }
}
