//! Report configuration, scratch data, drivers and the lookup scope
//!
//! A `Report` owns everything one report run needs: the option set built
//! from the command line, the journal (read-only), and the side table of
//! per-posting/per-account scratch state. The drivers at the bottom feed
//! the posting stream through a handler chain built by [`crate::chain`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use bitflags::bitflags;
use chrono::NaiveDate;
use log::debug;
use smallvec::SmallVec;
use thiserror::Error;

use tally_math::{Amount, AmountError, Balance, PoolRef};

use crate::account::{self, AccountFlags, AccountRef};
use crate::chain;
use crate::datetime::{self, Period, PeriodError};
use crate::entry::{Entry, EntryFlags, EntryRef, EntryState};
use crate::expr::{self, eval, parse, Expr, ExprError, Predicate, Scope, Value};
use crate::filters::{AccountHandler, HandlerBox, SetAccountValue};
use crate::journal::JournalRef;
use crate::posting::{Posting, PostingFlags, PostingRef};

/// Errors that abort a report
#[derive(Error, Debug)]
pub enum ReportError {
    /// Bad options: unknown names, conflicts, unparsable periods
    #[error("{0}")]
    Config(String),
    /// A value expression failed to parse or evaluate
    #[error(transparent)]
    Expr(#[from] ExprError),
    /// Period text did not parse
    #[error(transparent)]
    Period(#[from] PeriodError),
    /// No unique subset of postings reaches the target balance
    #[error("cannot reconcile to {target} as of {cutoff}: {reason}")]
    Reconcile {
        /// The requested balance
        target: String,
        /// The cutoff date in effect
        cutoff: NaiveDate,
        /// Why the search failed
        reason: String,
    },
    /// Amount arithmetic failure
    #[error(transparent)]
    Amount(#[from] AmountError),
    /// Downstream write failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Per-posting scratch flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XdataFlags: u8 {
        /// Seen by the related-postings stage
        const RECEIVED  = 0x01;
        /// Already forwarded by the related-postings stage
        const HANDLED   = 0x02;
        /// Passed a filter predicate
        const MATCHES   = 0x04;
        /// Printed by a formatter
        const DISPLAYED = 0x08;
        /// Carries component postings
        const COMPOUND  = 0x10;
    }
}

bitflags! {
    /// Per-account scratch flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccountXdataFlags: u8 {
        /// Some posting reached this account (or a descendant)
        const VISITED   = 0x01;
        /// Matched the display predicate
        const MATCHING  = 0x02;
        /// Printed by a formatter
        const DISPLAYED = 0x04;
    }
}

/// Scratch state hung off a posting for the duration of one report
#[derive(Debug)]
pub struct PostXdata {
    /// Computed display amount (the amount expression's value)
    pub value: Option<Value>,
    /// Running total after this posting
    pub total: Balance,
    /// 1-based position in the calculated stream
    pub count: usize,
    /// Postings that contributed to a synthesised posting's value
    pub components: SmallVec<[PostingRef; 2]>,
    /// Reported account override (anonymiser)
    pub account: Option<AccountRef>,
    /// Flags
    pub flags: XdataFlags,
}

impl Default for PostXdata {
    fn default() -> Self {
        Self {
            value: None,
            total: Balance::new(),
            count: 0,
            components: SmallVec::new(),
            account: None,
            flags: XdataFlags::empty(),
        }
    }
}

/// Scratch state hung off an account for the duration of one report
#[derive(Debug)]
pub struct AccountXdata {
    /// Value accumulated from this account's own postings
    pub value: Balance,
    /// Subtree total: value plus every descendant's total
    pub total: Balance,
    /// Number of postings accumulated here
    pub count: usize,
    /// Flags
    pub flags: AccountXdataFlags,
}

impl Default for AccountXdata {
    fn default() -> Self {
        Self {
            value: Balance::new(),
            total: Balance::new(),
            count: 0,
            flags: AccountXdataFlags::empty(),
        }
    }
}

/// The report's side table: posting/account scratch plus synthesised temps
///
/// Keyed by the stable ids on postings and accounts, so the journal itself
/// stays untouched. Dropped wholesale when the report completes.
#[derive(Debug, Default)]
pub struct ReportData {
    posts: HashMap<usize, PostXdata>,
    accounts: HashMap<usize, AccountXdata>,
    temp_entries: Vec<EntryRef>,
    next_posting_id: usize,
    next_account_id: usize,
    next_entry_id: usize,
}

impl ReportData {
    /// Create scratch storage whose temp ids continue the journal's
    pub fn new(journal: &crate::journal::Journal) -> Self {
        let (next_posting_id, next_account_id) = journal.id_watermarks();
        Self {
            next_posting_id,
            next_account_id,
            next_entry_id: usize::MAX / 2,
            ..Self::default()
        }
    }

    /// Scratch for a posting, if any was created
    pub fn post(&self, id: usize) -> Option<&PostXdata> {
        self.posts.get(&id)
    }

    /// Scratch for a posting, created on demand
    pub fn post_mut(&mut self, id: usize) -> &mut PostXdata {
        self.posts.entry(id).or_default()
    }

    /// Scratch for an account, if any was created
    pub fn account(&self, id: usize) -> Option<&AccountXdata> {
        self.accounts.get(&id)
    }

    /// Scratch for an account, created on demand
    pub fn account_mut(&mut self, id: usize) -> &mut AccountXdata {
        self.accounts.entry(id).or_default()
    }

    /// The display value of a posting: computed value, else its amount
    pub fn value_of(&self, post: &PostingRef) -> Value {
        self.post(post.id)
            .and_then(|x| x.value.clone())
            .unwrap_or_else(|| Value::Amount(post.amount.clone()))
    }

    /// The running total recorded for a posting
    pub fn total_of(&self, post: &PostingRef) -> Balance {
        self.post(post.id).map(|x| x.total.clone()).unwrap_or_default()
    }

    /// The account a posting reports under (anonymiser may override)
    pub fn reported_account(&self, post: &PostingRef) -> AccountRef {
        self.post(post.id)
            .and_then(|x| x.account.clone())
            .unwrap_or_else(|| post.account.clone())
    }

    /// Synthesise a temp entry, kept alive until the report completes
    pub fn new_entry(&mut self, date: NaiveDate, payee: impl Into<String>) -> EntryRef {
        let id = self.next_entry_id;
        self.next_entry_id += 1;
        let mut entry = Entry::new(id, date, payee);
        entry.flags |= EntryFlags::TEMP | EntryFlags::GENERATED;
        let entry = Rc::new(RefCell::new(entry));
        self.temp_entries.push(entry.clone());
        entry
    }

    /// Synthesise a temp entry echoing a posting's entry, payee replaced
    pub fn entry_like(&mut self, post: &PostingRef, payee: impl Into<String>) -> EntryRef {
        let source = post.entry();
        let entry = self.new_entry(source.borrow().date, payee);
        {
            let source = source.borrow();
            let mut e = entry.borrow_mut();
            e.effective_date = source.effective_date;
            e.code = source.code.clone();
            e.state = source.state;
        }
        entry
    }

    /// Synthesise a temp posting attached to a temp entry
    pub fn add_posting(
        &mut self,
        entry: &EntryRef,
        account: AccountRef,
        amount: Amount,
        cost: Option<Amount>,
        extra: PostingFlags,
    ) -> PostingRef {
        let id = self.next_posting_id;
        self.next_posting_id += 1;
        let mut posting = Posting::new(id, entry, account, amount);
        posting.cost = cost;
        posting.flags |= PostingFlags::TEMP | PostingFlags::CALCULATED | extra;
        let posting = Rc::new(posting);
        entry.borrow_mut().postings.push(posting.clone());
        posting
    }

    /// Synthesise a detached variant of a posting with another amount
    ///
    /// The copy keeps the original entry backlink but is not listed among
    /// the entry's postings; the journal stays untouched.
    pub fn copy_with_amount(
        &mut self,
        post: &PostingRef,
        amount: Amount,
        cost: Option<Amount>,
    ) -> PostingRef {
        let id = self.next_posting_id;
        self.next_posting_id += 1;
        Rc::new(Posting {
            id,
            entry: post.entry.clone(),
            account: post.account.clone(),
            amount,
            cost,
            state: post.state,
            effective_date: post.effective_date,
            note: post.note.clone(),
            flags: post.flags | PostingFlags::TEMP | PostingFlags::CALCULATED,
        })
    }

    /// Find or create a TEMP account under the given root
    pub fn temp_account(&mut self, root: &AccountRef, path: &str) -> AccountRef {
        let next = &mut self.next_account_id;
        let mut alloc = || {
            let id = *next;
            *next += 1;
            id
        };
        account::find_or_create(root, path, &mut alloc, AccountFlags::TEMP)
    }

    /// Drop all scratch state and temps
    pub fn clear(&mut self) {
        self.posts.clear();
        self.accounts.clear();
        self.temp_entries.clear();
    }
}

/// Shared handle to the report scratch data
pub type ReportDataRef = Rc<RefCell<ReportData>>;

/// Everything a stage needs to evaluate expressions against a posting
#[derive(Clone)]
pub struct EvalContext {
    /// Report scratch data
    pub data: ReportDataRef,
    /// Commodity pool (market prices)
    pub pool: PoolRef,
    /// The report's "today"
    pub today: NaiveDate,
    /// Output date format
    pub date_format: String,
}

impl EvalContext {
    /// Scope for evaluating expressions against one posting
    pub fn post_scope<'a>(&'a self, post: &'a PostingRef) -> PostScope<'a> {
        PostScope { ctx: self, post }
    }

    /// Scope for evaluating expressions against one account
    pub fn account_scope<'a>(&'a self, account: &'a AccountRef) -> AccountScope<'a> {
        AccountScope { ctx: self, account }
    }
}

/// Evaluation scope around a posting
pub struct PostScope<'a> {
    ctx: &'a EvalContext,
    post: &'a PostingRef,
}

impl Scope for PostScope<'_> {
    fn resolve(&self, name: &str) -> Result<Value, ExprError> {
        let post = self.post;
        let data = self.ctx.data.borrow();
        match name {
            "amount" | "a" => Ok(Value::Amount(post.amount.clone())),
            "cost" | "b" => Ok(Value::Amount(post.balancing_amount())),
            "t" => Ok(data.value_of(post)),
            "total" | "T" => Ok(Value::Balance(data.total_of(post))),
            "v" => Ok(Value::Amount(
                self.ctx.pool.borrow().market_value(&post.amount, post.date()),
            )),
            "V" => Ok(Value::Balance(
                data.total_of(post).market_value(&self.ctx.pool.borrow(), post.date()),
            )),
            "price" | "i" => {
                let pool = self.ctx.pool.borrow();
                let price = pool
                    .price_at(post.amount.symbol(), post.date())
                    .map(|p| p.price.clone())
                    .unwrap_or_else(Amount::zero);
                Ok(Value::Amount(price))
            }
            "date" | "d" => Ok(Value::Date(post.date())),
            "effective_date" => Ok(Value::Date(post.effective_date())),
            "account" => Ok(Value::String(data.reported_account(post).borrow().fullname())),
            "payee" | "p" => Ok(Value::String(post.payee())),
            "code" => Ok(Value::String(post.code().unwrap_or_default())),
            "note" => Ok(Value::String(post.note.clone().unwrap_or_default())),
            "cleared" | "X" => Ok(Value::Bool(post.state() == EntryState::Cleared)),
            "pending" => Ok(Value::Bool(post.state() == EntryState::Pending)),
            "uncleared" => Ok(Value::Bool(post.state() == EntryState::Uncleared)),
            "real" | "R" => Ok(Value::Bool(!post.is_virtual())),
            "virtual" => Ok(Value::Bool(post.is_virtual())),
            "depth" | "l" => Ok(Value::Int(post.account.borrow().depth as i64)),
            "count" | "n" => {
                Ok(Value::Int(data.post(post.id).map(|x| x.count).unwrap_or(0) as i64))
            }
            "today" | "m" => Ok(Value::Date(self.ctx.today)),
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(ExprError::UnknownIdentifier(name.to_string())),
        }
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<Value, ExprError> {
        match (name, args) {
            ("market", [value]) => {
                let pool = self.ctx.pool.borrow();
                let date = self.post.date();
                match value {
                    Value::Amount(a) => Ok(Value::Amount(pool.market_value(a, date))),
                    Value::Balance(b) => Ok(Value::Balance(b.market_value(&pool, date))),
                    other => Err(ExprError::TypeMismatch {
                        op: "market",
                        lhs: other.type_name(),
                        rhs: "amount",
                    }),
                }
            }
            ("market", [value, Value::Date(date)]) => {
                let pool = self.ctx.pool.borrow();
                match value {
                    Value::Amount(a) => Ok(Value::Amount(pool.market_value(a, *date))),
                    Value::Balance(b) => Ok(Value::Balance(b.market_value(&pool, *date))),
                    other => Err(ExprError::TypeMismatch {
                        op: "market",
                        lhs: other.type_name(),
                        rhs: "amount",
                    }),
                }
            }
            _ => Err(ExprError::UnknownFunction(name.to_string())),
        }
    }
}

/// Evaluation scope around an account
pub struct AccountScope<'a> {
    ctx: &'a EvalContext,
    account: &'a AccountRef,
}

impl Scope for AccountScope<'_> {
    fn resolve(&self, name: &str) -> Result<Value, ExprError> {
        let account = self.account.borrow();
        let data = self.ctx.data.borrow();
        let xdata = data.account(account.id);
        match name {
            "total" | "T" => {
                Ok(Value::Balance(xdata.map(|x| x.total.clone()).unwrap_or_default()))
            }
            "amount" | "a" | "t" => {
                Ok(Value::Balance(xdata.map(|x| x.value.clone()).unwrap_or_default()))
            }
            "account" => Ok(Value::String(account.fullname())),
            "depth" | "l" => Ok(Value::Int(account.depth as i64)),
            "count" | "n" => Ok(Value::Int(xdata.map(|x| x.count).unwrap_or(0) as i64)),
            "today" | "m" => Ok(Value::Date(self.ctx.today)),
            _ => Err(ExprError::UnknownIdentifier(name.to_string())),
        }
    }
}

/// Report commands reachable through the lookup scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportCommand {
    /// `balance` / `bal`
    Balance,
    /// `register` / `reg`
    Register,
    /// `print`
    Print,
    /// `equity`
    Equity,
}

/// Precommands: diagnostics that run without a journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precommand {
    /// Show the predicate the arguments produce
    Args,
    /// Parse an expression and dump the tree
    Parse,
    /// Parse a period and show its first buckets
    Period,
    /// Evaluate an expression
    Eval,
    /// Parse a format string and dump its pieces
    Format,
}

/// Option setters; aliases share a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// --amount EXPR / -t
    AmountExpr,
    /// --ansi
    Ansi,
    /// --ansi-invert
    AnsiInvert,
    /// --anon
    Anon,
    /// --base
    Base,
    /// --begin DATE / -b
    Begin,
    /// --by-payee / -P
    ByPayee,
    /// --cleared / -C
    Cleared,
    /// --code-as-payee
    CodeAsPayee,
    /// --collapse / -n
    Collapse,
    /// --comm-as-payee / -x
    CommAsPayee,
    /// --cost / -B
    Cost,
    /// --current / -c
    Current,
    /// --daily
    Daily,
    /// --date-format FMT / -y
    DateFormat,
    /// --dow
    Dow,
    /// --empty / -E
    Empty,
    /// --end DATE / -e
    End,
    /// --format FMT / -F
    Format,
    /// --head N
    Head,
    /// --input-date-format FMT
    InputDateFormat,
    /// -j (plot amounts)
    AmountData,
    /// -J (plot totals)
    TotalData,
    /// --limit EXPR / -l
    Limit,
    /// --market / -V
    Market,
    /// --monthly / -M
    Monthly,
    /// --pager CMD
    Pager,
    /// --period TEXT / -p
    PeriodOpt,
    /// --period-sort EXPR
    PeriodSort,
    /// --price / -I
    Price,
    /// --price-db FILE
    PriceDb,
    /// --quantity / -O
    Quantity,
    /// --quarterly
    Quarterly,
    /// --related / -r
    Related,
    /// --sort EXPR / -S
    Sort,
    /// --sort-all EXPR
    SortAll,
    /// --sort-entries EXPR
    SortEntries,
    /// --subtotal / -s
    Subtotal,
    /// --tail N
    Tail,
    /// --total EXPR / -T
    TotalExpr,
    /// --totals
    Totals,
    /// --uncleared / -U
    Uncleared,
    /// --weekly / -W
    Weekly,
    /// --yearly / -Y
    Yearly,
    /// Accepted and discarded (--verbose, --verify, --debug, --trace)
    Ignored,
}

/// Value accessors and formatter helpers reachable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    /// `amount_expr`
    AmountExpr,
    /// `total_expr`
    TotalExpr,
    /// `display_total`
    DisplayTotal,
    /// `display_date`
    DisplayDate,
    /// `market_value`
    MarketValue,
    /// `print_balance`
    PrintBalance,
    /// `strip`
    Strip,
    /// `truncate`
    Truncate,
}

/// What a name in the report scope resolves to
#[derive(Debug, Clone, Copy)]
pub enum Binding {
    /// A report command
    Command(ReportCommand),
    /// A precommand
    Precommand(Precommand),
    /// An option setter; the flag says whether it consumes an argument
    Option(OptionKind, bool),
    /// A value accessor or formatter helper
    Accessor(Accessor),
}

/// The option rows: name (trailing '_' means "takes an argument") → setter
///
/// A single flat table; aliases are separate rows sharing the setter, and
/// lookup is an exact match — in particular `x` matches only `x`.
pub const OPTION_TABLE: &[(&str, OptionKind)] = &[
    ("amount_", OptionKind::AmountExpr),
    ("t_", OptionKind::AmountExpr),
    ("ansi", OptionKind::Ansi),
    ("ansi-invert", OptionKind::AnsiInvert),
    ("anon", OptionKind::Anon),
    ("base", OptionKind::Base),
    ("begin_", OptionKind::Begin),
    ("b_", OptionKind::Begin),
    ("by-payee", OptionKind::ByPayee),
    ("P", OptionKind::ByPayee),
    ("cleared", OptionKind::Cleared),
    ("C", OptionKind::Cleared),
    ("code-as-payee", OptionKind::CodeAsPayee),
    ("collapse", OptionKind::Collapse),
    ("n", OptionKind::Collapse),
    ("comm-as-payee", OptionKind::CommAsPayee),
    ("x", OptionKind::CommAsPayee),
    ("cost", OptionKind::Cost),
    ("B", OptionKind::Cost),
    ("current", OptionKind::Current),
    ("c", OptionKind::Current),
    ("daily", OptionKind::Daily),
    ("date-format_", OptionKind::DateFormat),
    ("y_", OptionKind::DateFormat),
    ("dow", OptionKind::Dow),
    ("empty", OptionKind::Empty),
    ("E", OptionKind::Empty),
    ("end_", OptionKind::End),
    ("e_", OptionKind::End),
    ("format_", OptionKind::Format),
    ("F_", OptionKind::Format),
    ("head_", OptionKind::Head),
    ("input-date-format_", OptionKind::InputDateFormat),
    ("j", OptionKind::AmountData),
    ("J", OptionKind::TotalData),
    ("limit_", OptionKind::Limit),
    ("l_", OptionKind::Limit),
    ("market", OptionKind::Market),
    ("V", OptionKind::Market),
    ("monthly", OptionKind::Monthly),
    ("M", OptionKind::Monthly),
    ("pager_", OptionKind::Pager),
    ("period_", OptionKind::PeriodOpt),
    ("p_", OptionKind::PeriodOpt),
    ("period_sort_", OptionKind::PeriodSort),
    ("price", OptionKind::Price),
    ("I", OptionKind::Price),
    ("price_db_", OptionKind::PriceDb),
    ("quantity", OptionKind::Quantity),
    ("O", OptionKind::Quantity),
    ("quarterly", OptionKind::Quarterly),
    ("related", OptionKind::Related),
    ("r", OptionKind::Related),
    ("sort_", OptionKind::Sort),
    ("S_", OptionKind::Sort),
    ("sort_all_", OptionKind::SortAll),
    ("sort_entries_", OptionKind::SortEntries),
    ("subtotal", OptionKind::Subtotal),
    ("s", OptionKind::Subtotal),
    ("tail_", OptionKind::Tail),
    ("total_", OptionKind::TotalExpr),
    ("T_", OptionKind::TotalExpr),
    ("totals", OptionKind::Totals),
    ("uncleared", OptionKind::Uncleared),
    ("U", OptionKind::Uncleared),
    ("weekly", OptionKind::Weekly),
    ("W", OptionKind::Weekly),
    ("yearly", OptionKind::Yearly),
    ("Y", OptionKind::Yearly),
    ("verbose", OptionKind::Ignored),
    ("verify", OptionKind::Ignored),
    ("debug_", OptionKind::Ignored),
    ("trace_", OptionKind::Ignored),
];

/// Resolve a name the way the report scope does
///
/// Families: value accessors and helpers, `ledger_cmd_*`, `ledger_precmd_*`
/// and `opt_*`. Returns `None` for names the caller should delegate to the
/// session (user-defined names, journal identifiers).
pub fn lookup(name: &str) -> Option<Binding> {
    if let Some(option) = name.strip_prefix("opt_") {
        return OPTION_TABLE
            .iter()
            .find(|(row, _)| *row == option)
            .map(|(row, kind)| Binding::Option(*kind, row.ends_with('_')));
    }
    if let Some(command) = name.strip_prefix("ledger_cmd_") {
        let command = match command {
            "bal" | "balance" => ReportCommand::Balance,
            "reg" | "register" => ReportCommand::Register,
            "print" => ReportCommand::Print,
            "equity" => ReportCommand::Equity,
            _ => return None,
        };
        return Some(Binding::Command(command));
    }
    if let Some(precmd) = name.strip_prefix("ledger_precmd_") {
        let precmd = match precmd {
            "args" => Precommand::Args,
            "parse" => Precommand::Parse,
            "period" => Precommand::Period,
            "eval" => Precommand::Eval,
            "format" => Precommand::Format,
            _ => return None,
        };
        return Some(Binding::Precommand(precmd));
    }
    let accessor = match name {
        "amount_expr" => Accessor::AmountExpr,
        "total_expr" => Accessor::TotalExpr,
        "display_total" => Accessor::DisplayTotal,
        "display_date" => Accessor::DisplayDate,
        "market_value" => Accessor::MarketValue,
        "print_balance" => Accessor::PrintBalance,
        "strip" => Accessor::Strip,
        "truncate" => Accessor::Truncate,
        _ => return None,
    };
    Some(Binding::Accessor(accessor))
}

/// Build the predicate the query words imply
///
/// Words are account regexps, OR-joined; after a "--" they become payee
/// regexps, AND-joined against the account group.
pub fn args_to_predicate(words: &[String]) -> String {
    let mut accounts: Vec<String> = Vec::new();
    let mut payees: Vec<String> = Vec::new();
    let mut in_payees = false;
    for word in words {
        if word == "--" {
            in_payees = true;
            continue;
        }
        if in_payees {
            payees.push(format!("payee =~ /{word}/"));
        } else {
            accounts.push(format!("account =~ /{word}/"));
        }
    }
    let accounts = accounts.join("|");
    let payees = payees.join("|");
    expr::predicate::conjoin(&accounts, &payees)
}

/// One report run: options, journal, scratch data
pub struct Report {
    /// The journal under report (read-only)
    pub journal: JournalRef,
    /// Commodity pool handle
    pub pool: PoolRef,
    /// Scratch side table
    pub data: ReportDataRef,
    /// The report's current date
    pub today: NaiveDate,

    /// Primary predicate (chain tail; selects what is calculated)
    pub predicate: String,
    /// Display predicate (runs after the calculator)
    pub display_predicate: String,
    /// Secondary predicate
    pub secondary_predicate: String,
    /// ";"-separated drill-down predicates
    pub descend_expr: String,
    /// Reconciliation target amount text
    pub reconcile_balance: Option<String>,
    /// Reconciliation cutoff date text (default: today)
    pub reconcile_date: Option<String>,
    /// Sort key expression
    pub sort_string: Option<String>,
    /// Sort same-entry postings as a unit
    pub entry_sort: bool,
    /// Sort key applied within interval buckets
    pub period_sort: Option<String>,
    /// Inject market revaluation postings
    pub show_revalued: bool,
    /// Show only the revaluation postings
    pub show_revalued_only: bool,
    /// Collapse entries to one posting per commodity
    pub show_collapsed: bool,
    /// Subtotal everything into one synthetic entry
    pub show_subtotal: bool,
    /// Bucket by day of the week
    pub days_of_the_week: bool,
    /// Bucket by payee
    pub by_payee: bool,
    /// Interval text ("monthly", "every 2 weeks", ...)
    pub report_period: Option<String>,
    /// Negate forwarded amounts
    pub show_inverted: bool,
    /// Replace postings with their entry-siblings
    pub show_related: bool,
    /// Include the matched posting among its siblings
    pub show_all_related: bool,
    /// Scrub payees and account names
    pub anonymize: bool,
    /// Payee becomes the amount's commodity symbol
    pub comm_as_payee: bool,
    /// Payee becomes the entry code
    pub code_as_payee: bool,
    /// Keep only the first N entries
    pub head_entries: usize,
    /// Keep only the last N entries
    pub tail_entries: usize,

    /// The amount expression (display value per posting)
    pub amount_expr: String,
    /// The total expression
    pub total_expr: String,
    /// Format override for the active command
    pub format_string: Option<String>,
    /// Output date format
    pub date_format: String,
    /// Input date format override
    pub input_date_format: Option<String>,
    /// Show zero-total accounts
    pub show_empty: bool,
    /// Force the balance grand-total footer
    pub show_totals: bool,
    /// Print undecorated quantities
    pub show_base: bool,
    /// Colour negative display amounts
    pub ansi: bool,
    /// Colour positive display amounts instead
    pub ansi_invert: bool,
    /// Pager command
    pub pager: Option<String>,
    /// Price database file
    pub price_db: Option<String>,
}

impl Report {
    /// Create a report over a journal with default options
    pub fn new(journal: JournalRef) -> Self {
        let pool = journal.pool.clone();
        let data = Rc::new(RefCell::new(ReportData::new(&journal)));
        Self {
            journal,
            pool,
            data,
            today: chrono::Local::now().date_naive(),
            predicate: String::new(),
            display_predicate: String::new(),
            secondary_predicate: String::new(),
            descend_expr: String::new(),
            reconcile_balance: None,
            reconcile_date: None,
            sort_string: None,
            entry_sort: false,
            period_sort: None,
            show_revalued: false,
            show_revalued_only: false,
            show_collapsed: false,
            show_subtotal: false,
            days_of_the_week: false,
            by_payee: false,
            report_period: None,
            show_inverted: false,
            show_related: false,
            show_all_related: false,
            anonymize: false,
            comm_as_payee: false,
            code_as_payee: false,
            head_entries: 0,
            tail_entries: 0,
            amount_expr: "amount".to_string(),
            total_expr: "total".to_string(),
            format_string: None,
            date_format: "%Y/%m/%d".to_string(),
            input_date_format: None,
            show_empty: false,
            show_totals: false,
            show_base: false,
            ansi: false,
            ansi_invert: false,
            pager: None,
            price_db: None,
        }
    }

    /// The evaluation context stages share
    pub fn context(&self) -> EvalContext {
        EvalContext {
            data: self.data.clone(),
            pool: self.pool.clone(),
            today: self.today,
            date_format: self.date_format.clone(),
        }
    }

    /// AND a term onto the primary predicate
    pub fn append_predicate(&mut self, term: &str) {
        self.predicate = expr::predicate::conjoin(&self.predicate, term);
        debug!("report predicate now '{}'", self.predicate);
    }

    /// Apply one option setter
    pub fn process_option(
        &mut self,
        kind: OptionKind,
        arg: Option<&str>,
    ) -> Result<(), ReportError> {
        let want = |arg: Option<&str>| -> Result<String, ReportError> {
            arg.map(str::to_string)
                .ok_or_else(|| ReportError::Config("option requires an argument".to_string()))
        };
        match kind {
            OptionKind::AmountExpr => self.amount_expr = want(arg)?,
            OptionKind::TotalExpr => self.total_expr = want(arg)?,
            OptionKind::Ansi => self.ansi = true,
            OptionKind::AnsiInvert => {
                self.ansi = true;
                self.ansi_invert = true;
            }
            OptionKind::Anon => self.anonymize = true,
            OptionKind::Base => self.show_base = true,
            OptionKind::Begin => {
                let date = self.parse_option_date(&want(arg)?)?;
                self.append_predicate(&format!("date>=[{}]", date.format("%Y/%m/%d")));
            }
            OptionKind::End => {
                let date = self.parse_option_date(&want(arg)?)?;
                self.append_predicate(&format!("date<[{}]", date.format("%Y/%m/%d")));
            }
            OptionKind::Current => {
                self.append_predicate(&format!("date<=[{}]", self.today.format("%Y/%m/%d")));
            }
            OptionKind::Cleared => self.append_predicate("cleared"),
            OptionKind::Uncleared => self.append_predicate("!cleared"),
            OptionKind::Limit => {
                let term = want(arg)?;
                self.append_predicate(&format!("({term})"));
            }
            OptionKind::ByPayee => self.by_payee = true,
            OptionKind::CodeAsPayee => self.code_as_payee = true,
            OptionKind::CommAsPayee => self.comm_as_payee = true,
            OptionKind::Collapse => self.show_collapsed = true,
            OptionKind::Cost => self.amount_expr = "cost".to_string(),
            OptionKind::Market => {
                self.amount_expr = "v".to_string();
                self.total_expr = "V".to_string();
            }
            OptionKind::Price => self.amount_expr = "price".to_string(),
            OptionKind::Quantity => {
                self.amount_expr = "amount".to_string();
                self.total_expr = "total".to_string();
            }
            OptionKind::Daily => self.merge_period("daily"),
            OptionKind::Weekly => self.merge_period("weekly"),
            OptionKind::Monthly => self.merge_period("monthly"),
            OptionKind::Quarterly => self.merge_period("quarterly"),
            OptionKind::Yearly => self.merge_period("yearly"),
            OptionKind::PeriodOpt => {
                let text = want(arg)?;
                self.merge_period(&text);
            }
            OptionKind::PeriodSort => self.period_sort = Some(want(arg)?),
            OptionKind::DateFormat => self.date_format = want(arg)?,
            OptionKind::InputDateFormat => self.input_date_format = Some(want(arg)?),
            OptionKind::Dow => self.days_of_the_week = true,
            OptionKind::Empty => self.show_empty = true,
            OptionKind::Format => self.format_string = Some(want(arg)?),
            OptionKind::Head => {
                self.head_entries = want(arg)?
                    .parse()
                    .map_err(|_| ReportError::Config("--head expects a count".to_string()))?;
            }
            OptionKind::Tail => {
                self.tail_entries = want(arg)?
                    .parse()
                    .map_err(|_| ReportError::Config("--tail expects a count".to_string()))?;
            }
            OptionKind::AmountData => self.format_string = Some("%D %t\n".to_string()),
            OptionKind::TotalData => self.format_string = Some("%D %T\n".to_string()),
            OptionKind::Pager => self.pager = Some(want(arg)?),
            OptionKind::PriceDb => self.price_db = Some(want(arg)?),
            OptionKind::Related => self.show_related = true,
            OptionKind::Sort => self.sort_string = Some(want(arg)?),
            OptionKind::SortAll => {
                self.sort_string = Some(want(arg)?);
                self.entry_sort = false;
            }
            OptionKind::SortEntries => {
                self.sort_string = Some(want(arg)?);
                self.entry_sort = true;
            }
            OptionKind::Subtotal => self.show_subtotal = true,
            OptionKind::Totals => self.show_totals = true,
            OptionKind::Ignored => {}
        }
        Ok(())
    }

    fn parse_option_date(&self, text: &str) -> Result<NaiveDate, ReportError> {
        let parsed = match &self.input_date_format {
            Some(format) => datetime::parse_date_with(text, format),
            None => datetime::parse_date(text),
        };
        parsed.ok_or_else(|| ReportError::Config(format!("cannot parse date '{text}'")))
    }

    fn merge_period(&mut self, text: &str) {
        self.report_period = Some(match self.report_period.take() {
            Some(existing) => format!("{existing} {text}"),
            None => text.to_string(),
        });
    }

    /// Reject option combinations the pipeline cannot honour
    pub fn check_config(&self) -> Result<(), ReportError> {
        let aggregators = [
            ("--subtotal", self.show_subtotal),
            ("--dow", self.days_of_the_week),
            ("--by-payee", self.by_payee),
        ];
        let active: Vec<&str> =
            aggregators.iter().filter(|(_, on)| *on).map(|(name, _)| *name).collect();
        if active.len() > 1 {
            return Err(ReportError::Config(format!(
                "conflicting group aggregators: {}",
                active.join(" and ")
            )));
        }
        if let Some(period) = &self.report_period {
            Period::parse(period)?;
        }
        Ok(())
    }

    /// Evaluate the amount expression in a scope
    pub fn amount_expr_value(&self, scope: &dyn Scope) -> Result<Value, ReportError> {
        Ok(eval(&parse(&self.amount_expr)?, scope)?)
    }

    /// Evaluate the total expression in a scope
    pub fn total_expr_value(&self, scope: &dyn Scope) -> Result<Value, ReportError> {
        Ok(eval(&parse(&self.total_expr)?, scope)?)
    }

    /// The value shown in total columns (alias of the total expression)
    pub fn display_total(&self, scope: &dyn Scope) -> Result<Value, ReportError> {
        self.total_expr_value(scope)
    }

    /// Invoke a value accessor or formatter helper resolved by [`lookup`]
    pub fn call_accessor(
        &self,
        accessor: Accessor,
        scope: &dyn Scope,
        args: &[Value],
    ) -> Result<Value, ReportError> {
        match accessor {
            Accessor::AmountExpr => self.amount_expr_value(scope),
            Accessor::TotalExpr | Accessor::DisplayTotal => self.total_expr_value(scope),
            Accessor::DisplayDate => {
                let date = match scope.resolve("date")? {
                    Value::Date(date) => date,
                    _ => self.today,
                };
                Ok(Value::String(datetime::format_date(date, &self.date_format)))
            }
            Accessor::MarketValue => match args {
                [Value::Amount(amount), Value::Date(date)] => {
                    Ok(Value::Amount(self.pool.borrow().market_value(amount, *date)))
                }
                [Value::Amount(amount)] => {
                    Ok(Value::Amount(self.pool.borrow().market_value(amount, self.today)))
                }
                [Value::Balance(balance)] => {
                    Ok(Value::Balance(balance.market_value(&self.pool.borrow(), self.today)))
                }
                _ => Err(ReportError::Config(
                    "market_value expects an amount or balance".to_string(),
                )),
            },
            Accessor::PrintBalance => {
                let text = args.first().map(Value::to_string).unwrap_or_default();
                Ok(Value::String(text))
            }
            Accessor::Strip => match args {
                [Value::Amount(amount)] => {
                    let base =
                        amount.commodity().and_then(|c| self.pool.borrow().find(c.symbol()));
                    Ok(Value::Amount(amount.stripped(base)))
                }
                [other] => Ok(other.clone()),
                _ => Err(ReportError::Config("strip expects one value".to_string())),
            },
            Accessor::Truncate => match args {
                [value, width] => {
                    let width = match width {
                        Value::Int(i) => *i,
                        Value::Amount(a) => a.to_i64().unwrap_or(0),
                        _ => 0,
                    };
                    let text: String =
                        value.as_string().chars().take(width.max(0) as usize).collect();
                    Ok(Value::String(text))
                }
                _ => Err(ReportError::Config("truncate expects a value and a width".to_string())),
            },
        }
    }

    /// Stream every posting of the journal through a handler chain
    pub fn posting_report(&self, base: HandlerBox) -> Result<(), ReportError> {
        self.check_config()?;
        let mut handler = chain::chain_post_handlers(self, base, true)?;
        for entry in &self.journal.entries {
            let posts: Vec<PostingRef> = entry.borrow().postings.clone();
            for post in posts {
                handler.handle(&post)?;
            }
        }
        handler.flush()?;
        self.clean_posts();
        Ok(())
    }

    /// Stream one entry's postings through a handler chain
    pub fn entry_report(&self, base: HandlerBox, entry: &EntryRef) -> Result<(), ReportError> {
        self.check_config()?;
        let mut handler = chain::chain_post_handlers(self, base, true)?;
        let posts: Vec<PostingRef> = entry.borrow().postings.clone();
        for post in posts {
            handler.handle(&post)?;
        }
        handler.flush()?;
        self.clean_posts();
        Ok(())
    }

    /// Accumulate postings into the account tree and walk it
    pub fn account_report(
        &self,
        mut handler: Box<dyn AccountHandler>,
    ) -> Result<(), ReportError> {
        self.check_config()?;
        let amount_expr = parse(&self.amount_expr)?;
        let accumulator = SetAccountValue::new(self.context(), amount_expr);
        let mut chain = chain::chain_post_handlers(self, Box::new(accumulator), false)?;
        for entry in &self.journal.entries {
            let posts: Vec<PostingRef> = entry.borrow().postings.clone();
            for post in posts {
                chain.handle(&post)?;
            }
        }
        chain.flush()?;

        self.calculate_totals(&self.journal.master);

        let sort_expr = match &self.sort_string {
            Some(text) => Some(parse(text)?),
            None => None,
        };
        self.walk_account_children(&self.journal.master, sort_expr.as_ref(), handler.as_mut())?;
        handler.flush()?;
        self.clean_posts();
        Ok(())
    }

    /// List the distinct commodities observed on postings
    pub fn commodities_report(&self, out: &mut dyn Write) -> Result<(), ReportError> {
        for symbol in self.journal.commodities() {
            writeln!(out, "{symbol}")?;
        }
        Ok(())
    }

    fn calculate_totals(&self, account: &AccountRef) -> Balance {
        let id = account.borrow().id;
        let mut total = self
            .data
            .borrow()
            .account(id)
            .map(|x| x.value.clone())
            .unwrap_or_default();
        let children: Vec<AccountRef> = account.borrow().children.values().cloned().collect();
        for child in children {
            total.add_balance(&self.calculate_totals(&child));
        }
        self.data.borrow_mut().account_mut(id).total = total.clone();
        total
    }

    fn walk_account_children(
        &self,
        account: &AccountRef,
        sort_expr: Option<&Expr>,
        handler: &mut dyn AccountHandler,
    ) -> Result<(), ReportError> {
        let mut children: Vec<AccountRef> = account.borrow().children.values().cloned().collect();
        if let Some(expr) = sort_expr {
            let ctx = self.context();
            let mut keyed: Vec<(Value, AccountRef)> = Vec::with_capacity(children.len());
            for child in children {
                let key = eval(expr, &ctx.account_scope(&child))?;
                keyed.push((key, child));
            }
            keyed.sort_by(|a, b| a.0.compare(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            children = keyed.into_iter().map(|(_, child)| child).collect();
        }
        for child in children {
            if self.should_display_account(&child) {
                handler.handle(&child)?;
            }
            self.walk_account_children(&child, sort_expr, handler)?;
        }
        Ok(())
    }

    /// Whether the account walk feeds this account to the handler
    pub fn should_display_account(&self, account: &AccountRef) -> bool {
        let id = account.borrow().id;
        let data = self.data.borrow();
        let Some(xdata) = data.account(id) else { return false };
        if !xdata.flags.contains(AccountXdataFlags::VISITED) {
            return false;
        }
        if self.show_empty {
            return true;
        }
        if xdata.total.is_zero() {
            return false;
        }
        // an inactive account with a single active child merges into it
        if xdata.value.is_zero() {
            let children: Vec<AccountRef> =
                account.borrow().children.values().cloned().collect();
            let active = children
                .iter()
                .filter(|c| {
                    data.account(c.borrow().id)
                        .map(|x| !x.total.is_zero())
                        .unwrap_or(false)
                })
                .count();
            if active == 1 {
                return false;
            }
        }
        true
    }

    /// Drop posting scratch and prune temp accounts
    pub fn clean_posts(&self) {
        self.data.borrow_mut().clear();
        self.journal.clean_accounts();
    }

    /// Run a precommand against this report's configuration
    pub fn run_precommand(
        &self,
        precmd: Precommand,
        args: &[String],
        out: &mut dyn Write,
    ) -> Result<(), ReportError> {
        match precmd {
            Precommand::Args => {
                let predicate = args_to_predicate(args);
                writeln!(out, "predicate: {predicate}")?;
                if !predicate.is_empty() {
                    Predicate::new(&predicate)?;
                    writeln!(out, "predicate parses cleanly")?;
                }
            }
            Precommand::Parse => {
                let text = args.join(" ");
                let expr = parse(&text)?;
                writeln!(out, "{expr:#?}")?;
            }
            Precommand::Eval => {
                let text = args.join(" ");
                let expr = parse(&text)?;
                let scope = expr::BaseScope { today: self.today };
                writeln!(out, "{}", eval(&expr, &scope)?)?;
            }
            Precommand::Period => {
                let text = args.join(" ");
                let period = Period::parse(&text)?;
                let start = period.start_for(self.today);
                writeln!(out, "{period:?}")?;
                writeln!(
                    out,
                    "current bucket: {} .. {}",
                    datetime::format_date(start, &self.date_format),
                    datetime::format_date(period.next(start), &self.date_format),
                )?;
            }
            Precommand::Format => {
                let text = args.join(" ");
                let spec = expr::format::FormatSpec::parse(&text)
                    .map_err(ReportError::Config)?;
                writeln!(out, "{spec:#?}")?;
            }
        }
        Ok(())
    }
}
