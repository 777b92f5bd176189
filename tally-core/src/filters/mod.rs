//! Pipeline stages
//!
//! Every stage implements the same two-operation contract: receive one
//! posting at a time, optionally buffer or transform, forward zero or more
//! postings downstream, and drain on flush. Stages own their downstream
//! successor exclusively; the chain in [`crate::chain`] composes them in
//! the canonical order, where relative position is semantically
//! load-bearing.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};

use chrono::{Datelike, NaiveDate};
use log::debug;

use tally_math::{Amount, Balance};

use crate::account::AccountRef;
use crate::datetime::{format_date, Period};
use crate::expr::{eval, Expr, Predicate, Value};
use crate::posting::{PostingFlags, PostingRef};
use crate::report::{AccountXdataFlags, EvalContext, ReportError, XdataFlags};

/// The posting-handler contract every stage implements
pub trait PostHandler {
    /// Receive one posting in stream order
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError>;
    /// End of stream: drain buffers, then flush downstream
    fn flush(&mut self) -> Result<(), ReportError>;
}

/// Owned handler chain link
pub type HandlerBox = Box<dyn PostHandler>;

/// The account-handler contract for account-tree reports
pub trait AccountHandler {
    /// Receive one displayable account in walk order
    fn handle(&mut self, account: &AccountRef) -> Result<(), ReportError>;
    /// End of walk
    fn flush(&mut self) -> Result<(), ReportError>;
}

// ---------------------------------------------------------------------------
// truncate

/// Cap the number of formatted entries at head/tail counts
///
/// Runs closest to the formatter, so it affects display only, never
/// calculation.
pub struct TruncateEntries {
    downstream: HandlerBox,
    head: usize,
    tail: usize,
    posts: Vec<PostingRef>,
}

impl TruncateEntries {
    /// Cap at the first `head` and/or last `tail` entries
    pub fn new(downstream: HandlerBox, head: usize, tail: usize) -> Self {
        Self { downstream, head, tail, posts: Vec::new() }
    }
}

impl PostHandler for TruncateEntries {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        self.posts.push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        let mut groups: Vec<(usize, Vec<PostingRef>)> = Vec::new();
        for post in self.posts.drain(..) {
            let entry_id = post.entry().borrow().id;
            match groups.last_mut() {
                Some((id, group)) if *id == entry_id => group.push(post),
                _ => groups.push((entry_id, vec![post])),
            }
        }
        let total = groups.len();
        for (index, (_, group)) in groups.into_iter().enumerate() {
            let keep_head = self.head > 0 && index < self.head;
            let keep_tail = self.tail > 0 && index >= total.saturating_sub(self.tail);
            if keep_head || keep_tail {
                for post in group {
                    self.downstream.handle(&post)?;
                }
            }
        }
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// filter

/// Forward only postings matching a predicate
pub struct FilterPosts {
    downstream: HandlerBox,
    predicate: Predicate,
    ctx: EvalContext,
}

impl FilterPosts {
    /// Filter by a compiled predicate
    pub fn new(downstream: HandlerBox, predicate: Predicate, ctx: EvalContext) -> Self {
        Self { downstream, predicate, ctx }
    }
}

impl PostHandler for FilterPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        if self.predicate.matches(&self.ctx.post_scope(post))? {
            self.ctx.data.borrow_mut().post_mut(post.id).flags |= XdataFlags::MATCHES;
            self.downstream.handle(post)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// calc

/// Assign each posting its display value and the running total
pub struct CalcPosts {
    downstream: HandlerBox,
    amount_expr: Expr,
    ctx: EvalContext,
    last_total: Balance,
    count: usize,
}

impl CalcPosts {
    /// Calculate with the report's amount expression
    pub fn new(downstream: HandlerBox, amount_expr: Expr, ctx: EvalContext) -> Self {
        Self { downstream, amount_expr, ctx, last_total: Balance::new(), count: 0 }
    }
}

impl PostHandler for CalcPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let value = eval(&self.amount_expr, &self.ctx.post_scope(post))?;
        let mut total = self.last_total.clone();
        total.add_balance(&value.to_balance()?);
        self.count += 1;
        {
            let mut data = self.ctx.data.borrow_mut();
            let xdata = data.post_mut(post.id);
            xdata.value = Some(value);
            xdata.total = total.clone();
            xdata.count = self.count;
        }
        self.last_total = total;
        self.downstream.handle(post)
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// components

/// Replace matching postings with the postings behind their total
///
/// The drill-down stage: a posting that matched the descend predicate and
/// carries component links is expanded into those components.
pub struct ComponentPosts {
    downstream: HandlerBox,
    predicate: Predicate,
    ctx: EvalContext,
}

impl ComponentPosts {
    /// Expand postings matching the descend predicate
    pub fn new(downstream: HandlerBox, predicate: Predicate, ctx: EvalContext) -> Self {
        Self { downstream, predicate, ctx }
    }
}

impl PostHandler for ComponentPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        if !self.predicate.matches(&self.ctx.post_scope(post))? {
            return Ok(());
        }
        let components: Vec<PostingRef> = self
            .ctx
            .data
            .borrow()
            .post(post.id)
            .map(|x| x.components.to_vec())
            .unwrap_or_default();
        if components.is_empty() {
            self.downstream.handle(post)
        } else {
            for component in components {
                self.downstream.handle(&component)?;
            }
            Ok(())
        }
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// reconcile

/// Keep only the unique subset of postings summing to a target balance
pub struct ReconcilePosts {
    downstream: HandlerBox,
    target: Balance,
    cutoff: NaiveDate,
    posts: Vec<PostingRef>,
}

impl ReconcilePosts {
    /// Reconcile to `target`, considering postings dated at or before `cutoff`
    pub fn new(downstream: HandlerBox, target: Amount, cutoff: NaiveDate) -> Self {
        Self { downstream, target: Balance::from_amount(&target), cutoff, posts: Vec::new() }
    }
}

impl PostHandler for ReconcilePosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        self.posts.push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        let eligible: Vec<PostingRef> =
            self.posts.drain(..).filter(|p| p.date() <= self.cutoff).collect();

        let mut solutions = 0usize;
        let mut first: Option<Vec<usize>> = None;
        let mut current = Balance::new();
        let mut picked = Vec::new();
        search_subsets(
            &eligible,
            0,
            &mut current,
            &mut picked,
            &self.target,
            &mut solutions,
            &mut first,
        );

        let chosen = match (solutions, first) {
            (0, _) | (_, None) => {
                return Err(ReportError::Reconcile {
                    target: self.target.to_string(),
                    cutoff: self.cutoff,
                    reason: "no subset of postings sums to the target".to_string(),
                })
            }
            (1, Some(indices)) => indices,
            (_, Some(_)) => {
                return Err(ReportError::Reconcile {
                    target: self.target.to_string(),
                    cutoff: self.cutoff,
                    reason: "more than one subset sums to the target".to_string(),
                })
            }
        };

        for index in chosen {
            self.downstream.handle(&eligible[index])?;
        }
        self.downstream.flush()
    }
}

fn search_subsets(
    posts: &[PostingRef],
    index: usize,
    current: &mut Balance,
    picked: &mut Vec<usize>,
    target: &Balance,
    solutions: &mut usize,
    first: &mut Option<Vec<usize>>,
) {
    if *solutions >= 2 {
        return;
    }
    if index == posts.len() {
        if !picked.is_empty() && current == target {
            if first.is_none() {
                *first = Some(picked.clone());
            }
            *solutions += 1;
        }
        return;
    }
    picked.push(index);
    current.add_amount(&posts[index].amount);
    search_subsets(posts, index + 1, current, picked, target, solutions, first);
    current.sub_amount(&posts[index].amount);
    picked.pop();
    search_subsets(posts, index + 1, current, picked, target, solutions, first);
}

// ---------------------------------------------------------------------------
// sort

/// Buffer everything and sort by a value expression on flush
pub struct SortPosts {
    downstream: HandlerBox,
    sort_expr: Expr,
    ctx: EvalContext,
    posts: Vec<PostingRef>,
}

impl SortPosts {
    /// Sort by the given key expression (stable on ties)
    pub fn new(downstream: HandlerBox, sort_expr: Expr, ctx: EvalContext) -> Self {
        Self { downstream, sort_expr, ctx, posts: Vec::new() }
    }
}

impl PostHandler for SortPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        self.posts.push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        let mut keyed: Vec<(Value, PostingRef)> = Vec::with_capacity(self.posts.len());
        for post in self.posts.drain(..) {
            let key = eval(&self.sort_expr, &self.ctx.post_scope(&post))?;
            keyed.push((key, post));
        }
        keyed.sort_by(|a, b| a.0.compare(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        for (_, post) in keyed {
            self.downstream.handle(&post)?;
        }
        self.downstream.flush()
    }
}

/// Like [`SortPosts`], but same-entry postings move as a unit
pub struct SortEntries {
    downstream: HandlerBox,
    sort_expr: Expr,
    ctx: EvalContext,
    groups: Vec<(usize, Vec<PostingRef>)>,
}

impl SortEntries {
    /// Sort whole entries by the key of their first posting
    pub fn new(downstream: HandlerBox, sort_expr: Expr, ctx: EvalContext) -> Self {
        Self { downstream, sort_expr, ctx, groups: Vec::new() }
    }
}

impl PostHandler for SortEntries {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let entry_id = post.entry().borrow().id;
        match self.groups.iter_mut().find(|(id, _)| *id == entry_id) {
            Some((_, group)) => group.push(post.clone()),
            None => self.groups.push((entry_id, vec![post.clone()])),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        let mut keyed: Vec<(Value, Vec<PostingRef>)> = Vec::with_capacity(self.groups.len());
        for (_, group) in self.groups.drain(..) {
            let key = eval(&self.sort_expr, &self.ctx.post_scope(&group[0]))?;
            keyed.push((key, group));
        }
        keyed.sort_by(|a, b| a.0.compare(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        for (_, group) in keyed {
            for post in group {
                self.downstream.handle(&post)?;
            }
        }
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// revaluation

/// Inject synthetic postings for market-value changes of the running total
///
/// The stage keeps its own commodity balance (it runs before the
/// calculator, so posting totals do not exist yet) and compares its market
/// value at consecutive posting dates.
pub struct RevaluePosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    account: AccountRef,
    only: bool,
    balance: Balance,
    last_value: Balance,
    last_date: Option<NaiveDate>,
}

impl RevaluePosts {
    /// Revalue against the given `<Revalued>` account
    pub fn new(downstream: HandlerBox, ctx: EvalContext, account: AccountRef, only: bool) -> Self {
        Self {
            downstream,
            ctx,
            account,
            only,
            balance: Balance::new(),
            last_value: Balance::new(),
            last_date: None,
        }
    }

    fn emit_revaluation(&mut self, date: NaiveDate, diff: &Balance) -> Result<(), ReportError> {
        debug!("revaluation of {} at {}", diff, date);
        let mut synthesized = Vec::new();
        {
            let mut data = self.ctx.data.borrow_mut();
            let entry = data.new_entry(date, "Commodities revalued");
            for amount in diff.amounts() {
                synthesized.push(data.add_posting(
                    &entry,
                    self.account.clone(),
                    amount.clone(),
                    None,
                    PostingFlags::empty(),
                ));
            }
        }
        for post in synthesized {
            self.downstream.handle(&post)?;
        }
        Ok(())
    }

    fn check(&mut self, date: NaiveDate) -> Result<(), ReportError> {
        if self.last_date.is_none() {
            return Ok(());
        }
        let current = self.balance.market_value(&self.ctx.pool.borrow(), date);
        let mut diff = current;
        diff.sub_balance(&self.last_value);
        if !diff.is_zero() {
            self.emit_revaluation(date, &diff)?;
        }
        Ok(())
    }
}

impl PostHandler for RevaluePosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let date = post.date();
        self.check(date)?;
        self.balance.add_amount(&post.amount);
        self.last_value = self.balance.market_value(&self.ctx.pool.borrow(), date);
        self.last_date = Some(date);
        if !self.only {
            self.downstream.handle(post)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.check(self.ctx.today)?;
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// collapse

/// Fold each multi-posting entry into one `<Total>` posting per commodity
pub struct CollapsePosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    totals_account: AccountRef,
    current_entry: Option<usize>,
    posts: Vec<PostingRef>,
}

impl CollapsePosts {
    /// Collapse into postings against `totals_account`
    pub fn new(downstream: HandlerBox, ctx: EvalContext, totals_account: AccountRef) -> Self {
        Self { downstream, ctx, totals_account, current_entry: None, posts: Vec::new() }
    }

    fn report_subtotal(&mut self) -> Result<(), ReportError> {
        match self.posts.len() {
            0 => return Ok(()),
            1 => {
                let single = self.posts.remove(0);
                return self.downstream.handle(&single);
            }
            _ => {}
        }
        let last = self.posts.last().expect("non-empty buffer");
        let (date, payee) = {
            let entry = last.entry();
            let entry = entry.borrow();
            (entry.date, entry.payee.clone())
        };
        let mut sum = Balance::new();
        for post in &self.posts {
            sum.add_amount(&post.amount);
        }
        let mut synthesized = Vec::new();
        {
            let mut data = self.ctx.data.borrow_mut();
            let entry = data.new_entry(date, payee);
            for amount in sum.amounts() {
                let posting = data.add_posting(
                    &entry,
                    self.totals_account.clone(),
                    amount.clone(),
                    None,
                    PostingFlags::empty(),
                );
                let xdata = data.post_mut(posting.id);
                xdata.components = self.posts.iter().cloned().collect();
                xdata.flags |= XdataFlags::COMPOUND;
                synthesized.push(posting);
            }
        }
        self.posts.clear();
        for post in synthesized {
            self.downstream.handle(&post)?;
        }
        Ok(())
    }
}

impl PostHandler for CollapsePosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let entry_id = post.entry().borrow().id;
        if self.current_entry != Some(entry_id) {
            self.report_subtotal()?;
            self.current_entry = Some(entry_id);
        }
        self.posts.push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.report_subtotal()?;
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// group aggregators

/// Aggregate postings per account per commodity into one synthetic entry
fn subtotal_postings(
    ctx: &EvalContext,
    posts: &[PostingRef],
    date: NaiveDate,
    payee: &str,
    remember: bool,
) -> Vec<PostingRef> {
    type Group = (AccountRef, Balance, Vec<PostingRef>);
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for post in posts {
        let account = ctx.data.borrow().reported_account(post);
        let name = account.borrow().fullname();
        let slot = groups.entry(name).or_insert_with(|| (account, Balance::new(), Vec::new()));
        slot.1.add_amount(&post.amount);
        slot.2.push(post.clone());
    }

    let mut out = Vec::new();
    let mut data = ctx.data.borrow_mut();
    let entry = data.new_entry(date, payee);
    for (_, (account, balance, components)) in groups {
        for amount in balance.amounts() {
            let posting = data.add_posting(
                &entry,
                account.clone(),
                amount.clone(),
                None,
                PostingFlags::empty(),
            );
            if remember {
                let xdata = data.post_mut(posting.id);
                xdata.components = components.iter().cloned().collect();
                xdata.flags |= XdataFlags::COMPOUND;
            }
            out.push(posting);
        }
    }
    out
}

/// Fold the whole stream into one synthetic subtotal entry
pub struct SubtotalPosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    remember: bool,
    posts: Vec<PostingRef>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl SubtotalPosts {
    /// Subtotal everything; `remember` keeps component links for drill-down
    pub fn new(downstream: HandlerBox, ctx: EvalContext, remember: bool) -> Self {
        Self { downstream, ctx, remember, posts: Vec::new(), start: None, end: None }
    }
}

impl PostHandler for SubtotalPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let date = post.date();
        self.start = Some(self.start.map_or(date, |d| d.min(date)));
        self.end = Some(self.end.map_or(date, |d| d.max(date)));
        self.posts.push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        if !self.posts.is_empty() {
            let start = self.start.expect("dated postings");
            let end = self.end.expect("dated postings");
            let payee = format!("- {}", format_date(end, &self.ctx.date_format));
            let synthesized =
                subtotal_postings(&self.ctx, &self.posts, start, &payee, self.remember);
            self.posts.clear();
            for post in synthesized {
                self.downstream.handle(&post)?;
            }
        }
        self.downstream.flush()
    }
}

/// Bucket postings by day of the week, Sunday first
pub struct DowPosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    remember: bool,
    buckets: [Vec<PostingRef>; 7],
}

impl DowPosts {
    /// Seven weekday buckets
    pub fn new(downstream: HandlerBox, ctx: EvalContext, remember: bool) -> Self {
        Self { downstream, ctx, remember, buckets: Default::default() }
    }
}

const WEEKDAY_PAYEES: [&str; 7] =
    ["Sundays", "Mondays", "Tuesdays", "Wednesdays", "Thursdays", "Fridays", "Saturdays"];

impl PostHandler for DowPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let index = post.date().weekday().num_days_from_sunday() as usize;
        self.buckets[index].push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        for (index, posts) in std::mem::take(&mut self.buckets).into_iter().enumerate() {
            if posts.is_empty() {
                continue;
            }
            let date = posts.last().expect("non-empty bucket").date();
            let synthesized =
                subtotal_postings(&self.ctx, &posts, date, WEEKDAY_PAYEES[index], self.remember);
            for post in synthesized {
                self.downstream.handle(&post)?;
            }
        }
        self.downstream.flush()
    }
}

/// Bucket postings by payee, emitted in payee order
pub struct ByPayeePosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    remember: bool,
    buckets: BTreeMap<String, Vec<PostingRef>>,
}

impl ByPayeePosts {
    /// One bucket per payee string
    pub fn new(downstream: HandlerBox, ctx: EvalContext, remember: bool) -> Self {
        Self { downstream, ctx, remember, buckets: BTreeMap::new() }
    }
}

impl PostHandler for ByPayeePosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        self.buckets.entry(post.payee()).or_default().push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        for (payee, posts) in std::mem::take(&mut self.buckets) {
            let date = posts.iter().map(|p| p.date()).max().expect("non-empty bucket");
            let synthesized = subtotal_postings(&self.ctx, &posts, date, &payee, self.remember);
            for post in synthesized {
                self.downstream.handle(&post)?;
            }
        }
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// interval

/// Bucket postings into consecutive report periods
///
/// Input must arrive date-sorted (the chain wraps this stage in a date
/// sorter); buckets close as soon as a posting beyond the boundary shows
/// up, so memory holds one bucket at a time.
pub struct IntervalPosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    period: Period,
    remember: bool,
    sort_key: Option<Expr>,
    start: Option<NaiveDate>,
    posts: Vec<PostingRef>,
}

impl IntervalPosts {
    /// Bucket by `period`; `sort_key` optionally orders each bucket's output
    pub fn new(
        downstream: HandlerBox,
        ctx: EvalContext,
        period: Period,
        remember: bool,
        sort_key: Option<Expr>,
    ) -> Self {
        Self { downstream, ctx, period, remember, sort_key, start: None, posts: Vec::new() }
    }

    fn emit_bucket(&mut self, start: NaiveDate, boundary: NaiveDate) -> Result<(), ReportError> {
        if self.posts.is_empty() {
            return Ok(());
        }
        let end = boundary.pred_opt().unwrap_or(boundary);
        let payee = format!("- {}", format_date(end, &self.ctx.date_format));
        let mut synthesized =
            subtotal_postings(&self.ctx, &self.posts, start, &payee, self.remember);
        self.posts.clear();
        if let Some(key) = &self.sort_key {
            let mut keyed: Vec<(Value, PostingRef)> = Vec::with_capacity(synthesized.len());
            for post in synthesized {
                let value = eval(key, &self.ctx.post_scope(&post))?;
                keyed.push((value, post));
            }
            keyed.sort_by(|a, b| a.0.compare(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            synthesized = keyed.into_iter().map(|(_, post)| post).collect();
        }
        for post in synthesized {
            self.downstream.handle(&post)?;
        }
        Ok(())
    }
}

impl PostHandler for IntervalPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let date = post.date();
        if !self.period.contains(date) {
            return Ok(());
        }
        match self.start {
            None => self.start = Some(self.period.start_for(date)),
            Some(mut start) => {
                let mut boundary = self.period.next(start);
                while date >= boundary {
                    self.emit_bucket(start, boundary)?;
                    start = boundary;
                    boundary = self.period.next(start);
                }
                self.start = Some(start);
            }
        }
        self.posts.push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        if let Some(start) = self.start {
            let boundary = self.period.next(start);
            self.emit_bucket(start, boundary)?;
        }
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// tail stages

/// Negate every forwarded amount
pub struct InvertPosts {
    downstream: HandlerBox,
    ctx: EvalContext,
}

impl InvertPosts {
    /// Forward sign-flipped variants
    pub fn new(downstream: HandlerBox, ctx: EvalContext) -> Self {
        Self { downstream, ctx }
    }
}

impl PostHandler for InvertPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let copy = self.ctx.data.borrow_mut().copy_with_amount(
            post,
            post.amount.negated(),
            post.cost.as_ref().map(Amount::negated),
        );
        self.downstream.handle(&copy)
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.downstream.flush()
    }
}

/// Replace each posting with the other postings of its entry
pub struct RelatedPosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    also_matching: bool,
    posts: Vec<PostingRef>,
}

impl RelatedPosts {
    /// `also_matching` keeps the received posting alongside its siblings
    pub fn new(downstream: HandlerBox, ctx: EvalContext, also_matching: bool) -> Self {
        Self { downstream, ctx, also_matching, posts: Vec::new() }
    }
}

impl PostHandler for RelatedPosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        self.ctx.data.borrow_mut().post_mut(post.id).flags |= XdataFlags::RECEIVED;
        self.posts.push(post.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        let posts = std::mem::take(&mut self.posts);
        for post in posts {
            let siblings: Vec<PostingRef> = post.entry().borrow().postings.clone();
            for sibling in siblings {
                let forward = {
                    let mut data = self.ctx.data.borrow_mut();
                    let xdata = data.post_mut(sibling.id);
                    if xdata.flags.contains(XdataFlags::HANDLED) {
                        false
                    } else {
                        let received = xdata.flags.contains(XdataFlags::RECEIVED);
                        let wanted = if received { self.also_matching } else { true };
                        if wanted {
                            xdata.flags |= XdataFlags::HANDLED;
                        }
                        wanted
                    }
                };
                if forward {
                    self.downstream.handle(&sibling)?;
                }
            }
        }
        self.downstream.flush()
    }
}

/// Scrub payees and account names with stable per-run pseudonyms
pub struct AnonymizePosts {
    downstream: HandlerBox,
    ctx: EvalContext,
    master: AccountRef,
    map: HashMap<String, String>,
    used: HashSet<String>,
}

impl AnonymizePosts {
    /// Anonymise under the given master root
    pub fn new(downstream: HandlerBox, ctx: EvalContext, master: AccountRef) -> Self {
        Self { downstream, ctx, master, map: HashMap::new(), used: HashSet::new() }
    }

    fn pseudonym(&mut self, name: &str) -> String {
        if let Some(existing) = self.map.get(name) {
            return existing.clone();
        }
        let mut salt = 0u64;
        loop {
            let mut hasher = DefaultHasher::new();
            name.hash(&mut hasher);
            salt.hash(&mut hasher);
            let candidate = format!("{:08x}", hasher.finish() as u32);
            if self.used.insert(candidate.clone()) {
                self.map.insert(name.to_string(), candidate.clone());
                return candidate;
            }
            salt += 1;
        }
    }
}

impl PostHandler for AnonymizePosts {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let payee = self.pseudonym(&post.payee());
        let path: Vec<String> =
            post.account_name().split(':').map(|segment| self.pseudonym(segment)).collect();
        let path = path.join(":");
        let copy = {
            let mut data = self.ctx.data.borrow_mut();
            let entry = data.entry_like(post, payee);
            let account = data.temp_account(&self.master, &path);
            data.add_posting(
                &entry,
                account,
                post.amount.clone(),
                post.cost.clone(),
                PostingFlags::ANONYMIZED,
            )
        };
        self.downstream.handle(&copy)
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.downstream.flush()
    }
}

/// Rewrite the payee to the amount's commodity symbol or the entry code
pub struct RewritePayee {
    downstream: HandlerBox,
    ctx: EvalContext,
    use_code: bool,
}

impl RewritePayee {
    /// Payee becomes the commodity symbol
    pub fn comm_as_payee(downstream: HandlerBox, ctx: EvalContext) -> Self {
        Self { downstream, ctx, use_code: false }
    }

    /// Payee becomes the entry code
    pub fn code_as_payee(downstream: HandlerBox, ctx: EvalContext) -> Self {
        Self { downstream, ctx, use_code: true }
    }
}

impl PostHandler for RewritePayee {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let payee = if self.use_code {
            post.code().unwrap_or_default()
        } else {
            post.amount.symbol().to_string()
        };
        let copy = {
            let mut data = self.ctx.data.borrow_mut();
            let entry = data.entry_like(post, payee);
            data.add_posting(
                &entry,
                post.account.clone(),
                post.amount.clone(),
                post.cost.clone(),
                PostingFlags::empty(),
            )
        };
        self.downstream.handle(&copy)
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.downstream.flush()
    }
}

// ---------------------------------------------------------------------------
// account accumulation terminal

/// Terminal handler of the account path: accumulate values per account
pub struct SetAccountValue {
    ctx: EvalContext,
    amount_expr: Expr,
}

impl SetAccountValue {
    /// Accumulate the amount expression's value into account scratch
    pub fn new(ctx: EvalContext, amount_expr: Expr) -> Self {
        Self { ctx, amount_expr }
    }
}

impl PostHandler for SetAccountValue {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let value = eval(&self.amount_expr, &self.ctx.post_scope(post))?.to_balance()?;
        let account = self.ctx.data.borrow().reported_account(post);
        let mut data = self.ctx.data.borrow_mut();
        {
            let xdata = data.account_mut(account.borrow().id);
            xdata.value.add_balance(&value);
            xdata.count += 1;
            xdata.flags |= AccountXdataFlags::VISITED;
        }
        let mut parent = account.borrow().parent.clone();
        while let Some(ancestor) = parent.and_then(|weak| weak.upgrade()) {
            data.account_mut(ancestor.borrow().id).flags |= AccountXdataFlags::VISITED;
            parent = ancestor.borrow().parent.clone();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::parser::JournalParser;
    use crate::report::Report;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tally_math::CommodityPool;

    /// Terminal handler collecting what reaches the end of a chain
    pub struct Collector {
        pub sink: Rc<RefCell<Vec<PostingRef>>>,
    }

    impl Collector {
        pub fn new() -> (Self, Rc<RefCell<Vec<PostingRef>>>) {
            let sink = Rc::new(RefCell::new(Vec::new()));
            (Self { sink: sink.clone() }, sink)
        }
    }

    impl PostHandler for Collector {
        fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
            self.sink.borrow_mut().push(post.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<(), ReportError> {
            Ok(())
        }
    }

    fn journal(text: &str) -> Journal {
        let pool = Rc::new(RefCell::new(CommodityPool::new()));
        JournalParser::new(pool).parse_journal(&textwrap::dedent(text)).unwrap()
    }

    fn report(text: &str) -> Report {
        Report::new(Rc::new(journal(text)))
    }

    fn all_posts(report: &Report) -> Vec<PostingRef> {
        report
            .journal
            .entries
            .iter()
            .flat_map(|e| e.borrow().postings.clone())
            .collect()
    }

    const TWO_ENTRIES: &str = "
        2009/01/01 Store
            Expenses:Food      10.00 USD
            Assets:Cash       -10.00 USD

        2009/02/01 Market
            Expenses:Food      20.00 USD
            Assets:Cash       -20.00 USD
        ";

    #[test]
    fn truncate_head_keeps_leading_entries() {
        let report = report(TWO_ENTRIES);
        let (collector, sink) = Collector::new();
        let mut stage = TruncateEntries::new(Box::new(collector), 1, 0);
        for post in all_posts(&report) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let seen = sink.borrow();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p.payee() == "Store"));
    }

    #[test]
    fn truncate_tail_keeps_trailing_entries() {
        let report = report(TWO_ENTRIES);
        let (collector, sink) = Collector::new();
        let mut stage = TruncateEntries::new(Box::new(collector), 0, 1);
        for post in all_posts(&report) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let seen = sink.borrow();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p.payee() == "Market"));
    }

    #[test]
    fn calc_assigns_running_totals() {
        let report = report(TWO_ENTRIES);
        let ctx = report.context();
        let (collector, sink) = Collector::new();
        let expr = crate::expr::parse("amount").unwrap();
        let mut stage = CalcPosts::new(Box::new(collector), expr, ctx.clone());
        for post in all_posts(&report) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let seen = sink.borrow();
        assert_eq!(seen.len(), 4);
        let data = ctx.data.borrow();
        // after the second posting the entry cancels out
        assert!(data.post(seen[1].id).unwrap().total.is_zero());
        // after the third only the new food posting remains
        assert_eq!(data.post(seen[2].id).unwrap().total.to_string(), "20.00 USD");
        assert_eq!(data.post(seen[3].id).unwrap().count, 4);
    }

    #[test]
    fn collapse_preserves_entry_sums() {
        let report = report(TWO_ENTRIES);
        let ctx = report.context();
        let totals = report.data.borrow_mut().temp_account(&report.journal.master, "<Total>");
        let (collector, sink) = Collector::new();
        let mut stage = CollapsePosts::new(Box::new(collector), ctx, totals);
        for post in all_posts(&report) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let seen = sink.borrow();
        // each entry sums to zero per commodity, so nothing survives the fold
        assert!(seen.is_empty());
    }

    #[test]
    fn collapse_emits_non_zero_residue_per_commodity() {
        let report = report(
            "
            2009/01/01 Exchange
                Assets:EUR         5.00 EUR
                Assets:USD        10.00 USD
                Assets:Cash      -10.00 USD
                Assets:Wallet     -5.00 EUR
            ",
        );
        let ctx = report.context();
        let totals = report.data.borrow_mut().temp_account(&report.journal.master, "<Total>");
        let (collector, sink) = Collector::new();
        let mut stage = CollapsePosts::new(Box::new(collector), ctx.clone(), totals);
        // feed only the first two legs so a residue remains
        let posts = all_posts(&report);
        stage.handle(&posts[0]).unwrap();
        stage.handle(&posts[1]).unwrap();
        stage.flush().unwrap();
        let seen = sink.borrow();
        assert_eq!(seen.len(), 2);
        let mut sum = Balance::new();
        for post in seen.iter() {
            sum.add_amount(&post.amount);
        }
        assert_eq!(sum.amount_for("EUR").unwrap().to_string(), "5.00 EUR");
        assert_eq!(sum.amount_for("USD").unwrap().to_string(), "10.00 USD");
        // component links point back at the folded postings
        let data = ctx.data.borrow();
        assert_eq!(data.post(seen[0].id).unwrap().components.len(), 2);
    }

    #[test]
    fn reconcile_selects_the_unique_subset() {
        let report = report(
            "
            2009/01/01 One
                Assets:Bank       100.00 USD
                Income:Salary    -100.00 USD

            2009/01/02 Two
                Expenses:A         30.00 USD
                Assets:Bank       -30.00 USD

            2009/01/03 Three
                Expenses:B         70.00 USD
                Assets:Bank       -70.00 USD
            ",
        );
        let cutoff = NaiveDate::from_ymd_opt(2009, 12, 31).unwrap();
        let (collector, sink) = Collector::new();
        let mut stage = ReconcilePosts::new(Box::new(collector), Amount::zero(), cutoff);
        for post in all_posts(&report).into_iter().filter(|p| p.account_name() == "Assets:Bank") {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        assert_eq!(sink.borrow().len(), 3);
    }

    #[test]
    fn reconcile_rejects_ambiguity() {
        let report = report(
            "
            2009/01/01 A
                Assets:Bank        10.00 USD
                Income:X          -10.00 USD

            2009/01/02 B
                Assets:Bank        10.00 USD
                Income:X          -10.00 USD
            ",
        );
        let cutoff = NaiveDate::from_ymd_opt(2009, 12, 31).unwrap();
        let pool = report.pool.clone();
        let ten = crate::parser::parse_amount_text("10.00 USD", &pool).unwrap();
        let (collector, _sink) = Collector::new();
        let mut stage = ReconcilePosts::new(Box::new(collector), ten, cutoff);
        for post in all_posts(&report).into_iter().filter(|p| p.account_name() == "Assets:Bank") {
            stage.handle(&post).unwrap();
        }
        match stage.flush() {
            Err(ReportError::Reconcile { reason, .. }) => {
                assert!(reason.contains("more than one"))
            }
            other => panic!("expected ambiguity error, got {other:?}"),
        }
    }

    #[test]
    fn related_emits_the_other_legs_once() {
        let report = report(TWO_ENTRIES);
        let ctx = report.context();
        let (collector, sink) = Collector::new();
        let mut stage = RelatedPosts::new(Box::new(collector), ctx, false);
        // feed only the food legs, as a primary filter would
        for post in all_posts(&report).into_iter().filter(|p| p.account_name().contains("Food")) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let seen = sink.borrow();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p.account_name() == "Assets:Cash"));
    }

    #[test]
    fn pseudonyms_are_stable_and_injective() {
        let report = report(TWO_ENTRIES);
        let ctx = report.context();
        let (collector, _sink) = Collector::new();
        let mut stage =
            AnonymizePosts::new(Box::new(collector), ctx, report.journal.master.clone());
        let a = stage.pseudonym("Expenses");
        let b = stage.pseudonym("Expenses");
        let c = stage.pseudonym("Assets");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn invert_flips_signs() {
        let report = report(TWO_ENTRIES);
        let ctx = report.context();
        let (collector, sink) = Collector::new();
        let mut stage = InvertPosts::new(Box::new(collector), ctx);
        for post in all_posts(&report) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let seen = sink.borrow();
        assert_eq!(seen[0].amount.to_string(), "-10.00 USD");
        assert_eq!(seen[1].amount.to_string(), "10.00 USD");
        // the copy still knows its entry
        assert_eq!(seen[0].payee(), "Store");
    }

    #[test]
    fn interval_groups_by_month() {
        let report = report(TWO_ENTRIES);
        let ctx = report.context();
        let (collector, sink) = Collector::new();
        let period = Period::parse("monthly").unwrap();
        let mut stage = IntervalPosts::new(Box::new(collector), ctx, period, false, None);
        for post in all_posts(&report).into_iter().filter(|p| p.account_name().contains("Food")) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let seen = sink.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].amount.to_string(), "10.00 USD");
        assert_eq!(seen[0].date(), NaiveDate::from_ymd_opt(2009, 1, 1).unwrap());
        assert_eq!(seen[1].amount.to_string(), "20.00 USD");
        assert_eq!(seen[1].date(), NaiveDate::from_ymd_opt(2009, 2, 1).unwrap());
        assert_eq!(seen[1].payee(), "- 2009/02/28");
    }

    #[test]
    fn set_account_value_marks_ancestors() {
        let report = report(TWO_ENTRIES);
        let ctx = report.context();
        let expr = crate::expr::parse("amount").unwrap();
        let mut stage = SetAccountValue::new(ctx.clone(), expr);
        for post in all_posts(&report) {
            stage.handle(&post).unwrap();
        }
        stage.flush().unwrap();
        let food = report.journal.find_account_only("Expenses:Food").unwrap();
        let expenses = report.journal.find_account_only("Expenses").unwrap();
        let data = ctx.data.borrow();
        let food_x = data.account(food.borrow().id).unwrap();
        assert_eq!(food_x.value.to_string(), "30.00 USD");
        assert_eq!(food_x.count, 2);
        let parent_x = data.account(expenses.borrow().id).unwrap();
        assert!(parent_x.flags.contains(AccountXdataFlags::VISITED));
        assert!(parent_x.value.is_zero());
    }
}
