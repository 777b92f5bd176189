//! Pipeline assembly
//!
//! Converts a report's option set into an ordered chain of stages. The
//! chain is built bottom-up by wrapping: the first stage constructed here
//! sits closest to the terminal handler and therefore executes LAST; the
//! stage constructed at the end of this function is the one the driver
//! feeds first. The relative order is the contract — the primary predicate
//! wraps the calculator, so it selects what enters the calculation, while
//! the display predicate sits inside it and filters what is already
//! calculated.

use crate::datetime::{self, Period};
use crate::expr::{parse, Predicate};
use crate::filters::{
    AnonymizePosts, ByPayeePosts, CalcPosts, CollapsePosts, ComponentPosts, DowPosts,
    FilterPosts, HandlerBox, IntervalPosts, InvertPosts, ReconcilePosts, RelatedPosts,
    RevaluePosts, RewritePayee, SortEntries, SortPosts, SubtotalPosts, TruncateEntries,
};
use crate::parser::parse_amount_text;
use crate::report::{Report, ReportError};

/// Wrap `base` in the canonical stage order for a report
///
/// `for_postings` enables the posting-stream body (truncation through
/// interval grouping); the account path passes `false` and gets only the
/// always-on tail.
pub fn chain_post_handlers(
    report: &Report,
    base: HandlerBox,
    for_postings: bool,
) -> Result<HandlerBox, ReportError> {
    let ctx = report.context();
    let mut handler = base;
    let mut remember_components = false;

    if for_postings {
        // truncation caps displayed entries without affecting calculation
        if report.head_entries > 0 || report.tail_entries > 0 {
            handler =
                Box::new(TruncateEntries::new(handler, report.head_entries, report.tail_entries));
        }

        // the display predicate runs after the calculator, so it can filter
        // on running totals without changing them
        if !report.display_predicate.is_empty() {
            let predicate = Predicate::new(&report.display_predicate)?;
            handler = Box::new(FilterPosts::new(handler, predicate, ctx.clone()));
        }

        handler = Box::new(CalcPosts::new(handler, parse(&report.amount_expr)?, ctx.clone()));

        // drill-down: the leftmost ";"-separated predicate must run first,
        // so wrap in reverse
        if !report.descend_expr.is_empty() {
            let exprs: Vec<&str> = report.descend_expr.split(';').collect();
            for text in exprs.into_iter().rev() {
                let predicate = Predicate::new(text)?;
                handler = Box::new(ComponentPosts::new(handler, predicate, ctx.clone()));
            }
            remember_components = true;
        }

        if let Some(balance) = &report.reconcile_balance {
            let target = parse_amount_text(balance, &report.pool)
                .map_err(ReportError::Config)?;
            let cutoff = match &report.reconcile_date {
                Some(text) => datetime::parse_date(text).ok_or_else(|| {
                    ReportError::Config(format!("cannot parse reconcile date '{text}'"))
                })?,
                None => report.today,
            };
            handler = Box::new(ReconcilePosts::new(handler, target, cutoff));
        }

        if !report.secondary_predicate.is_empty() {
            let predicate = Predicate::new(&report.secondary_predicate)?;
            handler = Box::new(FilterPosts::new(handler, predicate, ctx.clone()));
        }

        if let Some(sort) = &report.sort_string {
            let sort_expr = parse(sort)?;
            handler = if report.entry_sort {
                Box::new(SortEntries::new(handler, sort_expr, ctx.clone()))
            } else {
                Box::new(SortPosts::new(handler, sort_expr, ctx.clone()))
            };
        }

        if report.show_revalued {
            let account =
                report.data.borrow_mut().temp_account(&report.journal.master, "<Revalued>");
            handler = Box::new(RevaluePosts::new(
                handler,
                ctx.clone(),
                account,
                report.show_revalued_only,
            ));
        }

        if report.show_collapsed {
            let account = report.data.borrow_mut().temp_account(&report.journal.master, "<Total>");
            handler = Box::new(CollapsePosts::new(handler, ctx.clone(), account));
        }

        // exactly one group aggregator may be active (checked up front)
        if report.show_subtotal {
            handler = Box::new(SubtotalPosts::new(handler, ctx.clone(), remember_components));
        } else if report.days_of_the_week {
            handler = Box::new(DowPosts::new(handler, ctx.clone(), remember_components));
        } else if report.by_payee {
            handler = Box::new(ByPayeePosts::new(handler, ctx.clone(), remember_components));
        }

        if let Some(period) = &report.report_period {
            let period = Period::parse(period)?;
            let bucket_sort = match &report.period_sort {
                Some(text) => Some(parse(text)?),
                None => None,
            };
            handler = Box::new(IntervalPosts::new(
                handler,
                ctx.clone(),
                period,
                remember_components,
                bucket_sort,
            ));
            // the interval stage needs chronological input
            handler = Box::new(SortPosts::new(handler, parse("date")?, ctx.clone()));
        }
    }

    if report.show_inverted {
        handler = Box::new(InvertPosts::new(handler, ctx.clone()));
    }

    if report.show_related {
        handler = Box::new(RelatedPosts::new(handler, ctx.clone(), report.show_all_related));
    }

    if report.anonymize {
        handler =
            Box::new(AnonymizePosts::new(handler, ctx.clone(), report.journal.master.clone()));
    }

    // the primary predicate wraps everything so far: it decides which
    // postings enter the calculation at all
    if !report.predicate.is_empty() {
        let predicate = Predicate::new(&report.predicate)?;
        handler = Box::new(FilterPosts::new(handler, predicate, ctx.clone()));
    }

    if report.comm_as_payee {
        handler = Box::new(RewritePayee::comm_as_payee(handler, ctx));
    } else if report.code_as_payee {
        handler = Box::new(RewritePayee::code_as_payee(handler, ctx));
    }

    Ok(handler)
}
