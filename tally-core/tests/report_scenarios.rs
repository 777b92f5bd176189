//! End-to-end reporting scenarios driven through the public API

use std::cell::RefCell;
use std::rc::Rc;

use chrono::NaiveDate;

use tally_core::filters::{AccountHandler, PostHandler};
use tally_core::journal::Journal;
use tally_core::parser::JournalParser;
use tally_core::posting::PostingRef;
use tally_core::report::{OptionKind, Report, ReportDataRef, ReportError};
use tally_math::CommodityPool;

/// What one register line would show, captured while scratch data is live
#[derive(Debug, Clone)]
struct Row {
    date: NaiveDate,
    payee: String,
    account: String,
    amount: String,
    total: String,
}

struct Capture {
    data: ReportDataRef,
    rows: Rc<RefCell<Vec<Row>>>,
}

impl Capture {
    fn new(report: &Report) -> (Self, Rc<RefCell<Vec<Row>>>) {
        let rows = Rc::new(RefCell::new(Vec::new()));
        (Self { data: report.data.clone(), rows: rows.clone() }, rows)
    }
}

impl PostHandler for Capture {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let data = self.data.borrow();
        self.rows.borrow_mut().push(Row {
            date: post.date(),
            payee: post.payee(),
            account: data.reported_account(post).borrow().fullname(),
            amount: data.value_of(post).to_string(),
            total: data.total_of(post).to_string(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        Ok(())
    }
}

/// Account lines plus the master grand total, captured before cleanup
struct AccountCapture {
    data: ReportDataRef,
    master_id: usize,
    rows: Rc<RefCell<Vec<(String, String)>>>,
    grand_total: Rc<RefCell<String>>,
}

impl AccountCapture {
    fn new(
        report: &Report,
    ) -> (Self, Rc<RefCell<Vec<(String, String)>>>, Rc<RefCell<String>>) {
        let rows = Rc::new(RefCell::new(Vec::new()));
        let grand_total = Rc::new(RefCell::new(String::new()));
        (
            Self {
                data: report.data.clone(),
                master_id: report.journal.master.borrow().id,
                rows: rows.clone(),
                grand_total: grand_total.clone(),
            },
            rows,
            grand_total,
        )
    }
}

impl AccountHandler for AccountCapture {
    fn handle(&mut self, account: &tally_core::account::AccountRef) -> Result<(), ReportError> {
        let id = account.borrow().id;
        let total =
            self.data.borrow().account(id).map(|x| x.total.to_string()).unwrap_or_default();
        self.rows.borrow_mut().push((account.borrow().fullname(), total));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        let total = self
            .data
            .borrow()
            .account(self.master_id)
            .map(|x| x.total.to_string())
            .unwrap_or_else(|| "0".to_string());
        *self.grand_total.borrow_mut() = total;
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

const SIMPLE: &str = "
    2009/01/01 Store
        Expenses:Food      10.00 USD
        Assets:Cash       -10.00 USD
    ";

const TWO_MONTHS: &str = "
    2009/01/01 Store
        Expenses:Food      10.00 USD
        Assets:Cash       -10.00 USD

    2009/02/01 Market
        Expenses:Food      20.00 USD
        Assets:Cash       -20.00 USD
    ";

#[test]
fn register_shows_postings_with_running_totals() {
    let report = report(SIMPLE);
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].account, "Expenses:Food");
    assert_eq!(rows[0].total, "10.00 USD");
    assert_eq!(rows[1].account, "Assets:Cash");
    assert_eq!(rows[1].total, "0");
}

#[test]
fn limit_filters_before_the_running_total() {
    let mut report = report(SIMPLE);
    report
        .process_option(OptionKind::Limit, Some("account =~ /Food/"))
        .unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].account, "Expenses:Food");
    // the filtered-out leg never entered the calculation
    assert_eq!(rows[0].total, "10.00 USD");
}

#[test]
fn display_predicate_filters_after_the_running_total() {
    let mut report = report(TWO_MONTHS);
    report.display_predicate = "total > 15".to_string();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    // only the third posting's total exceeds 15, and its total still
    // reflects the unfiltered stream
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].account, "Expenses:Food");
    assert_eq!(rows[0].amount, "20.00 USD");
    assert_eq!(rows[0].total, "20.00 USD");
}

#[test]
fn monthly_interval_buckets_postings() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Monthly, None).unwrap();
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2009, 1, 1).unwrap());
    assert_eq!(rows[0].amount, "10.00 USD");
    assert_eq!(rows[0].total, "10.00 USD");
    assert_eq!(rows[1].date, NaiveDate::from_ymd_opt(2009, 2, 1).unwrap());
    assert_eq!(rows[1].amount, "20.00 USD");
    assert_eq!(rows[1].total, "30.00 USD");
}

#[test]
fn interval_aggregates_conserve_the_sum() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Monthly, None).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    // per-account per-commodity bucket totals sum to the original postings
    let rows = rows.borrow();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.last().unwrap().total, "0");
}

#[test]
fn balance_tree_totals_obey_the_account_law() {
    let mut report = report(
        "
        2009/01/01 Grocer
            Expenses:Food:Fruit    10.00 USD
            Assets:Cash           -10.00 USD

        2009/01/02 Grocer
            Expenses:Food:Veg      20.00 USD
            Assets:Cash           -20.00 USD
        ",
    );
    report.process_option(OptionKind::Limit, Some("account =~ /Expenses/")).unwrap();
    let (capture, rows, grand) = AccountCapture::new(&report);
    report.account_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    // the inactive Expenses chain merges into Food, which splits into two
    // leaves; the parent's total is the sum of its children
    let names: Vec<&str> = rows.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["Expenses:Food", "Expenses:Food:Fruit", "Expenses:Food:Veg"]);
    assert_eq!(rows[0].1, "30.00 USD");
    assert_eq!(rows[1].1, "10.00 USD");
    assert_eq!(rows[2].1, "20.00 USD");
    assert_eq!(*grand.borrow(), "30.00 USD");
}

#[test]
fn balance_on_a_query_matches_the_scenario() {
    let mut report = report(TWO_MONTHS);
    report.append_predicate("account =~ /Expenses/");
    let (capture, rows, grand) = AccountCapture::new(&report);
    report.account_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0], ("Expenses:Food".to_string(), "30.00 USD".to_string()));
    assert_eq!(*grand.borrow(), "30.00 USD");
}

#[test]
fn reconcile_to_zero_selects_all_three_postings() {
    let mut report = report(
        "
        2009/01/01 Deposit
            Assets:Bank       100.00 USD
            Income:Salary    -100.00 USD

        2009/01/02 Groceries
            Expenses:Food      30.00 USD
            Assets:Bank       -30.00 USD

        2009/01/03 Rent
            Expenses:Rent      70.00 USD
            Assets:Bank       -70.00 USD
        ",
    );
    report.process_option(OptionKind::Limit, Some("account =~ /Bank/")).unwrap();
    report.reconcile_balance = Some("0".to_string());
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].total, "0");
}

#[test]
fn comm_as_payee_shows_commodity_symbols() {
    let mut report = report(
        "
        2009/01/01 Exchange
            Assets:EUR          5.00 EUR @@ 7.00 USD
            Assets:USD         -7.00 USD
        ",
    );
    report.process_option(OptionKind::CommAsPayee, None).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].payee, "EUR");
    assert_eq!(rows[1].payee, "USD");
}

#[test]
fn entries_fully_passing_the_predicate_balance_to_zero() {
    let mut report = report(TWO_MONTHS);
    report.append_predicate("real");
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[1].total, "0");
    assert_eq!(rows[3].total, "0");
}

#[test]
fn head_keeps_only_the_first_entry() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Head, Some("1")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.payee == "Store"));
    // truncation is display-only: the running totals were computed over
    // the full stream before the cut
    assert_eq!(rows[1].total, "0");
}

#[test]
fn sort_orders_postings_by_the_expression() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Sort, Some("-amount")).unwrap();
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows[0].amount, "20.00 USD");
    assert_eq!(rows[1].amount, "10.00 USD");
    // totals follow stream order, which sorting happens before
    assert_eq!(rows[1].total, "30.00 USD");
}

#[test]
fn subtotal_folds_everything_into_one_entry() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Subtotal, None).unwrap();
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, "30.00 USD");
    assert_eq!(rows[0].payee, "- 2009/02/01");
    assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2009, 1, 1).unwrap());
}

#[test]
fn by_payee_buckets_in_payee_order() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::ByPayee, None).unwrap();
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].payee, "Market");
    assert_eq!(rows[0].amount, "20.00 USD");
    assert_eq!(rows[1].payee, "Store");
    assert_eq!(rows[1].amount, "10.00 USD");
}

#[test]
fn dow_buckets_by_weekday() {
    // 2009/01/01 was a Thursday, 2009/01/04 a Sunday
    let mut report = report(
        "
        2009/01/01 Store
            Expenses:Food      10.00 USD
            Assets:Cash       -10.00 USD

        2009/01/04 Market
            Expenses:Food      20.00 USD
            Assets:Cash       -20.00 USD
        ",
    );
    report.process_option(OptionKind::Dow, None).unwrap();
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    // Sunday buckets come first
    assert_eq!(rows[0].payee, "Sundays");
    assert_eq!(rows[0].amount, "20.00 USD");
    assert_eq!(rows[1].payee, "Thursdays");
    assert_eq!(rows[1].amount, "10.00 USD");
}

#[test]
fn conflicting_group_aggregators_are_a_config_error() {
    let mut report = report(SIMPLE);
    report.process_option(OptionKind::Subtotal, None).unwrap();
    report.process_option(OptionKind::Dow, None).unwrap();
    let (capture, _rows) = Capture::new(&report);
    match report.posting_report(Box::new(capture)) {
        Err(ReportError::Config(message)) => assert!(message.contains("aggregators")),
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn bad_period_text_is_a_config_error() {
    let mut report = report(SIMPLE);
    report.process_option(OptionKind::PeriodOpt, Some("fortnightly")).unwrap();
    let (capture, _rows) = Capture::new(&report);
    assert!(report.posting_report(Box::new(capture)).is_err());
}

#[test]
fn related_expands_to_the_other_legs() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Related, None).unwrap();
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.account == "Assets:Cash"));
}

#[test]
fn invert_negates_what_reaches_the_formatter() {
    let mut report = report(SIMPLE);
    report.show_inverted = true;
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].amount, "-10.00 USD");
    assert_eq!(rows[0].total, "-10.00 USD");
}

#[test]
fn anonymize_scrubs_names_consistently() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Anon, None).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|row| row.payee != "Store" && row.payee != "Market"));
    assert!(rows.iter().all(|row| !row.account.contains("Expenses")));
    // the same account maps to the same pseudonym across entries
    assert_eq!(rows[0].account, rows[2].account);
    assert_ne!(rows[0].account, rows[1].account);
}

#[test]
fn revaluation_injects_market_change_postings() {
    let mut report = report(
        "
        2009/01/01 Buy
            Assets:Stock        10 STK @ 5.00 USD
            Assets:Cash       -50.00 USD

        P 2009/02/01 STK 6.00 USD

        2009/03/01 Deposit
            Assets:Cash       100.00 USD
            Income:Salary    -100.00 USD
        ",
    );
    report.process_option(OptionKind::Market, None).unwrap();
    report.show_revalued = true;
    report.process_option(OptionKind::Limit, Some("account =~ /Assets/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[2].payee, "Commodities revalued");
    assert_eq!(rows[2].account, "<Revalued>");
    assert_eq!(rows[2].amount, "10.00 USD");
    // the valued running total includes the revaluation delta
    assert_eq!(rows[3].total, "110.00 USD");
}

#[test]
fn descend_expands_subtotals_into_components() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Subtotal, None).unwrap();
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    report.descend_expr = "account =~ /Food/".to_string();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();

    let rows = rows.borrow();
    // the 30.00 subtotal posting opens up into the two postings behind it
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].amount, "10.00 USD");
    assert_eq!(rows[1].amount, "20.00 USD");
    assert!(rows.iter().all(|row| row.account == "Expenses:Food"));
}

#[test]
fn entry_report_is_limited_to_one_entry() {
    let report = report(TWO_MONTHS);
    let entry = report.journal.entries[0].clone();
    let (capture, rows) = Capture::new(&report);
    report.entry_report(Box::new(capture), &entry).unwrap();

    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.payee == "Store"));
}

#[test]
fn commodities_report_lists_symbols_sorted() {
    let report = report(
        "
        2009/01/01 Exchange
            Assets:EUR          5.00 EUR @@ 7.00 USD
            Assets:USD         -7.00 USD
        ",
    );
    let mut out = Vec::new();
    report.commodities_report(&mut out).unwrap();
    insta::assert_snapshot!(String::from_utf8(out).unwrap(), @r"
    EUR
    USD
    ");
}

#[test]
fn xdata_is_cleaned_between_reports() {
    let mut report = report(TWO_MONTHS);
    report.process_option(OptionKind::Limit, Some("account =~ /Food/")).unwrap();
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();
    assert_eq!(rows.borrow().len(), 2);

    // a second run over the same report starts its totals from scratch
    let (capture, rows) = Capture::new(&report);
    report.posting_report(Box::new(capture)).unwrap();
    let rows = rows.borrow();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].total, "30.00 USD");
}
