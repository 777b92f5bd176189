//! Output formatters
//!
//! The terminal handlers of the pipeline: register and print consume the
//! posting stream, balance and equity consume the account walk. All of
//! them write through a boxed writer (stdout, a pager's stdin, or a test
//! buffer) and honour the report's date format, `--ansi` colouring and
//! `--base` raw-quantity mode.

use std::io::Write;

use colored::Colorize;

use tally_math::{Balance, CommodityFlags};

use crate::account::AccountRef;
use crate::datetime::format_date;
use crate::expr::format::{pad, FormatElement, FormatSpec};
use crate::expr::Value;
use crate::filters::{AccountHandler, PostHandler};
use crate::posting::{PostingFlags, PostingRef};
use crate::report::{AccountXdataFlags, EvalContext, Report, ReportError, XdataFlags};

/// Default register format: date and payee once per entry
pub const REGISTER_FORMAT: &str =
    "%D %-20.20P %-22.22A %12t %12T\n%/                                %-22.22A %12t %12T\n";

/// Default print format (driven in code, kept for `--format` symmetry)
pub const PRINT_FORMAT: &str = "%D %P\n";

/// Default balance line: 20-column total, indented partial name
pub const BALANCE_FORMAT: &str = "%20T  %A\n";

/// Display knobs shared by the formatters
#[derive(Clone)]
pub struct DisplayOptions {
    /// Output date format
    pub date_format: String,
    /// Colour negative display values
    pub ansi: bool,
    /// Colour positive display values instead
    pub ansi_invert: bool,
    /// Print undecorated quantities
    pub base: bool,
    /// Force the balance grand-total footer
    pub show_totals: bool,
}

impl DisplayOptions {
    /// Extract the display knobs from a report
    pub fn from_report(report: &Report) -> Self {
        Self {
            date_format: report.date_format.clone(),
            ansi: report.ansi,
            ansi_invert: report.ansi_invert,
            base: report.show_base,
            show_totals: report.show_totals,
        }
    }

    fn amount_string(&self, amount: &tally_math::Amount) -> String {
        if self.base {
            amount.format_quantity(amount.display_precision(), CommodityFlags::empty())
        } else {
            amount.to_string()
        }
    }

    fn balance_string(&self, balance: &Balance) -> String {
        if balance.is_empty() {
            return "0".to_string();
        }
        let parts: Vec<String> = balance.amounts().map(|a| self.amount_string(a)).collect();
        parts.join(", ")
    }

    fn value_string(&self, value: &Value) -> String {
        match value {
            Value::Amount(a) => self.amount_string(a),
            Value::Balance(b) => self.balance_string(b),
            other => other.to_string(),
        }
    }

    fn colored(&self, text: String, value_negative: bool) -> String {
        if !self.ansi {
            return text;
        }
        let highlight = if self.ansi_invert { !value_negative } else { value_negative };
        if highlight {
            text.red().to_string()
        } else {
            text
        }
    }
}

fn value_is_negative(value: &Value) -> bool {
    match value {
        Value::Int(i) => *i < 0,
        Value::Amount(a) => a.sign() < 0,
        Value::Balance(b) => {
            let mut any_negative = false;
            for amount in b.amounts() {
                match amount.sign() {
                    1 => return false,
                    -1 => any_negative = true,
                    _ => {}
                }
            }
            any_negative
        }
        _ => false,
    }
}

fn account_display_name(post: &PostingRef, ctx: &EvalContext) -> String {
    let name = ctx.data.borrow().reported_account(post).borrow().fullname();
    if post.flags.contains(PostingFlags::MUST_BALANCE)
        && post.flags.contains(PostingFlags::VIRTUAL)
    {
        format!("[{name}]")
    } else if post.flags.contains(PostingFlags::VIRTUAL) {
        format!("({name})")
    } else {
        name
    }
}

// ---------------------------------------------------------------------------
// register

/// Register output: one line per posting with a running total column
pub struct RegisterFormatter {
    out: Box<dyn Write>,
    spec: FormatSpec,
    ctx: EvalContext,
    options: DisplayOptions,
    last_entry: Option<usize>,
}

impl RegisterFormatter {
    /// Build from a report's format override or the register default
    pub fn new(out: Box<dyn Write>, report: &Report) -> Result<Self, ReportError> {
        let text = report.format_string.as_deref().unwrap_or(REGISTER_FORMAT);
        let spec = FormatSpec::parse(text).map_err(ReportError::Config)?;
        Ok(Self {
            out,
            spec,
            ctx: report.context(),
            options: DisplayOptions::from_report(report),
            last_entry: None,
        })
    }

    fn render_field(&self, post: &PostingRef, code: char) -> (String, bool) {
        match code {
            'D' => (format_date(post.date(), &self.options.date_format), false),
            'P' => (post.payee(), false),
            'A' => (account_display_name(post, &self.ctx), false),
            't' => {
                let value = self.ctx.data.borrow().value_of(post);
                (self.options.value_string(&value), value_is_negative(&value))
            }
            'T' => {
                let total = self.ctx.data.borrow().total_of(post);
                let value = Value::Balance(total);
                (self.options.value_string(&value), value_is_negative(&value))
            }
            'N' => (post.note.clone().unwrap_or_default(), false),
            _ => (String::new(), false),
        }
    }
}

impl PostHandler for RegisterFormatter {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let entry_id = post.entry().borrow().id;
        let first_of_entry = self.last_entry != Some(entry_id);
        self.last_entry = Some(entry_id);

        let mut line = String::new();
        for element in self.spec.elements(first_of_entry) {
            match element {
                FormatElement::Literal(text) => line.push_str(text),
                FormatElement::Field { code, left, min_width, max_width } => {
                    let (text, negative) = self.render_field(post, *code);
                    let padded = pad(&text, *left, *min_width, *max_width);
                    line.push_str(&self.options.colored(padded, negative));
                }
            }
        }
        self.out.write_all(line.as_bytes())?;
        self.ctx.data.borrow_mut().post_mut(post.id).flags |= XdataFlags::DISPLAYED;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.out.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// print

/// Print output: reconstruct entries in journal syntax
pub struct PrintFormatter {
    out: Box<dyn Write>,
    options: DisplayOptions,
    ctx: EvalContext,
    last_entry: Option<usize>,
    printed_any: bool,
}

impl PrintFormatter {
    /// Reconstructing formatter with the report's display options
    pub fn new(out: Box<dyn Write>, report: &Report) -> Self {
        Self {
            out,
            options: DisplayOptions::from_report(report),
            ctx: report.context(),
            last_entry: None,
            printed_any: false,
        }
    }
}

impl PostHandler for PrintFormatter {
    fn handle(&mut self, post: &PostingRef) -> Result<(), ReportError> {
        let entry = post.entry();
        let entry_id = entry.borrow().id;
        if self.last_entry != Some(entry_id) {
            self.last_entry = Some(entry_id);
            if self.printed_any {
                writeln!(self.out)?;
            }
            self.printed_any = true;

            let entry = entry.borrow();
            let mut header = format_date(entry.date, "%Y/%m/%d");
            if let Some(effective) = entry.effective_date {
                header.push('=');
                header.push_str(&format_date(effective, "%Y/%m/%d"));
            }
            match entry.state {
                crate::entry::EntryState::Cleared => header.push_str(" *"),
                crate::entry::EntryState::Pending => header.push_str(" !"),
                crate::entry::EntryState::Uncleared => {}
            }
            if let Some(code) = &entry.code {
                header.push_str(&format!(" ({code})"));
            }
            header.push(' ');
            header.push_str(&entry.payee);
            writeln!(self.out, "{header}")?;
        }

        let account = account_display_name(post, &self.ctx);
        let amount = self.options.amount_string(&post.amount);
        let mut line = format!("    {account:<34}{amount:>12}");
        if let Some(cost) = &post.cost {
            line.push_str(&format!(" @@ {}", self.options.amount_string(&cost.abs())));
        }
        writeln!(self.out, "{line}")?;
        if let Some(note) = &post.note {
            for piece in note.lines() {
                writeln!(self.out, "        ; {piece}")?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        self.out.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// balance

/// Balance output: the classic indented tree with a grand-total footer
pub struct BalanceFormatter {
    out: Box<dyn Write>,
    ctx: EvalContext,
    options: DisplayOptions,
    master: AccountRef,
    spec: Option<FormatSpec>,
    printed: usize,
}

impl BalanceFormatter {
    /// Build from a report; `--format` swaps the per-line layout
    pub fn new(out: Box<dyn Write>, report: &Report) -> Result<Self, ReportError> {
        let spec = match &report.format_string {
            Some(text) => Some(FormatSpec::parse(text).map_err(ReportError::Config)?),
            None => None,
        };
        Ok(Self {
            out,
            ctx: report.context(),
            options: DisplayOptions::from_report(report),
            master: report.journal.master.clone(),
            spec,
            printed: 0,
        })
    }

    /// Name shown for an account: the path from its nearest printed
    /// ancestor, indented two spaces per printed ancestor
    fn display_name(&self, account: &AccountRef) -> (usize, String) {
        let data = self.ctx.data.borrow();
        let mut segments = vec![account.borrow().name.clone()];
        let mut indent = 0;
        let mut collecting = true;
        let mut parent = account.borrow().parent.clone();
        while let Some(ancestor) = parent.and_then(|weak| weak.upgrade()) {
            let node = ancestor.borrow();
            if node.name.is_empty() {
                break;
            }
            let displayed = data
                .account(node.id)
                .map(|x| x.flags.contains(AccountXdataFlags::DISPLAYED))
                .unwrap_or(false);
            if displayed {
                indent += 1;
                collecting = false;
            } else if collecting {
                segments.push(node.name.clone());
            }
            parent = node.parent.clone();
        }
        segments.reverse();
        (indent, segments.join(":"))
    }

    fn write_total_lines(&mut self, total: &Balance, name: Option<&str>) -> Result<(), ReportError> {
        if total.is_empty() {
            let text = pad("0", false, 20, None);
            match name {
                Some(name) => writeln!(self.out, "{text}  {name}")?,
                None => writeln!(self.out, "{text}")?,
            }
            return Ok(());
        }
        let amounts: Vec<String> =
            total.amounts().map(|a| self.options.amount_string(a)).collect();
        let count = amounts.len();
        for (index, amount) in amounts.into_iter().enumerate() {
            let negative = total.amounts().nth(index).map(|a| a.sign() < 0).unwrap_or(false);
            let text = self.options.colored(pad(&amount, false, 20, None), negative);
            if index + 1 == count {
                match name {
                    Some(name) => writeln!(self.out, "{text}  {name}")?,
                    None => writeln!(self.out, "{text}")?,
                }
            } else {
                writeln!(self.out, "{text}")?;
            }
        }
        Ok(())
    }
}

impl AccountHandler for BalanceFormatter {
    fn handle(&mut self, account: &AccountRef) -> Result<(), ReportError> {
        let id = account.borrow().id;
        let total =
            self.ctx.data.borrow().account(id).map(|x| x.total.clone()).unwrap_or_default();
        let (indent, name) = self.display_name(account);
        let shown = format!("{}{}", "  ".repeat(indent), name);

        if let Some(spec) = &self.spec {
            let mut line = String::new();
            for element in spec.elements(true) {
                match element {
                    FormatElement::Literal(text) => line.push_str(text),
                    FormatElement::Field { code, left, min_width, max_width } => {
                        let text = match code {
                            'T' | 't' => self.options.balance_string(&total),
                            'A' => shown.clone(),
                            _ => String::new(),
                        };
                        line.push_str(&pad(&text, *left, *min_width, *max_width));
                    }
                }
            }
            self.out.write_all(line.as_bytes())?;
        } else {
            self.write_total_lines(&total, Some(&shown))?;
        }

        self.ctx.data.borrow_mut().account_mut(id).flags |= AccountXdataFlags::DISPLAYED;
        self.printed += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        if self.printed > 0 || self.options.show_totals {
            let master_id = self.master.borrow().id;
            let total = self
                .ctx
                .data
                .borrow()
                .account(master_id)
                .map(|x| x.total.clone())
                .unwrap_or_default();
            writeln!(self.out, "--------------------")?;
            self.write_total_lines(&total, None)?;
        }
        self.out.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// equity

/// Equity output: one entry that would reopen the books at today's totals
pub struct EquityFormatter {
    out: Box<dyn Write>,
    ctx: EvalContext,
    options: DisplayOptions,
    today: chrono::NaiveDate,
    lines: Vec<(String, tally_math::Amount)>,
}

impl EquityFormatter {
    /// Collecting formatter; emits on flush
    pub fn new(out: Box<dyn Write>, report: &Report) -> Self {
        Self {
            out,
            ctx: report.context(),
            options: DisplayOptions::from_report(report),
            today: report.today,
            lines: Vec::new(),
        }
    }
}

impl AccountHandler for EquityFormatter {
    fn handle(&mut self, account: &AccountRef) -> Result<(), ReportError> {
        let id = account.borrow().id;
        let value =
            self.ctx.data.borrow().account(id).map(|x| x.value.clone()).unwrap_or_default();
        if value.is_zero() {
            return Ok(());
        }
        let name = account.borrow().fullname();
        for amount in value.amounts() {
            self.lines.push((name.clone(), amount.clone()));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReportError> {
        if self.lines.is_empty() {
            self.out.flush()?;
            return Ok(());
        }
        writeln!(self.out, "{} Opening Balances", format_date(self.today, "%Y/%m/%d"))?;
        let mut grand = Balance::new();
        for (name, amount) in &self.lines {
            grand.add_amount(amount);
            let text = self.options.amount_string(amount);
            writeln!(self.out, "    {name:<34}{text:>12}")?;
        }
        for amount in grand.negated().amounts() {
            let text = self.options.amount_string(amount);
            writeln!(self.out, "    {:<34}{text:>12}", "Equity:Opening Balances")?;
        }
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A writer whose contents a test can read back after the formatter
    /// (which owns its writer) is gone
    #[derive(Clone, Default)]
    pub struct SharedWriter(pub Rc<RefCell<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedWriter {
        pub fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    use crate::parser::JournalParser;
    use crate::report::Report;
    use tally_math::CommodityPool;

    fn report(text: &str) -> Report {
        let pool = Rc::new(RefCell::new(CommodityPool::new()));
        let journal = JournalParser::new(pool).parse_journal(&textwrap::dedent(text)).unwrap();
        Report::new(Rc::new(journal))
    }

    #[test]
    fn register_lines_carry_running_totals() {
        let report = report(
            "
            2009/01/01 Store
                Expenses:Food      10.00 USD
                Assets:Cash       -10.00 USD
            ",
        );
        let writer = SharedWriter::default();
        let formatter = RegisterFormatter::new(Box::new(writer.clone()), &report).unwrap();
        report.posting_report(Box::new(formatter)).unwrap();

        let text = writer.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("2009/01/01 Store"));
        assert!(lines[0].contains("Expenses:Food"));
        assert!(lines[0].trim_end().ends_with("10.00 USD"));
        // the second line omits date and payee and ends at a zero total
        assert!(lines[1].starts_with("  "));
        assert!(lines[1].contains("Assets:Cash"));
        assert!(lines[1].trim_end().ends_with("0"));
    }

    #[test]
    fn print_reconstructs_entries() {
        let report = report(
            "
            2009/01/01 * (42) Store
                Expenses:Food      10.00 USD
                Assets:Cash       -10.00 USD
            ",
        );
        let writer = SharedWriter::default();
        let formatter = PrintFormatter::new(Box::new(writer.clone()), &report);
        report.posting_report(Box::new(formatter)).unwrap();

        let text = writer.text();
        assert!(text.starts_with("2009/01/01 * (42) Store\n"));
        assert!(text.contains("    Expenses:Food"));
        assert!(text.contains("10.00 USD"));
    }

    #[test]
    fn balance_collapses_single_child_chains() {
        let report = report(
            "
            2009/01/01 Store
                Expenses:Food      10.00 USD
                Assets:Cash       -10.00 USD

            2009/02/01 Market
                Expenses:Food      20.00 USD
                Assets:Cash       -20.00 USD
            ",
        );
        let writer = SharedWriter::default();
        let formatter = BalanceFormatter::new(Box::new(writer.clone()), &report).unwrap();
        report.account_report(Box::new(formatter)).unwrap();

        let text = writer.text();
        let lines: Vec<&str> = text.lines().collect();
        // two merged account lines, a separator, and a zero grand total
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("Assets:Cash"));
        assert!(lines[0].contains("-30.00 USD"));
        assert!(lines[1].contains("Expenses:Food"));
        assert!(lines[1].contains("30.00 USD"));
        assert_eq!(lines[2], "--------------------");
        assert!(lines[3].trim_end().ends_with("0"));
    }

    #[test]
    fn equity_entry_reopens_the_books() {
        let mut report = report(
            "
            2009/01/01 Store
                Expenses:Food      10.00 USD
                Assets:Cash       -10.00 USD
            ",
        );
        // equity over the asset accounts only, as one would reopen books
        report.predicate = "account =~ /Assets/".to_string();
        let writer = SharedWriter::default();
        let formatter = EquityFormatter::new(Box::new(writer.clone()), &report);
        report.account_report(Box::new(formatter)).unwrap();

        let text = writer.text();
        assert!(text.contains("Opening Balances"));
        assert!(text.contains("Assets:Cash"));
        assert!(!text.contains("Expenses:Food"));
        // the balancing leg cancels the asset totals
        assert!(text.contains("Equity:Opening Balances"));
        assert!(text.contains("10.00 USD"));
    }
}
