//! Journal file parser
//!
//! Parses the classic plain-text journal format with nom combinators for
//! the token-level pieces and a line-driven outer loop. Commodity display
//! styles (precision, symbol placement, separators) are learned from the
//! amounts as they are read.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::NaiveDate;
use log::debug;
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_while1},
    character::complete::char,
    combinator::{map, opt, recognize},
    sequence::{delimited, pair},
    IResult,
};
use thiserror::Error;

use tally_math::{Amount, CommodityFlags, PoolRef};

use crate::datetime;
use crate::entry::{Entry, EntryRef, EntryState};
use crate::journal::{Journal, JournalError};
use crate::posting::{Posting, PostingFlags};

/// Errors raised while reading a journal file
#[derive(Error, Debug)]
pub enum ParseError {
    /// Malformed text
    #[error("line {line}: {message}")]
    Syntax {
        /// 1-based source line
        line: usize,
        /// What went wrong
        message: String,
    },
    /// An entry whose postings do not sum to zero
    #[error("line {line}: {source}")]
    Unbalanced {
        /// 1-based source line of the entry header
        line: usize,
        /// Underlying journal error
        source: JournalError,
    },
}

/// Parser state: the commodity pool and the input date format override
pub struct JournalParser {
    pool: PoolRef,
    input_date_format: Option<String>,
}

struct PostingDraft {
    line: usize,
    account: String,
    state: Option<EntryState>,
    flags: PostingFlags,
    amount: Option<Amount>,
    cost: Option<Amount>,
    unit_price: Option<Amount>,
    note: Option<String>,
    effective_date: Option<NaiveDate>,
}

impl JournalParser {
    /// Create a parser feeding the given commodity pool
    pub fn new(pool: PoolRef) -> Self {
        Self { pool, input_date_format: None }
    }

    /// Override the date format accepted in entry headers
    pub fn with_date_format(mut self, format: Option<String>) -> Self {
        self.input_date_format = format;
        self
    }

    /// Parse a whole journal text
    pub fn parse_journal(&mut self, text: &str) -> Result<Journal, ParseError> {
        let mut journal = Journal::new(self.pool.clone());
        let mut lines = text.lines().enumerate().peekable();

        while let Some((idx, line)) = lines.next() {
            let lineno = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let first = line.chars().next().expect("non-empty line");
            match first {
                ';' | '#' | '%' | '|' | '*' => continue,
                'P' => self.parse_price(lineno, line, &mut journal)?,
                c if c.is_ascii_digit() => {
                    let mut posting_lines = Vec::new();
                    while let Some((_, next)) = lines.peek() {
                        if next.starts_with(' ') || next.starts_with('\t') {
                            let (next_idx, next_line) = lines.next().expect("peeked");
                            if next_line.trim().is_empty() {
                                break;
                            }
                            posting_lines.push((next_idx + 1, next_line));
                        } else {
                            break;
                        }
                    }
                    self.parse_entry(lineno, line, &posting_lines, &mut journal)?;
                }
                c if c.is_whitespace() => {
                    return Err(ParseError::Syntax {
                        line: lineno,
                        message: "posting outside of any entry".to_string(),
                    });
                }
                _ => {
                    return Err(ParseError::Syntax {
                        line: lineno,
                        message: format!("unrecognized directive '{line}'"),
                    });
                }
            }
        }

        debug!("parsed {} entries", journal.entries.len());
        Ok(journal)
    }

    fn parse_date(&self, lineno: usize, token: &str) -> Result<NaiveDate, ParseError> {
        let parsed = match &self.input_date_format {
            Some(format) => datetime::parse_date_with(token, format),
            None => datetime::parse_date(token),
        };
        parsed.ok_or_else(|| ParseError::Syntax {
            line: lineno,
            message: format!("cannot parse date '{token}'"),
        })
    }

    fn parse_price(
        &mut self,
        lineno: usize,
        line: &str,
        journal: &mut Journal,
    ) -> Result<(), ParseError> {
        let mut tokens = line.split_whitespace();
        tokens.next(); // "P"
        let date_token = tokens.next().ok_or_else(|| ParseError::Syntax {
            line: lineno,
            message: "price directive missing date".to_string(),
        })?;
        let date = self.parse_date(lineno, date_token)?;
        let mut symbol = tokens.next().ok_or_else(|| ParseError::Syntax {
            line: lineno,
            message: "price directive missing symbol".to_string(),
        })?;
        if symbol.contains(':') {
            // optional time of day; ignored, prices are daily
            symbol = tokens.next().ok_or_else(|| ParseError::Syntax {
                line: lineno,
                message: "price directive missing symbol".to_string(),
            })?;
        }
        let rest: Vec<&str> = tokens.collect();
        let price = self.parse_amount(lineno, &rest.join(" "))?;
        journal.pool.borrow_mut().record_price(symbol, date, price);
        Ok(())
    }

    fn parse_entry(
        &mut self,
        lineno: usize,
        header: &str,
        posting_lines: &[(usize, &str)],
        journal: &mut Journal,
    ) -> Result<(), ParseError> {
        let (date_token, mut rest) = match header.find(char::is_whitespace) {
            Some(pos) => (&header[..pos], header[pos..].trim_start()),
            None => (header, ""),
        };
        let (date, effective_date) = match date_token.split_once('=') {
            Some((d, e)) => {
                (self.parse_date(lineno, d)?, Some(self.parse_date(lineno, e)?))
            }
            None => (self.parse_date(lineno, date_token)?, None),
        };

        let mut state = EntryState::Uncleared;
        if let Some(stripped) = rest.strip_prefix('*') {
            state = EntryState::Cleared;
            rest = stripped.trim_start();
        } else if let Some(stripped) = rest.strip_prefix('!') {
            state = EntryState::Pending;
            rest = stripped.trim_start();
        }

        let mut code = None;
        if let Some(stripped) = rest.strip_prefix('(') {
            if let Some(end) = stripped.find(')') {
                code = Some(stripped[..end].to_string());
                rest = stripped[end + 1..].trim_start();
            }
        }

        let (payee, note) = match rest.split_once(';') {
            Some((p, n)) => (p.trim().to_string(), Some(n.trim().to_string())),
            None => (rest.trim().to_string(), None),
        };

        let mut drafts = Vec::new();
        for (post_line, text) in posting_lines {
            // indented comment lines attach to the previous posting
            let trimmed = text.trim_start();
            if let Some(comment) = trimmed.strip_prefix(';') {
                if let Some(last) = drafts.last_mut() {
                    self.attach_note(last, comment.trim());
                }
                continue;
            }
            drafts.push(self.parse_posting(*post_line, trimmed)?);
        }
        if drafts.len() < 2 {
            return Err(ParseError::Syntax {
                line: lineno,
                message: format!("entry '{payee}' needs at least two postings"),
            });
        }

        self.finalize_elided(lineno, &payee, &mut drafts)?;

        let entry = Rc::new(RefCell::new(Entry::new(journal.alloc_entry_id(), date, payee)));
        {
            let mut e = entry.borrow_mut();
            e.effective_date = effective_date;
            e.state = state;
            e.code = code;
            e.note = note;
        }
        self.attach_postings(&entry, drafts, journal, date);

        journal
            .add_entry(entry)
            .map_err(|source| ParseError::Unbalanced { line: lineno, source })
    }

    fn attach_note(&self, draft: &mut PostingDraft, comment: &str) {
        // "[=DATE]" in a posting note overrides the effective date
        if let Some(inner) = comment.strip_prefix("[=").and_then(|c| c.strip_suffix(']')) {
            if let Some(date) = datetime::parse_date(inner) {
                draft.effective_date = Some(date);
                return;
            }
        }
        match &mut draft.note {
            Some(note) => {
                note.push('\n');
                note.push_str(comment);
            }
            None => draft.note = Some(comment.to_string()),
        }
    }

    fn parse_posting(&mut self, lineno: usize, text: &str) -> Result<PostingDraft, ParseError> {
        let mut rest = text;
        let mut state = None;
        if let Some(stripped) = rest.strip_prefix('*') {
            state = Some(EntryState::Cleared);
            rest = stripped.trim_start();
        } else if let Some(stripped) = rest.strip_prefix('!') {
            state = Some(EntryState::Pending);
            rest = stripped.trim_start();
        }

        let (account_text, amount_text) = split_account(rest);

        let mut flags = PostingFlags::empty();
        let mut account = account_text.to_string();
        if let Some(inner) =
            account.strip_prefix('(').and_then(|a| a.strip_suffix(')')).map(str::to_string)
        {
            flags |= PostingFlags::VIRTUAL;
            account = inner;
        } else if let Some(inner) =
            account.strip_prefix('[').and_then(|a| a.strip_suffix(']')).map(str::to_string)
        {
            flags |= PostingFlags::VIRTUAL | PostingFlags::MUST_BALANCE;
            account = inner;
        }
        if account.is_empty() {
            return Err(ParseError::Syntax {
                line: lineno,
                message: "posting with empty account".to_string(),
            });
        }

        let mut draft = PostingDraft {
            line: lineno,
            account,
            state,
            flags,
            amount: None,
            cost: None,
            unit_price: None,
            note: None,
            effective_date: None,
        };

        if let Some(amount_text) = amount_text {
            let (amount_text, note) = match amount_text.split_once(';') {
                Some((a, n)) => (a.trim(), Some(n.trim().to_string())),
                None => (amount_text.trim(), None),
            };
            if let Some(note) = note {
                self.attach_note(&mut draft, &note);
            }
            if !amount_text.is_empty() {
                self.parse_amount_and_cost(lineno, amount_text, &mut draft)?;
            }
        }

        Ok(draft)
    }

    fn parse_amount_and_cost(
        &mut self,
        lineno: usize,
        text: &str,
        draft: &mut PostingDraft,
    ) -> Result<(), ParseError> {
        let (amount_part, cost_part) = match text.find('@') {
            Some(pos) => (text[..pos].trim(), Some(text[pos..].trim())),
            None => (text.trim(), None),
        };
        let amount = self.parse_amount(lineno, amount_part)?;

        if let Some(cost_text) = cost_part {
            let (total_form, price_text) = match cost_text.strip_prefix("@@") {
                Some(rest) => (true, rest.trim()),
                None => (false, cost_text[1..].trim()),
            };
            let price = self.parse_amount(lineno, price_text)?;
            if price.sign() < 0 {
                return Err(ParseError::Syntax {
                    line: lineno,
                    message: "costs must not be negative".to_string(),
                });
            }
            if total_form {
                draft.cost =
                    Some(if amount.sign() < 0 { price.negated() } else { price.clone() });
                if !amount.is_zero() {
                    if let Ok(unit) = price.divided_by(&amount.abs()) {
                        draft.unit_price = Some(unit);
                    }
                }
            } else {
                draft.cost = Some(amount.value_in(&price));
                draft.unit_price = Some(price);
            }
        }

        draft.amount = Some(amount);
        Ok(())
    }

    /// Parse an amount with optional commodity, learning display style
    pub fn parse_amount(&mut self, lineno: usize, text: &str) -> Result<Amount, ParseError> {
        parse_amount_text(text, &self.pool).map_err(|message| ParseError::Syntax {
            line: lineno,
            message,
        })
    }

    fn finalize_elided(
        &self,
        lineno: usize,
        payee: &str,
        drafts: &mut [PostingDraft],
    ) -> Result<(), ParseError> {
        let elided: Vec<usize> = drafts
            .iter()
            .enumerate()
            .filter(|(_, d)| d.amount.is_none())
            .map(|(i, _)| i)
            .collect();
        if elided.len() > 1 {
            return Err(ParseError::Syntax {
                line: lineno,
                message: format!("entry '{payee}' has more than one elided amount"),
            });
        }
        if let Some(&index) = elided.first() {
            let mut residue = tally_math::Balance::new();
            for (i, draft) in drafts.iter().enumerate() {
                if i == index || !draft_must_balance(draft) {
                    continue;
                }
                let contribution =
                    draft.cost.clone().or_else(|| draft.amount.clone()).expect("amount present");
                residue.add_amount(&contribution);
            }
            let amounts: Vec<&Amount> = residue.amounts().collect();
            let amount = match amounts.len() {
                0 => Amount::zero(),
                1 => amounts[0].negated(),
                _ => {
                    return Err(ParseError::Syntax {
                        line: drafts[index].line,
                        message: format!(
                            "cannot infer the elided amount of '{payee}' across commodities"
                        ),
                    })
                }
            };
            drafts[index].amount = Some(amount);
            drafts[index].flags |= PostingFlags::CALCULATED;
        }
        Ok(())
    }

    fn attach_postings(
        &self,
        entry: &EntryRef,
        drafts: Vec<PostingDraft>,
        journal: &mut Journal,
        date: NaiveDate,
    ) {
        for draft in drafts {
            let account = journal.find_account(&draft.account);
            let amount = draft.amount.expect("finalized amount");
            if let (Some(unit), Some(commodity)) = (&draft.unit_price, amount.commodity()) {
                journal.pool.borrow_mut().record_price(commodity.symbol(), date, unit.clone());
            }
            let mut posting = Posting::new(journal.alloc_posting_id(), entry, account, amount);
            posting.cost = draft.cost;
            posting.state = draft.state;
            posting.effective_date = draft.effective_date;
            posting.note = draft.note;
            posting.flags |= draft.flags;
            entry.borrow_mut().postings.push(Rc::new(posting));
        }
    }
}

fn draft_must_balance(draft: &PostingDraft) -> bool {
    !draft.flags.contains(PostingFlags::VIRTUAL)
        || draft.flags.contains(PostingFlags::MUST_BALANCE)
}

/// Split a posting body into account text and the optional amount text
///
/// Account names may contain single spaces; a tab or a run of two or more
/// spaces ends the account.
fn split_account(text: &str) -> (&str, Option<&str>) {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\t' {
            return (text[..i].trim_end(), Some(text[i..].trim_start()));
        }
        if c == ' ' {
            if let Some((_, next)) = chars.peek() {
                if *next == ' ' {
                    return (text[..i].trim_end(), Some(text[i..].trim_start()));
                }
            }
        }
    }
    (text.trim_end(), None)
}

fn is_symbol_char(c: char) -> bool {
    c.is_alphabetic() || matches!(c, '$' | '€' | '£' | '¥' | '_')
}

fn symbol(input: &str) -> IResult<&str, String> {
    alt((
        map(delimited(char('"'), is_not("\""), char('"')), |s: &str| s.to_string()),
        map(take_while1(is_symbol_char), |s: &str| s.to_string()),
    ))(input)
}

fn quantity(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        opt(char('-')),
        take_while1(|c: char| c.is_ascii_digit() || c == '.' || c == ','),
    ))(input)
}

/// Parse amount text against a pool: "$10.00", "-340,00 €", "125 STK"
pub fn parse_amount_text(text: &str, pool: &PoolRef) -> Result<Amount, String> {
    let text = text.trim();
    let bad = || format!("cannot parse amount '{text}'");

    // leading minus may precede a prefixed symbol: -$10
    let (after_neg, lead_neg) = match text.strip_prefix('-') {
        Some(rest) if !rest.starts_with(|c: char| c.is_ascii_digit()) => (rest.trim_start(), true),
        _ => (text, false),
    };

    if let Ok((rest, sym)) = symbol(after_neg) {
        // prefixed commodity
        let spaced = rest.starts_with(' ');
        let rest = rest.trim_start();
        let (rest, qty) = quantity(rest).map_err(|_| bad())?;
        if !rest.trim().is_empty() {
            return Err(bad());
        }
        let mut amount = build_amount(qty, &sym, false, spaced, pool)?;
        if lead_neg {
            amount = amount.negated();
        }
        return Ok(amount);
    }

    let (rest, qty) = quantity(after_neg).map_err(|_| bad())?;
    let spaced = rest.starts_with(' ');
    let rest = rest.trim_start();
    if rest.is_empty() {
        let mut amount = build_amount(qty, "", false, false, pool)?;
        if lead_neg {
            amount = amount.negated();
        }
        return Ok(amount);
    }
    let (rest, sym) = symbol(rest).map_err(|_| bad())?;
    if !rest.trim().is_empty() {
        return Err(bad());
    }
    let mut amount = build_amount(qty, &sym, true, spaced, pool)?;
    if lead_neg {
        amount = amount.negated();
    }
    Ok(amount)
}

fn build_amount(
    qty: &str,
    sym: &str,
    suffixed: bool,
    spaced: bool,
    pool: &PoolRef,
) -> Result<Amount, String> {
    let (plain, precision, thousands, european) = normalize_quantity(qty)?;
    let amount = Amount::parse_quantity(&plain).map_err(|e| e.to_string())?;
    if sym.is_empty() {
        return Ok(amount);
    }
    let mut flags = CommodityFlags::empty();
    if suffixed {
        flags |= CommodityFlags::STYLE_SUFFIXED;
    }
    if spaced {
        flags |= CommodityFlags::STYLE_SEPARATED;
    }
    if thousands {
        flags |= CommodityFlags::STYLE_THOUSANDS;
    }
    if european {
        flags |= CommodityFlags::STYLE_EUROPEAN;
    }
    let commodity = pool.borrow_mut().find_or_create(sym);
    commodity.observe(precision, flags);
    Ok(amount.with_commodity(commodity))
}

/// Undo separators: returns (plain quantity, precision, thousands, european)
fn normalize_quantity(text: &str) -> Result<(String, u16, bool, bool), String> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let last_dot = digits.rfind('.');
    let last_comma = digits.rfind(',');
    let dot_count = digits.matches('.').count();
    let comma_count = digits.matches(',').count();

    let decimal_sep: Option<char> = match (last_dot, last_comma) {
        (Some(d), Some(c)) => Some(if d > c { '.' } else { ',' }),
        (Some(_), None) => {
            if dot_count == 1 {
                Some('.')
            } else {
                None
            }
        }
        (None, Some(c)) => {
            // one comma followed by exactly three digits reads as grouping
            if comma_count == 1 && digits.len() - c - 1 != 3 {
                Some(',')
            } else {
                None
            }
        }
        (None, None) => None,
    };

    let mut plain = String::new();
    if negative {
        plain.push('-');
    }
    let mut precision: u16 = 0;
    let mut thousands = false;
    let mut seen_decimal = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => {
                plain.push(c);
                if seen_decimal {
                    precision += 1;
                }
            }
            '.' | ',' => {
                if Some(c) == decimal_sep {
                    if seen_decimal {
                        return Err(format!("two decimal marks in '{text}'"));
                    }
                    plain.push('.');
                    seen_decimal = true;
                } else {
                    thousands = true;
                }
            }
            _ => return Err(format!("bad character '{c}' in quantity '{text}'")),
        }
    }
    if plain.is_empty() || plain == "-" {
        return Err(format!("empty quantity '{text}'"));
    }
    Ok((plain, precision, thousands, decimal_sep == Some(',')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_math::CommodityPool;

    fn pool() -> PoolRef {
        Rc::new(RefCell::new(CommodityPool::new()))
    }

    fn parse(text: &str) -> Journal {
        JournalParser::new(pool()).parse_journal(text).unwrap()
    }

    #[test]
    fn parses_a_simple_entry() {
        let journal = parse(&textwrap::dedent(
            "
            2009/01/01 Store
                Expenses:Food      10.00 USD
                Assets:Cash       -10.00 USD
            ",
        ));
        assert_eq!(journal.entries.len(), 1);
        let entry = journal.entries[0].borrow();
        assert_eq!(entry.payee, "Store");
        assert_eq!(entry.postings.len(), 2);
        assert_eq!(entry.postings[0].account_name(), "Expenses:Food");
        assert_eq!(entry.postings[0].amount.to_string(), "10.00 USD");
        insta::assert_snapshot!(entry.postings[1].amount.to_string(), @"-10.00 USD");
    }

    #[test]
    fn learns_commodity_style_from_amounts() {
        let journal = parse(&textwrap::dedent(
            "
            2009/01/01 Caisse
                Actif:BC       -340,00 €
                Passif:BC       340,00 €
            ",
        ));
        let euro = journal.pool.borrow().find("€").unwrap();
        assert_eq!(euro.precision(), 2);
        assert!(euro.flags().contains(CommodityFlags::STYLE_EUROPEAN));
        assert!(euro.flags().contains(CommodityFlags::STYLE_SUFFIXED));
    }

    #[test]
    fn elided_amount_balances_the_entry() {
        let journal = parse(&textwrap::dedent(
            "
            2009/01/01 Store
                Expenses:Food      10.00 USD
                Assets:Cash
            ",
        ));
        let entry = journal.entries[0].borrow();
        assert_eq!(entry.postings[1].amount.to_string(), "-10.00 USD");
        assert!(entry.postings[1].flags.contains(PostingFlags::CALCULATED));
    }

    #[test]
    fn cost_converts_for_balancing() {
        let journal = parse(&textwrap::dedent(
            "
            2009/01/01 Broker
                Assets:Stock        10 STK @ 5.00 USD
                Assets:Cash     -50.00 USD
            ",
        ));
        let entry = journal.entries[0].borrow();
        assert_eq!(entry.postings[0].cost.as_ref().unwrap().to_string(), "50.00 USD");
        // the unit price lands in the pool
        let pool = journal.pool.borrow();
        let point = pool.price_at("STK", entry.date).unwrap();
        assert_eq!(point.price.to_string(), "5.00 USD");
    }

    #[test]
    fn unbalanced_entry_is_rejected() {
        let result = JournalParser::new(pool()).parse_journal(&textwrap::dedent(
            "
            2009/01/01 Oops
                Expenses:Food      10.00 USD
                Assets:Cash          -9.00 USD
            ",
        ));
        assert!(matches!(result, Err(ParseError::Unbalanced { .. })));
    }

    #[test]
    fn entry_metadata_round_trip() {
        let journal = parse(&textwrap::dedent(
            "
            2009/01/01=2009/01/05 * (A1) Store  ; weekly shop
                Expenses:Food      10.00 USD
                Assets:Cash       -10.00 USD
            ",
        ));
        let entry = journal.entries[0].borrow();
        assert_eq!(entry.state, EntryState::Cleared);
        assert_eq!(entry.code.as_deref(), Some("A1"));
        assert_eq!(entry.effective().to_string(), "2009-01-05");
        assert_eq!(entry.note.as_deref(), Some("weekly shop"));
    }

    #[test]
    fn virtual_postings_do_not_balance() {
        let journal = parse(&textwrap::dedent(
            "
            2009/01/01 Budget
                Expenses:Food       10.00 USD
                Assets:Cash        -10.00 USD
                (Budget:Food)      -10.00 USD
            ",
        ));
        let entry = journal.entries[0].borrow();
        assert!(entry.postings[2].is_virtual());
        assert!(!entry.postings[2].must_balance());
    }

    #[test]
    fn price_directive_lands_in_the_pool() {
        let journal = parse("P 2009/01/15 STK 12.00 USD\n");
        let pool = journal.pool.borrow();
        let date = NaiveDate::from_ymd_opt(2009, 1, 20).unwrap();
        assert_eq!(pool.price_at("STK", date).unwrap().price.to_string(), "12.00 USD");
    }

    #[test]
    fn account_names_keep_single_spaces() {
        let journal = parse(&textwrap::dedent(
            "
            2009/01/01 Diner
                Expenses:Dining Out      15.00 USD
                Assets:Cash
            ",
        ));
        let entry = journal.entries[0].borrow();
        assert_eq!(entry.postings[0].account_name(), "Expenses:Dining Out");
    }
}
