//! Date parsing and report periods
//!
//! A period buckets the posting stream for the interval stage: a repeat
//! count, a unit, and optional begin/end clamps. Weeks start on Monday;
//! quarters on the first of January, April, July and October.

use chrono::{Datelike, Duration, Months, NaiveDate};
use thiserror::Error;

/// Errors from period or date parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeriodError {
    /// Text that does not describe a period
    #[error("cannot parse period '{0}'")]
    BadPeriod(String),
    /// Text that does not describe a date
    #[error("cannot parse date '{0}'")]
    BadDate(String),
}

/// Time unit of a report period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodUnit {
    /// Calendar days
    Day,
    /// Monday-based weeks
    Week,
    /// Calendar months
    Month,
    /// Calendar quarters
    Quarter,
    /// Calendar years
    Year,
}

/// A report period: "every N units", optionally clamped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    /// Repeat count; 1 for the plain daily/weekly/... spellings
    pub every: u32,
    /// Bucket unit
    pub unit: PeriodUnit,
    /// First date included, also the anchor for multi-unit buckets
    pub begin: Option<NaiveDate>,
    /// First date excluded
    pub end: Option<NaiveDate>,
}

impl Period {
    /// Parse period text: "monthly", "every 2 weeks from 2009/01/01", ...
    pub fn parse(text: &str) -> Result<Period, PeriodError> {
        let mut every = 1u32;
        let mut unit = None;
        let mut begin = None;
        let mut end = None;

        let tokens: Vec<String> = text.split_whitespace().map(|t| t.to_lowercase()).collect();
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i].as_str() {
                "daily" => unit = Some(PeriodUnit::Day),
                "weekly" => unit = Some(PeriodUnit::Week),
                "monthly" => unit = Some(PeriodUnit::Month),
                "quarterly" => unit = Some(PeriodUnit::Quarter),
                "yearly" => unit = Some(PeriodUnit::Year),
                "every" => {
                    i += 1;
                    let mut token = tokens
                        .get(i)
                        .ok_or_else(|| PeriodError::BadPeriod(text.to_string()))?
                        .as_str();
                    if let Ok(n) = token.parse::<u32>() {
                        every = n.max(1);
                        i += 1;
                        token = tokens
                            .get(i)
                            .ok_or_else(|| PeriodError::BadPeriod(text.to_string()))?
                            .as_str();
                    }
                    unit = Some(match token.trim_end_matches('s') {
                        "day" => PeriodUnit::Day,
                        "week" => PeriodUnit::Week,
                        "month" => PeriodUnit::Month,
                        "quarter" => PeriodUnit::Quarter,
                        "year" => PeriodUnit::Year,
                        _ => return Err(PeriodError::BadPeriod(text.to_string())),
                    });
                }
                "from" | "since" => {
                    i += 1;
                    let token =
                        tokens.get(i).ok_or_else(|| PeriodError::BadPeriod(text.to_string()))?;
                    begin = Some(parse_date(token).ok_or_else(|| PeriodError::BadDate(token.clone()))?);
                }
                "to" | "until" => {
                    i += 1;
                    let token =
                        tokens.get(i).ok_or_else(|| PeriodError::BadPeriod(text.to_string()))?;
                    end = Some(parse_date(token).ok_or_else(|| PeriodError::BadDate(token.clone()))?);
                }
                "in" => {
                    i += 1;
                    let token =
                        tokens.get(i).ok_or_else(|| PeriodError::BadPeriod(text.to_string()))?;
                    let year: i32 =
                        token.parse().map_err(|_| PeriodError::BadDate(token.clone()))?;
                    begin = NaiveDate::from_ymd_opt(year, 1, 1);
                    end = NaiveDate::from_ymd_opt(year + 1, 1, 1);
                }
                _ => return Err(PeriodError::BadPeriod(text.to_string())),
            }
            i += 1;
        }

        let unit = unit.ok_or_else(|| PeriodError::BadPeriod(text.to_string()))?;
        Ok(Period { every, unit, begin, end })
    }

    /// Floor a date to the natural start of its unit (ignoring `every`)
    pub fn floor(&self, date: NaiveDate) -> NaiveDate {
        match self.unit {
            PeriodUnit::Day => date,
            PeriodUnit::Week => {
                date - Duration::days(date.weekday().num_days_from_monday() as i64)
            }
            PeriodUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .expect("first of month"),
            PeriodUnit::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), month, 1).expect("first of quarter")
            }
            PeriodUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("january 1"),
        }
    }

    /// The first bucket start covering `date`
    pub fn start_for(&self, date: NaiveDate) -> NaiveDate {
        match self.begin {
            Some(anchor) => {
                let mut start = anchor;
                let mut next = self.next(start);
                while next <= date {
                    start = next;
                    next = self.next(start);
                }
                start
            }
            None => self.floor(date),
        }
    }

    /// Advance a bucket start by one period
    pub fn next(&self, start: NaiveDate) -> NaiveDate {
        let months = |n: u32| start + Months::new(n * self.every);
        match self.unit {
            PeriodUnit::Day => start + Duration::days(self.every as i64),
            PeriodUnit::Week => start + Duration::days(7 * self.every as i64),
            PeriodUnit::Month => months(1),
            PeriodUnit::Quarter => months(3),
            PeriodUnit::Year => months(12),
        }
    }

    /// Whether a date falls inside the begin/end clamps
    pub fn contains(&self, date: NaiveDate) -> bool {
        if let Some(begin) = self.begin {
            if date < begin {
                return false;
            }
        }
        if let Some(end) = self.end {
            if date >= end {
                return false;
            }
        }
        true
    }
}

/// Parse a date in the formats the journal and CLI accept
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    for format in ["%Y/%m/%d", "%Y-%m-%d", "%Y.%m.%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    None
}

/// Parse a date with an explicit strftime format
pub fn parse_date_with(text: &str, format: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, format).ok()
}

/// Format a date, falling back to "%Y/%m/%d" on a malformed format string
pub fn format_date(date: NaiveDate, format: &str) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    if write!(out, "{}", date.format(format)).is_err() {
        out.clear();
        out.push_str(&date.format("%Y/%m/%d").to_string());
    }
    out
}
