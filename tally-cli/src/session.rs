//! Session state: journal files, the commodity pool, the price database

use std::cell::RefCell;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use log::info;

use tally_core::journal::{Journal, JournalRef};
use tally_core::parser::JournalParser;
use tally_math::{CommodityPool, PoolRef};

/// One CLI invocation's loaded state
pub struct Session {
    /// The commodity pool shared by journal and reports
    pub pool: PoolRef,
    /// The parsed journal
    pub journal: JournalRef,
}

impl Session {
    /// A session with an empty journal, for precommands
    pub fn empty() -> Self {
        let pool: PoolRef = Rc::new(RefCell::new(CommodityPool::new()));
        let journal = Journal::new(pool.clone());
        Self { pool, journal: Rc::new(journal) }
    }

    /// Parse the journal files (or `TALLY_FILE`) and the price database
    pub fn load(
        files: &[PathBuf],
        input_date_format: Option<&str>,
        price_db: Option<&str>,
    ) -> Result<Self> {
        let mut files: Vec<PathBuf> = files.to_vec();
        if files.is_empty() {
            if let Ok(path) = env::var("TALLY_FILE") {
                files.push(PathBuf::from(path));
            }
        }
        if files.is_empty() {
            bail!("no journal file specified (use --file or set TALLY_FILE)");
        }

        let mut text = String::new();
        for file in &files {
            let piece = fs::read_to_string(file)
                .with_context(|| format!("cannot read journal file {}", file.display()))?;
            text.push_str(&piece);
            if !text.ends_with('\n') {
                text.push('\n');
            }
        }

        let pool: PoolRef = Rc::new(RefCell::new(CommodityPool::new()));
        let mut parser =
            JournalParser::new(pool.clone()).with_date_format(input_date_format.map(String::from));
        let journal = parser.parse_journal(&text).map_err(|e| anyhow!("{e}"))?;
        info!("loaded {} entries from {} file(s)", journal.entries.len(), files.len());

        if let Some(path) = price_db {
            let prices = fs::read_to_string(path)
                .with_context(|| format!("cannot read price database {path}"))?;
            // the price database is a journal of nothing but P directives;
            // parsing it against the shared pool records every quote
            JournalParser::new(pool.clone())
                .parse_journal(&prices)
                .map_err(|e| anyhow!("price database {path}: {e}"))?;
        }

        Ok(Self { pool, journal: Rc::new(journal) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_journal_and_price_db() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal_path = dir.path().join("test.dat");
        let prices_path = dir.path().join("prices.db");
        let mut journal = fs::File::create(&journal_path).unwrap();
        writeln!(journal, "2009/01/01 Broker").unwrap();
        writeln!(journal, "    Assets:Stock    10 STK @ 5.00 USD").unwrap();
        writeln!(journal, "    Assets:Cash").unwrap();
        let mut prices = fs::File::create(&prices_path).unwrap();
        writeln!(prices, "P 2009/02/01 STK 6.00 USD").unwrap();

        let session = Session::load(
            &[journal_path],
            None,
            Some(prices_path.to_str().unwrap()),
        )
        .unwrap();
        assert_eq!(session.journal.entries.len(), 1);
        let pool = session.pool.borrow();
        let feb = chrono::NaiveDate::from_ymd_opt(2009, 2, 15).unwrap();
        assert_eq!(pool.price_at("STK", feb).unwrap().price.to_string(), "6.00 USD");
    }

    #[test]
    fn missing_journal_is_an_error() {
        std::env::remove_var("TALLY_FILE");
        assert!(Session::load(&[], None, None).is_err());
    }
}
