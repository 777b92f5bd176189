//! tally: a plain-text double-entry accounting reporter
//!
//! The command is the first bare word; options resolve through the report
//! lookup table, so `tally --monthly register Food` and
//! `tally reg -M Food` mean the same thing.

use std::env;
use std::io;
use std::process;

use anyhow::{anyhow, bail, Result};

mod args;
mod dispatch;
mod session;

use session::Session;
use tally_core::report::{self, Binding, OptionKind, Report};

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(error) => {
            eprintln!("Error: {error:#}");
            process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let argv: Vec<String> = env::args().skip(1).collect();
    let scan = args::scan(&argv)?;

    let Some(command_word) = scan.words.first().cloned() else {
        bail!("no command given (try balance, register, print or equity)");
    };
    let query: Vec<String> = scan.words[1..].to_vec();

    // precommands run without loading a journal
    if let Some(Binding::Precommand(precmd)) =
        report::lookup(&format!("ledger_precmd_{command_word}"))
    {
        let session = Session::empty();
        let mut report = Report::new(session.journal.clone());
        apply_options(&mut report, &scan.options)?;
        report
            .run_precommand(precmd, &query, &mut io::stdout())
            .map_err(|e| anyhow!("{e}"))?;
        return Ok(0);
    }

    let Some(Binding::Command(command)) = report::lookup(&format!("ledger_cmd_{command_word}"))
    else {
        bail!("unrecognized command '{command_word}'");
    };

    // a couple of options steer loading itself and are fished out early
    let input_date_format = last_arg(&scan.options, OptionKind::InputDateFormat);
    let price_db = last_arg(&scan.options, OptionKind::PriceDb);

    let session =
        Session::load(&scan.files, input_date_format.as_deref(), price_db.as_deref())?;
    log::debug!("{} commodities in the pool", session.pool.borrow().commodities().len());
    let mut report = Report::new(session.journal.clone());
    apply_options(&mut report, &scan.options)?;
    report.reconcile_balance = scan.reconcile.clone();
    report.reconcile_date = scan.reconcile_date.clone();

    let query_predicate = report::args_to_predicate(&query);
    if !query_predicate.is_empty() {
        report.append_predicate(&query_predicate);
    }

    let out = dispatch::output_stream(&report)?;
    dispatch::execute(&report, command, out)?;
    Ok(0)
}

fn apply_options(report: &mut Report, options: &[(OptionKind, Option<String>)]) -> Result<()> {
    for (kind, arg) in options {
        report.process_option(*kind, arg.as_deref()).map_err(|e| anyhow!("{e}"))?;
    }
    Ok(())
}

fn last_arg(options: &[(OptionKind, Option<String>)], wanted: OptionKind) -> Option<String> {
    options.iter().rev().find(|(kind, _)| *kind == wanted).and_then(|(_, arg)| arg.clone())
}
