//! Command execution: formatter selection, drivers, pager plumbing

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use log::debug;

use tally_core::output::{
    BalanceFormatter, EquityFormatter, PrintFormatter, RegisterFormatter,
};
use tally_core::report::{Report, ReportCommand};

/// Run a report command with the appropriate terminal formatter
pub fn execute(report: &Report, command: ReportCommand, out: Box<dyn Write>) -> Result<()> {
    debug!("dispatching {command:?}");
    let run = || -> Result<(), tally_core::report::ReportError> {
        match command {
            ReportCommand::Register => {
                let formatter = RegisterFormatter::new(out, report)?;
                report.posting_report(Box::new(formatter))
            }
            ReportCommand::Print => {
                let formatter = PrintFormatter::new(out, report);
                report.posting_report(Box::new(formatter))
            }
            ReportCommand::Balance => {
                let formatter = BalanceFormatter::new(out, report)?;
                report.account_report(Box::new(formatter))
            }
            ReportCommand::Equity => {
                let formatter = EquityFormatter::new(out, report);
                report.account_report(Box::new(formatter))
            }
        }
    };
    run().map_err(|e| anyhow!("{e}"))
}

/// Where output goes: the pager when configured and talking to a TTY
pub fn output_stream(report: &Report) -> Result<Box<dyn Write>> {
    if let Some(pager) = &report.pager {
        if atty::is(atty::Stream::Stdout) {
            return Ok(Box::new(PagerWriter::spawn(pager)?));
        }
    }
    Ok(Box::new(io::stdout()))
}

/// Writer that pipes into a pager process and waits for it on drop
struct PagerWriter {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl PagerWriter {
    fn spawn(command_line: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace();
        let program = words.next().context("empty pager command")?;
        let mut child = Command::new(program)
            .args(words)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("cannot start pager '{command_line}'"))?;
        let stdin = child.stdin.take();
        Ok(Self { child, stdin })
    }
}

impl Write for PagerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stdin {
            Some(stdin) => stdin.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stdin {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PagerWriter {
    fn drop(&mut self) {
        // close the pipe so the pager sees EOF, then let it finish
        self.stdin.take();
        let _ = self.child.wait();
    }
}
