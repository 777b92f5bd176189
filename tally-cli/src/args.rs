//! Argument scanning through the report lookup table
//!
//! There is no separate option grammar: every option resolves through the
//! same name table value expressions and formats use. For `--name` the
//! scanner tries `opt_name_` (argument-taking) before `opt_name`, then the
//! same pair with dashes folded to underscores, mirroring the table's
//! historical spelling mix. The first bare word is the command; the rest
//! are query terms.

use std::path::PathBuf;

use anyhow::{bail, Result};

use tally_core::report::{lookup, Binding, OptionKind};

/// The scanned command line
#[derive(Debug, Default)]
pub struct Scan {
    /// Journal files from `--file` / `-f`
    pub files: Vec<PathBuf>,
    /// Option setters in order of appearance
    pub options: Vec<(OptionKind, Option<String>)>,
    /// Command word followed by query terms
    pub words: Vec<String>,
    /// Reconciliation target from `--reconcile`
    pub reconcile: Option<String>,
    /// Reconciliation cutoff from `--reconcile-date`
    pub reconcile_date: Option<String>,
}

fn lookup_option(name: &str) -> Option<(OptionKind, bool)> {
    let folded = name.replace('-', "_");
    for candidate in [
        format!("opt_{name}_"),
        format!("opt_{name}"),
        format!("opt_{folded}_"),
        format!("opt_{folded}"),
    ] {
        if let Some(Binding::Option(kind, takes_arg)) = lookup(&candidate) {
            return Some((kind, takes_arg));
        }
    }
    None
}

/// Scan argv into files, option setters and words
pub fn scan(argv: &[String]) -> Result<Scan> {
    let mut scan = Scan::default();
    let mut iter = argv.iter().peekable();

    while let Some(arg) = iter.next() {
        if let Some(long) = arg.strip_prefix("--") {
            if long.is_empty() {
                // query separator, meaningful to the predicate builder
                scan.words.push("--".to_string());
                continue;
            }
            let (name, inline_value) = match long.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (long, None),
            };
            // session-level options that live outside the report table
            if matches!(name, "file" | "reconcile" | "reconcile-date") {
                let value = match inline_value {
                    Some(v) => v,
                    None => match iter.next() {
                        Some(v) => v.clone(),
                        None => bail!("--{name} requires an argument"),
                    },
                };
                match name {
                    "file" => scan.files.push(PathBuf::from(value)),
                    "reconcile" => scan.reconcile = Some(value),
                    _ => scan.reconcile_date = Some(value),
                }
                continue;
            }
            let Some((kind, takes_arg)) = lookup_option(name) else {
                bail!("unrecognized option '--{name}'");
            };
            let value = if takes_arg {
                match inline_value {
                    Some(v) => Some(v),
                    None => match iter.next() {
                        Some(v) => Some(v.clone()),
                        None => bail!("option '--{name}' requires an argument"),
                    },
                }
            } else {
                inline_value
            };
            scan.options.push((kind, value));
        } else if let Some(short) = arg.strip_prefix('-') {
            if short.is_empty() {
                scan.words.push(arg.clone());
                continue;
            }
            if short == "f" {
                match iter.next() {
                    Some(v) => scan.files.push(PathBuf::from(v)),
                    None => bail!("-f requires an argument"),
                }
                continue;
            }
            let Some((kind, takes_arg)) = lookup_option(short) else {
                bail!("unrecognized option '-{short}'");
            };
            let value = if takes_arg {
                match iter.next() {
                    Some(v) => Some(v.clone()),
                    None => bail!("option '-{short}' requires an argument"),
                }
            } else {
                None
            };
            scan.options.push((kind, value));
        } else {
            scan.words.push(arg.clone());
        }
    }

    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_args(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn scans_command_options_and_query() {
        let scan = scan(&to_args("-f j.dat register --monthly --limit cleared Food")).unwrap();
        assert_eq!(scan.files, vec![PathBuf::from("j.dat")]);
        assert_eq!(scan.words, vec!["register", "Food"]);
        assert_eq!(scan.options.len(), 2);
        assert_eq!(scan.options[0].0, OptionKind::Monthly);
        assert_eq!(scan.options[1], (OptionKind::Limit, Some("cleared".to_string())));
    }

    #[test]
    fn short_aliases_resolve_like_long_names() {
        let scan = scan(&to_args("reg -M -C -b 2009/01/01")).unwrap();
        assert_eq!(scan.options[0].0, OptionKind::Monthly);
        assert_eq!(scan.options[1].0, OptionKind::Cleared);
        assert_eq!(scan.options[2], (OptionKind::Begin, Some("2009/01/01".to_string())));
    }

    #[test]
    fn dashes_fold_to_match_underscore_rows() {
        let scan = scan(&to_args("reg --price-db prices.db --sort-entries date")).unwrap();
        assert_eq!(scan.options[0], (OptionKind::PriceDb, Some("prices.db".to_string())));
        assert_eq!(scan.options[1], (OptionKind::SortEntries, Some("date".to_string())));
    }

    #[test]
    fn inline_values_work() {
        let scan = scan(&to_args("reg --limit=cleared")).unwrap();
        assert_eq!(scan.options[0], (OptionKind::Limit, Some("cleared".to_string())));
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(scan(&to_args("reg --frobnicate")).is_err());
        assert!(scan(&to_args("reg -Z")).is_err());
    }

    #[test]
    fn reconcile_options_are_session_level() {
        let scan = scan(&to_args("reg --reconcile 0 --reconcile-date 2009/06/01 Bank")).unwrap();
        assert_eq!(scan.reconcile.as_deref(), Some("0"));
        assert_eq!(scan.reconcile_date.as_deref(), Some("2009/06/01"));
        assert!(scan.options.is_empty());
    }

    #[test]
    fn double_dash_stays_a_query_separator() {
        let scan = scan(&to_args("reg Food -- Store")).unwrap();
        assert_eq!(scan.words, vec!["reg", "Food", "--", "Store"]);
    }

    #[test]
    fn ignored_diagnostics_options_are_accepted() {
        let scan = scan(&to_args("reg --verbose --debug filters")).unwrap();
        assert_eq!(scan.options.len(), 2);
        assert!(scan.options.iter().all(|(k, _)| *k == OptionKind::Ignored));
    }
}
