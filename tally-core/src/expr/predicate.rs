//! Predicates: expressions used as keep/drop filters

use super::{eval, parse, Expr, ExprError, Scope};

/// An expression wrapped for truthiness testing
///
/// Empty text is the always-true predicate, so option plumbing can pass
/// predicate strings around without special-casing "no filter".
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    text: String,
    expr: Option<Expr>,
}

impl Predicate {
    /// Compile predicate text; empty text never filters
    pub fn new(text: &str) -> Result<Self, ExprError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self { text: trimmed.to_string(), expr: Some(parse(trimmed)?) })
    }

    /// Whether this predicate passes everything
    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    /// The original text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate against a scope
    pub fn matches(&self, scope: &dyn Scope) -> Result<bool, ExprError> {
        match &self.expr {
            None => Ok(true),
            Some(expr) => Ok(eval(expr, scope)?.is_truthy()),
        }
    }
}

/// AND two predicate texts together, treating empty as absent
pub fn conjoin(existing: &str, term: &str) -> String {
    if existing.trim().is_empty() {
        term.to_string()
    } else if term.trim().is_empty() {
        existing.to_string()
    } else {
        format!("({existing})&({term})")
    }
}
