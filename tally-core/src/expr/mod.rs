//! Value expressions
//!
//! A small arithmetic/predicate language over postings, accounts, amounts
//! and dates. Stages consult it for predicates, sort keys and the
//! amount/total expressions; identifiers resolve against a [`Scope`]
//! supplied by the report.

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use thiserror::Error;

use tally_math::{Amount, AmountError, Balance};

pub mod format;
pub mod parser;
pub mod predicate;

pub use parser::{parse, Expr};
pub use predicate::Predicate;

/// Errors raised while parsing or evaluating expressions
#[derive(Error, Debug)]
pub enum ExprError {
    /// Malformed expression text
    #[error("cannot parse expression: {0}")]
    Parse(String),
    /// Identifier not known to the active scope
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    /// Function not known to the active scope
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    /// Operation applied to incompatible values
    #[error("cannot apply '{op}' to {lhs} and {rhs}")]
    TypeMismatch {
        /// Operator name
        op: &'static str,
        /// Left operand type
        lhs: &'static str,
        /// Right operand type
        rhs: &'static str,
    },
    /// Amount arithmetic failure (mixed commodities and the like)
    #[error(transparent)]
    Amount(#[from] AmountError),
    /// Malformed regular expression literal
    #[error("bad regular expression: {0}")]
    Regex(String),
}

/// The result of evaluating an expression
#[derive(Debug, Clone)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// Machine integer (depths, counts)
    Int(i64),
    /// Single-commodity amount
    Amount(Amount),
    /// Multi-commodity balance
    Balance(Balance),
    /// Text
    String(String),
    /// Calendar date
    Date(NaiveDate),
    /// Timestamp
    DateTime(NaiveDateTime),
    /// Sequence of values
    Seq(Vec<Value>),
}

impl Value {
    /// Truthiness for predicates and logical operators
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Amount(a) => !a.is_zero(),
            Value::Balance(b) => !b.is_zero(),
            Value::String(s) => !s.is_empty(),
            Value::Date(_) | Value::DateTime(_) => true,
            Value::Seq(seq) => !seq.is_empty(),
        }
    }

    /// Type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Amount(_) => "amount",
            Value::Balance(_) => "balance",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Seq(_) => "sequence",
        }
    }

    /// Coerce to a balance; only numeric values qualify
    pub fn to_balance(&self) -> Result<Balance, ExprError> {
        match self {
            Value::Amount(a) => Ok(Balance::from_amount(a)),
            Value::Balance(b) => Ok(b.clone()),
            Value::Int(i) => Ok(Balance::from_amount(&Amount::from_i64(*i))),
            other => Err(ExprError::TypeMismatch {
                op: "sum",
                lhs: other.type_name(),
                rhs: "balance",
            }),
        }
    }

    /// Addition with commodity promotion: mismatched amounts become balances
    pub fn add(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Amount(a), Value::Amount(b)) => match a.checked_add(b) {
                Ok(sum) => Ok(Value::Amount(sum)),
                Err(AmountError::CommodityMismatch(_, _)) => {
                    let mut balance = Balance::from_amount(a);
                    balance.add_amount(b);
                    Ok(Value::Balance(balance))
                }
                Err(e) => Err(e.into()),
            },
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Seq(a), Value::Seq(b)) => {
                let mut seq = a.clone();
                seq.extend(b.iter().cloned());
                Ok(Value::Seq(seq))
            }
            (Value::Balance(_), _) | (_, Value::Balance(_)) => {
                let mut balance = self.to_balance()?;
                balance.add_balance(&other.to_balance()?);
                Ok(Value::Balance(balance))
            }
            (Value::Int(_), Value::Amount(_)) | (Value::Amount(_), Value::Int(_)) => {
                Value::Amount(self.as_amount()?).add(&Value::Amount(other.as_amount()?))
            }
            _ => Err(self.mismatch("+", other)),
        }
    }

    /// Subtraction via negated addition
    pub fn sub(&self, other: &Value) -> Result<Value, ExprError> {
        self.add(&other.negated()?)
    }

    /// Multiplication
    pub fn mul(&self, other: &Value) -> Result<Value, ExprError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a * b)),
            _ => {
                let a = self.as_amount()?;
                let b = other.as_amount()?;
                Ok(Value::Amount(a.multiplied_by(&b)))
            }
        }
    }

    /// Division; errors on zero divisors
    pub fn div(&self, other: &Value) -> Result<Value, ExprError> {
        let a = self.as_amount()?;
        let b = other.as_amount()?;
        Ok(Value::Amount(a.divided_by(&b)?))
    }

    /// Negation for numeric values
    pub fn negated(&self) -> Result<Value, ExprError> {
        match self {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Amount(a) => Ok(Value::Amount(a.negated())),
            Value::Balance(b) => Ok(Value::Balance(b.negated())),
            other => Err(other.mismatch("-", other)),
        }
    }

    /// Ordering where one is defined; incomparable pairs yield `None`
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Amount(a), Value::Amount(b)) => a.partial_cmp(b),
            (Value::Int(_), Value::Amount(_)) | (Value::Amount(_), Value::Int(_)) => {
                let a = self.as_amount().ok()?;
                let b = other.as_amount().ok()?;
                a.partial_cmp(&b)
            }
            (Value::Balance(a), _) => {
                let b = other.to_balance().ok()?;
                compare_balances(a, &b)
            }
            (_, Value::Balance(b)) => {
                let a = self.to_balance().ok()?;
                compare_balances(&a, b)
            }
            _ => None,
        }
    }

    /// The value as a display string (without quoting)
    pub fn as_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn as_amount(&self) -> Result<Amount, ExprError> {
        match self {
            Value::Amount(a) => Ok(a.clone()),
            Value::Int(i) => Ok(Amount::from_i64(*i)),
            Value::Balance(b) => match b.single_amount() {
                Some(a) => Ok(a.clone()),
                None if b.is_empty() => Ok(Amount::zero()),
                None => Err(ExprError::TypeMismatch {
                    op: "amount",
                    lhs: "balance",
                    rhs: "amount",
                }),
            },
            other => {
                Err(ExprError::TypeMismatch { op: "amount", lhs: other.type_name(), rhs: "amount" })
            }
        }
    }

    fn mismatch(&self, op: &'static str, other: &Value) -> ExprError {
        ExprError::TypeMismatch { op, lhs: self.type_name(), rhs: other.type_name() }
    }
}

fn compare_balances(a: &Balance, b: &Balance) -> Option<Ordering> {
    match (a.single_amount(), b.single_amount()) {
        (Some(x), Some(y)) => x.partial_cmp(y),
        _ if a.is_empty() && b.is_empty() => Some(Ordering::Equal),
        (Some(x), None) if b.is_empty() => x.partial_cmp(&Amount::zero()),
        (None, Some(y)) if a.is_empty() => Amount::zero().partial_cmp(y),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Amount(a) => write!(f, "{}", a),
            Value::Balance(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y/%m/%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y/%m/%d %H:%M:%S")),
            Value::Seq(seq) => {
                write!(f, "(")?;
                for (i, v) in seq.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Name resolution for expression evaluation
///
/// Scopes nest by explicit delegation: a posting scope falls back to its
/// report, which falls back to the session. Child scopes borrow their
/// parent and never outlive it.
pub trait Scope {
    /// Resolve an identifier to a value
    fn resolve(&self, name: &str) -> Result<Value, ExprError>;

    /// Invoke a named function over evaluated arguments
    fn call(&self, name: &str, _args: &[Value]) -> Result<Value, ExprError> {
        Err(ExprError::UnknownFunction(name.to_string()))
    }
}

/// A scope that knows only the current date
pub struct BaseScope {
    /// "today" / "m"
    pub today: NaiveDate,
}

impl Scope for BaseScope {
    fn resolve(&self, name: &str) -> Result<Value, ExprError> {
        match name {
            "today" | "m" => Ok(Value::Date(self.today)),
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(ExprError::UnknownIdentifier(name.to_string())),
        }
    }
}

/// Evaluate an expression against a scope
pub fn eval(expr: &Expr, scope: &dyn Scope) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => scope.resolve(name),
        // a bare regex matches the account path, as in query strings
        Expr::Regex(re) => {
            let account = scope.resolve("account")?;
            Ok(Value::Bool(re.is_match(&account.as_string())))
        }
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, scope)?.is_truthy())),
        Expr::Neg(inner) => eval(inner, scope)?.negated(),
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, scope),
        Expr::Call(name, args) => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval(arg, scope)?);
            }
            call_builtin(name, &evaluated).unwrap_or_else(|| scope.call(name, &evaluated))
        }
    }
}

fn eval_binary(
    op: parser::BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &dyn Scope,
) -> Result<Value, ExprError> {
    use parser::BinaryOp::*;
    match op {
        And => {
            let left = eval(lhs, scope)?;
            if !left.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(rhs, scope)?.is_truthy()))
        }
        Or => {
            let left = eval(lhs, scope)?;
            if left.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(rhs, scope)?.is_truthy()))
        }
        Match | NotMatch => {
            let subject = match lhs {
                // "=~ /re/" with no subject defaults to the account
                Expr::Regex(_) => scope.resolve("account")?,
                other => eval(other, scope)?,
            };
            let matched = match rhs {
                Expr::Regex(re) => re.is_match(&subject.as_string()),
                other => {
                    let pattern = eval(other, scope)?.as_string();
                    let re = Regex::new(&pattern).map_err(|e| ExprError::Regex(e.to_string()))?;
                    re.is_match(&subject.as_string())
                }
            };
            Ok(Value::Bool(if op == Match { matched } else { !matched }))
        }
        _ => {
            let left = eval(lhs, scope)?;
            let right = eval(rhs, scope)?;
            match op {
                Add => left.add(&right),
                Sub => left.sub(&right),
                Mul => left.mul(&right),
                Div => left.div(&right),
                Eq => Ok(Value::Bool(left.compare(&right) == Some(Ordering::Equal))),
                Ne => Ok(Value::Bool(left.compare(&right) != Some(Ordering::Equal))),
                Lt => Ok(Value::Bool(left.compare(&right) == Some(Ordering::Less))),
                Le => Ok(Value::Bool(matches!(
                    left.compare(&right),
                    Some(Ordering::Less) | Some(Ordering::Equal)
                ))),
                Gt => Ok(Value::Bool(left.compare(&right) == Some(Ordering::Greater))),
                Ge => Ok(Value::Bool(matches!(
                    left.compare(&right),
                    Some(Ordering::Greater) | Some(Ordering::Equal)
                ))),
                And | Or | Match | NotMatch => unreachable!("handled above"),
            }
        }
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Option<Result<Value, ExprError>> {
    match (name, args) {
        ("abs", [value]) => Some(match value {
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::Amount(a) => Ok(Value::Amount(a.abs())),
            other => {
                Err(ExprError::TypeMismatch { op: "abs", lhs: other.type_name(), rhs: "amount" })
            }
        }),
        ("truncate", [value, width]) => {
            let width = match width {
                Value::Int(i) => Some(*i),
                Value::Amount(a) => a.to_i64(),
                _ => None,
            };
            match width {
                Some(width) => {
                    let text: String =
                        value.as_string().chars().take(width.max(0) as usize).collect();
                    Some(Ok(Value::String(text)))
                }
                None => Some(Err(ExprError::TypeMismatch {
                    op: "truncate",
                    lhs: "string",
                    rhs: "integer",
                })),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(text: &str) -> Value {
        let expr = parse(text).unwrap();
        let scope = BaseScope { today: NaiveDate::from_ymd_opt(2009, 6, 1).unwrap() };
        eval(&expr, &scope).unwrap()
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert!(eval_str("1 + 2 == 3").is_truthy());
        assert!(eval_str("10 / 4 == 2.5").is_truthy());
        assert!(!eval_str("2 > 3").is_truthy());
        assert!(eval_str("-(5) < 0").is_truthy());
    }

    #[test]
    fn logic_short_circuits() {
        // the unknown identifier on the right must never be resolved
        assert!(eval_str("true | nonsense").is_truthy());
        assert!(!eval_str("false & nonsense").is_truthy());
    }

    #[test]
    fn date_literals_compare() {
        assert!(eval_str("[2009/05/01] < today").is_truthy());
    }

    #[test]
    fn mismatched_amount_addition_promotes_to_balance() {
        use tally_math::{CommodityPool, CommodityFlags};
        let mut pool = CommodityPool::new();
        let usd = pool.find_or_create("USD");
        usd.observe(2, CommodityFlags::STYLE_SUFFIXED | CommodityFlags::STYLE_SEPARATED);
        let eur = pool.find_or_create("EUR");
        eur.observe(2, CommodityFlags::STYLE_SUFFIXED | CommodityFlags::STYLE_SEPARATED);

        let a = Value::Amount(Amount::from_i64(1).with_commodity(usd));
        let b = Value::Amount(Amount::from_i64(2).with_commodity(eur));
        match a.add(&b).unwrap() {
            Value::Balance(balance) => assert_eq!(balance.commodity_count(), 2),
            other => panic!("expected balance, got {}", other.type_name()),
        }
    }
}
