//! Expression tokenizer and recursive-descent parser

use regex::Regex;
use tally_math::Amount;

use super::{ExprError, Value};
use crate::datetime;

/// Binary operators in precedence groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `|` / `||`
    Or,
    /// `&` / `&&`
    And,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `=~`
    Match,
    /// `!~`
    NotMatch,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

/// Parsed expression tree
#[derive(Debug, Clone)]
pub enum Expr {
    /// Literal value (number, string, date)
    Literal(Value),
    /// Identifier resolved by the scope at evaluation time
    Ident(String),
    /// Regex literal; bare occurrences match the account path
    Regex(Regex),
    /// Logical negation
    Not(Box<Expr>),
    /// Arithmetic negation
    Neg(Box<Expr>),
    /// Binary operation
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Function call
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Regex(String),
    Date(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return Err(ExprError::Parse(format!("unterminated string in '{text}'")));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '/' => {
                // a slash opens a regex except straight after an operand
                let after_operand = matches!(
                    tokens.last(),
                    Some(Token::Ident(_))
                        | Some(Token::Number(_))
                        | Some(Token::Str(_))
                        | Some(Token::RParen)
                        | Some(Token::Date(_))
                );
                if after_operand {
                    tokens.push(Token::Op("/"));
                    i += 1;
                } else {
                    let mut s = String::new();
                    i += 1;
                    while i < chars.len() && chars[i] != '/' {
                        if chars[i] == '\\' && i + 1 < chars.len() && chars[i + 1] == '/' {
                            s.push('/');
                            i += 2;
                        } else {
                            s.push(chars[i]);
                            i += 1;
                        }
                    }
                    if i == chars.len() {
                        return Err(ExprError::Parse(format!("unterminated regex in '{text}'")));
                    }
                    i += 1;
                    tokens.push(Token::Regex(s));
                }
            }
            '[' => {
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != ']' {
                    s.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return Err(ExprError::Parse(format!("unterminated date in '{text}'")));
                }
                i += 1;
                tokens.push(Token::Date(s));
            }
            '=' => {
                if chars.get(i + 1) == Some(&'~') {
                    tokens.push(Token::Op("=~"));
                    i += 2;
                } else if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("=="));
                    i += 2;
                } else {
                    return Err(ExprError::Parse(format!("stray '=' in '{text}'")));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'~') {
                    tokens.push(Token::Op("!~"));
                    i += 2;
                } else if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("!="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("!"));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("<="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("<"));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(">="));
                    i += 2;
                } else {
                    tokens.push(Token::Op(">"));
                    i += 1;
                }
            }
            '&' => {
                i += if chars.get(i + 1) == Some(&'&') { 2 } else { 1 };
                tokens.push(Token::Op("&"));
            }
            '|' => {
                i += if chars.get(i + 1) == Some(&'|') { 2 } else { 1 };
                tokens.push(Token::Op("|"));
            }
            '+' => {
                tokens.push(Token::Op("+"));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op("*"));
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Number(s));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Ident(s));
            }
            other => return Err(ExprError::Parse(format!("stray '{other}' in '{text}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Op("|"))) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.rel_expr()?;
        while matches!(self.peek(), Some(Token::Op("&"))) {
            self.pos += 1;
            let rhs = self.rel_expr()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn rel_expr(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Ne,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Le,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Ge,
            Some(Token::Op("=~")) => BinaryOp::Match,
            Some(Token::Op("!~")) => BinaryOp::NotMatch,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.add_expr()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn add_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => BinaryOp::Add,
                Some(Token::Op("-")) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.mul_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => BinaryOp::Mul,
                Some(Token::Op("/")) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary_expr()?)))
            }
            Some(Token::Op("-")) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary_expr()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(text)) => {
                let amount = Amount::parse_quantity(&text).map_err(|e| {
                    ExprError::Parse(format!("bad number '{text}': {e}"))
                })?;
                Ok(Expr::Literal(Value::Amount(amount)))
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Date(s)) => {
                let date = datetime::parse_date(&s)
                    .ok_or_else(|| ExprError::Parse(format!("bad date literal '[{s}]'")))?;
                Ok(Expr::Literal(Value::Date(date)))
            }
            Some(Token::Regex(s)) => {
                let re = Regex::new(&s).map_err(|e| ExprError::Regex(e.to_string()))?;
                Ok(Expr::Regex(re))
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.or_expr()?);
                            match self.advance() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                _ => {
                                    return Err(ExprError::Parse(format!(
                                        "unterminated call to '{name}'"
                                    )))
                                }
                            }
                        }
                    } else {
                        self.pos += 1;
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Parse("missing closing paren".to_string())),
                }
            }
            other => Err(ExprError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parse expression text into a tree
pub fn parse(text: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!("trailing junk in '{text}'")));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_predicate_shapes() {
        assert!(parse("account =~ /Food/").is_ok());
        assert!(parse("(date >= [2009/01/01]) & (date < [2009/02/01])").is_ok());
        assert!(parse("amount > 10 | cleared").is_ok());
        assert!(parse("!cleared & payee =~ /Store/").is_ok());
        assert!(parse("abs(amount) > 5").is_ok());
    }

    #[test]
    fn bare_regex_is_a_term() {
        match parse("/Food/").unwrap() {
            Expr::Regex(_) => {}
            other => panic!("expected regex term, got {other:?}"),
        }
    }

    #[test]
    fn slash_after_operand_divides() {
        match parse("amount / 2").unwrap() {
            Expr::Binary(BinaryOp::Div, _, _) => {}
            other => panic!("expected division, got {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("account =~").is_err());
        assert!(parse("((amount)").is_err());
        assert!(parse("amount ?").is_err());
        assert!(parse("\"open").is_err());
    }
}
