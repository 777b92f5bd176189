//! Format strings
//!
//! The `%`-placeholder mini language the formatters consume. A format
//! string has two halves separated by `%/`: the first applies to the first
//! posting of an entry, the second to the rest (so register output shows
//! the date and payee once per entry). Placeholders take optional
//! `-`/width/`.precision` modifiers, like `%-.20P`.
//!
//! Codes: `%D` date, `%P` payee, `%A` account, `%t` display amount,
//! `%T` running total, `%N` note, `%%` a literal percent.

/// One piece of a parsed format string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatElement {
    /// Verbatim text
    Literal(String),
    /// A `%` placeholder with its modifiers
    Field {
        /// Placeholder code (`D`, `P`, `A`, `t`, `T`, `N`)
        code: char,
        /// `-` modifier: left-justify
        left: bool,
        /// Minimum width (pad)
        min_width: usize,
        /// `.N` modifier: maximum width (truncate)
        max_width: Option<usize>,
    },
}

/// A parsed format string: first-line elements, continuation elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    /// Elements for an entry's first posting
    pub first: Vec<FormatElement>,
    /// Elements for its remaining postings; `None` reuses `first`
    pub next: Option<Vec<FormatElement>>,
}

impl FormatSpec {
    /// Parse format text; errors name the offending placeholder
    pub fn parse(text: &str) -> Result<FormatSpec, String> {
        let halves: Vec<&str> = text.splitn(2, "%/").collect();
        let first = parse_elements(halves[0])?;
        let next = match halves.get(1) {
            Some(rest) => Some(parse_elements(rest)?),
            None => None,
        };
        Ok(FormatSpec { first, next })
    }

    /// Elements for a posting, given whether it starts its entry
    pub fn elements(&self, first_of_entry: bool) -> &[FormatElement] {
        if first_of_entry {
            &self.first
        } else {
            self.next.as_deref().unwrap_or(&self.first)
        }
    }
}

fn parse_elements(text: &str) -> Result<Vec<FormatElement>, String> {
    let mut elements = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => literal.push('\n'),
                Some('t') => literal.push('\t'),
                Some(other) => literal.push(other),
                None => return Err("dangling backslash".to_string()),
            },
            '%' => {
                if chars.peek() == Some(&'%') {
                    chars.next();
                    literal.push('%');
                    continue;
                }
                if !literal.is_empty() {
                    elements.push(FormatElement::Literal(std::mem::take(&mut literal)));
                }
                let mut left = false;
                if chars.peek() == Some(&'-') {
                    chars.next();
                    left = true;
                }
                let mut min_width = 0usize;
                while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
                    let digit = chars.next().expect("peeked digit");
                    min_width = min_width * 10 + digit.to_digit(10).expect("digit") as usize;
                }
                let mut max_width = None;
                if chars.peek() == Some(&'.') {
                    chars.next();
                    let mut width = 0usize;
                    while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
                        let digit = chars.next().expect("peeked digit");
                        width = width * 10 + digit.to_digit(10).expect("digit") as usize;
                    }
                    max_width = Some(width);
                }
                match chars.next() {
                    Some(code @ ('D' | 'P' | 'A' | 't' | 'T' | 'N')) => {
                        elements.push(FormatElement::Field { code, left, min_width, max_width });
                    }
                    Some(other) => return Err(format!("unknown format code '%{other}'")),
                    None => return Err("format string ends inside a placeholder".to_string()),
                }
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        elements.push(FormatElement::Literal(literal));
    }
    Ok(elements)
}

/// Apply width and truncation modifiers to rendered text
pub fn pad(text: &str, left: bool, min_width: usize, max_width: Option<usize>) -> String {
    let mut out = text.to_string();
    if let Some(max) = max_width {
        if out.chars().count() > max {
            out = out.chars().take(max).collect();
        }
    }
    let len = out.chars().count();
    if len < min_width {
        let fill = " ".repeat(min_width - len);
        if left {
            out.push_str(&fill);
        } else {
            out = format!("{fill}{out}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_register_shape() {
        let spec = FormatSpec::parse("%D %-.20P %-.22A %12t %12T\n%/%-32P %-.22A %12t %12T\n")
            .unwrap();
        assert!(spec.next.is_some());
        match &spec.first[0] {
            FormatElement::Field { code: 'D', .. } => {}
            other => panic!("expected date field, got {other:?}"),
        }
        match &spec.first[2] {
            FormatElement::Field { code: 'P', left: true, max_width: Some(20), .. } => {}
            other => panic!("expected payee field, got {other:?}"),
        }
    }

    #[test]
    fn escapes_and_percent() {
        let spec = FormatSpec::parse("%%\\t%D\\n").unwrap();
        assert_eq!(spec.first[0], FormatElement::Literal("%\t".to_string()));
        assert!(spec.next.is_none());
    }

    #[test]
    fn rejects_unknown_codes() {
        assert!(FormatSpec::parse("%Z").is_err());
        assert!(FormatSpec::parse("%").is_err());
    }

    #[test]
    fn padding_and_truncation() {
        assert_eq!(pad("abc", false, 5, None), "  abc");
        assert_eq!(pad("abc", true, 5, None), "abc  ");
        assert_eq!(pad("abcdef", true, 0, Some(4)), "abcd");
    }
}
