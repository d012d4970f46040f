//! Safe parser for list literals such as `["yes", 'no', "later"]`.
//!
//! Accepts single- or double-quoted strings (with backslash escapes), bare
//! numbers, surrounding whitespace and a trailing comma. Nothing is evaluated.

use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListLiteralError {
    #[error("list literal must start with '['")]
    MissingOpen,
    #[error("unterminated list literal")]
    Unterminated,
    #[error("unterminated string in list literal")]
    UnterminatedString,
    #[error("unexpected character {0:?} in list literal")]
    Unexpected(char),
    #[error("trailing characters after list literal")]
    Trailing,
}

/// Parse a flat list of strings.
pub fn parse_list_literal(input: &str) -> Result<Vec<String>, ListLiteralError> {
    let mut chars = input.trim().chars().peekable();
    if chars.next() != Some('[') {
        return Err(ListLiteralError::MissingOpen);
    }

    let mut items = Vec::new();
    loop {
        skip_whitespace(&mut chars);
        match chars.peek().copied() {
            None => return Err(ListLiteralError::Unterminated),
            Some(']') => {
                chars.next();
                break;
            }
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                items.push(read_quoted(&mut chars, quote)?);
            }
            Some(c) if c.is_ascii_digit() || c == '-' || c == '.' => {
                items.push(read_number(&mut chars));
            }
            Some(c) => return Err(ListLiteralError::Unexpected(c)),
        }

        skip_whitespace(&mut chars);
        match chars.next() {
            Some(',') => continue,
            Some(']') => break,
            Some(c) => return Err(ListLiteralError::Unexpected(c)),
            None => return Err(ListLiteralError::Unterminated),
        }
    }

    skip_whitespace(&mut chars);
    if chars.next().is_some() {
        return Err(ListLiteralError::Trailing);
    }
    Ok(items)
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
}

fn read_quoted(chars: &mut Peekable<Chars<'_>>, quote: char) -> Result<String, ListLiteralError> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err(ListLiteralError::UnterminatedString),
            Some(c) if c == quote => return Ok(out),
            Some('\\') => match chars.next() {
                None => return Err(ListLiteralError::UnterminatedString),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
            },
            Some(c) => out.push(c),
        }
    }
}

fn read_number(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(c) = chars.next_if(|&c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')) {
        out.push(c);
    }
    out
}
