//! Extraction of one tool invocation from free-form model output.
//!
//! Wire format:
//!
//! ```text
//! <thinking>optional reasoning</thinking>
//! <tool_name>
//! <param>value</param>
//! ...
//! </tool_name>
//! ```
//!
//! The scanner is nesting-aware at two levels. A tool block closes at the
//! first `</tool_name>` that is not inside one of its parameter blocks, and a
//! parameter block closes at the `</param>` that balances its opener. Text
//! inside a parameter value is never scanned for further parameters.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::core::list_literal::parse_list_literal;
use crate::core::tools::{LIST_PARAM, ParamValue, ToolInvocation};

/// Tag wrapping the optional reasoning block.
pub const THINKING_TAG: &str = "thinking";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no tool invocation found in model output")]
    NoToolFound,
}

/// Parse model output into an invocation: optional reasoning, tool name, parameters.
pub fn parse_tool_invocation(text: &str) -> Result<ToolInvocation, ParseError> {
    let (reasoning, remaining) = extract_reasoning(text);

    let mut pos = 0;
    while let Some(offset) = remaining.get(pos..).and_then(|rest| rest.find('<')) {
        let lt = pos + offset;
        let Some((name, body_start)) = open_tag_at(&remaining, lt) else {
            pos = lt + 1;
            continue;
        };
        match scan_tool_body(&remaining, body_start, name) {
            Some(raw_params) => {
                let params = raw_params
                    .into_iter()
                    .map(|(key, value)| {
                        let value = param_value(&key, value);
                        (key, value)
                    })
                    .collect();
                return Ok(ToolInvocation {
                    reasoning,
                    name: name.to_string(),
                    params,
                });
            }
            // No balanced close for this opener; keep looking after it.
            None => pos = body_start,
        }
    }

    Err(ParseError::NoToolFound)
}

/// Split off the first balanced `<thinking>` block, returning its trimmed text
/// and the remaining output with the block removed.
fn extract_reasoning(text: &str) -> (Option<String>, String) {
    let open = format!("<{THINKING_TAG}>");
    let Some(start) = text.find(&open) else {
        return (None, text.to_string());
    };
    let inner_start = start + open.len();
    let Some((close_start, close_end)) = find_matching_close(text, inner_start, THINKING_TAG)
    else {
        return (None, text.to_string());
    };
    let reasoning = text[inner_start..close_start].trim().to_string();
    let mut remaining = String::with_capacity(text.len());
    remaining.push_str(&text[..start]);
    remaining.push_str(&text[close_end..]);
    (Some(reasoning), remaining)
}

/// Scan a tool body, collecting its immediate child blocks until the tool's
/// own closing tag. Returns `None` when the tool block never closes.
fn scan_tool_body(text: &str, body_start: usize, tool: &str) -> Option<Vec<(String, String)>> {
    let close = format!("</{tool}>");
    let mut params: Vec<(String, String)> = Vec::new();
    let mut pos = body_start;

    loop {
        let lt = pos + text.get(pos..)?.find('<')?;
        let rest = &text[lt..];
        if rest.starts_with(&close) {
            return Some(params);
        }
        if let Some((key, value_start)) = open_tag_at(text, lt)
            && let Some((value_end, after)) = find_matching_close(text, value_start, key)
        {
            let value = text[value_start..value_end].trim().to_string();
            params.retain(|(existing, _)| existing != key);
            params.push((key.to_string(), value));
            pos = after;
            continue;
        }
        pos = lt + 1;
    }
}

/// Find the closing tag that balances an already-consumed `<name>` opener.
///
/// Returns `(close_start, close_end)` byte offsets.
fn find_matching_close(text: &str, from: usize, name: &str) -> Option<(usize, usize)> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut depth = 1usize;
    let mut pos = from;

    while let Some(offset) = text.get(pos..).and_then(|rest| rest.find('<')) {
        let lt = pos + offset;
        let rest = &text[lt..];
        if rest.starts_with(&close) {
            depth -= 1;
            if depth == 0 {
                return Some((lt, lt + close.len()));
            }
            pos = lt + close.len();
        } else if rest.starts_with(&open) {
            depth += 1;
            pos = lt + open.len();
        } else {
            pos = lt + 1;
        }
    }
    None
}

/// Recognize `<ident>` at `at`, returning the identifier and the offset past `>`.
fn open_tag_at(text: &str, at: usize) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    if bytes.get(at) != Some(&b'<') {
        return None;
    }
    let name_start = at + 1;
    let mut end = name_start;
    while bytes
        .get(end)
        .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
    {
        end += 1;
    }
    if end == name_start || bytes.get(end) != Some(&b'>') {
        return None;
    }
    Some((&text[name_start..end], end + 1))
}

/// Malformed list literals degrade to an empty list instead of failing the parse.
fn param_value(key: &str, raw: String) -> ParamValue {
    if key != LIST_PARAM {
        return ParamValue::Text(raw);
    }
    match parse_list_literal(&raw) {
        Ok(items) => ParamValue::List(items),
        Err(err) => {
            debug!(err = %err, "malformed list parameter, using empty list");
            ParamValue::List(Vec::new())
        }
    }
}
