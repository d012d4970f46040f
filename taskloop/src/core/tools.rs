//! Closed set of tools the model may invoke, and the contracts between the
//! parser, the dispatcher, and the session.
//!
//! A [`ToolInvocation`] is the loosely-typed shape extracted from model text.
//! [`ToolCall::decode`] turns it into a validated [`ToolCall`] or a
//! [`DispatchError`] that is reported back to the model in-band.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Parameter name reserved for list-valued data.
pub const LIST_PARAM: &str = "options";

/// One parameter value extracted from a tool block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(text) => Some(text),
            ParamValue::List(_) => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(text) => write!(f, "{text:?}"),
            ParamValue::List(items) => write!(f, "{items:?}"),
        }
    }
}

/// A tool invocation as written by the model. Built per turn, consumed by dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub reasoning: Option<String>,
    pub name: String,
    pub params: BTreeMap<String, ParamValue>,
}

impl ToolInvocation {
    pub fn text_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(ParamValue::as_text)
    }
}

/// Outcome of one tool execution, folded back into the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub summary: String,
    pub text: String,
    /// Only `attempt_completion` sets this; it ends the loop.
    pub is_terminal: bool,
}

impl ToolResult {
    pub fn new(summary: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            text: text.into(),
            is_terminal: false,
        }
    }

    pub fn terminal(summary: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            text: text.into(),
            is_terminal: true,
        }
    }
}

/// Tool kinds understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ReadFile,
    WriteToFile,
    ReplaceInFile,
    SearchFiles,
    ListFiles,
    ExecuteCommand,
    ExecuteScript,
    AskFollowupQuestion,
    AttemptCompletion,
}

impl ToolKind {
    pub const ALL: [ToolKind; 9] = [
        ToolKind::ReadFile,
        ToolKind::WriteToFile,
        ToolKind::ReplaceInFile,
        ToolKind::SearchFiles,
        ToolKind::ListFiles,
        ToolKind::ExecuteCommand,
        ToolKind::ExecuteScript,
        ToolKind::AskFollowupQuestion,
        ToolKind::AttemptCompletion,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteToFile => "write_to_file",
            ToolKind::ReplaceInFile => "replace_in_file",
            ToolKind::SearchFiles => "search_files",
            ToolKind::ListFiles => "list_files",
            ToolKind::ExecuteCommand => "execute_command",
            ToolKind::ExecuteScript => "execute_script",
            ToolKind::AskFollowupQuestion => "ask_followup_question",
            ToolKind::AttemptCompletion => "attempt_completion",
        }
    }

    /// Parameters that must be present for the tool to run.
    pub fn required_params(self) -> &'static [&'static str] {
        match self {
            ToolKind::ReadFile => &["path"],
            ToolKind::WriteToFile => &["path", "content"],
            ToolKind::ReplaceInFile => &["path", "diff"],
            ToolKind::SearchFiles => &["path", "regex"],
            ToolKind::ListFiles => &["path"],
            ToolKind::ExecuteCommand => &["command", "requires_approval"],
            ToolKind::ExecuteScript => &["script", "language", "requires_approval"],
            ToolKind::AskFollowupQuestion => &["question"],
            ToolKind::AttemptCompletion => &["result"],
        }
    }
}

/// Invocation problems the model can fix on its next turn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("missing required parameter '{param}' for tool '{tool}'")]
    MissingParam { tool: &'static str, param: &'static str },
    #[error("invalid value {value:?} for parameter '{param}' of tool '{tool}' (expected {expected})")]
    InvalidParam {
        tool: &'static str,
        param: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// A validated tool call, one variant per tool kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    ReadFile {
        path: String,
    },
    WriteToFile {
        path: String,
        content: String,
    },
    ReplaceInFile {
        path: String,
        diff: String,
    },
    SearchFiles {
        path: String,
        regex: String,
        file_pattern: Option<String>,
    },
    ListFiles {
        path: String,
        recursive: bool,
    },
    ExecuteCommand {
        command: String,
        requires_approval: bool,
    },
    ExecuteScript {
        script: String,
        language: String,
        requires_approval: bool,
    },
    AskFollowupQuestion {
        question: String,
        options: Vec<String>,
    },
    AttemptCompletion {
        result: String,
        command: Option<String>,
    },
}

impl ToolCall {
    /// Validate an invocation against the tool's parameter contract.
    pub fn decode(invocation: &ToolInvocation) -> Result<Self, DispatchError> {
        let kind = ToolKind::from_name(&invocation.name)
            .ok_or_else(|| DispatchError::UnknownTool(invocation.name.clone()))?;
        for &param in kind.required_params() {
            if !invocation.params.contains_key(param) {
                return Err(DispatchError::MissingParam {
                    tool: kind.as_str(),
                    param,
                });
            }
        }
        let params = Params { kind, invocation };

        let call = match kind {
            ToolKind::ReadFile => ToolCall::ReadFile {
                path: params.text("path")?,
            },
            ToolKind::WriteToFile => ToolCall::WriteToFile {
                path: params.text("path")?,
                content: params.text("content")?,
            },
            ToolKind::ReplaceInFile => ToolCall::ReplaceInFile {
                path: params.text("path")?,
                diff: params.text("diff")?,
            },
            ToolKind::SearchFiles => ToolCall::SearchFiles {
                path: params.text("path")?,
                regex: params.text("regex")?,
                file_pattern: params.optional_text("file_pattern")?,
            },
            ToolKind::ListFiles => ToolCall::ListFiles {
                path: params.text("path")?,
                recursive: params.optional_flag("recursive")?.unwrap_or(false),
            },
            ToolKind::ExecuteCommand => ToolCall::ExecuteCommand {
                command: params.text("command")?,
                requires_approval: params.flag("requires_approval")?,
            },
            ToolKind::ExecuteScript => ToolCall::ExecuteScript {
                script: params.text("script")?,
                language: params.text("language")?,
                requires_approval: params.flag("requires_approval")?,
            },
            ToolKind::AskFollowupQuestion => ToolCall::AskFollowupQuestion {
                question: params.text("question")?,
                options: params.list(LIST_PARAM),
            },
            ToolKind::AttemptCompletion => ToolCall::AttemptCompletion {
                result: params.text("result")?,
                command: params.optional_text("command")?,
            },
        };
        Ok(call)
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolCall::ReadFile { .. } => ToolKind::ReadFile,
            ToolCall::WriteToFile { .. } => ToolKind::WriteToFile,
            ToolCall::ReplaceInFile { .. } => ToolKind::ReplaceInFile,
            ToolCall::SearchFiles { .. } => ToolKind::SearchFiles,
            ToolCall::ListFiles { .. } => ToolKind::ListFiles,
            ToolCall::ExecuteCommand { .. } => ToolKind::ExecuteCommand,
            ToolCall::ExecuteScript { .. } => ToolKind::ExecuteScript,
            ToolCall::AskFollowupQuestion { .. } => ToolKind::AskFollowupQuestion,
            ToolCall::AttemptCompletion { .. } => ToolKind::AttemptCompletion,
        }
    }
}

struct Params<'a> {
    kind: ToolKind,
    invocation: &'a ToolInvocation,
}

impl Params<'_> {
    fn text(&self, param: &'static str) -> Result<String, DispatchError> {
        self.optional_text(param)?
            .ok_or(DispatchError::MissingParam {
                tool: self.kind.as_str(),
                param,
            })
    }

    fn optional_text(&self, param: &'static str) -> Result<Option<String>, DispatchError> {
        match self.invocation.params.get(param) {
            None => Ok(None),
            Some(ParamValue::Text(text)) => Ok(Some(text.clone())),
            Some(ParamValue::List(items)) => Err(DispatchError::InvalidParam {
                tool: self.kind.as_str(),
                param,
                value: format!("{items:?}"),
                expected: "text",
            }),
        }
    }

    fn flag(&self, param: &'static str) -> Result<bool, DispatchError> {
        self.optional_flag(param)?
            .ok_or(DispatchError::MissingParam {
                tool: self.kind.as_str(),
                param,
            })
    }

    fn optional_flag(&self, param: &'static str) -> Result<Option<bool>, DispatchError> {
        let Some(raw) = self.optional_text(param)? else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(DispatchError::InvalidParam {
                tool: self.kind.as_str(),
                param,
                value: raw,
                expected: "true or false",
            }),
        }
    }

    fn list(&self, param: &'static str) -> Vec<String> {
        match self.invocation.params.get(param) {
            Some(ParamValue::List(items)) => items.clone(),
            Some(ParamValue::Text(text)) if !text.trim().is_empty() => vec![text.clone()],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(name: &str, params: &[(&str, &str)]) -> ToolInvocation {
        ToolInvocation {
            reasoning: None,
            name: name.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), ParamValue::Text(v.to_string())))
                .collect(),
        }
    }

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("browser_action"), None);
    }

    #[test]
    fn decode_unknown_tool_is_dispatch_error() {
        let err = ToolCall::decode(&invocation("delete_everything", &[])).unwrap_err();
        assert_eq!(err, DispatchError::UnknownTool("delete_everything".to_string()));
    }

    #[test]
    fn decode_reports_first_missing_required_param() {
        let err = ToolCall::decode(&invocation("write_to_file", &[("path", "a.txt")])).unwrap_err();
        assert_eq!(
            err,
            DispatchError::MissingParam {
                tool: "write_to_file",
                param: "content"
            }
        );
        assert!(err.to_string().contains("'content'"));
    }

    #[test]
    fn decode_parses_flags_case_insensitively() {
        let call = ToolCall::decode(&invocation(
            "execute_command",
            &[("command", "ls"), ("requires_approval", "TRUE")],
        ))
        .expect("decode");
        assert_eq!(
            call,
            ToolCall::ExecuteCommand {
                command: "ls".to_string(),
                requires_approval: true
            }
        );
    }

    #[test]
    fn decode_rejects_non_boolean_flag() {
        let err = ToolCall::decode(&invocation(
            "execute_command",
            &[("command", "ls"), ("requires_approval", "maybe")],
        ))
        .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidParam { param: "requires_approval", .. }));
    }

    #[test]
    fn decode_list_files_defaults_to_non_recursive() {
        let call = ToolCall::decode(&invocation("list_files", &[("path", ".")])).expect("decode");
        assert_eq!(
            call,
            ToolCall::ListFiles {
                path: ".".to_string(),
                recursive: false
            }
        );
    }

    #[test]
    fn decode_followup_keeps_list_options() {
        let mut inv = invocation("ask_followup_question", &[("question", "Which?")]);
        inv.params.insert(
            LIST_PARAM.to_string(),
            ParamValue::List(vec!["a".to_string(), "b".to_string()]),
        );
        let call = ToolCall::decode(&inv).expect("decode");
        assert_eq!(
            call,
            ToolCall::AskFollowupQuestion {
                question: "Which?".to_string(),
                options: vec!["a".to_string(), "b".to_string()]
            }
        );
    }
}
