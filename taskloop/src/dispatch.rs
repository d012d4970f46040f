//! Tool dispatch: validated invocations to side-effecting handlers.
//!
//! Nothing here fails the task. Unknown tools, missing parameters, rejected
//! approvals and execution failures all come back as [`ToolResult`] text the
//! model can react to on its next turn.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::output::{ExecOutcome, render_exec_error};
use crate::core::tools::{DispatchError, ToolCall, ToolInvocation, ToolKind, ToolResult};
use crate::io::approval::{
    Action, ActionKind, ApprovalGate, INTERACTIVE_UNAVAILABLE, Operator,
};
use crate::io::config::ScriptConfig;
use crate::io::environment::ExecutionEnvironment;
use crate::io::files::{self, NO_FILES, NO_MATCHES};

/// Routes tool calls to their handlers for one task.
pub struct Dispatcher<'a> {
    env: &'a dyn ExecutionEnvironment,
    gate: ApprovalGate<'a>,
    /// `None` in unattended runs.
    operator: Option<&'a dyn Operator>,
    scripts: &'a ScriptConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        env: &'a dyn ExecutionEnvironment,
        gate: ApprovalGate<'a>,
        operator: Option<&'a dyn Operator>,
        scripts: &'a ScriptConfig,
    ) -> Self {
        Self {
            env,
            gate,
            operator,
            scripts,
        }
    }

    /// Execute one invocation. Always produces a result.
    #[instrument(skip_all, fields(tool = %invocation.name))]
    pub fn dispatch(&self, invocation: &ToolInvocation) -> ToolResult {
        let call = match ToolCall::decode(invocation) {
            Ok(call) => call,
            Err(err) => return invalid_call(&invocation.name, &err),
        };
        debug!(kind = call.kind().as_str(), "dispatching tool call");

        match call {
            ToolCall::ReadFile { path } => {
                let text = match files::read_file(self.env.workdir(), &path) {
                    Ok(contents) => contents,
                    Err(err) => format!("ERROR READING FILE {path}: {err:#}"),
                };
                ToolResult::new(format!("read_file for '{path}'"), text)
            }
            ToolCall::WriteToFile { path, content } => {
                let text = match files::write_file(self.env.workdir(), &path, &content) {
                    Ok(chars) => format!("Successfully wrote {chars} characters to {path}"),
                    Err(err) => format!("ERROR WRITING FILE {path}: {err:#}"),
                };
                ToolResult::new(format!("write_to_file for '{path}'"), text)
            }
            ToolCall::ReplaceInFile { path, diff } => {
                let text = match files::replace_in_file(self.env.workdir(), &path, &diff) {
                    Ok(count) => format!("Successfully applied {count} replacement(s) to {path}"),
                    Err(err) => format!("ERROR REPLACING IN FILE {path}: {err:#}"),
                };
                ToolResult::new(format!("replace_in_file for '{path}'"), text)
            }
            ToolCall::SearchFiles {
                path,
                regex,
                file_pattern,
            } => {
                let mut summary = format!("search_files for '{regex}' in '{path}'");
                if let Some(pattern) = &file_pattern {
                    summary.push_str(&format!(" ({pattern})"));
                }
                let text = match files::search_files(
                    self.env.workdir(),
                    &path,
                    &regex,
                    file_pattern.as_deref(),
                ) {
                    Ok(hits) if hits.is_empty() => NO_MATCHES.to_string(),
                    Ok(hits) => hits.join("\n"),
                    Err(err) => format!("ERROR SEARCHING FILES {path}: {err:#}"),
                };
                ToolResult::new(summary, text)
            }
            ToolCall::ListFiles { path, recursive } => {
                let mut summary = format!("list_files for '{path}'");
                if recursive {
                    summary.push_str(" (recursive)");
                }
                let text = match files::list_files(self.env.workdir(), &path, recursive) {
                    Ok(entries) if entries.is_empty() => NO_FILES.to_string(),
                    Ok(entries) => entries.join("\n"),
                    Err(err) => format!("ERROR LISTING FILES {path}: {err:#}"),
                };
                ToolResult::new(summary, text)
            }
            ToolCall::ExecuteCommand {
                command,
                requires_approval,
            } => self.execute_command(&command, requires_approval),
            ToolCall::ExecuteScript {
                script,
                language,
                requires_approval,
            } => self.execute_script(&script, &language, requires_approval),
            ToolCall::AskFollowupQuestion { question, options } => {
                self.ask_followup(&question, &options)
            }
            ToolCall::AttemptCompletion { result, command } => {
                let text = match command {
                    Some(command) => format!("{result}\n\nDemonstration command: {command}"),
                    None => result,
                };
                ToolResult::terminal(ToolKind::AttemptCompletion.as_str(), text)
            }
        }
    }

    fn execute_command(&self, command: &str, requires_approval: bool) -> ToolResult {
        let summary = with_approval_marker(format!("execute_command '{command}'"), requires_approval);
        let action = Action {
            kind: ActionKind::Command,
            description: command,
            requires_approval,
        };
        if let Some(denied) = self.denial(&action) {
            return ToolResult::new(summary, denied);
        }
        ToolResult::new(summary, render_run(self.env.run(command)))
    }

    fn execute_script(&self, script: &str, language: &str, requires_approval: bool) -> ToolResult {
        let Some(interpreter) = self.scripts.interpreter(language) else {
            let supported: Vec<&str> = self.scripts.interpreters.keys().map(String::as_str).collect();
            warn!(language, "unsupported script language");
            return ToolResult::new(
                format!("execute_script (unsupported language: {language})"),
                format!(
                    "ERROR: unsupported script language '{language}' (supported: {})",
                    supported.join(", ")
                ),
            );
        };
        let summary = with_approval_marker(
            format!("execute_script (language: {language})"),
            requires_approval,
        );
        let action = Action {
            kind: ActionKind::Script,
            description: script,
            requires_approval,
        };
        if let Some(denied) = self.denial(&action) {
            return ToolResult::new(summary, denied);
        }
        ToolResult::new(
            summary,
            render_run(self.env.run_script(script, language, interpreter)),
        )
    }

    fn ask_followup(&self, question: &str, options: &[String]) -> ToolResult {
        let summary = format!("ask_followup_question '{question}'");
        let Some(operator) = self.operator else {
            info!("follow-up question in unattended mode");
            return ToolResult::new(
                summary,
                format!("{INTERACTIVE_UNAVAILABLE}: cannot ask a follow-up question in unattended mode"),
            );
        };
        let text = match operator.ask(question, options) {
            Ok(answer) => format!("<answer>\n{}\n</answer>", answer.trim()),
            Err(err) => format!("ERROR: failed to read the answer: {err:#}"),
        };
        ToolResult::new(summary, text)
    }

    /// Result text when the action may not run, `None` when approved.
    fn denial(&self, action: &Action<'_>) -> Option<String> {
        match self.gate.authorize(action) {
            Ok(auth) => auth.denial_text(action.kind),
            Err(err) => {
                warn!(err = %err, "approval prompt failed");
                Some(format!("ERROR: approval prompt failed: {err:#}"))
            }
        }
    }
}

fn with_approval_marker(mut summary: String, requires_approval: bool) -> String {
    if requires_approval {
        summary.push_str(" (requires approval)");
    }
    summary
}

fn render_run(outcome: Result<ExecOutcome>) -> String {
    match outcome {
        Ok(outcome) => outcome.render(),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "command failed to run");
            render_exec_error(&err)
        }
    }
}

fn invalid_call(name: &str, err: &DispatchError) -> ToolResult {
    warn!(tool = name, err = %err, "invalid tool call");
    match err {
        DispatchError::UnknownTool(_) => {
            let known: Vec<&str> = ToolKind::ALL.iter().map(|k| k.as_str()).collect();
            ToolResult::new(
                format!("Unknown tool '{name}'"),
                format!(
                    "ERROR: No implementation available for tool '{name}'. Available tools: {}",
                    known.join(", ")
                ),
            )
        }
        DispatchError::MissingParam { .. } | DispatchError::InvalidParam { .. } => {
            ToolResult::new(
                format!("{name} (invalid parameters)"),
                format!("ERROR: {err}. Correct the tool call and try again."),
            )
        }
    }
}
