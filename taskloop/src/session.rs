//! The conversation loop for one task.
//!
//! Strictly sequential: completion, parse, dispatch (approval happens inside),
//! fold the result back in, repeat. The loop ends only when the model calls
//! `attempt_completion`, or on a fatal [`SessionError`] or completion failure.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::message::Message;
use crate::core::parser::parse_tool_invocation;
use crate::core::tools::{ToolInvocation, ToolResult};
use crate::dispatch::Dispatcher;
use crate::io::completion::CompletionClient;
use crate::io::interrupt::Interrupt;
use crate::io::prompt::render_system_prompt;
use crate::io::transcript::Transcript;
use crate::io::workspace::environment_details;

/// Conditions that end a task without completion.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("assistant reply contained no tool invocation")]
    NoToolFound { content: String },
    #[error("turn limit reached after {turns} turns without attempt_completion")]
    TurnLimit { turns: u32 },
    #[error("interrupted by operator")]
    Interrupted,
}

/// What to work on.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub instructions: String,
    pub cwd: PathBuf,
    /// Extra operator rules appended to the system prompt.
    pub rules: Option<String>,
}

/// Summary of a completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub result: String,
    pub turns: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Progress reported to the caller, in loop order.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    /// A tool is about to run.
    ToolCall {
        turn: u32,
        invocation: &'a ToolInvocation,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// A non-terminal tool finished.
    ToolResult { turn: u32, result: &'a ToolResult },
    /// `attempt_completion` ended the task.
    Completed { outcome: &'a TaskOutcome },
}

/// Human-readable audit text for an event.
pub fn render_event(event: &SessionEvent<'_>) -> String {
    match event {
        SessionEvent::ToolCall {
            turn,
            invocation,
            prompt_tokens,
            completion_tokens,
        } => {
            let mut lines = Vec::new();
            if let Some(reasoning) = &invocation.reasoning {
                lines.push(format!("Thinking: {reasoning}"));
            }
            let params: Vec<String> = invocation
                .params
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            lines.push(format!("[turn {turn}] Tool: {}", invocation.name));
            lines.push(format!("Params: {{{}}}", params.join(", ")));
            lines.push(format!("Total prompt tokens: {prompt_tokens}"));
            lines.push(format!("Total completion tokens: {completion_tokens}"));
            lines.join("\n")
        }
        SessionEvent::ToolResult { result, .. } => {
            format!("[{}] Result:\n{}", result.summary, result.text)
        }
        SessionEvent::Completed { outcome } => {
            format!("{}\n\nTask completed!", outcome.result)
        }
    }
}

/// Collaborators for one task run.
pub struct ConversationSession<'a> {
    client: &'a dyn CompletionClient,
    dispatcher: &'a Dispatcher<'a>,
    interrupt: Interrupt,
    transcript: Option<Transcript>,
    /// 0 disables the limit.
    max_turns: u32,
}

impl<'a> ConversationSession<'a> {
    pub fn new(
        client: &'a dyn CompletionClient,
        dispatcher: &'a Dispatcher<'a>,
        interrupt: Interrupt,
        max_turns: u32,
    ) -> Self {
        Self {
            client,
            dispatcher,
            interrupt,
            transcript: None,
            max_turns,
        }
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    /// Drive the conversation until `attempt_completion`.
    #[instrument(skip_all, fields(cwd = %request.cwd.display()))]
    pub fn run<F>(&mut self, request: &TaskRequest, mut on_event: F) -> Result<TaskOutcome>
    where
        F: FnMut(&SessionEvent<'_>),
    {
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, "task started");
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.begin_run(&run_id, request.instructions.trim())?;
        }

        let system = render_system_prompt(&request.cwd, request.rules.as_deref())?;
        let mut messages = vec![
            Message::system(system),
            Message::user(vec![
                format!("<task>\n{}\n</task>", request.instructions.trim()),
                environment_details(&request.cwd),
            ]),
        ];
        for message in &messages {
            self.log_message(message)?;
        }

        let mut turns = 0u32;
        let mut prompt_tokens = 0u64;
        let mut completion_tokens = 0u64;
        loop {
            if self.interrupt.take() {
                warn!(turns, "interrupted between turns");
                self.log_note("interrupted")?;
                return Err(SessionError::Interrupted.into());
            }
            if self.max_turns > 0 && turns >= self.max_turns {
                warn!(turns, "turn limit reached");
                self.log_note(&format!("turn limit reached after {turns} turns"))?;
                return Err(SessionError::TurnLimit { turns }.into());
            }
            turns += 1;

            let completion = self
                .client
                .complete(messages)
                .with_context(|| format!("completion request for turn {turn}", turn = turns))?;
            messages = completion.messages;
            prompt_tokens += completion.prompt_tokens;
            completion_tokens += completion.completion_tokens;
            if let Some(reply) = messages.last() {
                self.log_message(reply)?;
            }

            let invocation = match parse_tool_invocation(&completion.text) {
                Ok(invocation) => invocation,
                Err(err) => {
                    warn!(turns, err = %err, "no tool invocation in reply");
                    self.log_note("no tool invocation found; aborting")?;
                    return Err(SessionError::NoToolFound {
                        content: completion.text,
                    }
                    .into());
                }
            };
            debug!(turn = turns, tool = %invocation.name, "tool invocation parsed");
            on_event(&SessionEvent::ToolCall {
                turn: turns,
                invocation: &invocation,
                prompt_tokens,
                completion_tokens,
            });

            let result = self.dispatcher.dispatch(&invocation);
            if result.is_terminal {
                let outcome = TaskOutcome {
                    result: result.text,
                    turns,
                    prompt_tokens,
                    completion_tokens,
                };
                info!(turns, prompt_tokens, completion_tokens, "task completed");
                self.log_note(&format!("completed: {}", outcome.result))?;
                on_event(&SessionEvent::Completed { outcome: &outcome });
                return Ok(outcome);
            }
            on_event(&SessionEvent::ToolResult {
                turn: turns,
                result: &result,
            });

            let message = result_message(&result, &request.cwd);
            self.log_message(&message)?;
            messages.push(message);
        }
    }

    fn log_message(&mut self, message: &Message) -> Result<()> {
        match self.transcript.as_mut() {
            Some(transcript) => transcript.message(message),
            None => Ok(()),
        }
    }

    fn log_note(&mut self, text: &str) -> Result<()> {
        match self.transcript.as_mut() {
            Some(transcript) => transcript.note(text),
            None => Ok(()),
        }
    }
}

/// User message carrying a tool result and a fresh workspace snapshot.
fn result_message(result: &ToolResult, cwd: &Path) -> Message {
    Message::user(vec![
        format!("[{}] Result:", result.summary),
        result.text.clone(),
        environment_details(cwd),
    ])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::tools::ParamValue;

    #[test]
    fn tool_call_event_shows_reasoning_params_and_tokens() {
        let invocation = ToolInvocation {
            reasoning: Some("check files".to_string()),
            name: "list_files".to_string(),
            params: BTreeMap::from([("path".to_string(), ParamValue::Text(".".to_string()))]),
        };
        let text = render_event(&SessionEvent::ToolCall {
            turn: 3,
            invocation: &invocation,
            prompt_tokens: 120,
            completion_tokens: 40,
        });
        assert_eq!(
            text,
            "Thinking: check files\n[turn 3] Tool: list_files\nParams: {path=\".\"}\nTotal prompt tokens: 120\nTotal completion tokens: 40"
        );
    }

    #[test]
    fn result_message_has_three_segments() {
        let temp = tempfile::tempdir().expect("tempdir");
        let message =
            result_message(&ToolResult::new("list_files for '.'", "No files found"), temp.path());
        assert_eq!(message.content.len(), 3);
        assert_eq!(message.content[0], "[list_files for '.'] Result:");
        assert_eq!(message.content[1], "No files found");
        assert!(message.content[2].starts_with("<environment_details>"));
    }
}
