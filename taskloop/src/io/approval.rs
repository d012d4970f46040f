//! Human approval before commands and scripts run.
//!
//! The [`Operator`] trait is the only place the loop blocks on a human. In
//! unattended runs no operator is consulted: anything that would prompt fails
//! fast with an in-band error instead of hanging.

use anyhow::{Context, Result};
use dialoguer::{Input, Select};
use tracing::{debug, info};

use crate::io::config::ApprovalMode;

/// Prefix of every result produced when human input was needed but unavailable.
pub const INTERACTIVE_UNAVAILABLE: &str = "ERROR: interactive input required but unavailable";

/// Source of human input.
pub trait Operator {
    /// Ask for approval. Returns the raw response line.
    fn confirm(&self, prompt: &str) -> Result<String>;

    /// Ask a free-form question, optionally offering choices.
    fn ask(&self, question: &str, options: &[String]) -> Result<String>;
}

/// Operator on the controlling terminal.
pub struct TerminalOperator;

impl Operator for TerminalOperator {
    fn confirm(&self, prompt: &str) -> Result<String> {
        Input::<String>::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .context("read approval response")
    }

    fn ask(&self, question: &str, options: &[String]) -> Result<String> {
        if options.is_empty() {
            return Input::<String>::new()
                .with_prompt(question)
                .interact_text()
                .context("read answer");
        }

        let mut items: Vec<&str> = options.iter().map(String::as_str).collect();
        items.push("Other (type an answer)");
        let choice = Select::new()
            .with_prompt(question)
            .items(&items)
            .default(0)
            .interact()
            .context("read selection")?;
        match options.get(choice) {
            Some(option) => Ok(option.clone()),
            None => Input::<String>::new()
                .with_prompt("Answer")
                .interact_text()
                .context("read answer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Command,
    Script,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Command => "command",
            ActionKind::Script => "script",
        }
    }
}

/// A side-effecting action awaiting authorization.
#[derive(Debug, Clone)]
pub struct Action<'a> {
    pub kind: ActionKind,
    pub description: &'a str,
    /// The model's own risk classification.
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Approved,
    /// Carries the operator's message verbatim.
    Rejected(String),
    /// Approval was required but no operator is available.
    Unavailable,
}

impl Authorization {
    /// Result text for a non-approved action, or `None` when approved.
    pub fn denial_text(&self, kind: ActionKind) -> Option<String> {
        match self {
            Authorization::Approved => None,
            Authorization::Rejected(message) => Some(format!(
                "User rejected executing the {} with the following message: {message}",
                kind.as_str()
            )),
            Authorization::Unavailable => Some(format!(
                "{INTERACTIVE_UNAVAILABLE}: approval to execute {} in unattended mode",
                kind.as_str()
            )),
        }
    }
}

/// Approval policy plus the operator consulted when it says to prompt.
pub struct ApprovalGate<'a> {
    mode: ApprovalMode,
    operator: Option<&'a dyn Operator>,
}

impl<'a> ApprovalGate<'a> {
    /// `operator` is `None` for unattended runs.
    pub fn new(mode: ApprovalMode, operator: Option<&'a dyn Operator>) -> Self {
        Self { mode, operator }
    }

    pub fn authorize(&self, action: &Action<'_>) -> Result<Authorization> {
        let needs_prompt = match self.mode {
            ApprovalMode::Always => true,
            ApprovalMode::Flagged => action.requires_approval,
            ApprovalMode::Auto => false,
        };
        if !needs_prompt {
            debug!(kind = action.kind.as_str(), mode = ?self.mode, "auto-approved");
            return Ok(Authorization::Approved);
        }
        let Some(operator) = self.operator else {
            info!(kind = action.kind.as_str(), "approval required in unattended mode");
            return Ok(Authorization::Unavailable);
        };

        let prompt = format!(
            "Approve executing {} `{}`? Type 'y' or 'yes' to approve, anything else is sent back as the rejection reason",
            action.kind.as_str(),
            action.description
        );
        let response = operator.confirm(&prompt)?;
        let response = response.trim();
        if is_approval(response) {
            info!(kind = action.kind.as_str(), "operator approved");
            Ok(Authorization::Approved)
        } else {
            info!(kind = action.kind.as_str(), "operator rejected");
            Ok(Authorization::Rejected(response.to_string()))
        }
    }
}

fn is_approval(response: &str) -> bool {
    matches!(response.to_ascii_lowercase().as_str(), "y" | "yes")
}
