//! Text conventions for reporting command results to the model.
//!
//! The model infers success or failure from these exact strings.

/// Placeholder when a command printed nothing on either stream.
pub const NO_OUTPUT: &str = "Command executed successfully (no output)";
/// First line of the result when the command was interrupted.
pub const INTERRUPTED: &str = "Command interrupted before completion";

/// How a command run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own. `None` when killed by a signal.
    Exited(Option<i32>),
    TimedOut { after_secs: u64 },
    Interrupted,
}

/// Captured result of a command in any execution environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            termination: Termination::Exited(Some(code)),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(Some(0))
    }

    /// Render the result text the model sees.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        match self.termination {
            Termination::Exited(Some(0)) => {}
            Termination::Exited(Some(code)) => {
                parts.push(format!("Command failed with exit code {code}"));
            }
            Termination::Exited(None) => {
                parts.push("Command failed: terminated by signal".to_string());
            }
            Termination::TimedOut { after_secs } => {
                parts.push(format!("Command timed out after {after_secs} seconds"));
            }
            Termination::Interrupted => parts.push(INTERRUPTED.to_string()),
        }

        let mut has_output = false;
        if !self.stdout.is_empty() {
            parts.push(format!("STDOUT:\n{}", self.stdout));
            has_output = true;
        }
        if !self.stderr.is_empty() {
            parts.push(format!("STDERR:\n{}", self.stderr));
            has_output = true;
        }
        if !has_output {
            parts.push(NO_OUTPUT.to_string());
        }
        parts.join("\n")
    }
}

/// Result text when a command could not be started at all.
pub fn render_exec_error(cause: &anyhow::Error) -> String {
    format!("ERROR executing command: {cause:#}")
}
