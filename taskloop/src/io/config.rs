//! Task configuration stored under `.taskloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";

/// Config path relative to the working directory.
pub fn default_config_path(cwd: &Path) -> PathBuf {
    cwd.join(".taskloop").join("config.toml")
}

/// Task configuration (TOML).
///
/// Missing fields default to values suitable for an interactive run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskConfig {
    /// Model identifier passed to the completion service.
    pub model: String,

    /// Stop the task after this many model turns. 0 disables the limit.
    pub max_turns: u32,

    /// Wall-clock budget for a single command or script, in seconds.
    pub command_timeout_secs: u64,

    pub approval: ApprovalConfig,
    pub container: ContainerConfig,
    pub completion: CompletionConfig,
    pub script: ScriptConfig,
}

/// When the operator is asked before running commands and scripts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Prompt for every command and script.
    #[default]
    Always,
    /// Prompt only when the model flagged the action with `requires_approval`.
    Flagged,
    /// Never prompt.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ApprovalConfig {
    pub mode: ApprovalMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime CLI (`docker`, `podman`).
    pub runtime: String,
    /// Image used for ephemeral containers when none is given.
    pub default_image: String,
    /// Shell used for `-c` command strings inside containers.
    pub shell: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            default_image: "python:3.12-slim".to_string(),
            shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Retries for transient HTTP failures (429 / 5xx / transport).
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            max_retries: 2,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptConfig {
    /// Interpreter command per script language (lowercase key).
    pub interpreters: BTreeMap<String, String>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            interpreters: BTreeMap::from([("python".to_string(), "python".to_string())]),
        }
    }
}

impl ScriptConfig {
    pub fn interpreter(&self, language: &str) -> Option<&str> {
        self.interpreters
            .get(&language.trim().to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_turns: 100,
            command_timeout_secs: 30 * 60,
            approval: ApprovalConfig::default(),
            container: ContainerConfig::default(),
            completion: CompletionConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

impl TaskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.container.runtime.trim().is_empty() {
            return Err(anyhow!("container.runtime must be non-empty"));
        }
        if self.container.shell.trim().is_empty() {
            return Err(anyhow!("container.shell must be non-empty"));
        }
        if self.completion.endpoint.trim().is_empty() {
            return Err(anyhow!("completion.endpoint must be non-empty"));
        }
        if self.completion.timeout_secs == 0 {
            return Err(anyhow!("completion.timeout_secs must be > 0"));
        }
        if let Some((language, _)) = self
            .script
            .interpreters
            .iter()
            .find(|(_, cmd)| cmd.trim().is_empty())
        {
            return Err(anyhow!("script.interpreters.{language} must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TaskConfig::default()`.
pub fn load_config(path: &Path) -> Result<TaskConfig> {
    if !path.exists() {
        let cfg = TaskConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TaskConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, TaskConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "model = \"openai/gpt-4o\"\n\n[approval]\nmode = \"flagged\"\n\n[script.interpreters]\nbash = \"bash\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.model, "openai/gpt-4o");
        assert_eq!(cfg.approval.mode, ApprovalMode::Flagged);
        assert_eq!(cfg.container, ContainerConfig::default());
        assert_eq!(cfg.script.interpreter("Bash"), Some("bash"));
        assert_eq!(cfg.script.interpreter("python"), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "command_timeout_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("command_timeout_secs"));
    }

    #[test]
    fn default_interpreters_cover_python() {
        assert_eq!(ScriptConfig::default().interpreter(" PYTHON "), Some("python"));
    }
}
