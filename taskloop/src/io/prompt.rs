//! System prompt rendering.
//!
//! The prompt documents the tool-call text protocol verbatim: the parser in
//! [`crate::core::parser`] accepts exactly what this template teaches.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Render the system prompt for `cwd`, appending operator rules when given.
pub fn render_system_prompt(cwd: &Path, rules: Option<&str>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("system", SYSTEM_TEMPLATE)
        .context("load system prompt template")?;
    let template = env.get_template("system")?;
    let rendered = template
        .render(context! {
            cwd => cwd.display().to_string(),
            rules => rules.map(str::trim).filter(|r| !r.is_empty()),
        })
        .context("render system prompt")?;
    debug!(bytes = rendered.len(), "system prompt rendered");
    Ok(rendered)
}

/// Read a rules file for `--rules`.
pub fn load_rules(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read rules file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::ToolKind;

    #[test]
    fn prompt_substitutes_cwd_and_documents_every_tool() {
        let prompt = render_system_prompt(Path::new("/work/project"), None).expect("render");
        assert!(prompt.contains("The working directory is /work/project."));
        assert!(!prompt.contains("{{"));
        assert!(prompt.contains("<thinking>"));
        for kind in ToolKind::ALL {
            assert!(
                prompt.contains(&format!("## {}", kind.as_str())),
                "missing {}",
                kind.as_str()
            );
        }
        assert!(!prompt.contains("# Additional Rules"));
    }

    #[test]
    fn rules_are_appended_under_heading() {
        let prompt =
            render_system_prompt(Path::new("/w"), Some("  Never touch prod.\n")).expect("render");
        let (_, tail) = prompt.split_once("# Additional Rules").expect("heading");
        assert_eq!(tail.trim(), "Never touch prod.");
    }

    #[test]
    fn blank_rules_are_ignored() {
        let prompt = render_system_prompt(Path::new("/w"), Some("\n \n")).expect("render");
        assert!(!prompt.contains("# Additional Rules"));
    }
}
