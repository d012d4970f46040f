//! Append-only plain-text transcript for `--log-file`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::message::Message;

pub struct Transcript {
    path: PathBuf,
    file: File,
}

impl Transcript {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Marks the start of a run so repeated runs stay distinguishable.
    pub fn begin_run(&mut self, run_id: &str, instructions: &str) -> Result<()> {
        self.write(&format!(
            "##### run {run_id} #####\ninstructions:\n{instructions}\n\n"
        ))
    }

    pub fn message(&mut self, message: &Message) -> Result<()> {
        self.write(&format!(
            "=== {} ===\n{}\n\n",
            message.role.as_str(),
            message.text()
        ))
    }

    pub fn note(&mut self, text: &str) -> Result<()> {
        self.write(&format!("--- {text}\n\n"))
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.file
            .write_all(text.as_bytes())
            .and_then(|()| self.file.flush())
            .with_context(|| format!("append to log file {}", self.path.display()))
    }
}
