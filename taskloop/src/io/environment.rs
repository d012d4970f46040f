//! Execution environments: where `execute_command` and `execute_script` run.
//!
//! The [`ExecutionEnvironment`] trait decouples tool dispatch from the backend.
//! Three backends exist: the host, a disposable container per call, and a
//! named persistent container. Tests use recording environments that never
//! spawn anything.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::core::output::{ExecOutcome, Termination};
use crate::io::config::TaskConfig;
use crate::io::container::{CliRuntime, ContainerError, ContainerManager, ContainerRuntime};
use crate::io::interrupt::Interrupt;
use crate::io::process::{Supervision, run_supervised};

/// Prefix of temporary script files written into the working directory.
pub const SCRIPT_PREFIX: &str = "_taskloop_script_";

/// Where commands run for the lifetime of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionTarget {
    Host,
    EphemeralContainer { image: String },
    PersistentContainer { name: String },
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Host => write!(f, "host"),
            ExecutionTarget::EphemeralContainer { image } => {
                write!(f, "ephemeral container ({image})")
            }
            ExecutionTarget::PersistentContainer { name } => {
                write!(f, "persistent container '{name}'")
            }
        }
    }
}

/// Abstraction over command execution backends.
pub trait ExecutionEnvironment {
    /// Directory commands run in (identical path on host and in containers).
    fn workdir(&self) -> &Path;

    /// Run a shell command to completion.
    fn run(&self, command: &str) -> Result<ExecOutcome>;

    /// Materialize `body` as a temporary script, run it, and remove it.
    fn run_script(&self, body: &str, language: &str, interpreter: &str) -> Result<ExecOutcome> {
        let script = ScriptFile::materialize(self.workdir(), body, language)?;
        self.run(&script.command(interpreter))
    }
}

/// Build the environment for a target using the configured runtime.
pub fn build_environment(
    target: &ExecutionTarget,
    workdir: &Path,
    cfg: &TaskConfig,
    interrupt: &Interrupt,
) -> Box<dyn ExecutionEnvironment> {
    let supervision = Supervision {
        timeout: Duration::from_secs(cfg.command_timeout_secs),
        interrupt: interrupt.clone(),
    };
    let manager = || ContainerManager::new(CliRuntime::new(&cfg.container.runtime), workdir);
    match target {
        ExecutionTarget::Host => Box::new(HostEnvironment::new(workdir, supervision)),
        ExecutionTarget::EphemeralContainer { image } => Box::new(EphemeralEnvironment {
            manager: manager(),
            image: image.clone(),
            shell: cfg.container.shell.clone(),
            supervision,
        }),
        ExecutionTarget::PersistentContainer { name } => Box::new(PersistentEnvironment {
            manager: manager(),
            name: name.clone(),
            shell: cfg.container.shell.clone(),
            supervision,
        }),
    }
}

/// Runs commands directly on the host via `sh -c`.
pub struct HostEnvironment {
    workdir: PathBuf,
    supervision: Supervision,
}

impl HostEnvironment {
    pub fn new(workdir: &Path, supervision: Supervision) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            supervision,
        }
    }
}

impl ExecutionEnvironment for HostEnvironment {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    #[instrument(skip_all, fields(backend = "host"))]
    fn run(&self, command: &str) -> Result<ExecOutcome> {
        info!(command, "running command on host");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.workdir);
        run_supervised(cmd, &self.supervision).context("run host command")
    }
}

/// Creates a fresh container per command and removes it afterwards.
pub struct EphemeralEnvironment<R: ContainerRuntime> {
    pub manager: ContainerManager<R>,
    pub image: String,
    pub shell: String,
    pub supervision: Supervision,
}

impl<R: ContainerRuntime> ExecutionEnvironment for EphemeralEnvironment<R> {
    fn workdir(&self) -> &Path {
        self.manager.workdir()
    }

    #[instrument(skip_all, fields(backend = "ephemeral", image = %self.image))]
    fn run(&self, command: &str) -> Result<ExecOutcome> {
        let container = self
            .manager
            .create_ephemeral(&self.image)
            .context("create ephemeral container")?;
        info!(container = container.name(), command, "running command in ephemeral container");
        let cmd = self
            .manager
            .exec_command(container.name(), &self.shell, command);
        run_supervised(cmd, &self.supervision).context("run container command")
    }
}

/// Runs commands inside an existing, running named container.
pub struct PersistentEnvironment<R: ContainerRuntime> {
    pub manager: ContainerManager<R>,
    pub name: String,
    pub shell: String,
    pub supervision: Supervision,
}

impl<R: ContainerRuntime> ExecutionEnvironment for PersistentEnvironment<R> {
    fn workdir(&self) -> &Path {
        self.manager.workdir()
    }

    #[instrument(skip_all, fields(backend = "persistent", container = %self.name))]
    fn run(&self, command: &str) -> Result<ExecOutcome> {
        if !self
            .manager
            .exists(&self.name)
            .context("check persistent container")?
        {
            return Err(anyhow!(ContainerError::NotRunning {
                name: self.name.clone(),
            }));
        }
        info!(command, "running command in persistent container");
        let (cmd, tracker) = self.manager.exec_tracked(&self.name, &self.shell, command);
        let outcome = run_supervised(cmd, &self.supervision).context("run container command");

        // Anything but a normal exit of the local client may leave the command
        // running inside the container.
        let stray = !matches!(
            &outcome,
            Ok(ExecOutcome {
                termination: Termination::Exited(Some(_)),
                ..
            })
        );
        if let Err(err) = self
            .manager
            .finish_exec(&self.name, &self.shell, &tracker, stray)
        {
            warn!(err = %err, "failed to clean up container exec");
        }
        outcome
    }
}

/// A script body written to a temporary file inside the working directory.
///
/// The file is removed when this value drops, on every exit path.
#[derive(Debug)]
pub struct ScriptFile {
    file: NamedTempFile,
    relative: String,
}

impl ScriptFile {
    pub fn materialize(workdir: &Path, body: &str, language: &str) -> Result<Self> {
        fs::create_dir_all(workdir)
            .with_context(|| format!("create working directory {}", workdir.display()))?;
        let mut file = tempfile::Builder::new()
            .prefix(SCRIPT_PREFIX)
            .suffix(&format!(".{}", script_extension(language)))
            .tempfile_in(workdir)
            .with_context(|| format!("create script file in {}", workdir.display()))?;
        file.write_all(body.as_bytes()).context("write script body")?;
        file.flush().context("flush script body")?;

        let relative = file
            .path()
            .file_name()
            .ok_or_else(|| anyhow!("script file has no name"))?
            .to_string_lossy()
            .into_owned();
        debug!(script = %relative, "script materialized");
        Ok(Self { file, relative })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Path relative to the working directory (valid on host and in containers).
    pub fn relative_path(&self) -> &str {
        &self.relative
    }

    pub fn command(&self, interpreter: &str) -> String {
        format!("{interpreter} {}", self.relative)
    }
}

fn script_extension(language: &str) -> &'static str {
    match language.trim().to_ascii_lowercase().as_str() {
        "python" | "python3" => "py",
        "bash" | "sh" | "shell" => "sh",
        "javascript" | "node" => "js",
        "ruby" => "rb",
        _ => "txt",
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::FakeRuntime;

    fn supervision() -> Supervision {
        Supervision {
            timeout: Duration::from_secs(10),
            interrupt: Interrupt::new(),
        }
    }

    fn leftover_scripts(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(SCRIPT_PREFIX))
            .collect()
    }

    #[test]
    fn host_runs_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let env = HostEnvironment::new(temp.path(), supervision());

        let out = env.run("ls").expect("run");
        assert!(out.success());
        assert!(out.stdout.contains("marker.txt"));
    }

    #[test]
    fn script_file_is_removed_after_success_and_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = HostEnvironment::new(temp.path(), supervision());

        let ok = env.run_script("echo from script", "bash", "sh").expect("run ok");
        assert!(ok.success());
        assert_eq!(ok.stdout, "from script\n");

        let failed = env.run_script("exit 4", "bash", "sh").expect("run failing");
        assert!(!failed.success());

        assert!(leftover_scripts(temp.path()).is_empty());
    }

    #[test]
    fn script_file_lives_in_workdir_until_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = ScriptFile::materialize(temp.path(), "print(1)", "python").expect("script");
        assert!(script.path().starts_with(temp.path()));
        assert!(script.relative_path().ends_with(".py"));
        assert_eq!(script.command("python"), format!("python {}", script.relative_path()));
        drop(script);
        assert!(leftover_scripts(temp.path()).is_empty());
    }

    #[test]
    fn persistent_requires_running_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = PersistentEnvironment {
            manager: ContainerManager::new(FakeRuntime::new(), temp.path()),
            name: "taskloop_missing".to_string(),
            shell: "/bin/sh".to_string(),
            supervision: supervision(),
        };
        let err = env.run("ls").unwrap_err();
        assert!(format!("{err:#}").contains("is not running"));
    }

    #[test]
    fn persistent_execs_inside_named_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::new();
        runtime.insert("taskloop_dev", "alpine", true);
        let env = PersistentEnvironment {
            manager: ContainerManager::new(runtime, temp.path()),
            name: "taskloop_dev".to_string(),
            shell: "/bin/sh".to_string(),
            supervision: supervision(),
        };

        let out = env.run("echo inside").expect("run");
        assert_eq!(out.stdout, "inside\n");

        let calls = env.manager.runtime().calls();
        let execs: Vec<&Vec<String>> = calls.iter().filter(|c| c[0] == "exec").collect();
        assert_eq!(execs.len(), 2);
        let cleanup = execs[1].last().expect("cleanup script");
        assert!(cleanup.starts_with("rm -f "));
        assert!(!cleanup.contains("kill"));
    }

    #[test]
    fn interrupted_persistent_command_is_killed_inside_the_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pids = tempfile::tempdir().expect("pid dir");
        let runtime = FakeRuntime::new();
        runtime.insert("taskloop_dev", "alpine", true);
        let env = PersistentEnvironment {
            manager: ContainerManager::new(runtime, temp.path())
                .with_pid_dir(pids.path().display().to_string()),
            name: "taskloop_dev".to_string(),
            shell: "/bin/sh".to_string(),
            supervision: supervision(),
        };
        env.supervision.interrupt.raise();

        let out = env.run("sleep 30").expect("run");
        assert_eq!(out.termination, Termination::Interrupted);

        let last = env.manager.runtime().calls().pop().expect("kill call");
        assert_eq!(&last[..2], ["exec", "taskloop_dev"]);
        assert!(last[4].contains("kill -KILL"), "{last:?}");
        assert!(last[4].contains(&pids.path().display().to_string()));
    }

    #[test]
    fn ephemeral_creates_and_destroys_a_container_per_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = EphemeralEnvironment {
            manager: ContainerManager::new(FakeRuntime::new(), temp.path()),
            image: "alpine".to_string(),
            shell: "/bin/sh".to_string(),
            supervision: supervision(),
        };

        env.run("true").expect("first");
        env.run("true").expect("second");

        let runtime = env.manager.runtime();
        assert_eq!(runtime.count_calls("run"), 2);
        assert_eq!(runtime.count_calls("rm"), 2);
        assert!(runtime.container_names().is_empty());
    }
}
