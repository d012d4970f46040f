//! Lifecycle of named containers backing the container execution environments.
//!
//! Every operation shells out to a container runtime CLI (`docker` by default)
//! and re-queries the runtime; nothing about a container is cached between
//! calls. Containers created here carry the [`MANAGED_LABEL`] so `list` only
//! reports our own.
//!
//! State per name: absent -> running -> stopped -> absent (`stop` also removes).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Prefix of generated container names.
pub const NAME_PREFIX: &str = "taskloop_";
/// Label attached to every container this tool creates.
pub const MANAGED_LABEL: &str = "taskloop.managed=true";
/// Directory inside containers holding pid files of tracked execs.
pub const DEFAULT_PID_DIR: &str = "/tmp";

/// Runtime failures, classified so the operator knows what to fix.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container runtime '{program}' is not installed or not on PATH")]
    RuntimeMissing { program: String },
    #[error("failed to pull image '{image}': {stderr}")]
    ImagePull { image: String, stderr: String },
    #[error("container name '{name}' is already in use")]
    NameConflict { name: String },
    #[error("container '{name}' is not running (start it with `taskloop container start`)")]
    NotRunning { name: String },
    #[error("`{program} {args}` failed with exit code {code:?}: {stderr}")]
    Runtime {
        program: String,
        args: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to run container runtime '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("unexpected output from `{program} {args}`: {detail}")]
    Output {
        program: String,
        args: String,
        detail: String,
    },
}

/// Result of a short runtime subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RuntimeOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Seam over the container runtime CLI.
pub trait ContainerRuntime {
    /// Executable name, used in messages.
    fn program(&self) -> &str;

    /// Run a short subcommand (`inspect`, `start`, `ps`, ...) to completion.
    fn run(&self, args: &[String]) -> io::Result<RuntimeOutput>;

    /// Build (but do not spawn) a long-running subcommand such as `exec`.
    fn command(&self, args: &[String]) -> Command;
}

/// Runtime backed by a CLI on `PATH`.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
}

impl CliRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ContainerRuntime for CliRuntime {
    fn program(&self) -> &str {
        &self.program
    }

    fn run(&self, args: &[String]) -> io::Result<RuntimeOutput> {
        let output = Command::new(&self.program).args(args).output()?;
        Ok(RuntimeOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Unknown,
}

impl ContainerStatus {
    fn from_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => ContainerStatus::Running,
            "exited" | "created" | "dead" | "stopped" => ContainerStatus::Stopped,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

/// Runtime-owned facts about one managed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Absent,
    Running,
    Stopped,
}

/// Creates, starts, stops, lists and probes named containers.
///
/// The working directory is bind-mounted at the identical path inside every
/// container so file references stay valid across host and container.
pub struct ContainerManager<R: ContainerRuntime> {
    runtime: R,
    workdir: PathBuf,
    pid_dir: String,
}

impl<R: ContainerRuntime> ContainerManager<R> {
    pub fn new(runtime: R, workdir: &Path) -> Self {
        Self {
            runtime,
            workdir: workdir.to_path_buf(),
            pid_dir: DEFAULT_PID_DIR.to_string(),
        }
    }

    /// Use `dir` (inside the container) for tracked exec pid files.
    pub fn with_pid_dir(mut self, dir: impl Into<String>) -> Self {
        self.pid_dir = dir.into();
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Ensure a running container named `name` (generated if `None`).
    ///
    /// Idempotent: a running container is returned as-is, a stopped one is
    /// started, an absent one is pulled and created.
    #[instrument(skip(self))]
    pub fn start(&self, image: &str, name: Option<&str>) -> Result<String, ContainerError> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| generate_name("persistent"));

        match self.presence(&name)? {
            Presence::Running => {
                info!(name = %name, "container already running");
                return Ok(name);
            }
            Presence::Stopped => {
                self.invoke(&["start".to_string(), name.clone()])?;
                info!(name = %name, "started existing container");
                return Ok(name);
            }
            Presence::Absent => {}
        }

        self.pull(image)?;
        self.create(image, &name)?;
        info!(name = %name, image, "started new container");
        Ok(name)
    }

    /// Stop and remove a container. Returns `false` when it did not exist.
    #[instrument(skip(self))]
    pub fn stop(&self, name: &str) -> Result<bool, ContainerError> {
        match self.presence(name)? {
            Presence::Absent => {
                info!(name, "container not found, nothing to stop");
                Ok(false)
            }
            Presence::Running => {
                self.invoke(&["stop".to_string(), name.to_string()])?;
                self.invoke(&["rm".to_string(), name.to_string()])?;
                info!(name, "stopped and removed container");
                Ok(true)
            }
            Presence::Stopped => {
                self.invoke(&["rm".to_string(), name.to_string()])?;
                info!(name, "removed stopped container");
                Ok(true)
            }
        }
    }

    /// Managed containers by name, freshly queried.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<BTreeMap<String, ContainerRecord>, ContainerError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label={MANAGED_LABEL}"),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        let output = self.invoke(&args)?;

        let mut records = BTreeMap::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let record = self.parse_ps_line(&args, line)?;
            records.insert(record.name.clone(), record);
        }
        debug!(count = records.len(), "listed containers");
        Ok(records)
    }

    /// True only when the container exists and is running.
    pub fn exists(&self, name: &str) -> Result<bool, ContainerError> {
        Ok(self.presence(name)? == Presence::Running)
    }

    /// Create a disposable container that is removed when the guard drops.
    #[instrument(skip(self))]
    pub fn create_ephemeral(&self, image: &str) -> Result<EphemeralContainer<'_, R>, ContainerError> {
        let name = generate_name("ephemeral");
        self.create(image, &name)?;
        debug!(name = %name, "ephemeral container created");
        Ok(EphemeralContainer {
            manager: self,
            name,
        })
    }

    /// Force-remove a container regardless of state.
    pub fn destroy(&self, name: &str) -> Result<(), ContainerError> {
        self.invoke(&["rm".to_string(), "-f".to_string(), name.to_string()])?;
        Ok(())
    }

    /// Command that runs `command` through `shell` inside `name`, in the working directory.
    pub fn exec_command(&self, name: &str, shell: &str, command: &str) -> Command {
        self.build_exec(name, &[shell, "-c", command])
    }

    /// Like [`exec_command`](Self::exec_command), but the in-container process
    /// records its pid so [`finish_exec`](Self::finish_exec) can kill it.
    ///
    /// Killing the local runtime client does not stop the process it started
    /// inside the container.
    pub fn exec_tracked(&self, name: &str, shell: &str, command: &str) -> (Command, ExecTracker) {
        let tracker = ExecTracker {
            pidfile: format!(
                "{}/{NAME_PREFIX}exec_{}.pid",
                self.pid_dir.trim_end_matches('/'),
                Uuid::new_v4().simple()
            ),
        };
        let wrapper = format!(r#"echo $$ > {}; exec {shell} -c "$0""#, tracker.pidfile);
        (self.build_exec(name, &[shell, "-c", &wrapper, command]), tracker)
    }

    /// Remove a tracked exec's pid file; with `kill`, first SIGKILL the
    /// process, its children and its group if it still runs.
    #[instrument(skip(self, tracker), fields(pidfile = %tracker.pidfile))]
    pub fn finish_exec(
        &self,
        name: &str,
        shell: &str,
        tracker: &ExecTracker,
        kill: bool,
    ) -> Result<(), ContainerError> {
        let pidfile = &tracker.pidfile;
        let script = if kill {
            format!(
                r#"pid=$(cat {pidfile} 2>/dev/null) && {{ pkill -KILL -P "$pid" 2>/dev/null; kill -KILL -- -"$pid" 2>/dev/null || kill -KILL "$pid" 2>/dev/null; }}; rm -f {pidfile}"#
            )
        } else {
            format!("rm -f {pidfile}")
        };
        let args = vec![
            "exec".to_string(),
            name.to_string(),
            shell.to_string(),
            "-c".to_string(),
            script,
        ];
        self.invoke(&args)?;
        if kill {
            info!(name, "killed command left running in container");
        }
        Ok(())
    }

    fn build_exec(&self, name: &str, argv: &[&str]) -> Command {
        let mut args = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-w".to_string(),
            self.workdir.display().to_string(),
            name.to_string(),
        ];
        args.extend(argv.iter().map(|arg| arg.to_string()));
        let mut cmd = self.runtime.command(&args);
        cmd.current_dir(&self.workdir);
        cmd
    }

    fn pull(&self, image: &str) -> Result<(), ContainerError> {
        info!(image, "pulling image");
        let args = vec!["pull".to_string(), image.to_string()];
        let output = self.spawn(&args)?;
        if !output.success() {
            return Err(ContainerError::ImagePull {
                image: image.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn create(&self, image: &str, name: &str) -> Result<(), ContainerError> {
        let mount = format!("{}:{}", self.workdir.display(), self.workdir.display());
        let args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            MANAGED_LABEL.to_string(),
            "-v".to_string(),
            mount,
            "-w".to_string(),
            self.workdir.display().to_string(),
            "-t".to_string(),
            image.to_string(),
            "sleep".to_string(),
            "infinity".to_string(),
        ];
        let output = self.spawn(&args)?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr.trim().to_string();
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("already in use") || lowered.contains("conflict") {
            return Err(ContainerError::NameConflict {
                name: name.to_string(),
            });
        }
        if lowered.contains("pull access denied")
            || lowered.contains("manifest unknown")
            || lowered.contains("unable to find image")
        {
            return Err(ContainerError::ImagePull {
                image: image.to_string(),
                stderr,
            });
        }
        Err(self.runtime_error(&args, &output))
    }

    fn presence(&self, name: &str) -> Result<Presence, ContainerError> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            name.to_string(),
        ];
        let output = self.spawn(&args)?;
        if !output.success() {
            if output.stderr.to_ascii_lowercase().contains("no such") {
                return Ok(Presence::Absent);
            }
            return Err(self.runtime_error(&args, &output));
        }

        let parsed: Value =
            serde_json::from_str(&output.stdout).map_err(|err| self.output_error(&args, err))?;
        let running = parsed
            .get(0)
            .and_then(|info| info.pointer("/State/Running"))
            .and_then(Value::as_bool)
            .ok_or_else(|| self.output_error(&args, "missing State.Running"))?;
        Ok(if running {
            Presence::Running
        } else {
            Presence::Stopped
        })
    }

    fn parse_ps_line(&self, args: &[String], line: &str) -> Result<ContainerRecord, ContainerError> {
        let info: Value = serde_json::from_str(line).map_err(|err| self.output_error(args, err))?;
        // docker reports `Names` as a string, podman as an array.
        let name = match info.get("Names") {
            Some(Value::String(name)) => name.clone(),
            Some(Value::Array(names)) => names
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };
        if name.is_empty() {
            return Err(self.output_error(args, "entry without Names"));
        }
        let field = |key: &str| {
            info.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(ContainerRecord {
            name,
            image: field("Image"),
            status: ContainerStatus::from_state(&field("State")),
            created_at: field("CreatedAt"),
        })
    }

    /// Run a subcommand and require success.
    fn invoke(&self, args: &[String]) -> Result<RuntimeOutput, ContainerError> {
        let output = self.spawn(args)?;
        if !output.success() {
            return Err(self.runtime_error(args, &output));
        }
        Ok(output)
    }

    fn spawn(&self, args: &[String]) -> Result<RuntimeOutput, ContainerError> {
        debug!(program = self.runtime.program(), ?args, "container runtime call");
        self.runtime.run(args).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ContainerError::RuntimeMissing {
                    program: self.runtime.program().to_string(),
                }
            } else {
                ContainerError::Spawn {
                    program: self.runtime.program().to_string(),
                    source,
                }
            }
        })
    }

    fn runtime_error(&self, args: &[String], output: &RuntimeOutput) -> ContainerError {
        warn!(code = ?output.code, stderr = %output.stderr.trim(), "container runtime call failed");
        ContainerError::Runtime {
            program: self.runtime.program().to_string(),
            args: args.join(" "),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        }
    }

    fn output_error(&self, args: &[String], detail: impl ToString) -> ContainerError {
        ContainerError::Output {
            program: self.runtime.program().to_string(),
            args: args.join(" "),
            detail: detail.to_string(),
        }
    }
}

/// Identifies the in-container process of an exec built by
/// [`ContainerManager::exec_tracked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTracker {
    pidfile: String,
}

impl ExecTracker {
    pub fn pidfile(&self) -> &str {
        &self.pidfile
    }
}

/// A disposable container, force-removed on drop.
pub struct EphemeralContainer<'a, R: ContainerRuntime> {
    manager: &'a ContainerManager<R>,
    name: String,
}

impl<R: ContainerRuntime> EphemeralContainer<'_, R> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R: ContainerRuntime> Drop for EphemeralContainer<'_, R> {
    fn drop(&mut self) {
        match self.manager.destroy(&self.name) {
            Ok(()) => debug!(name = %self.name, "ephemeral container removed"),
            Err(err) => warn!(name = %self.name, err = %err, "failed to remove ephemeral container"),
        }
    }
}

fn generate_name(kind: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{NAME_PREFIX}{kind}_{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRuntime;

    fn manager(runtime: FakeRuntime) -> ContainerManager<FakeRuntime> {
        ContainerManager::new(runtime, Path::new("/work/project"))
    }

    #[test]
    fn start_is_idempotent_for_same_name_and_image() {
        let mgr = manager(FakeRuntime::new());

        let first = mgr.start("python:3.12", Some("taskloop_dev")).expect("first start");
        let second = mgr.start("python:3.12", Some("taskloop_dev")).expect("second start");

        assert_eq!(first, "taskloop_dev");
        assert_eq!(second, first);
        assert!(mgr.exists("taskloop_dev").expect("exists"));
        assert_eq!(mgr.runtime().count_calls("run"), 1);
        assert_eq!(mgr.runtime().count_calls("pull"), 1);
    }

    #[test]
    fn start_restarts_stopped_container_without_pulling() {
        let runtime = FakeRuntime::new();
        runtime.insert("taskloop_dev", "alpine", false);
        let mgr = manager(runtime);

        assert!(!mgr.exists("taskloop_dev").expect("exists"));
        mgr.start("alpine", Some("taskloop_dev")).expect("start");
        assert!(mgr.exists("taskloop_dev").expect("exists"));
        assert_eq!(mgr.runtime().count_calls("pull"), 0);
        assert_eq!(mgr.runtime().count_calls("start"), 1);
    }

    #[test]
    fn start_generates_prefixed_name() {
        let mgr = manager(FakeRuntime::new());
        let name = mgr.start("alpine", None).expect("start");
        assert!(name.starts_with("taskloop_persistent_"));
        assert!(mgr.exists(&name).expect("exists"));
    }

    #[test]
    fn created_container_mounts_workdir_at_same_path() {
        let mgr = manager(FakeRuntime::new());
        mgr.start("alpine", Some("taskloop_dev")).expect("start");
        let run = mgr
            .runtime()
            .calls()
            .into_iter()
            .find(|args| args.first().map(String::as_str) == Some("run"))
            .expect("run call");
        assert!(run.windows(2).any(|w| w[0] == "-v" && w[1] == "/work/project:/work/project"));
        assert!(run.windows(2).any(|w| w[0] == "--label" && w[1] == MANAGED_LABEL));
    }

    #[test]
    fn stop_removes_container_and_reports_absence() {
        let mgr = manager(FakeRuntime::new());
        mgr.start("alpine", Some("taskloop_dev")).expect("start");

        assert!(mgr.stop("taskloop_dev").expect("stop"));
        assert!(!mgr.exists("taskloop_dev").expect("exists"));
        assert!(!mgr.stop("taskloop_dev").expect("second stop"));
    }

    #[test]
    fn list_reports_managed_containers() {
        let runtime = FakeRuntime::new();
        runtime.insert("taskloop_a", "alpine", true);
        runtime.insert("taskloop_b", "python:3.12", false);
        let mgr = manager(runtime);

        let records = mgr.list().expect("list");
        assert_eq!(records.len(), 2);
        assert_eq!(records["taskloop_a"].status, ContainerStatus::Running);
        assert_eq!(records["taskloop_b"].status, ContainerStatus::Stopped);
        assert_eq!(records["taskloop_b"].image, "python:3.12");
    }

    #[test]
    fn missing_runtime_is_classified() {
        let mgr = manager(FakeRuntime::missing());
        let err = mgr.start("alpine", Some("x")).unwrap_err();
        assert!(matches!(err, ContainerError::RuntimeMissing { .. }));
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn failed_pull_is_classified() {
        let runtime = FakeRuntime::new();
        runtime.fail_pulls("pull access denied for nope");
        let mgr = manager(runtime);
        let err = mgr.start("nope", Some("taskloop_x")).unwrap_err();
        assert!(matches!(err, ContainerError::ImagePull { ref image, .. } if image == "nope"));
    }

    #[test]
    fn ephemeral_container_is_destroyed_on_drop() {
        let mgr = manager(FakeRuntime::new());
        let name = {
            let eph = mgr.create_ephemeral("alpine").expect("create");
            assert!(mgr.exists(eph.name()).expect("exists"));
            eph.name().to_string()
        };
        assert!(name.starts_with("taskloop_ephemeral_"));
        assert!(!mgr.exists(&name).expect("exists"));
    }

    #[test]
    fn exec_command_targets_workdir_and_shell() {
        let mgr = manager(FakeRuntime::new());
        let cmd = mgr.exec_command("taskloop_dev", "/bin/sh", "ls -la");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let expected = ["exec", "-i", "-w", "/work/project", "taskloop_dev", "/bin/sh", "-c", "ls -la"];
        assert!(args.ends_with(&expected.map(String::from)), "{args:?}");
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/work/project")));
    }

    #[test]
    fn tracked_exec_records_pid_and_kill_targets_it() {
        let mgr = manager(FakeRuntime::new()).with_pid_dir("/run/taskloop/");
        let (cmd, tracker) = mgr.exec_tracked("taskloop_dev", "/bin/sh", "sleep 600");
        assert!(tracker.pidfile().starts_with("/run/taskloop/taskloop_exec_"));

        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let n = args.len();
        assert_eq!(args[n - 1], "sleep 600");
        assert_eq!(args[n - 3], "-c");
        assert!(args[n - 2].starts_with(&format!("echo $$ > {}", tracker.pidfile())));

        mgr.finish_exec("taskloop_dev", "/bin/sh", &tracker, true)
            .expect("kill");
        let kill = mgr.runtime().calls().pop().expect("kill call");
        assert_eq!(&kill[..4], ["exec", "taskloop_dev", "/bin/sh", "-c"]);
        assert!(kill[4].contains("kill -KILL"));
        assert!(kill[4].ends_with(&format!("rm -f {}", tracker.pidfile())));
    }
}
