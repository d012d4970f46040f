//! Supervised child processes: full output capture, timeout, and interrupt.
//!
//! Children are spawned into their own process group so that a timeout or an
//! operator interrupt kills the whole tree, not only the direct child.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::output::{ExecOutcome, Termination};
use crate::io::interrupt::Interrupt;

/// How often the supervisor checks the interrupt flag while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Limits applied to a supervised run.
#[derive(Debug, Clone)]
pub struct Supervision {
    pub timeout: Duration,
    pub interrupt: Interrupt,
}

/// Run a command to completion, capturing stdout/stderr in full.
///
/// Output is drained on reader threads while the child runs so pipes never
/// fill up. On timeout or interrupt the child's process group is killed and the
/// output captured so far is still returned. Background processes the command
/// leaves behind in its group are killed once the child exits, so the readers
/// always reach end-of-file.
#[instrument(skip_all, fields(timeout_secs = supervision.timeout.as_secs()))]
pub fn run_supervised(mut cmd: Command, supervision: &Supervision) -> Result<ExecOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream(stdout));
    let stderr_handle = thread::spawn(move || read_stream(stderr));

    let termination = wait_supervised(&mut child, supervision)?;

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(?termination, "command finished");
    Ok(ExecOutcome {
        termination,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn wait_supervised(child: &mut Child, supervision: &Supervision) -> Result<Termination> {
    let deadline = Instant::now() + supervision.timeout;
    loop {
        if supervision.interrupt.take() {
            warn!("command interrupted, killing process group");
            kill_tree(child)?;
            return Ok(Termination::Interrupted);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                timeout_secs = supervision.timeout.as_secs(),
                "command timed out, killing process group"
            );
            kill_tree(child)?;
            return Ok(Termination::TimedOut {
                after_secs: supervision.timeout.as_secs(),
            });
        }

        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            kill_leftovers(child);
            return Ok(Termination::Exited(status.code()));
        }
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// Kill the child's whole process group and reap the child.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!(err = %err, "killpg failed, killing direct child only");
            child.kill().context("kill command")?;
        }
    }
    child.wait().context("wait command after kill")?;
    Ok(())
}

/// Kill processes still in the group of an already reaped child.
///
/// The group id stays reserved while any member is alive, so it cannot have
/// been reused.
#[cfg(unix)]
fn kill_leftovers(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!("killed background processes left by command"),
        Err(Errno::ESRCH) => {}
        Err(err) => warn!(err = %err, "failed to kill leftover process group"),
    }
}

#[cfg(not(unix))]
fn kill_leftovers(_child: &Child) {}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")?;
    Ok(())
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).context("read output")?;
    Ok(buf)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervision(timeout: Duration) -> Supervision {
        Supervision {
            timeout,
            interrupt: Interrupt::new(),
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams_and_exit_code() {
        let out = run_supervised(
            sh("echo out; echo err >&2; exit 3"),
            &supervision(Duration::from_secs(10)),
        )
        .expect("run");
        assert_eq!(out.termination, Termination::Exited(Some(3)));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[test]
    fn large_output_is_not_truncated() {
        let out = run_supervised(
            sh("i=0; while [ $i -lt 20000 ]; do echo 0123456789; i=$((i+1)); done"),
            &supervision(Duration::from_secs(30)),
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout.len(), 20000 * 11);
    }

    #[test]
    fn timeout_kills_process_group() {
        let start = Instant::now();
        let out = run_supervised(
            sh("sleep 30 & sleep 30; echo never"),
            &supervision(Duration::from_millis(300)),
        )
        .expect("run");
        assert_eq!(out.termination, Termination::TimedOut { after_secs: 0 });
        assert!(!out.stdout.contains("never"));
        // Reader threads only finish once every process holding the pipes is gone.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn background_process_does_not_hold_the_result() {
        let start = Instant::now();
        let out = run_supervised(
            sh("sleep 30 & echo hi"),
            &supervision(Duration::from_secs(20)),
        )
        .expect("run");
        assert_eq!(out.termination, Termination::Exited(Some(0)));
        assert_eq!(out.stdout, "hi\n");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn raised_interrupt_stops_command_and_is_consumed() {
        let sup = supervision(Duration::from_secs(30));
        let trigger = sup.interrupt.clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.raise();
        });

        let out = run_supervised(sh("echo started; sleep 30"), &sup).expect("run");
        raiser.join().expect("join");
        assert_eq!(out.termination, Termination::Interrupted);
        assert_eq!(out.stdout, "started\n");
        assert!(!sup.interrupt.is_raised());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_supervised(
            Command::new("/nonexistent/taskloop-binary"),
            &supervision(Duration::from_secs(1)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
