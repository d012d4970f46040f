//! Test doubles for the loop's seams: completion, operator, container runtime,
//! and execution environment.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};

use crate::core::message::Message;
use crate::core::output::ExecOutcome;
use crate::io::approval::Operator;
use crate::io::completion::{Completion, CompletionClient};
use crate::io::container::{ContainerRuntime, RuntimeOutput};
use crate::io::environment::ExecutionEnvironment;

/// Completion client that replays canned replies in order.
///
/// Every request's message history is recorded for later inspection. Each reply
/// reports 10 prompt and 5 completion tokens.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl ScriptedCompletion {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
            prompt_tokens: 10,
            completion_tokens: 5,
        }
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("replies lock").len()
    }
}

impl CompletionClient for ScriptedCompletion {
    fn complete(&self, mut messages: Vec<Message>) -> Result<Completion> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(messages.clone());
        let Some(text) = self.replies.lock().expect("replies lock").pop_front() else {
            bail!("scripted completion exhausted");
        };
        messages.push(Message::assistant(text.clone()));
        Ok(Completion {
            text,
            messages,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        })
    }
}

/// Operator that answers every prompt from a fixed queue.
pub struct ScriptedOperator {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts and questions shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    fn answer(&self, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted operator has no response for: {prompt}"))
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&self, prompt: &str) -> Result<String> {
        self.answer(prompt)
    }

    fn ask(&self, question: &str, _options: &[String]) -> Result<String> {
        self.answer(question)
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    image: String,
    running: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<Vec<String>>,
    pull_failure: Option<String>,
}

/// In-memory container runtime.
///
/// Short subcommands mutate a container table the way the docker CLI would.
/// Long-running `exec` commands run the requested shell locally in the `-w`
/// directory.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    missing: bool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            missing: false,
        }
    }

    /// A runtime whose executable is not installed.
    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Self::new()
        }
    }

    pub fn insert(&self, name: &str, image: &str, running: bool) {
        self.state.lock().expect("state lock").containers.insert(
            name.to_string(),
            FakeContainer {
                image: image.to_string(),
                running,
            },
        );
    }

    /// Make every `pull` fail with `stderr`.
    pub fn fail_pulls(&self, stderr: &str) {
        self.state.lock().expect("state lock").pull_failure = Some(stderr.to_string());
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().expect("state lock").calls.clone()
    }

    pub fn count_calls(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .count()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("state lock")
            .containers
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn ok(stdout: impl Into<String>) -> RuntimeOutput {
    RuntimeOutput {
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn failed(code: i32, stderr: impl Into<String>) -> RuntimeOutput {
    RuntimeOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

fn no_such(name: &str) -> RuntimeOutput {
    failed(1, format!("Error: No such container: {name}"))
}

impl ContainerRuntime for FakeRuntime {
    fn program(&self) -> &str {
        "fake-docker"
    }

    fn run(&self, args: &[String]) -> io::Result<RuntimeOutput> {
        let mut state = self.state.lock().expect("state lock");
        state.calls.push(args.to_vec());
        if self.missing {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fake-docker not found"));
        }

        let sub = args.first().map(String::as_str).unwrap_or_default();
        let last = args.last().cloned().unwrap_or_default();
        let output = match sub {
            "inspect" => match state.containers.get(&last) {
                Some(c) => ok(format!(r#"[{{"State":{{"Running":{}}}}}]"#, c.running)),
                None => no_such(&last),
            },
            "start" | "stop" => match state.containers.get_mut(&last) {
                Some(c) => {
                    c.running = sub == "start";
                    ok(last)
                }
                None => no_such(&last),
            },
            "rm" => {
                let force = args.get(1).map(String::as_str) == Some("-f");
                match state.containers.remove(&last) {
                    Some(_) => ok(last),
                    None if force => ok(""),
                    None => no_such(&last),
                }
            }
            "pull" => match &state.pull_failure {
                Some(stderr) => failed(1, stderr.clone()),
                None => ok(format!("pulled {last}")),
            },
            "run" => {
                let name = args
                    .windows(2)
                    .find(|w| w[0] == "--name")
                    .map(|w| w[1].clone())
                    .unwrap_or_default();
                let image = args
                    .windows(2)
                    .find(|w| w[0] == "-t")
                    .map(|w| w[1].clone())
                    .unwrap_or_default();
                if state.containers.contains_key(&name) {
                    failed(
                        125,
                        format!("Conflict. The container name \"/{name}\" is already in use"),
                    )
                } else {
                    state.containers.insert(
                        name.clone(),
                        FakeContainer {
                            image,
                            running: true,
                        },
                    );
                    ok(name)
                }
            }
            "ps" => {
                let lines: Vec<String> = state
                    .containers
                    .iter()
                    .map(|(name, c)| {
                        serde_json::json!({
                            "Names": name,
                            "Image": c.image,
                            "State": if c.running { "running" } else { "exited" },
                            "CreatedAt": "2026-01-01 00:00:00 +0000 UTC",
                        })
                        .to_string()
                    })
                    .collect();
                ok(lines.join("\n"))
            }
            // Short execs (pid file cleanup, kills) are recorded, not run.
            "exec" => ok(""),
            other => failed(1, format!("unknown command \"{other}\"")),
        };
        Ok(output)
    }

    fn command(&self, args: &[String]) -> Command {
        self.state
            .lock()
            .expect("state lock")
            .calls
            .push(args.to_vec());
        // Positional args mirror `exec -i -w DIR NAME SHELL -c CMD`.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"cd "$4" && shift 5 && exec "$@""#)
            .arg("fake-docker")
            .args(args);
        cmd
    }
}

/// Environment that records commands and replays scripted outcomes.
///
/// Without a scripted outcome a command "succeeds" with no output.
pub struct RecordingEnvironment {
    workdir: PathBuf,
    commands: Mutex<Vec<String>>,
    outcomes: Mutex<VecDeque<std::result::Result<ExecOutcome, String>>>,
}

impl RecordingEnvironment {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            commands: Mutex::new(Vec::new()),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_outcome(&self, outcome: ExecOutcome) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push_back(Ok(outcome));
    }

    /// Next command fails to start with `message`.
    pub fn push_error(&self, message: &str) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push_back(Err(message.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }
}

impl ExecutionEnvironment for RecordingEnvironment {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run(&self, command: &str) -> Result<ExecOutcome> {
        self.commands
            .lock()
            .expect("commands lock")
            .push(command.to_string());
        match self.outcomes.lock().expect("outcomes lock").pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(ExecOutcome::exited(0, "", "")),
        }
    }
}
