//! Autonomous tool-use loop CLI.
//!
//! `taskloop run` drives a model through a task in a working directory until it
//! calls `attempt_completion`. `taskloop container` manages the persistent
//! containers that `run --container NAME` executes commands in.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use taskloop::dispatch::Dispatcher;
use taskloop::exit_codes;
use taskloop::io::approval::{ApprovalGate, Operator, TerminalOperator};
use taskloop::io::completion::OpenRouterClient;
use taskloop::io::config::{ApprovalMode, TaskConfig, default_config_path, load_config};
use taskloop::io::container::{CliRuntime, ContainerManager};
use taskloop::io::environment::{ExecutionTarget, build_environment};
use taskloop::io::interrupt::Interrupt;
use taskloop::io::prompt::load_rules;
use taskloop::io::transcript::Transcript;
use taskloop::logging;
use taskloop::session::{ConversationSession, SessionError, TaskRequest, render_event};

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Drive a language model through a task with approved tool use"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task until the model calls attempt_completion.
    Run(RunArgs),
    /// Manage persistent containers for `run --container`.
    #[command(subcommand)]
    Container(ContainerCommand),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Task instructions (or use --file).
    instructions: Option<String>,

    /// Read task instructions from a file.
    #[arg(short = 'f', long = "file", conflicts_with = "instructions")]
    file: Option<PathBuf>,

    /// Model identifier (overrides config).
    #[arg(short, long)]
    model: Option<String>,

    /// Append a transcript of the conversation to this file.
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// Unattended: never prompt; anything needing input fails in-band.
    #[arg(long)]
    auto: bool,

    /// Approve every command and script without asking.
    #[arg(long)]
    approve_all: bool,

    /// Run commands directly on the host.
    #[arg(long, conflicts_with_all = ["container", "image"])]
    no_container: bool,

    /// Run commands in this running persistent container.
    #[arg(long, conflicts_with = "image")]
    container: Option<String>,

    /// Image for the per-command ephemeral containers (default target).
    #[arg(long)]
    image: Option<String>,

    /// Extra rules appended to the system prompt.
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Working directory for the task (default: current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Config file (default: <cwd>/.taskloop/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ContainerCommand {
    /// Start (or reuse) a named container with the current directory mounted.
    Start {
        #[arg(long)]
        image: String,
        /// Container name (generated when omitted).
        #[arg(long)]
        name: Option<String>,
    },
    /// Stop and remove a container.
    Stop { name: String },
    /// List containers created by taskloop.
    List,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => report_failure(&err),
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Container(cmd) => cmd_container(cmd),
    }
}

/// Print the error and map it to an exit code.
fn report_failure(err: &anyhow::Error) -> i32 {
    eprintln!("{err:#}");
    match err.downcast_ref::<SessionError>() {
        Some(SessionError::NoToolFound { content }) => {
            eprintln!("Message content:\n{content}");
            exit_codes::FAILED
        }
        Some(SessionError::TurnLimit { .. }) => exit_codes::TURN_LIMIT,
        Some(SessionError::Interrupted) => exit_codes::INTERRUPTED,
        None => exit_codes::FAILED,
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let cwd = resolve_cwd(args.cwd.as_deref())?;
    dotenvy::dotenv().ok();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&cwd));
    let mut cfg = load_config(&config_path)?;
    apply_overrides(&mut cfg, &args);
    cfg.validate()?;

    let instructions = read_instructions(&args)?;
    let rules = args.rules.as_deref().map(load_rules).transpose()?;
    let target = select_target(&args, &cfg);

    let interrupt = Interrupt::install()?;
    let environment = build_environment(&target, &cwd, &cfg, &interrupt);
    let terminal = TerminalOperator;
    let operator: Option<&dyn Operator> = if args.auto { None } else { Some(&terminal) };
    let gate = ApprovalGate::new(cfg.approval.mode, operator);
    let dispatcher = Dispatcher::new(environment.as_ref(), gate, operator, &cfg.script);
    let client = OpenRouterClient::from_config(&cfg)?;

    let mut session = ConversationSession::new(&client, &dispatcher, interrupt, cfg.max_turns);
    println!("Model: {}", cfg.model);
    println!("Working directory: {}", cwd.display());
    println!("Execution target: {target}");
    if let Some(path) = &args.log_file {
        let transcript = Transcript::open(path)?;
        println!("Transcript: {}", transcript.path().display());
        session = session.with_transcript(transcript);
    }
    let request = TaskRequest {
        instructions,
        cwd,
        rules,
    };
    let outcome = session.run(&request, |event| println!("\n{}", render_event(event)))?;
    println!(
        "\nTurns: {}\nTotal prompt tokens: {}\nTotal completion tokens: {}",
        outcome.turns, outcome.prompt_tokens, outcome.completion_tokens
    );
    Ok(exit_codes::OK)
}

fn cmd_container(cmd: ContainerCommand) -> Result<i32> {
    let cwd = resolve_cwd(None)?;
    let cfg = load_config(&default_config_path(&cwd))?;
    let manager = ContainerManager::new(CliRuntime::new(&cfg.container.runtime), &cwd);
    match cmd {
        ContainerCommand::Start { image, name } => {
            let name = manager.start(&image, name.as_deref())?;
            println!("{name}");
        }
        ContainerCommand::Stop { name } => {
            if manager.stop(&name)? {
                println!("Stopped and removed {name}");
            } else {
                println!("No container named {name}");
            }
        }
        ContainerCommand::List => {
            let records = manager.list()?;
            if records.is_empty() {
                println!("No taskloop containers");
            }
            for record in records.values() {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.name,
                    record.image,
                    record.status.as_str(),
                    record.created_at
                );
            }
        }
    }
    Ok(exit_codes::OK)
}

/// Absolute working directory; containers mount it at the identical path.
fn resolve_cwd(cwd: Option<&Path>) -> Result<PathBuf> {
    let dir = match cwd {
        Some(dir) => dir.to_path_buf(),
        None => env::current_dir().context("read current directory")?,
    };
    fs::canonicalize(&dir).with_context(|| format!("resolve working directory {}", dir.display()))
}

fn apply_overrides(cfg: &mut TaskConfig, args: &RunArgs) {
    if let Some(model) = &args.model {
        cfg.model = model.clone();
    }
    if args.approve_all {
        cfg.approval.mode = ApprovalMode::Auto;
    }
}

fn read_instructions(args: &RunArgs) -> Result<String> {
    let instructions = match (&args.instructions, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("read instructions file {}", path.display()))?,
        (None, None) => bail!("provide task instructions inline or with --file"),
    };
    if instructions.trim().is_empty() {
        bail!("task instructions are empty");
    }
    Ok(instructions)
}

fn select_target(args: &RunArgs, cfg: &TaskConfig) -> ExecutionTarget {
    if args.no_container {
        return ExecutionTarget::Host;
    }
    if let Some(name) = &args.container {
        return ExecutionTarget::PersistentContainer { name: name.clone() };
    }
    ExecutionTarget::EphemeralContainer {
        image: args
            .image
            .clone()
            .unwrap_or_else(|| cfg.container.default_image.clone()),
    }
}
