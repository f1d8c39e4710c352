//! Interactive front end: stdin lines, `%` control commands, and Ctrl-C.
//!
//! Lines arriving within [`COALESCE_WINDOW`] of each other form one input;
//! grouping uses arrival time, so inputs typed during a run stay separate
//! and are queued in order. Ctrl-C cancels the in-flight run; with nothing in
//! flight it exits.

use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::exit_codes;
use crate::io::workspace::{allocate_workdir, named_workdir};
use crate::orchestrator::{CancelHandle, CycleEvent, LoopStop, Orchestrator, RunOutcome};

pub const COALESCE_WINDOW: Duration = Duration::from_millis(100);

const AVAILABLE_COMMANDS: &str = "%reset, %state, %dir, %cd <name>, %model <name>";

/// A `%`-prefixed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Reset,
    State,
    Dir,
    Cd(Option<String>),
    Model(Option<String>),
    Unknown(String),
}

impl ControlCommand {
    /// Parse a console line; `None` when it is not a command.
    pub fn parse(line: &str) -> Option<Self> {
        let payload = line.strip_prefix('%')?;
        let mut words = payload.split_whitespace();
        let name = words.next().unwrap_or_default();
        let arg = words.next().map(str::to_string);
        Some(match name {
            "reset" => Self::Reset,
            "state" => Self::State,
            "dir" => Self::Dir,
            "cd" => Self::Cd(arg),
            "model" => Self::Model(arg),
            other => Self::Unknown(other.to_string()),
        })
    }

    /// Apply the command, returning the text to print.
    pub fn apply(self, orchestrator: &mut Orchestrator) -> Result<String> {
        Ok(match self {
            Self::Reset => {
                orchestrator.reset();
                "Conversation reset.".to_string()
            }
            Self::State => {
                serde_json::to_string_pretty(orchestrator.state()).context("serialize run state")?
            }
            Self::Dir => format!("Current CWD: {}", orchestrator.workdir().display()),
            Self::Cd(None) => "No directory specified.".to_string(),
            Self::Cd(Some(name)) => {
                let root = orchestrator.config().workspace_root.clone();
                let dir = named_workdir(&root, &name)?;
                orchestrator.set_workdir(&dir);
                format!("CWD changed to: {}", dir.display())
            }
            Self::Model(None) => "Model not specified.".to_string(),
            Self::Model(Some(model)) => {
                orchestrator.set_model(&model);
                format!("Model set to: {model}")
            }
            Self::Unknown(name) => {
                format!("Unknown command %{name}. Available commands: {AVAILABLE_COMMANDS}")
            }
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ConsoleEvent {
    Input(String),
    Interrupt,
    Eof,
}

/// Expand `<newline>` placeholders in a command-line prompt.
pub fn expand_prompt(prompt: &str) -> String {
    prompt.replace("<newline>", "\n")
}

fn spawn_stdin_reader(tx: Sender<ConsoleEvent>) {
    let (line_tx, line_rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(err = %err, "stdin read failed");
                    return;
                }
            }
        }
    });
    thread::spawn(move || debounce_lines(&line_rx, &tx));
}

/// Group lines arriving within [`COALESCE_WINDOW`] of each other into one
/// input event. A `%` line is always an input of its own. Sends `Eof` once
/// the line source closes.
fn debounce_lines(lines: &Receiver<String>, tx: &Sender<ConsoleEvent>) {
    let mut group: Vec<String> = Vec::new();
    loop {
        let next = if group.is_empty() {
            lines.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            lines.recv_timeout(COALESCE_WINDOW)
        };
        let sent = match next {
            Ok(line) if ControlCommand::parse(&line).is_some() => {
                flush_group(&mut group, tx) && tx.send(ConsoleEvent::Input(line)).is_ok()
            }
            Ok(line) => {
                group.push(line);
                true
            }
            Err(RecvTimeoutError::Timeout) => flush_group(&mut group, tx),
            Err(RecvTimeoutError::Disconnected) => {
                if flush_group(&mut group, tx) {
                    let _ = tx.send(ConsoleEvent::Eof);
                }
                return;
            }
        };
        if !sent {
            return;
        }
    }
}

/// Send the pending group as one input. False once the receiver is gone.
fn flush_group(group: &mut Vec<String>, tx: &Sender<ConsoleEvent>) -> bool {
    if group.is_empty() {
        return true;
    }
    let input = group.join("\n");
    group.clear();
    tx.send(ConsoleEvent::Input(input)).is_ok()
}

fn spawn_interrupt_listener(tx: Sender<ConsoleEvent>, handle: CancelHandle) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::spawn(move || {
        runtime.block_on(async move {
            loop {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(err = %err, "ctrl-c listener failed");
                    return;
                }
                if handle.interrupt() {
                    println!("\n[Interrupted]");
                    continue;
                }
                if tx.send(ConsoleEvent::Interrupt).is_err() {
                    return;
                }
            }
        });
    });
    Ok(())
}

fn print_event(event: CycleEvent<'_>, echoed: bool) {
    match event {
        CycleEvent::State(state) => debug!(state = ?state, "agent state"),
        CycleEvent::Reply(reply) => {
            if echoed {
                println!();
            } else {
                println!("{reply}");
            }
        }
        CycleEvent::Outcome(message) => println!("{}", message.content.text()),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome.stop {
        LoopStop::Finished => {}
        LoopStop::LimitReached { limit } => {
            println!("[Autonomous running limit of {limit} reached. Waiting for input.]");
        }
        LoopStop::Cancelled => println!("[Cancelled]"),
    }
}

fn drain_and_print(orchestrator: &mut Orchestrator) -> bool {
    let echoed = orchestrator.model_echoes();
    let outcomes = orchestrator.run_pending(|event| print_event(event, echoed));
    outcomes.iter().for_each(print_outcome);
    outcomes
        .last()
        .is_some_and(|outcome| outcome.stop == LoopStop::Cancelled)
}

/// Queue every input that is already waiting, stopping at the first control
/// command or non-input event, which is returned for the main loop.
fn enqueue_ready(orchestrator: &mut Orchestrator, rx: &Receiver<ConsoleEvent>) -> Option<ConsoleEvent> {
    while let Ok(event) = rx.try_recv() {
        match event {
            ConsoleEvent::Input(input) if ControlCommand::parse(&input).is_none() => {
                if !input.trim().is_empty() {
                    orchestrator.submit(input);
                }
            }
            other => return Some(other),
        }
    }
    None
}

/// Discard input typed while a cancelled run was unwinding.
fn discard_buffered(rx: &Receiver<ConsoleEvent>) -> Option<ConsoleEvent> {
    let mut dropped = 0usize;
    while let Ok(event) = rx.try_recv() {
        match event {
            ConsoleEvent::Input(_) => dropped += 1,
            other => return Some(other),
        }
    }
    if dropped > 0 {
        debug!(dropped, "discarded buffered input after cancel");
    }
    None
}

/// Run the interactive loop until EOF or an idle Ctrl-C. Returns the exit code.
pub fn run_console(mut orchestrator: Orchestrator, initial_prompt: Option<String>) -> Result<i32> {
    let (tx, rx) = mpsc::channel();
    spawn_interrupt_listener(tx.clone(), orchestrator.cancel_handle())?;
    spawn_stdin_reader(tx);

    println!("Working directory: {}", orchestrator.workdir().display());
    let mut deferred = None;
    if let Some(prompt) = initial_prompt {
        orchestrator.submit(prompt);
        if drain_and_print(&mut orchestrator) {
            deferred = discard_buffered(&rx);
        }
    }

    loop {
        let event = match deferred.take() {
            Some(event) => event,
            None => rx.recv().unwrap_or(ConsoleEvent::Eof),
        };
        let input = match event {
            ConsoleEvent::Interrupt => return Ok(exit_codes::INTERRUPTED),
            ConsoleEvent::Eof => return Ok(exit_codes::OK),
            ConsoleEvent::Input(input) => input,
        };

        if let Some(command) = ControlCommand::parse(&input) {
            match command.apply(&mut orchestrator) {
                Ok(text) => println!("{text}"),
                Err(err) => println!("{err:#}"),
            }
            continue;
        }
        if input.trim().is_empty() {
            continue;
        }
        orchestrator.submit(input);
        deferred = enqueue_ready(&mut orchestrator, &rx);
        if drain_and_print(&mut orchestrator) {
            deferred = discard_buffered(&rx).or(deferred);
        }
    }
}

/// Resolve the working directory for `agent run`.
pub fn resolve_workdir(workspace_root: &Path, explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
            Ok(dir)
        }
        None => allocate_workdir(workspace_root),
    }
}
