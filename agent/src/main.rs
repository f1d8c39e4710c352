//! Autonomous coding agent.
//!
//! Sends a task to a chat model, executes the directives in its replies
//! (shell commands, file writes, merges) inside a working directory, and
//! feeds the outcomes back until the model reports it is finished.

use std::fs;
use std::path::{Path, PathBuf};

use agent::console::{expand_prompt, resolve_workdir, run_console};
use agent::core::types::CancelToken;
use agent::exit_codes;
use agent::io::config::{AgentConfig, CONFIG_FILE, load_config, write_config};
use agent::io::files::{read_file, write_file};
use agent::io::history_store::{load_snapshot, snapshot_path};
use agent::io::merge::Merger;
use agent::io::model::build_chat_model;
use agent::orchestrator::{Orchestrator, start};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "agent", version, about = "Autonomous coding agent")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Increase diagnostic output on stderr (`-v`, `-vv`).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive session.
    Run {
        /// Working directory (default: next free `<workspace_root>/<n>`).
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// First input; `<newline>` becomes a line break.
        #[arg(long, conflicts_with = "prompt_file")]
        prompt: Option<String>,
        /// Read the first input from a file.
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        /// Restore the conversation snapshot of `--workdir`.
        #[arg(long, requires = "workdir")]
        resume: bool,
    },
    /// Write the default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Merge a free-form change description into a file with the merge model.
    Merge {
        original: PathBuf,
        changes: PathBuf,
        /// Write the result back to `original` instead of printing it.
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    agent::logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            workdir,
            prompt,
            prompt_file,
            resume,
        } => cmd_run(&cli.config, workdir, prompt, prompt_file, resume),
        Command::Merge {
            original,
            changes,
            write,
        } => cmd_merge(&cli.config, &original, &changes, write),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    let config = AgentConfig::default();
    write_config(path, &config)?;
    fs::create_dir_all(&config.workspace_root)
        .with_context(|| format!("create directory {}", config.workspace_root.display()))?;
    println!("Wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    config_path: &Path,
    workdir: Option<PathBuf>,
    prompt: Option<String>,
    prompt_file: Option<PathBuf>,
    resume: bool,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let workdir = resolve_workdir(&config.workspace_root, workdir)?;
    let initial_prompt = match (prompt, prompt_file) {
        (Some(prompt), _) => Some(expand_prompt(&prompt)),
        (None, Some(path)) => Some(read_file(&path)?),
        (None, None) => None,
    };

    let model = build_chat_model(&config, true)?;
    let merge_model = build_chat_model(&config, false)?;
    let orchestrator = if resume {
        let path = snapshot_path(&workdir);
        let (state, conversation) = load_snapshot(&path)?;
        info!(path = %path.display(), messages = conversation.len(), "resumed snapshot");
        Orchestrator::new(config, model, &workdir, conversation).with_state(state)
    } else {
        start(config, model, &workdir)?
    };
    run_console(orchestrator.with_merge_model(merge_model), initial_prompt)
}

fn cmd_merge(config_path: &Path, original: &Path, changes: &Path, write: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    let model = build_chat_model(&config, false)?;
    let original_text = read_file(original)?;
    let changes_text = read_file(changes)?;

    let merged = Merger::new(model.as_ref(), &config, CancelToken::new())
        .merge(&original_text, &changes_text)
        .with_context(|| format!("merge into {}", original.display()))?;

    if write {
        write_file(original, &merged)?;
        println!(
            "Code merged to {}: {} -> {} chars",
            original.display(),
            original_text.chars().count(),
            merged.chars().count()
        );
    } else {
        print!("{merged}");
    }
    Ok(exit_codes::OK)
}
