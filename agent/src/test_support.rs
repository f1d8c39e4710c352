//! Test-only helpers: a scripted chat model and workspace fixtures.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::conversation::Conversation;
use crate::core::directive::FINISHED_MARKER;
use crate::core::types::CancelToken;
use crate::io::config::AgentConfig;
use crate::io::model::{ChatModel, ChatRequest};
use crate::orchestrator::Orchestrator;

/// System prompt used by [`TempWorkspace::orchestrator`].
pub const TEST_SYSTEM_PROMPT: &str = "You are a coding agent.";

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    /// Transport failure with the given message.
    Fail(String),
    /// Trip the caller's cancel token, then return the text.
    Interrupt(String),
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    requests: Vec<ChatRequest>,
}

/// A chat model that replays a fixed script and records every request.
///
/// Clones share the script, so a test can keep one handle after boxing
/// another. Once the script runs out every call replies `[[FINISHED]]`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedChatModel {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedChatModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_steps(replies.into_iter().map(|reply| Step::Reply(reply.into())))
    }

    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Script {
                steps: steps.into_iter().collect(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.inner
            .lock()
            .map(|script| script.requests.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests().len()
    }
}

impl ChatModel for ScriptedChatModel {
    fn complete(&self, request: &ChatRequest, cancel: &CancelToken) -> Result<String> {
        let mut script = self
            .inner
            .lock()
            .map_err(|_| anyhow!("scripted model lock poisoned"))?;
        script.requests.push(request.clone());
        match script.steps.pop_front() {
            Some(Step::Reply(text)) => Ok(text),
            Some(Step::Fail(message)) => Err(anyhow!(message)),
            Some(Step::Interrupt(text)) => {
                cancel.cancel();
                Ok(text)
            }
            None => Ok(FINISHED_MARKER.to_string()),
        }
    }
}

/// A temporary workspace root holding one working directory, `0`.
///
/// Removed on drop.
pub struct TempWorkspace {
    dir: TempDir,
    workdir: PathBuf,
}

impl TempWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let workdir = dir.path().join("0");
        fs::create_dir_all(&workdir)
            .with_context(|| format!("create directory {}", workdir.display()))?;
        Ok(Self { dir, workdir })
    }

    /// The workspace root; snapshots land here.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// An orchestrator over the working directory, driven by `model`.
    pub fn orchestrator(&self, config: AgentConfig, model: &ScriptedChatModel) -> Orchestrator {
        let config = AgentConfig {
            workspace_root: self.root().to_path_buf(),
            ..config
        };
        Orchestrator::new(
            config,
            Box::new(model.clone()),
            &self.workdir,
            Conversation::new(TEST_SYSTEM_PROMPT),
        )
    }
}

/// Defaults tuned for tests: instant retries and short execution timeouts.
pub fn fast_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config.execution_timeout_secs = 10;
    config.abort_poll_interval_ms = 10;
    config.interrupt_grace_ms = 10;
    config
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(&path, contents).expect("write fixture file");
}

/// Read `root/rel` as UTF-8.
pub fn read_file(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).expect("read fixture file")
}
