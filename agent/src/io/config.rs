//! Agent configuration stored in `agent.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, resolved against the current directory.
pub const CONFIG_FILE: &str = "agent.toml";

/// Model name that rotates through `models_if_cycle`.
pub const CYCLE_MODEL: &str = "cycle";

/// Agent configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier, or `"cycle"` to rotate through `models_if_cycle`.
    pub model: String,
    pub models_if_cycle: Vec<String>,
    pub temperature: f32,

    /// Replaces the embedded system prompt template when set.
    pub system_message: Option<String>,

    /// Maximum model calls per input, counting the first one.
    pub autonomous_running_limit: u32,

    /// Budget for the summed cost of perishable messages.
    pub assistant_messages_length_limit: usize,
    pub max_image_messages: usize,
    pub project_file_tree_length_limit: usize,
    pub visible_file_size_limit_kb: usize,

    /// Execution output beyond this many chars has its middle omitted.
    pub console_command_output_max_length: usize,

    /// Sent when a reply carries no directives and no terminal marker.
    pub no_code_message: String,

    pub execution_timeout_secs: u64,
    pub abort_poll_interval_ms: u64,
    pub interrupt_grace_ms: u64,

    /// Parent directory of per-run working directories.
    pub workspace_root: PathBuf,

    pub retry: RetryConfig,
    pub merge: MergeConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    /// Rotated by attempt number.
    pub models: Vec<String>,
    /// Replaces the embedded merge prompt when set.
    pub system_message: Option<String>,
    pub max_attempts: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
            system_message: None,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible streaming chat completions over HTTP.
    Openai,
    /// A local command reading the request JSON on stdin.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Argv for `kind = "command"`.
    pub command: Vec<String>,
    /// Connect timeout and longest silence on a streamed reply; the command
    /// provider uses it as a whole-call limit.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Openai,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            command: Vec::new(),
            request_timeout_secs: 180,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            models_if_cycle: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
            temperature: 0.0,
            system_message: None,
            autonomous_running_limit: 10,
            assistant_messages_length_limit: 40_000,
            max_image_messages: 3,
            project_file_tree_length_limit: 4_000,
            visible_file_size_limit_kb: 30,
            console_command_output_max_length: 6_000,
            no_code_message: "No code block or directive was found in your last message. \
                Continue with the task using the available directives, or write [[FINISHED]] \
                if the task is complete or [[CALL_USER]] if you need input."
                .to_string(),
            execution_timeout_secs: 180,
            abort_poll_interval_ms: 100,
            interrupt_grace_ms: 100,
            workspace_root: PathBuf::from("files"),
            retry: RetryConfig::default(),
            merge: MergeConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if self.model == CYCLE_MODEL && self.models_if_cycle.is_empty() {
            return Err(anyhow!("models_if_cycle must be non-empty when model = \"cycle\""));
        }
        if self.autonomous_running_limit == 0 {
            return Err(anyhow!("autonomous_running_limit must be > 0"));
        }
        if self.console_command_output_max_length == 0 {
            return Err(anyhow!("console_command_output_max_length must be > 0"));
        }
        if self.execution_timeout_secs == 0 {
            return Err(anyhow!("execution_timeout_secs must be > 0"));
        }
        if self.abort_poll_interval_ms == 0 {
            return Err(anyhow!("abort_poll_interval_ms must be > 0"));
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(anyhow!(
                "retry.base_delay_ms must be > 0 and <= retry.max_delay_ms"
            ));
        }
        if self.merge.max_attempts == 0 {
            return Err(anyhow!("merge.max_attempts must be > 0"));
        }
        if self.merge.models.iter().all(|model| model.trim().is_empty()) {
            return Err(anyhow!("merge.models must name at least one model"));
        }
        if self.provider.kind == ProviderKind::Command
            && self
                .provider
                .command
                .first()
                .is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!(
                "provider.command must be a non-empty array when provider.kind = \"command\""
            ));
        }
        if self.provider.request_timeout_secs == 0 {
            return Err(anyhow!("provider.request_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Model for the `call_index`-th call (0-based).
    pub fn model_for_call(&self, call_index: usize) -> &str {
        if self.model == CYCLE_MODEL && !self.models_if_cycle.is_empty() {
            return &self.models_if_cycle[call_index % self.models_if_cycle.len()];
        }
        &self.model
    }

    /// Merge model for `attempt` (1-based).
    pub fn merge_model_for_attempt(&self, attempt: u32) -> &str {
        let models: Vec<&String> = self
            .merge
            .models
            .iter()
            .filter(|model| !model.trim().is_empty())
            .collect();
        if models.is_empty() {
            return &self.model;
        }
        let index = attempt.saturating_sub(1) as usize % models.len();
        models[index]
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn abort_poll_interval(&self) -> Duration {
        Duration::from_millis(self.abort_poll_interval_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
