//! System prompts for the agent and the merge model.

use std::env;
use std::path::Path;

use anyhow::Result;
use chrono::Local;
use minijinja::{Environment, context};
use tracing::debug;

use crate::io::config::AgentConfig;
use crate::io::session::Language;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const MERGE_PROMPT: &str = include_str!("prompts/merge.md");

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        Self { env }
    }

    fn render_system(&self, workdir: &Path) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            os => env::consts::OS,
            datetime => Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string(),
            workdir => workdir.display().to_string(),
            shell => Language::host_shell().key(),
        })?;
        Ok(rendered)
    }
}

/// The agent system prompt: the configured override, or the embedded template.
///
/// Both end with a user-info block naming the OS, time, and working directory.
pub fn system_prompt(config: &AgentConfig, workdir: &Path) -> Result<String> {
    let prompt = match &config.system_message {
        Some(custom) => format!(
            "{}\n\n[User Info]\nOS: {}\nDateTime: {}\nWorking directory: {}\n",
            custom.trim_end(),
            env::consts::OS,
            Local::now().format("%Y-%m-%d %H:%M:%S %Z"),
            workdir.display()
        ),
        None => PromptEngine::new().render_system(workdir)?,
    };
    debug!(chars = prompt.len(), custom = config.system_message.is_some(), "built system prompt");
    Ok(prompt)
}

/// System message for the merge model.
pub fn merge_prompt(config: &AgentConfig) -> &str {
    config
        .merge
        .system_message
        .as_deref()
        .unwrap_or(MERGE_PROMPT)
}
