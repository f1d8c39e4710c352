//! Model-assisted merge of free-form changes into a file.
//!
//! The merge model sees the original file with numbered lines and answers
//! with an edit script. Extraction or application failures retry the whole
//! call, rotating through the configured merge models, up to
//! `merge.max_attempts` times.

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::conversation::Message;
use crate::core::edit_script::{self, number_lines};
use crate::core::patch;
use crate::core::types::CancelToken;
use crate::io::config::AgentConfig;
use crate::io::model::{ChatModel, ChatRequest, call_with_retry};
use crate::io::prompt::merge_prompt;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Merge error. (Maximum extraction attempts exceeded.) {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },
    #[error("merge cancelled")]
    Cancelled,
}

pub struct Merger<'a> {
    model: &'a dyn ChatModel,
    config: &'a AgentConfig,
    cancel: CancelToken,
}

impl<'a> Merger<'a> {
    pub fn new(model: &'a dyn ChatModel, config: &'a AgentConfig, cancel: CancelToken) -> Self {
        Self {
            model,
            config,
            cancel,
        }
    }

    fn request(&self, attempt: u32, numbered: &str, changes: &str) -> ChatRequest {
        let messages = [
            Message::system(merge_prompt(self.config)),
            Message::user(format!("Original code:\n```\n{numbered}\n```")),
            Message::user(format!("Changes:\n```\n{changes}\n```")),
        ];
        ChatRequest {
            model: self.config.merge_model_for_attempt(attempt).to_string(),
            messages: messages.iter().map(Message::to_chat).collect(),
            temperature: self.config.temperature,
            stop: Vec::new(),
        }
    }

    /// Merge `changes` into `original`, returning the new text.
    #[instrument(skip_all, fields(original_len = original.len(), changes_len = changes.len()))]
    pub fn merge(&self, original: &str, changes: &str) -> Result<String, MergeError> {
        let numbered = number_lines(original);
        let max_attempts = self.config.merge.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let request = self.request(attempt, &numbered, changes);
            debug!(attempt, model = %request.model, "requesting merge script");
            let reply = call_with_retry(self.model, &request, &self.cancel, &self.config.retry)
                .ok_or(MergeError::Cancelled)?;

            let result = edit_script::parse(&reply, original)
                .map_err(|err| err.to_string())
                .and_then(|edits| patch::apply(original, &edits).map_err(|err| err.to_string()));
            match result {
                Ok(merged) => {
                    debug!(attempt, merged_len = merged.len(), "merge applied");
                    return Ok(merged);
                }
                Err(err) => {
                    warn!(attempt, err = %err, "merge attempt failed");
                    last_error = err;
                }
            }
        }

        Err(MergeError::AttemptsExhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}
