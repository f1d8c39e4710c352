//! Per-cycle context preparation and post-cycle bookkeeping.
//!
//! [`ContextManager::prepare`] runs right before each model call: it injects
//! a fresh workspace snapshot (expiring after one cycle), appends the new
//! user turn, enforces the perishable budget and image cap, and persists a
//! crash-recovery snapshot. [`ContextManager::finish_cycle`] appends the
//! assistant reply and ages expiring messages.

use tracing::{debug, instrument, warn};

use crate::core::conversation::{ChatMessage, Conversation, Message};
use crate::core::directive::OBSERVE_MARKER;
use crate::core::types::RunState;
use crate::core::window::{cap_images, expire, prune_perishable};
use crate::io::config::AgentConfig;
use crate::io::history_store::{snapshot_path, write_snapshot};
use crate::io::workspace::WorkspaceSnapshot;

/// Replies at most this many chars long get no reflective-pause marker.
const OBSERVE_MIN_REPLY_CHARS: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct ContextManager {
    perishable_budget: usize,
    max_image_messages: usize,
    file_tree_limit: usize,
}

impl ContextManager {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            perishable_budget: config.assistant_messages_length_limit,
            max_image_messages: config.max_image_messages,
            file_tree_limit: config.project_file_tree_length_limit,
        }
    }

    /// Bound the conversation for the next model call and return its wire form.
    #[instrument(skip_all, fields(messages = conversation.len(), has_input = input.is_some()))]
    pub fn prepare(
        &self,
        conversation: &mut Conversation,
        state: &RunState,
        input: Option<&str>,
        workspace: &dyn WorkspaceSnapshot,
    ) -> Vec<ChatMessage> {
        conversation.insert_after_system(self.snapshot_messages(workspace));
        if let Some(input) = input {
            conversation.push(Message::user(input));
        }

        let pruned = prune_perishable(conversation, self.perishable_budget);
        let evicted = cap_images(conversation, self.max_image_messages);
        debug!(pruned, evicted, total_cost = conversation.total_cost(), "context bounded");

        let path = snapshot_path(workspace.root());
        if let Err(err) = write_snapshot(&path, state, conversation) {
            warn!(err = %err, path = %path.display(), "failed to persist conversation snapshot");
        }
        conversation.to_chat()
    }

    /// Append the cycle's reply (if any) and age expiring messages.
    ///
    /// A cancelled cycle passes `None`: nothing is appended, but expiry still
    /// runs so the injected snapshot does not outlive the cycle.
    pub fn finish_cycle(&self, conversation: &mut Conversation, reply: Option<&str>) {
        if let Some(reply) = reply.filter(|reply| !reply.is_empty()) {
            conversation.push(Message::assistant(with_observe_marker(reply)).perishable());
        }
        let expired = expire(conversation);
        debug!(expired, messages = conversation.len(), "cycle finished");
    }

    fn snapshot_messages(&self, workspace: &dyn WorkspaceSnapshot) -> Vec<Message> {
        let mut messages = Vec::new();
        match workspace.file_tree(self.file_tree_limit) {
            Ok(tree) => messages.push(
                Message::system(format!(
                    "[Below are the up-to-date contents of CODEBASE FILE TREE. CWD: {}]\n{tree}",
                    workspace.root().display()
                ))
                .expiring(1),
            ),
            Err(err) => warn!(err = %err, "failed to render file tree"),
        }
        match workspace.visible_files() {
            Ok(files) => messages.extend(
                files
                    .into_iter()
                    .map(|file| Message::system(file).expiring(1)),
            ),
            Err(err) => warn!(err = %err, "failed to collect visible files"),
        }
        messages
    }
}

/// Append the reflective-pause marker to a non-trivial reply.
pub fn with_observe_marker(reply: &str) -> String {
    if reply.chars().count() > OBSERVE_MIN_REPLY_CHARS {
        format!("{reply}\n{OBSERVE_MARKER}")
    } else {
        reply.to_string()
    }
}
