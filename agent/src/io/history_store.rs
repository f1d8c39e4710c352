//! Conversation snapshot storage (`<workspace_root>/<workdir>.history.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::conversation::{Conversation, Message};
use crate::core::types::RunState;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    state: &'a RunState,
    history: &'a Conversation,
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    state: RunState,
    history: Vec<Message>,
}

/// Snapshot path for a working directory: a sibling file named after it.
pub fn snapshot_path(workdir: &Path) -> PathBuf {
    let name = workdir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workdir".to_string());
    let parent = workdir.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{name}.history.json"))
}

/// Load a snapshot written by [`write_snapshot`].
pub fn load_snapshot(path: &Path) -> Result<(RunState, Conversation)> {
    debug!(path = %path.display(), "loading conversation snapshot");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse snapshot {}", path.display()))?;
    let conversation = Conversation::from_messages(snapshot.history).ok_or_else(|| {
        anyhow!(
            "snapshot {} does not start with a system message",
            path.display()
        )
    })?;
    debug!(messages = conversation.len(), "conversation snapshot loaded");
    Ok((snapshot.state, conversation))
}

/// Atomically write the conversation and run state (temp file + rename).
pub fn write_snapshot(path: &Path, state: &RunState, conversation: &Conversation) -> Result<()> {
    debug!(path = %path.display(), messages = conversation.len(), "writing conversation snapshot");
    let mut buf = serde_json::to_string_pretty(&SnapshotRef {
        state,
        history: conversation,
    })?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("snapshot path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp snapshot {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace snapshot {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn snapshot_round_trips_state_and_flags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = snapshot_path(&temp.path().join("3"));
        assert_eq!(path, temp.path().join("3.history.json"));

        let mut state = RunState::default();
        state.insert("phase", Value::from("build"));
        let mut conversation = Conversation::new("sys");
        conversation.push(Message::user("task"));
        conversation.push(Message::assistant("ok").perishable());
        conversation.push(Message::system("tree").expiring(1));

        write_snapshot(&path, &state, &conversation).expect("write");
        let (loaded_state, loaded) = load_snapshot(&path).expect("load");

        assert_eq!(loaded_state, state);
        assert_eq!(loaded, conversation);
    }

    #[test]
    fn snapshot_without_system_message_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.history.json");
        fs::write(
            &path,
            r#"{"state":{},"history":[{"role":"user","content":"hi"}]}"#,
        )
        .expect("write");
        assert!(load_snapshot(&path).is_err());
    }
}
