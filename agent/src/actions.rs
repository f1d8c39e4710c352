//! Directive execution: one outcome message per directive, in reply order.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::conversation::Message;
use crate::core::directive::{self, Action, Directive};
use crate::core::patch::{PatchError, replace_unique};
use crate::core::types::CancelToken;
use crate::core::window::crop_output;
use crate::io::config::AgentConfig;
use crate::io::files::{append_file, read_file, resolve, write_file};
use crate::io::merge::{MergeError, Merger};
use crate::io::model::ChatModel;
use crate::io::session::{ExecutionEngine, Language};

/// What executing one reply produced.
#[derive(Debug, Default)]
pub struct ActionReport {
    /// Outcome messages to append, in directive order.
    pub messages: Vec<Message>,
    /// Side-effecting directives found in the reply.
    pub directives: usize,
    /// The reply carried `[[FINISHED]]` or `[[CALL_USER]]`.
    pub terminal: bool,
    /// Cancellation was observed while executing.
    pub cancelled: bool,
}

pub struct ActionRunner<'a> {
    engine: &'a ExecutionEngine,
    merge_model: &'a dyn ChatModel,
    config: &'a AgentConfig,
}

impl<'a> ActionRunner<'a> {
    pub fn new(
        engine: &'a ExecutionEngine,
        merge_model: &'a dyn ChatModel,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            engine,
            merge_model,
            config,
        }
    }

    /// Execute every directive in `reply`, reporting each outcome through
    /// `on_outcome` as soon as it is known.
    #[instrument(skip_all, fields(reply_len = reply.len()))]
    pub fn run<F: FnMut(&Message)>(
        &self,
        reply: &str,
        cancel: &CancelToken,
        mut on_outcome: F,
    ) -> ActionReport {
        let directives = directive::extract(reply);
        let mut report = ActionReport {
            directives: directives.len(),
            terminal: directive::has_terminal_marker(reply),
            ..ActionReport::default()
        };

        for directive in &directives {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(message) = self.run_one(directive, cancel) else {
                report.cancelled = true;
                break;
            };
            on_outcome(&message);
            report.messages.push(message);
        }
        report.cancelled |= cancel.is_cancelled();

        if report.directives == 0 && !report.terminal && !report.cancelled {
            let filler = Message::user(self.config.no_code_message.clone()).expiring(2);
            on_outcome(&filler);
            report.messages.push(filler);
        }
        debug!(
            directives = report.directives,
            outcomes = report.messages.len(),
            terminal = report.terminal,
            cancelled = report.cancelled,
            "actions executed"
        );
        report
    }

    /// Outcome message for one directive; `None` when cancelled mid-way.
    fn run_one(&self, directive: &Directive, cancel: &CancelToken) -> Option<Message> {
        let action = match directive.action() {
            Ok(action) => action,
            Err(err) => {
                warn!(name = %directive.name, err = %err, "rejected directive");
                return Some(
                    Message::system(format!("[Error running [[{}]]: {err}]", directive.name))
                        .perishable(),
                );
            }
        };
        let workdir = self.engine.workdir();
        match action {
            Action::RunShellCommand { command } => {
                Some(self.run_command(directive.sequence_index, &command))
            }
            Action::WriteFile { path, content } => Some(file_outcome(
                "WRITE_FILE",
                &path,
                write_file(&resolve(&workdir, &path), &content)
                    .map(|()| format!("File written to {path}.")),
            )),
            Action::AppendFile { path, content } => Some(file_outcome(
                "APPEND_FILE",
                &path,
                append_file(&resolve(&workdir, &path), &content)
                    .map(|()| format!("Appended to file {path}.")),
            )),
            Action::MergeFile {
                path,
                needle,
                replacement,
            } => Some(merge_exact(&workdir, &path, &needle, &replacement)),
            Action::MergeFileAssisted { path, changes } => {
                self.merge_assisted(&workdir, &path, &changes, cancel)
            }
        }
    }

    fn run_command(&self, sequence_index: usize, command: &str) -> Message {
        let language = Language::host_shell().key();
        let started = Instant::now();
        let output = self.engine.execute(language, command);
        let elapsed = started.elapsed().as_millis();
        info!(language, elapsed_ms = elapsed as u64, "executed command");
        let output = crop_output(&output, self.config.console_command_output_max_length);
        Message::user(format!(
            "[[Executed code block #{} ({language}) in {elapsed} ms]]\n\n\"\"\"\n{output}\n\"\"\"",
            sequence_index + 1
        ))
        .perishable()
    }

    fn merge_assisted(
        &self,
        workdir: &Path,
        path: &str,
        changes: &str,
        cancel: &CancelToken,
    ) -> Option<Message> {
        let target = resolve(workdir, path);
        let original = match read_file(&target) {
            Ok(original) => original,
            Err(err) => return Some(error_outcome("MERGE_FILE", path, &format!("{err:#}"))),
        };
        let merger = Merger::new(self.merge_model, self.config, cancel.clone());
        let merged = match merger.merge(&original, changes) {
            Ok(merged) => merged,
            Err(MergeError::Cancelled) => return None,
            Err(err) => return Some(error_outcome("MERGE_FILE", path, &err.to_string())),
        };
        Some(file_outcome(
            "MERGE_FILE",
            path,
            write_file(&target, &merged).map(|()| merged_summary(path, &original, &merged)),
        ))
    }
}

fn merge_exact(workdir: &Path, path: &str, needle: &str, replacement: &str) -> Message {
    let target = resolve(workdir, path);
    let original = match read_file(&target) {
        Ok(original) => original,
        Err(err) => return error_outcome("MERGE_FILE", path, &format!("{err:#}")),
    };
    match replace_unique(&original, needle, replacement) {
        Ok(merged) => file_outcome(
            "MERGE_FILE",
            path,
            write_file(&target, &merged).map(|()| merged_summary(path, &original, &merged)),
        ),
        Err(PatchError::AmbiguousReplace { occurrences }) => {
            warn!(path, occurrences, "merge target not unique");
            Message::system(format!(
                "Error in MERGE_FILE: The code block to be replaced was found {occurrences} times in the file but should be unique."
            ))
            .perishable()
        }
        Err(err) => error_outcome("MERGE_FILE", path, &err.to_string()),
    }
}

fn merged_summary(path: &str, original: &str, merged: &str) -> String {
    format!(
        "Code merged to {path}:\n- Original code length: {} \n- Updated code length: {}.\n\n",
        original.chars().count(),
        merged.chars().count()
    )
}

fn file_outcome(name: &str, path: &str, result: Result<String>) -> Message {
    match result {
        Ok(text) => Message::system(text).perishable(),
        Err(err) => error_outcome(name, path, &format!("{err:#}")),
    }
}

fn error_outcome(name: &str, path: &str, err: &str) -> Message {
    warn!(name, path, err, "file directive failed");
    Message::system(format!("Error in executing {name} (file={path}):\n{err}")).perishable()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::anyhow;

    use super::*;
    use crate::core::conversation::Role;
    use crate::io::model::ChatRequest;

    struct NoModel;

    impl ChatModel for NoModel {
        fn complete(&self, _request: &ChatRequest, _cancel: &CancelToken) -> Result<String> {
            Err(anyhow!("merge model should not be called"))
        }
    }

    fn texts(report: &ActionReport) -> Vec<String> {
        report.messages.iter().map(|m| m.content.text()).collect()
    }

    #[test]
    fn write_then_append_report_each_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);
        let reply = "[[WRITE_FILE a.txt]]\n```\nhello\n```\n[[APPEND_FILE a.txt]]\n```\n world\n```";

        let mut seen = 0;
        let report = runner.run(reply, &CancelToken::new(), |_| seen += 1);

        assert_eq!(seen, 2);
        assert_eq!(
            texts(&report),
            vec!["File written to a.txt.", "Appended to file a.txt."]
        );
        assert!(report.messages.iter().all(|m| m.perishable && m.role == Role::System));
        assert_eq!(
            fs::read_to_string(temp.path().join("a.txt")).expect("read"),
            "hello world"
        );
    }

    #[test]
    fn reply_without_directives_gets_expiring_filler() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);

        let report = runner.run("Just thinking out loud.", &CancelToken::new(), |_| {});

        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].role, Role::User);
        assert_eq!(report.messages[0].expire, Some(2));
        assert_eq!(report.messages[0].content.text(), config.no_code_message);
    }

    #[test]
    fn terminal_marker_suppresses_filler() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);

        let report = runner.run("All done.\n[[FINISHED]]", &CancelToken::new(), |_| {});

        assert!(report.terminal);
        assert!(report.messages.is_empty());
    }

    #[test]
    fn ambiguous_merge_names_occurrences_and_leaves_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("m.py"), "x = 1\nx = 1\n").expect("write");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);
        let reply = "[[MERGE_FILE m.py]]\n```\nx = 1\n```\n```\nx = 2\n```";

        let report = runner.run(reply, &CancelToken::new(), |_| {});

        assert_eq!(
            texts(&report),
            vec!["Error in MERGE_FILE: The code block to be replaced was found 2 times in the file but should be unique."]
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("m.py")).expect("read"),
            "x = 1\nx = 1\n"
        );
    }

    #[test]
    fn unique_merge_reports_lengths() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("m.py"), "a = 1\nb = 2\n").expect("write");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);
        let reply = "[[MERGE_FILE m.py]]\n```\nb = 2\n```\n```\nb = 22\n```";

        let report = runner.run(reply, &CancelToken::new(), |_| {});

        assert_eq!(
            texts(&report),
            vec!["Code merged to m.py:\n- Original code length: 12 \n- Updated code length: 13.\n\n"]
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("m.py")).expect("read"),
            "a = 1\nb = 22\n"
        );
    }

    #[test]
    fn unknown_directive_yields_diagnostic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);

        let report = runner.run("[[DANCE fast]]\n", &CancelToken::new(), |_| {});

        assert_eq!(report.directives, 1);
        assert!(texts(&report)[0].starts_with("[Error running [[DANCE]]: unknown directive"));
    }

    #[test]
    fn cancelled_run_executes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = runner.run("[[WRITE_FILE a.txt]]\n```\nx\n```", &cancel, |_| {});

        assert!(report.cancelled);
        assert!(report.messages.is_empty());
        assert!(!temp.path().join("a.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn shell_command_outcome_is_user_perishable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::default();
        let engine = ExecutionEngine::new(temp.path(), &config);
        let runner = ActionRunner::new(&engine, &NoModel, &config);

        let report = runner.run(
            "[[RUN_SHELL_COMMAND]]\n```sh\necho hi\n```",
            &CancelToken::new(),
            |_| {},
        );

        let message = &report.messages[0];
        assert_eq!(message.role, Role::User);
        assert!(message.perishable);
        let text = message.content.text();
        assert!(text.starts_with("[[Executed code block #1 (sh) in "));
        assert!(text.contains("\"\"\"\nhi"));
    }
}
