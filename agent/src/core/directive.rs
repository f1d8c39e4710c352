//! Directive mini-language embedded in model replies.
//!
//! A reply is split on triple-backtick fences into alternating prose and
//! fence segments. Lines in prose of the form `[[NAME arg1;arg2]]` become
//! [`Directive`]s bound to the fence that follows their segment (and, for
//! `MERGE_FILE`, the fence after that one).

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// Marker that ends the autonomous loop because the task is done.
pub const FINISHED_MARKER: &str = "[[FINISHED]]";
/// Marker that ends the autonomous loop to hand control back to the user.
pub const CALL_USER_MARKER: &str = "[[CALL_USER]]";
/// Reflective-pause token appended to non-trivial replies and used as a stop sequence.
pub const OBSERVE_MARKER: &str = "[[OBSERVE]]";

/// Names that are control tokens rather than side-effecting directives.
const CONTROL_NAMES: [&str; 3] = ["FINISHED", "CALL_USER", "OBSERVE"];

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]?\[\[([A-Z][A-Z0-9_]*)(?:[ \t]+([^\n]*?))?\]\]")
        .expect("directive regex is valid")
});

/// A fenced block: the first line is the tag, the rest is the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub tag: String,
    pub body: String,
}

impl Fence {
    fn parse(segment: &str) -> Self {
        match segment.split_once('\n') {
            Some((tag, body)) => Self {
                tag: tag.trim().to_string(),
                body: body.to_string(),
            },
            None => Self {
                tag: segment.trim().to_string(),
                body: String::new(),
            },
        }
    }
}

/// One bracketed directive as it appeared in the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub raw_args: String,
    pub args: Vec<String>,
    /// Position among all directives of the reply.
    pub sequence_index: usize,
    pub fence: Option<Fence>,
    pub second_fence: Option<Fence>,
}

/// A validated, side-effecting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RunShellCommand {
        command: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    AppendFile {
        path: String,
        content: String,
    },
    /// Exact snippet replacement.
    MergeFile {
        path: String,
        needle: String,
        replacement: String,
    },
    /// Only one fence was supplied: a free-form change set merged by the model.
    MergeFileAssisted {
        path: String,
        changes: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("[[{name}]] requires a {what} argument")]
    MissingArgument { name: String, what: &'static str },
    #[error("[[{name}]] must be followed by a fenced code block")]
    MissingFence { name: String },
    #[error(
        "unknown directive [[{name}]]; available: RUN_SHELL_COMMAND, WRITE_FILE, APPEND_FILE, MERGE_FILE"
    )]
    Unknown { name: String },
}

impl Directive {
    /// Validate the directive into a typed [`Action`].
    pub fn action(&self) -> Result<Action, DirectiveError> {
        match self.name.as_str() {
            "RUN_SHELL_COMMAND" => Ok(Action::RunShellCommand {
                command: self.required_fence()?.body.clone(),
            }),
            "WRITE_FILE" => Ok(Action::WriteFile {
                path: self.required_path()?,
                content: self.required_fence()?.body.clone(),
            }),
            "APPEND_FILE" => Ok(Action::AppendFile {
                path: self.required_path()?,
                content: self.required_fence()?.body.clone(),
            }),
            "MERGE_FILE" => {
                let path = self.required_path()?;
                let first = self.required_fence()?.body.clone();
                Ok(match &self.second_fence {
                    Some(second) => Action::MergeFile {
                        path,
                        needle: first,
                        replacement: second.body.clone(),
                    },
                    None => Action::MergeFileAssisted {
                        path,
                        changes: first,
                    },
                })
            }
            _ => Err(DirectiveError::Unknown {
                name: self.name.clone(),
            }),
        }
    }

    fn required_fence(&self) -> Result<&Fence, DirectiveError> {
        self.fence.as_ref().ok_or_else(|| DirectiveError::MissingFence {
            name: self.name.clone(),
        })
    }

    fn required_path(&self) -> Result<String, DirectiveError> {
        self.args
            .first()
            .map(|arg| arg.trim())
            .filter(|arg| !arg.is_empty())
            .map(str::to_string)
            .ok_or_else(|| DirectiveError::MissingArgument {
                name: self.name.clone(),
                what: "filename",
            })
    }
}

/// Split `text` on fence delimiters.
///
/// Returns `None` when the segment count is even (an unbalanced fence).
pub fn split_fences(text: &str) -> Option<Vec<String>> {
    let normalized = format!("\n{}", text.replace("\r\n", "\n"));
    let pieces: Vec<String> = normalized.split("\n```").map(str::to_string).collect();
    if pieces.len() % 2 == 0 {
        return None;
    }
    Some(pieces)
}

/// Extract every directive from a reply, in textual order.
///
/// An unbalanced fence yields no directives; it is never an error.
pub fn extract(text: &str) -> Vec<Directive> {
    let Some(pieces) = split_fences(text) else {
        warn!("unbalanced code fences in reply, ignoring directives");
        return Vec::new();
    };

    let mut directives = Vec::new();
    for (index, prose) in pieces.iter().enumerate().step_by(2) {
        let fence = pieces.get(index + 1).map(|piece| Fence::parse(piece));
        let second = pieces.get(index + 3).map(|piece| Fence::parse(piece));
        for caps in DIRECTIVE_RE.captures_iter(prose) {
            let name = caps[1].to_string();
            if CONTROL_NAMES.contains(&name.as_str()) {
                continue;
            }
            let raw_args = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            let args = if raw_args.is_empty() {
                Vec::new()
            } else {
                raw_args.split(';').map(str::to_string).collect()
            };
            let second_fence = if name == "MERGE_FILE" {
                second.clone()
            } else {
                None
            };
            debug!(name = %name, args = %raw_args, "parsed directive");
            directives.push(Directive {
                name,
                raw_args,
                args,
                sequence_index: directives.len(),
                fence: fence.clone(),
                second_fence,
            });
        }
    }
    directives
}

/// True when the reply contains `[[FINISHED]]` or `[[CALL_USER]]` anywhere.
pub fn has_terminal_marker(text: &str) -> bool {
    text.contains(FINISHED_MARKER) || text.contains(CALL_USER_MARKER)
}

/// Strip a leading `N¦` line-number annotation from each line.
pub fn strip_line_numbers(code: &str) -> String {
    code.split('\n')
        .map(|line| match line.split_once('¦') {
            Some((prefix, rest)) if is_line_number(prefix.trim()) => rest,
            _ => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_line_number(prefix: &str) -> bool {
    !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit())
}
