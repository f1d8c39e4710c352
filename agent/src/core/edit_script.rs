//! Parser for model-written edit scripts.
//!
//! An edit script is a sequence of function calls and code blocks:
//!
//! ~~~text
//! FUNCTION: DELETE_LINES
//! from_line_inclusively: 3
//! to_line_inclusively: 4
//! FUNCTION_END
//! FUNCTION: INSERT_NEXT_CODEBLOCK
//! at_line: 7
//! FUNCTION_END
//! ```text
//! inserted
//! ```
//! ~~~
//!
//! Arguments are YAML. A function's payload is the code block that
//! immediately follows it. Calls are lowered to [`SequencedEdit`]s whose line
//! numbers refer to the original file.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::core::directive::strip_line_numbers;
use crate::core::patch::{EditOperation, SequencedEdit};

static FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^FUNCTION:\s*(\w+)").expect("function regex is valid"));

#[derive(Debug, Error)]
pub enum EditScriptError {
    #[error("edit script contains no function calls")]
    Empty,
    #[error("unknown edit function {0}")]
    UnknownFunction(String),
    #[error("invalid arguments for {function}: {source}")]
    InvalidArguments {
        function: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{function} has no code block to insert")]
    MissingPayload { function: String },
    #[error("{function}: original code block not found")]
    NeedleNotFound { function: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Function { name: String, args: String },
    Code { code: String },
}

#[derive(Debug, Deserialize)]
struct DeleteLinesArgs {
    from_line_inclusively: usize,
    to_line_inclusively: usize,
}

#[derive(Debug, Deserialize)]
struct InsertArgs {
    at_line: usize,
    #[serde(default)]
    new_code_block: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplaceArgs {
    replaced_original_code_block: String,
    #[serde(default)]
    new_code_block: Option<String>,
}

fn scan(text: &str) -> Vec<Item> {
    let normalized = text.replace("\r\n", "\n");
    let mut items = Vec::new();
    let mut function: Option<(String, String)> = None;
    let mut code: Option<Vec<&str>> = None;

    for line in normalized.split('\n') {
        if let Some((name, mut args)) = function.take() {
            if line.trim() == "FUNCTION_END" {
                items.push(Item::Function { name, args });
            } else {
                args.push_str(line);
                args.push('\n');
                function = Some((name, args));
            }
            continue;
        }
        if let Some(mut lines) = code.take() {
            if line.trim() == "```" {
                items.push(Item::Code {
                    code: lines.join("\n"),
                });
            } else {
                lines.push(line);
                code = Some(lines);
            }
            continue;
        }
        if let Some(caps) = FUNCTION_RE.captures(line) {
            function = Some((caps[1].to_string(), String::new()));
        } else if line.starts_with("```") {
            code = Some(Vec::new());
        }
    }
    items
}

fn parse_args<'de, T: Deserialize<'de>>(function: &str, args: &'de str) -> Result<T, EditScriptError> {
    serde_yaml::from_str(args).map_err(|source| EditScriptError::InvalidArguments {
        function: function.to_string(),
        source,
    })
}

/// Parse `reply` into edits against `original`.
pub fn parse(reply: &str, original: &str) -> Result<Vec<SequencedEdit>, EditScriptError> {
    let normalized = original.replace("\r\n", "\n");
    let original_lines: Vec<&str> = normalized.split('\n').collect();
    let items = scan(reply);
    let mut edits = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let Item::Function { name, args } = item else {
            continue;
        };
        let payload = match items.get(index + 1) {
            Some(Item::Code { code }) => Some(code.as_str()),
            _ => None,
        };
        match name.as_str() {
            "DELETE_LINES" => {
                let args: DeleteLinesArgs = parse_args(name, args)?;
                edits.push(SequencedEdit::new(
                    index,
                    EditOperation::Delete {
                        from_line: args.from_line_inclusively,
                        to_line: args.to_line_inclusively,
                    },
                ));
            }
            "INSERT_NEXT_CODEBLOCK" | "INSERT_CODEBLOCK" => {
                let args: InsertArgs = parse_args(name, args)?;
                let block = payload
                    .map(str::to_string)
                    .or(args.new_code_block)
                    .ok_or_else(|| EditScriptError::MissingPayload {
                        function: name.clone(),
                    })?;
                edits.push(SequencedEdit::new(
                    index,
                    EditOperation::Insert {
                        at_line: args.at_line,
                        block: strip_line_numbers(&block),
                    },
                ));
            }
            "REPLACE_LINES" => {
                let args: ReplaceArgs = parse_args(name, args)?;
                let replacement = args
                    .new_code_block
                    .or_else(|| payload.map(str::to_string))
                    .ok_or_else(|| EditScriptError::MissingPayload {
                        function: name.clone(),
                    })?;
                edits.push(SequencedEdit::new(
                    index,
                    EditOperation::Replace {
                        needle: strip_line_numbers(&args.replaced_original_code_block),
                        replacement: strip_line_numbers(&replacement),
                    },
                ));
            }
            "REPLACE_LINES_WITH_NEXT_CODEBLOCK" => {
                let args: ReplaceArgs = parse_args(name, args)?;
                let needle = strip_line_numbers(&args.replaced_original_code_block);
                let block = payload
                    .map(str::to_string)
                    .or(args.new_code_block)
                    .ok_or_else(|| EditScriptError::MissingPayload {
                        function: name.clone(),
                    })?;
                let needle_lines: Vec<&str> = needle.split('\n').collect();
                let start = original_lines
                    .iter()
                    .position(|line| *line == needle_lines[0])
                    .ok_or_else(|| EditScriptError::NeedleNotFound {
                        function: name.clone(),
                    })?;
                let from_line = start + 1;
                edits.push(SequencedEdit::new(
                    index,
                    EditOperation::Delete {
                        from_line,
                        to_line: from_line + needle_lines.len() - 1,
                    },
                ));
                edits.push(SequencedEdit::new(
                    index,
                    EditOperation::Insert {
                        at_line: from_line,
                        block: strip_line_numbers(&block),
                    },
                ));
            }
            other => return Err(EditScriptError::UnknownFunction(other.to_string())),
        }
    }

    if edits.is_empty() {
        return Err(EditScriptError::Empty);
    }
    Ok(edits)
}

/// Number every line as `N¦line` for presentation to the merge model.
pub fn number_lines(original: &str) -> String {
    original
        .replace("\r\n", "\n")
        .split('\n')
        .enumerate()
        .map(|(index, line)| format!("{}¦{line}", index + 1))
        .collect::<Vec<_>>()
        .join("\n")
}
