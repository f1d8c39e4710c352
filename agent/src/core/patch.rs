//! Line-based patch engine.
//!
//! Edits are applied in two phases:
//!
//! 1. Line phase: inserts (ascending sequence index) and deletes are resolved
//!    against the *original* line numbers. Original lines live in an arena
//!    and deletions leave a tombstone, so no operation shifts another's
//!    target. The arena is then materialized into flat text.
//! 2. Text phase: replaces run against the flattened text in sequence order.
//!
//! Application is atomic: any failure returns an error and the input is
//! untouched.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOperation {
    /// Remove original lines `from_line..=to_line` (1-based).
    Delete { from_line: usize, to_line: usize },
    /// Insert `block` immediately before original line `at_line` (1-based);
    /// `at_line == len + 1` appends.
    Insert { at_line: usize, block: String },
    /// Replace the unique occurrence of `needle`.
    Replace { needle: String, replacement: String },
}

/// An edit plus its position in the script it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedEdit {
    pub sequence_index: usize,
    pub operation: EditOperation,
}

impl SequencedEdit {
    pub fn new(sequence_index: usize, operation: EditOperation) -> Self {
        Self {
            sequence_index,
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error(
        "Error merging: multiple occurrences found or no matching code to replace. occurrences={occurrences}"
    )]
    AmbiguousReplace { occurrences: usize },
    #[error("Error merging: the code block to replace is empty")]
    EmptyNeedle,
    #[error("line {line} is out of range for a file with {len} lines")]
    LineOutOfRange { line: usize, len: usize },
    #[error("invalid line range {from_line}..={to_line}")]
    InvalidRange { from_line: usize, to_line: usize },
}

enum Slot<'a> {
    Live(&'a str),
    Tombstone,
}

struct LineArena<'a> {
    slots: Vec<Slot<'a>>,
    /// Blocks inserted before slot `i`; the extra last entry holds appends.
    inserted: Vec<Vec<String>>,
}

impl<'a> LineArena<'a> {
    fn new(text: &'a str) -> Self {
        let slots: Vec<Slot<'a>> = text.split('\n').map(Slot::Live).collect();
        let inserted = vec![Vec::new(); slots.len() + 1];
        Self { slots, inserted }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn insert(&mut self, at_line: usize, block: &str) -> Result<(), PatchError> {
        if at_line == 0 || at_line > self.len() + 1 {
            return Err(PatchError::LineOutOfRange {
                line: at_line,
                len: self.len(),
            });
        }
        // A later insert at the same line lands in front of earlier ones.
        self.inserted[at_line - 1].insert(0, block.to_string());
        Ok(())
    }

    fn delete(&mut self, from_line: usize, to_line: usize) -> Result<(), PatchError> {
        if from_line == 0 || to_line < from_line {
            return Err(PatchError::InvalidRange { from_line, to_line });
        }
        if to_line > self.len() {
            return Err(PatchError::LineOutOfRange {
                line: to_line,
                len: self.len(),
            });
        }
        for slot in &mut self.slots[from_line - 1..to_line] {
            *slot = Slot::Tombstone;
        }
        Ok(())
    }

    fn materialize(&self) -> String {
        let mut lines: Vec<&str> = Vec::with_capacity(self.slots.len());
        for (slot, blocks) in self.slots.iter().zip(&self.inserted) {
            lines.extend(blocks.iter().map(String::as_str));
            if let Slot::Live(line) = slot {
                lines.push(line);
            }
        }
        if let Some(appended) = self.inserted.last() {
            lines.extend(appended.iter().map(String::as_str));
        }
        lines.join("\n")
    }
}

/// Apply `edits` to `original`, returning the resulting text.
pub fn apply(original: &str, edits: &[SequencedEdit]) -> Result<String, PatchError> {
    let normalized = original.replace("\r\n", "\n");
    let mut ordered: Vec<&SequencedEdit> = edits.iter().collect();
    ordered.sort_by_key(|edit| edit.sequence_index);

    let mut arena = LineArena::new(&normalized);
    for edit in &ordered {
        if let EditOperation::Insert { at_line, block } = &edit.operation {
            arena.insert(*at_line, block)?;
        }
    }
    for edit in &ordered {
        if let EditOperation::Delete { from_line, to_line } = &edit.operation {
            arena.delete(*from_line, *to_line)?;
        }
    }
    let mut text = arena.materialize();

    for edit in &ordered {
        if let EditOperation::Replace {
            needle,
            replacement,
        } = &edit.operation
        {
            text = replace_unique(&text, needle, replacement)?;
        }
    }
    Ok(text)
}

/// Replace `needle` in `text` iff it occurs exactly once.
pub fn replace_unique(text: &str, needle: &str, replacement: &str) -> Result<String, PatchError> {
    if needle.is_empty() {
        return Err(PatchError::EmptyNeedle);
    }
    match count_occurrences(text, needle) {
        1 => Ok(text.replacen(needle, replacement, 1)),
        occurrences => Err(PatchError::AmbiguousReplace { occurrences }),
    }
}

/// Count occurrences of `needle`, including overlapping ones.
pub fn count_occurrences(text: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut start = 0;
    while let Some(found) = text[start..].find(needle) {
        count += 1;
        let at = start + found;
        let step = text[at..].chars().next().map_or(1, char::len_utf8);
        start = at + step;
    }
    count
}
