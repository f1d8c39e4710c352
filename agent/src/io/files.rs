//! Whole-file helpers used by the file directives.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Resolve a directive path against the working directory.
pub fn resolve(workdir: &Path, path: &str) -> PathBuf {
    workdir.join(path.trim())
}

pub fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

/// Replace the file contents, creating parent directories as needed.
pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    ensure_parent(path)?;
    debug!(path = %path.display(), bytes = contents.len(), "writing file");
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Append to the file, creating it (and parent directories) if missing.
pub fn append_file(path: &Path, contents: &str) -> Result<()> {
    ensure_parent(path)?;
    debug!(path = %path.display(), bytes = contents.len(), "appending to file");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_nested_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = resolve(temp.path(), "src/lib/a.txt");
        write_file(&path, "one").expect("write");
        append_file(&path, "two").expect("append");
        assert_eq!(read_file(&path).expect("read"), "onetwo");
    }

    #[test]
    fn append_creates_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = resolve(temp.path(), " notes.md ");
        append_file(&path, "x").expect("append");
        assert_eq!(fs::read_to_string(temp.path().join("notes.md")).expect("read"), "x");
    }
}
