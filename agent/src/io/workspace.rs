//! Working-directory snapshots shown to the model every cycle.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::window::crop_middle;

/// Extensions whose files are injected into the context in full.
pub const VISIBLE_EXTENSIONS: [&str; 21] = [
    "js", "py", "java", "cpp", "cs", "ts", "html", "css", "rb", "php", "swift", "go", "rs", "kt",
    "lua", "perl", "scala", "sh", "bat", "sql", "md",
];

const EXCLUDED_DIRS: [&str; 3] = ["__pycache__", "node_modules", ".git"];
const MAX_TREE_DEPTH: usize = 3;

/// Source of the per-cycle project snapshot.
pub trait WorkspaceSnapshot {
    /// Directory the snapshot describes.
    fn root(&self) -> &Path;

    /// Nested listing of the working directory, at most `limit` chars when
    /// reducing depth can achieve it.
    fn file_tree(&self, limit: usize) -> Result<String>;

    /// One rendered entry per visible source file.
    fn visible_files(&self) -> Result<Vec<String>>;
}

/// Snapshot provider backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct FsWorkspace {
    root: PathBuf,
    visible_file_size_limit_kb: usize,
}

#[derive(Debug, Default, Serialize)]
struct TreeNode {
    files: String,
    directories: BTreeMap<String, TreeEntry>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TreeEntry {
    Node(TreeNode),
    Summary(String),
}

fn format_kb(bytes: u64) -> String {
    format!("({:.2} KB)", bytes as f64 / 1024.0)
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

fn is_visible(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VISIBLE_EXTENSIONS.contains(&ext))
}

fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

fn read_tree(dir: &Path, depth: usize, max_depth: usize) -> Result<TreeNode> {
    let mut node = TreeNode::default();
    let mut files = Vec::new();
    let entries = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().is_dir() {
            let child = if depth >= max_depth {
                TreeEntry::Summary(format_kb(directory_size(entry.path())))
            } else {
                TreeEntry::Node(read_tree(entry.path(), depth + 1, max_depth)?)
            };
            node.directories.insert(name, child);
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
            files.push(format!("{name} {}", format_kb(size)));
        }
    }
    node.files = files.join(", ");
    Ok(node)
}

impl FsWorkspace {
    pub fn new(root: impl Into<PathBuf>, visible_file_size_limit_kb: usize) -> Self {
        Self {
            root: root.into(),
            visible_file_size_limit_kb,
        }
    }

    fn render_tree(&self, max_depth: usize) -> Result<String> {
        let tree = read_tree(&self.root, 0, max_depth)?;
        serde_yaml::to_string(&tree).context("render file tree")
    }

    fn render_visible(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let contents = String::from_utf8_lossy(&bytes);
        let limit = self.visible_file_size_limit_kb * 1024;
        let contents = crop_middle(
            &contents,
            limit,
            &format!(
                "...[CAUTION: MIDDLE OF FILE CONTENT OMITTED DUE TO A SIZE LIMIT {} KB]...",
                self.visible_file_size_limit_kb
            ),
        );
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        Ok(format!(
            "[CODEBASE]\n[Up-to-date file contents of {}]\n```\n{contents}\n```",
            relative.display()
        ))
    }
}

impl WorkspaceSnapshot for FsWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn file_tree(&self, limit: usize) -> Result<String> {
        let mut depth = MAX_TREE_DEPTH;
        loop {
            let rendered = self.render_tree(depth)?;
            if rendered.chars().count() <= limit || depth == 0 {
                debug!(depth, chars = rendered.len(), "rendered file tree");
                return Ok(rendered);
            }
            depth -= 1;
        }
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn visible_files(&self) -> Result<Vec<String>> {
        let mut rendered = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_excluded(entry));
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            if entry.file_type().is_file() && is_visible(entry.path()) {
                rendered.push(self.render_visible(entry.path())?);
            }
        }
        if rendered.is_empty() {
            rendered.push("[CODEBASE]\nCurrently empty".to_string());
        }
        debug!(files = rendered.len(), "collected visible files");
        Ok(rendered)
    }
}

/// Create the first unused numbered directory `<workspace_root>/<n>`.
pub fn allocate_workdir(workspace_root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(workspace_root)
        .with_context(|| format!("create directory {}", workspace_root.display()))?;
    let mut index = 0usize;
    loop {
        let candidate = workspace_root.join(index.to_string());
        if !candidate.exists() {
            fs::create_dir(&candidate)
                .with_context(|| format!("create directory {}", candidate.display()))?;
            debug!(workdir = %candidate.display(), "allocated working directory");
            return Ok(candidate);
        }
        index += 1;
    }
}

/// Resolve (and create) a named working directory under `workspace_root`.
pub fn named_workdir(workspace_root: &Path, name: &str) -> Result<PathBuf> {
    let dir = workspace_root.join(name.trim());
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
    Ok(dir)
}
