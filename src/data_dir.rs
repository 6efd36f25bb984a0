//! On-disk layout of the data directory.
//!
//! Every repository is backed by one log file at `<data_dir>/<repo path>.jsonl`.
//! Repository paths are slash-separated (`/data/notes`), so nested paths map
//! onto nested subdirectories.
//!
//! Use `docdag::data_dir()` to get the directory path directly.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// File extension of repository logs.
pub const LOG_EXTENSION: &str = "jsonl";

/// Ensure the data directory exists, creating it if needed.
/// Returns the path to the directory.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = crate::data_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory at {}", dir.display()))?;
    }
    Ok(dir)
}

/// Get the log path for a repository under `root`.
///
/// Leading slashes and `..` components are dropped so a repository path can
/// never escape the data directory.
pub fn repo_log_path(root: &Path, repo_path: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    let segments: Vec<&str> = repo_path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    for (idx, segment) in segments.iter().enumerate() {
        if idx + 1 == segments.len() {
            path.push(format!("{segment}.{LOG_EXTENSION}"));
        } else {
            path.push(segment);
        }
    }
    path
}

/// Get the log path for a repository inside the default data directory.
pub fn default_repo_log_path(repo_path: &str) -> PathBuf {
    repo_log_path(&crate::data_dir(), repo_path)
}
