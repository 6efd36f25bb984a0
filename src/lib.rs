//! `docdag`: embedded, offline-first document store synchronized through a commit DAG.
//!
//! Provides:
//! - `log`: append-only, newline-delimited JSON log with torn-write truncation
//! - `item` / `commit`: document values, their edits, and the immutable commits carrying them
//! - `repository`: commit-graph engine for heads, leaves, merge bases, and N-way merges
//! - `sync`: bloom-filter set reconciliation between replicas
//! - `trust` / `events`: signing collaborators, change notification, background work
//! - `config` / `data_dir` / `lock`: tunables, on-disk layout, single-writer locking

use std::path::PathBuf;

pub mod bloom;
pub mod checksum;
pub mod commit;
pub mod config;
pub mod data_dir;
pub mod error;
pub mod events;
pub mod item;
pub mod lock;
pub mod log;
pub mod rendezvous;
pub mod repository;
pub mod sync;
pub mod trust;

pub use bloom::BloomFilter;
pub use checksum::Checksum;
pub use commit::{Commit, CommitContents, CommitId};
pub use config::DbConfig;
pub use error::{RepoError, SyncError};
pub use item::{Change, Edit, Item, Schema};
pub use repository::{Repository, RepositoryOptions};

/// Default data directory name.
const DATA_DIR_NAME: &str = ".docdag";

/// Environment variable to override the data directory location.
const DATA_DIR_ENV: &str = "DOCDAG_DATA_DIR";

/// Get the data directory path.
/// Respects `DOCDAG_DATA_DIR` env var, otherwise defaults to `~/.docdag/`.
pub fn data_dir() -> PathBuf {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(override_path);
    }
    dirs_home().join(DATA_DIR_NAME)
}

fn dirs_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp/docdag-fallback"))
}
