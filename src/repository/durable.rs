//! Repositories backed by an append-only log on disk.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{Repository, RepositoryOptions};
use crate::commit::{Commit, CommitCache};
use crate::config::DbConfig;
use crate::data_dir::{ensure_data_dir, repo_log_path};
use crate::events::Subscription;
use crate::log::{LogFile, LogOptions};
use crate::trust::TrustPool;

/// A repository whose commits are replayed from, and appended to, a log.
pub struct DurableRepository {
    repo: Arc<Repository>,
    log: Arc<Mutex<LogFile>>,
    subscription: Option<Subscription>,
}

impl DurableRepository {
    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn log_path(&self) -> PathBuf {
        self.log
            .lock()
            .expect("log lock poisoned")
            .path()
            .to_path_buf()
    }

    /// Stop appending, flush, and release the log and its writer lock.
    pub fn close(mut self) -> Result<()> {
        self.subscription.take();
        self.repo.close();
        self.log.lock().expect("log lock poisoned").flush()
    }
}

/// Open the log at `log_path`, replay it into a new repository, then keep
/// appending every newly persisted commit.
///
/// Records that do not decode as commits are skipped with a warning.
pub fn open_log_repository(
    log_path: &Path,
    options: RepositoryOptions,
    trust: Arc<dyn TrustPool>,
    config: &DbConfig,
) -> Result<DurableRepository> {
    let mut log = LogFile::open(log_path, true, LogOptions::from(&config.log))?;
    let repo = Repository::new(options.with_config(config.repo.clone()), trust);
    let cache = CommitCache::new(config.repo.commit_cache_size);

    let mut cursor = log.start_cursor()?;
    let mut replayed = 0usize;
    loop {
        let batch = log
            .scan(&mut cursor, config.log.scan_batch_size)
            .with_context(|| format!("Failed to replay log: {}", log_path.display()))?;
        let commits: Vec<Commit> = batch
            .values
            .into_iter()
            .filter_map(|value| match cache.decode(value) {
                Ok(commit) => Some(Commit::clone(&commit)),
                Err(err) => {
                    tracing::warn!(path = %log_path.display(), error = %err, "skipping undecodable log record");
                    None
                }
            })
            .collect();
        replayed += repo.persist_verified_commits(commits).len();
        if batch.done {
            break;
        }
    }
    tracing::info!(path = %log_path.display(), commits = replayed, "replayed repository log");

    let log = Arc::new(Mutex::new(log));
    let writer = log.clone();
    let subscription = repo.events().new_commit_sync.subscribe(move |commit: &Arc<Commit>| {
        let mut log = writer.lock().expect("log lock poisoned");
        let result = log
            .append(&[commit.to_local_json()])
            .and_then(|_| log.flush());
        if let Err(err) = result {
            tracing::error!(commit = %commit.id(), error = %err, "failed to append commit to log");
        }
    });

    Ok(DurableRepository {
        repo,
        log,
        subscription: Some(subscription),
    })
}

/// Open `options.path` under `data_root`, at `<data_root>/<path>.jsonl`.
pub fn open_in_data_dir(
    data_root: &Path,
    options: RepositoryOptions,
    trust: Arc<dyn TrustPool>,
    config: &DbConfig,
) -> Result<DurableRepository> {
    let path = repo_log_path(data_root, &options.path);
    open_log_repository(&path, options, trust, config)
}

/// Open `options.path` in the default data directory, creating it if needed.
pub fn open_default(
    options: RepositoryOptions,
    trust: Arc<dyn TrustPool>,
    config: &DbConfig,
) -> Result<DurableRepository> {
    let root = ensure_data_dir()?;
    open_in_data_dir(&root, options, trust, config)
}
