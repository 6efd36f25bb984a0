//! Commit-graph engine for one collection of keyed documents.
//!
//! A [`Repository`] stores every commit it has seen, derives the current
//! value of each key from the commit graph, merges concurrent edits, and
//! notifies observers. It is safe to share across threads; internal state
//! sits behind one mutex that is never held across a call into observers.
//!
//! Incoming commits go through [`Repository::persist_commits`], which drops
//! anything that fails signature or authorization checks. Locally created
//! commits and commits replayed from the local log go straight to
//! [`Repository::persist_verified_commits`].

mod durable;
mod graph;
mod merge;
mod storage;

pub use durable::{open_default, open_in_data_dir, open_log_repository, DurableRepository};
pub use graph::MergeBase;
pub use storage::{CommitStorage, MemCommitStorage};

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::commit::{new_commit_id, Commit, CommitBuilder, CommitId};
use crate::config::{EmitMode, RepoConfig};
use crate::error::RepoError;
use crate::events::{Emitter, Priority, TaskQueue};
use crate::item::{Item, Schema};
use crate::trust::{AuthOp, Authorizer, TrustPool};
use graph::{LocalIdentity, RepoState};
use merge::{KeyActivity, KeyWriteGuard};

/// How a repository is opened.
#[derive(Clone)]
pub struct RepositoryOptions {
    /// Logical path of the collection, also used for authorization and sync.
    pub path: String,
    /// Identity of this process. Generated if not supplied.
    pub connection_id: String,
    pub org_id: String,
    /// Schema namespaces accepted from peers. `None` accepts all.
    pub allowed_namespaces: Option<HashSet<String>>,
    /// Fire every notification synchronously regardless of `emit_mode`.
    pub priority: bool,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub config: RepoConfig,
}

impl RepositoryOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            connection_id: new_commit_id(),
            org_id: String::new(),
            allowed_namespaces: None,
            priority: false,
            authorizer: None,
            config: RepoConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RepoConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }
}

/// Wake-up interval of the background worker when nothing was queued.
const BACKGROUND_IDLE_TICK: Duration = Duration::from_millis(250);

/// Lifecycle of the task draining a repository's background queue.
enum Worker {
    Idle,
    Running(CancellationToken),
    Closed,
}

/// Observable repository events.
#[derive(Default)]
pub struct RepoEvents {
    /// Every persisted commit; deferred to background work in
    /// [`EmitMode::Deferred`].
    pub new_commit: Emitter<Arc<Commit>>,
    /// Every persisted commit, on the persisting thread.
    pub new_commit_sync: Emitter<Arc<Commit>>,
    /// Key whose head may have changed.
    pub document_changed: Emitter<String>,
}

pub struct Repository {
    path: String,
    trust: Arc<dyn TrustPool>,
    authorizer: Option<Arc<dyn Authorizer>>,
    allowed_namespaces: Option<HashSet<String>>,
    priority: bool,
    org_id: String,
    connection_id: String,
    config: RepoConfig,
    state: Mutex<RepoState>,
    key_activity: Mutex<KeyActivity>,
    events: RepoEvents,
    background: Arc<TaskQueue>,
    worker: Mutex<Worker>,
    this: Weak<Repository>,
}

impl Repository {
    /// Open an in-memory repository.
    pub fn new(options: RepositoryOptions, trust: Arc<dyn TrustPool>) -> Arc<Self> {
        Self::with_storage(options, trust, Box::new(MemCommitStorage::new()))
    }

    pub fn with_storage(
        options: RepositoryOptions,
        trust: Arc<dyn TrustPool>,
        storage: Box<dyn CommitStorage>,
    ) -> Arc<Self> {
        let local = LocalIdentity {
            session: trust.session_id().to_owned(),
            connection_id: options.connection_id.clone(),
        };
        let state = RepoState::new(storage, local, options.config.clone());
        Arc::new_cyclic(|this| Self {
            path: options.path,
            trust,
            authorizer: options.authorizer,
            allowed_namespaces: options.allowed_namespaces,
            priority: options.priority,
            org_id: options.org_id,
            connection_id: options.connection_id,
            config: options.config,
            state: Mutex::new(state),
            key_activity: Mutex::new(KeyActivity::default()),
            events: RepoEvents::default(),
            background: TaskQueue::new(),
            worker: Mutex::new(Worker::Idle),
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().expect("repository state lock poisoned")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        self.trust.session_id()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn events(&self) -> &RepoEvents {
        &self.events
    }

    pub fn trust(&self) -> &Arc<dyn TrustPool> {
        &self.trust
    }

    /// Look up a commit. Unknown ids are retryable: the commit may not have
    /// been replicated yet.
    pub fn get_commit(&self, id: &str) -> Result<Arc<Commit>, RepoError> {
        self.state()
            .storage
            .get_commit(id)
            .ok_or_else(|| RepoError::ServiceUnavailable(format!("commit {id} not available")))
    }

    pub fn has_commit(&self, id: &str) -> bool {
        self.state().storage.has_commit(id)
    }

    pub fn all_commit_ids(&self) -> Vec<CommitId> {
        self.state().storage.all_commit_ids()
    }

    pub fn all_keys(&self) -> Vec<String> {
        self.state().storage.all_keys()
    }

    /// Commits for `key`, newest first.
    pub fn commits_for_key(&self, key: &str) -> Vec<Arc<Commit>> {
        self.state().storage.commits_for_key_desc(key)
    }

    pub fn num_commits(&self) -> usize {
        self.state().storage.num_commits()
    }

    pub fn num_keys(&self) -> usize {
        self.state().storage.num_keys()
    }

    pub fn age_for_key(&self, key: &str) -> u64 {
        self.state().storage.age_for_key(key)
    }

    pub fn head_for_key(&self, key: &str) -> Option<Arc<Commit>> {
        self.state().head_for_key(key)
    }

    /// Materialized value of the head of `key`.
    pub fn value_for_key(&self, key: &str) -> Option<Item> {
        self.state().value_for_key(key)
    }

    /// Snapshot of `commit`. Never fails: a corrupted or unreadable delta
    /// yields the newest good record for its key, or the null item.
    pub fn record_for_commit(&self, commit: &Commit) -> Item {
        let mut state = self.state();
        let commit = state
            .storage
            .get_commit(commit.id())
            .unwrap_or_else(|| Arc::new(commit.clone()));
        state.record_for_commit(&commit)
    }

    pub fn is_corrupted(&self, id: &str) -> bool {
        self.state().is_corrupted(id)
    }

    pub fn leaves_for_key(&self, key: &str) -> Vec<Arc<Commit>> {
        self.state().leaves_for_key(key)
    }

    pub fn find_merge_base(&self, commits: &[Arc<Commit>]) -> MergeBase {
        self.state().find_merge_base(commits)
    }

    pub fn commit_is_high_probability_leaf(&self, commit: &Commit) -> bool {
        self.state()
            .is_high_probability_leaf(commit, chrono::Utc::now())
    }

    pub fn merge_pending(&self, key: &str) -> bool {
        self.key_activity
            .lock()
            .expect("key activity lock poisoned")
            .is_merging(key)
    }

    /// Write a new value for `key`.
    ///
    /// The parent is `parent` if given, otherwise the current head. Returns
    /// `Ok(None)` when `value` is null or equal to the parent's record, and
    /// the merge commit when the write immediately triggered a merge.
    pub fn set_value_for_key(
        &self,
        key: &str,
        value: Item,
        parent: Option<&str>,
    ) -> Result<Option<Arc<Commit>>, RepoError> {
        let Some(writing) = KeyWriteGuard::acquire(&self.key_activity, key) else {
            return Err(RepoError::MergeInProgress {
                key: key.to_owned(),
            });
        };
        if value.is_null() {
            return Ok(None);
        }

        let commit = {
            let mut state = self.state();
            let parent = match parent {
                Some(id) => Some(state.storage.get_commit(id).ok_or_else(|| {
                    RepoError::ServiceUnavailable(format!("parent commit {id} not available"))
                })?),
                None => state.head_for_key(key),
            };
            if let Some(parent) = &parent {
                if state.record_for_commit(parent) == value {
                    return Ok(None);
                }
            }
            let parents: Vec<Arc<Commit>> = parent.into_iter().collect();
            let (filter, count) = state.ancestors_for(&parents);
            let mut builder = CommitBuilder::new(key, self.trust.session_id(), value)
                .parents(parents.iter().map(|p| p.id().to_owned()).collect())
                .connection_id(self.connection_id.clone())
                .org_id(self.org_id.clone())
                .ancestors(filter, count);
            builder.build_version = self.config.build_version;
            state.delta_compress(builder.build())
        };

        let commit = self.sign(commit);
        let persisted = self.persist_verified_commits(vec![commit]).into_iter().next();
        drop(writing);
        let Some(commit) = persisted else {
            return Ok(None);
        };
        Ok(Some(self.merge_if_needed(key).unwrap_or(commit)))
    }

    fn sign(&self, commit: Commit) -> Commit {
        let signature = self.trust.sign(&commit);
        commit.with_signature(signature)
    }

    fn namespace_allowed(&self, commit: &Commit) -> bool {
        let Some(allowed) = &self.allowed_namespaces else {
            return true;
        };
        match commit.schema() {
            Some(schema) => schema.is_session() || allowed.contains(&schema.ns),
            None => true,
        }
    }

    fn verify_one(&self, commit: &Commit) -> bool {
        if !self.trust.verify(commit) {
            tracing::debug!(commit = %commit.id(), session = %commit.session(), "dropping unverifiable commit");
            return false;
        }
        if let Some(authorizer) = &self.authorizer {
            if !authorizer.authorize(&self.path, commit.session(), commit, AuthOp::Write) {
                tracing::debug!(commit = %commit.id(), session = %commit.session(), "dropping unauthorized commit");
                return false;
            }
        }
        true
    }

    /// Keep the commits that verify, checking chunks on scoped threads.
    fn verify_commits(&self, commits: Vec<Commit>) -> Vec<Commit> {
        if commits.is_empty() {
            return commits;
        }
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let verdicts: Vec<bool> = if workers == 1 || commits.len() < workers * 2 {
            commits.iter().map(|c| self.verify_one(c)).collect()
        } else {
            let chunk = commits.len().div_ceil(workers);
            std::thread::scope(|scope| {
                let handles: Vec<_> = commits
                    .chunks(chunk)
                    .map(|part| {
                        scope.spawn(move || part.iter().map(|c| self.verify_one(c)).collect::<Vec<_>>())
                    })
                    .collect();
                handles
                    .into_iter()
                    .flat_map(|handle| match handle.join() {
                        Ok(verdicts) => verdicts,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                    .collect()
            })
        };
        commits
            .into_iter()
            .zip(verdicts)
            .filter_map(|(commit, ok)| ok.then_some(commit))
            .collect()
    }

    /// Ingest commits from an untrusted source.
    ///
    /// Known ids and disallowed namespaces are skipped before verification.
    /// Commits that fail verification are dropped silently. Keys that gained
    /// a leaf get a merge check queued on the background queue.
    pub fn persist_commits(&self, commits: Vec<Commit>) -> Vec<Arc<Commit>> {
        let fresh: Vec<Commit> = {
            let state = self.state();
            let mut batch_ids = HashSet::new();
            commits
                .into_iter()
                .filter(|c| {
                    !state.storage.has_commit(c.id())
                        && batch_ids.insert(c.id().to_owned())
                        && self.namespace_allowed(c)
                })
                .collect()
        };
        if fresh.is_empty() {
            return Vec::new();
        }

        // Session announcements first, so commits signed by a newly announced
        // session verify in the same batch.
        let (sessions, rest): (Vec<_>, Vec<_>) = fresh
            .into_iter()
            .partition(|c| c.schema().is_some_and(Schema::is_session));
        let mut persisted = self.persist_verified_commits(self.verify_commits(sessions));
        persisted.extend(self.persist_verified_commits(self.verify_commits(rest)));

        let keys: BTreeSet<String> = persisted.iter().map(|c| c.key().to_owned()).collect();
        for key in keys {
            let this = self.this.clone();
            self.schedule(Priority::Normal, move || {
                if let Some(repo) = this.upgrade() {
                    repo.merge_if_needed(&key);
                }
            });
        }
        persisted
    }

    /// Index commits that are already trusted, then notify.
    ///
    /// All indices are updated before the first notification fires.
    pub fn persist_verified_commits(&self, commits: Vec<Commit>) -> Vec<Arc<Commit>> {
        if commits.is_empty() {
            return Vec::new();
        }
        let (persisted, session_records, changed) = {
            let mut state = self.state();
            let persisted = state.storage.persist_commits(commits);
            let touched = state.index(&persisted);
            let ids: HashSet<String> = persisted.iter().map(|c| c.id().to_owned()).collect();

            let mut session_records = Vec::new();
            let mut changed = Vec::new();
            for key in touched {
                let new_leaves: Vec<Arc<Commit>> = state
                    .leaves_for_key(&key)
                    .into_iter()
                    .filter(|leaf| ids.contains(leaf.id()))
                    .collect();
                if new_leaves.is_empty() {
                    continue;
                }
                for leaf in &new_leaves {
                    if leaf.schema().is_some_and(Schema::is_session) {
                        session_records.push(state.record_for_commit(leaf));
                    }
                }
                changed.push(key);
            }
            tracing::debug!(
                path = %self.path,
                persisted = persisted.len(),
                indexed = state.graph.len(),
                "persisted commits"
            );
            (persisted, session_records, changed)
        };

        for record in &session_records {
            self.trust.add_session_record(record);
        }
        for commit in &persisted {
            self.events.new_commit_sync.emit(commit);
        }
        self.emit_new_commits(&persisted);
        for key in &changed {
            self.events.document_changed.emit(key);
        }
        persisted
    }

    fn emit_new_commits(&self, persisted: &[Arc<Commit>]) {
        if !self.events.new_commit.has_observers() {
            return;
        }
        if self.priority || self.config.emit_mode == EmitMode::Immediate {
            for commit in persisted {
                self.events.new_commit.emit(commit);
            }
            return;
        }
        let emitter = self.events.new_commit.clone();
        let batch = persisted.to_vec();
        self.schedule(Priority::Background, move || {
            for commit in &batch {
                emitter.emit(commit);
            }
        });
    }

    /// Ids of the commits `user` may read. Cached until the next persist.
    pub fn authorized_commit_ids(&self, user: &str) -> Arc<Vec<CommitId>> {
        let mut state = self.state();
        if let Some(ids) = state.authorized.get(user) {
            return ids.clone();
        }
        let all = state.storage.all_commit_ids();
        let ids = match &self.authorizer {
            None => all,
            Some(authorizer) => all
                .into_iter()
                .filter(|id| {
                    state.storage.get_commit(id).is_some_and(|commit| {
                        authorizer.authorize(&self.path, user, &commit, AuthOp::Read)
                    })
                })
                .collect(),
        };
        let ids = Arc::new(ids);
        state.authorized.insert(user.to_owned(), ids.clone());
        ids
    }

    /// Queue background work.
    ///
    /// Inside a tokio runtime the first call starts a worker task that drains
    /// the queue until the repository is closed or dropped. Outside one,
    /// queued work waits for [`Repository::drain_background`] or
    /// [`Repository::close`].
    fn schedule<F>(&self, priority: Priority, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.background.push(priority, task);
        let mut worker = self.worker.lock().expect("background worker lock poisoned");
        if !matches!(*worker, Worker::Idle) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let cancel = CancellationToken::new();
        self.background.spawn_worker(BACKGROUND_IDLE_TICK, cancel.clone());
        tracing::debug!(path = %self.path, "started background worker");
        *worker = Worker::Running(cancel);
    }

    /// Number of background tasks waiting to run.
    pub fn background_queued(&self) -> usize {
        self.background.len()
    }

    /// Run queued background work on the calling thread.
    pub fn drain_background(&self) -> usize {
        self.background.run_until_idle()
    }

    /// Finish queued work, stop the background worker and detach every
    /// observer.
    pub fn close(&self) {
        let worker = std::mem::replace(
            &mut *self.worker.lock().expect("background worker lock poisoned"),
            Worker::Closed,
        );
        if let Worker::Running(cancel) = worker {
            cancel.cancel();
        }
        self.background.run_until_idle();
        self.events.new_commit.clear();
        self.events.new_commit_sync.clear();
        self.events.document_changed.clear();
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Ok(Worker::Running(cancel)) = self.worker.get_mut() {
            cancel.cancel();
        }
    }
}
