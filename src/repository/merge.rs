//! Delta compression and N-way merges.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::graph::RepoState;
use super::Repository;
use crate::commit::{Commit, CommitBuilder, CommitId};
use crate::item::{Item, Schema};
use crate::rendezvous::rendezvous_pick;

/// Which keys are being merged or written right now.
///
/// A key is either merging or has writers, never both: a write to a merging
/// key is refused, and a merge of a key being written is skipped. The writer
/// runs its own merge check once its commit is persisted.
#[derive(Default)]
pub(crate) struct KeyActivity {
    merging: HashSet<String>,
    writers: HashMap<String, usize>,
}

impl KeyActivity {
    pub(crate) fn is_merging(&self, key: &str) -> bool {
        self.merging.contains(key)
    }
}

/// Marks a key as merging for the guard's lifetime.
pub(crate) struct PendingMergeGuard<'a> {
    activity: &'a Mutex<KeyActivity>,
    key: String,
}

impl<'a> PendingMergeGuard<'a> {
    /// `None` if the key is already merging or being written.
    pub(crate) fn acquire(activity: &'a Mutex<KeyActivity>, key: &str) -> Option<Self> {
        let mut current = activity.lock().expect("key activity lock poisoned");
        if current.writers.contains_key(key) || !current.merging.insert(key.to_owned()) {
            return None;
        }
        Some(Self {
            activity,
            key: key.to_owned(),
        })
    }
}

impl Drop for PendingMergeGuard<'_> {
    fn drop(&mut self) {
        self.activity
            .lock()
            .expect("key activity lock poisoned")
            .merging
            .remove(&self.key);
    }
}

/// Marks a key as being written for the guard's lifetime. Writers of the same
/// key do not exclude each other.
pub(crate) struct KeyWriteGuard<'a> {
    activity: &'a Mutex<KeyActivity>,
    key: String,
}

impl<'a> KeyWriteGuard<'a> {
    /// `None` if the key is merging.
    pub(crate) fn acquire(activity: &'a Mutex<KeyActivity>, key: &str) -> Option<Self> {
        let mut current = activity.lock().expect("key activity lock poisoned");
        if current.is_merging(key) {
            return None;
        }
        *current.writers.entry(key.to_owned()).or_default() += 1;
        Some(Self {
            activity,
            key: key.to_owned(),
        })
    }
}

impl Drop for KeyWriteGuard<'_> {
    fn drop(&mut self) {
        let mut activity = self.activity.lock().expect("key activity lock poisoned");
        if let Some(count) = activity.writers.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                activity.writers.remove(&self.key);
            }
        }
    }
}

/// Content and parents of a merge commit.
pub(crate) struct MergeRecord {
    pub(crate) item: Item,
    pub(crate) included: Vec<Arc<Commit>>,
    pub(crate) base: Option<CommitId>,
}

fn newest_schema(current: Option<Schema>, candidate: &Schema) -> Option<Schema> {
    match current {
        Some(current) if !current.is_superseded_by(candidate) => Some(current),
        _ => Some(candidate.clone()),
    }
}

/// One commit per content checksum, preferring the locally authored one.
/// `commits` must be newest first.
pub(crate) fn dedupe_by_checksum(commits: Vec<Arc<Commit>>, connection_id: &str) -> Vec<Arc<Commit>> {
    let mut unique: Vec<Arc<Commit>> = Vec::new();
    let mut index = HashMap::new();
    for commit in commits {
        match index.get(&commit.contents_checksum()) {
            Some(&pos) => {
                let kept: &Arc<Commit> = &unique[pos];
                if commit.connection_id() == connection_id && kept.connection_id() != connection_id {
                    unique[pos] = commit;
                }
            }
            None => {
                index.insert(commit.contents_checksum(), unique.len());
                unique.push(commit);
            }
        }
    }
    unique
}

impl RepoState {
    /// Re-encode `commit` as a delta against the newest full commit for its
    /// key when that is small enough.
    ///
    /// Session records and a deterministic sample of commits stay full.
    pub(crate) fn delta_compress(&mut self, commit: Commit) -> Commit {
        let Some(record) = commit.record() else {
            return commit;
        };
        if record.schema().is_session() || commit.sampled(self.config.full_commit_sample_rate) {
            return commit;
        }
        let Some(base) = self
            .storage
            .commits_for_key_desc(commit.key())
            .into_iter()
            .find(|c| !c.is_delta() && c.id() != commit.id())
        else {
            return commit;
        };
        let Some(base_record) = base.record() else {
            return commit;
        };

        let edit = base_record.diff(record, false);
        let full_len = serde_json::to_vec(record).map_or(0, |v| v.len());
        let delta_len = serde_json::to_vec(&edit).map_or(usize::MAX, |v| v.len()) + base.id().len();
        if (delta_len as f64) <= self.config.delta_size_ratio * full_len as f64 {
            tracing::trace!(commit = %commit.id(), base = %base.id(), delta_len, full_len, "storing delta");
            commit.into_delta(base.id().to_owned(), edit)
        } else {
            commit
        }
    }

    /// Fold concurrent leaves into a single record.
    ///
    /// Independent roots merge from the null item. Otherwise the base is the
    /// folded lowest common ancestor. Every included record is upgraded to
    /// the newest schema, diffed from the base, and patched onto the result;
    /// remote edits go first, then this session's, oldest to newest.
    pub(crate) fn create_merge_record(&mut self, commits: &[Arc<Commit>]) -> Option<MergeRecord> {
        let (roots, rest): (Vec<_>, Vec<_>) = commits.iter().cloned().partition(|c| c.is_root());

        let (base_item, base, included) = if !roots.is_empty() {
            let mut included = roots;
            included.extend(rest);
            (Item::null(), None, included)
        } else if rest.len() == 1 {
            (Item::null(), None, rest)
        } else {
            let found = self.find_merge_base(&rest);
            if found.commits.len() < 2 {
                return None;
            }
            let base_item = match &found.base {
                Some(base) => self.record_for_commit(base),
                None => Item::null(),
            };
            (base_item, found.base.map(|b| b.id().to_owned()), found.commits)
        };

        let mut schema = None;
        let mut records = Vec::with_capacity(included.len());
        for commit in &included {
            let record = self.record_for_commit(commit);
            schema = newest_schema(schema, record.schema());
            records.push((commit.clone(), record));
        }
        let schema = schema?;

        let mut base_item = base_item;
        base_item.upgrade_schema(&schema);
        let mut merged = base_item.clone();

        let session = self.local.session.clone();
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by(|&a, &b| {
            let (ca, cb) = (&records[a].0, &records[b].0);
            (ca.session() == session)
                .cmp(&(cb.session() == session))
                .then_with(|| Commit::cmp_recency(cb, ca))
        });

        for pos in order {
            let (commit, record) = &mut records[pos];
            record.upgrade_schema(&schema);
            let edit = base_item.diff(record, commit.session() == session);
            merged.patch(&edit);
        }

        Some(MergeRecord {
            item: merged,
            included,
            base,
        })
    }
}

impl Repository {
    /// Merge the leaves of `key` if this replica is the elected leader.
    ///
    /// Returns the merge commit, or `None` when nothing needed merging,
    /// another session leads, or a merge for the key is already running.
    pub fn merge_if_needed(&self, key: &str) -> Option<Arc<Commit>> {
        let now = Utc::now();
        let leaves = self.state().leaves_for_key(key);
        if leaves.len() < 2 {
            return None;
        }

        let session = self.trust.session_id().to_owned();
        let window = self.config.merge_leader_window();
        let leader = {
            let recent: BTreeSet<&str> = leaves
                .iter()
                .filter(|c| (now - c.timestamp()).to_std().map_or(true, |age| age <= window))
                .map(|c| c.session())
                .collect();
            rendezvous_pick(key, recent.iter().copied()).map(str::to_owned)
        };
        // Without recent leaves every replica may merge.
        if let Some(leader) = leader {
            if leader != session {
                tracing::debug!(key, %leader, "not merge leader, backing off");
                return None;
            }
        }

        let _guard = PendingMergeGuard::acquire(&self.key_activity, key)?;

        let commit = {
            let mut state = self.state();
            let candidates: Vec<Arc<Commit>> = leaves
                .into_iter()
                .filter(|c| state.is_high_probability_leaf(c, now))
                .collect();
            let unique = dedupe_by_checksum(candidates, &self.connection_id);
            if unique.len() < 2 {
                return None;
            }
            let merge = state.create_merge_record(&unique)?;
            let (filter, count) = state.ancestors_for(&merge.included);
            let parents = merge.included.iter().map(|c| c.id().to_owned()).collect();
            let mut builder = CommitBuilder::new(key, session.clone(), merge.item)
                .parents(parents)
                .connection_id(self.connection_id.clone())
                .org_id(self.org_id.clone())
                .ancestors(filter, count);
            builder.build_version = self.config.build_version;
            let commit = builder.build().with_merge(merge.base, session.clone());
            state.delta_compress(commit)
        };

        let commit = self.sign(commit);
        tracing::info!(
            key,
            commit = %commit.id(),
            parents = commit.parents().len(),
            "merged concurrent leaves"
        );
        self.persist_verified_commits(vec![commit]).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitBuilder;
    use crate::config::RepoConfig;
    use crate::repository::graph::LocalIdentity;
    use crate::repository::storage::MemCommitStorage;
    use serde_json::json;

    fn state(config: RepoConfig) -> RepoState {
        RepoState::new(
            Box::new(MemCommitStorage::new()),
            LocalIdentity {
                session: "me".into(),
                connection_id: "conn-me".into(),
            },
            config,
        )
    }

    fn add(state: &mut RepoState, commit: Commit) -> Arc<Commit> {
        let persisted = state.storage.persist_commits(vec![commit]);
        state.index(&persisted);
        persisted[0].clone()
    }

    fn doc(fields: serde_json::Value) -> Item {
        let map = fields.as_object().cloned().unwrap_or_default();
        Item::new(Schema::new("docs", 1), map)
    }

    #[test]
    fn test_pending_merge_guard_is_exclusive() {
        let activity = Mutex::new(KeyActivity::default());
        let guard = PendingMergeGuard::acquire(&activity, "k").unwrap();
        assert!(PendingMergeGuard::acquire(&activity, "k").is_none());
        assert!(PendingMergeGuard::acquire(&activity, "other").is_some());
        drop(guard);
        assert!(PendingMergeGuard::acquire(&activity, "k").is_some());
    }

    #[test]
    fn test_writes_and_merges_exclude_each_other() {
        let activity = Mutex::new(KeyActivity::default());
        let first = KeyWriteGuard::acquire(&activity, "k").unwrap();
        let second = KeyWriteGuard::acquire(&activity, "k").unwrap();
        assert!(PendingMergeGuard::acquire(&activity, "k").is_none());
        drop(first);
        assert!(PendingMergeGuard::acquire(&activity, "k").is_none());
        drop(second);

        let merge = PendingMergeGuard::acquire(&activity, "k").unwrap();
        assert!(KeyWriteGuard::acquire(&activity, "k").is_none());
        assert!(KeyWriteGuard::acquire(&activity, "other").is_some());
        drop(merge);
        assert!(KeyWriteGuard::acquire(&activity, "k").is_some());
    }

    #[test]
    fn test_small_edit_becomes_delta() {
        let mut st = state(RepoConfig {
            full_commit_sample_rate: 0,
            ..RepoConfig::default()
        });
        let long = "x".repeat(400);
        let base = add(&mut st, CommitBuilder::new("k", "me", doc(json!({"body": long, "n": 1}))).build());
        let next = CommitBuilder::new("k", "me", doc(json!({"body": long, "n": 2})))
            .parents(vec![base.id().to_owned()])
            .build();
        let compressed = st.delta_compress(next);
        assert_eq!(compressed.base(), Some(base.id()));
    }

    #[test]
    fn test_large_edit_stays_full() {
        let mut st = state(RepoConfig {
            full_commit_sample_rate: 0,
            ..RepoConfig::default()
        });
        let base = add(&mut st, CommitBuilder::new("k", "me", doc(json!({"a": "old"}))).build());
        let next = CommitBuilder::new("k", "me", doc(json!({"a": "completely different"})))
            .parents(vec![base.id().to_owned()])
            .build();
        assert!(!st.delta_compress(next).is_delta());
    }

    #[test]
    fn test_session_records_stay_full() {
        let mut st = state(RepoConfig {
            full_commit_sample_rate: 0,
            ..RepoConfig::default()
        });
        let schema = Schema::new(crate::item::SESSION_NAMESPACE, 1);
        let long = "k".repeat(400);
        let base = add(
            &mut st,
            CommitBuilder::new("s1", "me", Item::from_fields(schema.clone(), [("key", json!(long)), ("v", json!(1))])).build(),
        );
        let next = CommitBuilder::new("s1", "me", Item::from_fields(schema, [("key", json!(long)), ("v", json!(2))]))
            .parents(vec![base.id().to_owned()])
            .build();
        assert!(!st.delta_compress(next).is_delta());
    }

    #[test]
    fn test_dedupe_prefers_local() {
        let remote = Arc::new(CommitBuilder::new("k", "a", doc(json!({"x": 1}))).connection_id("r").build());
        let local = Arc::new(CommitBuilder::new("k", "b", doc(json!({"x": 1}))).connection_id("conn-me").build());
        let other = Arc::new(CommitBuilder::new("k", "c", doc(json!({"x": 2}))).connection_id("r2").build());
        let unique = dedupe_by_checksum(vec![remote, local.clone(), other], "conn-me");
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].id(), local.id());
    }

    #[test]
    fn test_merge_record_from_common_base() {
        let mut st = state(RepoConfig::default());
        let a = add(&mut st, CommitBuilder::new("k", "x", doc(json!({"title": "t", "body": "b"}))).build());
        let b = add(
            &mut st,
            CommitBuilder::new("k", "x", doc(json!({"title": "T", "body": "b"})))
                .parents(vec![a.id().to_owned()])
                .build(),
        );
        let c = add(
            &mut st,
            CommitBuilder::new("k", "y", doc(json!({"title": "t", "body": "B"})))
                .parents(vec![a.id().to_owned()])
                .build(),
        );
        let merge = st.create_merge_record(&[b, c]).unwrap();
        assert_eq!(merge.base.as_deref(), Some(a.id()));
        assert_eq!(merge.item, doc(json!({"title": "T", "body": "B"})));
    }

    #[test]
    fn test_merge_record_of_independent_roots() {
        let mut st = state(RepoConfig::default());
        let a = add(&mut st, CommitBuilder::new("k", "x", doc(json!({"a": 1}))).build());
        let b = add(&mut st, CommitBuilder::new("k", "y", doc(json!({"b": 2}))).build());
        let merge = st.create_merge_record(&[a, b]).unwrap();
        assert!(merge.base.is_none());
        assert_eq!(merge.included.len(), 2);
        assert_eq!(merge.item, doc(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_local_edit_wins_conflict() {
        let mut st = state(RepoConfig::default());
        let a = add(&mut st, CommitBuilder::new("k", "x", doc(json!({"title": "a"}))).build());
        let remote = add(
            &mut st,
            CommitBuilder::new("k", "x", doc(json!({"title": "zzz"})))
                .parents(vec![a.id().to_owned()])
                .build(),
        );
        let mine = add(
            &mut st,
            CommitBuilder::new("k", "me", doc(json!({"title": "aaa"})))
                .parents(vec![a.id().to_owned()])
                .build(),
        );
        let merge = st.create_merge_record(&[remote, mine]).unwrap();
        assert_eq!(merge.item.get("title"), Some(&json!("aaa")));
    }
}
