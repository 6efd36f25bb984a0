//! Pluggable primary commit store.

use std::collections::HashMap;
use std::sync::Arc;

use crate::commit::{Commit, CommitId};

/// Primary index of a repository's commits.
///
/// Implementations only index; verification and graph bookkeeping happen in
/// the repository. Every persisted commit is assigned a monotonically
/// increasing `age`, and each key remembers the age of its latest commit so
/// consumers can detect staleness without rescanning.
pub trait CommitStorage: Send {
    fn get_commit(&self, id: &str) -> Option<Arc<Commit>>;

    fn has_commit(&self, id: &str) -> bool {
        self.get_commit(id).is_some()
    }

    fn all_commit_ids(&self) -> Vec<CommitId>;

    /// Commits for `key`, newest first (see [`Commit::cmp_recency`]).
    fn commits_for_key_desc(&self, key: &str) -> Vec<Arc<Commit>>;

    fn all_keys(&self) -> Vec<String>;

    /// Index `batch`, skipping ids that are already present. Returns the
    /// commits actually added, in input order.
    fn persist_commits(&mut self, batch: Vec<Commit>) -> Vec<Arc<Commit>>;

    fn num_commits(&self) -> usize;

    fn num_keys(&self) -> usize;

    /// Age of the most recently persisted commit for `key`, or 0.
    fn age_for_key(&self, key: &str) -> u64;
}

/// In-memory storage.
#[derive(Default)]
pub struct MemCommitStorage {
    by_id: HashMap<CommitId, Arc<Commit>>,
    by_key: HashMap<String, Vec<Arc<Commit>>>,
    key_age: HashMap<String, u64>,
    next_age: u64,
}

impl MemCommitStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommitStorage for MemCommitStorage {
    fn get_commit(&self, id: &str) -> Option<Arc<Commit>> {
        self.by_id.get(id).cloned()
    }

    fn has_commit(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    fn all_commit_ids(&self) -> Vec<CommitId> {
        self.by_id.keys().cloned().collect()
    }

    fn commits_for_key_desc(&self, key: &str) -> Vec<Arc<Commit>> {
        self.by_key.get(key).cloned().unwrap_or_default()
    }

    fn all_keys(&self) -> Vec<String> {
        self.by_key.keys().cloned().collect()
    }

    fn persist_commits(&mut self, batch: Vec<Commit>) -> Vec<Arc<Commit>> {
        let mut persisted = Vec::with_capacity(batch.len());
        for commit in batch {
            if self.by_id.contains_key(commit.id()) {
                continue;
            }
            // Ages read back from a log are kept so they stay stable across restarts.
            let age = match commit.age() {
                Some(age) => age,
                None => self.next_age + 1,
            };
            self.next_age = self.next_age.max(age);
            let commit = Arc::new(commit.with_age(age));

            let key_age = self.key_age.entry(commit.key().to_owned()).or_default();
            *key_age = (*key_age).max(age);

            let list = self.by_key.entry(commit.key().to_owned()).or_default();
            let pos = list
                .binary_search_by(|probe| Commit::cmp_recency(probe, &commit))
                .unwrap_or_else(|pos| pos);
            list.insert(pos, commit.clone());

            self.by_id.insert(commit.id().to_owned(), commit.clone());
            persisted.push(commit);
        }
        persisted
    }

    fn num_commits(&self) -> usize {
        self.by_id.len()
    }

    fn num_keys(&self) -> usize {
        self.by_key.len()
    }

    fn age_for_key(&self, key: &str) -> u64 {
        self.key_age.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitBuilder;
    use crate::item::{Item, Schema};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn commit_at(key: &str, secs_ago: i64) -> Commit {
        CommitBuilder::new(
            key,
            "s",
            Item::from_fields(Schema::new("notes", 1), [("n", json!(secs_ago))]),
        )
        .timestamp(Utc::now() - Duration::seconds(secs_ago))
        .build()
    }

    #[test]
    fn test_commits_for_key_are_newest_first() {
        let mut storage = MemCommitStorage::new();
        let old = commit_at("doc", 30);
        let mid = commit_at("doc", 20);
        let new = commit_at("doc", 10);
        storage.persist_commits(vec![mid.clone(), new.clone(), old.clone()]);

        let ids: Vec<String> = storage
            .commits_for_key_desc("doc")
            .iter()
            .map(|c| c.id().to_owned())
            .collect();
        assert_eq!(ids, vec![new.id(), mid.id(), old.id()]);
    }

    #[test]
    fn test_persist_skips_known_and_assigns_age() {
        let mut storage = MemCommitStorage::new();
        let a = commit_at("a", 1);
        let b = commit_at("b", 1);
        assert_eq!(storage.persist_commits(vec![a.clone()]).len(), 1);
        let second = storage.persist_commits(vec![a.clone(), b.clone()]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id(), b.id());

        assert_eq!(storage.num_commits(), 2);
        assert_eq!(storage.num_keys(), 2);
        assert!(storage.age_for_key("b") > storage.age_for_key("a"));
        assert_eq!(storage.age_for_key("missing"), 0);
    }

    #[test]
    fn test_existing_age_is_kept() {
        let mut storage = MemCommitStorage::new();
        let stored = storage.persist_commits(vec![commit_at("a", 1).with_age(41)]);
        assert_eq!(stored[0].age(), Some(41));
        let next = storage.persist_commits(vec![commit_at("a", 0)]);
        assert_eq!(next[0].age(), Some(42));
        assert_eq!(storage.age_for_key("a"), 42);
    }
}
