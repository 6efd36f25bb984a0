//! Commit-graph bookkeeping: adjacency, per-key caches, materialization,
//! heads, leaves, and merge bases.
//!
//! Everything here runs with the repository state lock held and never
//! blocks on I/O.

use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::storage::CommitStorage;
use crate::bloom::BloomFilter;
use crate::commit::{Commit, CommitContents, CommitId};
use crate::config::RepoConfig;
use crate::item::{Edit, Item, Schema};

/// Child-to-parent edges plus the reverse index used for leaf detection.
#[derive(Default)]
pub(crate) struct Graph {
    parents: HashMap<CommitId, Vec<CommitId>>,
    children: HashMap<CommitId, HashSet<CommitId>>,
}

impl Graph {
    pub(crate) fn add(&mut self, commit: &Commit) {
        for parent in commit.parents() {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(commit.id().to_owned());
        }
        self.parents
            .insert(commit.id().to_owned(), commit.parents().to_vec());
    }

    pub(crate) fn has_children(&self, id: &str) -> bool {
        self.children.get(id).is_some_and(|c| !c.is_empty())
    }

    pub(crate) fn parents_of(&self, id: &str) -> Option<&[CommitId]> {
        self.parents.get(id).map(Vec::as_slice)
    }

    pub(crate) fn len(&self) -> usize {
        self.parents.len()
    }
}

/// Result of folding pairwise merge bases over a set of leaves.
#[derive(Debug, Clone)]
pub struct MergeBase {
    /// Commits that can take part in the merge.
    pub commits: Vec<Arc<Commit>>,
    /// Lowest common ancestor, if histories connect.
    pub base: Option<Arc<Commit>>,
    /// Newest schema among the included commits.
    pub schema: Option<Schema>,
    /// Traversal exhausted every history without finding a common ancestor.
    pub reached_root: bool,
}

pub(crate) enum Materialized {
    Record(Item),
    /// A delta failed checksum verification somewhere in its chain.
    Corrupted,
    /// A base commit has not been replicated yet.
    Missing,
}

pub(crate) struct LocalIdentity {
    pub(crate) session: String,
    pub(crate) connection_id: String,
}

pub(crate) struct RepoState {
    pub(crate) storage: Box<dyn CommitStorage>,
    pub(crate) graph: Graph,
    pub(crate) local: LocalIdentity,
    pub(crate) config: RepoConfig,
    heads: HashMap<String, Option<Arc<Commit>>>,
    values: HashMap<String, Option<Item>>,
    leaves: HashMap<String, Vec<Arc<Commit>>>,
    records: LruCache<CommitId, Item>,
    corrupted: HashSet<CommitId>,
    pub(crate) authorized: HashMap<String, Arc<Vec<CommitId>>>,
}

impl RepoState {
    pub(crate) fn new(
        storage: Box<dyn CommitStorage>,
        local: LocalIdentity,
        config: RepoConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.record_cache_size).unwrap_or(NonZeroUsize::MIN);
        let mut state = Self {
            storage,
            graph: Graph::default(),
            local,
            config,
            heads: HashMap::new(),
            values: HashMap::new(),
            leaves: HashMap::new(),
            records: LruCache::new(capacity),
            corrupted: HashSet::new(),
            authorized: HashMap::new(),
        };
        // Storage may arrive pre-populated.
        for id in state.storage.all_commit_ids() {
            if let Some(commit) = state.storage.get_commit(&id) {
                state.graph.add(&commit);
            }
        }
        state
    }

    /// Add persisted commits to the graph and drop every cache they affect.
    /// Returns the touched keys.
    pub(crate) fn index(&mut self, persisted: &[Arc<Commit>]) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();
        for commit in persisted {
            self.graph.add(commit);
            touched.insert(commit.key().to_owned());
        }
        for key in &touched {
            self.heads.remove(key);
            self.values.remove(key);
            self.leaves.remove(key);
        }
        if !persisted.is_empty() {
            self.authorized.clear();
        }
        touched
    }

    pub(crate) fn is_corrupted(&self, id: &str) -> bool {
        self.corrupted.contains(id)
    }

    /// Materialize without falling back.
    pub(crate) fn materialize(&mut self, commit: &Arc<Commit>) -> Materialized {
        if self.corrupted.contains(commit.id()) {
            return Materialized::Corrupted;
        }
        let mut pending: Vec<(CommitId, Edit)> = Vec::new();
        let mut visited: HashSet<CommitId> = HashSet::new();
        let mut node = commit.clone();

        let mut item = loop {
            if let Some(item) = self.records.get(node.id()) {
                break item.clone();
            }
            if self.corrupted.contains(node.id()) || !visited.insert(node.id().to_owned()) {
                self.mark_corrupted(node.id(), &pending);
                return Materialized::Corrupted;
            }
            match node.contents() {
                CommitContents::Record(item) => break item.clone(),
                CommitContents::Delta { base, edit } => {
                    pending.push((node.id().to_owned(), edit.clone()));
                    match self.storage.get_commit(base) {
                        Some(base) => node = base,
                        None => return Materialized::Missing,
                    }
                }
            }
        };

        while let Some((id, edit)) = pending.pop() {
            if item.checksum() != edit.src_checksum {
                self.mark_corrupted(&id, &pending);
                return Materialized::Corrupted;
            }
            item.patch(&edit);
            if item.checksum() != edit.dst_checksum {
                self.mark_corrupted(&id, &pending);
                return Materialized::Corrupted;
            }
            self.records.put(id, item.clone());
        }
        Materialized::Record(item)
    }

    fn mark_corrupted(&mut self, id: &str, dependents: &[(CommitId, Edit)]) {
        tracing::warn!(
            commit = %id,
            dependents = dependents.len(),
            "delta checksum mismatch, commit marked corrupted"
        );
        self.corrupted.insert(id.to_owned());
        for (dependent, _) in dependents {
            self.corrupted.insert(dependent.clone());
        }
    }

    pub(crate) fn is_materializable(&mut self, commit: &Arc<Commit>) -> bool {
        matches!(self.materialize(commit), Materialized::Record(_))
    }

    /// Materialize, falling back to the newest good record for the key and
    /// then to the null item.
    pub(crate) fn record_for_commit(&mut self, commit: &Arc<Commit>) -> Item {
        if let Materialized::Record(item) = self.materialize(commit) {
            return item;
        }
        for candidate in self.storage.commits_for_key_desc(commit.key()) {
            if candidate.id() == commit.id() || self.corrupted.contains(candidate.id()) {
                continue;
            }
            if let Materialized::Record(item) = self.materialize(&candidate) {
                tracing::debug!(
                    commit = %commit.id(),
                    fallback = %candidate.id(),
                    "using last good record"
                );
                return item;
            }
        }
        Item::null()
    }

    /// Materializable commits without children, newest first, at most one
    /// per connection.
    pub(crate) fn leaves_for_key(&mut self, key: &str) -> Vec<Arc<Commit>> {
        if let Some(cached) = self.leaves.get(key) {
            return cached.clone();
        }
        let mut connections = HashSet::new();
        let mut leaves = Vec::new();
        for commit in self.storage.commits_for_key_desc(key) {
            if self.graph.has_children(commit.id()) || !self.is_materializable(&commit) {
                continue;
            }
            if connections.insert(commit.connection_id().to_owned()) {
                leaves.push(commit);
            }
        }
        self.leaves.insert(key.to_owned(), leaves.clone());
        leaves
    }

    /// First materializable candidate authored by this connection, else by
    /// this session, else any. `candidates` must be newest first.
    pub(crate) fn pick_best(&mut self, candidates: &[Arc<Commit>]) -> Option<Arc<Commit>> {
        let connection = self.local.connection_id.clone();
        let session = self.local.session.clone();
        let tiers: [&dyn Fn(&Commit) -> bool; 3] = [
            &|c: &Commit| c.connection_id() == connection,
            &|c: &Commit| c.session() == session,
            &|_: &Commit| true,
        ];
        for tier in tiers {
            for commit in candidates {
                if tier(commit) && self.is_materializable(commit) {
                    return Some(commit.clone());
                }
            }
        }
        None
    }

    pub(crate) fn head_for_key(&mut self, key: &str) -> Option<Arc<Commit>> {
        if let Some(cached) = self.heads.get(key) {
            return cached.clone();
        }
        let leaves = self.leaves_for_key(key);
        let head = match leaves.len() {
            0 => {
                let all = self.storage.commits_for_key_desc(key);
                self.pick_best(&all)
            }
            1 => Some(leaves[0].clone()),
            _ => self.pick_best(&leaves),
        };
        self.heads.insert(key.to_owned(), head.clone());
        head
    }

    pub(crate) fn value_for_key(&mut self, key: &str) -> Option<Item> {
        if let Some(cached) = self.values.get(key) {
            return cached.clone();
        }
        let value = self
            .head_for_key(key)
            .map(|head| self.record_for_commit(&head));
        self.values.insert(key.to_owned(), value.clone());
        value
    }

    fn expand(
        &self,
        frontier: &mut Vec<Arc<Commit>>,
        seen: &mut HashSet<CommitId>,
        missing: &mut bool,
    ) {
        let mut next = Vec::new();
        for commit in frontier.drain(..) {
            for parent in commit.parents() {
                if !seen.insert(parent.clone()) {
                    continue;
                }
                match self.storage.get_commit(parent) {
                    Some(parent) => next.push(parent),
                    None => *missing = true,
                }
            }
        }
        *frontier = next;
    }

    /// Lowest common ancestor of two commits.
    ///
    /// Returns `(None, true)` for disconnected histories and `(None, false)`
    /// when unreplicated commits cut the search short.
    pub(crate) fn lca(
        &mut self,
        a: &Arc<Commit>,
        b: &Arc<Commit>,
    ) -> (Option<Arc<Commit>>, bool) {
        if a.id() == b.id() || a.contents_checksum() == b.contents_checksum() {
            return (Some(a.clone()), false);
        }
        if b.parents().iter().any(|p| p == a.id()) {
            return (Some(a.clone()), false);
        }
        if a.parents().iter().any(|p| p == b.id()) {
            return (Some(b.clone()), false);
        }

        let mut seen_a = HashSet::from([a.id().to_owned()]);
        let mut seen_b = HashSet::from([b.id().to_owned()]);
        let mut frontier_a = vec![a.clone()];
        let mut frontier_b = vec![b.clone()];
        let mut missing = false;

        loop {
            self.expand(&mut frontier_a, &mut seen_a, &mut missing);
            self.expand(&mut frontier_b, &mut seen_b, &mut missing);

            let mut common: Vec<Arc<Commit>> = seen_a
                .intersection(&seen_b)
                .filter_map(|id| self.storage.get_commit(id))
                .collect();
            common.sort_by(|x, y| Commit::cmp_recency(x, y));
            for candidate in common {
                if self.is_materializable(&candidate) {
                    return (Some(candidate), false);
                }
            }

            if frontier_a.is_empty() && frontier_b.is_empty() {
                return (None, !missing);
            }
        }
    }

    /// Fold pairwise merge bases across `commits`, which share one key.
    pub(crate) fn find_merge_base(&mut self, commits: &[Arc<Commit>]) -> MergeBase {
        let Some(first) = commits.first() else {
            return MergeBase {
                commits: Vec::new(),
                base: None,
                schema: None,
                reached_root: false,
            };
        };

        let mut included = vec![first.clone()];
        let mut base = Some(first.clone());
        let mut reached_root = false;

        for commit in &commits[1..] {
            let Some(current) = base.clone() else {
                included.push(commit.clone());
                continue;
            };
            match self.lca(&current, commit) {
                (Some(lca), _) => {
                    base = Some(lca);
                    included.push(commit.clone());
                }
                (None, true) => {
                    base = None;
                    reached_root = true;
                    included.push(commit.clone());
                }
                (None, false) => {
                    tracing::debug!(
                        commit = %commit.id(),
                        "history not fully replicated, leaving commit out of merge"
                    );
                }
            }
        }

        let mut schema: Option<Schema> = None;
        for commit in &included {
            let candidate = self.record_for_commit(commit).schema().clone();
            schema = match schema {
                Some(current) if !current.is_superseded_by(&candidate) => Some(current),
                _ => Some(candidate),
            };
        }

        MergeBase {
            commits: included,
            base,
            schema,
            reached_root,
        }
    }

    /// Whether `commit` is probably still a leaf, judged by the ancestors
    /// filters of the newest commits for its key.
    pub(crate) fn is_high_probability_leaf(&self, commit: &Commit, now: DateTime<Utc>) -> bool {
        if commit.connection_id() == self.local.connection_id {
            return true;
        }
        let recent = (now - commit.timestamp())
            .to_std()
            .map_or(true, |age| age < self.config.leaf_grace_period());
        if recent {
            return true;
        }

        let newest = self.storage.commits_for_key_desc(commit.key());
        let graph_size = (newest.len() as u64).max(commit.ancestors_count() + 1) as f64;
        let checks = ((2.0 * graph_size.log(4.0)).ceil() as usize).max(1);
        !newest
            .iter()
            .filter(|other| other.id() != commit.id())
            .take(checks)
            .any(|other| other.ancestors_filter().has(commit.id()))
    }

    /// Ancestors filter and count for a commit with `parents`.
    pub(crate) fn ancestors_for(&self, parents: &[Arc<Commit>]) -> (BloomFilter, u64) {
        let mut seen: HashSet<CommitId> = HashSet::new();
        let mut queue: Vec<CommitId> = parents.iter().map(|p| p.id().to_owned()).collect();
        while let Some(id) = queue.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(parents) = self.graph.parents_of(&id) {
                queue.extend(parents.iter().cloned());
            }
        }
        let mut filter = BloomFilter::new(seen.len().max(1), self.config.ancestors_fpr);
        for id in &seen {
            filter.add(id);
        }
        (filter, seen.len() as u64)
    }
}
