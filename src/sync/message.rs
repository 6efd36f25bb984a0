use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PROTOCOL_VERSION;
use crate::bloom::BloomFilter;
use crate::commit::{Commit, CommitCache, CommitId};
use crate::repository::Repository;

/// One side's view of a repository, exchanged on every round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Filters over the sender's commit ids, one per cycle, each with its own
    /// seed. An id counts as present only if every filter contains it.
    #[serde(rename = "f", default)]
    pub filters: Vec<BloomFilter>,
    /// Number of commits the sender holds.
    #[serde(rename = "n")]
    pub size: u64,
    /// Encoded commits the sender believes the receiver lacks.
    #[serde(rename = "c", default)]
    pub values: Vec<Value>,
    #[serde(rename = "bv")]
    pub build_version: u32,
    #[serde(rename = "pv")]
    pub protocol_version: u32,
    /// Missing commits that did not fit into `values`.
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Independent filters to build.
    pub cycles: u32,
    pub fpr: f64,
    pub max_values: usize,
    /// Report how many missing commits were left out.
    pub include_pending: bool,
    /// Build version of the sender.
    pub build_version: u32,
}

impl SyncMessage {
    /// Whether the sender claims to hold `id`.
    pub fn has(&self, id: &str) -> bool {
        !self.filters.is_empty() && self.filters.iter().all(|f| f.has(id))
    }

    /// The same message without its values.
    pub fn summary(&self) -> SyncMessage {
        SyncMessage {
            values: Vec::new(),
            ..self.clone()
        }
    }

    /// Build a message advertising `ids` and carrying the commits `peer`
    /// does not claim to hold, oldest first.
    ///
    /// Without a peer message every commit counts as missing. Commits with a
    /// build version newer than the peer's are withheld. `should_offer` is
    /// consulted for each commit that would be sent, and may veto it.
    pub fn build<F>(
        repo: &Repository,
        ids: &[CommitId],
        peer: Option<&SyncMessage>,
        options: &BuildOptions,
        mut should_offer: F,
    ) -> SyncMessage
    where
        F: FnMut(&Commit) -> bool,
    {
        let cycles = options.cycles.max(1);
        let filters = (0..cycles)
            .map(|seed| {
                let mut filter = BloomFilter::with_seed(ids.len().max(1), options.fpr, seed);
                for id in ids {
                    filter.add(id);
                }
                filter
            })
            .collect();

        let peer_build = peer.map(|p| p.build_version);
        let mut missing: Vec<_> = ids
            .iter()
            .filter(|id| peer.map_or(true, |p| !p.has(id)))
            .filter_map(|id| repo.get_commit(id).ok())
            .filter(|c| peer_build.map_or(true, |bv| c.build_version() <= bv))
            .collect();
        missing.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.id().cmp(b.id()))
        });

        let mut values = Vec::new();
        let mut left_out = 0u64;
        for commit in missing {
            if values.len() >= options.max_values {
                left_out += 1;
            } else if should_offer(&commit) {
                values.push(commit.to_wire());
            }
        }

        SyncMessage {
            filters,
            size: ids.len() as u64,
            values,
            build_version: options.build_version,
            protocol_version: PROTOCOL_VERSION,
            pending: options.include_pending.then_some(left_out),
        }
    }

    /// Decode carried commits, skipping malformed ones.
    pub fn decode_values(&self, cache: &CommitCache) -> Vec<Commit> {
        self.values
            .iter()
            .filter_map(|value| match cache.decode(value.clone()) {
                Ok(commit) => Some(Commit::clone(&commit)),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping malformed commit in sync message");
                    None
                }
            })
            .collect()
    }
}
