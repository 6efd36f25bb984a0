//! Immutable commits and their compact JSON encoding.
//!
//! A commit is either a full snapshot of a document or a delta against a
//! named base commit. Commits are built once, then shared as `Arc<Commit>`;
//! there are no setters. Signing and age assignment produce new values.
//!
//! Encoded field names:
//!
//! | field | meaning |
//! |-------|---------|
//! | `ver` | build version |
//! | `id`, `k`, `s`, `org` | id, key, session, org |
//! | `ts` | timestamp (unix millis) |
//! | `p` | parents (omitted if empty) |
//! | `af`, `ac` | ancestors filter, ancestors count (omitted if zero) |
//! | `c` | `{r: record}` or `{b: base, e: edit}` |
//! | `sig`, `mb`, `ml`, `revert` | optional metadata |
//! | `cid` | connection id |
//! | `age` | local-only persistence counter |

use chrono::{DateTime, TimeZone, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::bloom::BloomFilter;
use crate::checksum::{checksum_bytes, checksum_json, Checksum};
use crate::item::{Edit, Item, Schema};

/// Build version stamped on commits created by this crate.
pub const BUILD_VERSION: u32 = 1;

pub type CommitId = String;

/// Generate a fresh, globally unique commit id.
pub fn new_commit_id() -> CommitId {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitContents {
    /// Full snapshot.
    Record(Item),
    /// Delta against `base`.
    Delta { base: CommitId, edit: Edit },
}

#[derive(Debug, Clone)]
pub struct Commit {
    id: CommitId,
    key: String,
    session: String,
    org_id: String,
    contents: CommitContents,
    parents: Vec<CommitId>,
    ancestors_filter: BloomFilter,
    ancestors_count: u64,
    merge_base: Option<CommitId>,
    merge_leader: Option<String>,
    revert: Option<CommitId>,
    timestamp: DateTime<Utc>,
    build_version: u32,
    signature: Option<String>,
    connection_id: String,
    age: Option<u64>,
}

/// Construction-time fields of a commit.
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    pub id: CommitId,
    pub key: String,
    pub session: String,
    pub org_id: String,
    pub contents: CommitContents,
    pub parents: Vec<CommitId>,
    pub ancestors_filter: BloomFilter,
    pub ancestors_count: u64,
    pub merge_base: Option<CommitId>,
    pub merge_leader: Option<String>,
    pub revert: Option<CommitId>,
    pub timestamp: DateTime<Utc>,
    pub build_version: u32,
    pub connection_id: String,
}

impl CommitBuilder {
    /// A root, full-snapshot commit with a fresh id and the current time.
    pub fn new(key: impl Into<String>, session: impl Into<String>, record: Item) -> Self {
        Self {
            id: new_commit_id(),
            key: key.into(),
            session: session.into(),
            org_id: String::new(),
            contents: CommitContents::Record(record),
            parents: Vec::new(),
            ancestors_filter: BloomFilter::empty(),
            ancestors_count: 0,
            merge_base: None,
            merge_leader: None,
            revert: None,
            timestamp: Utc::now(),
            build_version: BUILD_VERSION,
            connection_id: String::new(),
        }
    }

    pub fn parents(mut self, parents: Vec<CommitId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    pub fn org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = org_id.into();
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn ancestors(mut self, filter: BloomFilter, count: u64) -> Self {
        self.ancestors_filter = filter;
        self.ancestors_count = count;
        self
    }

    pub fn build(self) -> Commit {
        let contents = match self.contents {
            CommitContents::Record(item) => CommitContents::Record(item.locked()),
            delta => delta,
        };
        // The wire form carries millisecond precision only.
        let timestamp =
            DateTime::from_timestamp_millis(self.timestamp.timestamp_millis()).unwrap_or(self.timestamp);
        Commit {
            id: self.id,
            key: self.key,
            session: self.session,
            org_id: self.org_id,
            contents,
            parents: self.parents,
            ancestors_filter: self.ancestors_filter,
            ancestors_count: self.ancestors_count,
            merge_base: self.merge_base,
            merge_leader: self.merge_leader,
            revert: self.revert,
            timestamp,
            build_version: self.build_version,
            signature: None,
            connection_id: self.connection_id,
            age: None,
        }
    }
}

impl Commit {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn contents(&self) -> &CommitContents {
        &self.contents
    }

    pub fn parents(&self) -> &[CommitId] {
        &self.parents
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn ancestors_filter(&self) -> &BloomFilter {
        &self.ancestors_filter
    }

    pub fn ancestors_count(&self) -> u64 {
        self.ancestors_count
    }

    pub fn merge_base(&self) -> Option<&str> {
        self.merge_base.as_deref()
    }

    pub fn merge_leader(&self) -> Option<&str> {
        self.merge_leader.as_deref()
    }

    pub fn revert(&self) -> Option<&str> {
        self.revert.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn build_version(&self) -> u32 {
        self.build_version
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn age(&self) -> Option<u64> {
        self.age
    }

    pub fn record(&self) -> Option<&Item> {
        match &self.contents {
            CommitContents::Record(item) => Some(item),
            CommitContents::Delta { .. } => None,
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self.contents, CommitContents::Delta { .. })
    }

    pub fn base(&self) -> Option<&str> {
        match &self.contents {
            CommitContents::Delta { base, .. } => Some(base),
            CommitContents::Record(_) => None,
        }
    }

    /// Schema of the content, when it is known without materializing.
    pub fn schema(&self) -> Option<&Schema> {
        match &self.contents {
            CommitContents::Record(item) => Some(item.schema()),
            CommitContents::Delta { edit, .. } => edit.upgrade.as_ref(),
        }
    }

    /// Checksum of the materialized content.
    pub fn contents_checksum(&self) -> Checksum {
        match &self.contents {
            CommitContents::Record(item) => item.checksum(),
            CommitContents::Delta { edit, .. } => edit.dst_checksum,
        }
    }

    /// Same commit, re-encoded as a delta against `base`.
    pub(crate) fn into_delta(mut self, base: CommitId, edit: Edit) -> Self {
        self.contents = CommitContents::Delta { base, edit };
        self
    }

    pub(crate) fn with_merge(mut self, base: Option<CommitId>, leader: String) -> Self {
        self.merge_base = base;
        self.merge_leader = Some(leader);
        self
    }

    pub fn with_signature(mut self, signature: String) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_age(mut self, age: u64) -> Self {
        self.age = Some(age);
        self
    }

    /// Bytes covered by the signature: the network encoding without `sig`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let encoded = self.encode(EncodeOptions {
            include_age: false,
            include_signature: false,
        });
        serde_json::to_vec(&encoded).unwrap_or_default()
    }

    /// Encoding shipped to peers.
    pub fn to_wire(&self) -> Value {
        self.to_json(EncodeOptions::default())
    }

    /// Encoding written to the local log.
    pub fn to_local_json(&self) -> Value {
        self.to_json(EncodeOptions {
            include_age: true,
            include_signature: true,
        })
    }

    pub fn to_json(&self, options: EncodeOptions) -> Value {
        serde_json::to_value(self.encode(options)).unwrap_or(Value::Null)
    }

    pub fn from_json(value: Value) -> Result<Self, CommitDecodeError> {
        let encoded: EncodedCommit = serde_json::from_value(value)?;
        Commit::try_from(encoded)
    }

    fn encode(&self, options: EncodeOptions) -> EncodedCommit {
        let c = match &self.contents {
            CommitContents::Record(item) => EncodedContents::Record { r: item.clone() },
            CommitContents::Delta { base, edit } => EncodedContents::Delta {
                b: base.clone(),
                e: edit.clone(),
            },
        };
        EncodedCommit {
            ver: self.build_version,
            id: self.id.clone(),
            k: self.key.clone(),
            s: self.session.clone(),
            ts: self.timestamp.timestamp_millis(),
            org: self.org_id.clone(),
            p: self.parents.clone(),
            af: self.ancestors_filter.clone(),
            ac: self.ancestors_count,
            c,
            sig: if options.include_signature {
                self.signature.clone()
            } else {
                None
            },
            mb: self.merge_base.clone(),
            ml: self.merge_leader.clone(),
            revert: self.revert.clone(),
            cid: self.connection_id.clone(),
            age: if options.include_age { self.age } else { None },
        }
    }

    /// Newest first; ties broken by id, descending.
    pub fn cmp_recency(a: &Commit, b: &Commit) -> Ordering {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    }

    /// Whether the first eight checksum bytes of the id fall in a `1 / rate` bucket.
    pub(crate) fn sampled(&self, rate: u32) -> bool {
        rate != 0 && checksum_bytes(self.id.as_bytes()).prefix_u64() % u64::from(rate) == 0
    }
}

/// Value equality ignores the local-only `age`.
impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.key == other.key
            && self.session == other.session
            && self.org_id == other.org_id
            && self.contents == other.contents
            && self.parents == other.parents
            && self.ancestors_filter == other.ancestors_filter
            && self.ancestors_count == other.ancestors_count
            && self.merge_base == other.merge_base
            && self.merge_leader == other.merge_leader
            && self.revert == other.revert
            && self.timestamp == other.timestamp
            && self.build_version == other.build_version
            && self.signature == other.signature
            && self.connection_id == other.connection_id
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub include_age: bool,
    pub include_signature: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            include_age: false,
            include_signature: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommitDecodeError {
    #[error("malformed commit: {0}")]
    Json(#[from] serde_json::Error),
    #[error("commit timestamp out of range: {0}")]
    Timestamp(i64),
    #[error("commit is missing its id")]
    MissingId,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncodedCommit {
    ver: u32,
    id: String,
    k: String,
    s: String,
    ts: i64,
    #[serde(default)]
    org: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    p: Vec<String>,
    af: BloomFilter,
    #[serde(default, skip_serializing_if = "is_zero")]
    ac: u64,
    c: EncodedContents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ml: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revert: Option<String>,
    #[serde(default)]
    cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    age: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum EncodedContents {
    Record { r: Item },
    Delta { b: String, e: Edit },
}

impl TryFrom<EncodedCommit> for Commit {
    type Error = CommitDecodeError;

    fn try_from(e: EncodedCommit) -> Result<Self, Self::Error> {
        if e.id.is_empty() {
            return Err(CommitDecodeError::MissingId);
        }
        let timestamp = Utc
            .timestamp_millis_opt(e.ts)
            .single()
            .ok_or(CommitDecodeError::Timestamp(e.ts))?;
        let contents = match e.c {
            EncodedContents::Record { r } => CommitContents::Record(r.locked()),
            EncodedContents::Delta { b, e } => CommitContents::Delta { base: b, edit: e },
        };
        Ok(Commit {
            id: e.id,
            key: e.k,
            session: e.s,
            org_id: e.org,
            contents,
            parents: e.p,
            ancestors_filter: e.af,
            ancestors_count: e.ac,
            merge_base: e.mb,
            merge_leader: e.ml,
            revert: e.revert,
            timestamp,
            build_version: e.ver,
            signature: e.sig,
            connection_id: e.cid,
            age: e.age,
        })
    }
}

/// Bounded cache of commits decoded from wire or log data.
///
/// Entries remember a digest of the payload they were decoded from. A
/// repeated delivery is served from the cache only when its payload is
/// identical; anything else under a known id is decoded afresh and replaces
/// the entry, so a bad copy sent by one peer cannot shadow the real commit.
pub struct CommitCache {
    inner: Mutex<LruCache<CommitId, (Checksum, Arc<Commit>)>>,
}

impl CommitCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LruCache<CommitId, (Checksum, Arc<Commit>)>> {
        self.inner.lock().expect("commit cache lock poisoned")
    }

    pub fn decode(&self, value: Value) -> Result<Arc<Commit>, CommitDecodeError> {
        let digest = checksum_json(&value);
        if let Some(id) = value.get("id").and_then(Value::as_str) {
            match self.entries().get(id) {
                Some((seen, cached)) if *seen == digest => return Ok(cached.clone()),
                Some(_) => tracing::warn!(commit = %id, "differing payloads for one commit id"),
                None => {}
            }
        }
        let commit = Arc::new(Commit::from_json(value)?);
        self.entries()
            .put(commit.id().to_owned(), (digest, commit.clone()));
        Ok(commit)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(text: &str) -> Item {
        Item::from_fields(Schema::new("notes", 1), [("text", json!(text))])
    }

    fn root() -> Commit {
        CommitBuilder::new("doc1", "session-x", record("hi"))
            .connection_id("conn-1")
            .build()
    }

    #[test]
    fn test_record_is_locked() {
        let commit = root();
        assert!(commit.record().unwrap().is_locked());
        assert!(commit.is_root());
    }

    #[test]
    fn test_wire_encoding_field_names() {
        let commit = root().with_signature("abc".into()).with_age(7);
        let wire = commit.to_wire();
        assert_eq!(wire["k"], "doc1");
        assert_eq!(wire["s"], "session-x");
        assert_eq!(wire["cid"], "conn-1");
        assert_eq!(wire["sig"], "abc");
        assert_eq!(wire["c"]["r"]["d"]["text"], "hi");
        assert!(wire.get("p").is_none());
        assert!(wire.get("ac").is_none());
        assert!(wire.get("age").is_none());
        assert!(wire.get("mb").is_none());

        let local = commit.to_local_json();
        assert_eq!(local["age"], 7);
    }

    #[test]
    fn test_decode_delta_contents() {
        let base = root();
        let edit = record("hi").diff(&record("hi there"), false);
        let delta = CommitBuilder::new("doc1", "session-x", record("hi there"))
            .parents(vec![base.id().to_owned()])
            .build()
            .into_delta(base.id().to_owned(), edit.clone());

        let decoded = Commit::from_json(delta.to_wire()).unwrap();
        assert_eq!(decoded, delta);
        assert_eq!(decoded.base(), Some(base.id()));
        assert_eq!(decoded.contents_checksum(), edit.dst_checksum);
        assert_eq!(decoded.parents(), [base.id().to_owned()]);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(Commit::from_json(json!({"id": "x"})).is_err());
        let mut wire = root().to_wire();
        wire["id"] = json!("");
        assert!(matches!(
            Commit::from_json(wire),
            Err(CommitDecodeError::MissingId)
        ));
    }

    #[test]
    fn test_signing_bytes_exclude_signature() {
        let commit = root();
        let signed = commit.clone().with_signature("sig".into());
        assert_eq!(commit.signing_bytes(), signed.signing_bytes());
    }

    #[test]
    fn test_equality_ignores_age() {
        let commit = root();
        assert_eq!(commit.clone().with_age(3), commit);
    }

    #[test]
    fn test_cmp_recency() {
        let now = Utc::now();
        let older = CommitBuilder::new("k", "s", record("a"))
            .timestamp(now - chrono::Duration::seconds(5))
            .build();
        let newer = CommitBuilder::new("k", "s", record("b")).timestamp(now).build();
        let mut list = vec![older.clone(), newer.clone()];
        list.sort_by(Commit::cmp_recency);
        assert_eq!(list[0].id(), newer.id());
    }

    #[test]
    fn test_commit_cache_reuses_decoded() {
        let cache = CommitCache::new(2);
        let commit = root();
        let a = cache.decode(commit.to_wire()).unwrap();
        let b = cache.decode(commit.to_wire()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        cache.decode(CommitBuilder::new("k2", "s", record("x")).build().to_wire()).unwrap();
        cache.decode(CommitBuilder::new("k3", "s", record("y")).build().to_wire()).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_commit_cache_does_not_serve_other_payload_for_same_id() {
        let cache = CommitCache::new(8);
        let real = root().with_signature("good".into());
        let mut tampered = real.to_wire();
        tampered["sig"] = json!("bad");
        tampered["c"]["r"]["d"]["text"] = json!("evil");

        let first = cache.decode(tampered).unwrap();
        assert_eq!(first.signature(), Some("bad"));

        let decoded = cache.decode(real.to_wire()).unwrap();
        assert_eq!(*decoded, real);
        assert_eq!(decoded.signature(), Some("good"));
        assert!(Arc::ptr_eq(&decoded, &cache.decode(real.to_wire()).unwrap()));
        assert_eq!(cache.len(), 1);
    }
}
