//! Signing, verification, and authorization collaborators.
//!
//! The repository never inspects signatures itself; it asks a [`TrustPool`].
//! [`KeyedTrustPool`] is a symmetric implementation keyed per session with
//! BLAKE3 MACs, suitable for embedded deployments and tests. Session keys
//! propagate through ordinary commits in the `sessions` namespace: a record
//! with `id` and `key` fields registers a session once it becomes a leaf.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::checksum::{keyed_checksum, Checksum};
use crate::commit::Commit;
use crate::item::Item;

pub trait TrustPool: Send + Sync {
    /// Session that signs commits created by this process.
    fn session_id(&self) -> &str;

    fn sign(&self, commit: &Commit) -> String;

    /// Whether `commit` carries a valid signature from a known session.
    fn verify(&self, commit: &Commit) -> bool;

    /// Learn a session from a record in the `sessions` namespace.
    fn add_session_record(&self, record: &Item);
}

/// Operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOp {
    Read,
    Write,
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, repo_path: &str, session: &str, commit: &Commit, op: AuthOp) -> bool;
}

/// Trust pool backed by per-session 32-byte keys.
pub struct KeyedTrustPool {
    session_id: String,
    key: [u8; 32],
    sessions: RwLock<HashMap<String, [u8; 32]>>,
}

impl KeyedTrustPool {
    pub fn new(session_id: impl Into<String>, key: [u8; 32]) -> Self {
        let session_id = session_id.into();
        let mut sessions = HashMap::new();
        sessions.insert(session_id.clone(), key);
        Self {
            session_id,
            key,
            sessions: RwLock::new(sessions),
        }
    }

    /// Key derived from a passphrase, handy for tests and fixtures.
    pub fn derive_key(secret: &str) -> [u8; 32] {
        blake3::derive_key("docdag session key", secret.as_bytes())
    }

    pub fn register_session(&self, session_id: impl Into<String>, key: [u8; 32]) {
        self.sessions
            .write()
            .expect("trust pool lock poisoned")
            .insert(session_id.into(), key);
    }

    pub fn knows_session(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .expect("trust pool lock poisoned")
            .contains_key(session_id)
    }

    /// Record announcing this pool's own session.
    pub fn session_record(&self) -> Item {
        session_record(&self.session_id, &self.key)
    }

    fn key_for(&self, commit: &Commit) -> Option<[u8; 32]> {
        if let Some(key) = self
            .sessions
            .read()
            .expect("trust pool lock poisoned")
            .get(commit.session())
        {
            return Some(*key);
        }
        // A session's own announcement is verified with the key it announces.
        let record = commit.record()?;
        if !record.schema().is_session() {
            return None;
        }
        let (id, key) = parse_session_record(record)?;
        (id == commit.session()).then_some(key)
    }
}

impl TrustPool for KeyedTrustPool {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn sign(&self, commit: &Commit) -> String {
        keyed_checksum(&self.key, &commit.signing_bytes()).to_hex()
    }

    fn verify(&self, commit: &Commit) -> bool {
        let Some(signature) = commit.signature() else {
            return false;
        };
        let Ok(claimed) = Checksum::from_hex(signature) else {
            return false;
        };
        let Some(key) = self.key_for(commit) else {
            return false;
        };
        keyed_checksum(&key, &commit.signing_bytes()).eq_ct(&claimed)
    }

    fn add_session_record(&self, record: &Item) {
        match parse_session_record(record) {
            Some((id, key)) => {
                tracing::debug!(session = %id, "session added to trust pool");
                self.register_session(id, key);
            }
            None => tracing::warn!("ignoring malformed session record"),
        }
    }
}

/// Build a `sessions` record for `session_id`.
pub fn session_record(session_id: &str, key: &[u8; 32]) -> Item {
    Item::from_fields(
        crate::item::Schema::new(crate::item::SESSION_NAMESPACE, 1),
        [
            ("id", serde_json::Value::from(session_id)),
            ("key", serde_json::Value::from(Checksum::from_bytes(*key).to_hex())),
        ],
    )
}

fn parse_session_record(record: &Item) -> Option<(String, [u8; 32])> {
    let id = record.get("id")?.as_str()?.to_owned();
    let key = Checksum::from_hex(record.get("key")?.as_str()?).ok()?;
    Some((id, *key.as_bytes()))
}
