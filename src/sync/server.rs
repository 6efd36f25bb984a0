use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::message::{BuildOptions, SyncMessage};
use super::transport::{SyncRequest, SyncResponse};
use crate::commit::CommitCache;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::repository::Repository;

/// Called with `(path, session)` after a request from `session` added
/// commits to `path`, so other replicas of that path can be told to sync.
pub type NudgeFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

const DECODE_CACHE_SIZE: usize = 4_096;

/// Answers batched sync requests for the repositories registered with it.
pub struct SyncServer {
    repos: RwLock<HashMap<String, Arc<Repository>>>,
    config: SyncConfig,
    cache: CommitCache,
    nudge: RwLock<Option<NudgeFn>>,
}

impl SyncServer {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            repos: RwLock::new(HashMap::new()),
            config,
            cache: CommitCache::new(DECODE_CACHE_SIZE),
            nudge: RwLock::new(None),
        })
    }

    pub fn register(&self, repo: Arc<Repository>) {
        self.repos
            .write()
            .expect("server repo lock poisoned")
            .insert(repo.path().to_owned(), repo);
    }

    pub fn repository(&self, path: &str) -> Option<Arc<Repository>> {
        self.repos
            .read()
            .expect("server repo lock poisoned")
            .get(path)
            .cloned()
    }

    pub fn set_nudge(&self, nudge: NudgeFn) {
        *self.nudge.write().expect("server nudge lock poisoned") = Some(nudge);
    }

    /// Handle one batched call from `session`.
    ///
    /// Requests for unknown paths get no response; the caller's scheduler
    /// reports those as unavailable.
    pub fn handle_batch(
        &self,
        session: &str,
        batch: Vec<SyncRequest>,
    ) -> Result<Vec<SyncResponse>, SyncError> {
        if session.is_empty() {
            return Err(SyncError::Unauthorized);
        }
        let mut responses = Vec::with_capacity(batch.len());
        for SyncRequest { path, msg } in batch {
            let Some(repo) = self.repository(&path) else {
                tracing::debug!(%path, "sync request for unknown repository");
                continue;
            };
            let res = self.handle_one(session, &repo, &msg);
            responses.push(SyncResponse { path, res });
        }
        Ok(responses)
    }

    /// Decode a JSON request array and encode the response array.
    pub fn handle_json(&self, session: &str, body: &str) -> Result<String, SyncError> {
        let batch: Vec<SyncRequest> = serde_json::from_str(body)?;
        let responses = self.handle_batch(session, batch)?;
        Ok(serde_json::to_string(&responses)?)
    }

    fn handle_one(&self, session: &str, repo: &Repository, msg: &SyncMessage) -> SyncMessage {
        let persisted = repo.persist_commits(msg.decode_values(&self.cache));
        let cycles = if persisted.is_empty() {
            self.config.cycles
        } else {
            tracing::debug!(
                path = repo.path(),
                session,
                persisted = persisted.len(),
                "sync request added commits"
            );
            if let Some(nudge) = self.nudge.read().expect("server nudge lock poisoned").clone() {
                nudge(repo.path(), session);
            }
            self.config.max_cycles
        };

        let ids = repo.authorized_commit_ids(session);
        let options = BuildOptions {
            cycles,
            fpr: self.config.fpr,
            max_values: self.config.max_values_per_message,
            include_pending: true,
            build_version: repo.config().build_version,
        };
        SyncMessage::build(repo, &ids, Some(msg), &options, |_| true)
    }
}
