use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::message::SyncMessage;
use super::server::SyncServer;
use crate::error::SyncError;

/// One repository's request inside a batched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub path: String,
    pub msg: SyncMessage,
}

/// One repository's response inside a batched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub path: String,
    pub res: SyncMessage,
}

/// A network round trip to one sync endpoint.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, batch: Vec<SyncRequest>) -> Result<Vec<SyncResponse>, SyncError>;
}

/// Transport that hands batches to an in-process [`SyncServer`] through a
/// JSON round trip, as a network transport would.
pub struct LocalTransport {
    server: Arc<SyncServer>,
    session: String,
    offline: AtomicBool,
}

impl LocalTransport {
    pub fn new(server: Arc<SyncServer>, session: impl Into<String>) -> Self {
        Self {
            server,
            session: session.into(),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate losing or regaining connectivity.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn send(&self, batch: Vec<SyncRequest>) -> Result<Vec<SyncResponse>, SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::ServiceUnavailable("endpoint unreachable".into()));
        }
        let body = serde_json::to_string(&batch)?;
        let reply = self.server.handle_json(&self.session, &body)?;
        Ok(serde_json::from_str(&reply)?)
    }
}
