//! Bloom-filter set reconciliation between repository replicas.
//!
//! Each round trip carries a [`SyncMessage`]: the sender's filter over the
//! commit ids it holds, its commit count, and the commits it believes the
//! receiver lacks. A replica converges with a peer by exchanging messages
//! until neither side finds anything missing.
//!
//! - [`SyncScheduler`] batches requests from many repositories to one
//!   endpoint into a single network call per tick.
//! - [`RepoClient`] drives the exchange for one repository and one peer on
//!   an adaptive timer.
//! - [`SyncServer`] answers batched requests for a set of repositories.
//! - [`LocalTransport`] connects a scheduler to a server in-process.

mod client;
mod message;
mod scheduler;
mod server;
mod timer;
mod transport;

pub use client::RepoClient;
pub use message::{BuildOptions, SyncMessage};
pub use scheduler::{SchedulerRegistry, SyncScheduler};
pub use server::{NudgeFn, SyncServer};
pub use timer::AdaptiveTimer;
pub use transport::{LocalTransport, SyncRequest, SyncResponse, SyncTransport};

use serde::{Deserialize, Serialize};

/// Wire protocol version carried by every message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Scheduling priority of a sync request. Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPriority {
    Normal = 0,
    FirstLoad = 1,
    HasLocalChanges = 2,
}

impl SyncPriority {
    pub(crate) const ALL_DESC: [SyncPriority; 3] = [
        SyncPriority::HasLocalChanges,
        SyncPriority::FirstLoad,
        SyncPriority::Normal,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Coarse connectivity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Last round trip succeeded.
    Online,
    /// A round trip is in flight.
    Sync,
    /// Last round trip failed.
    Offline,
}
