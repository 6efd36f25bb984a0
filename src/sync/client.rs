use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::message::{BuildOptions, SyncMessage};
use super::scheduler::SyncScheduler;
use super::timer::AdaptiveTimer;
use super::{SyncPriority, SyncStatus};
use crate::commit::{CommitCache, CommitId};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::Subscription;
use crate::repository::Repository;

const DECODE_CACHE_SIZE: usize = 1_024;

struct ClientState {
    /// Summary of the peer's last response.
    peer: Option<SyncMessage>,
    /// Offers per commit id, for the retry cap.
    submit_counts: HashMap<CommitId, u32>,
    timer: AdaptiveTimer,
}

/// What one round trip moved.
struct Round {
    sent: usize,
    received: usize,
    peer_pending: u64,
}

/// Keeps one repository in sync with one peer.
///
/// Local commits written through this replica's connection are tracked
/// until the peer's filter shows them; while any are outstanding the client
/// syncs at [`SyncPriority::HasLocalChanges`] and polls at the fastest rate.
pub struct RepoClient {
    repo: Arc<Repository>,
    scheduler: Arc<SyncScheduler>,
    config: SyncConfig,
    cache: CommitCache,
    state: Mutex<ClientState>,
    pending_local: Arc<Mutex<BTreeSet<CommitId>>>,
    status: watch::Sender<SyncStatus>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
}

impl RepoClient {
    pub fn new(repo: Arc<Repository>, scheduler: Arc<SyncScheduler>, config: SyncConfig) -> Arc<Self> {
        let pending_local = Arc::new(Mutex::new(BTreeSet::new()));
        let wake = Arc::new(Notify::new());

        let subscription = {
            let pending = pending_local.clone();
            let wake = wake.clone();
            let connection_id = repo.connection_id().to_owned();
            repo.events().new_commit_sync.subscribe(move |commit| {
                if commit.connection_id() != connection_id {
                    return;
                }
                pending
                    .lock()
                    .expect("pending commit lock poisoned")
                    .insert(commit.id().to_owned());
                wake.notify_one();
            })
        };

        let timer = AdaptiveTimer::new(config.poll_min(), config.poll_max());
        let (status, _) = watch::channel(SyncStatus::Offline);
        Arc::new(Self {
            repo,
            scheduler,
            config,
            cache: CommitCache::new(DECODE_CACHE_SIZE),
            state: Mutex::new(ClientState {
                peer: None,
                submit_counts: HashMap::new(),
                timer,
            }),
            pending_local,
            status,
            wake,
            cancel: CancellationToken::new(),
            subscription: Mutex::new(Some(subscription)),
        })
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect("repo client lock poisoned")
    }

    fn pending_local(&self) -> MutexGuard<'_, BTreeSet<CommitId>> {
        self.pending_local.lock().expect("pending commit lock poisoned")
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Observe status changes.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: SyncStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::debug!(path = self.repo.path(), ?status, "sync status changed");
        }
    }

    /// Whether a local commit is missing from the peer's last advertised filter.
    pub fn needs_replication(&self) -> bool {
        let pending = self.pending_local();
        if pending.is_empty() {
            return false;
        }
        match &self.state().peer {
            None => true,
            Some(peer) => pending.iter().any(|id| !peer.has(id)),
        }
    }

    pub fn priority(&self) -> SyncPriority {
        if self.needs_replication() {
            SyncPriority::HasLocalChanges
        } else if self.state().peer.is_none() {
            SyncPriority::FirstLoad
        } else {
            SyncPriority::Normal
        }
    }

    fn build_message(&self) -> SyncMessage {
        let ids = self.repo.all_commit_ids();
        let options = BuildOptions {
            cycles: self.config.cycles,
            fpr: self.config.fpr,
            max_values: self.config.max_values_per_message,
            include_pending: false,
            build_version: self.repo.config().build_version,
        };
        let retry = self.config.submit_retry;
        let mut guard = self.state();
        let state = &mut *guard;
        let counts = &mut state.submit_counts;
        SyncMessage::build(&self.repo, &ids, state.peer.as_ref(), &options, |commit| {
            let offered = counts.entry(commit.id().to_owned()).or_insert(0);
            if *offered >= retry {
                return false;
            }
            *offered += 1;
            true
        })
    }

    async fn round(&self) -> Result<Round, SyncError> {
        let msg = self.build_message();
        let sent = msg.values.len();
        let priority = self.priority();
        self.set_status(SyncStatus::Sync);

        let res = match self.scheduler.send(self.repo.path(), msg, priority).await {
            Ok(res) => res,
            Err(err) => {
                tracing::debug!(path = self.repo.path(), error = %err, "sync round failed");
                self.set_status(SyncStatus::Offline);
                self.state().timer.backoff();
                return Err(err);
            }
        };
        self.set_status(SyncStatus::Online);

        let values = res.decode_values(&self.cache);
        let peer = res.summary();
        self.pending_local().retain(|id| !peer.has(id));
        {
            let mut state = self.state();
            state.submit_counts.retain(|id, _| !peer.has(id));
            state.peer = Some(peer);
        }
        let received = self.repo.persist_commits(values).len();

        let round = Round {
            sent,
            received,
            peer_pending: res.pending.unwrap_or(0),
        };
        let busy = round.sent > 0 || round.received > 0 || round.peer_pending > 0;
        let needs_replication = self.needs_replication();
        let mut state = self.state();
        if busy || needs_replication {
            state.timer.touch();
        } else {
            state.timer.backoff();
        }
        Ok(round)
    }

    /// Run one round trip. Returns the number of commits received.
    pub async fn sync_cycle(&self) -> Result<usize, SyncError> {
        Ok(self.round().await?.received)
    }

    /// Run up to `cycles` round trips back to back, stopping early once a
    /// round moved nothing in either direction.
    ///
    /// Convergence is probabilistic: filter false positives can hide a
    /// missing commit for a round.
    pub async fn sync(&self, cycles: usize) -> Result<(), SyncError> {
        for _ in 0..cycles {
            let round = self.round().await?;
            if round.sent == 0
                && round.received == 0
                && round.peer_pending == 0
                && !self.needs_replication()
            {
                break;
            }
        }
        Ok(())
    }

    /// Poll on the adaptive timer until [`RepoClient::stop`]. Local commits
    /// wake the loop early.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = client.state().timer.next_delay();
                tokio::select! {
                    _ = client.cancel.cancelled() => break,
                    _ = client.wake.notified() => client.state().timer.touch(),
                    _ = tokio::time::sleep(delay) => {}
                }
                // Failures already set the status and back the timer off.
                let _ = client.round().await;
            }
        })
    }

    /// Stop polling and stop tracking local commits.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.subscription
            .lock()
            .expect("repo client lock poisoned")
            .take();
    }
}
