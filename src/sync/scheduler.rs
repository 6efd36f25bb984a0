use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::message::SyncMessage;
use super::transport::{SyncRequest, SyncTransport};
use super::SyncPriority;
use crate::config::SyncConfig;
use crate::error::SyncError;

type Reply = oneshot::Sender<Result<SyncMessage, SyncError>>;

struct Queued {
    request: SyncRequest,
    reply: Reply,
}

/// Batches sync requests for one endpoint into one call per tick.
///
/// Higher priorities drain first, up to `max_requests_per_batch`. Each
/// request is answered with the response carrying its path. A failed or
/// timed-out call fails every request in its batch as retryable.
pub struct SyncScheduler {
    transport: Arc<dyn SyncTransport>,
    queues: Mutex<[VecDeque<Queued>; 3]>,
    tick: Duration,
    timeout: Duration,
    max_batch: usize,
    cancel: CancellationToken,
}

impl SyncScheduler {
    /// Scheduler for a client-to-server endpoint.
    pub fn new(transport: Arc<dyn SyncTransport>, config: &SyncConfig) -> Arc<Self> {
        Self::with_timeout(transport, config, config.client_timeout())
    }

    /// Scheduler for a server-to-server endpoint, with the shorter timeout.
    pub fn for_server(transport: Arc<dyn SyncTransport>, config: &SyncConfig) -> Arc<Self> {
        Self::with_timeout(transport, config, config.server_timeout())
    }

    pub fn with_timeout(
        transport: Arc<dyn SyncTransport>,
        config: &SyncConfig,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            queues: Mutex::new(Default::default()),
            tick: config.tick(),
            timeout,
            max_batch: config.max_requests_per_batch.max(1),
            cancel: CancellationToken::new(),
        })
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, [VecDeque<Queued>; 3]> {
        self.queues.lock().expect("scheduler queue lock poisoned")
    }

    pub fn queued(&self) -> usize {
        self.queues().iter().map(VecDeque::len).sum()
    }

    /// Queue `msg` for `path` and wait for the peer's answer.
    pub async fn send(
        &self,
        path: &str,
        msg: SyncMessage,
        priority: SyncPriority,
    ) -> Result<SyncMessage, SyncError> {
        let (reply, answer) = oneshot::channel();
        self.queues()[priority.index()].push_back(Queued {
            request: SyncRequest {
                path: path.to_owned(),
                msg,
            },
            reply,
        });
        answer
            .await
            .map_err(|_| SyncError::ServiceUnavailable("sync scheduler stopped".into()))?
    }

    /// Take the next batch: highest priority first, one request per path.
    fn take_batch(&self) -> Vec<Queued> {
        let mut queues = self.queues();
        let mut batch = Vec::new();
        let mut paths = HashSet::new();
        for priority in SyncPriority::ALL_DESC {
            let queue = &mut queues[priority.index()];
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(queued) = queue.pop_front() {
                if batch.len() < self.max_batch && paths.insert(queued.request.path.clone()) {
                    batch.push(queued);
                } else {
                    kept.push_back(queued);
                }
            }
            *queue = kept;
        }
        batch
    }

    /// Send one batch. Returns the number of requests it carried.
    pub async fn flush(&self) -> usize {
        let batch = self.take_batch();
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();
        let (requests, replies): (Vec<SyncRequest>, Vec<Reply>) =
            batch.into_iter().map(|q| (q.request, q.reply)).unzip();
        let paths: Vec<String> = requests.iter().map(|r| r.path.clone()).collect();

        let result = match tokio::time::timeout(self.timeout, self.transport.send(requests)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        };

        match result {
            Ok(responses) => {
                let mut by_path: HashMap<String, SyncMessage> =
                    responses.into_iter().map(|r| (r.path, r.res)).collect();
                for (path, reply) in paths.into_iter().zip(replies) {
                    let answer = by_path.remove(&path).ok_or_else(|| {
                        SyncError::ServiceUnavailable(format!("no sync response for {path}"))
                    });
                    let _ = reply.send(answer);
                }
            }
            Err(err) => {
                tracing::debug!(requests = count, error = %err, "sync batch failed");
                let reason = err.to_string();
                for reply in replies {
                    let _ = reply.send(Err(SyncError::ServiceUnavailable(reason.clone())));
                }
            }
        }
        count
    }

    /// Flush on every tick until [`SyncScheduler::stop`].
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.flush().await;
                    }
                }
            }
            // Dropping the senders fails whatever is still waiting.
            for queue in scheduler.queues().iter_mut() {
                queue.clear();
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// One scheduler per endpoint, shared by every client of that endpoint.
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: Mutex<HashMap<String, Arc<SyncScheduler>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scheduler for `endpoint`, creating and starting it on first use.
    pub fn scheduler_for<F>(&self, endpoint: &str, config: &SyncConfig, connect: F) -> Arc<SyncScheduler>
    where
        F: FnOnce() -> Arc<dyn SyncTransport>,
    {
        let mut schedulers = self.schedulers.lock().expect("scheduler registry lock poisoned");
        if let Some(existing) = schedulers.get(endpoint) {
            return existing.clone();
        }
        let scheduler = SyncScheduler::new(connect(), config);
        scheduler.start();
        schedulers.insert(endpoint.to_owned(), scheduler.clone());
        scheduler
    }

    pub fn stop_all(&self) {
        let schedulers = self.schedulers.lock().expect("scheduler registry lock poisoned");
        for scheduler in schedulers.values() {
            scheduler.stop();
        }
    }
}
