use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docdag::config::SyncConfig;
use docdag::sync::{
    LocalTransport, RepoClient, SyncRequest, SyncResponse, SyncScheduler, SyncServer, SyncStatus,
    SyncTransport,
};
use docdag::trust::KeyedTrustPool;
use docdag::{Item, Repository, RepositoryOptions, Schema, SyncError};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Honour `RUST_LOG` when debugging a failing run.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> SyncConfig {
    SyncConfig {
        tick_ms: 5,
        submit_retry: 3,
        ..SyncConfig::default()
    }
}

fn text(value: &str) -> Item {
    Item::from_fields(Schema::new("notes", 1), [("text", json!(value))])
}

fn repo(name: &str, announce: bool) -> Arc<Repository> {
    let trust = Arc::new(KeyedTrustPool::new(name, KeyedTrustPool::derive_key(name)));
    let record = trust.session_record();
    let repo = Repository::new(RepositoryOptions::new("notes"), trust);
    if announce {
        repo.set_value_for_key(name, record, None).unwrap();
    }
    repo
}

fn client(transport: Arc<dyn SyncTransport>, repo: Arc<Repository>) -> Arc<RepoClient> {
    client_with(transport, repo, config())
}

fn client_with(
    transport: Arc<dyn SyncTransport>,
    repo: Arc<Repository>,
    config: SyncConfig,
) -> Arc<RepoClient> {
    let scheduler = SyncScheduler::new(transport, &config);
    scheduler.start();
    RepoClient::new(repo, scheduler, config)
}

/// Poll `check` until it holds, failing after ten seconds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn merge_ids(replicas: &[&Arc<Repository>], key: &str) -> BTreeSet<String> {
    replicas
        .iter()
        .flat_map(|repo| repo.commits_for_key(key))
        .filter(|c| c.parents().len() == 2)
        .map(|c| c.id().to_owned())
        .collect()
}

/// Counts the commits carried by every outgoing request.
struct Recording {
    inner: LocalTransport,
    sent: Mutex<Vec<usize>>,
}

#[async_trait]
impl SyncTransport for Recording {
    async fn send(&self, batch: Vec<SyncRequest>) -> Result<Vec<SyncResponse>, SyncError> {
        let carried = batch.iter().map(|r| r.msg.values.len()).sum();
        self.sent.lock().unwrap().push(carried);
        self.inner.send(batch).await
    }
}

async fn settle(clients: &[&Arc<RepoClient>], repos: &[&Arc<Repository>]) {
    for _ in 0..4 {
        for client in clients {
            client.sync(5).await.unwrap();
        }
        for repo in repos {
            repo.drain_background();
        }
    }
}

#[tokio::test]
async fn test_two_replicas_converge_through_server() {
    init_tracing();
    let server_repo = repo("server", true);
    let server = SyncServer::new(config());
    server.register(server_repo.clone());

    let r1 = repo("alice", true);
    let r2 = repo("bob", true);
    let c1 = client(Arc::new(LocalTransport::new(server.clone(), "alice")), r1.clone());
    let c2 = client(Arc::new(LocalTransport::new(server.clone(), "bob")), r2.clone());
    let replicas = [&r1, &r2, &server_repo];

    r1.set_value_for_key("doc1", text("hi"), None).unwrap();
    settle(&[&c1, &c2], &replicas).await;
    assert_eq!(r2.value_for_key("doc1"), Some(text("hi")));

    // Concurrent edits of the same base.
    r1.set_value_for_key("doc1", text("hi there"), None).unwrap();
    r2.set_value_for_key("doc1", text("hi!"), None).unwrap();
    settle(&[&c1, &c2], &replicas).await;

    let heads: BTreeSet<String> = replicas
        .iter()
        .map(|repo| repo.head_for_key("doc1").unwrap().id().to_owned())
        .collect();
    assert_eq!(heads.len(), 1, "all replicas share one head");
    let value = r1.value_for_key("doc1").unwrap();
    assert!(replicas.iter().all(|repo| repo.value_for_key("doc1").as_ref() == Some(&value)));

    assert_eq!(merge_ids(&replicas, "doc1").len(), 1, "only the elected leader merged");
    assert_eq!(r1.num_commits(), server_repo.num_commits());
    assert_eq!(r2.num_commits(), server_repo.num_commits());

    assert!(!c1.needs_replication());
    assert_eq!(c1.current_status(), SyncStatus::Online);
    c1.stop();
    c2.stop();
}

#[tokio::test]
async fn test_rejected_commit_stops_being_offered() {
    init_tracing();
    let server = SyncServer::new(config());
    server.register(repo("server", true));

    // Never announced, so the server drops everything this replica writes.
    let stranger = repo("stranger", false);
    let recording = Arc::new(Recording {
        inner: LocalTransport::new(server.clone(), "stranger"),
        sent: Mutex::new(Vec::new()),
    });
    let c = client(recording.clone(), stranger.clone());
    stranger.set_value_for_key("doc1", text("ignored"), None).unwrap();

    for _ in 0..config().submit_retry + 1 {
        c.sync_cycle().await.unwrap();
    }
    let sent = recording.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![1, 1, 1, 0]);
    assert!(c.needs_replication());
    c.stop();
}

#[tokio::test]
async fn test_running_clients_merge_concurrent_edits() {
    init_tracing();
    let config = SyncConfig {
        poll_min_ms: 5,
        poll_max_ms: 50,
        ..config()
    };
    let server_repo = repo("server", true);
    let server = SyncServer::new(config.clone());
    server.register(server_repo.clone());

    let r1 = repo("alice", true);
    let r2 = repo("bob", true);
    let c1 = client_with(Arc::new(LocalTransport::new(server.clone(), "alice")), r1.clone(), config.clone());
    let c2 = client_with(Arc::new(LocalTransport::new(server.clone(), "bob")), r2.clone(), config);
    c1.start();
    c2.start();
    let replicas = [&r1, &r2, &server_repo];

    r1.set_value_for_key("doc1", text("hi"), None).unwrap();
    eventually("first edit to replicate", || r2.value_for_key("doc1") == Some(text("hi"))).await;

    // No await in between, so neither loop sees one edit before the other is made.
    r1.set_value_for_key("doc1", text("hi there"), None).unwrap();
    r2.set_value_for_key("doc1", text("hi!"), None).unwrap();

    eventually("replicas to share one merged head", || {
        let heads: BTreeSet<Option<String>> = replicas
            .iter()
            .map(|repo| repo.head_for_key("doc1").map(|c| c.id().to_owned()))
            .collect();
        heads.len() == 1 && replicas.iter().all(|repo| repo.leaves_for_key("doc1").len() == 1)
    })
    .await;

    let head = r1.head_for_key("doc1").unwrap();
    assert_eq!(head.parents().len(), 2);
    assert_eq!(merge_ids(&replicas, "doc1").len(), 1, "only the elected leader merged");
    let value = r1.value_for_key("doc1").unwrap();
    assert!(replicas.iter().all(|repo| repo.value_for_key("doc1").as_ref() == Some(&value)));
    eventually("background queues to empty", || {
        replicas.iter().all(|repo| repo.background_queued() == 0)
    })
    .await;

    c1.stop();
    c2.stop();
}
