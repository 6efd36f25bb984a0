use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use docdag::commit::CommitBuilder;
use docdag::config::RepoConfig;
use docdag::trust::{KeyedTrustPool, TrustPool};
use docdag::{Commit, Item, Repository, RepositoryOptions, Schema};
use serde_json::json;

fn text(value: &str) -> Item {
    Item::from_fields(Schema::new("docs", 1), [("text", json!(value))])
}

fn pool(name: &str) -> Arc<KeyedTrustPool> {
    Arc::new(KeyedTrustPool::new(name, KeyedTrustPool::derive_key(name)))
}

fn signed(trust: &KeyedTrustPool, commit: Commit) -> Commit {
    let signature = trust.sign(&commit);
    commit.with_signature(signature)
}

fn announcement(trust: &KeyedTrustPool) -> Commit {
    let session = trust.session_id().to_owned();
    signed(trust, CommitBuilder::new(session.clone(), session, trust.session_record()).build())
}

/// A repository that has announced its own session.
fn replica(name: &str, config: RepoConfig) -> Arc<Repository> {
    let trust = pool(name);
    let record = trust.session_record();
    let repo = Repository::new(RepositoryOptions::new("docs").with_config(config), trust);
    repo.set_value_for_key(name, record, None).unwrap();
    repo
}

/// Ship every commit `from` holds to `to`, as a full sync would.
fn exchange(from: &Repository, to: &Repository) {
    let commits = from
        .all_commit_ids()
        .iter()
        .filter_map(|id| from.get_commit(id).ok())
        .map(|c| Commit::from_json(c.to_wire()).unwrap())
        .collect();
    to.persist_commits(commits);
}

/// Root A plus concurrent edits B (session x) and C (session y), all older
/// than the merge-leader window.
fn divergent_history() -> Vec<Commit> {
    let x = pool("x");
    let y = pool("y");
    let past = Utc::now() - chrono::Duration::seconds(60);
    let a = signed(
        &x,
        CommitBuilder::new("doc1", "x", text("hi"))
            .connection_id("conn-x")
            .timestamp(past)
            .build(),
    );
    let b = signed(
        &x,
        CommitBuilder::new("doc1", "x", text("hi there"))
            .parents(vec![a.id().to_owned()])
            .connection_id("conn-x")
            .timestamp(past + chrono::Duration::seconds(1))
            .build(),
    );
    let c = signed(
        &y,
        CommitBuilder::new("doc1", "y", text("hi!"))
            .parents(vec![a.id().to_owned()])
            .connection_id("conn-y")
            .timestamp(past + chrono::Duration::seconds(2))
            .build(),
    );
    vec![announcement(&x), announcement(&y), a, b, c]
}

fn ids(commits: &[Arc<Commit>]) -> BTreeSet<String> {
    commits.iter().map(|c| c.id().to_owned()).collect()
}

#[test]
fn test_concurrent_edits_merge_from_common_base() {
    let history = divergent_history();
    let (a, b, c) = (history[2].id().to_owned(), history[3].id().to_owned(), history[4].id().to_owned());

    let repo = Repository::new(RepositoryOptions::new("docs"), pool("r"));
    assert_eq!(repo.persist_commits(history.clone()).len(), 5);
    assert_eq!(
        ids(&repo.leaves_for_key("doc1")),
        BTreeSet::from([b.clone(), c.clone()])
    );

    // Leaves are older than the leader window, so this replica may merge.
    repo.drain_background();
    let merge = repo.head_for_key("doc1").unwrap();
    assert_eq!(
        merge.parents().iter().cloned().collect::<BTreeSet<_>>(),
        BTreeSet::from([b, c])
    );
    assert_eq!(merge.merge_base(), Some(a.as_str()));
    assert_eq!(merge.merge_leader(), Some("r"));
    assert_eq!(repo.leaves_for_key("doc1").len(), 1);

    // The merged record is reproducible from the same inputs.
    let again = Repository::new(RepositoryOptions::new("docs"), pool("r"));
    again.persist_commits(history);
    again.drain_background();
    let merged = repo.value_for_key("doc1").unwrap();
    assert_eq!(merged.checksum(), again.value_for_key("doc1").unwrap().checksum());
    assert!([json!("hi there"), json!("hi!")].contains(merged.get("text").unwrap()));
}

#[test]
fn test_head_is_deterministic_across_rebuilds() {
    let history = divergent_history();
    let heads: Vec<String> = (0..3)
        .map(|_| {
            let repo = Repository::new(
                RepositoryOptions::new("docs").with_connection_id("conn-r"),
                pool("r"),
            );
            repo.persist_commits(history.clone());
            let first = repo.head_for_key("doc1").unwrap();
            assert_eq!(repo.head_for_key("doc1").unwrap().id(), first.id());
            first.id().to_owned()
        })
        .collect();
    assert!(heads.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_replicas_converge_with_single_merge_leader() {
    let r1 = replica("r1", RepoConfig::default());
    let r2 = replica("r2", RepoConfig::default());
    r1.set_value_for_key("doc1", text("hi"), None).unwrap();
    exchange(&r1, &r2);
    exchange(&r2, &r1);
    r1.drain_background();
    r2.drain_background();

    r1.set_value_for_key("doc1", text("hi there"), None).unwrap();
    r2.set_value_for_key("doc1", text("hi!"), None).unwrap();
    exchange(&r1, &r2);
    exchange(&r2, &r1);
    r1.drain_background();
    r2.drain_background();

    let merges: BTreeSet<String> = [&r1, &r2]
        .iter()
        .flat_map(|repo| repo.commits_for_key("doc1"))
        .filter(|c| c.parents().len() == 2)
        .map(|c| c.id().to_owned())
        .collect();
    assert_eq!(merges.len(), 1, "exactly one replica is merge leader");

    exchange(&r1, &r2);
    exchange(&r2, &r1);
    r1.drain_background();
    r2.drain_background();
    let (h1, h2) = (r1.head_for_key("doc1").unwrap(), r2.head_for_key("doc1").unwrap());
    assert_eq!(h1.id(), h2.id());
    assert_eq!(
        r1.value_for_key("doc1").unwrap().checksum(),
        r2.value_for_key("doc1").unwrap().checksum()
    );
}

#[test]
fn test_delta_compression_threshold() {
    let repo = replica(
        "r",
        RepoConfig {
            full_commit_sample_rate: 0,
            ..RepoConfig::default()
        },
    );
    let body = "lorem ipsum ".repeat(40);
    let doc = |body: &str, n: i64| {
        Item::from_fields(Schema::new("docs", 1), [("body", json!(body)), ("n", json!(n))])
    };

    let base = repo.set_value_for_key("doc1", doc(&body, 1), None).unwrap().unwrap();
    assert!(!base.is_delta());

    let small = repo.set_value_for_key("doc1", doc(&body, 2), None).unwrap().unwrap();
    assert!(small.is_delta());
    assert_eq!(small.base(), Some(base.id()));
    assert_eq!(repo.record_for_commit(&small), doc(&body, 2));

    let rewrite = "dolor sit amet ".repeat(40);
    let large = repo.set_value_for_key("doc1", doc(&rewrite, 3), None).unwrap().unwrap();
    assert!(!large.is_delta());
    assert_eq!(repo.value_for_key("doc1"), Some(doc(&rewrite, 3)));
}

#[test]
fn test_corrupt_delta_falls_back_to_last_good_record() {
    let repo = replica(
        "r",
        RepoConfig {
            full_commit_sample_rate: 0,
            ..RepoConfig::default()
        },
    );
    let body = "lorem ipsum ".repeat(40);
    let doc = |n: i64| Item::from_fields(Schema::new("docs", 1), [("body", json!(body)), ("n", json!(n))]);
    repo.set_value_for_key("doc1", doc(1), None).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let good = repo.set_value_for_key("doc1", doc(2), None).unwrap().unwrap();
    assert!(good.is_delta());
    let unrelated = repo.set_value_for_key("other", text("unrelated"), None).unwrap().unwrap();

    // Same edit, pointed at a base whose record does not match its source.
    let mut wire = good.to_wire();
    wire["id"] = json!("corrupt-1");
    wire["c"]["b"] = json!(unrelated.id());
    let corrupt = Commit::from_json(wire.clone()).unwrap();
    repo.persist_verified_commits(vec![corrupt.clone()]);

    assert_eq!(repo.record_for_commit(&corrupt), doc(2));
    assert!(repo.is_corrupted("corrupt-1"));
    assert_eq!(repo.record_for_commit(&corrupt), doc(2));
    assert_eq!(repo.value_for_key("doc1"), Some(doc(2)));

    // Nothing good to fall back to.
    wire["id"] = json!("corrupt-2");
    wire["k"] = json!("lonely");
    wire["p"] = json!([]);
    let lonely = Commit::from_json(wire).unwrap();
    repo.persist_verified_commits(vec![lonely.clone()]);
    assert!(repo.record_for_commit(&lonely).is_null());
    assert!(repo.head_for_key("lonely").is_none());
}
