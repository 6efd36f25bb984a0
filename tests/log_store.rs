use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use docdag::config::load_config;
use docdag::log::{LogFile, LogOptions};
use docdag::repository::open_in_data_dir;
use docdag::trust::KeyedTrustPool;
use docdag::{DbConfig, Item, RepositoryOptions, Schema};
use serde_json::{json, Value};

fn trust() -> Arc<KeyedTrustPool> {
    Arc::new(KeyedTrustPool::new("alice", KeyedTrustPool::derive_key("alice")))
}

fn note(n: i64) -> Item {
    Item::from_fields(Schema::new("notes", 1), [("n", json!(n))])
}

fn cut_tail(path: &Path, bytes: u64) -> u64 {
    let len = std::fs::metadata(path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap()
        .set_len(len - bytes)
        .unwrap();
    len - bytes
}

fn read_back(path: &Path) -> Vec<Value> {
    let mut log = LogFile::open(path, false, LogOptions::default()).unwrap();
    log.read_all(3).unwrap()
}

#[test]
fn test_crash_truncation_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("notes.jsonl");
    let records: Vec<Value> = (0..5).map(|i| json!({"id": format!("r{i}"), "n": i})).collect();
    {
        let mut log = LogFile::open(&path, true, LogOptions::default()).unwrap();
        log.read_all(10).unwrap();
        log.append(&records[..3]).unwrap();
        log.append(&records[3..4]).unwrap();
        log.flush().unwrap();
    }
    let torn_len = cut_tail(&path, 4);

    {
        let mut log = LogFile::open(&path, true, LogOptions::default()).unwrap();
        assert_eq!(log.read_all(2).unwrap(), records[..3].to_vec());
        assert!(std::fs::metadata(&path).unwrap().len() < torn_len);
        // The cut record can be written again: its id never made it in.
        log.append(&records[3..]).unwrap();
        log.flush().unwrap();
    }

    assert_eq!(read_back(&path), records);
    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.matches("\"r3\"").count(), 1);
}

#[test]
fn test_repository_recovers_from_torn_log() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("docdag.yaml"),
        "log:\n  scan_batch_size: 2\nrepo:\n  full_commit_sample_rate: 0\n",
    )
    .unwrap();
    let config = load_config(tmp.path()).unwrap();
    assert_eq!(config.log.scan_batch_size, 2);
    assert_ne!(config, DbConfig::default());

    let data = tmp.path().join("data");
    let options = || RepositoryOptions::new("team/notes");
    let log_path = {
        let durable = open_in_data_dir(&data, options(), trust(), &config).unwrap();
        let repo = durable.repository().clone();
        for n in 0..4 {
            repo.set_value_for_key("doc", note(n), None).unwrap();
        }
        let path = durable.log_path();
        durable.close().unwrap();
        path
    };
    assert_eq!(read_back(&log_path).len(), 4);
    cut_tail(&log_path, 10);

    {
        let durable = open_in_data_dir(&data, options(), trust(), &config).unwrap();
        let repo = durable.repository().clone();
        assert_eq!(repo.num_commits(), 3);
        assert_eq!(repo.value_for_key("doc"), Some(note(2)));
        repo.set_value_for_key("doc", note(9), None).unwrap();
        durable.close().unwrap();
    }

    let durable = open_in_data_dir(&data, options(), trust(), &config).unwrap();
    let repo = durable.repository();
    assert_eq!(repo.num_commits(), 4);
    assert_eq!(repo.value_for_key("doc"), Some(note(9)));
    assert_eq!(read_back(&log_path).len(), 4);
    durable.close().unwrap();
}
