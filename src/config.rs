//! Tunables for the log store, the repository, and the sync protocol.
//!
//! Configuration lives in an optional `docdag.json`, `docdag.yaml`, or
//! `docdag.yml` file. Every field has a default, so a missing file or a
//! partial file is valid.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::commit::BUILD_VERSION;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DbConfig {
    pub log: LogConfig,
    pub repo: RepoConfig,
    pub sync: SyncConfig,
}

/// Append-only log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum number of decoded records returned by one `scan` call.
    pub scan_batch_size: usize,
    /// Size of the cursor read buffer.
    pub read_chunk_bytes: usize,
    /// Drop appended entries whose `id` was already seen in this log.
    pub dedupe: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: 5000,
            read_chunk_bytes: 1024 * 1024,
            dedupe: true,
        }
    }
}

/// How `NewCommit` notifications are delivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmitMode {
    /// Fire on the persisting thread (server-like environments).
    #[default]
    Immediate,
    /// Queue at background priority (client-like environments).
    Deferred,
}

/// Commit-graph settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepoConfig {
    /// One in this many commits is always stored in full. `0` disables sampling.
    pub full_commit_sample_rate: u32,
    /// A delta is stored only if its encoding is at most this fraction of the full encoding.
    pub delta_size_ratio: f64,
    /// Commits younger than this are treated as leaves by the probabilistic leaf test.
    pub leaf_grace_period_ms: u64,
    /// Leaves younger than this take part in merge-leader election.
    pub merge_leader_window_ms: u64,
    /// False-positive rate of the per-commit ancestors filter.
    pub ancestors_fpr: f64,
    /// Maximum number of materialized records kept in memory.
    pub record_cache_size: usize,
    /// Maximum number of decoded wire commits kept in memory.
    pub commit_cache_size: usize,
    /// Build version stamped on locally created commits.
    pub build_version: u32,
    pub emit_mode: EmitMode,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            full_commit_sample_rate: 20,
            delta_size_ratio: 0.85,
            leaf_grace_period_ms: 3_000,
            merge_leader_window_ms: 10_000,
            ancestors_fpr: 0.001,
            record_cache_size: 10_000,
            commit_cache_size: 50_000,
            build_version: BUILD_VERSION,
            emit_mode: EmitMode::Immediate,
        }
    }
}

impl RepoConfig {
    pub fn leaf_grace_period(&self) -> Duration {
        Duration::from_millis(self.leaf_grace_period_ms)
    }

    pub fn merge_leader_window(&self) -> Duration {
        Duration::from_millis(self.merge_leader_window_ms)
    }
}

/// Sync protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Base false-positive rate of a sync filter.
    pub fpr: f64,
    /// Number of independent filters per message in steady state.
    pub cycles: u32,
    /// Number of filters used after new data was persisted.
    pub max_cycles: u32,
    /// Offers of one commit to one peer before it is withheld.
    pub submit_retry: u32,
    /// Maximum commits carried by one sync message.
    pub max_values_per_message: usize,
    /// Maximum repository requests bundled into one network call.
    pub max_requests_per_batch: usize,
    /// Scheduler flush tick.
    pub tick_ms: u64,
    /// Fastest polling interval of a repo client.
    pub poll_min_ms: u64,
    /// Slowest polling interval of a repo client.
    pub poll_max_ms: u64,
    /// Timeout of a client-to-server network call.
    pub client_timeout_ms: u64,
    /// Timeout of a server-to-server network call.
    pub server_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fpr: 0.01,
            cycles: 1,
            max_cycles: 5,
            submit_retry: 10,
            max_values_per_message: 500,
            max_requests_per_batch: 50,
            tick_ms: 200,
            poll_min_ms: 300,
            poll_max_ms: 3_000,
            client_timeout_ms: 5_000,
            server_timeout_ms: 2_000,
        }
    }
}

impl SyncConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn poll_min(&self) -> Duration {
        Duration::from_millis(self.poll_min_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_min_ms))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }
}

/// Determines the format of a config file based on extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

/// Check if a directory has a config file (`docdag.json`, `docdag.yaml`, or `docdag.yml`).
///
/// Does not walk up the directory tree.
pub fn find_config_in(dir: &Path) -> Option<(PathBuf, ConfigFormat)> {
    for (name, format) in &[
        ("docdag.json", ConfigFormat::Json),
        ("docdag.yaml", ConfigFormat::Yaml),
        ("docdag.yml", ConfigFormat::Yaml),
    ] {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some((candidate, format.clone()));
        }
    }
    None
}

/// Parse a config file (JSON or YAML).
pub fn parse_config(path: &Path) -> anyhow::Result<DbConfig> {
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: '{}'", path.display()))?;

    if config_str.trim().is_empty() {
        return Ok(DbConfig::default());
    }

    let path_str = path.to_string_lossy();
    if path_str.ends_with(".yaml") || path_str.ends_with(".yml") {
        serde_yml::from_str(&config_str)
            .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))
    } else {
        serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse JSON config file: {}", path.display()))
    }
}

/// Load the config found in `dir`, or defaults if there is none.
pub fn load_config(dir: &Path) -> anyhow::Result<DbConfig> {
    match find_config_in(dir) {
        Some((path, _format)) => parse_config(&path),
        None => Ok(DbConfig::default()),
    }
}
