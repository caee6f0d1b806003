//! Process configuration.
//!
//! Loaded from a TOML file. Every field has a default, and a missing file
//! yields the full default configuration. Secrets can come from the
//! environment instead of the file:
//!
//! - `FOLIO_RELAY_KEY`: shared HMAC key for relay envelopes
//! - `FOLIO_ADMIN_TOKEN`: bearer token for admin and ingest routes

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use folio_store::StoreConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::broker::Backoff;

pub const RELAY_KEY_ENV: &str = "FOLIO_RELAY_KEY";
pub const ADMIN_TOKEN_ENV: &str = "FOLIO_ADMIN_TOKEN";

// ─── Config (root) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub fanout: FanoutSection,
    #[serde(default)]
    pub janitor: JanitorSection,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default().with_env_overrides());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(Self::parse(&contents)?.with_env_overrides())
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Environment secrets replace file values when set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(key) = non_empty_env(RELAY_KEY_ENV) {
            self.relay.key = key;
        }
        if let Some(token) = non_empty_env(ADMIN_TOKEN_ENV) {
            self.server.admin_token = Some(token);
        }
        self
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.store.path.clone(),
            sync_writes: self.store.sync_writes,
            ..StoreConfig::default()
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ─── Sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub sync_writes: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            sync_writes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveSection {
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Edit / admin / ingest HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Live-update WebSocket endpoint
    #[serde(default = "default_live_addr")]
    pub live_addr: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Upper bound on synchronous archival inside end-session
    #[serde(default = "default_end_session_budget")]
    pub end_session_budget_ms: u64,
    /// `None` restricts admin routes to loopback callers
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            live_addr: default_live_addr(),
            request_timeout_secs: default_request_timeout(),
            end_session_budget_ms: default_end_session_budget(),
            admin_token: None,
        }
    }
}

impl ServerSection {
    pub fn end_session_budget(&self) -> Duration {
        Duration::from_millis(self.end_session_budget_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Elapsed time after which an edit opens a new revision
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// HMAC key shared by relay and fan-out
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Scratch directory for the relay's secondary store instance
    #[serde(default = "default_secondary_path")]
    pub secondary_path: PathBuf,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            key: String::new(),
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            secondary_path: default_secondary_path(),
        }
    }
}

impl RelaySection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Where `folio-broker` listens
    #[serde(default = "default_broker_addr")]
    pub bind_addr: String,
    /// Where clients connect
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_backoff_initial")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub reconnect_max_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_broker_addr(),
            url: default_broker_url(),
            topic: default_topic(),
            channel_capacity: default_channel_capacity(),
            reconnect_initial_ms: default_backoff_initial(),
            reconnect_max_ms: default_backoff_max(),
        }
    }
}

impl BrokerSection {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutSection {
    /// Bounded outbound queue per live connection
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorSection {
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,
    /// Superseded revisions older than this are archived
    #[serde(default = "default_archive_after")]
    pub archive_after_secs: u64,
    /// Archived revisions older than this lose their inline content
    #[serde(default = "default_evict_after")]
    pub evict_after_secs: u64,
    /// Change rows kept behind the head
    #[serde(default = "default_change_retention")]
    pub change_retention: u64,
}

impl Default for JanitorSection {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval(),
            archive_after_secs: default_archive_after(),
            evict_after_secs: default_evict_after(),
            change_retention: default_change_retention(),
        }
    }
}

// ─── Serde defaults ───────────────────────────────────────────────────

fn default_store_path() -> PathBuf {
    PathBuf::from("folio_data")
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("folio_archive")
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_live_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_end_session_budget() -> u64 {
    2_000
}

fn default_snapshot_interval() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_poll_interval() -> u64 {
    250
}

fn default_batch_size() -> usize {
    256
}

fn default_secondary_path() -> PathBuf {
    PathBuf::from("folio_data.relay")
}

fn default_broker_addr() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_broker_url() -> String {
    "ws://127.0.0.1:7070".to_string()
}

fn default_topic() -> String {
    "folio.changes".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_janitor_interval() -> u64 {
    60
}

fn default_archive_after() -> u64 {
    24 * 60 * 60
}

fn default_evict_after() -> u64 {
    7 * 24 * 60 * 60
}

fn default_change_retention() -> u64 {
    100_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.policy.snapshot_interval_secs, 300);
        assert_eq!(config.broker.topic, "folio.changes");
        assert_eq!(config.server.end_session_budget(), Duration::from_secs(2));
        assert!(config.server.admin_token.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [policy]
            snapshot_interval_secs = 60

            [server]
            live_addr = "0.0.0.0:9999"
            "#,
        )
        .unwrap();
        assert_eq!(config.policy.snapshot_interval_secs, 60);
        assert_eq!(config.server.live_addr, "0.0.0.0:9999");
        assert_eq!(config.server.http_addr, "127.0.0.1:8080");
        assert_eq!(config.session.idle_timeout_secs, 1800);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Config::parse("[policy]\nsnapshot_interval_secs = \"soon\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.fanout.queue_capacity, 64);
    }

    #[test]
    fn test_store_config_path() {
        let mut config = Config::default();
        config.store.path = PathBuf::from("/tmp/folio-x");
        assert_eq!(config.store_config().path, PathBuf::from("/tmp/folio-x"));
    }
}
