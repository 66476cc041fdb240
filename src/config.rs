//! Runtime tunables shared by servers, clients and transports.

use crate::error::{KvError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Processed messages are released in batches of this size.
pub const GARBAGE_COLLECTION_COUNT: usize = 2000;

/// Largest single frame accepted on the wire (1 GiB).
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of processed messages kept before they are released together.
    pub gc_threshold: usize,
    /// Deadline for `pull` and `barrier` replies. `None` blocks forever.
    pub request_timeout_ms: Option<u64>,
    /// Deadline for the bootstrap handshake. `None` blocks forever.
    pub bootstrap_timeout_ms: Option<u64>,
    /// How many times a transport retries connecting to a peer.
    pub connect_attempts: usize,
    /// Initial delay between connection attempts; doubled on every retry.
    pub connect_backoff_ms: u64,
    /// Frames above this size are rejected on both read and write.
    pub max_message_bytes: usize,
    /// Apply operations on co-located rows directly against shared storage.
    pub local_fast_path: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            gc_threshold: GARBAGE_COLLECTION_COUNT,
            request_timeout_ms: None,
            bootstrap_timeout_ms: None,
            connect_attempts: 40,
            connect_backoff_ms: 50,
            max_message_bytes: MAX_MESSAGE_BYTES,
            local_fast_path: true,
        }
    }
}

impl StoreConfig {
    /// Reads a JSON config; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| KvError::Configuration(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| KvError::Configuration(e.to_string()))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn bootstrap_timeout(&self) -> Option<Duration> {
        self.bootstrap_timeout_ms.map(Duration::from_millis)
    }

    /// Delay before connection attempt `attempt` (0-based), capped at 1.2s.
    pub fn connect_delay(&self, attempt: usize) -> Duration {
        let exp = attempt.min(16) as u32;
        let delay = self.connect_backoff_ms.saturating_mul(1u64 << exp).min(1200);
        let jitter = rand::random::<u64>() % 25;
        Duration::from_millis(delay + jitter)
    }
}
