//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_bytes: usize,
    /// Seconds between heartbeat pings.
    pub ping_interval_secs: u64,
    /// Seconds without inbound traffic before a connection is dropped.
    pub idle_timeout_secs: u64,
    /// Seconds a single outbound frame may take to write.
    pub write_timeout_secs: u64,
    /// Name advertised in the relay information document.
    pub relay_name: String,
    /// Description advertised in the relay information document.
    pub relay_description: String,
    /// Operator contact, if any.
    pub relay_contact: Option<String>,
    /// Operator pubkey, if any.
    pub relay_pubkey: Option<String>,
    /// Directory for `relay.log`; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Connection limits and timings shared by the relay and its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub outbound_queue: usize,
    pub max_message_bytes: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            max_message_bytes: 512 * 1024,
            ping_interval: Duration::from_secs(54),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let defaults = Limits::default();
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS").context("BIND_WS")?;
        Ok(Self {
            bind_http,
            bind_ws,
            outbound_queue: number("OUTBOUND_QUEUE", defaults.outbound_queue as u64) as usize,
            max_message_bytes: number("MAX_MESSAGE_BYTES", defaults.max_message_bytes as u64)
                as usize,
            ping_interval_secs: number("PING_INTERVAL_SECS", defaults.ping_interval.as_secs()),
            idle_timeout_secs: number("IDLE_TIMEOUT_SECS", defaults.idle_timeout.as_secs()),
            write_timeout_secs: number("WRITE_TIMEOUT_SECS", defaults.write_timeout.as_secs()),
            relay_name: non_empty("RELAY_NAME").unwrap_or_else(|| "tidepool".into()),
            relay_description: non_empty("RELAY_DESCRIPTION")
                .unwrap_or_else(|| "In-memory Nostr relay".into()),
            relay_contact: non_empty("RELAY_CONTACT"),
            relay_pubkey: non_empty("RELAY_PUBKEY"),
            log_dir: non_empty("LOG_DIR").map(PathBuf::from),
        })
    }

    /// Connection limits derived from these settings.
    pub fn limits(&self) -> Limits {
        Limits {
            outbound_queue: self.outbound_queue,
            max_message_bytes: self.max_message_bytes,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

/// Read a variable, treating an empty value as absent.
fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a positive integer variable, falling back to `default` when absent
/// or invalid. Zero is clamped to one.
fn number(key: &str, default: u64) -> u64 {
    non_empty(key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
        .max(1)
}
