//! Host configuration.
//!
//! Loaded from an optional YAML file, then overridden by environment
//! variables. Every field has a default so an empty file (or no file) yields
//! a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

// ---------------------------------------------------------------------------
// Hook overflow policy
// ---------------------------------------------------------------------------

/// What a hook producer does when the OnCommand/OnDisconnect queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOverflow {
    /// Wait for room in the queue, up to `hook_send_timeout_ms`, then drop.
    #[default]
    Block,
    /// Drop the event immediately.
    Drop,
}

// ---------------------------------------------------------------------------
// HubConfig
// ---------------------------------------------------------------------------

/// Configuration for the capability host and its engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Bounded hand-off queue length per relay, in chunks.
    #[serde(default = "default_relay_queue_capacity")]
    pub relay_queue_capacity: usize,
    /// Largest chunk the relay producer enqueues, in bytes.
    #[serde(default = "default_relay_chunk_size")]
    pub relay_chunk_size: usize,
    /// How long either relay side waits on its peer.
    #[serde(default = "default_relay_peer_timeout_ms")]
    pub relay_peer_timeout_ms: u64,

    /// Pending-operation queue length of each room worker.
    #[serde(default = "default_room_mailbox_capacity")]
    pub room_mailbox_capacity: usize,
    /// Outbound envelope buffer per room connection.
    #[serde(default = "default_room_connection_buffer")]
    pub room_connection_buffer: usize,

    #[serde(default = "default_hook_queue_capacity")]
    pub hook_queue_capacity: usize,
    #[serde(default)]
    pub hook_overflow: HookOverflow,
    #[serde(default = "default_hook_send_timeout_ms")]
    pub hook_send_timeout_ms: u64,

    /// Shared secret for capability tokens. Auth is disabled when unset.
    #[serde(default)]
    pub auth_secret: Option<String>,

    /// YAML file of tenant capability models to seed the in-memory store.
    #[serde(default)]
    pub tenants_file: Option<PathBuf>,
}

fn default_bind_addr() -> String { "0.0.0.0:8080".to_string() }
fn default_relay_queue_capacity() -> usize { 4 }
fn default_relay_chunk_size() -> usize { 32 * 1024 }
fn default_relay_peer_timeout_ms() -> u64 { 30_000 }
fn default_room_mailbox_capacity() -> usize { 256 }
fn default_room_connection_buffer() -> usize { 64 }
fn default_hook_queue_capacity() -> usize { 1 }
fn default_hook_send_timeout_ms() -> u64 { 5_000 }

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            relay_queue_capacity: default_relay_queue_capacity(),
            relay_chunk_size: default_relay_chunk_size(),
            relay_peer_timeout_ms: default_relay_peer_timeout_ms(),
            room_mailbox_capacity: default_room_mailbox_capacity(),
            room_connection_buffer: default_room_connection_buffer(),
            hook_queue_capacity: default_hook_queue_capacity(),
            hook_overflow: HookOverflow::default(),
            hook_send_timeout_ms: default_hook_send_timeout_ms(),
            auth_secret: None,
            tenants_file: None,
        }
    }
}

impl HubConfig {
    /// Parse a YAML document. Missing keys take their defaults.
    pub fn from_yaml(content: &str) -> HubResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| HubError::validation(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML config file.
    pub fn from_file(path: &Path) -> HubResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HubError::upstream(&format!("reading {}", path.display()), e))?;
        Self::from_yaml(&content)
    }

    /// Build the effective configuration for the server binary.
    ///
    /// Starts from `CAPHUB_CONFIG` (if set) or defaults, then applies
    /// environment overrides.
    pub fn load() -> HubResult<Self> {
        let base = match std::env::var("CAPHUB_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup (normally `std::env::var`).
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> HubResult<Self> {
        if let Some(bind) = lookup("CAPHUB_BIND") {
            self.bind_addr = bind;
        } else if let Some(port) = lookup("PORT") {
            self.bind_addr = format!("0.0.0.0:{}", port);
        }
        if let Some(v) = lookup("CAPHUB_RELAY_QUEUE") {
            self.relay_queue_capacity = parse_env("CAPHUB_RELAY_QUEUE", &v)?;
        }
        if let Some(v) = lookup("CAPHUB_RELAY_CHUNK") {
            self.relay_chunk_size = parse_env("CAPHUB_RELAY_CHUNK", &v)?;
        }
        if let Some(v) = lookup("CAPHUB_RELAY_TIMEOUT_MS") {
            self.relay_peer_timeout_ms = parse_env("CAPHUB_RELAY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("CAPHUB_HOOK_QUEUE") {
            self.hook_queue_capacity = parse_env("CAPHUB_HOOK_QUEUE", &v)?;
        }
        if let Some(secret) = lookup("CAPHUB_AUTH_SECRET") {
            self.auth_secret = Some(secret);
        }
        if let Some(path) = lookup("CAPHUB_TENANTS") {
            self.tenants_file = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject zero capacities and zero deadlines.
    pub fn validate(&self) -> HubResult<()> {
        let checks = [
            ("relay_queue_capacity", self.relay_queue_capacity as u64),
            ("relay_chunk_size", self.relay_chunk_size as u64),
            ("relay_peer_timeout_ms", self.relay_peer_timeout_ms),
            ("room_mailbox_capacity", self.room_mailbox_capacity as u64),
            ("room_connection_buffer", self.room_connection_buffer as u64),
            ("hook_queue_capacity", self.hook_queue_capacity as u64),
            ("hook_send_timeout_ms", self.hook_send_timeout_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(HubError::validation(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn relay_peer_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_peer_timeout_ms)
    }

    pub fn hook_send_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_send_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> HubResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| HubError::validation(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.relay_queue_capacity, 4);
        assert_eq!(config.relay_chunk_size, 32768);
        assert_eq!(config.hook_overflow, HookOverflow::Block);
        assert!(config.auth_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = HubConfig::from_yaml("relay_queue_capacity: 8\nhook_overflow: drop\n").unwrap();
        assert_eq!(config.relay_queue_capacity, 8);
        assert_eq!(config.hook_overflow, HookOverflow::Drop);
        assert_eq!(config.relay_chunk_size, 32768);
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = HubConfig::from_yaml("relay_queue_capacity: 0").unwrap_err();
        assert!(err.to_string().contains("relay_queue_capacity"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("CAPHUB_RELAY_QUEUE", "2"),
            ("CAPHUB_AUTH_SECRET", "s3cret"),
        ]
        .into_iter()
        .collect();
        let config = HubConfig::default()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.relay_queue_capacity, 2);
        assert_eq!(config.auth_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_env_override_parse_error() {
        let err = HubConfig::default()
            .with_env_overrides(|k| (k == "CAPHUB_RELAY_CHUNK").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_addr: \"127.0.0.1:7000\"").unwrap();
        writeln!(file, "hook_send_timeout_ms: 250").unwrap();
        let config = HubConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.hook_send_timeout(), Duration::from_millis(250));
    }
}
