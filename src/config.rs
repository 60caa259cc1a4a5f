//! Transfer configuration: host, port, chunk size, roots and reconnect policy.
//!
//! Loaded from TOML, overridden from the command line, validated once and
//! then passed by value into session construction.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{self, defaults};
use crate::protocol_core::StringEncoding;
use crate::reconcile::RootMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub host: String,
    pub port: u16,
    /// Bytes per data chunk. Both sides must use the same value.
    pub chunk_size: usize,
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    /// Data connections the receiver asks for
    pub connections: usize,
    /// Sender: how long to wait for the receiver after an interruption
    pub reconnect_wait_secs: u64,
    /// Receiver: automatic resume attempts before reporting a stall
    pub max_reconnects: u32,
    pub reconnect_delay_ms: u64,
    pub string_encoding: StringEncoding,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            chunk_size: defaults::CHUNK_SIZE,
            source_root: PathBuf::new(),
            destination_root: PathBuf::new(),
            connections: default_connections(),
            reconnect_wait_secs: defaults::RECONNECT_WAIT_SECS,
            max_reconnects: defaults::MAX_RECONNECTS,
            reconnect_delay_ms: defaults::RECONNECT_DELAY_MS,
            string_encoding: StringEncoding::Plain,
        }
    }
}

/// One connection per CPU, within the receiver's spinner bounds
pub fn default_connections() -> usize {
    num_cpus::get().clamp(defaults::MIN_CONNECTIONS, defaults::MAX_CONNECTIONS)
}

impl TransferConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg: TransferConfig = toml::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Check bounds and make both roots absolute.
    pub fn validate(mut self) -> Result<Self> {
        if self.chunk_size == 0 || self.chunk_size > defaults::MAX_CHUNK_SIZE {
            bail!(
                "chunk_size must be between 1 and {} bytes (got {})",
                defaults::MAX_CHUNK_SIZE,
                self.chunk_size
            );
        }
        if self.connections == 0 || self.connections > protocol::MAX_CONNECTIONS as usize {
            bail!(
                "connections must be between 1 and {} (got {})",
                protocol::MAX_CONNECTIONS,
                self.connections
            );
        }
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.source_root.as_os_str().is_empty() {
            bail!("source_root is required");
        }
        if self.destination_root.as_os_str().is_empty() {
            bail!("destination_root is required");
        }
        self.source_root = std::path::absolute(&self.source_root)
            .with_context(|| format!("Invalid source_root {}", self.source_root.display()))?;
        self.destination_root = std::path::absolute(&self.destination_root).with_context(|| {
            format!("Invalid destination_root {}", self.destination_root.display())
        })?;
        Ok(self)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn roots(&self) -> RootMap {
        RootMap::new(&self.source_root, &self.destination_root)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
