//! Shared CLI helpers and the option structs of both binaries

use anyhow::Result;
use clap::{ArgAction, Args, Parser};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::TransferConfig;
use crate::logger::{NoopLogger, TextLogger, TransferLogger};
use crate::protocol_core::StringEncoding;

/// Options common to sender and receiver. Anything left unset falls back
/// to the config file, then to built-in defaults.
#[derive(Clone, Debug, Args)]
pub struct TransferOpts {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Sender host (the sender binds it, the receiver connects to it)
    #[arg(long)]
    pub host: Option<String>,

    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Payload chunk size in bytes; must match on both ends
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Directory tree being sent
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Directory the tree lands in on the receiver
    #[arg(long)]
    pub destination: Option<PathBuf>,

    /// Encode wire strings as modified UTF-8 (for old peers)
    #[arg(long)]
    pub modified_utf8: bool,

    /// Append a per-file audit log
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Debug-level diagnostics
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TransferOpts {
    /// Config file (if any) with flags applied on top, not yet validated
    pub fn load(&self) -> Result<TransferConfig> {
        let mut cfg = match &self.config {
            Some(path) => TransferConfig::load(path)?,
            None => TransferConfig::default(),
        };
        if let Some(host) = &self.host {
            cfg.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(chunk) = self.chunk_size {
            cfg.chunk_size = chunk;
        }
        if let Some(src) = &self.source {
            cfg.source_root = src.clone();
        }
        if let Some(dst) = &self.destination {
            cfg.destination_root = dst.clone();
        }
        if self.modified_utf8 {
            cfg.string_encoding = StringEncoding::Modified;
        }
        Ok(cfg)
    }

    /// Audit logger for `--log-file`; `verb` names a finished file
    pub fn logger(&self, verb: &'static str) -> Result<Arc<dyn TransferLogger>> {
        Ok(match &self.log_file {
            Some(path) => Arc::new(TextLogger::new(path, verb)?),
            None => Arc::new(NoopLogger),
        })
    }
}

/// dirsend: serve a directory tree to one receiver
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Send a directory tree over parallel TCP connections")]
pub struct SendArgs {
    #[command(flatten)]
    pub common: TransferOpts,

    /// Seconds to wait for the receiver to come back after a reset
    #[arg(long)]
    pub reconnect_wait_secs: Option<u64>,
}

impl SendArgs {
    pub fn resolve(&self) -> Result<TransferConfig> {
        let mut cfg = self.common.load()?;
        if let Some(secs) = self.reconnect_wait_secs {
            cfg.reconnect_wait_secs = secs;
        }
        cfg.validate()
    }
}

/// dirrecv: pull a directory tree from a running sender
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Receive a directory tree over parallel TCP connections")]
pub struct RecvArgs {
    #[command(flatten)]
    pub common: TransferOpts,

    /// Number of data connections to open
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Resume into existing output without asking
    #[arg(long, conflicts_with = "fresh")]
    pub resume: bool,

    /// Discard existing output without asking
    #[arg(long)]
    pub fresh: bool,

    /// Automatic resume attempts after a reset
    #[arg(long)]
    pub max_reconnects: Option<u32>,

    #[arg(long)]
    pub reconnect_delay_ms: Option<u64>,
}

impl RecvArgs {
    pub fn resolve(&self) -> Result<TransferConfig> {
        let mut cfg = self.common.load()?;
        if let Some(n) = self.connections {
            cfg.connections = n;
        }
        if let Some(n) = self.max_reconnects {
            cfg.max_reconnects = n;
        }
        if let Some(ms) = self.reconnect_delay_ms {
            cfg.reconnect_delay_ms = ms;
        }
        cfg.validate()
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "dirsend=debug,dirrecv=debug"
    } else {
        "dirsend=info,dirrecv=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
