//! Error taxonomy for crawl, handshake and data transfer.
//!
//! Recoverable failures (`TransportReset`, `StreamTruncated`) are the ones a
//! session answers with a reconnect; everything else ends the session start
//! or the connection that raised it.

use std::io;
use std::path::PathBuf;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("directory unreadable: {path}: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connect failed: {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("transport reset: {0}")]
    TransportReset(#[source] io::Error),

    #[error("stream truncated before end marker")]
    StreamTruncated,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("path {path} is not under root {root}")]
    RootMismatch { path: PathBuf, root: PathBuf },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("session stalled: {0}")]
    Stalled(String),
}

impl TransferError {
    /// Classify a socket-level I/O error.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => TransferError::TransportReset(err),
            io::ErrorKind::UnexpectedEof => TransferError::StreamTruncated,
            _ => TransferError::TransportReset(err),
        }
    }

    /// Local disk failure on `path`.
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TransferError::ProtocolViolation(msg.into())
    }

    /// True when the session should reconnect and resume instead of giving up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransferError::TransportReset(_) | TransferError::StreamTruncated
        )
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::from_io(err)
    }
}
