//! dirsend library
//!
//! Bulk directory transfer over raw TCP: one control connection negotiates
//! the work, N data connections stream it in parallel, and an interrupted
//! transfer resumes from the bytes already on the receiver's disk.

pub mod cli;
pub mod config;
pub mod error;
pub mod fs_enum;
pub mod handshake;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod queue;
pub mod receiver;
pub mod reconcile;
pub mod sender;
pub mod session;

pub use config::TransferConfig;
pub use error::{Result, TransferError};
pub use handshake::Mode;
pub use receiver::ReceiverSession;
pub use sender::SenderSession;
pub use session::{SessionMonitor, SessionReport, SessionState};
