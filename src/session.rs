//! Session lifecycle shared by the sending and receiving sides.
//!
//! ```text
//! Idle -> Handshaking -> Transferring -> Completed
//!                             |
//!                        Interrupted -> Reconnecting -> Handshaking -> ...
//! ```
//! `Stalled` is terminal: reconnecting itself failed and the operator has
//! to restart by hand.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::error::TransferError;
use crate::progress::ProgressSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Transferring,
    Interrupted,
    Reconnecting,
    Completed,
    Stalled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Stalled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Handshaking => "handshaking",
            SessionState::Transferring => "transferring",
            SessionState::Interrupted => "interrupted",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Completed => "completed",
            SessionState::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// Observable session state. Clones share the same state; callers either
/// `subscribe` for pushes or poll `state`.
#[derive(Clone)]
pub struct SessionMonitor {
    id: Uuid,
    tx: Arc<watch::Sender<SessionState>>,
    history: Arc<Mutex<Vec<SessionState>>>,
}

impl SessionMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self {
            id: Uuid::new_v4(),
            tx: Arc::new(tx),
            history: Arc::new(Mutex::new(vec![SessionState::Idle])),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Every state entered so far, oldest first
    pub fn history(&self) -> Vec<SessionState> {
        self.history.lock().clone()
    }

    pub fn set(&self, next: SessionState) {
        let mut history = self.history.lock();
        let prev = self.tx.send_replace(next);
        history.push(next);
        info!(session = %self.id, from = %prev, to = %next, "session state");
    }

    /// Move `Transferring -> Interrupted`. Only the first caller wins;
    /// later detections of the same outage return false.
    pub fn mark_interrupted(&self) -> bool {
        let mut history = self.history.lock();
        let won = self.tx.send_if_modified(|s| {
            if *s == SessionState::Transferring {
                *s = SessionState::Interrupted;
                true
            } else {
                false
            }
        });
        if won {
            history.push(SessionState::Interrupted);
            info!(session = %self.id, "session interrupted");
        }
        won
    }

    pub fn is_interrupted(&self) -> bool {
        self.state() == SessionState::Interrupted
    }
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// How one data-connection worker ended
#[derive(Debug)]
pub enum WorkerExit {
    /// Queue drained (sender) or end marker read (receiver)
    Clean,
    /// Peer dropped mid-transfer; the session reconnects
    Reset,
    /// Not recoverable by reconnecting
    Failed(TransferError),
}

/// What a finished session hands back to its caller
#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub progress: ProgressSnapshot,
    pub reconnects: u32,
}
