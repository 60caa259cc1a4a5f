//! Control channel exchange, run once per session attempt before any data
//! connection opens.
//!
//! ```text
//! receiver -> sender   i32 connections | string mode ["start"|"continue"]
//!                      [continue only] i32 n | n x (string path, i64 bytes)
//! sender -> receiver   i32 total_files | i64 bytes_delivered
//!                      i32 files_delivered | i64 total_bytes
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::protocol::{MAX_CONNECTIONS, MODE_CONTINUE, MODE_START};
use crate::protocol_core::{read_state_map, read_string, write_state_map, write_string, StringEncoding};
use crate::queue::WorkQueue;
use crate::reconcile::{summarize, unsent_intersection, work_items, RootMap, Summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Start,
    Continue,
}

impl Mode {
    pub fn token(self) -> &'static str {
        match self {
            Mode::Start => MODE_START,
            Mode::Continue => MODE_CONTINUE,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case(MODE_START) {
            Ok(Mode::Start)
        } else if s.eq_ignore_ascii_case(MODE_CONTINUE) {
            Ok(Mode::Continue)
        } else {
            Err(TransferError::protocol(format!("unknown mode token {s:?}")))
        }
    }
}

/// What the sender learned from one handshake
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub connections: usize,
    pub mode: Mode,
    pub summary: Summary,
    pub queued: usize,
}

/// Sender role: read the request, reconcile, fill `queue`, reply with totals.
///
/// `queue` is replaced, not appended to, so a re-run after an interruption
/// holds only what is still missing.
pub async fn sender_handshake<S>(
    stream: &mut S,
    inventory: &HashMap<PathBuf, u64>,
    roots: &RootMap,
    queue: &WorkQueue,
    enc: StringEncoding,
) -> Result<Negotiated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (connections, mode, state) = {
        let mut r = BufReader::new(&mut *stream);
        let count = r.read_i32().await?;
        if count < 1 || count > MAX_CONNECTIONS {
            return Err(TransferError::protocol(format!(
                "connection count {count} outside 1..={MAX_CONNECTIONS}"
            )));
        }
        let mode = Mode::parse(&read_string(&mut r, enc).await?)?;
        let state = match mode {
            Mode::Continue => Some(read_state_map(&mut r, enc).await?),
            Mode::Start => None,
        };
        (count as usize, mode, state)
    };
    debug!(
        connections,
        mode = mode.token(),
        reported = state.as_ref().map_or(0, HashMap::len),
        "handshake request"
    );

    let unsent = unsent_intersection(inventory, state.as_ref(), roots)?;
    let items = work_items(inventory, &unsent, roots)?;
    let summary = summarize(inventory, &unsent);
    let queued = items.len();
    queue.replace(items);

    let mut reply = Vec::with_capacity(24);
    reply.extend_from_slice(&summary.total_files.to_be_bytes());
    reply.extend_from_slice(&summary.bytes_delivered.to_be_bytes());
    reply.extend_from_slice(&summary.files_delivered.to_be_bytes());
    reply.extend_from_slice(&summary.total_bytes.to_be_bytes());
    stream.write_all(&reply).await?;
    stream.flush().await?;

    info!(
        connections,
        mode = mode.token(),
        queued,
        files_delivered = summary.files_delivered,
        bytes_delivered = summary.bytes_delivered,
        "handshake complete"
    );
    Ok(Negotiated {
        connections,
        mode,
        summary,
        queued,
    })
}

/// Receiver role: ask for `connections` data connections, resuming from
/// `state` when given, and return the sender's totals.
pub async fn receiver_handshake<S>(
    stream: &mut S,
    connections: usize,
    state: Option<&HashMap<String, i64>>,
    enc: StringEncoding,
) -> Result<Summary>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mode = if state.is_some() { Mode::Continue } else { Mode::Start };
    let mut req = Vec::new();
    req.write_i32(connections as i32).await?;
    write_string(&mut req, mode.token(), enc).await?;
    if let Some(map) = state {
        write_state_map(&mut req, map, enc).await?;
    }
    stream.write_all(&req).await?;
    stream.flush().await?;

    let summary = Summary {
        total_files: stream.read_i32().await?,
        bytes_delivered: stream.read_i64().await?,
        files_delivered: stream.read_i32().await?,
        total_bytes: stream.read_i64().await?,
    };
    if summary.total_files < 0
        || summary.files_delivered < 0
        || summary.files_delivered > summary.total_files
        || summary.bytes_delivered < 0
        || summary.bytes_delivered > summary.total_bytes
    {
        return Err(TransferError::protocol(format!("inconsistent handshake totals {summary:?}")));
    }
    debug!(mode = mode.token(), ?summary, "handshake reply");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn inventory() -> HashMap<PathBuf, u64> {
        [
            (PathBuf::from("/src/a.txt"), 10),
            (PathBuf::from("/src/empty"), 0),
            (PathBuf::from("/src/d/big.bin"), 4096),
        ]
        .into()
    }

    async fn run(state: Option<HashMap<String, i64>>) -> (Negotiated, Summary, WorkQueue) {
        let (mut rx_side, mut tx_side) = tokio::io::duplex(64 * 1024);
        let queue = WorkQueue::new();
        let q = queue.clone();
        let sender = tokio::spawn(async move {
            let inv = inventory();
            let roots = RootMap::new("/src", "/dst");
            sender_handshake(&mut tx_side, &inv, &roots, &q, StringEncoding::Plain).await
        });
        let summary = receiver_handshake(&mut rx_side, 2, state.as_ref(), StringEncoding::Plain)
            .await
            .unwrap();
        let negotiated = sender.await.unwrap().unwrap();
        (negotiated, summary, queue)
    }

    #[tokio::test]
    async fn fresh_start_queues_everything() {
        let (n, s, q) = run(None).await;
        assert_eq!(n.connections, 2);
        assert_eq!(n.mode, Mode::Start);
        assert_eq!(q.len(), 3);
        assert_eq!(s.total_files, 3);
        assert_eq!(s.files_delivered, 0);
        assert_eq!(s.bytes_delivered, 0);
        assert_eq!(s.total_bytes, 4106);
        assert_eq!(s, n.summary);
    }

    #[tokio::test]
    async fn resume_queues_only_partial_work() {
        let state: HashMap<String, i64> = [
            ("/dst/a.txt".to_string(), 10),
            ("/dst/empty".to_string(), 0),
            ("/dst/d/big.bin".to_string(), 2048),
        ]
        .into();
        let (n, s, q) = run(Some(state)).await;
        assert_eq!(n.mode, Mode::Continue);
        assert_eq!(s.files_delivered, 2);
        assert_eq!(s.bytes_delivered, 10 + 2048);
        assert_eq!(q.len(), 1);
        let item = q.take().unwrap();
        assert_eq!(item.source, Path::new("/src/d/big.bin"));
        assert_eq!(item.destination, Path::new("/dst/d/big.bin"));
        assert_eq!(item.resume_offset, 2048);
    }

    #[tokio::test]
    async fn resume_with_missing_file_queues_it_from_zero() {
        let state: HashMap<String, i64> =
            [("/dst/a.txt".to_string(), 10), ("/dst/d/big.bin".to_string(), 2048)].into();
        let (_, s, q) = run(Some(state)).await;
        assert_eq!(s.files_delivered, 1);
        assert_eq!(q.len(), 2);
        let partial = q.take().unwrap();
        assert_eq!(partial.source, Path::new("/src/d/big.bin"));
        let missing = q.take().unwrap();
        assert_eq!(missing.source, Path::new("/src/empty"));
        assert_eq!(missing.resume_offset, 0);
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut req = Vec::new();
        req.write_i32(1).await.unwrap();
        write_string(&mut req, "rewind", StringEncoding::Plain).await.unwrap();
        a.write_all(&req).await.unwrap();

        let inv = inventory();
        let err = sender_handshake(&mut b, &inv, &RootMap::new("/src", "/dst"), &WorkQueue::new(), StringEncoding::Plain)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn zero_connections_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&0i32.to_be_bytes()).await.unwrap();
        let inv = inventory();
        let err = sender_handshake(&mut b, &inv, &RootMap::new("/src", "/dst"), &WorkQueue::new(), StringEncoding::Plain)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
    }

    #[test]
    fn mode_tokens_are_case_insensitive() {
        assert_eq!(Mode::parse("START").unwrap(), Mode::Start);
        assert_eq!(Mode::parse("Continue").unwrap(), Mode::Continue);
        assert_eq!(Mode::Continue.token(), "continue");
    }
}
