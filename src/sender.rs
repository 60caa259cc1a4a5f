//! Sending side: the session that owns the work queue and drives
//! reconnection, and the per-connection worker that streams files.
//!
//! Data channel record, per file:
//! ```text
//! i64 fileLength (full size) | u16 len + path | (fileLength - offset) bytes
//! ```
//! terminated by a lone `i64 -1` per connection. The sender then half-closes
//! and waits for the receiver to close; a reset seen while waiting still
//! interrupts the session.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::fs_enum::{self, FileRecord};
use crate::handshake::{sender_handshake, Mode};
use crate::logger::{NoopLogger, TransferLogger};
use crate::protocol::END_MARKER;
use crate::protocol_core::{path_to_wire, write_string, StringEncoding};
use crate::progress::ProgressCounters;
use crate::queue::WorkQueue;
use crate::reconcile::WorkItem;
use crate::session::{SessionMonitor, SessionReport, SessionState, WorkerExit};

// Socket-side write buffer; payload chunks larger than this bypass it
const WRITE_BUFFER: usize = 64 * 1024;

/// Everything a sending worker shares with its siblings
#[derive(Clone)]
pub struct SendContext {
    pub queue: WorkQueue,
    pub monitor: SessionMonitor,
    pub progress: ProgressCounters,
    pub logger: Arc<dyn TransferLogger>,
    pub chunk_size: usize,
    pub encoding: StringEncoding,
}

/// Drains the shared queue over one data connection.
pub struct TransferWorker<S> {
    id: usize,
    stream: BufWriter<S>,
    ctx: SendContext,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TransferWorker<S> {
    pub fn new(id: usize, stream: S, ctx: SendContext) -> Self {
        let buf = vec![0u8; ctx.chunk_size];
        Self {
            id,
            stream: BufWriter::with_capacity(WRITE_BUFFER, stream),
            ctx,
            buf,
        }
    }

    /// Send files until the queue is empty or the session is interrupted,
    /// then the end marker. The connection is closed on every path out.
    pub async fn run(mut self) -> WorkerExit {
        let drained = self.drain().await;
        let result = match drained {
            Ok(sent) => self.finish().await.map(|_| sent),
            Err(e) => Err(e),
        };
        match result {
            Ok(sent) => {
                debug!(worker = self.id, files = sent, "end marker sent");
                WorkerExit::Clean
            }
            Err(e) if e.is_recoverable() => {
                warn!(worker = self.id, error = %e, "data connection lost");
                self.ctx.logger.reset(self.id, &e.to_string());
                self.ctx.monitor.mark_interrupted();
                WorkerExit::Reset
            }
            Err(e) => {
                error!(worker = self.id, error = %e, "worker failed");
                WorkerExit::Failed(e)
            }
        }
    }

    async fn drain(&mut self) -> Result<u64> {
        let mut sent = 0;
        loop {
            // in-flight items finish; nothing new starts once interrupted
            if self.ctx.monitor.is_interrupted() {
                debug!(worker = self.id, "session interrupted, not taking more work");
                return Ok(sent);
            }
            let Some(item) = self.ctx.queue.take() else {
                return Ok(sent);
            };
            self.send_file(&item).await?;
            sent += 1;
        }
    }

    async fn send_file(&mut self, item: &WorkItem) -> Result<()> {
        let wire_path = path_to_wire(&item.destination)?;
        let mut file = tokio::fs::File::open(&item.source)
            .await
            .map_err(|e| TransferError::io_at(&item.source, e))?;
        if item.resume_offset > 0 {
            file.seek(SeekFrom::Start(item.resume_offset))
                .await
                .map_err(|e| TransferError::io_at(&item.source, e))?;
        }

        self.stream.write_i64(item.size as i64).await?;
        write_string(&mut self.stream, &wire_path, self.ctx.encoding).await?;

        let mut remaining = item.remaining();
        while remaining > 0 {
            let n = remaining.min(self.buf.len() as u64) as usize;
            file.read_exact(&mut self.buf[..n])
                .await
                .map_err(|e| TransferError::io_at(&item.source, e))?;
            self.stream.write_all(&self.buf[..n]).await?;
            remaining -= n as u64;
            self.ctx.progress.add_bytes(n as u64);
            trace!(worker = self.id, path = %item.source.display(), left = remaining, "chunk sent");
        }
        self.stream.flush().await?;

        self.ctx.progress.complete_file();
        self.ctx.logger.file_done(&item.source, item.size);
        info!(
            worker = self.id,
            path = %item.source.display(),
            bytes = item.remaining(),
            offset = item.resume_offset,
            "file sent"
        );
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.stream.write_i64(END_MARKER).await?;
        self.stream.shutdown().await?;
        // the receiver never writes on a data connection; EOF means it read the marker
        let mut probe = [0u8; 64];
        match self.stream.read(&mut probe).await? {
            0 => Ok(()),
            n => Err(TransferError::protocol(format!(
                "{n} unexpected bytes from receiver on data connection"
            ))),
        }
    }
}

/// Sender-side transfer session.
///
/// Owns the inventory and the work queue for its whole life. Each cycle
/// accepts one control connection, runs the handshake, accepts the
/// negotiated number of data connections and runs one worker per
/// connection. A transport reset on any of them, or on the control
/// connection mid-handshake, sends the session back through `Reconnecting`
/// to wait for the receiver's next handshake.
pub struct SenderSession {
    config: TransferConfig,
    inventory: HashMap<PathBuf, u64>,
    queue: WorkQueue,
    progress: ProgressCounters,
    monitor: SessionMonitor,
    logger: Arc<dyn TransferLogger>,
}

impl SenderSession {
    /// Files whose names cannot travel as wire strings are left out, so the
    /// totals reported to the receiver only count what can be sent.
    pub fn new(config: TransferConfig, records: &[FileRecord]) -> Self {
        let sendable: Vec<FileRecord> = records
            .iter()
            .filter(|r| {
                let ok = r.path.to_str().is_some();
                if !ok {
                    warn!(path = %r.path.display(), "skipping file with non utf-8 name");
                }
                ok
            })
            .cloned()
            .collect();
        Self {
            inventory: fs_enum::inventory(&sendable),
            config,
            queue: WorkQueue::new(),
            progress: ProgressCounters::new(),
            monitor: SessionMonitor::new(),
            logger: Arc::new(NoopLogger),
        }
    }

    /// Crawl the configured source root and build a session over it.
    pub async fn crawl(config: TransferConfig) -> Result<Self> {
        let root = config.source_root.clone();
        let records = tokio::task::spawn_blocking(move || fs_enum::crawl(&root))
            .await
            .map_err(|e| TransferError::io_at(&config.source_root, std::io::Error::other(e)))??;
        info!(
            root = %config.source_root.display(),
            files = records.len(),
            bytes = fs_enum::total_bytes(&records),
            "crawl finished"
        );
        Ok(Self::new(config, &records))
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn monitor(&self) -> SessionMonitor {
        self.monitor.clone()
    }

    pub fn progress(&self) -> ProgressCounters {
        self.progress.clone()
    }

    pub fn file_count(&self) -> usize {
        self.inventory.len()
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| TransferError::ConnectFailed { addr, source })
    }

    /// Serve the session on `listener` until it completes or stalls.
    pub async fn run(&self, listener: TcpListener) -> Result<SessionReport> {
        let started = Instant::now();
        let mut reconnects = 0u32;
        self.logger.start(
            self.monitor.id(),
            &self.config.source_root,
            &self.config.destination_root,
            self.config.connections,
        );
        if let Ok(addr) = listener.local_addr() {
            info!(session = %self.monitor.id(), %addr, files = self.inventory.len(), "waiting for receiver");
        }

        loop {
            let first = reconnects == 0;
            let cycle = self.cycle(&listener, first).await;
            match cycle {
                Ok(()) if self.monitor.is_interrupted() => {
                    reconnects += 1;
                    self.monitor.set(SessionState::Reconnecting);
                    info!(attempt = reconnects, "waiting for receiver to resume");
                }
                Ok(()) => {
                    self.monitor.set(SessionState::Completed);
                    let progress = self.progress.snapshot();
                    self.logger.done(
                        progress.files_completed,
                        progress.bytes_transferred,
                        started.elapsed().as_secs_f64(),
                    );
                    return Ok(SessionReport {
                        progress,
                        reconnects,
                    });
                }
                // the receiver dropped mid-handshake; wait for it like any other reset
                Err(e) if e.is_recoverable() => {
                    reconnects += 1;
                    self.monitor.set(SessionState::Reconnecting);
                    warn!(attempt = reconnects, error = %e, "receiver lost before transfer started");
                }
                Err(e) => {
                    self.monitor.set(SessionState::Stalled);
                    self.logger
                        .error("session", &self.config.source_root, &e.to_string());
                    return Err(match e {
                        TransferError::Stalled(_) => e,
                        e if first => e,
                        e => TransferError::Stalled(e.to_string()),
                    });
                }
            }
        }
    }

    /// One handshake plus one round of data connections.
    async fn cycle(&self, listener: &TcpListener, first: bool) -> Result<()> {
        let (mut control, peer) = self.accept(listener, first).await?;
        self.monitor.set(SessionState::Handshaking);
        debug!(%peer, "control connection");

        let negotiated = sender_handshake(
            &mut control,
            &self.inventory,
            &self.config.roots(),
            &self.queue,
            self.config.string_encoding,
        )
        .await?;
        // a start handshake means the receiver discarded its output
        match negotiated.mode {
            Mode::Start => self.progress.reset(&negotiated.summary),
            Mode::Continue => self.progress.resume(&negotiated.summary),
        }

        let mut streams = Vec::with_capacity(negotiated.connections);
        for _ in 0..negotiated.connections {
            let (stream, peer) = self.accept(listener, first).await?;
            let _ = stream.set_nodelay(true);
            debug!(%peer, "data connection");
            streams.push(stream);
        }
        drop(control);

        self.monitor.set(SessionState::Transferring);
        let ctx = SendContext {
            queue: self.queue.clone(),
            monitor: self.monitor.clone(),
            progress: self.progress.clone(),
            logger: Arc::clone(&self.logger),
            chunk_size: self.config.chunk_size,
            encoding: self.config.string_encoding,
        };
        let handles: Vec<_> = streams
            .into_iter()
            .enumerate()
            .map(|(id, stream)| tokio::spawn(TransferWorker::new(id, stream, ctx.clone()).run()))
            .collect();

        // close the pool: every worker has ended before the next handshake
        let mut failure = None;
        for handle in handles {
            match handle.await {
                Ok(WorkerExit::Clean) | Ok(WorkerExit::Reset) => {}
                Ok(WorkerExit::Failed(e)) => {
                    failure.get_or_insert(e);
                }
                Err(join) => {
                    failure.get_or_insert(TransferError::protocol(format!("worker panicked: {join}")));
                }
            }
        }
        match failure {
            Some(e) if !self.monitor.is_interrupted() => Err(e),
            _ => Ok(()),
        }
    }

    async fn accept(
        &self,
        listener: &TcpListener,
        first: bool,
    ) -> Result<(TcpStream, std::net::SocketAddr)> {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.addr());
        if first {
            return listener
                .accept()
                .await
                .map_err(|source| TransferError::ConnectFailed { addr, source });
        }
        match tokio::time::timeout(self.config.reconnect_wait(), listener.accept()).await {
            Ok(res) => res.map_err(|source| TransferError::ConnectFailed { addr, source }),
            Err(_) => Err(TransferError::Stalled(format!(
                "receiver did not return within {}s",
                self.config.reconnect_wait_secs
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Summary;
    use std::path::Path;

    fn ctx(queue: WorkQueue, chunk_size: usize) -> SendContext {
        let monitor = SessionMonitor::new();
        monitor.set(SessionState::Transferring);
        let progress = ProgressCounters::new();
        progress.reset(&Summary {
            total_files: 8,
            total_bytes: 1 << 30,
            ..Summary::default()
        });
        SendContext {
            queue,
            monitor,
            progress,
            logger: Arc::new(NoopLogger),
            chunk_size,
            encoding: StringEncoding::Plain,
        }
    }

    /// Run one worker against an in-memory peer that reads to EOF, then closes
    async fn capture(ctx: SendContext) -> (WorkerExit, Vec<u8>) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let reader = tokio::spawn(async move {
            let mut wire = Vec::new();
            server.read_to_end(&mut wire).await.unwrap();
            wire
        });
        let exit = TransferWorker::new(0, client, ctx).run().await;
        (exit, reader.await.unwrap())
    }

    fn item(src: &Path, dst: &str, size: u64, offset: u64) -> WorkItem {
        WorkItem {
            source: src.to_path_buf(),
            destination: PathBuf::from(dst),
            size,
            resume_offset: offset,
        }
    }

    #[tokio::test]
    async fn worker_writes_records_then_end_marker() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        std::fs::write(&a, b"0123456789").unwrap();

        let queue = WorkQueue::new();
        queue.replace(vec![item(&a, "/dst/a", 10, 4)]);
        let ctx = ctx(queue, 4);
        let progress = ctx.progress.clone();

        let (exit, wire) = capture(ctx).await;
        assert!(matches!(exit, WorkerExit::Clean));

        let mut expected = Vec::new();
        expected.extend_from_slice(&10i64.to_be_bytes());
        expected.extend_from_slice(&6u16.to_be_bytes());
        expected.extend_from_slice(b"/dst/a");
        expected.extend_from_slice(b"456789");
        expected.extend_from_slice(&(-1i64).to_be_bytes());
        assert_eq!(wire, expected);

        let s = progress.snapshot();
        assert_eq!(s.bytes_transferred, 6);
        assert_eq!(s.files_completed, 1);
    }

    #[tokio::test]
    async fn empty_queue_sends_only_the_marker() {
        let (exit, wire) = capture(ctx(WorkQueue::new(), 16)).await;
        assert!(matches!(exit, WorkerExit::Clean));
        assert_eq!(wire, (-1i64).to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn interrupted_session_stops_dequeuing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        std::fs::write(&a, b"x").unwrap();
        let queue = WorkQueue::new();
        queue.replace(vec![item(&a, "/dst/a", 1, 0)]);
        let ctx = ctx(queue.clone(), 16);
        assert!(ctx.monitor.mark_interrupted());

        let (exit, wire) = capture(ctx).await;
        assert!(matches!(exit, WorkerExit::Clean));
        assert_eq!(queue.len(), 1);
        assert_eq!(wire, (-1i64).to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn peer_reset_marks_session_interrupted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        std::fs::write(&a, vec![1u8; 256 * 1024]).unwrap();
        let queue = WorkQueue::new();
        queue.replace(vec![item(&a, "/dst/a", 256 * 1024, 0)]);
        let ctx = ctx(queue, 8 * 1024);
        let monitor = ctx.monitor.clone();

        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let exit = TransferWorker::new(3, client, ctx).run().await;
        assert!(matches!(exit, WorkerExit::Reset));
        assert!(monitor.is_interrupted());
    }

    #[tokio::test]
    async fn missing_source_file_fails_without_reconnect() {
        let tmp = tempfile::TempDir::new().unwrap();
        let queue = WorkQueue::new();
        queue.replace(vec![item(&tmp.path().join("gone"), "/dst/gone", 5, 0)]);
        let ctx = ctx(queue, 16);
        let monitor = ctx.monitor.clone();

        let (exit, wire) = capture(ctx).await;
        assert!(matches!(exit, WorkerExit::Failed(TransferError::Io { .. })));
        assert!(!monitor.is_interrupted());
        assert!(wire.is_empty());
    }

    #[test]
    fn session_counts_inventory() {
        let records = vec![
            FileRecord { path: PathBuf::from("/src/a"), size: 1 },
            FileRecord { path: PathBuf::from("/src/b"), size: 2 },
        ];
        let cfg = TransferConfig {
            source_root: PathBuf::from("/src"),
            destination_root: PathBuf::from("/dst"),
            ..TransferConfig::default()
        };
        let s = SenderSession::new(cfg, &records);
        assert_eq!(s.file_count(), 2);
        assert_eq!(s.monitor().state(), SessionState::Idle);
        assert_eq!(s.progress().snapshot(), Default::default());
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_names_are_left_out_of_the_inventory() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let records = vec![
            FileRecord { path: PathBuf::from("/src/ok"), size: 3 },
            FileRecord {
                path: Path::new("/src").join(OsStr::from_bytes(b"bad\xff")),
                size: 5,
            },
        ];
        let cfg = TransferConfig {
            source_root: PathBuf::from("/src"),
            destination_root: PathBuf::from("/dst"),
            ..TransferConfig::default()
        };
        let s = SenderSession::new(cfg, &records);
        assert_eq!(s.file_count(), 1);
        assert_eq!(s.inventory.get(Path::new("/src/ok")), Some(&3));
    }
}
