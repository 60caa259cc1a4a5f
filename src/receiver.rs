//! Receiving side: destination inspection, the session that connects to the
//! sender and resumes on its own after a reset, and the per-connection
//! worker that writes incoming files to disk.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::fs_enum;
use crate::handshake::{receiver_handshake, Mode};
use crate::logger::{NoopLogger, TransferLogger};
use crate::progress::ProgressCounters;
use crate::protocol::END_MARKER;
use crate::protocol_core::{ensure_parent_exists, normalize_under_root, path_to_wire, read_string, StringEncoding};
use crate::session::{SessionMonitor, SessionReport, SessionState, WorkerExit};

const READ_BUFFER: usize = 64 * 1024;

/// Asked once, before the first handshake, when the destination already
/// holds files: resume on top of them, or discard them and start over.
pub trait ResumePrompt {
    fn confirm_resume(&self, existing_files: usize) -> bool;
}

pub struct AlwaysResume;

impl ResumePrompt for AlwaysResume {
    fn confirm_resume(&self, _existing_files: usize) -> bool {
        true
    }
}

pub struct AlwaysRestart;

impl ResumePrompt for AlwaysRestart {
    fn confirm_resume(&self, _existing_files: usize) -> bool {
        false
    }
}

/// On-disk size of every regular file under `root`, keyed by wire path.
/// A missing root has no state.
pub fn local_state(root: &Path) -> Result<HashMap<String, i64>> {
    if !root.exists() {
        return Ok(HashMap::new());
    }
    let mut state = HashMap::new();
    for record in fs_enum::crawl(root)? {
        match path_to_wire(&record.path) {
            Ok(key) => {
                state.insert(key, record.size as i64);
            }
            Err(e) => debug!(error = %e, "not reporting file"),
        }
    }
    Ok(state)
}

/// Any regular file under `root`.
pub fn has_partial_output(root: &Path) -> Result<bool> {
    if !root.exists() {
        return Ok(false);
    }
    Ok(!fs_enum::crawl(root)?.is_empty())
}

/// Remove everything under `root`, keeping `root` itself.
pub fn discard_output(root: &Path) -> Result<()> {
    if !root.exists() {
        return std::fs::create_dir_all(root).map_err(|e| TransferError::io_at(root, e));
    }
    let entries = std::fs::read_dir(root).map_err(|e| TransferError::io_at(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| TransferError::io_at(root, e))?;
        let path = entry.path();
        let ft = entry.file_type().map_err(|e| TransferError::io_at(&path, e))?;
        let removed = if ft.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|e| TransferError::io_at(&path, e))?;
    }
    info!(root = %root.display(), "previous output discarded");
    Ok(())
}

/// Pick the first handshake's mode for `root`, discarding old output when
/// the operator declines to resume.
pub fn prepare_destination(root: &Path, prompt: &dyn ResumePrompt) -> Result<Mode> {
    let existing = if root.exists() {
        fs_enum::crawl(root)?.len()
    } else {
        0
    };
    if existing == 0 {
        std::fs::create_dir_all(root).map_err(|e| TransferError::io_at(root, e))?;
        return Ok(Mode::Start);
    }
    if prompt.confirm_resume(existing) {
        info!(root = %root.display(), files = existing, "resuming into existing output");
        Ok(Mode::Continue)
    } else {
        discard_output(root)?;
        Ok(Mode::Start)
    }
}

/// Everything a receiving worker shares with its siblings
#[derive(Clone)]
pub struct ReceiveContext {
    pub root: PathBuf,
    pub monitor: SessionMonitor,
    pub progress: ProgressCounters,
    pub logger: Arc<dyn TransferLogger>,
    pub chunk_size: usize,
    pub encoding: StringEncoding,
}

/// Reads file records from one data connection until the end marker.
pub struct ReceiveWorker<R> {
    id: usize,
    stream: BufReader<R>,
    ctx: ReceiveContext,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ReceiveWorker<R> {
    pub fn new(id: usize, stream: R, ctx: ReceiveContext) -> Self {
        let buf = vec![0u8; ctx.chunk_size];
        Self {
            id,
            stream: BufReader::with_capacity(READ_BUFFER, stream),
            ctx,
            buf,
        }
    }

    pub async fn run(mut self) -> WorkerExit {
        match self.receive_all().await {
            Ok(saved) => {
                debug!(worker = self.id, files = saved, "end marker received");
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
                self.ctx.logger.error("receive", &self.ctx.root, &e.to_string());
                WorkerExit::Failed(e)
            }
        }
    }

    async fn receive_all(&mut self) -> Result<u64> {
        let mut saved = 0;
        loop {
            let len = self.stream.read_i64().await?;
            if len == END_MARKER {
                return Ok(saved);
            }
            if len < 0 {
                return Err(TransferError::protocol(format!("negative file length {len}")));
            }
            let wire = read_string(&mut self.stream, self.ctx.encoding).await?;
            let dest = normalize_under_root(&self.ctx.root, Path::new(&wire)).map_err(|e| match e {
                TransferError::RootMismatch { .. } => TransferError::protocol(e.to_string()),
                e => e,
            })?;
            self.save_file(&dest, len as u64).await?;
            saved += 1;
        }
    }

    async fn save_file(&mut self, dest: &Path, len: u64) -> Result<()> {
        ensure_parent_exists(dest).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dest)
            .await
            .map_err(|e| TransferError::io_at(dest, e))?;
        let mut have = file
            .metadata()
            .await
            .map_err(|e| TransferError::io_at(dest, e))?
            .len();
        if have > len {
            debug!(path = %dest.display(), have, len, "local copy larger than source, truncating");
            file.set_len(0).await.map_err(|e| TransferError::io_at(dest, e))?;
            have = 0;
        }
        if have > 0 {
            file.seek(SeekFrom::Start(have))
                .await
                .map_err(|e| TransferError::io_at(dest, e))?;
        }

        let copied = self.copy_payload(&mut file, dest, len - have).await;
        // keep whatever arrived, even when the connection dropped mid-file
        let flushed = file.flush().await.map_err(|e| TransferError::io_at(dest, e));
        copied?;
        flushed?;

        self.ctx.progress.complete_file();
        self.ctx.logger.file_done(dest, len);
        info!(worker = self.id, path = %dest.display(), bytes = len - have, offset = have, "file saved");
        Ok(())
    }

    async fn copy_payload(&mut self, file: &mut tokio::fs::File, dest: &Path, mut remaining: u64) -> Result<()> {
        while remaining > 0 {
            let want = remaining.min(self.buf.len() as u64) as usize;
            let got = self.stream.read(&mut self.buf[..want]).await?;
            if got == 0 {
                return Err(TransferError::StreamTruncated);
            }
            file.write_all(&self.buf[..got])
                .await
                .map_err(|e| TransferError::io_at(dest, e))?;
            remaining -= got as u64;
            self.ctx.progress.add_bytes(got as u64);
            trace!(worker = self.id, path = %dest.display(), left = remaining, "chunk written");
        }
        Ok(())
    }
}

/// Receiver-side transfer session.
///
/// Connects to the sender, runs the handshake, opens the data connections
/// and runs one `ReceiveWorker` per connection. After a reset it waits
/// `reconnect_delay`, re-reads its destination and resumes with a
/// `continue` handshake, up to `max_reconnects` times.
pub struct ReceiverSession {
    config: TransferConfig,
    progress: ProgressCounters,
    monitor: SessionMonitor,
    logger: Arc<dyn TransferLogger>,
}

impl ReceiverSession {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            progress: ProgressCounters::new(),
            monitor: SessionMonitor::new(),
            logger: Arc::new(NoopLogger),
        }
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

    /// Run the session to completion, starting with `mode`.
    ///
    /// A failed first connection is returned as is so the caller can retry
    /// by hand. Later failures are retried; when attempts run out the
    /// session ends `Stalled`.
    pub async fn run(&self, mode: Mode) -> Result<SessionReport> {
        let started = Instant::now();
        self.logger.start(
            self.monitor.id(),
            &self.config.source_root,
            &self.config.destination_root,
            self.config.connections,
        );
        let mut mode = mode;
        let mut attempt = 0u32;

        loop {
            let first = attempt == 0;
            let reason = match self.cycle(mode, first).await {
                Ok(()) if !self.monitor.is_interrupted() => {
                    self.monitor.set(SessionState::Completed);
                    let progress = self.progress.snapshot();
                    self.logger.done(
                        progress.files_completed,
                        progress.bytes_transferred,
                        started.elapsed().as_secs_f64(),
                    );
                    return Ok(SessionReport {
                        progress,
                        reconnects: attempt,
                    });
                }
                Ok(()) => "data connection reset".to_string(),
                Err(e) if e.is_recoverable() => e.to_string(),
                Err(e @ TransferError::ConnectFailed { .. }) if !first => e.to_string(),
                Err(e) => {
                    self.monitor.set(SessionState::Stalled);
                    self.logger
                        .error("session", &self.config.destination_root, &e.to_string());
                    return Err(e);
                }
            };

            if attempt >= self.config.max_reconnects {
                self.monitor.set(SessionState::Stalled);
                let msg = format!("gave up after {attempt} reconnect attempts: {reason}");
                self.logger
                    .error("session", &self.config.destination_root, &msg);
                return Err(TransferError::Stalled(msg));
            }
            attempt += 1;
            self.monitor.set(SessionState::Reconnecting);
            info!(attempt, reason = %reason, "resuming transfer");
            tokio::time::sleep(self.config.reconnect_delay()).await;
            mode = Mode::Continue;
        }
    }

    async fn cycle(&self, mode: Mode, first: bool) -> Result<()> {
        self.monitor.set(SessionState::Handshaking);
        let mut control = self.connect().await?;

        let state = match mode {
            Mode::Start => None,
            Mode::Continue => {
                let root = self.config.destination_root.clone();
                let state = tokio::task::spawn_blocking(move || local_state(&root))
                    .await
                    .map_err(|e| {
                        TransferError::io_at(&self.config.destination_root, std::io::Error::other(e))
                    })??;
                Some(state)
            }
        };
        let summary = receiver_handshake(
            &mut control,
            self.config.connections,
            state.as_ref(),
            self.config.string_encoding,
        )
        .await?;
        if first {
            self.progress.reset(&summary);
        } else {
            self.progress.resume(&summary);
        }
        info!(
            session = %self.monitor.id(),
            total_files = summary.total_files,
            files_delivered = summary.files_delivered,
            total_bytes = summary.total_bytes,
            "handshake complete"
        );

        let mut streams = Vec::with_capacity(self.config.connections);
        for _ in 0..self.config.connections {
            streams.push(self.connect().await?);
        }
        drop(control);

        self.monitor.set(SessionState::Transferring);
        let ctx = ReceiveContext {
            root: self.config.destination_root.clone(),
            monitor: self.monitor.clone(),
            progress: self.progress.clone(),
            logger: Arc::clone(&self.logger),
            chunk_size: self.config.chunk_size,
            encoding: self.config.string_encoding,
        };
        let handles: Vec<_> = streams
            .into_iter()
            .enumerate()
            .map(|(id, stream)| tokio::spawn(ReceiveWorker::new(id, stream, ctx.clone()).run()))
            .collect();

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
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.config.addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TransferError::ConnectFailed { addr, source })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Summary;
    use tempfile::TempDir;

    fn ctx(root: &Path) -> ReceiveContext {
        let monitor = SessionMonitor::new();
        monitor.set(SessionState::Transferring);
        let progress = ProgressCounters::new();
        progress.reset(&Summary {
            total_files: 8,
            total_bytes: 1 << 20,
            ..Summary::default()
        });
        ReceiveContext {
            root: root.to_path_buf(),
            monitor,
            progress,
            logger: Arc::new(NoopLogger),
            chunk_size: 4,
            encoding: StringEncoding::Plain,
        }
    }

    fn record(wire: &mut Vec<u8>, path: &Path, len: i64, payload: &[u8]) {
        let p = path.to_str().unwrap();
        wire.extend_from_slice(&len.to_be_bytes());
        wire.extend_from_slice(&(p.len() as u16).to_be_bytes());
        wire.extend_from_slice(p.as_bytes());
        wire.extend_from_slice(payload);
    }

    fn marker(wire: &mut Vec<u8>) {
        wire.extend_from_slice(&END_MARKER.to_be_bytes());
    }

    #[tokio::test]
    async fn end_marker_alone_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx(tmp.path());
        let progress = ctx.progress.clone();
        let mut wire = Vec::new();
        marker(&mut wire);

        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx).run().await;
        assert!(matches!(exit, WorkerExit::Clean));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        let s = progress.snapshot();
        assert_eq!(s.files_completed, 0);
        assert_eq!(s.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn saves_files_and_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let ctx = ctx(tmp.path());
        let progress = ctx.progress.clone();
        let mut wire = Vec::new();
        record(&mut wire, &tmp.path().join("a.txt"), 10, b"0123456789");
        record(&mut wire, &tmp.path().join("d/e/empty"), 0, b"");
        marker(&mut wire);

        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx).run().await;
        assert!(matches!(exit, WorkerExit::Clean));
        assert_eq!(std::fs::read(tmp.path().join("a.txt")).unwrap(), b"0123456789");
        assert_eq!(std::fs::metadata(tmp.path().join("d/e/empty")).unwrap().len(), 0);
        let s = progress.snapshot();
        assert_eq!(s.files_completed, 2);
        assert_eq!(s.bytes_transferred, 10);
    }

    #[tokio::test]
    async fn appends_after_local_length() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("part.bin");
        std::fs::write(&dest, b"abc").unwrap();
        let mut wire = Vec::new();
        record(&mut wire, &dest, 6, b"def");
        marker(&mut wire);

        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx(tmp.path())).run().await;
        assert!(matches!(exit, WorkerExit::Clean));
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn stale_larger_copy_is_rewritten() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("stale");
        std::fs::write(&dest, b"much longer old content").unwrap();
        let mut wire = Vec::new();
        record(&mut wire, &dest, 3, b"new");
        marker(&mut wire);

        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx(tmp.path())).run().await;
        assert!(matches!(exit, WorkerExit::Clean));
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn truncated_stream_keeps_partial_bytes_and_interrupts() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("big");
        let ctx = ctx(tmp.path());
        let monitor = ctx.monitor.clone();
        let progress = ctx.progress.clone();
        let mut wire = Vec::new();
        record(&mut wire, &dest, 100, b"0123456789");

        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx).run().await;
        assert!(matches!(exit, WorkerExit::Reset));
        assert!(monitor.is_interrupted());
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
        assert_eq!(progress.snapshot().files_completed, 0);
        assert_eq!(progress.snapshot().bytes_transferred, 10);
    }

    #[tokio::test]
    async fn path_outside_root_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut wire = Vec::new();
        record(&mut wire, Path::new("/etc/passwd"), 1, b"x");
        marker(&mut wire);

        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx(tmp.path())).run().await;
        assert!(matches!(exit, WorkerExit::Failed(TransferError::ProtocolViolation(_))));

        let mut wire = Vec::new();
        record(&mut wire, &tmp.path().join("../escape"), 1, b"x");
        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx(tmp.path())).run().await;
        assert!(matches!(exit, WorkerExit::Failed(TransferError::ProtocolViolation(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_under_root_does_not_redirect_writes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("dst");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let mut wire = Vec::new();
        record(&mut wire, &root.join("link/planted"), 4, b"evil");
        marker(&mut wire);

        let exit = ReceiveWorker::new(0, wire.as_slice(), ctx(&root)).run().await;
        assert!(matches!(exit, WorkerExit::Failed(TransferError::ProtocolViolation(_))));
        assert!(!outside.join("planted").exists());
    }

    #[tokio::test]
    async fn bogus_negative_length_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let wire = (-7i64).to_be_bytes();
        let exit = ReceiveWorker::new(0, &wire[..], ctx(tmp.path())).run().await;
        assert!(matches!(exit, WorkerExit::Failed(TransferError::ProtocolViolation(_))));
    }

    #[test]
    fn local_state_reports_sizes_by_absolute_path() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/x"), b"12345").unwrap();
        std::fs::write(tmp.path().join("y"), b"").unwrap();

        let state = local_state(tmp.path()).unwrap();
        assert_eq!(state.len(), 2);
        let x = tmp.path().join("d/x");
        assert_eq!(state[x.to_str().unwrap()], 5);

        assert!(local_state(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn prepare_destination_follows_the_prompt() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("out");
        assert_eq!(prepare_destination(&root, &AlwaysResume).unwrap(), Mode::Start);
        assert!(root.is_dir());
        assert!(!has_partial_output(&root).unwrap());

        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/f"), b"partial").unwrap();
        assert!(has_partial_output(&root).unwrap());
        assert_eq!(prepare_destination(&root, &AlwaysResume).unwrap(), Mode::Continue);
        assert!(root.join("sub/f").exists());

        assert_eq!(prepare_destination(&root, &AlwaysRestart).unwrap(), Mode::Start);
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }
}
