//! Per-transfer audit log (`--log-file`)

use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

pub trait TransferLogger: Send + Sync {
    fn start(&self, _session: Uuid, _src: &Path, _dst: &Path, _connections: usize) {}
    fn file_done(&self, _path: &Path, _bytes: u64) {}
    fn reset(&self, _worker: usize, _msg: &str) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
    verb: &'static str,
}

impl TextLogger {
    /// `verb` names a finished file: SENT on the sender, SAVED on the receiver
    pub fn new<P: AsRef<Path>>(path: P, verb: &'static str) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
            verb,
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl TransferLogger for TextLogger {
    fn start(&self, session: Uuid, src: &Path, dst: &Path, connections: usize) {
        self.line(&format!(
            "SESSION id={} src={} dst={} connections={}",
            session,
            src.display(),
            dst.display(),
            connections
        ));
    }
    fn file_done(&self, path: &Path, bytes: u64) {
        self.line(&format!("{} path={} bytes={}", self.verb, path.display(), bytes));
    }
    fn reset(&self, worker: usize, msg: &str) {
        self.line(&format!("RESET worker={worker} msg={msg}"));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
