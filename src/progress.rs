//! Transfer progress: shared counters plus a cargo-style terminal display
//!
//! The counters are what the workers touch; the display only polls
//! snapshots of them, so the core never depends on the terminal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use crate::reconcile::Summary;

/// Point-in-time copy of the counters and the totals they run toward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub files_completed: u64,
    pub bytes_transferred: u64,
    pub total_files: u64,
    pub total_bytes: u64,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.files_completed >= self.total_files && self.bytes_transferred >= self.total_bytes
    }
}

/// Counters shared by every worker on one side of a session.
///
/// Both counters only grow and never pass their totals. `reset` is for a
/// brand-new session; `resume` seeds totals from a re-run handshake without
/// moving anything backwards. Bytes the sender wrote into a connection that
/// then died are sent again after a resume, so the sending side relies on
/// the cap to finish exactly at the totals.
#[derive(Clone, Default)]
pub struct ProgressCounters {
    inner: Arc<Mutex<ProgressSnapshot>>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, summary: &Summary) {
        *self.inner.lock() = ProgressSnapshot {
            files_completed: summary.files_delivered.max(0) as u64,
            bytes_transferred: summary.bytes_delivered.max(0) as u64,
            total_files: summary.total_files.max(0) as u64,
            total_bytes: summary.total_bytes.max(0) as u64,
        };
    }

    pub fn resume(&self, summary: &Summary) {
        let mut s = self.inner.lock();
        s.files_completed = s.files_completed.max(summary.files_delivered.max(0) as u64);
        s.bytes_transferred = s.bytes_transferred.max(summary.bytes_delivered.max(0) as u64);
        s.total_files = summary.total_files.max(0) as u64;
        s.total_bytes = summary.total_bytes.max(0) as u64;
    }

    pub fn add_bytes(&self, n: u64) {
        let mut s = self.inner.lock();
        s.bytes_transferred = (s.bytes_transferred + n).min(s.total_bytes);
    }

    pub fn complete_file(&self) {
        let mut s = self.inner.lock();
        s.files_completed = (s.files_completed + 1).min(s.total_files);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.inner.lock()
    }
}

/// Progress bar for the receiving terminal
pub struct ProgressDisplay {
    bar: ProgressBar,
    start_time: Instant,
}

impl ProgressDisplay {
    pub fn new(tick: Duration) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(tick);
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    pub fn update(&self, s: &ProgressSnapshot) {
        self.bar.set_length(s.total_bytes);
        self.bar.set_position(s.bytes_transferred);
        let pct = if s.total_files > 0 {
            s.files_completed * 100 / s.total_files
        } else {
            100
        };
        self.bar
            .set_message(format!("{}/{} files ({}%)", s.files_completed, s.total_files, pct));
    }

    pub fn println(&self, line: &str) {
        self.bar.suspend(|| println!("  {}", line));
    }

    /// Finish with success message
    pub fn finish_success(&self, s: &ProgressSnapshot) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            s.bytes_transferred as f64 / elapsed / 1_048_576.0
        } else {
            0.0
        };
        self.bar.finish_with_message(format!(
            "{} {} files ({:.1} MB) in {:.1}s ({:.1} MB/s)",
            "Finished".with(Color::Green).bold(),
            s.files_completed,
            s.bytes_transferred as f64 / 1_048_576.0,
            elapsed,
            throughput
        ));
    }

    /// Finish telling the operator to restart manually
    pub fn finish_restart(&self, msg: &str) {
        self.bar.abandon_with_message(format!(
            "{} {}",
            "Restart".with(Color::Red).bold(),
            msg
        ));
    }
}
