//! Resume reconciliation: which sender files still need bytes, and from where.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};

/// One file still to be streamed, starting at `resume_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Full size as recorded by the crawl; sent as `fileLength`
    pub size: u64,
    pub resume_offset: u64,
}

impl WorkItem {
    pub fn remaining(&self) -> u64 {
        self.size - self.resume_offset
    }
}

/// Sender root and receiver root. Receiver paths are sender paths with the
/// first prefix swapped for the second.
#[derive(Debug, Clone)]
pub struct RootMap {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
}

impl RootMap {
    pub fn new(source_root: impl Into<PathBuf>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            destination_root: destination_root.into(),
        }
    }

    pub fn to_destination(&self, source: &Path) -> Result<PathBuf> {
        translate(source, &self.source_root, &self.destination_root)
    }

    pub fn to_source(&self, destination: &Path) -> Result<PathBuf> {
        translate(destination, &self.destination_root, &self.source_root)
    }
}

fn translate(path: &Path, from: &Path, to: &Path) -> Result<PathBuf> {
    let rel = path.strip_prefix(from).map_err(|_| TransferError::RootMismatch {
        path: path.to_path_buf(),
        root: from.to_path_buf(),
    })?;
    Ok(to.join(rel))
}

/// Compute `sender path -> resume offset` for every file not yet delivered.
///
/// Without receiver state (fresh start) everything is unsent at offset 0.
/// With it, a file is omitted only when the receiver holds exactly the
/// sender's size; a shorter copy resumes at the receiver's size and a longer
/// one is stale and restarts at 0. Receiver files the sender does not have
/// are ignored.
pub fn unsent_intersection(
    inventory: &HashMap<PathBuf, u64>,
    receiver_state: Option<&HashMap<String, i64>>,
    roots: &RootMap,
) -> Result<HashMap<PathBuf, u64>> {
    let Some(state) = receiver_state else {
        return Ok(inventory.keys().map(|p| (p.clone(), 0)).collect());
    };

    let mut delivered: HashMap<PathBuf, u64> = HashMap::with_capacity(state.len());
    for (dest, bytes) in state {
        let source = roots.to_source(Path::new(dest))?;
        delivered.insert(source, (*bytes).max(0) as u64);
    }

    let mut unsent = HashMap::new();
    for (path, &size) in inventory {
        match delivered.get(path) {
            None => {
                unsent.insert(path.clone(), 0);
            }
            Some(&have) if have < size => {
                unsent.insert(path.clone(), have);
            }
            Some(&have) if have > size => {
                unsent.insert(path.clone(), 0);
            }
            Some(_) => {}
        }
    }
    Ok(unsent)
}

/// Turn the unsent set into queueable items, sorted by source path.
pub fn work_items(
    inventory: &HashMap<PathBuf, u64>,
    unsent: &HashMap<PathBuf, u64>,
    roots: &RootMap,
) -> Result<Vec<WorkItem>> {
    let mut items = unsent
        .iter()
        .map(|(source, &offset)| {
            let size = inventory.get(source).copied().unwrap_or(offset);
            Ok(WorkItem {
                destination: roots.to_destination(source)?,
                source: source.clone(),
                size,
                resume_offset: offset,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    items.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(items)
}

/// Totals reported back to the receiver at the end of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    pub total_files: i32,
    pub bytes_delivered: i64,
    pub files_delivered: i32,
    pub total_bytes: i64,
}

pub fn summarize(inventory: &HashMap<PathBuf, u64>, unsent: &HashMap<PathBuf, u64>) -> Summary {
    let total_bytes: u64 = inventory.values().sum();
    let remaining: u64 = unsent
        .iter()
        .map(|(p, &off)| inventory.get(p).copied().unwrap_or(off).saturating_sub(off))
        .sum();
    Summary {
        total_files: inventory.len() as i32,
        bytes_delivered: (total_bytes - remaining) as i64,
        files_delivered: (inventory.len() - unsent.len()) as i32,
        total_bytes: total_bytes as i64,
    }
}
