use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Result, TransferError};
// Filesystem enumeration: fork one task per subdirectory, join the results

/// A regular file found under a crawl root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
}

/// List every regular file under `root`.
///
/// Directories are traversed, never recorded. Symlinks are not followed.
/// Result order is unspecified. Any directory that cannot be listed fails
/// the whole crawl with `DirectoryUnreadable`.
pub fn crawl(root: &Path) -> Result<Vec<FileRecord>> {
    let meta = std::fs::metadata(root).map_err(|e| TransferError::DirectoryUnreadable {
        path: root.to_path_buf(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(TransferError::DirectoryUnreadable {
            path: root.to_path_buf(),
            source: io::Error::other("not a directory"),
        });
    }
    crawl_dir(root)
}

fn crawl_dir(dir: &Path) -> Result<Vec<FileRecord>> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| TransferError::DirectoryUnreadable {
            path: e.path().unwrap_or(dir).to_path_buf(),
            source: e.into(),
        })?;
        let ft = entry.file_type();
        if ft.is_dir() {
            subdirs.push(entry.into_path());
        } else if ft.is_file() {
            match entry.metadata() {
                Ok(md) => files.push(FileRecord {
                    size: md.len(),
                    path: entry.into_path(),
                }),
                // vanished between listing and stat
                Err(e) => debug!(path = %entry.path().display(), error = %e, "skipping file"),
            }
        }
    }

    let nested = subdirs
        .par_iter()
        .map(|d| crawl_dir(d))
        .collect::<Result<Vec<_>>>()?;
    for mut n in nested {
        files.append(&mut n);
    }
    Ok(files)
}

/// Path to size map of a crawl result
pub fn inventory(records: &[FileRecord]) -> HashMap<PathBuf, u64> {
    records.iter().map(|r| (r.path.clone(), r.size)).collect()
}

pub fn total_bytes(records: &[FileRecord]) -> u64 {
    records.iter().map(|r| r.size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path, size: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![7u8; size]).unwrap();
    }

    #[test]
    fn finds_exactly_the_regular_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("a.txt"), 10);
        touch(&root.join("empty"), 0);
        touch(&root.join("d1/b.bin"), 4096);
        touch(&root.join("d1/d2/d3/c.dat"), 3);
        touch(&root.join("d4/e.dat"), 1);
        fs::create_dir_all(root.join("only/dirs/here")).unwrap();

        let records = crawl(root).unwrap();
        let paths: HashSet<PathBuf> = records.iter().map(|r| r.path.clone()).collect();
        assert_eq!(paths.len(), records.len(), "duplicate records");

        let expected: HashSet<PathBuf> = [
            "a.txt",
            "empty",
            "d1/b.bin",
            "d1/d2/d3/c.dat",
            "d4/e.dat",
        ]
        .iter()
        .map(|p| root.join(p))
        .collect();
        assert_eq!(paths, expected);

        let inv = inventory(&records);
        assert_eq!(inv[&root.join("d1/b.bin")], 4096);
        assert_eq!(inv[&root.join("empty")], 0);
        assert_eq!(total_bytes(&records), 10 + 4096 + 3 + 1);
    }

    #[test]
    fn empty_root_yields_nothing() {
        let tmp = TempDir::new().unwrap();
        assert!(crawl(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_root_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let err = crawl(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, TransferError::DirectoryUnreadable { .. }));
    }

    #[test]
    fn file_root_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let f = tmp.path().join("f");
        touch(&f, 1);
        assert!(matches!(
            crawl(&f),
            Err(TransferError::DirectoryUnreadable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        touch(&root.join("real.txt"), 5);
        touch(&tmp.path().join("outside/x.txt"), 5);
        std::os::unix::fs::symlink(tmp.path().join("outside"), root.join("link")).unwrap();

        let records = crawl(&root).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, root.join("real.txt"));
    }
}
