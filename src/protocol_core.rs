//! Wire codec shared by the control channel and the data channel.
//!
//! All integers are big-endian. Strings carry an unsigned 16-bit length
//! prefix followed by either plain UTF-8 or the historical modified UTF-8
//! form (NUL as `C0 80`, supplementary characters as surrogate pairs).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransferError};
use crate::protocol::{MAX_STATE_ENTRIES, MAX_STRING_BYTES};

/// How strings are laid out after their length prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    #[default]
    Plain,
    Modified,
}

pub fn encode_string(s: &str, enc: StringEncoding) -> Result<Vec<u8>> {
    let bytes = match enc {
        StringEncoding::Plain => s.as_bytes().to_vec(),
        StringEncoding::Modified => encode_modified(s),
    };
    if bytes.len() > MAX_STRING_BYTES {
        return Err(TransferError::protocol(format!(
            "string too long for u16 prefix: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}

pub fn decode_string(bytes: &[u8], enc: StringEncoding) -> Result<String> {
    match enc {
        StringEncoding::Plain => String::from_utf8(bytes.to_vec())
            .map_err(|e| TransferError::protocol(format!("invalid utf-8 string: {e}"))),
        StringEncoding::Modified => decode_modified(bytes),
    }
}

fn encode_modified(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            // NUL goes through here as C0 80
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn decode_modified(bytes: &[u8]) -> Result<String> {
    let bad = |at: usize| TransferError::protocol(format!("malformed modified utf-8 at byte {at}"));
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            0x01..=0x7F => {
                units.push(b as u16);
                i += 1;
            }
            0xC0..=0xDF => {
                let b2 = *bytes.get(i + 1).ok_or_else(|| bad(i))?;
                if b2 & 0xC0 != 0x80 {
                    return Err(bad(i));
                }
                units.push(((b as u16 & 0x1F) << 6) | (b2 as u16 & 0x3F));
                i += 2;
            }
            0xE0..=0xEF => {
                let b2 = *bytes.get(i + 1).ok_or_else(|| bad(i))?;
                let b3 = *bytes.get(i + 2).ok_or_else(|| bad(i))?;
                if b2 & 0xC0 != 0x80 || b3 & 0xC0 != 0x80 {
                    return Err(bad(i));
                }
                units.push(((b as u16 & 0x0F) << 12) | ((b2 as u16 & 0x3F) << 6) | (b3 as u16 & 0x3F));
                i += 3;
            }
            // raw NUL and 4-byte forms never appear in modified utf-8
            _ => return Err(bad(i)),
        }
    }
    String::from_utf16(&units)
        .map_err(|e| TransferError::protocol(format!("unpaired surrogate in string: {e}")))
}

pub async fn write_string<W>(w: &mut W, s: &str, enc: StringEncoding) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_string(s, enc)?;
    w.write_u16(bytes.len() as u16).await?;
    w.write_all(&bytes).await?;
    Ok(())
}

pub async fn read_string<R>(r: &mut R, enc: StringEncoding) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    decode_string(&buf, enc)
}

/// Receiver state map: `i32 count` then `count` pairs of `(string, i64)`.
pub async fn write_state_map<W>(
    w: &mut W,
    map: &HashMap<String, i64>,
    enc: StringEncoding,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if map.len() > MAX_STATE_ENTRIES {
        return Err(TransferError::protocol(format!(
            "state map has {} entries (max {})",
            map.len(),
            MAX_STATE_ENTRIES
        )));
    }
    w.write_i32(map.len() as i32).await?;
    for (path, bytes) in map {
        write_string(w, path, enc).await?;
        w.write_i64(*bytes).await?;
    }
    Ok(())
}

pub async fn read_state_map<R>(r: &mut R, enc: StringEncoding) -> Result<HashMap<String, i64>>
where
    R: AsyncRead + Unpin,
{
    let count = r.read_i32().await?;
    if count < 0 || count as usize > MAX_STATE_ENTRIES {
        return Err(TransferError::protocol(format!("bad state map count: {count}")));
    }
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let path = read_string(r, enc).await?;
        let bytes = r.read_i64().await?;
        if bytes < 0 {
            return Err(TransferError::protocol(format!("negative size for {path}")));
        }
        map.insert(path, bytes);
    }
    Ok(map)
}

/// Path as it travels on the wire. Non UTF-8 names cannot be represented.
pub fn path_to_wire(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| TransferError::protocol(format!("path is not valid utf-8: {}", path.display())))
}

/// Resolve a received destination path to a location under `root`.
///
/// The path must start with `root` and the remainder may only contain
/// normal components; `..`, a second root or a NUL byte are rejected.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        return Err(TransferError::protocol("path contains NUL byte"));
    }
    let rel = p.strip_prefix(root).map_err(|_| TransferError::RootMismatch {
        path: p.to_path_buf(),
        root: root.to_path_buf(),
    })?;

    let mut safe = PathBuf::new();
    for component in rel.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                return Err(TransferError::protocol(format!(
                    "path contains disallowed component: {:?}",
                    component
                )));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(TransferError::protocol(format!("path names the root itself: {}", p.display())));
    }
    resolve_under_root(root, &root.join(safe))
}

/// Resolve symlinks along the part of `joined` that already exists and
/// check the result is still below `root`. A root that does not exist yet
/// cannot hold links.
fn resolve_under_root(root: &Path, joined: &Path) -> Result<PathBuf> {
    let Ok(canonical_root) = root.canonicalize() else {
        return Ok(joined.to_path_buf());
    };

    // deepest ancestor present on disk; dangling links count as present
    let mut base = joined.to_path_buf();
    let mut tail = Vec::new();
    while std::fs::symlink_metadata(&base).is_err() {
        match (base.file_name(), base.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_owned());
                base = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = base.canonicalize().map_err(|e| {
        TransferError::protocol(format!("cannot resolve {}: {e}", base.display()))
    })?;
    for name in tail.iter().rev() {
        resolved.push(name);
    }

    if resolved == canonical_root || !resolved.starts_with(&canonical_root) {
        return Err(TransferError::protocol(format!(
            "path {} escapes root {}",
            joined.display(),
            root.display()
        )));
    }
    Ok(resolved)
}

/// Create the parent directory of `path` if needed
pub async fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io_at(parent, e))?;
    }
    Ok(())
}
