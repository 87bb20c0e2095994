//! Shared-store file helpers.
//!
//! Every writer on the network share goes through [`write_atomic`]: readers
//! on other devices either see the old file or the new one, never a torn
//! write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DbError, DbResult};

/// Writes `bytes` to `path` via a sibling temp file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> DbResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DbError::Internal(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| DbError::io(parent, e))?;

    let temp_path = temp_sibling(path);
    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(DbError::io(path, e));
    }
    Ok(())
}

/// Returns true if `path` looks like a temp file left by [`write_atomic`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.contains(".tmp-"))
        .unwrap_or(false)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    path.with_file_name(format!(".{}.tmp-{}-{}", name, std::process::id(), nanos))
}
