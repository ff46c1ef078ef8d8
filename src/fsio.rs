//! Filesystem helpers shared by the ledger, the patch applier, and the
//! tool orchestrators.

use filetime::FileTime;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic file write: tempfile in the same directory + fsync + rename.
///
/// Either the full write lands or the previous content survives. Creates
/// missing parent directories so patch Add hunks can target new subtrees.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Path has no parent directory",
        )
    })?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Modification time of a file in epoch milliseconds.
pub fn mtime_ms(path: &Path) -> std::io::Result<i64> {
    let meta = fs::metadata(path)?;
    let ft = FileTime::from_last_modification_time(&meta);
    Ok(ft.unix_seconds() * 1000 + i64::from(ft.nanoseconds()) / 1_000_000)
}

/// Wall clock in epoch milliseconds. Fallback when a file cannot be stat'd.
pub fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
