//! Read-time ledger: the read-before-write consistency guard.
//!
//! Each (project root, session) pair owns a map of normalized path → the
//! file's mtime observed when the session last read it. A later mutation is
//! allowed only if the file has not gained a newer mtime since — the edit
//! would otherwise be based on stale content.
//!
//! The map is persisted as JSON under the project's `.agent` directory and
//! cached in memory. The cache is populated lazily from disk so a cold
//! process reaches the same verdicts as the one that recorded the reads.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::fsio;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("File has not been read in this session: {path}")]
    FileNotRead { path: String },

    #[error("File changed externally since last read: {path} (read at {recorded}ms, now {observed}ms)")]
    FileChangedExternally {
        path: String,
        recorded: i64,
        observed: i64,
    },

    #[error("Failed to persist read ledger: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read ledger is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

type SessionKey = (PathBuf, String);

/// Registry of per-session read timestamps.
///
/// Process-wide when shared behind an `Arc`; consistency across processes
/// comes from re-deriving the map from the persisted file on a cold cache,
/// with the mtime cross-check as compensation. No distributed lock.
#[derive(Debug, Default)]
pub struct ReadLedger {
    cache: Mutex<HashMap<SessionKey, HashMap<String, i64>>>,
}

impl ReadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `path` was read (or just written) by `session`.
    ///
    /// The stored timestamp is the file's mtime, not the wall clock: the
    /// value compared later by [`assert_read`](Self::assert_read) then
    /// originates from the same clock source as the future `stat`, so skew
    /// between processes cannot produce false staleness verdicts. Falls back
    /// to the wall clock when the file cannot be stat'd (about to be
    /// created).
    pub fn record_read(
        &self,
        root: &Path,
        session: &str,
        path: &Path,
    ) -> Result<(), LedgerError> {
        let normalized = normalize_path(path);
        let timestamp = fsio::mtime_ms(path).unwrap_or_else(|_| fsio::wall_clock_ms());
        debug!(path = %normalized, timestamp, "recording read");

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let key = (root.to_path_buf(), session.to_string());
        let entry = loaded_entry(&mut cache, &key)?;
        entry.insert(normalized, timestamp);

        let serialized = serde_json::to_vec_pretty(&entry)?;
        fsio::atomic_write(&ledger_file(root, session), &serialized)?;
        Ok(())
    }

    /// Check that `path` was read by `session` and has not changed since.
    ///
    /// Fails `FileNotRead` when no record exists, `FileChangedExternally`
    /// when the current mtime is strictly greater than the recorded value
    /// (equal passes). A failing `stat` is ignored: the file may be
    /// mid-delete, which is not this guard's concern.
    pub fn assert_read(
        &self,
        root: &Path,
        session: &str,
        path: &Path,
    ) -> Result<(), LedgerError> {
        let normalized = normalize_path(path);

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let key = (root.to_path_buf(), session.to_string());
        let entry = loaded_entry(&mut cache, &key)?;

        let recorded = *entry
            .get(&normalized)
            .ok_or_else(|| LedgerError::FileNotRead {
                path: normalized.clone(),
            })?;

        if let Ok(observed) = fsio::mtime_ms(path) {
            if observed > recorded {
                debug!(path = %normalized, recorded, observed, "stale read detected");
                return Err(LedgerError::FileChangedExternally {
                    path: normalized,
                    recorded,
                    observed,
                });
            }
        }
        Ok(())
    }

    /// Drop the session's cache entry and delete its persisted ledger.
    pub fn clear_session(&self, root: &Path, session: &str) -> Result<(), LedgerError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(&(root.to_path_buf(), session.to_string()));
        drop(cache);

        match fs::remove_dir_all(session_dir(root, session)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fetch the session map, loading it from disk on a cold cache.
fn loaded_entry<'a>(
    cache: &'a mut HashMap<SessionKey, HashMap<String, i64>>,
    key: &SessionKey,
) -> Result<&'a mut HashMap<String, i64>, LedgerError> {
    if !cache.contains_key(key) {
        let file = ledger_file(&key.0, &key.1);
        let map = match fs::read_to_string(&file) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        cache.insert(key.clone(), map);
    }
    Ok(cache
        .get_mut(key)
        .expect("session entry was just inserted above"))
}

/// Normalize to exactly one leading slash, so callers may pass paths with or
/// without it interchangeably.
pub fn normalize_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    format!("/{}", text.trim_start_matches('/'))
}

fn session_dir(root: &Path, session: &str) -> PathBuf {
    root.join(".agent").join("sessions").join(session)
}

fn ledger_file(root: &Path, session: &str) -> PathBuf {
    session_dir(root, session).join("filetime.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn touch(path: &Path, unix_secs: i64) {
        fs::write(path, b"content").unwrap();
        filetime::set_file_mtime(path, FileTime::from_unix_time(unix_secs, 0)).unwrap();
    }

    #[test]
    fn test_assert_without_record_fails() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ReadLedger::new();
        let file = temp.path().join("a.ts");
        touch(&file, 1_000);

        let result = ledger.assert_read(temp.path(), "s1", &file);
        assert!(matches!(result, Err(LedgerError::FileNotRead { .. })));
    }

    #[test]
    fn test_equal_mtime_passes_strictly_greater_fails() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ReadLedger::new();
        let file = temp.path().join("a.ts");
        touch(&file, 1_000);

        ledger.record_read(temp.path(), "s1", &file).unwrap();
        // Equal mtime: pass (the comparison is strict >).
        assert!(ledger.assert_read(temp.path(), "s1", &file).is_ok());

        filetime::set_file_mtime(&file, FileTime::from_unix_time(1_001, 0)).unwrap();
        let result = ledger.assert_read(temp.path(), "s1", &file);
        assert!(matches!(
            result,
            Err(LedgerError::FileChangedExternally { .. })
        ));
    }

    #[test]
    fn test_missing_file_record_uses_wall_clock() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ReadLedger::new();
        let file = temp.path().join("about-to-exist.ts");

        // File does not exist; record must still succeed.
        ledger.record_read(temp.path(), "s1", &file).unwrap();
        // And assert ignores the stat failure.
        assert!(ledger.assert_read(temp.path(), "s1", &file).is_ok());
    }

    #[test]
    fn test_cold_cache_reads_persisted_ledger() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("a.ts");
        touch(&file, 1_000);

        let warm = ReadLedger::new();
        warm.record_read(temp.path(), "s1", &file).unwrap();

        // A fresh registry (fresh process) must reach the same verdicts.
        let cold = ReadLedger::new();
        assert!(cold.assert_read(temp.path(), "s1", &file).is_ok());

        filetime::set_file_mtime(&file, FileTime::from_unix_time(2_000, 0)).unwrap();
        let result = cold.assert_read(temp.path(), "s1", &file);
        assert!(matches!(
            result,
            Err(LedgerError::FileChangedExternally { .. })
        ));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ReadLedger::new();
        let file = temp.path().join("a.ts");
        touch(&file, 1_000);

        ledger.record_read(temp.path(), "s1", &file).unwrap();
        let result = ledger.assert_read(temp.path(), "s2", &file);
        assert!(matches!(result, Err(LedgerError::FileNotRead { .. })));
    }

    #[test]
    fn test_clear_session_removes_state_and_directory() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ReadLedger::new();
        let file = temp.path().join("a.ts");
        touch(&file, 1_000);

        ledger.record_read(temp.path(), "s1", &file).unwrap();
        let dir = temp.path().join(".agent/sessions/s1");
        assert!(dir.exists());

        ledger.clear_session(temp.path(), "s1").unwrap();
        assert!(!dir.exists());
        let result = ledger.assert_read(temp.path(), "s1", &file);
        assert!(matches!(result, Err(LedgerError::FileNotRead { .. })));
    }

    #[test]
    fn test_normalize_path_single_leading_slash() {
        assert_eq!(normalize_path(Path::new("/a/b.ts")), "/a/b.ts");
        assert_eq!(normalize_path(Path::new("a/b.ts")), "/a/b.ts");
        assert_eq!(normalize_path(Path::new("//a/b.ts")), "/a/b.ts");
    }

    #[test]
    fn test_clear_missing_session_is_ok() {
        let temp = tempfile::tempdir().unwrap();
        let ledger = ReadLedger::new();
        assert!(ledger.clear_session(temp.path(), "never-used").is_ok());
    }
}
