//! Tool orchestrators: the thin layer agents actually call.
//!
//! Each tool receives a flat string-keyed input map (schema-validated
//! upstream) and returns a structured result or a stable error code. The
//! orchestrators compose the ledger, the lock manager, the replacement
//! cascade, and the patch pipeline; they contain no matching logic of their
//! own.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::fsio;
use crate::ledger::{LedgerError, ReadLedger};
use crate::lock::LockManager;
use crate::notify::{ChangeAction, ChangeNotifier, FileChange, NullNotifier};
use crate::patch::{parse_patch, PatchApplier, PatchError, SessionRef};
use crate::replace::{replace, ReplaceError};
use crate::safety::{PathGuard, SafetyError};

pub type ToolInput = serde_json::Map<String, Value>;

#[derive(Debug, Serialize)]
pub struct ToolOutput {
    pub message: String,
    pub changes: Vec<FileChange>,
}

/// Caller-visible failure taxonomy. Codes are stable: agents branch on them
/// to decide their next call (re-read and retry on `FileChangedExternally`,
/// switch to `replace_all` on `MultipleMatches`, and so on).
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File has not been read in this session: {0}")]
    FileNotRead(String),

    #[error("File changed externally since last read: {0}")]
    FileChangedExternally(String),

    #[error("Text not found in file: {0}")]
    NotFound(String),

    #[error("Text matched multiple locations: {0}")]
    MultipleMatches(String),

    #[error("Old and new text are identical")]
    NoChange,

    #[error("Failed to parse patch: {0}")]
    PatchParseFailed(String),

    #[error("Patch contained no file operations")]
    PatchRejected,

    #[error("Failed to apply patch: {0}")]
    PatchApplyFailed(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::InvalidPath(_) => "InvalidPath",
            ToolError::FileNotFound(_) => "FileNotFound",
            ToolError::FileNotRead(_) => "FileNotRead",
            ToolError::FileChangedExternally(_) => "FileChangedExternally",
            ToolError::NotFound(_) => "NotFound",
            ToolError::MultipleMatches(_) => "MultipleMatches",
            ToolError::NoChange => "NoChange",
            ToolError::PatchParseFailed(_) => "PatchParseFailed",
            ToolError::PatchRejected => "PatchRejected",
            ToolError::PatchApplyFailed(_) => "PatchApplyFailed",
            ToolError::MissingInput(_) => "MissingInput",
            ToolError::Io(_) => "IOError",
        }
    }
}

impl From<SafetyError> for ToolError {
    fn from(e: SafetyError) -> Self {
        ToolError::InvalidPath(e.to_string())
    }
}

impl From<LedgerError> for ToolError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::FileNotRead { path } => ToolError::FileNotRead(path),
            LedgerError::FileChangedExternally { path, .. } => {
                ToolError::FileChangedExternally(path)
            }
            other => ToolError::Io(other.to_string()),
        }
    }
}

impl From<ReplaceError> for ToolError {
    fn from(e: ReplaceError) -> Self {
        match e {
            ReplaceError::NoChange => ToolError::NoChange,
            ReplaceError::NotFound { search } => ToolError::NotFound(search),
            ReplaceError::MultipleMatches { search, .. } => ToolError::MultipleMatches(search),
        }
    }
}

impl From<PatchError> for ToolError {
    fn from(e: PatchError) -> Self {
        match e {
            PatchError::ParseFailed(reason) => ToolError::PatchParseFailed(reason),
            PatchError::Rejected => ToolError::PatchRejected,
            PatchError::ApplyFailed(reason) => ToolError::PatchApplyFailed(reason),
            PatchError::FileNotFound(path) => ToolError::FileNotFound(path),
            PatchError::Safety(e) => e.into(),
            PatchError::Ledger(e) => e.into(),
            PatchError::Io(e) => ToolError::Io(e.to_string()),
        }
    }
}

/// One replacement within a multi-edit batch.
#[derive(Debug, Deserialize)]
struct EditSpec {
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

/// The engine facade: one instance per (project root, session).
pub struct FileTools {
    guard: PathGuard,
    project_id: String,
    session: String,
    ledger: Arc<ReadLedger>,
    locks: Arc<LockManager>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl FileTools {
    pub fn new(
        root: impl Into<PathBuf>,
        project_id: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self::with_notifier(root, project_id, session, Arc::new(NullNotifier))
    }

    pub fn with_notifier(
        root: impl Into<PathBuf>,
        project_id: impl Into<String>,
        session: impl Into<String>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        Self {
            guard: PathGuard::new(root),
            project_id: project_id.into(),
            session: session.into(),
            ledger: Arc::new(ReadLedger::new()),
            locks: Arc::new(LockManager::new()),
            notifier,
        }
    }

    /// Share ledger and lock registries with another facade (other sessions
    /// in the same process must contend on the same per-path queues).
    pub fn sharing_registries(&self, session: impl Into<String>) -> Self {
        Self {
            guard: self.guard.clone(),
            project_id: self.project_id.clone(),
            session: session.into(),
            ledger: Arc::clone(&self.ledger),
            locks: Arc::clone(&self.locks),
            notifier: Arc::clone(&self.notifier),
        }
    }

    /// Read a file and record the read in the session ledger. The recorded
    /// timestamp is what later authorizes a mutation of this file.
    pub fn file_read(&self, input: &ToolInput) -> Result<String, ToolError> {
        let path = self.guard.validate(require_str(input, "file_path")?)?;
        let content = fs::read_to_string(&path)
            .map_err(|_| ToolError::FileNotFound(path.to_string_lossy().into_owned()))?;
        self.ledger
            .record_read(self.guard.root(), &self.session, &path)?;
        Ok(content)
    }

    /// Single-replacement edit.
    ///
    /// Inputs: `file_path`, `old_string`, `new_string`, optional
    /// `replace_all`. An empty `old_string` against a nonexistent file
    /// creates it.
    pub fn file_edit(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let raw_path = require_str(input, "file_path")?;
        let old = require_str(input, "old_string")?;
        let new = require_str(input, "new_string")?;
        let replace_all = bool_arg(input, "replace_all");
        let path = self.guard.validate(raw_path)?;

        self.locks.with_lock(&path, || {
            if !path.exists() {
                if !old.is_empty() {
                    return Err(ToolError::FileNotFound(raw_path.to_string()));
                }
                return self.commit(&path, None, new.to_string());
            }

            self.ledger
                .assert_read(self.guard.root(), &self.session, &path)?;
            let before = fs::read_to_string(&path).map_err(|e| ToolError::Io(e.to_string()))?;
            let after = if old.is_empty() && before.is_empty() {
                // Empty old against an empty file: fill in the content.
                new.to_string()
            } else {
                replace(&before, old, new, replace_all)?
            };
            self.commit(&path, Some(before), after)
        })
    }

    /// Multi-edit batch: all requested replacements run against an
    /// in-memory copy and the write commits only if every one succeeds.
    ///
    /// Inputs: `file_path`, `edits` (array of `{old_string, new_string,
    /// replace_all?}`).
    pub fn file_multiedit(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let raw_path = require_str(input, "file_path")?;
        let edits: Vec<EditSpec> = input
            .get("edits")
            .cloned()
            .ok_or_else(|| ToolError::MissingInput("edits".into()))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|e| ToolError::MissingInput(e.to_string()))
            })?;
        if edits.is_empty() {
            return Err(ToolError::MissingInput("edits".into()));
        }
        let path = self.guard.validate(raw_path)?;

        self.locks.with_lock(&path, || {
            let before = if path.exists() {
                self.ledger
                    .assert_read(self.guard.root(), &self.session, &path)?;
                Some(fs::read_to_string(&path).map_err(|e| ToolError::Io(e.to_string()))?)
            } else if edits[0].old_string.is_empty() {
                None
            } else {
                return Err(ToolError::FileNotFound(raw_path.to_string()));
            };

            let mut content = before.clone().unwrap_or_default();
            for edit in &edits {
                if edit.old_string.is_empty() && content.is_empty() {
                    content = edit.new_string.clone();
                } else {
                    content = replace(&content, &edit.old_string, &edit.new_string, edit.replace_all)?;
                }
            }
            self.commit(&path, before, content)
        })
    }

    /// Whole-patch application: parse, validate everything, then write.
    ///
    /// Input: `patch`. Update hunks are checked against the session's read
    /// ledger during validation.
    pub fn file_patch(&self, input: &ToolInput) -> Result<ToolOutput, ToolError> {
        let text = require_str(input, "patch")?;
        let hunks = parse_patch(text)?;
        debug!(hunks = hunks.len(), "applying patch");

        let session = SessionRef {
            ledger: &self.ledger,
            session: &self.session,
        };
        let applier = PatchApplier::new(
            &self.guard,
            Some(session),
            self.notifier.as_ref(),
            &self.project_id,
        );
        let changes = applier.apply(&hunks)?;
        Ok(ToolOutput {
            message: format!("Applied patch ({} file(s) changed)", changes.len()),
            changes,
        })
    }

    /// Drop all read records for this session.
    pub fn clear_session(&self) -> Result<(), ToolError> {
        self.ledger
            .clear_session(self.guard.root(), &self.session)
            .map_err(ToolError::from)
    }

    /// Write the new content, refresh the read baseline, and notify.
    ///
    /// Re-recording the read means the just-written state becomes the new
    /// baseline; the session can keep editing without re-reading.
    fn commit(
        &self,
        path: &std::path::Path,
        before: Option<String>,
        after: String,
    ) -> Result<ToolOutput, ToolError> {
        fsio::atomic_write(path, after.as_bytes()).map_err(|e| ToolError::Io(e.to_string()))?;
        self.ledger
            .record_read(self.guard.root(), &self.session, path)?;

        let display = path.to_string_lossy().into_owned();
        let action = if before.is_some() {
            ChangeAction::Edit
        } else {
            ChangeAction::Create
        };
        let change = FileChange {
            path: display.clone(),
            action,
            before_content: before,
            after_content: Some(after),
            is_binary: false,
        };
        self.notifier.file_changed(&self.project_id, &change);
        self.notifier.request_reload(&self.project_id);

        let verb = match action {
            ChangeAction::Create => "Created",
            _ => "Updated",
        };
        Ok(ToolOutput {
            message: format!("{verb} {display}"),
            changes: vec![change],
        })
    }
}

fn require_str<'a>(input: &'a ToolInput, key: &str) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::MissingInput(key.to_string()))
}

fn bool_arg(input: &ToolInput, key: &str) -> bool {
    input.get(key).and_then(Value::as_bool).unwrap_or(false)
}
