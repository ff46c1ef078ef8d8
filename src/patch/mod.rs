//! Multi-file patch format: parse, validate, apply.
//!
//! The format is an envelope (`*** Begin Patch` … `*** End Patch`) holding
//! file operations ([`Hunk`]s); update hunks carry change regions
//! ([`Chunk`]s). Application is two-phase: phase 1 validates every hunk and
//! computes every resulting file content with no filesystem mutation, phase
//! 2 writes. Atomicity holds at the phase boundary only — a phase-2 failure
//! partway through leaves the already-written files in place.

mod apply;
mod parser;

pub use apply::{apply_chunks, seek_sequence, PatchApplier, SessionRef};
pub use parser::parse_patch;

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::safety::SafetyError;

/// One file-level operation within a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hunk {
    Add {
        path: String,
        contents: String,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_path: Option<String>,
        chunks: Vec<Chunk>,
    },
}

impl Hunk {
    pub fn path(&self) -> &str {
        match self {
            Hunk::Add { path, .. } | Hunk::Delete { path } | Hunk::Update { path, .. } => path,
        }
    }
}

/// One contiguous change region within an update hunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Chunk {
    /// Text after `@@`, used to position the scan cursor before matching.
    pub context_label: Option<String>,
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,
    /// Set by a literal `*** End of File` line: `old_lines` must anchor to
    /// the end of the file.
    pub is_end_of_file: bool,
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Failed to parse patch: {0}")]
    ParseFailed(String),

    #[error("Patch contained no file operations")]
    Rejected,

    #[error("Failed to apply patch: {0}")]
    ApplyFailed(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
