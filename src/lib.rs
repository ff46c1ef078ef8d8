//! Workspace Patcher: file mutation engine for AI coding agents.
//!
//! Lets an agent safely mutate files in a shared project workspace. Four
//! pieces combine into the safety story:
//!
//! - A **read-time ledger**: every mutation of an existing file must be
//!   preceded, in the same session, by a read — and the file must not have
//!   gained a newer mtime since ([`ledger`]).
//! - A **per-path write lock**: at most one in-flight mutation per
//!   normalized path, FIFO ([`lock`]).
//! - A **replacement cascade**: ordered fuzzy strategies that locate the
//!   caller's "old text" even when it drifted from the file by whitespace,
//!   indentation, or escaping ([`replace`]).
//! - A **two-phase patch pipeline**: a custom multi-file patch format that
//!   validates every hunk before writing any ([`patch`]).
//!
//! # Atomicity
//!
//! Patch application validates all-or-nothing: phase 1 computes every
//! resulting file with no writes, and any failure aborts the whole patch.
//! Phase 2 writes are best-effort with no rollback — this is not a
//! multi-file transaction over unreliable storage, and does not try to be.
//!
//! # Example
//!
//! ```no_run
//! use workspace_patcher::FileTools;
//! use serde_json::json;
//!
//! let tools = FileTools::new("/project", "project-1", "session-1");
//! let input = [
//!     ("file_path".to_string(), json!("/project/src/main.ts")),
//!     ("old_string".to_string(), json!("const x = 1;")),
//!     ("new_string".to_string(), json!("const x = 2;")),
//! ]
//! .into_iter()
//! .collect();
//!
//! // Fails with FileNotRead until the session reads the file first.
//! match tools.file_edit(&input) {
//!     Ok(result) => println!("{}", result.message),
//!     Err(e) => eprintln!("{}: {}", e.code(), e),
//! }
//! ```

pub mod fsio;
pub mod ledger;
pub mod lock;
pub mod notify;
pub mod patch;
pub mod replace;
pub mod safety;
pub mod tools;

// Re-exports
pub use ledger::{LedgerError, ReadLedger};
pub use lock::LockManager;
pub use notify::{ChangeAction, ChangeNotifier, FileChange, NullNotifier};
pub use patch::{parse_patch, Chunk, Hunk, PatchApplier, PatchError, SessionRef};
pub use replace::{replace, ReplaceError};
pub use safety::{PathGuard, SafetyError};
pub use tools::{FileTools, ToolError, ToolInput, ToolOutput};
