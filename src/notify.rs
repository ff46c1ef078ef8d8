//! Change notification seam.
//!
//! After any accepted mutation the engine relays what changed to a
//! coordination service addressed by project id (live reload, review UI).
//! This crate only calls the seam; transports live elsewhere.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Edit,
    Delete,
}

/// One accepted mutation, as relayed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub action: ChangeAction,
    pub before_content: Option<String>,
    pub after_content: Option<String>,
    pub is_binary: bool,
}

pub trait ChangeNotifier: Send + Sync {
    fn file_changed(&self, project_id: &str, change: &FileChange);
    fn request_reload(&self, project_id: &str);
}

/// Notifier that drops everything. Default for headless use and tests.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl ChangeNotifier for NullNotifier {
    fn file_changed(&self, _project_id: &str, _change: &FileChange) {}
    fn request_reload(&self, _project_id: &str) {}
}
