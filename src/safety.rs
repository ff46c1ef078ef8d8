use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Directories the engine refuses to touch, relative to the project root.
///
/// `.agent` holds the engine's own session state (read ledger); letting a
/// patch rewrite it would defeat the consistency guard. `.git` is the
/// project's version-control state.
const PROTECTED_DIRS: &[&str] = &[".agent", ".git"];

/// Boundary checks for mutation targets.
///
/// Unlike a canonicalize-first guard, this validates lexically so that
/// targets which do not exist yet (patch Add hunks, create-style edits) can
/// still be checked. For paths that do exist, a canonicalizing pass catches
/// symlink escapes.
#[derive(Debug, Clone)]
pub struct PathGuard {
    /// Absolute path to the project root
    root: PathBuf,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Path is outside project root: {path} (root: {root})")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Path is in protected directory: {path} (protected: {protected})")]
    ProtectedPath { path: PathBuf, protected: String },

    #[error("Path is not valid: {0}")]
    Malformed(PathBuf),
}

impl PathGuard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // Resolve symlinks in the root itself (tmpdirs often have them) so
        // containment checks compare like with like.
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    /// Check that a path is safe to mutate.
    ///
    /// Returns the absolute resolved path if safe. Relative inputs are
    /// resolved against the project root; `..` components are resolved
    /// lexically and must not escape the root.
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<PathBuf, SafetyError> {
        let path = path.as_ref();

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let resolved = lexical_resolve(&absolute)
            .ok_or_else(|| SafetyError::Malformed(path.to_path_buf()))?;

        // Existing targets are judged by their canonical path, which catches
        // symlink escapes; targets about to be created only have the lexical
        // form to go on.
        let resolved = resolved.canonicalize().unwrap_or(resolved);

        if !resolved.starts_with(&self.root) {
            return Err(SafetyError::OutsideRoot {
                path: resolved,
                root: self.root.clone(),
            });
        }

        let relative = resolved
            .strip_prefix(&self.root)
            .map_err(|_| SafetyError::Malformed(path.to_path_buf()))?;
        if let Some(first) = relative.components().next() {
            let first = first.as_os_str().to_string_lossy();
            for protected in PROTECTED_DIRS {
                if first == *protected {
                    return Err(SafetyError::ProtectedPath {
                        path: resolved.clone(),
                        protected: (*protected).to_string(),
                    });
                }
            }
        }

        Ok(resolved)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// Returns `None` if `..` would climb above the filesystem root.
fn lexical_resolve(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other),
        }
    }
    Some(out)
}
