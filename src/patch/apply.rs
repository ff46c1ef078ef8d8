//! Two-phase patch application.
//!
//! Phase 1 validates every hunk and computes every resulting file content
//! without mutating anything; any failure aborts the whole patch with zero
//! writes. Phase 2 writes the validated results in original hunk order.
//! There is no rollback for a phase-2 failure partway through — callers
//! must treat that as requiring manual inspection.

use std::fs;
use std::path::PathBuf;
use tracing::debug;

use super::{Chunk, Hunk, PatchError};
use crate::fsio;
use crate::ledger::ReadLedger;
use crate::notify::{ChangeAction, ChangeNotifier, FileChange};
use crate::safety::PathGuard;

/// Session tracking for update hunks: when present, every updated file must
/// have been read by the session and be unchanged since.
#[derive(Clone, Copy)]
pub struct SessionRef<'a> {
    pub ledger: &'a ReadLedger,
    pub session: &'a str,
}

pub struct PatchApplier<'a> {
    guard: &'a PathGuard,
    session: Option<SessionRef<'a>>,
    notifier: &'a dyn ChangeNotifier,
    project_id: &'a str,
}

/// A validated hunk, ready to write.
struct PlannedWrite {
    target: PathBuf,
    move_from: Option<PathBuf>,
    action: ChangeAction,
    before: Option<String>,
    after: Option<String>,
}

impl<'a> PatchApplier<'a> {
    pub fn new(
        guard: &'a PathGuard,
        session: Option<SessionRef<'a>>,
        notifier: &'a dyn ChangeNotifier,
        project_id: &'a str,
    ) -> Self {
        Self {
            guard,
            session,
            notifier,
            project_id,
        }
    }

    /// Validate and apply parsed hunks. Returns one [`FileChange`] per
    /// affected path and requests a single batched reload at the end.
    pub fn apply(&self, hunks: &[Hunk]) -> Result<Vec<FileChange>, PatchError> {
        let planned = self.validate(hunks)?;
        debug!(hunks = hunks.len(), "patch validated, writing");
        self.write(planned)
    }

    /// Phase 1: path checks, read-ledger checks, content computation.
    /// No filesystem mutation happens here.
    fn validate(&self, hunks: &[Hunk]) -> Result<Vec<PlannedWrite>, PatchError> {
        let mut planned = Vec::with_capacity(hunks.len());

        for hunk in hunks {
            match hunk {
                Hunk::Add { path, contents } => {
                    let target = self.guard.validate(path)?;
                    if target.exists() {
                        return Err(PatchError::ApplyFailed(format!(
                            "cannot add {path}: file already exists"
                        )));
                    }
                    planned.push(PlannedWrite {
                        target,
                        move_from: None,
                        action: ChangeAction::Create,
                        before: None,
                        after: Some(with_final_newline(contents)),
                    });
                }
                Hunk::Delete { path } => {
                    let target = self.guard.validate(path)?;
                    let before = fs::read_to_string(&target)
                        .map_err(|_| PatchError::FileNotFound(path.clone()))?;
                    planned.push(PlannedWrite {
                        target,
                        move_from: None,
                        action: ChangeAction::Delete,
                        before: Some(before),
                        after: None,
                    });
                }
                Hunk::Update {
                    path,
                    move_path,
                    chunks,
                } => {
                    let source = self.guard.validate(path)?;
                    let target = match move_path {
                        Some(move_path) => self.guard.validate(move_path)?,
                        None => source.clone(),
                    };
                    if let Some(session) = self.session {
                        session
                            .ledger
                            .assert_read(self.guard.root(), session.session, &source)?;
                    }
                    let before = fs::read_to_string(&source)
                        .map_err(|_| PatchError::FileNotFound(path.clone()))?;
                    let after = apply_chunks(&before, chunks)
                        .map_err(|reason| PatchError::ApplyFailed(format!("{path}: {reason}")))?;
                    planned.push(PlannedWrite {
                        target,
                        move_from: move_path.as_ref().map(|_| source),
                        action: ChangeAction::Edit,
                        before: Some(before),
                        after: Some(after),
                    });
                }
            }
        }

        Ok(planned)
    }

    /// Phase 2: write in original hunk order. Best-effort only — stops at
    /// the first I/O failure with earlier writes left in place.
    fn write(&self, planned: Vec<PlannedWrite>) -> Result<Vec<FileChange>, PatchError> {
        let mut changes = Vec::new();

        for write in planned {
            match write.action {
                ChangeAction::Create | ChangeAction::Edit => {
                    let after = write.after.as_deref().unwrap_or_default();
                    fsio::atomic_write(&write.target, after.as_bytes())?;
                    if let Some(session) = self.session {
                        session.ledger.record_read(
                            self.guard.root(),
                            session.session,
                            &write.target,
                        )?;
                    }
                    if let Some(old_path) = &write.move_from {
                        // A move is delete-old + create-new.
                        fs::remove_file(old_path)?;
                        changes.push(FileChange {
                            path: old_path.to_string_lossy().into_owned(),
                            action: ChangeAction::Delete,
                            before_content: write.before.clone(),
                            after_content: None,
                            is_binary: false,
                        });
                        changes.push(FileChange {
                            path: write.target.to_string_lossy().into_owned(),
                            action: ChangeAction::Create,
                            before_content: None,
                            after_content: write.after,
                            is_binary: false,
                        });
                    } else {
                        changes.push(FileChange {
                            path: write.target.to_string_lossy().into_owned(),
                            action: write.action,
                            before_content: write.before,
                            after_content: write.after,
                            is_binary: false,
                        });
                    }
                }
                ChangeAction::Delete => {
                    fs::remove_file(&write.target)?;
                    changes.push(FileChange {
                        path: write.target.to_string_lossy().into_owned(),
                        action: ChangeAction::Delete,
                        before_content: write.before,
                        after_content: None,
                        is_binary: false,
                    });
                }
            }
        }

        for change in &changes {
            self.notifier.file_changed(self.project_id, change);
        }
        self.notifier.request_reload(self.project_id);

        Ok(changes)
    }
}

/// Derive the full new content of a file from its update chunks.
///
/// Works on the file's lines with the trailing empty element removed. A
/// scan cursor moves forward through the file; each chunk is located at or
/// after the cursor, recorded as a splice, and the splices are applied
/// back-to-front so earlier positions stay valid. The output always ends
/// with exactly one trailing newline.
pub fn apply_chunks(content: &str, chunks: &[Chunk]) -> Result<String, String> {
    let mut lines: Vec<String> = content.split('\n').map(String::from).collect();
    if lines.len() > 1 && lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }

    let mut cursor = 0usize;
    let mut splices: Vec<(usize, usize, Vec<String>)> = Vec::new();

    for chunk in chunks {
        if let Some(label) = chunk.context_label.as_deref() {
            let at = seek_context(&lines, label, cursor)
                .ok_or_else(|| format!("context not found: {label}"))?;
            cursor = at + 1;
        }

        if chunk.old_lines.is_empty() {
            // Pure insertion: before a trailing blank line when the file has
            // one, otherwise at end of file.
            let at = if lines.last().map(|l| l.is_empty()).unwrap_or(false) {
                lines.len() - 1
            } else {
                lines.len()
            };
            splices.push((at, 0, chunk.new_lines.clone()));
            continue;
        }

        let mut old = chunk.old_lines.clone();
        let mut new = chunk.new_lines.clone();
        let mut found = locate(&lines, &old, cursor, chunk.is_end_of_file);

        // A chunk whose final line is blank often came from a file whose
        // trailing blank was stripped; retry without it.
        if found.is_none() && old.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
            old.pop();
            if new.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
                new.pop();
            }
            if !old.is_empty() {
                found = locate(&lines, &old, cursor, chunk.is_end_of_file);
            }
        }

        let at = found.ok_or_else(|| {
            format!(
                "lines not found in file: {}",
                old.first().map(String::as_str).unwrap_or("")
            )
        })?;
        splices.push((at, old.len(), new));
        cursor = at + old.len();
    }

    splices.sort_by(|a, b| b.0.cmp(&a.0));
    for (at, len, replacement) in splices {
        lines.splice(at..at + len, replacement);
    }

    let mut out = lines.join("\n");
    while out.ends_with('\n') {
        out.pop();
    }
    out.push('\n');
    Ok(out)
}

/// Position a chunk's old lines: end-of-file chunks first try anchoring to
/// the file tail, then everything falls back to a forward scan.
fn locate(lines: &[String], old: &[String], cursor: usize, is_eof: bool) -> Option<usize> {
    if is_eof && lines.len() >= old.len() {
        let tail = lines.len() - old.len();
        if tail >= cursor && matches_at(lines, old, tail) {
            return Some(tail);
        }
    }
    seek_sequence(lines, old, cursor)
}

/// Multi-pass sequence matcher used by the patch applier (distinct from the
/// replacement cascade). Passes, in order: exact equality, right-trimmed
/// equality, fully-trimmed equality, Unicode-punctuation-normalized and
/// trimmed equality. The first pass producing a match wins.
pub fn seek_sequence(lines: &[String], seq: &[String], start: usize) -> Option<usize> {
    if seq.is_empty() {
        return Some(start);
    }
    if lines.len() < seq.len() || start > lines.len() - seq.len() {
        return None;
    }
    for pass in 0..PASS_COUNT {
        for at in start..=lines.len() - seq.len() {
            if seq
                .iter()
                .zip(&lines[at..])
                .all(|(s, l)| lines_equal(s, l, pass))
            {
                return Some(at);
            }
        }
    }
    None
}

const PASS_COUNT: usize = 4;

fn lines_equal(a: &str, b: &str, pass: usize) -> bool {
    match pass {
        0 => a == b,
        1 => a.trim_end() == b.trim_end(),
        2 => a.trim() == b.trim(),
        _ => normalize_punctuation(a.trim()) == normalize_punctuation(b.trim()),
    }
}

fn matches_at(lines: &[String], seq: &[String], at: usize) -> bool {
    (0..PASS_COUNT).any(|pass| {
        seq.iter()
            .zip(&lines[at..])
            .all(|(s, l)| lines_equal(s, l, pass))
    })
}

/// Find a context label: exact sequence match first, then the first line at
/// or after the cursor containing the trimmed label. Labels are usually the
/// enclosing declaration (`@@ function f()`), which the actual file line
/// extends with a brace or body.
fn seek_context(lines: &[String], label: &str, cursor: usize) -> Option<usize> {
    let single = [label.to_string()];
    if let Some(at) = seek_sequence(lines, &single, cursor) {
        return Some(at);
    }
    let needle = label.trim();
    lines[cursor.min(lines.len())..]
        .iter()
        .position(|l| l.contains(needle))
        .map(|offset| cursor + offset)
}

/// Map typographic Unicode to the ASCII an agent probably meant: smart
/// quotes, dashes, ellipsis, and non-breaking spaces.
fn normalize_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => out.push('"'),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' => {
                out.push('-')
            }
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{2007}' | '\u{202F}' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

fn with_final_newline(contents: &str) -> String {
    if contents.is_empty() || contents.ends_with('\n') {
        contents.to_string()
    } else {
        format!("{contents}\n")
    }
}
