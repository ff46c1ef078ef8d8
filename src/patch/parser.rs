//! Patch text → typed file operations.
//!
//! Parsing is the first half of the two-phase protocol: it never touches the
//! filesystem, so a malformed patch is rejected before anything else runs.

use super::{Chunk, Hunk, PatchError};

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";
const ADD_MARKER: &str = "*** Add File: ";
const DELETE_MARKER: &str = "*** Delete File: ";
const UPDATE_MARKER: &str = "*** Update File: ";
const MOVE_MARKER: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";

/// Parse patch text into file operations.
///
/// Accepts an optional heredoc wrapper (`cat <<'TAG'` … `TAG`) around the
/// envelope, which agents commonly emit when asked for a shell-pasteable
/// patch. Fails `ParseFailed` when the Begin/End markers are missing or out
/// of order, `Rejected` when the envelope contains no recognizable
/// operation.
pub fn parse_patch(text: &str) -> Result<Vec<Hunk>, PatchError> {
    let body = strip_heredoc(text);
    let lines: Vec<&str> = body.lines().collect();

    let begin = lines
        .iter()
        .position(|l| l.trim() == BEGIN_MARKER)
        .ok_or_else(|| PatchError::ParseFailed("missing '*** Begin Patch' marker".into()))?;
    let end = lines
        .iter()
        .position(|l| l.trim() == END_MARKER)
        .ok_or_else(|| PatchError::ParseFailed("missing '*** End Patch' marker".into()))?;
    if end < begin {
        return Err(PatchError::ParseFailed(
            "'*** End Patch' appears before '*** Begin Patch'".into(),
        ));
    }

    let mut hunks = Vec::new();
    let mut i = begin + 1;
    while i < end {
        let line = lines[i];

        if let Some(path) = line.strip_prefix(ADD_MARKER) {
            let (contents, next) = parse_add_contents(&lines, i + 1, end);
            hunks.push(Hunk::Add {
                path: path.trim().to_string(),
                contents,
            });
            i = next;
        } else if let Some(path) = line.strip_prefix(DELETE_MARKER) {
            hunks.push(Hunk::Delete {
                path: path.trim().to_string(),
            });
            i += 1;
        } else if let Some(path) = line.strip_prefix(UPDATE_MARKER) {
            let mut move_path = None;
            let mut j = i + 1;
            if j < end {
                if let Some(target) = lines[j].strip_prefix(MOVE_MARKER) {
                    move_path = Some(target.trim().to_string());
                    j += 1;
                }
            }
            let (chunks, next) = parse_chunks(&lines, j, end);
            hunks.push(Hunk::Update {
                path: path.trim().to_string(),
                move_path,
                chunks,
            });
            i = next;
        } else {
            // Stray line between operations; skip it.
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err(PatchError::Rejected);
    }
    Ok(hunks)
}

/// Collect `+`-prefixed lines of an Add operation. The `+` prefix is
/// stripped; the lines become literal content.
fn parse_add_contents(lines: &[&str], start: usize, end: usize) -> (String, usize) {
    let mut contents = Vec::new();
    let mut i = start;
    while i < end {
        match lines[i].strip_prefix('+') {
            Some(stripped) => contents.push(stripped),
            None => break,
        }
        i += 1;
    }
    (contents.join("\n"), i)
}

/// Collect the chunks of an Update operation, up to the next file marker.
fn parse_chunks(lines: &[&str], start: usize, end: usize) -> (Vec<Chunk>, usize) {
    let mut chunks = Vec::new();
    let mut current = Chunk::default();
    let mut i = start;

    while i < end {
        let line = lines[i];

        if line.trim() == EOF_MARKER {
            current.is_end_of_file = true;
            flush(&mut chunks, &mut current);
            i += 1;
            continue;
        }
        if is_file_marker(line) {
            break;
        }
        if let Some(label) = line.strip_prefix("@@") {
            flush(&mut chunks, &mut current);
            let label = label.trim();
            current.context_label = (!label.is_empty()).then(|| label.to_string());
            i += 1;
            continue;
        }

        if let Some(context) = line.strip_prefix(' ') {
            current.old_lines.push(context.to_string());
            current.new_lines.push(context.to_string());
        } else if let Some(removed) = line.strip_prefix('-') {
            current.old_lines.push(removed.to_string());
        } else if let Some(added) = line.strip_prefix('+') {
            current.new_lines.push(added.to_string());
        } else if line.is_empty() {
            // A bare empty line is a blank context line.
            current.old_lines.push(String::new());
            current.new_lines.push(String::new());
        } else {
            // A line with no recognizable prefix ends the update body rather
            // than being dropped.
            break;
        }
        i += 1;
    }

    flush(&mut chunks, &mut current);
    (chunks, i)
}

fn flush(chunks: &mut Vec<Chunk>, current: &mut Chunk) {
    if !current.old_lines.is_empty()
        || !current.new_lines.is_empty()
        || current.is_end_of_file
    {
        chunks.push(std::mem::take(current));
    } else {
        // Keep nothing from an empty header-only chunk except its label,
        // which applies to the next change region.
        let label = current.context_label.take();
        *current = Chunk::default();
        current.context_label = label;
    }
}

fn is_file_marker(line: &str) -> bool {
    line.starts_with(ADD_MARKER)
        || line.starts_with(DELETE_MARKER)
        || line.starts_with(UPDATE_MARKER)
        || line.starts_with(MOVE_MARKER)
}

/// Strip a heredoc wrapper (`cat <<'TAG'` … `TAG`) when present.
fn strip_heredoc(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(first_line) = trimmed.lines().next() else {
        return trimmed;
    };
    let Some(rest) = first_line.trim().strip_prefix("cat") else {
        return trimmed;
    };
    let Some(tag_part) = rest.trim_start().strip_prefix("<<") else {
        return trimmed;
    };
    let tag = tag_part
        .trim_start_matches('-')
        .trim()
        .trim_matches(|c| c == '\'' || c == '"');
    if tag.is_empty() {
        return trimmed;
    }

    let body = &trimmed[first_line.len()..];
    let body = body.strip_prefix('\n').unwrap_or(body);
    let body = body.trim_end();
    body.strip_suffix(tag).map(str::trim_end).unwrap_or(body)
}
