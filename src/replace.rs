//! Fuzzy replacement cascade.
//!
//! Locates a caller-supplied "old text" span inside file content even when
//! the two differ by whitespace, indentation, or escaping. Strategies are
//! ordered from strict to permissive; each yields candidate spans, and every
//! candidate is re-verified to exist verbatim in the content before it is
//! trusted. The first strategy producing a usable candidate wins.
//!
//! A non-`replace_all` candidate is usable only when it is the sole
//! occurrence of that exact literal span in the content.

use strsim::normalized_levenshtein;
use thiserror::Error;
use tracing::debug;

/// Minimum average interior-line similarity for a block-anchor match when
/// several blocks share the same first/last anchor lines. A single
/// anchor-matching block is accepted unconditionally.
const ANCHOR_SIMILARITY_THRESHOLD: f64 = 0.3;

/// Minimum fraction of interior lines that must match exactly for the
/// context-aware strategy.
const CONTEXT_MATCH_RATIO: f64 = 0.5;

#[derive(Error, Debug)]
pub enum ReplaceError {
    #[error("Replacement text is identical to the original")]
    NoChange,

    #[error("Text not found in file: {search}")]
    NotFound { search: String },

    #[error("Text matched {count} locations (use replace_all to change every occurrence): {search}")]
    MultipleMatches { search: String, count: usize },
}

type Strategy = fn(&str, &str) -> Vec<String>;

/// The cascade, strict to permissive. Order matters: an exact match must
/// never lose to a fuzzier interpretation of the same search text.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("exact", exact),
    ("line-trimmed", line_trimmed),
    ("block-anchor", block_anchor),
    ("whitespace-normalized", whitespace_normalized),
    ("indentation-flexible", indentation_flexible),
    ("escape-normalized", escape_normalized),
    ("trimmed-boundary", trimmed_boundary),
    ("context-aware", context_aware),
    ("multi-occurrence", multi_occurrence),
];

/// Replace `old` with `new` inside `content`.
///
/// With `replace_all`, every disjoint occurrence of the located span is
/// replaced; otherwise the located span must be unique in the content.
pub fn replace(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<String, ReplaceError> {
    if old == new {
        return Err(ReplaceError::NoChange);
    }
    // An empty search has no span to locate; without this guard the fuzzier
    // strategies would match any whitespace-only line.
    if old.is_empty() {
        return Err(ReplaceError::NotFound {
            search: preview(old),
        });
    }

    let mut ambiguous: Option<usize> = None;
    for &(name, strategy) in STRATEGIES {
        for candidate in strategy(content, old) {
            if candidate.is_empty() {
                continue;
            }
            // Re-verify: the candidate must exist verbatim in the content,
            // no matter what the strategy believed.
            let count = content.matches(candidate.as_str()).count();
            if count == 0 {
                continue;
            }
            if replace_all {
                debug!(strategy = name, count, "replacing all occurrences");
                return Ok(content.replace(candidate.as_str(), new));
            }
            if count == 1 {
                debug!(strategy = name, "replacing unique occurrence");
                return Ok(content.replacen(candidate.as_str(), new, 1));
            }
            // Ambiguous here, but a later strategy may still resolve a
            // unique span; remember the first ambiguity for the error.
            ambiguous.get_or_insert(count);
        }
    }

    match ambiguous {
        Some(count) => Err(ReplaceError::MultipleMatches {
            search: preview(old),
            count,
        }),
        None => Err(ReplaceError::NotFound {
            search: preview(old),
        }),
    }
}

// ---------------------------------------------------------------------------
// Strategies. Each returns candidate spans expected to occur verbatim in the
// content; the caller re-verifies and applies the uniqueness rule.
// ---------------------------------------------------------------------------

fn exact(content: &str, search: &str) -> Vec<String> {
    if content.contains(search) {
        vec![search.to_string()]
    } else {
        Vec::new()
    }
}

/// Compare line by line with leading/trailing whitespace stripped.
fn line_trimmed(content: &str, search: &str) -> Vec<String> {
    let (search_lines, trailing_newline) = split_search_lines(search);
    if search_lines.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = content.split('\n').collect();
    let mut out = Vec::new();

    for start in 0..lines.len().saturating_sub(search_lines.len() - 1) {
        let window = &lines[start..start + search_lines.len()];
        if search_lines
            .iter()
            .zip(window)
            .all(|(s, l)| s.trim() == l.trim())
        {
            push_unique(&mut out, window_text(window, trailing_newline));
        }
    }
    out
}

/// Anchor on the trimmed first and last lines of the search block, then
/// rank anchor-matching blocks by interior similarity.
///
/// A single anchor-matching block is accepted regardless of its interior:
/// this trades precision for match rate on heavily drifted content, and is
/// kept that way on purpose.
fn block_anchor(content: &str, search: &str) -> Vec<String> {
    let (search_lines, trailing_newline) = split_search_lines(search);
    if search_lines.len() < 3 {
        return Vec::new();
    }
    let first_anchor = search_lines[0].trim();
    let last_anchor = search_lines[search_lines.len() - 1].trim();
    let interior = &search_lines[1..search_lines.len() - 1];
    let lines: Vec<&str> = content.split('\n').collect();

    // Candidate blocks: first anchor at `start`, nearest last anchor after
    // it. Blocks may differ in length from the search block.
    let mut candidates: Vec<(usize, usize)> = Vec::new();
    for start in 0..lines.len() {
        if lines[start].trim() != first_anchor {
            continue;
        }
        for end in start + 1..lines.len() {
            if lines[end].trim() == last_anchor {
                candidates.push((start, end));
                break;
            }
        }
    }

    match candidates.len() {
        0 => Vec::new(),
        1 => {
            let (start, end) = candidates[0];
            vec![window_text(&lines[start..=end], trailing_newline)]
        }
        _ => {
            let mut best: Option<(f64, usize, usize)> = None;
            for &(start, end) in &candidates {
                let block_interior = &lines[start + 1..end];
                let score = interior_similarity(interior, block_interior);
                if best.map(|(s, _, _)| score > s).unwrap_or(true) {
                    best = Some((score, start, end));
                }
            }
            match best {
                Some((score, start, end)) if score >= ANCHOR_SIMILARITY_THRESHOLD => {
                    vec![window_text(&lines[start..=end], trailing_newline)]
                }
                _ => Vec::new(),
            }
        }
    }
}

/// Average normalized Levenshtein similarity between paired interior lines.
/// Unpaired lines (length drift) score zero.
fn interior_similarity(search_interior: &[&str], block_interior: &[&str]) -> f64 {
    if search_interior.is_empty() {
        return 1.0;
    }
    let paired = search_interior.len().min(block_interior.len());
    let mut total = 0.0;
    for k in 0..paired {
        total += normalized_levenshtein(search_interior[k].trim(), block_interior[k].trim());
    }
    total / search_interior.len().max(block_interior.len()) as f64
}

/// Collapse every whitespace run to a single space on both sides.
fn whitespace_normalized(content: &str, search: &str) -> Vec<String> {
    let normalized_search = normalize_whitespace(search);
    if normalized_search.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();

    if !search.contains('\n') {
        let tokens: Vec<&str> = search.split_whitespace().collect();
        for line in content.split('\n') {
            if normalize_whitespace(line) == normalized_search {
                push_unique(&mut out, line.to_string());
            } else if let Some(span) = find_token_span(line, &tokens) {
                push_unique(&mut out, span.to_string());
            }
        }
        return out;
    }

    let (search_lines, trailing_newline) = split_search_lines(search);
    let lines: Vec<&str> = content.split('\n').collect();
    for start in 0..lines.len().saturating_sub(search_lines.len() - 1) {
        let window = &lines[start..start + search_lines.len()];
        if search_lines
            .iter()
            .zip(window)
            .all(|(s, l)| normalize_whitespace(s) == normalize_whitespace(l))
        {
            push_unique(&mut out, window_text(window, trailing_newline));
        }
    }
    out
}

/// Strip the minimum common leading indentation from every non-blank line on
/// both sides before comparing.
fn indentation_flexible(content: &str, search: &str) -> Vec<String> {
    let (search_lines, trailing_newline) = split_search_lines(search);
    if search_lines.is_empty() {
        return Vec::new();
    }
    let stripped_search = strip_common_indent(&search_lines);
    let lines: Vec<&str> = content.split('\n').collect();
    let mut out = Vec::new();

    for start in 0..lines.len().saturating_sub(search_lines.len() - 1) {
        let window = &lines[start..start + search_lines.len()];
        if strip_common_indent(window) == stripped_search {
            push_unique(&mut out, window_text(window, trailing_newline));
        }
    }
    out
}

/// Unescape common escape sequences in the search text, so a search string
/// that arrived double-escaped (`\\n` for a newline) still matches the
/// literal file content.
fn escape_normalized(content: &str, search: &str) -> Vec<String> {
    let unescaped = unescape(search);
    if unescaped != search && content.contains(unescaped.as_str()) {
        vec![unescaped]
    } else {
        Vec::new()
    }
}

/// Trim only the outer edges of the whole search text.
fn trimmed_boundary(content: &str, search: &str) -> Vec<String> {
    let mut out = Vec::new();
    for candidate in [search.trim(), search.trim_start(), search.trim_end()] {
        if candidate != search && !candidate.is_empty() && content.contains(candidate) {
            push_unique(&mut out, candidate.to_string());
        }
    }
    out
}

/// Like block-anchor, but fixed block length and a plain exact-match quota
/// on interior lines instead of similarity scoring.
fn context_aware(content: &str, search: &str) -> Vec<String> {
    let (search_lines, trailing_newline) = split_search_lines(search);
    if search_lines.len() < 3 {
        return Vec::new();
    }
    let first_anchor = search_lines[0].trim();
    let last_anchor = search_lines[search_lines.len() - 1].trim();
    let interior = &search_lines[1..search_lines.len() - 1];
    let lines: Vec<&str> = content.split('\n').collect();
    let mut out = Vec::new();

    for start in 0..lines.len().saturating_sub(search_lines.len() - 1) {
        let end = start + search_lines.len() - 1;
        if lines[start].trim() != first_anchor || lines[end].trim() != last_anchor {
            continue;
        }
        let matching = interior
            .iter()
            .zip(&lines[start + 1..end])
            .filter(|(s, l)| s.trim() == l.trim())
            .count();
        if interior.is_empty() || matching as f64 / interior.len() as f64 >= CONTEXT_MATCH_RATIO {
            push_unique(&mut out, window_text(&lines[start..=end], trailing_newline));
        }
    }
    out
}

/// Exact occurrences, last in the cascade; this is what `replace_all` rides
/// on when every fuzzier strategy has been exhausted.
fn multi_occurrence(content: &str, search: &str) -> Vec<String> {
    exact(content, search)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Split search text into lines, dropping the empty element a trailing
/// newline produces. Returns the lines and whether that newline was present.
fn split_search_lines(search: &str) -> (Vec<&str>, bool) {
    let mut lines: Vec<&str> = search.split('\n').collect();
    let trailing_newline = lines.len() > 1 && lines.last() == Some(&"");
    if trailing_newline {
        lines.pop();
    }
    (lines, trailing_newline)
}

fn window_text(window: &[&str], trailing_newline: bool) -> String {
    let mut text = window.join("\n");
    if trailing_newline {
        text.push('\n');
    }
    text
}

fn push_unique(out: &mut Vec<String>, candidate: String) {
    if !out.contains(&candidate) {
        out.push(candidate);
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Find a span of `line` whose tokens equal `tokens` with arbitrary
/// whitespace runs between them. Returns the exact span text.
fn find_token_span<'a>(line: &'a str, tokens: &[&str]) -> Option<&'a str> {
    let first = tokens.first()?;
    let mut search_from = 0;
    while let Some(offset) = line[search_from..].find(first) {
        let start = search_from + offset;
        let mut pos = start + first.len();
        let mut matched = true;
        for token in &tokens[1..] {
            let rest = &line[pos..];
            let ws = rest.len() - rest.trim_start().len();
            if ws == 0 || !rest[ws..].starts_with(token) {
                matched = false;
                break;
            }
            pos += ws + token.len();
        }
        if matched {
            return Some(&line[start..pos]);
        }
        search_from = start + first.len().max(1);
    }
    None
}

fn strip_common_indent(lines: &[&str]) -> String {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                l.trim_end()
            } else {
                // Indent is measured in bytes over ASCII whitespace; fall
                // back to a full strip if slicing would split a char.
                l.get(indent..).unwrap_or_else(|| l.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Unescape `\n \t \r \' \" \` \\ \$` and an escaped literal newline.
/// Unknown sequences are kept verbatim.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('t') => {
                chars.next();
                out.push('\t');
            }
            Some('r') => {
                chars.next();
                out.push('\r');
            }
            Some(&q @ ('\'' | '"' | '`' | '\\' | '$')) => {
                chars.next();
                out.push(q);
            }
            Some('\n') => {
                chars.next();
                out.push('\n');
            }
            _ => out.push('\\'),
        }
    }
    out
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_search_is_not_found() {
        // Must not fall through to the cascade, where the line-trimmed
        // strategy would match the whitespace-only line.
        let result = replace("one\n    \ntwo\n", "", "X", false);
        assert!(matches!(result, Err(ReplaceError::NotFound { .. })));
    }

    #[test]
    fn test_no_change_rejected() {
        let result = replace("abc", "b", "b", false);
        assert!(matches!(result, Err(ReplaceError::NoChange)));
        let result = replace("abc", "b", "b", true);
        assert!(matches!(result, Err(ReplaceError::NoChange)));
    }

    #[test]
    fn test_exact_unique() {
        assert_eq!(replace("let x = 1;", "x = 1", "x = 2", false).unwrap(), "let x = 2;");
    }

    #[test]
    fn test_replace_all_occurrences() {
        // Scenario A
        assert_eq!(
            replace("foo bar foo baz foo", "foo", "qux", true).unwrap(),
            "qux bar qux baz qux"
        );
    }

    #[test]
    fn test_exact_substring_of_padded_line() {
        // Scenario B
        assert_eq!(
            replace("  const foo = 1;  ", "const foo = 1;", "const bar = 1;", false).unwrap(),
            "  const bar = 1;  "
        );
    }

    #[test]
    fn test_multiple_matches_without_replace_all() {
        let result = replace("foo foo", "foo", "bar", false);
        assert!(matches!(
            result,
            Err(ReplaceError::MultipleMatches { count: 2, .. })
        ));
    }

    #[test]
    fn test_not_found() {
        let result = replace("alpha beta", "gamma", "delta", false);
        assert!(matches!(result, Err(ReplaceError::NotFound { .. })));
    }

    #[test]
    fn test_line_trimmed_ignores_indentation_drift() {
        let content = "fn main() {\n        let a = 1;\n}\n";
        let result = replace(content, "fn main() {\nlet a = 1;\n}", "fn main() {}", false).unwrap();
        assert_eq!(result, "fn main() {}\n");
    }

    #[test]
    fn test_block_anchor_single_candidate_accepted_unconditionally() {
        // Interior is wildly different; the sole anchor-matching block is
        // still accepted.
        let content = "start\ncompletely different interior\nend\n";
        let search = "start\nthe interior we remembered\nend";
        let result = replace(content, search, "replaced", false).unwrap();
        assert_eq!(result, "replaced\n");
    }

    #[test]
    fn test_block_anchor_picks_most_similar_of_many() {
        let content = "\
if ready {
    launch();
}
other();
if ready {
    lunch();
}
";
        let search = "if ready {\n    lunch();\n}";
        // Exact matches block two; sanity-check the cascade does not get
        // distracted by the anchor-equal first block.
        let result = replace(content, search, "if ready { go(); }", false).unwrap();
        assert!(result.contains("launch();"));
        assert!(result.contains("if ready { go(); }"));
    }

    #[test]
    fn test_block_anchor_rejects_dissimilar_when_ambiguous() {
        let content = "\
{
    aaaa
}
{
    bbbb
}
";
        // Two anchor-matching blocks, interior similar to neither.
        let search = "{\nzzzzzzzzzzzzzzzz\n}";
        let result = replace(content, search, "x", false);
        assert!(matches!(result, Err(ReplaceError::NotFound { .. })));
    }

    #[test]
    fn test_whitespace_normalized_single_line_span() {
        let content = "let   x   =   compute( a,   b );";
        let result = replace(content, "x = compute( a, b )", "x = compute(b)", false).unwrap();
        assert_eq!(result, "let   x = compute(b);");
    }

    #[test]
    fn test_whitespace_normalized_multi_line() {
        let content = "if  (ready)   {\n  go( );\n}";
        let result = replace(content, "if (ready) {\ngo( );\n}", "go();", false).unwrap();
        assert_eq!(result, "go();");
    }

    #[test]
    fn test_indentation_flexible_block() {
        let content = "    if a {\n        b();\n    }\n";
        let search = "if a {\n    b();\n}";
        let result = replace(content, search, "b();", false).unwrap();
        assert_eq!(result, "b();\n");
    }

    #[test]
    fn test_escape_normalized() {
        let content = "console.log(\"hi\\there\");\nnext";
        let search = "console.log(\\\"hi\\\\there\\\");";
        let result = replace(content, search, "log();", false).unwrap();
        assert_eq!(result, "log();\nnext");
    }

    #[test]
    fn test_trimmed_boundary() {
        let content = "abc def ghi";
        let result = replace(content, "  def  ", "DEF", false).unwrap();
        assert_eq!(result, "abc DEF ghi");
    }

    #[test]
    fn test_context_aware_accepts_half_matching_interior() {
        let content = "begin\nkeep me\ntotally drifted line\nend\n";
        // Anchors and one of two interior lines match exactly. Three
        // anchor-candidates do not exist, so block-anchor's single-candidate
        // rule fires first; either way the span resolves.
        let search = "begin\nkeep me\nwhat we remembered\nend";
        let result = replace(content, search, "gone", false).unwrap();
        assert_eq!(result, "gone\n");
    }

    #[test]
    fn test_candidate_spanning_trailing_newline() {
        let content = "a\nb\nc\n";
        let result = replace(content, "b\nc\n", "z\n", false).unwrap();
        assert_eq!(result, "a\nz\n");
    }

    proptest! {
        // If a block occurs exactly once, replacing it and then replacing
        // the replacement back reproduces the original content.
        #[test]
        fn prop_unique_replace_round_trips(
            prefix in "[a-f ]{0,12}",
            suffix in "[a-f ]{0,12}",
        ) {
            let block = "UNIQUE_BLOCK_XYZ";
            let replacement = "SWAPPED_BLOCK_QRS";
            let content = format!("{prefix}{block}{suffix}");
            prop_assume!(!content.contains(replacement));

            let forward = replace(&content, block, replacement, false).unwrap();
            let back = replace(&forward, replacement, block, false).unwrap();
            prop_assert_eq!(back, content);
        }
    }
}
