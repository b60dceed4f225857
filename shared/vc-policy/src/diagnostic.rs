//! Human-readable source excerpts for policy errors.
//!
//! ```text
//! error: Invalid type 'mod_t': did you forget to require it?
//!  --> base.policy:3:7
//!   |
//! 3 | allow mod_t * { BanMembers }
//!   |       ^^^^^
//! ```

use std::fmt::Write;

use crate::span::Range;

/// Render `message` with an excerpt of `text` underlining `range`.
///
/// Multi-line ranges underline from the start column to the end of the
/// first line, whole (trimmed) middle lines, and up to the end column on
/// the last line.
#[must_use]
pub fn render_excerpt(text: &str, filename: &str, range: &Range, message: &str) -> String {
    let lines = source_lines(text);
    let first = range.start.line.max(1) as usize;
    let last = range.end.line.max(range.start.line).max(1) as usize;
    let gutter = last.to_string().len();

    let mut out = String::new();
    let _ = writeln!(out, "error: {message}");
    let _ = writeln!(
        out,
        "{:gutter$}--> {filename}:{}:{}",
        "", range.start.line, range.start.column
    );
    let _ = writeln!(out, "{:gutter$} |", "");

    for line_no in first..=last {
        let Some(line) = lines.get(line_no - 1) else {
            break;
        };
        let width = line.chars().count();

        let from = if line_no == first {
            range.start.column.saturating_sub(1) as usize
        } else {
            width - line.trim_start().chars().count()
        };
        let to = if line_no == last {
            (range.end.column.saturating_sub(1) as usize).min(width)
        } else {
            width
        };
        // Zero-width ranges (EOF, empty blocks) still get one caret.
        let carets = to.saturating_sub(from).max(1);

        let _ = writeln!(out, "{line_no:>gutter$} | {line}");
        let _ = writeln!(
            out,
            "{:gutter$} | {}{}",
            "",
            " ".repeat(from),
            "^".repeat(carets)
        );
    }

    out
}

/// Lines of `text`, broken at LF, CRLF and lone CR the way the lexer counts
/// them.
fn source_lines(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&text[start..i]);
                start = i + 1;
            }
            b'\r' => {
                lines.push(&text[start..i]);
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    if start < text.len() {
        lines.push(&text[start..]);
    }
    lines
}
