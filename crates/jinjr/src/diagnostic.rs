//! Source-coordinate tracking and error message formatting.
//!
//! Every token and every emitted instruction carries the byte offset it came
//! from. When something fails, the offset is mapped back to a line/column
//! pair and a fixed-width snippet of the surrounding source, and the message
//! is rendered as
//!
//! ```text
//! [Phase:(unit:line,col)] at:... <snippet> ...!
//! Message: <detail>
//! ```
//!
//! which is the one format shared by the tokenizer, the parser, the
//! optimizer and the VM.

use std::fmt;

/// Width of the code snippet embedded in error messages.
pub const SNIPPET_SIZE: usize = 64;

/// A half-open byte range in the source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// A zero-length span at a single offset.
    pub fn at(pos: usize) -> Self {
        Self { start: pos, end: pos }
    }
}

/// The pipeline stage a diagnostic originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lex,
    Parse,
    Optimize,
    Run,
    Json,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Lex => "Lex",
            Phase::Parse => "Parse",
            Phase::Optimize => "Optimize",
            Phase::Run => "Run",
            Phase::Json => "Json",
        };
        f.write_str(name)
    }
}

/// Map a byte offset to a 1-based (line, column) pair.
pub fn line_col(src: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in src.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Extract a snippet of at most `width` characters centered on `offset`.
///
/// Line breaks are rewritten to spaces so the snippet always renders on one
/// line; carriage returns are dropped.
pub fn snippet(src: &str, offset: usize, width: usize) -> String {
    let width = if width == 0 || width > SNIPPET_SIZE {
        SNIPPET_SIZE
    } else {
        width
    };
    let bytes = src.as_bytes();
    let start = offset.saturating_sub(width / 2);
    let end = (offset + width / 2).min(bytes.len());

    // Snap to char boundaries.
    let mut s = start.min(src.len());
    while s > 0 && !src.is_char_boundary(s) {
        s -= 1;
    }
    let mut e = end;
    while e < src.len() && !src.is_char_boundary(e) {
        e += 1;
    }

    src[s..e]
        .chars()
        .filter(|&c| c != '\r')
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect()
}

/// Render a phase-tagged error message with coordinates and snippet.
///
/// `unit` names the compilation unit (template name or function name).
pub fn message(phase: Phase, unit: &str, src: &str, offset: usize, detail: &str) -> String {
    let (line, col) = line_col(src, offset);
    let snip = snippet(src, offset, SNIPPET_SIZE);
    format!("[{phase}:({unit}:{line},{col})] at:... {snip} ...!\nMessage: {detail}")
}

/// Render a phase-tagged message with no source context.
pub fn bare_message(phase: Phase, unit: &str, detail: &str) -> String {
    format!("[{phase}:({unit})]!\nMessage: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_newlines() {
        let src = "ab\ncd\nef";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 1), (1, 2));
        assert_eq!(line_col(src, 3), (2, 1));
        assert_eq!(line_col(src, 7), (3, 2));
    }

    #[test]
    fn snippet_flattens_line_breaks() {
        let src = "first\nsecond\nthird";
        let s = snippet(src, 8, 10);
        assert!(!s.contains('\n'));
        assert!(s.contains("econd"));
    }

    #[test]
    fn message_format() {
        let src = "{{ a + }}";
        let msg = message(Phase::Parse, "__main__", src, 7, "unexpected token");
        assert!(msg.starts_with("[Parse:(__main__:1,8)] at:..."));
        assert!(msg.ends_with("Message: unexpected token"));
    }
}
