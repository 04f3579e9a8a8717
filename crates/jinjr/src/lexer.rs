//! Dual-mode tokenizer for template source.
//!
//! Template mode produces raw `Text` chunks and the open delimiters `{%`,
//! `{{`; comments `{# ... #}` are consumed here and never reach the parser.
//! Seeing an open delimiter switches to script mode, which produces
//! keywords, identifiers, literals and operators until the matching close
//! delimiter switches back.
//!
//! Whitespace control: when a delimiter pair is the only non-whitespace
//! content on its line, the leading whitespace of that line plus the
//! preceding line break are trimmed from the text before it, and the
//! whitespace between the close delimiter and the line break after it is
//! trimmed from the text that follows. Text sharing a line with a delimiter
//! is preserved exactly. The rule applies uniformly to `{% %}`, `{{ }}` and
//! `{# #}`.

use crate::diagnostic::{self, Phase, Span};
use crate::error::{Error, Result};

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Raw template text (already whitespace-controlled).
    Text(String),
    /// `{%`
    LStmt,
    /// `%}` (also produced by `-%}`)
    RStmt,
    /// `{{`
    LExp,
    /// `}}`
    RExp,

    Ident(String),
    Str(String),
    Num(f64),

    // Keywords
    For,
    EndFor,
    If,
    Elif,
    Else,
    EndIf,
    Macro,
    EndMacro,
    Call,
    EndCall,
    Filter,
    EndFilter,
    Do,
    Set,
    EndSet,
    With,
    EndWith,
    Move,
    Block,
    EndBlock,
    Extends,
    Import,
    EndImport,
    Include,
    EndInclude,
    From,
    In,
    As,
    Recursive,
    Continue,
    Break,
    Upvalue,
    EndUpvalue,
    Json,
    Override,
    Fix,
    True,
    False,
    None,
    And,
    Or,
    Not,
    Is,
    /// `is not`
    IsNot,
    /// `not in`
    NotIn,

    // Operators
    Add,
    Sub,
    Mul,
    Div,
    DivTrunc,
    Mod,
    Pow,
    EqOp,
    NeOp,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Pipe,
    Dot,
    Comma,
    Colon,
    Semicolon,
    Question,
    /// `#`, the length operator.
    LenOp,
    /// `~`, string concatenation.
    Cat,
    LPar,
    RPar,
    LSqr,
    RSqr,
    LBra,
    RBra,

    Eof,
}

impl Tok {
    /// Display name used in error messages.
    pub fn name(&self) -> String {
        match self {
            Tok::Text(_) => "<text>".into(),
            Tok::LStmt => "{%".into(),
            Tok::RStmt => "%}".into(),
            Tok::LExp => "{{".into(),
            Tok::RExp => "}}".into(),
            Tok::Ident(s) => format!("identifier '{s}'"),
            Tok::Str(_) => "<string>".into(),
            Tok::Num(_) => "<number>".into(),
            Tok::Eof => "<eof>".into(),
            Tok::IsNot => "is not".into(),
            Tok::NotIn => "not in".into(),
            other => format!("{other:?}").to_lowercase(),
        }
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Template,
    Script,
}

/// The tokenizer. `tok`/`span` describe the current token; [`Lexer::advance`]
/// moves to the next one.
pub struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    /// Compilation unit name for diagnostics.
    unit: String,
    pos: usize,
    mode: Mode,
    /// Trim whitespace after the close delimiter of the current tag.
    trim_after_close: bool,
    /// Open delimiter held back while the preceding text token goes out.
    pending_open: Option<Tok>,
    /// Raw-block content held back while the preceding text token goes out.
    pending_raw: Option<String>,
    pub tok: Tok,
    pub span: Span,
}

impl<'a> Lexer<'a> {
    pub fn new(unit: impl Into<String>, src: &'a str) -> Result<Self> {
        let mut lex = Self {
            src,
            bytes: src.as_bytes(),
            unit: unit.into(),
            pos: 0,
            mode: Mode::Template,
            trim_after_close: false,
            pending_open: None,
            pending_raw: None,
            tok: Tok::Eof,
            span: Span::at(0),
        };
        lex.advance()?;
        Ok(lex)
    }

    pub fn offset(&self) -> usize {
        self.span.start
    }

    fn fail(&self, at: usize, detail: &str) -> Error {
        Error::Lex(diagnostic::message(Phase::Lex, &self.unit, self.src, at, detail))
    }

    /// Move to the next token.
    pub fn advance(&mut self) -> Result<()> {
        // Delimiter tokens flip the mode before the next token is read.
        match self.tok {
            Tok::LStmt | Tok::LExp => self.mode = Mode::Script,
            Tok::RStmt | Tok::RExp => {
                self.mode = Mode::Template;
                if self.trim_after_close {
                    self.trim_after_close = false;
                    self.skip_line_padding();
                }
            }
            _ => {}
        }
        // Tokens held back behind a just-emitted text chunk.
        if let Some(open) = self.pending_open.take() {
            let at = self.pos;
            self.pos += 2;
            self.set(open, at);
            return Ok(());
        }
        if let Some(raw) = self.pending_raw.take() {
            let at = self.pos;
            self.set(Tok::Text(raw), at);
            return Ok(());
        }
        match self.mode {
            Mode::Template => self.lex_template(),
            Mode::Script => self.lex_script(),
        }
    }

    /// Skip spaces and tabs; the line break stays.
    fn skip_line_padding(&mut self) {
        while let Some(&c) = self.bytes.get(self.pos) {
            if c == b' ' || c == b'\t' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Template mode
    // -----------------------------------------------------------------------

    fn lex_template(&mut self) -> Result<()> {
        let start = self.pos;
        let mut text = String::new();
        loop {
            let Some(&c) = self.bytes.get(self.pos) else {
                if text.is_empty() {
                    self.set(Tok::Eof, start);
                } else {
                    self.set(Tok::Text(text), start);
                }
                return Ok(());
            };
            if c == b'{' {
                match self.bytes.get(self.pos + 1) {
                    Some(b'#') => {
                        self.finish_comment(&mut text)?;
                        continue;
                    }
                    Some(b'%') => {
                        if let Some(inner) = self.try_raw_block()? {
                            // Raw content becomes its own text token; flush
                            // pending text first and hold the content back.
                            if inner.is_empty() {
                                continue;
                            }
                            if !text.is_empty() {
                                self.pending_raw = Some(inner);
                                self.set(Tok::Text(text), start);
                                return Ok(());
                            }
                            self.set(Tok::Text(inner), start);
                            return Ok(());
                        }
                        return self.open_tag(start, text, Tok::LStmt);
                    }
                    Some(b'{') => {
                        return self.open_tag(start, text, Tok::LExp);
                    }
                    _ => {}
                }
            }
            if c == b'\\'
                && let Some(&next) = self.bytes.get(self.pos + 1)
                && matches!(next, b'{' | b'}' | b'\\')
            {
                text.push(next as char);
                self.pos += 2;
                continue;
            }
            // Advance one full character.
            let ch_len = utf8_len(c);
            text.push_str(&self.src[self.pos..self.pos + ch_len]);
            self.pos += ch_len;
        }
    }

    /// Emit the open-delimiter token (flushing pending text first), applying
    /// the whitespace-control rule.
    fn open_tag(&mut self, text_start: usize, mut text: String, open: Tok) -> Result<()> {
        let open_pos = self.pos;
        let close = if open == Tok::LStmt { CloseKind::Stmt } else { CloseKind::Exp };
        let standalone = self.standalone(open_pos, close);
        if standalone {
            trim_trailing_line(&mut text);
            self.trim_after_close = true;
        }
        if text.is_empty() {
            self.pos += 2;
            self.set(open, open_pos);
        } else {
            // Return the text now; the delimiter comes out on the next call.
            self.set(Tok::Text(text), text_start);
            self.pending_open = Some(open);
        }
        Ok(())
    }

    /// Consume a `{# ... #}` comment, applying whitespace control to the
    /// surrounding text.
    fn finish_comment(&mut self, text: &mut String) -> Result<()> {
        let open_pos = self.pos;
        let Some(end) = find_from(self.bytes, self.pos + 2, b"#}") else {
            return Err(self.fail(open_pos, "unterminated comment"));
        };
        let close_end = end + 2;
        if self.standalone_between(open_pos, close_end) {
            trim_trailing_line(text);
            self.pos = close_end;
            self.skip_line_padding();
        } else {
            self.pos = close_end;
        }
        Ok(())
    }

    /// Detect and consume `{% raw %} ... {% endraw %}`, returning the inner
    /// bytes verbatim. Returns `None` when the tag at `pos` is not `raw`.
    fn try_raw_block(&mut self) -> Result<Option<String>> {
        let Some(body_start) = self.match_bare_tag(self.pos, "raw") else {
            return Ok(None);
        };
        let mut i = body_start;
        loop {
            let Some(open) = find_from(self.bytes, i, b"{%") else {
                return Err(self.fail(self.pos, "missing {% endraw %}"));
            };
            if let Some(after) = self.match_bare_tag(open, "endraw") {
                let inner = self.src[body_start..open].to_string();
                self.pos = after;
                return Ok(Some(inner));
            }
            i = open + 2;
        }
    }

    /// Match `{% <word> %}` with only whitespace around the word; returns the
    /// position just past `%}`.
    fn match_bare_tag(&self, at: usize, word: &str) -> Option<usize> {
        let b = self.bytes;
        if b.get(at) != Some(&b'{') || b.get(at + 1) != Some(&b'%') {
            return None;
        }
        let mut i = at + 2;
        while matches!(b.get(i), Some(b' ') | Some(b'\t')) {
            i += 1;
        }
        if !self.src[i..].starts_with(word) {
            return None;
        }
        i += word.len();
        if b.get(i).copied().is_some_and(is_ident_char) {
            return None;
        }
        while matches!(b.get(i), Some(b' ') | Some(b'\t')) {
            i += 1;
        }
        if b.get(i) == Some(&b'%') && b.get(i + 1) == Some(&b'}') {
            Some(i + 2)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Whitespace-control helpers
    // -----------------------------------------------------------------------

    /// Whether the delimiter pair opening at `open_pos` sits alone on its
    /// line (only whitespace before it and after its close delimiter).
    fn standalone(&self, open_pos: usize, close: CloseKind) -> bool {
        let Some(close_end) = self.scan_close(open_pos + 2, close) else {
            return false;
        };
        self.standalone_between(open_pos, close_end)
    }

    fn standalone_between(&self, open_pos: usize, close_end: usize) -> bool {
        // Backward: only spaces/tabs between line start and the delimiter.
        let before = &self.bytes[..open_pos];
        let line_start = before
            .iter()
            .rposition(|&c| c == b'\n')
            .map(|p| p + 1)
            .unwrap_or(0);
        if !before[line_start..].iter().all(|&c| c == b' ' || c == b'\t') {
            return false;
        }
        // Forward: only spaces/tabs until the line break or EOF.
        let mut i = close_end;
        while let Some(&c) = self.bytes.get(i) {
            match c {
                b' ' | b'\t' => i += 1,
                b'\n' => return true,
                b'\r' => i += 1,
                _ => return false,
            }
        }
        true
    }

    /// Find the end (position past the close delimiter) of the tag whose
    /// script part starts at `from`. Skips quoted strings; for `}}` tracks
    /// brace depth so dict literals inside expressions do not end the scan.
    fn scan_close(&self, from: usize, close: CloseKind) -> Option<usize> {
        let b = self.bytes;
        let mut depth = 0i32;
        let mut i = from;
        while i < b.len() {
            match b[i] {
                b'\'' => {
                    i += 1;
                    while i < b.len() && b[i] != b'\'' {
                        if b[i] == b'\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                }
                b'{' => depth += 1,
                b'}' if close == CloseKind::Exp => {
                    if depth == 0 && b.get(i + 1) == Some(&b'}') {
                        return Some(i + 2);
                    }
                    depth -= 1;
                }
                b'%' if close == CloseKind::Stmt => {
                    if b.get(i + 1) == Some(&b'}') {
                        return Some(i + 2);
                    }
                }
                b'-' if close == CloseKind::Stmt => {
                    if b.get(i + 1) == Some(&b'%') && b.get(i + 2) == Some(&b'}') {
                        return Some(i + 3);
                    }
                }
                _ => {}
            }
            i += 1;
        }
        None
    }

    // -----------------------------------------------------------------------
    // Script mode
    // -----------------------------------------------------------------------

    fn lex_script(&mut self) -> Result<()> {
        // Skip whitespace.
        while let Some(&c) = self.bytes.get(self.pos) {
            if matches!(c, b' ' | b'\t' | b'\r' | b'\n') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let at = self.pos;
        let Some(&c) = self.bytes.get(self.pos) else {
            return Err(self.fail(at, "unexpected end of input inside a tag"));
        };

        macro_rules! tok {
            ($t:expr, $len:expr) => {{
                self.pos += $len;
                self.set($t, at);
                return Ok(());
            }};
        }

        match c {
            b'%' => {
                if self.bytes.get(self.pos + 1) == Some(&b'}') {
                    tok!(Tok::RStmt, 2);
                }
                tok!(Tok::Mod, 1);
            }
            b'-' => {
                // -%} closes a statement like %}.
                if self.bytes.get(self.pos + 1) == Some(&b'%')
                    && self.bytes.get(self.pos + 2) == Some(&b'}')
                {
                    tok!(Tok::RStmt, 3);
                }
                tok!(Tok::Sub, 1);
            }
            b'+' => tok!(Tok::Add, 1),
            b'*' => {
                if self.bytes.get(self.pos + 1) == Some(&b'*') {
                    tok!(Tok::Pow, 2);
                }
                tok!(Tok::Mul, 1);
            }
            b'/' => {
                if self.bytes.get(self.pos + 1) == Some(&b'/') {
                    tok!(Tok::DivTrunc, 2);
                }
                tok!(Tok::Div, 1);
            }
            b'=' => {
                if self.bytes.get(self.pos + 1) == Some(&b'=') {
                    tok!(Tok::EqOp, 2);
                }
                tok!(Tok::Assign, 1);
            }
            b'!' => {
                if self.bytes.get(self.pos + 1) == Some(&b'=') {
                    tok!(Tok::NeOp, 2);
                }
                return Err(self.fail(at, "unknown token '!'"));
            }
            b'<' => {
                if self.bytes.get(self.pos + 1) == Some(&b'=') {
                    tok!(Tok::Le, 2);
                }
                tok!(Tok::Lt, 1);
            }
            b'>' => {
                if self.bytes.get(self.pos + 1) == Some(&b'=') {
                    tok!(Tok::Ge, 2);
                }
                tok!(Tok::Gt, 1);
            }
            b'|' => tok!(Tok::Pipe, 1),
            b'(' => tok!(Tok::LPar, 1),
            b')' => tok!(Tok::RPar, 1),
            b'[' => tok!(Tok::LSqr, 1),
            b']' => tok!(Tok::RSqr, 1),
            b'{' => tok!(Tok::LBra, 1),
            b'}' => {
                if self.bytes.get(self.pos + 1) == Some(&b'}') {
                    tok!(Tok::RExp, 2);
                }
                tok!(Tok::RBra, 1);
            }
            b'.' => tok!(Tok::Dot, 1),
            b',' => tok!(Tok::Comma, 1),
            b':' => tok!(Tok::Colon, 1),
            b';' => tok!(Tok::Semicolon, 1),
            b'?' => tok!(Tok::Question, 1),
            b'#' => tok!(Tok::LenOp, 1),
            b'~' => tok!(Tok::Cat, 1),
            b'\'' => return self.lex_string(at),
            b'0'..=b'9' => return self.lex_number(at),
            c if is_ident_start(c) => return self.lex_word(at),
            _ => Err(self.fail(at, &format!("unknown character '{}'", c as char))),
        }
    }

    fn lex_string(&mut self, at: usize) -> Result<()> {
        let mut out = String::new();
        let mut i = at + 1;
        loop {
            let Some(&c) = self.bytes.get(i) else {
                return Err(self.fail(at, "unterminated string literal"));
            };
            match c {
                b'\'' => break,
                b'\\' => {
                    let esc = self.bytes.get(i + 1).copied();
                    match esc {
                        Some(b'n') => out.push('\n'),
                        Some(b't') => out.push('\t'),
                        Some(b'r') => out.push('\r'),
                        Some(b'\\') => out.push('\\'),
                        Some(b'\'') => out.push('\''),
                        Some(b'0') => out.push('\0'),
                        Some(other) => {
                            out.push('\\');
                            out.push(other as char);
                        }
                        None => return Err(self.fail(at, "unterminated string literal")),
                    }
                    i += 2;
                    continue;
                }
                _ => {
                    let len = utf8_len(c);
                    out.push_str(&self.src[i..i + len]);
                    i += len;
                }
            }
        }
        self.pos = i + 1;
        self.set(Tok::Str(out), at);
        Ok(())
    }

    fn lex_number(&mut self, at: usize) -> Result<()> {
        let mut i = at;
        while self.bytes.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
        if self.bytes.get(i) == Some(&b'.') && self.bytes.get(i + 1).is_some_and(u8::is_ascii_digit)
        {
            i += 1;
            while self.bytes.get(i).is_some_and(u8::is_ascii_digit) {
                i += 1;
            }
        }
        if matches!(self.bytes.get(i), Some(b'e') | Some(b'E')) {
            let mut j = i + 1;
            if matches!(self.bytes.get(j), Some(b'+') | Some(b'-')) {
                j += 1;
            }
            if self.bytes.get(j).is_some_and(u8::is_ascii_digit) {
                i = j;
                while self.bytes.get(i).is_some_and(u8::is_ascii_digit) {
                    i += 1;
                }
            }
        }
        let text = &self.src[at..i];
        let n: f64 = text
            .parse()
            .map_err(|_| self.fail(at, &format!("malformed number '{text}'")))?;
        self.pos = i;
        self.set(Tok::Num(n), at);
        Ok(())
    }

    fn lex_word(&mut self, at: usize) -> Result<()> {
        let mut i = at;
        while self.bytes.get(i).copied().is_some_and(is_ident_char) {
            i += 1;
        }
        let word = &self.src[at..i];
        self.pos = i;

        let tok = match word {
            "for" => Tok::For,
            "endfor" => Tok::EndFor,
            "if" => Tok::If,
            "elif" => Tok::Elif,
            "else" => Tok::Else,
            "endif" => Tok::EndIf,
            "macro" => Tok::Macro,
            "endmacro" => Tok::EndMacro,
            "call" => Tok::Call,
            "endcall" => Tok::EndCall,
            "filter" => Tok::Filter,
            "endfilter" => Tok::EndFilter,
            "do" => Tok::Do,
            "set" => Tok::Set,
            "endset" => Tok::EndSet,
            "with" => Tok::With,
            "endwith" => Tok::EndWith,
            "move" => Tok::Move,
            "block" => Tok::Block,
            "endblock" => Tok::EndBlock,
            "extends" => Tok::Extends,
            "import" => Tok::Import,
            "endimport" => Tok::EndImport,
            "include" => Tok::Include,
            "endinclude" => Tok::EndInclude,
            "from" => Tok::From,
            "in" => Tok::In,
            "as" => Tok::As,
            "recursive" => Tok::Recursive,
            "continue" => Tok::Continue,
            "break" => Tok::Break,
            "upvalue" => Tok::Upvalue,
            "endupvalue" => Tok::EndUpvalue,
            "json" => Tok::Json,
            "override" => Tok::Override,
            "fix" => Tok::Fix,
            "true" | "True" => Tok::True,
            "false" | "False" => Tok::False,
            "none" | "None" => Tok::None,
            "and" => Tok::And,
            "or" => Tok::Or,
            "not" => {
                // `not in` fuses into a single operator.
                if self.peek_word() == Some("in") {
                    self.consume_word("in");
                    self.set(Tok::NotIn, at);
                    return Ok(());
                }
                Tok::Not
            }
            "is" => {
                // `is not` fuses into a single operator.
                if self.peek_word() == Some("not") {
                    self.consume_word("not");
                    self.set(Tok::IsNot, at);
                    return Ok(());
                }
                Tok::Is
            }
            _ => Tok::Ident(word.to_string()),
        };
        self.set(tok, at);
        Ok(())
    }

    /// Peek the next identifier-shaped word after whitespace, without
    /// consuming anything.
    fn peek_word(&self) -> Option<&str> {
        let mut i = self.pos;
        while matches!(self.bytes.get(i), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            i += 1;
        }
        let start = i;
        while self.bytes.get(i).copied().is_some_and(is_ident_char) {
            i += 1;
        }
        if i > start { Some(&self.src[start..i]) } else { Option::None }
    }

    fn consume_word(&mut self, word: &str) {
        while matches!(
            self.bytes.get(self.pos),
            Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')
        ) {
            self.pos += 1;
        }
        debug_assert!(self.src[self.pos..].starts_with(word));
        self.pos += word.len();
    }

    fn set(&mut self, tok: Tok, start: usize) {
        self.span = Span::new(start, self.pos);
        self.tok = tok;
    }

    /// Whether the current statement tag ends with the `recursive` flag.
    ///
    /// The parser needs this before it has parsed the loop filter (the flag
    /// decides how the body is compiled), so it peeks at the raw source up
    /// to the closing delimiter.
    pub fn stmt_ends_with_recursive(&self) -> bool {
        let Some(close) = self.scan_close(self.pos, CloseKind::Stmt) else {
            return false;
        };
        let mut tail = &self.src[self.pos..close];
        if let Some(t) = tail.strip_suffix("%}") {
            tail = t;
        }
        if let Some(t) = tail.strip_suffix('-') {
            tail = t;
        }
        let tail = tail.trim_end();
        tail.ends_with("recursive")
            && !tail[..tail.len() - "recursive".len()]
                .ends_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum CloseKind {
    Stmt,
    Exp,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

/// Find `needle` in `haystack` starting at `from`.
fn find_from(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Remove the trailing `\n` (and the whitespace after it) from `text`,
/// implementing the leading side of the whitespace-control rule.
fn trim_trailing_line(text: &mut String) {
    let trimmed_len = text.trim_end_matches([' ', '\t']).len();
    text.truncate(trimmed_len);
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        let mut lex = Lexer::new("test", src).unwrap();
        let mut out = Vec::new();
        while lex.tok != Tok::Eof {
            out.push(lex.tok.clone());
            lex.advance().unwrap();
        }
        out
    }

    #[test]
    fn text_and_expression() {
        let t = toks("hello {{ name }}!");
        assert_eq!(
            t,
            vec![
                Tok::Text("hello ".into()),
                Tok::LExp,
                Tok::Ident("name".into()),
                Tok::RExp,
                Tok::Text("!".into()),
            ]
        );
    }

    #[test]
    fn keywords_need_a_word_boundary() {
        let t = toks("{% set iffy = 1 %}");
        assert_eq!(
            t,
            vec![
                Tok::LStmt,
                Tok::Set,
                Tok::Ident("iffy".into()),
                Tok::Assign,
                Tok::Num(1.0),
                Tok::RStmt,
            ]
        );
    }

    #[test]
    fn fused_operators() {
        let t = toks("{% if a is not b and c not in d %}{% endif %}");
        assert!(t.contains(&Tok::IsNot));
        assert!(t.contains(&Tok::NotIn));
    }

    #[test]
    fn operators_and_literals() {
        let t = toks("{{ 1 + 2.5 * 'x\\n' ** 2 // 3 }}");
        assert_eq!(
            t,
            vec![
                Tok::LExp,
                Tok::Num(1.0),
                Tok::Add,
                Tok::Num(2.5),
                Tok::Mul,
                Tok::Str("x\n".into()),
                Tok::Pow,
                Tok::Num(2.0),
                Tok::DivTrunc,
                Tok::Num(3.0),
                Tok::RExp,
            ]
        );
    }

    #[test]
    fn comments_are_consumed() {
        let t = toks("a{# nothing to see #}b");
        assert_eq!(t, vec![Tok::Text("a".into()), Tok::Text("b".into())]);
    }

    #[test]
    fn standalone_tag_eats_its_line() {
        let t = toks("a\n  {% if x %}\nb\n{% endif %}\n");
        // The tag lines disappear: text around them keeps single breaks.
        assert_eq!(t[0], Tok::Text("a".into()));
        let texts: Vec<&Tok> = t.iter().filter(|t| matches!(t, Tok::Text(_))).collect();
        assert_eq!(texts[1], &Tok::Text("\nb".into()));
    }

    #[test]
    fn inline_tag_preserves_text() {
        let t = toks("a {% if x %} b");
        assert_eq!(t[0], Tok::Text("a ".into()));
        assert_eq!(t.last().unwrap(), &Tok::Text(" b".into()));
    }

    #[test]
    fn raw_block_is_verbatim() {
        let t = toks("x{% raw %}{{ not parsed }}{% endraw %}y");
        assert_eq!(
            t,
            vec![
                Tok::Text("x".into()),
                Tok::Text("{{ not parsed }}".into()),
                Tok::Text("y".into()),
            ]
        );
    }

    #[test]
    fn empty_raw_block_yields_no_token() {
        let t = toks("x{% raw %}{% endraw %}y");
        assert_eq!(t, vec![Tok::Text("x".into()), Tok::Text("y".into())]);
    }

    #[test]
    fn dash_close_is_accepted() {
        let t = toks("{% set a = 1 -%}");
        assert_eq!(*t.last().unwrap(), Tok::RStmt);
    }

    #[test]
    fn escaped_delimiters_render_literally() {
        let t = toks(r"\{{ literal \}}");
        assert_eq!(t, vec![Tok::Text("{{ literal }}".into())]);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut lex = Lexer::new("test", "{{ 'oops }}").unwrap();
        let mut err = Option::None;
        for _ in 0..8 {
            if let Err(e) = lex.advance() {
                err = Some(e);
                break;
            }
            if lex.tok == Tok::Eof {
                break;
            }
        }
        let msg = err.expect("expected a lex error").to_string();
        assert!(msg.contains("[Lex:"), "{msg}");
    }
}
