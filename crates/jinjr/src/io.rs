//! The output sink rendered text is written into.
//!
//! Two shapes: wrap any `std::io::Write` (file, socket, stdout) or collect
//! into an in-memory buffer that the caller can read back or detach.
//! Render output is best-effort: write failures do not abort a render, and
//! partial output is never reverted.

use std::fmt;
use std::io::Write;

enum Sink {
    Writer(Box<dyn Write>),
    Memory(String),
}

/// An output sink.
pub struct Output {
    sink: Sink,
}

impl Output {
    /// Wrap an existing writer (file handle, stdout, ...).
    pub fn writer(w: impl Write + 'static) -> Self {
        Self {
            sink: Sink::Writer(Box::new(w)),
        }
    }

    /// Collect output in memory.
    pub fn memory() -> Self {
        Self {
            sink: Sink::Memory(String::new()),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        match &mut self.sink {
            Sink::Writer(w) => {
                let _ = w.write_all(bytes);
            }
            Sink::Memory(buf) => buf.push_str(&String::from_utf8_lossy(bytes)),
        }
    }

    pub fn write_str(&mut self, s: &str) {
        match &mut self.sink {
            Sink::Writer(w) => {
                let _ = w.write_all(s.as_bytes());
            }
            Sink::Memory(buf) => buf.push_str(s),
        }
    }

    /// Formatted write; lets callers use `write!(out, ...)`.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) {
        self.write_str(&args.to_string());
    }

    pub fn flush(&mut self) {
        if let Sink::Writer(w) = &mut self.sink {
            let _ = w.flush();
        }
    }

    /// The collected text of a memory sink.
    pub fn content(&self) -> Option<&str> {
        match &self.sink {
            Sink::Memory(buf) => Some(buf),
            Sink::Writer(_) => None,
        }
    }

    /// Take ownership of a memory sink's buffer.
    pub fn detach(self) -> Option<String> {
        match self.sink {
            Sink::Memory(buf) => Some(buf),
            Sink::Writer(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects_and_detaches() {
        let mut out = Output::memory();
        out.write_str("hello ");
        out.write(b"world");
        write!(out, " {}", 42);
        assert_eq!(out.content(), Some("hello world 42"));
        assert_eq!(out.detach().unwrap(), "hello world 42");
    }

    #[test]
    fn writer_sink_passes_through() {
        let buf: Vec<u8> = Vec::new();
        let mut out = Output::writer(std::io::Cursor::new(buf));
        out.write_str("data");
        out.flush();
        assert!(out.content().is_none());
    }
}
