//! Dialect parsers.
//!
//! Each supported agent CLI speaks its own stdout dialect. A parser consumes
//! raw text chunks (arbitrary byte boundaries) and emits canonical
//! [`StreamEvent`](crate::event::StreamEvent)s. Parsers are incremental:
//! partial lines are carried across calls, and `flush()` drains whatever is
//! left at process exit.
//!
//! Parsers never fail. Lines that cannot be interpreted degrade to `Raw`
//! events; unknown structured updates degrade to `Status`.

mod acp;
mod jsonrpc;
mod ndjson;
mod text;

pub use acp::AcpParser;
pub use jsonrpc::StreamJsonRpcParser;
pub use ndjson::NdjsonParser;
pub use text::TextParser;

use crate::event::StreamEvent;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// The stdout dialect of one agent family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    /// Newline-delimited JSON-RPC 2.0, Agent Client Protocol framing.
    Acp,
    /// Newline-delimited JSON event objects (claude stream-json style).
    Ndjson,
    /// Custom JSON-RPC-shaped notification frames (droid style).
    StreamJsonRpc,
    /// Unstructured text; every line is surfaced verbatim.
    Text,
}

impl Dialect {
    /// Construct a fresh parser for this dialect.
    #[must_use]
    pub fn parser(self) -> Box<dyn DialectParser> {
        match self {
            Self::Acp => Box::new(AcpParser::new()),
            Self::Ndjson => Box::new(NdjsonParser::new()),
            Self::StreamJsonRpc => Box::new(StreamJsonRpcParser::new()),
            Self::Text => Box::new(TextParser::new()),
        }
    }
}

/// Incremental parser for one agent's output stream.
pub trait DialectParser: Send {
    /// Consume a raw chunk and return any completed events.
    ///
    /// Must never panic for any UTF-8 input.
    fn parse(&mut self, chunk: &str) -> Vec<StreamEvent>;

    /// Drain accumulated partial state at end of stream.
    fn flush(&mut self) -> Vec<StreamEvent>;
}

/// Carry-over buffer that yields only complete newline-terminated lines.
///
/// Text arrives at arbitrary byte boundaries; the tail past the last newline
/// is held for the next call.
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: String,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the complete lines it closed, without
    /// trailing newlines.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.carry.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(idx) = self.carry.find('\n') {
            let mut line: String = self.carry.drain(..=idx).collect();
            line.pop(); // the '\n'
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Take the unterminated remainder, if any.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.carry))
        }
    }
}

/// Strip agent-specific markup that leaks into message content.
///
/// Some CLIs echo their tool-call frames as XML inside the assistant text
/// (`<tool_call>…</tool_call>`). Presentation safety only: applied as a
/// final pass over accumulated message text, never to raw lines.
#[must_use]
pub fn strip_message_markup(text: &str) -> String {
    markup_regex().replace_all(text, "").trim_end().to_string()
}

#[allow(clippy::unwrap_used)] // pattern is a compile-time constant
fn markup_regex() -> &'static Regex {
    static MARKUP: OnceLock<Regex> = OnceLock::new();
    MARKUP.get_or_init(|| {
        Regex::new(
            r"(?s)<(tool_call|tool_result|function_calls?)>.*?</(tool_call|tool_result|function_calls?)>\n?",
        )
        .unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_arbitrary_boundaries() {
        let mut buf = LineBuffer::new();
        assert!(buf.push("hel").is_empty());
        assert_eq!(buf.push("lo\nwor"), vec!["hello"]);
        assert_eq!(buf.push("ld\n"), vec!["world"]);
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn test_line_buffer_crlf() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push("one\r\ntwo\n"), vec!["one", "two"]);
    }

    #[test]
    fn test_line_buffer_remainder() {
        let mut buf = LineBuffer::new();
        buf.push("partial");
        assert_eq!(buf.take_remainder().as_deref(), Some("partial"));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn test_line_buffer_multiple_lines_one_chunk() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push("a\nb\nc\n"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_strip_message_markup() {
        let text = "Here you go.\n<tool_call>{\"name\":\"ls\"}</tool_call>\nDone.";
        assert_eq!(strip_message_markup(text), "Here you go.\n\nDone.");

        // Text without markup passes through (modulo trailing whitespace).
        assert_eq!(strip_message_markup("plain answer\n"), "plain answer");
    }
}
