//! Plain-text dialect.
//!
//! No structure to recover: every completed line becomes a `Raw` event,
//! ANSI escapes stripped so downstream consumers see clean text.

use super::{DialectParser, LineBuffer};
use crate::event::{EventPayload, StreamEvent};

pub struct TextParser {
    lines: LineBuffer,
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TextParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
        }
    }

    fn raw_event(line: &str) -> StreamEvent {
        let text = String::from_utf8_lossy(&strip_ansi_escapes::strip(line)).into_owned();
        StreamEvent::new(EventPayload::Raw { text })
    }
}

impl DialectParser for TextParser {
    fn parse(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.lines
            .push(chunk)
            .iter()
            .map(|line| Self::raw_event(line))
            .collect()
    }

    fn flush(&mut self) -> Vec<StreamEvent> {
        self.lines
            .take_remainder()
            .map(|rest| vec![Self::raw_event(&rest)])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_line_is_raw() {
        let mut parser = TextParser::new();
        let events = parser.parse("starting up\nworking...\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].payload,
            EventPayload::Raw { text } if text == "starting up"
        ));
    }

    #[test]
    fn test_ansi_codes_are_stripped() {
        let mut parser = TextParser::new();
        let events = parser.parse("\x1b[32mdone\x1b[0m\n");
        assert!(matches!(
            &events[0].payload,
            EventPayload::Raw { text } if text == "done"
        ));
    }

    #[test]
    fn test_flush_drains_partial_line() {
        let mut parser = TextParser::new();
        assert!(parser.parse("no newline yet").is_empty());
        let events = parser.flush();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].payload,
            EventPayload::Raw { text } if text == "no newline yet"
        ));
    }
}
