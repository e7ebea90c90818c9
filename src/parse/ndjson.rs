//! NDJSON dialect (claude stream-json style).
//!
//! One JSON object per line: `assistant`/`user` turns carrying content
//! blocks, optional `stream_event` partials, a `system` init line, and a
//! final `result` line. Unlike ACP, full message text arrives in the
//! `assistant` lines, so no accumulation buffer is needed — partial
//! `stream_event` deltas are surfaced as delta messages for live display.

use super::{DialectParser, LineBuffer, strip_message_markup};
use crate::event::{EventPayload, Role, StreamEvent, ToolStatus};
use serde_json::Value;

pub struct NdjsonParser {
    lines: LineBuffer,
    thinking: bool,
}

impl Default for NdjsonParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NdjsonParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            thinking: false,
        }
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if line.trim().is_empty() {
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(line) else {
            out.push(StreamEvent::new(EventPayload::Raw { text: line.into() }));
            return;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => self.handle_turn(&value, Role::Assistant, out),
            Some("user") => self.handle_turn(&value, Role::User, out),

            Some("stream_event") => {
                // Partial text chunk; broadcast-only, the full message
                // follows in the assistant line.
                if let Some(text) = value
                    .pointer("/event/delta/text")
                    .or_else(|| value.pointer("/event/delta/partial_json"))
                    .and_then(Value::as_str)
                {
                    out.push(StreamEvent::new(EventPayload::Message {
                        role: Role::Assistant,
                        content: text.to_string(),
                        delta: true,
                    }));
                }
            }

            Some("result") => {
                self.thinking = false;
                let result = value
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let stop_reason = value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                out.push(StreamEvent::new(EventPayload::Completion {
                    result,
                    stop_reason,
                }));
            }

            Some("system") => {
                let subtype = value
                    .get("subtype")
                    .and_then(Value::as_str)
                    .unwrap_or("system");
                out.push(StreamEvent::new(EventPayload::Status {
                    message: format!("system: {subtype}"),
                }));
            }

            // Unknown event types are tolerated and surfaced.
            Some(other) => {
                out.push(StreamEvent::new(EventPayload::Status {
                    message: format!("event: {other}"),
                }));
            }

            None => {
                out.push(StreamEvent::new(EventPayload::Raw { text: line.into() }));
            }
        }
    }

    /// Map the content blocks of one conversational turn.
    fn handle_turn(&mut self, value: &Value, role: Role, out: &mut Vec<StreamEvent>) {
        let Some(blocks) = value.pointer("/message/content").and_then(Value::as_array) else {
            return;
        };

        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    self.thinking = false;
                    let content = strip_message_markup(
                        block.get("text").and_then(Value::as_str).unwrap_or_default(),
                    );
                    if !content.is_empty() {
                        out.push(StreamEvent::new(EventPayload::Message {
                            role,
                            content,
                            delta: false,
                        }));
                    }
                }

                Some("thinking") => {
                    if !self.thinking {
                        self.thinking = true;
                        out.push(StreamEvent::new(EventPayload::Thinking));
                    }
                }

                Some("tool_use") => {
                    self.thinking = false;
                    out.push(StreamEvent::new(EventPayload::ToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("tool")
                            .to_string(),
                        status: ToolStatus::InProgress,
                        output: None,
                    }));
                }

                Some("tool_result") => {
                    self.thinking = false;
                    let failed = block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    out.push(StreamEvent::new(EventPayload::ToolUpdate {
                        id: block
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        status: Some(if failed {
                            ToolStatus::Failed
                        } else {
                            ToolStatus::Completed
                        }),
                        output: tool_result_text(block.get("content")),
                    }));
                }

                _ => {}
            }
        }
    }
}

impl DialectParser for NdjsonParser {
    fn parse(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for line in self.lines.push(chunk) {
            self.handle_line(&line, &mut out);
        }
        out
    }

    fn flush(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if let Some(rest) = self.lines.take_remainder() {
            self.handle_line(&rest, &mut out);
        }
        self.thinking = false;
        out
    }
}

/// Tool results carry either a plain string or a list of text blocks.
fn tool_result_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let text: String = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() { None } else { Some(text) }
        }
        _ => None,
    }
}
