//! ACP (Agent Client Protocol) dialect.
//!
//! Newline-delimited JSON-RPC 2.0. The agent reports progress through
//! `session/update` notifications whose `sessionUpdate` kind selects the
//! canonical event: message chunks accumulate into one full message per
//! turn, thought chunks collapse to one `Thinking` per episode, tool calls
//! and updates map directly, and anything unrecognized degrades to `Status`.

use super::{DialectParser, LineBuffer, strip_message_markup};
use crate::event::{EventPayload, PlanEntry, Role, StreamEvent, ToolStatus};
use serde_json::Value;

pub struct AcpParser {
    lines: LineBuffer,
    /// Accumulated message text for the current turn.
    message: String,
    /// Role of the accumulating message.
    role: Role,
    /// Set while inside a thinking episode so repeated thought chunks
    /// produce a single event.
    thinking: bool,
}

impl Default for AcpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AcpParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            message: String::new(),
            role: Role::Assistant,
            thinking: false,
        }
    }

    /// Emit the accumulated message as one non-delta event, if any.
    fn flush_message(&mut self, out: &mut Vec<StreamEvent>) {
        if self.message.is_empty() {
            return;
        }
        let content = strip_message_markup(&std::mem::take(&mut self.message));
        if content.is_empty() {
            return;
        }
        out.push(StreamEvent::new(EventPayload::Message {
            role: self.role,
            content,
            delta: false,
        }));
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if line.trim().is_empty() {
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(line) else {
            // Malformed input is surfaced, never fatal.
            out.push(StreamEvent::new(EventPayload::Raw { text: line.into() }));
            return;
        };

        // RPC error responses become status events.
        if let Some(error) = value.get("error") {
            self.thinking = false;
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("rpc error")
                .to_string();
            out.push(StreamEvent::new(EventPayload::Status { message }));
            return;
        }

        // RPC success responses are discarded — except a turn-ending
        // response (stopReason present), which closes out the message
        // accumulator and reports completion.
        if let Some(result) = value.get("result") {
            if let Some(stop_reason) = result.get("stopReason").and_then(Value::as_str) {
                self.thinking = false;
                let result_text = strip_message_markup(&self.message);
                self.flush_message(out);
                out.push(StreamEvent::new(EventPayload::Completion {
                    result: result_text,
                    stop_reason: Some(stop_reason.to_string()),
                }));
            }
            return;
        }

        if value.get("method").and_then(Value::as_str) != Some("session/update") {
            // Requests from the agent (e.g. permission prompts) and unknown
            // methods are tolerated.
            if let Some(method) = value.get("method").and_then(Value::as_str) {
                if method == "session/request_permission" {
                    self.thinking = false;
                    let prompt = value
                        .pointer("/params/toolCall/title")
                        .and_then(Value::as_str)
                        .unwrap_or("the agent requested permission")
                        .to_string();
                    out.push(StreamEvent::new(EventPayload::Permission { prompt }));
                }
            }
            return;
        }

        let Some(update) = value.pointer("/params/update") else {
            return;
        };
        let kind = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or("");

        // Any non-thought update ends the current thinking episode.
        if kind != "agent_thought_chunk" {
            self.thinking = false;
        }

        match kind {
            "agent_message_chunk" | "user_message_chunk" => {
                let role = if kind == "user_message_chunk" {
                    Role::User
                } else {
                    Role::Assistant
                };
                // A role switch closes the previous accumulation.
                if role != self.role {
                    self.flush_message(out);
                    self.role = role;
                }
                let text = content_text(update.get("content")).unwrap_or_default();
                if !text.is_empty() {
                    self.message.push_str(&text);
                    out.push(StreamEvent::new(EventPayload::Message {
                        role,
                        content: text,
                        delta: true,
                    }));
                }
            }

            "agent_thought_chunk" => {
                if !self.thinking {
                    self.thinking = true;
                    out.push(StreamEvent::new(EventPayload::Thinking));
                }
            }

            "tool_call" => {
                let id = tool_call_id(update);
                let name = update
                    .get("title")
                    .or_else(|| update.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string();
                out.push(StreamEvent::new(EventPayload::ToolCall {
                    id,
                    name,
                    status: tool_status(update.get("status")).unwrap_or_default(),
                    output: content_text(update.get("content")),
                }));
            }

            "tool_call_update" => {
                out.push(StreamEvent::new(EventPayload::ToolUpdate {
                    id: tool_call_id(update),
                    status: tool_status(update.get("status")),
                    output: content_text(update.get("content")),
                }));
            }

            "plan" => {
                let entries = update
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|item| PlanEntry {
                                content: item
                                    .get("content")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                status: tool_status(item.get("status")).unwrap_or_default(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                out.push(StreamEvent::new(EventPayload::Plan { entries }));
            }

            // Unknown kinds are surfaced, never a parse failure.
            other => {
                out.push(StreamEvent::new(EventPayload::Status {
                    message: format!("session update: {other}"),
                }));
            }
        }
    }
}

impl DialectParser for AcpParser {
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
        self.flush_message(&mut out);
        self.thinking = false;
        out
    }
}

/// Pull the correlation id out of a tool update.
fn tool_call_id(update: &Value) -> String {
    update
        .get("toolCallId")
        .or_else(|| update.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn tool_status(value: Option<&Value>) -> Option<ToolStatus> {
    match value?.as_str()? {
        "pending" => Some(ToolStatus::Pending),
        "in_progress" => Some(ToolStatus::InProgress),
        "completed" => Some(ToolStatus::Completed),
        "failed" => Some(ToolStatus::Failed),
        _ => None,
    }
}

/// Extract plain text from an ACP content value — a single content block,
/// or an array of blocks, each either `{type:"text", text}` or a wrapper
/// `{type:"content", content:{…}}`.
fn content_text(value: Option<&Value>) -> Option<String> {
    let value = value?;
    let mut text = String::new();
    collect_text(value, &mut text);
    if text.is_empty() { None } else { Some(text) }
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get("text") {
                out.push_str(s);
            } else if let Some(inner) = map.get("content") {
                collect_text(inner, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_line(text: &str) -> String {
        format!(
            "{}\n",
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {"update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": text},
                }},
            })
        )
    }

    #[test]
    fn test_chunks_accumulate_into_one_message_on_flush() {
        let mut parser = AcpParser::new();
        parser.parse(&chunk_line("The answer is "));
        parser.parse(&chunk_line("4."));

        let events = parser.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload,
            EventPayload::Message {
                role: Role::Assistant,
                content: "The answer is 4.".into(),
                delta: false,
            }
        );
    }

    #[test]
    fn test_chunks_emit_deltas_while_accumulating() {
        let mut parser = AcpParser::new();
        let events = parser.parse(&chunk_line("partial"));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].payload,
            EventPayload::Message { delta: true, content, .. } if content == "partial"
        ));
    }

    #[test]
    fn test_turn_end_flushes_message_and_reports_completion() {
        let mut parser = AcpParser::new();
        parser.parse(&chunk_line("done"));
        let events = parser.parse(
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"stopReason\":\"end_turn\"}}\n",
        );

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].payload,
            EventPayload::Message { delta: false, content, .. } if content == "done"
        ));
        assert!(matches!(
            &events[1].payload,
            EventPayload::Completion { stop_reason: Some(r), .. } if r == "end_turn"
        ));

        // Nothing left to flush afterwards.
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn test_thinking_emitted_once_per_episode() {
        let thought = "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"update\":{\"sessionUpdate\":\"agent_thought_chunk\",\"content\":{\"type\":\"text\",\"text\":\"hm\"}}}}\n";
        let mut parser = AcpParser::new();

        let mut events = parser.parse(thought);
        events.extend(parser.parse(thought));
        events.extend(parser.parse(thought));
        let thinking = events
            .iter()
            .filter(|e| e.payload == EventPayload::Thinking)
            .count();
        assert_eq!(thinking, 1);

        // A message chunk resets the episode; a new thought starts another.
        parser.parse(&chunk_line("text"));
        let events = parser.parse(thought);
        assert_eq!(events[0].payload, EventPayload::Thinking);
    }

    #[test]
    fn test_tool_call_and_update() {
        let mut parser = AcpParser::new();
        let call = "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"update\":{\"sessionUpdate\":\"tool_call\",\"toolCallId\":\"call-1\",\"title\":\"Read file\",\"status\":\"pending\"}}}\n";
        let update = "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"update\":{\"sessionUpdate\":\"tool_call_update\",\"toolCallId\":\"call-1\",\"status\":\"completed\",\"content\":[{\"type\":\"content\",\"content\":{\"type\":\"text\",\"text\":\"contents\"}}]}}}\n";

        let events = parser.parse(&format!("{call}{update}"));
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].payload,
            EventPayload::ToolCall { id, name, status: ToolStatus::Pending, .. }
                if id == "call-1" && name == "Read file"
        ));
        assert!(matches!(
            &events[1].payload,
            EventPayload::ToolUpdate { id, status: Some(ToolStatus::Completed), output: Some(o) }
                if id == "call-1" && o == "contents"
        ));
    }

    #[test]
    fn test_malformed_lines_become_raw() {
        let mut parser = AcpParser::new();
        let events = parser.parse("not json at all\n{\"broken\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0].payload,
            EventPayload::Raw { text } if text == "not json at all"
        ));
    }

    #[test]
    fn test_unknown_update_kind_is_status() {
        let mut parser = AcpParser::new();
        let events = parser.parse("{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"update\":{\"sessionUpdate\":\"available_commands_update\"}}}\n");
        assert!(matches!(&events[0].payload, EventPayload::Status { .. }));
    }

    #[test]
    fn test_rpc_error_becomes_status() {
        let mut parser = AcpParser::new();
        let events = parser
            .parse("{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32601,\"message\":\"method not found\"}}\n");
        assert!(matches!(
            &events[0].payload,
            EventPayload::Status { message } if message == "method not found"
        ));
    }

    #[test]
    fn test_rpc_success_without_stop_reason_discarded() {
        let mut parser = AcpParser::new();
        let events = parser.parse("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"sessionId\":\"s1\"}}\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_plan_entries() {
        let mut parser = AcpParser::new();
        let events = parser.parse("{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"update\":{\"sessionUpdate\":\"plan\",\"entries\":[{\"content\":\"read code\",\"status\":\"pending\"},{\"content\":\"write fix\",\"status\":\"pending\"}]}}}\n");
        assert!(matches!(
            &events[0].payload,
            EventPayload::Plan { entries } if entries.len() == 2 && entries[0].content == "read code"
        ));
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let input = format!(
            "{}{}{}",
            chunk_line("a"),
            "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"update\":{\"sessionUpdate\":\"agent_thought_chunk\",\"content\":{\"type\":\"text\",\"text\":\"hm\"}}}}\n",
            chunk_line("b"),
        );

        let mut whole = AcpParser::new();
        let mut expected = whole.parse(&input);
        expected.extend(whole.flush());

        for split in 1..input.len() - 1 {
            if !input.is_char_boundary(split) {
                continue;
            }
            let mut parser = AcpParser::new();
            let mut events = parser.parse(&input[..split]);
            events.extend(parser.parse(&input[split..]));
            events.extend(parser.flush());

            let payloads: Vec<_> = events.into_iter().map(|e| e.payload).collect();
            let expected_payloads: Vec<_> = expected.iter().map(|e| e.payload.clone()).collect();
            assert_eq!(payloads, expected_payloads, "split at byte {split}");
        }
    }
}
