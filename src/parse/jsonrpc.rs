//! Custom stream-jsonrpc dialect (droid style).
//!
//! JSON-RPC-shaped notification frames, one per line, with a flat `agent.*`
//! method namespace instead of ACP's `session/update` demultiplexing.
//! Message text may arrive chunked (`delta: true`) and is accumulated the
//! same way the ACP parser does it.

use super::{DialectParser, LineBuffer, strip_message_markup};
use crate::event::{EventPayload, PlanEntry, Role, StreamEvent, ToolStatus};
use serde_json::Value;

pub struct StreamJsonRpcParser {
    lines: LineBuffer,
    message: String,
    thinking: bool,
}

impl Default for StreamJsonRpcParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamJsonRpcParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::new(),
            message: String::new(),
            thinking: false,
        }
    }

    fn flush_message(&mut self, out: &mut Vec<StreamEvent>) {
        if self.message.is_empty() {
            return;
        }
        let content = strip_message_markup(&std::mem::take(&mut self.message));
        if content.is_empty() {
            return;
        }
        out.push(StreamEvent::new(EventPayload::Message {
            role: Role::Assistant,
            content,
            delta: false,
        }));
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if line.trim().is_empty() {
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(line) else {
            out.push(StreamEvent::new(EventPayload::Raw { text: line.into() }));
            return;
        };

        if let Some(error) = value.get("error") {
            self.thinking = false;
            out.push(StreamEvent::new(EventPayload::Status {
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("rpc error")
                    .to_string(),
            }));
            return;
        }

        let Some(method) = value.get("method").and_then(Value::as_str) else {
            // Responses carry no progress in this dialect.
            return;
        };
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        if method != "agent.thought" {
            self.thinking = false;
        }

        match method {
            "agent.message" => {
                let text = params
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if text.is_empty() {
                    return;
                }
                if params.get("delta").and_then(Value::as_bool).unwrap_or(false) {
                    self.message.push_str(text);
                    out.push(StreamEvent::new(EventPayload::Message {
                        role: Role::Assistant,
                        content: text.to_string(),
                        delta: true,
                    }));
                } else {
                    // A full message supersedes any partial accumulation.
                    self.message.clear();
                    out.push(StreamEvent::new(EventPayload::Message {
                        role: Role::Assistant,
                        content: strip_message_markup(text),
                        delta: false,
                    }));
                }
            }

            "agent.thought" => {
                if !self.thinking {
                    self.thinking = true;
                    out.push(StreamEvent::new(EventPayload::Thinking));
                }
            }

            "agent.tool" => {
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let status = tool_status(params.get("status"));
                let output = params
                    .get("output")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                // The opening frame carries the tool name; later frames
                // only update status/output.
                if let Some(name) = params.get("name").and_then(Value::as_str) {
                    out.push(StreamEvent::new(EventPayload::ToolCall {
                        id,
                        name: name.to_string(),
                        status: status.unwrap_or_default(),
                        output,
                    }));
                } else {
                    out.push(StreamEvent::new(EventPayload::ToolUpdate {
                        id,
                        status,
                        output,
                    }));
                }
            }

            "agent.plan" => {
                let entries = params
                    .get("steps")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|item| PlanEntry {
                                content: item
                                    .get("text")
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

            "agent.permission" => {
                out.push(StreamEvent::new(EventPayload::Permission {
                    prompt: params
                        .get("prompt")
                        .and_then(Value::as_str)
                        .unwrap_or("the agent requested permission")
                        .to_string(),
                }));
            }

            "agent.complete" => {
                self.flush_message(out);
                out.push(StreamEvent::new(EventPayload::Completion {
                    result: params
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    stop_reason: params
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                }));
            }

            other => {
                out.push(StreamEvent::new(EventPayload::Status {
                    message: format!("notification: {other}"),
                }));
            }
        }
    }
}

impl DialectParser for StreamJsonRpcParser {
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

fn tool_status(value: Option<&Value>) -> Option<ToolStatus> {
    match value?.as_str()? {
        "pending" => Some(ToolStatus::Pending),
        "running" | "in_progress" => Some(ToolStatus::InProgress),
        "done" | "completed" => Some(ToolStatus::Completed),
        "error" | "failed" => Some(ToolStatus::Failed),
        _ => None,
    }
}
