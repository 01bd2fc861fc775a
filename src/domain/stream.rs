//! Structured events decoded from an agent's output stream.
//!
//! Agent CLIs emit newline-delimited JSON records alongside plain terminal
//! output. The shapes vary between tools and versions, so decoding is
//! defensive: anything that is not recognizable JSON becomes a raw-text
//! event instead of an error.

use serde_json::Value;

/// One decoded line of agent output
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Assistant or user message text
    Message { content: String },
    /// The agent invoked a tool
    ToolUse { name: String, input: Value },
    /// The agent is asking for operator input
    InputRequest,
    /// Final result record; its presence marks a completed run
    Result { content: Option<String> },
    /// System/meta record
    System { content: Option<String> },
    /// Valid JSON that matched no known shape
    Unknown { raw: Value },
    /// The line was not structured JSON at all
    RawText { text: String },
}

impl StreamEvent {
    /// Decode a single output line.
    pub fn parse_line(line: &str) -> StreamEvent {
        let trimmed = line.trim();

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                return StreamEvent::RawText {
                    text: trimmed.to_string(),
                };
            }
        };

        // Input requests are flagged via subtype regardless of record type
        if value.get("subtype").and_then(Value::as_str) == Some("input_request") {
            return StreamEvent::InputRequest;
        }

        if let Some(tool_use) = value.get("tool_use") {
            let name = tool_use
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let input = tool_use.get("input").cloned().unwrap_or(Value::Null);
            return StreamEvent::ToolUse { name, input };
        }

        let content = message_content(&value);

        match value.get("type").and_then(Value::as_str) {
            Some("assistant") | Some("user") => StreamEvent::Message {
                content: content.unwrap_or_default(),
            },
            Some("result") => StreamEvent::Result { content },
            Some("system") => StreamEvent::System { content },
            _ => StreamEvent::Unknown { raw: value },
        }
    }

    /// Whether this is the terminal result marker of a completed run.
    pub fn is_result(&self) -> bool {
        matches!(self, StreamEvent::Result { .. })
    }

    /// Message-like text content, if this event carries any.
    pub fn content(&self) -> Option<&str> {
        match self {
            StreamEvent::Message { content } => Some(content),
            StreamEvent::Result { content } | StreamEvent::System { content } => {
                content.as_deref()
            }
            StreamEvent::RawText { text } => Some(text),
            _ => None,
        }
    }
}

fn message_content(value: &Value) -> Option<String> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}
