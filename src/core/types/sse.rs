//! Server-Sent Events framing for streaming responses
//!
//! Frames are `data: <json>\n\n`, terminated by `data: [DONE]\n\n`.

use bytes::Bytes;
use serde_json::json;

/// Stream terminator payload
pub const DONE_MARKER: &str = "[DONE]";

/// A single SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// Optional event type
    pub event: Option<String>,
    /// Event data
    pub data: String,
}

impl Event {
    /// Set the event type
    pub fn event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }

    /// Set the event data
    pub fn data(mut self, data: &str) -> Self {
        self.data = data.to_string();
        self
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Bytes {
        let mut frame = String::with_capacity(self.data.len() + 16);
        if let Some(event) = &self.event {
            frame.push_str("event: ");
            frame.push_str(event);
            frame.push('\n');
        }
        frame.push_str("data: ");
        frame.push_str(&self.data);
        frame.push_str("\n\n");
        Bytes::from(frame)
    }
}

/// Data frame carrying a serialized chunk
pub fn data_event(payload: &str) -> Event {
    Event::default().data(payload)
}

/// Terminator frame
pub fn done_event() -> Event {
    Event::default().data(DONE_MARKER)
}

/// Error frame
pub fn error_event(error: &str) -> Event {
    Event::default()
        .event("error")
        .data(&json!({"error": error}).to_string())
}

/// Parse an SSE data line, returning the payload without the prefix
pub fn parse_sse_line(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
}

/// Check if an SSE line terminates the stream
pub fn is_done_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == "data: [DONE]" || trimmed == DONE_MARKER
}
