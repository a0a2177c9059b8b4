//! Line-buffering parser for server-sent-event streams.
//!
//! OpenAI-compatible backends frame streaming completions as
//! `data: {json}\n\n` lines terminated by `data: [DONE]`. TCP chunk
//! boundaries do not align with SSE line boundaries, so the parser
//! buffers partial lines and only emits complete events.

use std::mem;

/// A complete SSE event extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the prefix stripped.
    Data(String),
    /// The `[DONE]` termination marker.
    Done,
}

/// Accumulates bytes until complete lines are available.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one TCP chunk, returning every complete event it finished.
    /// Trailing partial lines stay buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_owned();
            self.buffer.drain(..=pos);
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Drain any buffered partial line when the byte stream ends.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = mem::take(&mut self.buffer);
        parse_line(rest.trim_end())
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "data: [DONE]" {
        return Some(SseEvent::Done);
    }
    // Non-data SSE fields (event:, id:, retry:, comments) are ignored.
    let data = trimmed.strip_prefix("data:")?.trim_start();
    (!data.is_empty()).then(|| SseEvent::Data(data.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut buf = SseLineBuffer::new();
        let events = buf.feed(b"data: {\"x\":1}\n\n");
        assert_eq!(events, vec![SseEvent::Data("{\"x\":1}".to_string())]);
    }

    #[test]
    fn test_multiple_events_per_chunk() {
        let mut buf = SseLineBuffer::new();
        let events = buf.feed(b"data: a\n\ndata: b\n\ndata: [DONE]\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("a".to_string()),
                SseEvent::Data("b".to_string()),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn test_partial_line_across_chunks() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.feed(b"data: {\"delta\":").is_empty());
        let events = buf.feed(b"\"hi\"}\n");
        assert_eq!(events, vec![SseEvent::Data("{\"delta\":\"hi\"}".to_string())]);
    }

    #[test]
    fn test_crlf_lines() {
        let mut buf = SseLineBuffer::new();
        let events = buf.feed(b"data: x\r\n\r\n");
        assert_eq!(events, vec![SseEvent::Data("x".to_string())]);
    }

    #[test]
    fn test_ignores_non_data_fields() {
        let mut buf = SseLineBuffer::new();
        let events = buf.feed(b"event: ping\nid: 7\n: comment\ndata: y\n");
        assert_eq!(events, vec![SseEvent::Data("y".to_string())]);
    }

    #[test]
    fn test_flush_partial_done() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.feed(b"data: [DONE]").is_empty());
        assert_eq!(buf.flush(), Some(SseEvent::Done));
        assert_eq!(buf.flush(), None);
    }
}
