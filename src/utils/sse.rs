use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u32>,
}

impl SseEvent {
    /// Named event carrying a JSON payload.
    pub fn json<T: Serialize>(event: &str, payload: &T) -> Self {
        Self {
            event: Some(event.to_string()),
            data: serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string()),
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = BytesMut::new();

        if let Some(id) = &self.id {
            buffer.put_slice(b"id: ");
            buffer.put_slice(id.as_bytes());
            buffer.put_u8(b'\n');
        }
        if let Some(event) = &self.event {
            buffer.put_slice(b"event: ");
            buffer.put_slice(event.as_bytes());
            buffer.put_u8(b'\n');
        }
        if let Some(retry) = self.retry {
            buffer.put_slice(b"retry: ");
            buffer.put_slice(retry.to_string().as_bytes());
            buffer.put_u8(b'\n');
        }
        if !self.data.is_empty() {
            for line in self.data.split('\n') {
                buffer.put_slice(b"data: ");
                buffer.put_slice(line.as_bytes());
                buffer.put_u8(b'\n');
            }
        }

        buffer.put_u8(b'\n');
        buffer.freeze()
    }
}

/// Incremental Server-Sent Events decoder for upstream provider streams.
/// Network chunks may split lines, CRLF pairs or UTF-8 sequences anywhere;
/// state is carried across `process` calls.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    current_event: SseEvent,
    is_start: bool,
}

impl Default for SseParser {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            current_event: SseEvent::default(),
            is_start: true,
        }
    }
}

const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        if self.is_start {
            if self.buffer.len() < BOM.len() && self.buffer[..] == BOM[..self.buffer.len()] {
                return Vec::new();
            }
            if self.buffer.starts_with(&BOM) {
                self.buffer.drain(..BOM.len());
            }
            self.is_start = false;
        }

        let mut events = Vec::new();
        while let Some((end_pos, skip_len)) = self.next_line_break() {
            let line_bytes: Vec<u8> = self.buffer.drain(..end_pos + skip_len).take(end_pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);

            if line.is_empty() {
                if self.current_event != SseEvent::default() {
                    events.push(std::mem::take(&mut self.current_event));
                }
            } else {
                self.parse_line(&line);
            }
        }
        events
    }

    /// Position of the next line terminator and its length. A trailing `\r`
    /// waits for more data since it may be the first half of `\r\n`.
    fn next_line_break(&self) -> Option<(usize, usize)> {
        let pos = self.buffer.iter().position(|&b| b == b'\n' || b == b'\r')?;
        if self.buffer[pos] == b'\n' {
            return Some((pos, 1));
        }
        match self.buffer.get(pos + 1) {
            Some(b'\n') => Some((pos, 2)),
            Some(_) => Some((pos, 1)),
            None => None,
        }
    }

    fn parse_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "event" => self.current_event.event = Some(value.to_string()),
            "data" => {
                if !self.current_event.data.is_empty() {
                    self.current_event.data.push('\n');
                }
                self.current_event.data.push_str(value);
            }
            "id" if !value.contains('\0') => self.current_event.id = Some(value.to_string()),
            "retry" => {
                if let Ok(retry) = value.trim().parse::<u32>() {
                    self.current_event.retry = Some(retry);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_events() {
        let mut parser = SseParser::new();
        let events = parser.process(b"data: first\n\ndata: second\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"event: message_delta\ndata: {\"a\"").is_empty());

        let events = parser.process(b":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_delta"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.process(b": keep-alive\ndata: line1\ndata: line2\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_mixed_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.process(b"data: e1\r\n\r\ndata: e2\r\rdata: e3\n\n");

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, "e1");
        assert_eq!(events[1].data, "e2");
        assert_eq!(events[2].data, "e3");
    }

    #[test]
    fn test_split_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.process(b"data: test\r").is_empty());

        let events = parser.process(b"\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "test");
    }

    #[test]
    fn test_utf8_split() {
        let mut parser = SseParser::new();
        let rocket = "🚀".as_bytes();
        let mut part1 = b"data: ".to_vec();
        part1.extend_from_slice(&rocket[..2]);
        let mut part2 = rocket[2..].to_vec();
        part2.extend_from_slice(b"\n\n");

        assert!(parser.process(&part1).is_empty());
        let events = parser.process(&part2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "🚀");
    }

    #[test]
    fn test_bom_split() {
        let mut parser = SseParser::new();
        assert!(parser.process(&[0xEF]).is_empty());
        assert!(parser.process(&[0xBB, 0xBF]).is_empty());

        let events = parser.process(b"data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_json_event_round_trips_through_parser() {
        let event = SseEvent::json("chunk", &serde_json::json!({"index": 0, "content": "a\nb"}));
        let mut parser = SseParser::new();
        let events = parser.process(&event.to_bytes());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("chunk"));
        let value: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(value["content"], "a\nb");
    }
}
