use bytes::Bytes;

/// One parsed server-sent event: an optional `event:` name and the joined
/// `data:` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data_only(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// OpenAI-style terminal marker.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser. Feed raw body chunks as they arrive off the socket;
/// frames split across TCP reads are reassembled.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            // Non-UTF8 chunks cannot carry SSE field names; skip them rather
            // than poisoning the line buffer.
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut events);
        }

        events
    }

    /// Flush whatever is buffered at end of stream. An upstream that dies
    /// mid-frame still yields its partial event here.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut events);
        }
        self.finish_event(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.finish_event(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }
        if line == "event" {
            self.event = None;
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
            return;
        }
        if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// Encode one event into wire bytes, `event:` line included only when named.
pub fn encode_event(event: &SseEvent) -> Bytes {
    let mut out = String::with_capacity(event.data.len() + 32);
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

/// Encode an SSE comment line (used for keepalive heartbeats).
pub fn encode_comment(text: &str) -> Bytes {
    Bytes::from(format!(": {text}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_data_only_events() {
        let mut parser = SseParser::new();
        let events =
            parser.push_str("event: message_start\ndata: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].event.is_none());
        assert!(events[1].is_done());
    }

    #[test]
    fn reassembles_frames_split_across_reads() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"par").is_empty());
        assert!(parser.push_str("tial\":true}").is_empty());
        let events = parser.push_str("\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"partial\":true}");
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn comments_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keepalive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_truncated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn encode_round_trips_through_parser() {
        let original = SseEvent::named("response.completed", "{\"ok\":true}");
        let bytes = encode_event(&original);
        let mut parser = SseParser::new();
        let events = parser.push_str(std::str::from_utf8(&bytes).unwrap());
        assert_eq!(events, vec![original]);
    }
}
