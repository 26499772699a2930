//! Incremental JSON framing over the agent's stdout.
//!
//! The agent writes JSON objects to stdout, but reads hand us arbitrary
//! chunks: a chunk may end mid-object, mid-string or mid-escape, and objects
//! may be separated by log noise. [`StreamParser`] buffers the text and cuts
//! it into complete `{ ... }` frames by tracking brace depth outside of
//! string literals.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_types::message::StreamMessage;

/// Default hard cap on buffered text (10 MiB).
pub const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Longest excerpt of noise or a bad frame included in debug logs.
const LOG_EXCERPT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream buffer exceeded {limit} bytes without completing a frame")]
    BufferOverflow { limit: usize },
}

/// Something the parser produced from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(StreamMessage),
    Error(StreamError),
}

/// Resumable scan position inside the buffer. `start` is the byte offset of
/// the opening brace of the frame being scanned, `pos` the next byte to look
/// at.
#[derive(Debug, Default, Clone)]
struct FrameScan {
    start: Option<usize>,
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

#[derive(Debug)]
pub struct StreamParser {
    buffer: String,
    scan: FrameScan,
    max_buffer_bytes: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::with_max_buffer(MAX_BUFFER_BYTES)
    }

    pub fn with_max_buffer(max_buffer_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            scan: FrameScan::default(),
            max_buffer_bytes,
        }
    }

    /// Append a chunk and return every frame it completed, in stream order.
    ///
    /// If the text left over after framing exceeds the buffer cap, the
    /// buffer is discarded and a single [`StreamError::BufferOverflow`] is
    /// returned after any messages.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        self.extract_frames(&mut events);

        if self.buffer.len() > self.max_buffer_bytes {
            warn!(
                buffered = self.buffer.len(),
                limit = self.max_buffer_bytes,
                "Stream buffer overflow, discarding buffered output"
            );
            self.reset();
            events.push(StreamEvent::Error(StreamError::BufferOverflow {
                limit: self.max_buffer_bytes,
            }));
        }
        events
    }

    /// Frame what is left at end of stream. Whatever cannot be framed is
    /// tried as a last JSON object and then dropped; the buffer is empty
    /// afterwards.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.extract_frames(&mut events);

        let remainder = self.buffer.trim();
        if !remainder.is_empty() {
            match decode_frame(remainder) {
                Some(msg) => events.push(StreamEvent::Message(msg)),
                None => debug!(
                    excerpt = excerpt(remainder),
                    "Dropping incomplete frame at end of stream"
                ),
            }
        }
        self.reset();
        events
    }

    /// Discard all buffered text.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan = FrameScan::default();
    }

    /// Bytes currently held waiting for a frame to complete.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn extract_frames(&mut self, events: &mut Vec<StreamEvent>) {
        let bytes = self.buffer.as_bytes();
        let mut consumed = 0;

        loop {
            let start = match self.scan.start {
                Some(start) => start,
                None => {
                    let Some(offset) = bytes[consumed..].iter().position(|&b| b == b'{') else {
                        log_noise(&self.buffer[consumed..]);
                        consumed = bytes.len();
                        break;
                    };
                    let start = consumed + offset;
                    log_noise(&self.buffer[consumed..start]);
                    self.scan = FrameScan {
                        start: Some(start),
                        pos: start,
                        ..FrameScan::default()
                    };
                    start
                }
            };

            let Some(end) = self.scan.advance(bytes) else {
                // Incomplete frame: keep it and resume from `scan.pos` later.
                consumed = start;
                break;
            };

            let candidate = &self.buffer[start..=end];
            match decode_frame(candidate) {
                Some(msg) => events.push(StreamEvent::Message(msg)),
                None => debug!(excerpt = excerpt(candidate), "Dropping malformed frame"),
            }
            consumed = end + 1;
            self.scan = FrameScan::default();
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
            if let Some(start) = self.scan.start.as_mut() {
                *start -= consumed;
                self.scan.pos -= consumed;
            }
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScan {
    /// Scan forward until the frame's closing brace. Returns its offset, or
    /// `None` if the buffer ends first.
    fn advance(&mut self, bytes: &[u8]) -> Option<usize> {
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            self.pos += 1;

            if self.escaped {
                self.escaped = false;
                continue;
            }
            match b {
                b'\\' => self.escaped = true,
                b'"' => self.in_string = !self.in_string,
                _ if self.in_string => {}
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Some(self.pos - 1);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// Decode one candidate frame. Literal CR/LF are stripped first; JSON never
/// needs them outside strings and they are invalid inside.
fn decode_frame(candidate: &str) -> Option<StreamMessage> {
    let parsed = if candidate.contains(['\r', '\n']) {
        let cleaned: String = candidate.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
        serde_json::from_str::<Map<String, Value>>(&cleaned)
    } else {
        serde_json::from_str::<Map<String, Value>>(candidate)
    };
    parsed.ok().map(StreamMessage::from_map)
}

fn log_noise(noise: &str) {
    let noise = noise.trim();
    if !noise.is_empty() {
        debug!(excerpt = excerpt(noise), "Skipping non-JSON output");
    }
}

fn excerpt(s: &str) -> &str {
    match s.char_indices().nth(LOG_EXCERPT) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Read the agent's stdout to EOF, framing it and forwarding every event to
/// `sink`. Stops early if the receiving side is dropped.
pub async fn pump<R>(mut reader: R, mut parser: StreamParser, sink: mpsc::Sender<StreamEvent>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut tmp = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader
            .read(&mut tmp)
            .await
            .context("Failed to read agent output")?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&tmp[..n]);
        let text = take_utf8(&mut pending);
        for event in parser.feed(&text) {
            if sink.send(event).await.is_err() {
                return Ok(());
            }
        }
    }

    let mut events = Vec::new();
    if !pending.is_empty() {
        events.extend(parser.feed(&String::from_utf8_lossy(&pending)));
    }
    events.extend(parser.flush());
    for event in events {
        if sink.send(event).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Decode as much of `pending` as possible, leaving an incomplete trailing
/// sequence for the next read. Invalid bytes become U+FFFD one at a time.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut consumed = 0;
    while consumed < pending.len() {
        match std::str::from_utf8(&pending[consumed..]) {
            Ok(valid) => {
                text.push_str(valid);
                consumed = pending.len();
            }
            Err(e) => {
                let valid_end = consumed + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[consumed..valid_end]));
                match e.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        consumed = valid_end + bad;
                    }
                    None => {
                        consumed = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..consumed);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    fn messages(events: Vec<StreamEvent>) -> Vec<Value> {
        events
            .into_iter()
            .map(|e| match e {
                StreamEvent::Message(m) => m.into_value(),
                StreamEvent::Error(err) => panic!("unexpected error: {err}"),
            })
            .collect()
    }

    fn sample_objects() -> Vec<Value> {
        vec![
            json!({ "type": "step_start", "sessionID": "ses_1" }),
            json!({ "type": "tool_call", "part": { "tool": "bash", "input": { "command": "echo '{' \"}\"" } } }),
            json!({ "type": "text", "part": { "text": "braces {inside} and \\ slashes \"quoted\"" } }),
            json!({ "type": "tool_result", "part": { "tool": "read", "output": "ünïcødé ✓" } }),
        ]
    }

    #[test]
    fn single_object_in_one_chunk() {
        let mut parser = StreamParser::new();
        let out = messages(parser.feed(r#"{"type":"text","part":{"text":"hi"}}"#));
        assert_eq!(out, vec![json!({ "type": "text", "part": { "text": "hi" } })]);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn every_two_way_split_yields_all_objects_in_order() {
        let objects = sample_objects();
        let stream: String = objects
            .iter()
            .map(|o| format!("  noise line\n{}\n", serde_json::to_string(o).unwrap()))
            .collect();
        let boundaries: Vec<usize> = (0..=stream.len()).filter(|&i| stream.is_char_boundary(i)).collect();

        for &split in &boundaries {
            let mut parser = StreamParser::new();
            let mut out = messages(parser.feed(&stream[..split]));
            out.extend(messages(parser.feed(&stream[split..])));
            assert_eq!(out, objects, "split at {split}");
            assert_eq!(parser.buffered_len(), 0);
        }
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let objects = sample_objects();
        let stream: String = objects
            .iter()
            .map(|o| serde_json::to_string(o).unwrap())
            .collect::<Vec<_>>()
            .join("\r\n");

        let mut parser = StreamParser::new();
        let mut out = Vec::new();
        let mut chunk = String::new();
        for c in stream.chars() {
            chunk.push(c);
            out.extend(messages(parser.feed(&chunk)));
            chunk.clear();
        }
        assert_eq!(out, objects);
    }

    #[test]
    fn braces_and_escaped_quotes_inside_strings_do_not_split() {
        let mut parser = StreamParser::new();
        let input = r#"{"type":"text","text":"a } b { c \" } d \\"}"#;
        let out = messages(parser.feed(input));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["text"], "a } b { c \" } d \\");
    }

    #[test]
    fn split_inside_escape_sequence() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(r#"{"text":"quote \"#).is_empty());
        assert!(parser.feed(r#""} still string"#).is_empty());
        let out = messages(parser.feed(r#""}"#));
        assert_eq!(out, vec![json!({ "text": "quote \"} still string" })]);
    }

    #[test]
    fn malformed_frame_does_not_block_the_next_one() {
        let mut parser = StreamParser::new();
        let out = messages(parser.feed(r#"{not json} {"type":"text"}"#));
        assert_eq!(out, vec![json!({ "type": "text" })]);
    }

    #[test]
    fn literal_newlines_inside_frame_are_stripped() {
        let mut parser = StreamParser::new();
        let out = messages(parser.feed("{\"type\":\r\n\"text\",\n\"ok\":true}"));
        assert_eq!(out, vec![json!({ "type": "text", "ok": true })]);
    }

    #[test]
    fn pure_noise_is_discarded() {
        let mut parser = StreamParser::new();
        assert!(parser.feed("Starting agent...\nINFO ready\n").is_empty());
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn overflow_reports_once_and_empties_buffer() {
        let mut parser = StreamParser::with_max_buffer(64);
        let mut errors = 0;
        let mut events = parser.feed(r#"{"type":"text","text":""#);
        for _ in 0..20 {
            events.extend(parser.feed("xxxxxxxxxx"));
        }
        for event in events {
            match event {
                StreamEvent::Error(StreamError::BufferOverflow { limit }) => {
                    assert_eq!(limit, 64);
                    errors += 1;
                }
                StreamEvent::Message(m) => panic!("unexpected message {m:?}"),
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(parser.buffered_len(), 0);

        // The parser keeps working after an overflow.
        let out = messages(parser.feed(r#"{"type":"text"}"#));
        assert_eq!(out, vec![json!({ "type": "text" })]);
    }

    #[test]
    fn overflow_at_default_cap() {
        let mut parser = StreamParser::new();
        let filler = "a".repeat(1024 * 1024);
        let mut events = parser.feed("{\"blob\":\"");
        for _ in 0..11 {
            events.extend(parser.feed(&filler));
        }
        assert_eq!(
            events,
            vec![StreamEvent::Error(StreamError::BufferOverflow { limit: MAX_BUFFER_BYTES })]
        );
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn messages_before_overflow_are_kept() {
        let mut parser = StreamParser::with_max_buffer(16);
        let events = parser.feed(r#"{"a":1}{"b":"unterminated and long"#);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Message(m) if m.get("a") == Some(&json!(1))));
        assert!(matches!(events[1], StreamEvent::Error(_)));
    }

    #[test]
    fn flush_drops_incomplete_remainder() {
        let mut parser = StreamParser::new();
        let out = messages(parser.feed(r#"{"a":1} {"b":"#));
        assert_eq!(out, vec![json!({ "a": 1 })]);
        assert!(parser.buffered_len() > 0);
        assert!(parser.flush().is_empty());
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut parser = StreamParser::new();
        parser.feed(r#"{"type":"te"#);
        parser.reset();
        assert_eq!(parser.buffered_len(), 0);
        let out = messages(parser.feed(r#"{"type":"text"}"#));
        assert_eq!(out, vec![json!({ "type": "text" })]);
    }

    #[test]
    fn take_utf8_keeps_split_sequence() {
        let bytes = "✓".as_bytes();
        let mut pending = vec![b'a', bytes[0], bytes[1]];
        assert_eq!(take_utf8(&mut pending), "a");
        assert_eq!(pending.len(), 2);
        pending.push(bytes[2]);
        assert_eq!(take_utf8(&mut pending), "✓");
        assert!(pending.is_empty());
    }

    #[test]
    fn take_utf8_replaces_only_the_invalid_byte() {
        let check = "✓".as_bytes();
        let mut pending = vec![b'a', 0xFF, b'b', 0xC3, b'c', check[0], check[1]];
        assert_eq!(take_utf8(&mut pending), "a\u{FFFD}b\u{FFFD}c");
        assert_eq!(pending, &check[..2]);
        pending.push(check[2]);
        assert_eq!(take_utf8(&mut pending), "✓");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pump_frames_a_reader_split_into_tiny_writes() {
        let objects = sample_objects();
        let stream: String = objects
            .iter()
            .map(|o| serde_json::to_string(o).unwrap() + "\n")
            .collect();

        let (mut writer, reader) = tokio::io::duplex(3);
        let (tx, mut rx) = mpsc::channel(16);
        let pumping = tokio::spawn(pump(reader, StreamParser::new(), tx));

        writer.write_all(stream.as_bytes()).await.unwrap();
        drop(writer);

        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        pumping.await.unwrap().unwrap();
        assert_eq!(messages(out), objects);
    }
}
