//! Incremental parser for the model server's stream framing.
//!
//! The wire format is line-delimited tagged records: `<tag>:<payload>\n`.
//! Tag `0` carries a JSON-encoded text fragment; other tags carry JSON
//! objects, some of which include a trailing `usage` accounting object.
//! The parser separates "is this a text fragment" from "is this a usage
//! record" at the record level, so callers never pattern-match raw bytes.

use crate::models::TokenUsage;

/// One decoded record from the model stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    /// An incremental text fragment of the answer.
    Text(String),
    /// A usage accounting record. Streams may emit more than one; the last
    /// one wins.
    Usage(TokenUsage),
    /// Any other structured record (step boundaries, finish markers without
    /// usage, tool traces). Carried through for observability, never acted on.
    Control { tag: String },
}

/// Incremental line-delimited record parser.
///
/// Feed raw bytes as they arrive; complete records come back in arrival
/// order. Partial trailing lines are buffered across calls, so fragment
/// boundaries in the transport never split a record.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a transport fragment, returning every record completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamRecord> {
        self.buf.extend_from_slice(bytes);

        let mut records = Vec::new();
        while let Some(newline) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            if let Some(record) = parse_line(&line) {
                records.push(record);
            }
        }
        records
    }

    /// Flush a trailing record that was not newline-terminated.
    pub fn finish(&mut self) -> Option<StreamRecord> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned();
        parse_line(&line)
    }
}

fn parse_line(line: &str) -> Option<StreamRecord> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }

    let (tag, payload) = line.split_once(':')?;

    if tag == "0" {
        // Text fragments are JSON strings; decoding also unescapes \n etc.
        return serde_json::from_str::<String>(payload)
            .ok()
            .map(StreamRecord::Text);
    }

    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    if let Some(usage) = value.get("usage") {
        if let Ok(usage) = serde_json::from_value::<TokenUsage>(usage.clone()) {
            return Some(StreamRecord::Usage(usage));
        }
    }

    Some(StreamRecord::Control {
        tag: tag.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_fragments_in_order() {
        let mut parser = StreamParser::new();
        let records = parser.feed(b"0:\"Hel\"\n0:\"lo, \"\n0:\"world\"\n");
        assert_eq!(
            records,
            vec![
                StreamRecord::Text("Hel".to_string()),
                StreamRecord::Text("lo, ".to_string()),
                StreamRecord::Text("world".to_string()),
            ]
        );
    }

    #[test]
    fn test_record_split_across_fragments() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"0:\"Hel").is_empty());
        let records = parser.feed(b"lo\"\n");
        assert_eq!(records, vec![StreamRecord::Text("Hello".to_string())]);
    }

    #[test]
    fn test_escaped_newline_in_text() {
        let mut parser = StreamParser::new();
        let records = parser.feed(b"0:\"line one\\nline two\"\n");
        assert_eq!(
            records,
            vec![StreamRecord::Text("line one\nline two".to_string())]
        );
    }

    #[test]
    fn test_usage_record() {
        let mut parser = StreamParser::new();
        let records = parser.feed(
            b"d:{\"finishReason\":\"stop\",\"usage\":{\"promptTokens\":10,\"completionTokens\":20}}\n",
        );
        assert_eq!(
            records,
            vec![StreamRecord::Usage(TokenUsage {
                prompt: 10,
                completion: 20
            })]
        );
    }

    #[test]
    fn test_control_record_without_usage() {
        let mut parser = StreamParser::new();
        let records = parser.feed(b"f:{\"messageId\":\"abc\"}\n");
        assert_eq!(
            records,
            vec![StreamRecord::Control {
                tag: "f".to_string()
            }]
        );
    }

    #[test]
    fn test_mixed_stream_keeps_arrival_order() {
        let mut parser = StreamParser::new();
        let records = parser.feed(
            b"f:{\"messageId\":\"m1\"}\n0:\"hi\"\ne:{\"usage\":{\"promptTokens\":1,\"completionTokens\":2}}\n",
        );
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], StreamRecord::Control { .. }));
        assert_eq!(records[1], StreamRecord::Text("hi".to_string()));
        assert!(matches!(records[2], StreamRecord::Usage(_)));
    }

    #[test]
    fn test_finish_flushes_unterminated_record() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"0:\"tail\"").is_empty());
        assert_eq!(parser.finish(), Some(StreamRecord::Text("tail".to_string())));
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(b"garbage without a tag\n").is_empty());
        assert!(parser.feed(b"0:not-json\n").is_empty());
    }
}
