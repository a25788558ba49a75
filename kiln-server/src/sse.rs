//! OpenAI `chat.completion.chunk` stream formatting.
//!
//! The writer turns engine [`StreamChunk`]s into SSE `data:` payloads. It
//! owns the byte-to-text boundary: engines emit raw bytes that may end in
//! the middle of a multi-byte sequence, so the writer holds back an
//! incomplete trailing sequence until the next chunk completes it. Invalid
//! bytes are replaced with U+FFFD immediately; an incomplete tail at the
//! terminal chunk is replaced as well. Concatenating every emitted
//! `delta.content` therefore reproduces the generated payload exactly (up
//! to replacement characters for bytes that never became valid).

use chrono::Utc;
use kiln_core::serving::{StreamChunk, Terminal};
use serde_json::json;

/// Statefully formats one request's chunks into SSE data payloads.
pub struct StreamWriter {
    request_id: String,
    model: String,
    /// Trailing bytes of the previous chunk that did not complete a code
    /// point yet.
    pending: Vec<u8>,
}

impl StreamWriter {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            pending: Vec::new(),
        }
    }

    /// Render a chunk into zero or more `data:` payload strings. The
    /// terminal chunk renders two: the finish-reason event and `[DONE]`.
    pub fn render(&mut self, chunk: &StreamChunk) -> Vec<String> {
        match chunk {
            StreamChunk::Delta(bytes) => {
                let safe = self.sanitize(bytes, false);
                if safe.is_empty() {
                    return Vec::new();
                }
                vec![self.event(json!({ "content": safe }), None)]
            }
            StreamChunk::Finished(terminal) => {
                let mut events = Vec::with_capacity(3);
                let tail = self.sanitize(&[], true);
                if !tail.is_empty() {
                    events.push(self.event(json!({ "content": tail }), None));
                }
                events.push(self.event(json!({}), Some(terminal)));
                events.push("[DONE]".to_owned());
                events
            }
        }
    }

    fn event(&self, delta: serde_json::Value, terminal: Option<&Terminal>) -> String {
        json!({
            "id": format!("chatcmpl-{}", self.request_id),
            "object": "chat.completion.chunk",
            "created": Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": terminal.map(|t| t.reason.as_str()),
            }],
        })
        .to_string()
    }

    /// Append `input` to the held-back bytes and split off the longest
    /// valid UTF-8 prefix. With `flush`, an incomplete tail becomes a
    /// replacement character instead of being held back.
    fn sanitize(&mut self, input: &[u8], flush: bool) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(input);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Garbage in the middle: replace and continue.
                        Some(n) => {
                            out.push('\u{FFFD}');
                            rest = &after[n..];
                        }
                        // Incomplete sequence at the end.
                        None => {
                            if flush {
                                out.push('\u{FFFD}');
                            } else {
                                self.pending = after.to_vec();
                            }
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use kiln_core::serving::FinishReason;

    use super::*;

    fn delta(bytes: &[u8]) -> StreamChunk {
        StreamChunk::Delta(bytes.to_vec())
    }

    fn finished(reason: FinishReason) -> StreamChunk {
        StreamChunk::Finished(Terminal::new(reason))
    }

    fn content_of(event: &str) -> String {
        let v: serde_json::Value = serde_json::from_str(event).expect("event is json");
        v["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_owned()
    }

    #[test]
    fn split_multibyte_sequence_is_held_back() {
        let mut w = StreamWriter::new("req-1", "m");
        // "é" is 0xC3 0xA9; split across two chunks.
        let first = w.render(&delta(&[b'a', 0xC3]));
        assert_eq!(first.len(), 1);
        assert_eq!(content_of(&first[0]), "a");

        let second = w.render(&delta(&[0xA9, b'b']));
        assert_eq!(content_of(&second[0]), "éb");
    }

    #[test]
    fn concatenation_restores_payload_for_any_chunking() {
        let payload = "héllo wörld ± ok 漢字".as_bytes();
        for chunk_size in 1..=payload.len() {
            let mut w = StreamWriter::new("req-1", "m");
            let mut collected = String::new();
            for part in payload.chunks(chunk_size) {
                for event in w.render(&delta(part)) {
                    collected.push_str(&content_of(event.as_str()));
                }
            }
            for event in w.render(&finished(FinishReason::Stop)) {
                if event != "[DONE]" {
                    collected.push_str(&content_of(event.as_str()));
                }
            }
            assert_eq!(collected.as_bytes(), payload, "chunk_size {chunk_size}");
        }
    }

    #[test]
    fn invalid_byte_is_replaced_immediately() {
        let mut w = StreamWriter::new("req-1", "m");
        let events = w.render(&delta(&[b'a', 0xFF, b'b']));
        assert_eq!(content_of(&events[0]), "a\u{FFFD}b");
    }

    #[test]
    fn terminal_flushes_incomplete_tail_as_replacement() {
        let mut w = StreamWriter::new("req-1", "m");
        assert!(w.render(&delta(&[0xE2, 0x82])).is_empty(), "held back");

        let events = w.render(&finished(FinishReason::Stop));
        assert_eq!(events.len(), 3);
        assert_eq!(content_of(&events[0]), "\u{FFFD}");

        let terminal: serde_json::Value = serde_json::from_str(&events[1]).expect("json");
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            terminal["choices"][0]["delta"],
            serde_json::json!({}),
            "terminal delta is the empty object"
        );
        assert_eq!(events[2], "[DONE]");
    }

    #[test]
    fn finish_reasons_use_wire_strings() {
        for (reason, wire) in [
            (FinishReason::Stop, "stop"),
            (FinishReason::Length, "length"),
            (FinishReason::Cancelled, "cancelled"),
            (FinishReason::Error, "error"),
        ] {
            let mut w = StreamWriter::new("req-1", "m");
            let events = w.render(&finished(reason));
            let v: serde_json::Value = serde_json::from_str(&events[0]).expect("json");
            assert_eq!(v["choices"][0]["finish_reason"], wire);
        }
    }

    #[test]
    fn chunk_envelope_matches_openai_schema() {
        let mut w = StreamWriter::new("req-9", "somemodel");
        let events = w.render(&delta(b"hi"));
        let v: serde_json::Value = serde_json::from_str(&events[0]).expect("json");
        assert_eq!(v["id"], "chatcmpl-req-9");
        assert_eq!(v["object"], "chat.completion.chunk");
        assert_eq!(v["model"], "somemodel");
        assert_eq!(v["choices"][0]["index"], 0);
        assert!(v["choices"][0]["finish_reason"].is_null());
        assert!(v["created"].is_i64());
    }
}
