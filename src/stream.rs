//! Decoder for the assistant's `stream-json` standard output.
//!
//! Each line is one JSON record. Only `assistant` records matter; their text
//! segments are concatenated into the current full text and the decoder
//! yields whatever extends the text it has already emitted.

use serde_json::Value;

/// Separator inserted between consecutive assistant messages of one turn.
const MESSAGE_SEPARATOR: &str = "\n\n";

/// The `message.content` array of an `assistant` record.
pub fn assistant_content(record: &Value) -> Option<&Vec<Value>> {
    if record.get("type").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    record
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
}

/// Concatenated `text` segments, ignoring tool invocations.
pub fn text_segments(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect()
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    emitted: String,
    /// Byte length of `emitted` that belongs to earlier messages.
    base_len: usize,
    current_id: Option<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text emitted so far; always the concatenation of every returned delta.
    pub fn full_text(&self) -> &str {
        &self.emitted
    }

    /// Feed a raw chunk of stdout. A trailing partial line stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut deltas = Vec::new();
        while let Some(pos) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(delta) = self.decode_line(&line) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush a final unterminated line once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        self.decode_line(&line)
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(error) => {
                tracing::trace!(target = "session_relay::stream", error = %error, "skipping malformed line");
                return None;
            }
        };
        let blocks = assistant_content(&record)?;
        let text = text_segments(blocks);
        let message_id = record
            .get("message")
            .and_then(|message| message.get("id"))
            .and_then(Value::as_str);
        self.apply(message_id, &text)
    }

    fn apply(&mut self, message_id: Option<&str>, text: &str) -> Option<String> {
        if let Some(id) = message_id {
            match self.current_id.as_deref() {
                Some(current) if current != id => {
                    self.base_len = self.emitted.len();
                    self.current_id = Some(id.to_string());
                }
                None => self.current_id = Some(id.to_string()),
                _ => {}
            }
        }

        let base = &self.emitted[..self.base_len];
        let mut candidate = String::with_capacity(base.len() + MESSAGE_SEPARATOR.len() + text.len());
        candidate.push_str(base);
        if !base.is_empty() && !text.is_empty() {
            candidate.push_str(MESSAGE_SEPARATOR);
        }
        candidate.push_str(text);

        if candidate.len() <= self.emitted.len() {
            if !self.emitted.starts_with(candidate.as_str()) {
                tracing::warn!(
                    target = "session_relay::stream",
                    emitted = self.emitted.len(),
                    received = candidate.len(),
                    "assistant text was rewritten; ignoring record"
                );
            }
            return None;
        }
        if !candidate.starts_with(self.emitted.as_str()) {
            tracing::warn!(
                target = "session_relay::stream",
                emitted = self.emitted.len(),
                received = candidate.len(),
                "assistant text does not extend emitted prefix; ignoring record"
            );
            return None;
        }

        let delta = candidate[self.emitted.len()..].to_string();
        self.emitted = candidate;
        Some(delta)
    }
}
