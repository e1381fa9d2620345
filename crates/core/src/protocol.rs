//! Chunk Protocol
//!
//! Wire format shared by the text relay and the reasoning bridge: a stream of
//! newline-delimited records, each optionally prefixed with `data:` the way
//! server-sent events are, carrying one JSON object:
//!
//! ```text
//! data: {"type":"text","content":"Hello"}
//! data: {"type":"done","session_id":"abc"}
//! data: {"type":"error","error":"upstream unavailable"}
//! ```
//!
//! Records with an unknown `type` are ignored. A record without a `type` is
//! treated as text, and any record carrying a non-empty `error` field is an
//! error record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One event of the chunk protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        content: String,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn text(content: impl Into<String>) -> Self {
        StreamEvent::Text {
            content: content.into(),
        }
    }

    pub fn done(session_id: impl Into<String>) -> Self {
        StreamEvent::Done {
            session_id: Some(session_id.into()),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: error.into(),
        }
    }

    /// The JSON payload without the `data:` framing.
    pub fn to_json(&self) -> String {
        // Serializing a tagged enum of strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The record as written on the wire, including the blank separator line.
    pub fn to_record(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ChunkParseError {
    #[error("record is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("`{kind}` record is missing `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

/// Parses one protocol line.
///
/// Returns `Ok(None)` for lines that carry no event: blank separators, comment
/// lines starting with `:`, other SSE fields (`event:`, `id:`), and records
/// whose `type` is not known.
pub(crate) fn parse_record(line: &str) -> Result<Option<StreamEvent>, ChunkParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if line.starts_with('{') => line,
        None => return Ok(None),
    };

    let value: Value =
        serde_json::from_str(payload).map_err(|e| ChunkParseError::InvalidJson(e.to_string()))?;
    let object = value.as_object().ok_or(ChunkParseError::NotAnObject)?;

    if let Some(error) = object.get("error").and_then(Value::as_str) {
        if !error.is_empty() {
            return Ok(Some(StreamEvent::error(error)));
        }
    }

    let kind = object.get("type").and_then(Value::as_str).unwrap_or("text");
    let event = match kind {
        "text" => {
            let content = object
                .get("content")
                .and_then(Value::as_str)
                .ok_or(ChunkParseError::MissingField {
                    kind: "text",
                    field: "content",
                })?;
            StreamEvent::text(content)
        }
        "done" => StreamEvent::Done {
            session_id: object
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "error" => StreamEvent::error("remote reported an error without a message"),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Longest unterminated line a `LineDecoder` will hold.
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line exceeds {limit} bytes without a terminator")]
pub(crate) struct LineTooLong {
    pub limit: usize,
}

/// Splits a byte stream into lines.
///
/// Bytes are buffered until a `\n` arrives, so a record split across network
/// chunks, even inside a multi-byte character, is reassembled before parsing.
/// The pending partial line is capped at `limit` bytes.
#[derive(Debug)]
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Feeds one chunk and returns every line it completed, without the
    /// terminator. Fails once the unterminated remainder outgrows the limit;
    /// the buffer is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = self.buf[start..end].strip_suffix(b"\r").unwrap_or(&self.buf[start..end]);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.buf.drain(..start);
        if self.buf.len() > self.limit {
            self.buf = Vec::new();
            return Err(LineTooLong { limit: self.limit });
        }
        Ok(lines)
    }

    /// Returns the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}
