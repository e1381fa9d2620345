//! Frames
//!
//! A `Frame` is the unit of data and control that flows between pipeline
//! stages. The set of kinds is closed: every stage matches on it and forwards
//! the kinds it does not handle.

use bytes::Bytes;
use std::fmt;

/// One unit of streaming data or control signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Mono PCM16 little-endian audio.
    AudioChunk { bytes: Bytes, sample_rate: u32 },
    /// Interim recognition result for the current user utterance.
    TranscriptPartial { text: String },
    /// Final recognition result for the current user utterance.
    TranscriptFinal { text: String },
    /// One fragment of an assistant reply.
    TextDelta { text: String },
    TurnStart,
    TurnEnd,
    /// Forceful stop: stages stop producing and return without flushing.
    Cancel,
    Error { message: String },
}

/// The kind of a frame, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    AudioChunk,
    TranscriptPartial,
    TranscriptFinal,
    TextDelta,
    TurnStart,
    TurnEnd,
    Cancel,
    Error,
}

impl Frame {
    pub fn audio(bytes: impl Into<Bytes>, sample_rate: u32) -> Self {
        Frame::AudioChunk {
            bytes: bytes.into(),
            sample_rate,
        }
    }

    pub fn text_delta(text: impl Into<String>) -> Self {
        Frame::TextDelta { text: text.into() }
    }

    pub fn transcript_final(text: impl Into<String>) -> Self {
        Frame::TranscriptFinal { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::AudioChunk { .. } => FrameKind::AudioChunk,
            Frame::TranscriptPartial { .. } => FrameKind::TranscriptPartial,
            Frame::TranscriptFinal { .. } => FrameKind::TranscriptFinal,
            Frame::TextDelta { .. } => FrameKind::TextDelta,
            Frame::TurnStart => FrameKind::TurnStart,
            Frame::TurnEnd => FrameKind::TurnEnd,
            Frame::Cancel => FrameKind::Cancel,
            Frame::Error { .. } => FrameKind::Error,
        }
    }

    /// Audio frames are lossy: they may be dropped under pressure.
    pub fn is_audio(&self) -> bool {
        matches!(self, Frame::AudioChunk { .. })
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::AudioChunk => "audio_chunk",
            FrameKind::TranscriptPartial => "transcript_partial",
            FrameKind::TranscriptFinal => "transcript_final",
            FrameKind::TextDelta => "text_delta",
            FrameKind::TurnStart => "turn_start",
            FrameKind::TurnEnd => "turn_end",
            FrameKind::Cancel => "cancel",
            FrameKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Which way a frame travels through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// From transport input towards transport output.
    Downstream,
    /// From transport output back towards transport input.
    Upstream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Frame::audio(vec![0u8; 4], 16000).kind(), FrameKind::AudioChunk);
        assert_eq!(Frame::text_delta("hi").kind(), FrameKind::TextDelta);
        assert_eq!(Frame::TurnEnd.kind(), FrameKind::TurnEnd);
        assert_eq!(Frame::error("boom").kind(), FrameKind::Error);
    }

    #[test]
    fn test_only_audio_is_lossy() {
        assert!(Frame::audio(Bytes::new(), 24000).is_audio());
        assert!(!Frame::transcript_final("hello").is_audio());
        assert!(!Frame::Cancel.is_audio());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(FrameKind::TranscriptPartial.to_string(), "transcript_partial");
        assert_eq!(FrameKind::Cancel.to_string(), "cancel");
    }
}
