//! Defines the WebSocket message protocol between the browser client and the voice transport.

use serde::{Deserialize, Serialize};
use voxrelay_core::audio::encode_base64;
use voxrelay_core::frames::Frame;

/// Messages sent from the client (browser) to the server.
///
/// Raw PCM16 audio may also be sent as binary frames.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Base64 PCM16 mono audio. `sample_rate` defaults to the configured input rate.
    Audio {
        data: String,
        sample_rate: Option<u32>,
    },
    /// The user started speaking.
    TurnStart,
    /// The user stopped speaking.
    TurnEnd,
    /// A typed message, handled as if it had been spoken.
    UserText { text: String },
    /// The client finished its setup and is ready to talk.
    ClientReady,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    SessionStarted { session_id: String },
    /// What the server heard the user say.
    UserTranscript { text: String, is_final: bool },
    /// One fragment of the assistant's reply, for captions.
    BotText { text: String },
    BotStartedSpeaking,
    BotStoppedSpeaking,
    /// Base64 PCM16 mono audio of the assistant's voice.
    Audio { data: String, sample_rate: u32 },
    Error { message: String },
}

impl ServerMessage {
    /// The message a pipeline frame is delivered as, if any.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::AudioChunk { bytes, sample_rate } => Some(ServerMessage::Audio {
                data: encode_base64(&bytes),
                sample_rate,
            }),
            Frame::TranscriptPartial { text } => Some(ServerMessage::UserTranscript {
                text,
                is_final: false,
            }),
            Frame::TranscriptFinal { text } => Some(ServerMessage::UserTranscript {
                text,
                is_final: true,
            }),
            Frame::TextDelta { text } => Some(ServerMessage::BotText { text }),
            Frame::TurnStart => Some(ServerMessage::BotStartedSpeaking),
            Frame::TurnEnd => Some(ServerMessage::BotStoppedSpeaking),
            Frame::Error { message } => Some(ServerMessage::Error { message }),
            Frame::Cancel => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse() {
        let audio: ClientMessage =
            serde_json::from_value(json!({"type": "audio", "data": "AAA="})).unwrap();
        assert_eq!(
            audio,
            ClientMessage::Audio {
                data: "AAA=".into(),
                sample_rate: None
            }
        );
        let text: ClientMessage =
            serde_json::from_value(json!({"type": "user_text", "text": "hi"})).unwrap();
        assert_eq!(text, ClientMessage::UserText { text: "hi".into() });
        let ready: ClientMessage = serde_json::from_str(r#"{"type":"client_ready"}"#).unwrap();
        assert_eq!(ready, ClientMessage::ClientReady);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_frames_map_to_server_messages() {
        let json = |frame| serde_json::to_value(ServerMessage::from_frame(frame).unwrap()).unwrap();

        assert_eq!(
            json(Frame::transcript_final("hello")),
            json!({"type": "user_transcript", "text": "hello", "is_final": true})
        );
        assert_eq!(
            json(Frame::text_delta("Hi")),
            json!({"type": "bot_text", "text": "Hi"})
        );
        assert_eq!(json(Frame::TurnStart), json!({"type": "bot_started_speaking"}));
        assert_eq!(
            json(Frame::audio(vec![0u8, 1], 24000)),
            json!({"type": "audio", "data": "AAE=", "sample_rate": 24000})
        );
        assert!(ServerMessage::from_frame(Frame::Cancel).is_none());
    }
}
