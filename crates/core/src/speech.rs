//! Speech Collaborators
//!
//! Recognition turns one buffered user utterance into text; synthesis turns
//! assistant text into PCM16 audio. Both are traits so the voice pipeline can
//! run against OpenAI's audio endpoints or against the scripted fakes below.

use crate::audio::{SYNTHESIS_SAMPLE_RATE, encode_wav, pcm16_to_bytes};
use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        AudioInput, CreateSpeechRequestArgs, CreateTranscriptionRequestArgs, SpeechModel,
        SpeechResponseFormat, Voice,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribes one complete utterance of mono PCM16 audio.
    async fn transcribe(&self, pcm: Vec<i16>, sample_rate: u32) -> Result<String>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Rate of the PCM16 audio `synthesize` returns.
    fn sample_rate(&self) -> u32;

    async fn synthesize(&self, text: String) -> Result<Bytes>;
}

pub struct OpenAiRecognizer {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiRecognizer {
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl SpeechRecognizer for OpenAiRecognizer {
    async fn transcribe(&self, pcm: Vec<i16>, sample_rate: u32) -> Result<String> {
        let wav = encode_wav(&pcm, sample_rate)?;
        let request = CreateTranscriptionRequestArgs::default()
            .file(AudioInput::from_vec_u8("utterance.wav".to_string(), wav))
            .model(&self.model)
            .build()?;
        let response = self.client.audio().transcribe(request).await?;
        Ok(response.text.trim().to_string())
    }
}

pub struct OpenAiSynthesizer {
    client: Client<OpenAIConfig>,
    model: SpeechModel,
    voice: Voice,
}

impl OpenAiSynthesizer {
    pub fn new(config: OpenAIConfig, model: &str, voice: &str) -> Self {
        let model = match model {
            "tts-1" => SpeechModel::Tts1,
            "tts-1-hd" => SpeechModel::Tts1Hd,
            other => SpeechModel::Other(other.to_string()),
        };
        let voice = match voice.to_ascii_lowercase().as_str() {
            "echo" => Voice::Echo,
            "fable" => Voice::Fable,
            "onyx" => Voice::Onyx,
            "nova" => Voice::Nova,
            "shimmer" => Voice::Shimmer,
            _ => Voice::Alloy,
        };
        Self {
            client: Client::with_config(config),
            model,
            voice,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    fn sample_rate(&self) -> u32 {
        SYNTHESIS_SAMPLE_RATE
    }

    async fn synthesize(&self, text: String) -> Result<Bytes> {
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .model(self.model.clone())
            .voice(self.voice.clone())
            .response_format(SpeechResponseFormat::Pcm)
            .build()?;
        let response = self.client.audio().speech(request).await?;
        Ok(response.bytes)
    }
}

/// Returns queued transcripts in order, then empty strings.
#[derive(Debug, Default)]
pub struct ScriptedRecognizer {
    transcripts: Mutex<VecDeque<String>>,
}

impl ScriptedRecognizer {
    pub fn new<I, S>(transcripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transcripts: Mutex::new(transcripts.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn transcribe(&self, _pcm: Vec<i16>, _sample_rate: u32) -> Result<String> {
        let mut transcripts = self
            .transcripts
            .lock()
            .map_err(|_| anyhow::anyhow!("scripted recognizer lock poisoned"))?;
        Ok(transcripts.pop_front().unwrap_or_default())
    }
}

/// Produces 10 ms of silence per input character.
#[derive(Debug, Clone, Copy)]
pub struct SilenceSynthesizer {
    sample_rate: u32,
}

impl SilenceSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for SilenceSynthesizer {
    fn default() -> Self {
        Self::new(SYNTHESIS_SAMPLE_RATE)
    }
}

#[async_trait]
impl SpeechSynthesizer for SilenceSynthesizer {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn synthesize(&self, text: String) -> Result<Bytes> {
        let samples = text.chars().count() * self.sample_rate as usize / 100;
        Ok(pcm16_to_bytes(&vec![0i16; samples]))
    }
}

/// Removes markdown markup so it is not read aloud. Links keep their label.
pub(crate) fn strip_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' | '_' | '`' | '#' | '>' => {}
            ']' if chars.peek() == Some(&'(') => {
                for skipped in chars.by_ref() {
                    if skipped == ')' {
                        break;
                    }
                }
            }
            '[' | ']' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Byte offset just past the first sentence terminator that is followed by
/// whitespace, so decimals like `3.5` are not split.
pub(crate) fn sentence_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            return Some(i + 1);
        }
        if matches!(c, '.' | '!' | '?' | ';' | ':') {
            if let Some((_, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(i + c.len_utf8());
                }
            }
        }
    }
    None
}
