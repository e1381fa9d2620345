//! Voice Stages
//!
//! The audio-facing stages of a voice pipeline. In pipeline order:
//! transport input, recognition, (aggregation and reasoning live in their own
//! modules), synthesis, transport output.

use crate::audio::{pcm16_from_bytes, pcm16_to_bytes, resample_pcm16};
use crate::frames::{Frame, FrameDirection};
use crate::speech::{SpeechRecognizer, SpeechSynthesizer, sentence_boundary, strip_markdown};
use crate::stage::{FrameError, Stage, StageContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Spoken when a turn fails, so the user is not left in silence.
const APOLOGY: &str = "Sorry, I ran into a problem answering that. Please try again.";

/// Longest utterance the recognizer is handed, in seconds.
const MAX_UTTERANCE_SECS: usize = 60;

/// Brings inbound audio to the rate recognition expects.
pub struct TransportInputStage {
    target_rate: u32,
}

impl TransportInputStage {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }
}

#[async_trait]
impl Stage for TransportInputStage {
    fn name(&self) -> &'static str {
        "transport_input"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &StageContext,
    ) -> Result<(), FrameError> {
        match frame {
            Frame::AudioChunk { bytes, sample_rate }
                if direction == FrameDirection::Downstream && sample_rate != self.target_rate =>
            {
                let samples = pcm16_from_bytes(&bytes);
                match resample_pcm16(&samples, sample_rate, self.target_rate) {
                    Ok(resampled) => {
                        let bytes = pcm16_to_bytes(&resampled);
                        ctx.push_downstream(Frame::audio(bytes, self.target_rate)).await
                    }
                    Err(e) => {
                        warn!(error = %e, sample_rate, "dropping audio chunk that could not be resampled");
                        ctx.push_upstream(Frame::error(format!("invalid audio: {e}"))).await
                    }
                }
            }
            other => ctx.push(other, direction).await,
        }
    }
}

/// Buffers one user utterance between `TurnStart` and `TurnEnd` and
/// transcribes it when the turn ends.
pub struct RecognitionStage {
    recognizer: Arc<dyn SpeechRecognizer>,
    sample_rate: u32,
    buffer: Vec<i16>,
    in_turn: bool,
    truncated: bool,
}

impl RecognitionStage {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, sample_rate: u32) -> Self {
        Self {
            recognizer,
            sample_rate,
            buffer: Vec::new(),
            in_turn: false,
            truncated: false,
        }
    }

    fn max_samples(&self) -> usize {
        self.sample_rate as usize * MAX_UTTERANCE_SECS
    }

    async fn finish_utterance(&mut self, ctx: &StageContext) -> Result<(), FrameError> {
        let pcm = std::mem::take(&mut self.buffer);
        self.truncated = false;
        if pcm.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(FrameError::Cancelled),
            result = self.recognizer.transcribe(pcm, self.sample_rate) => result,
        };

        match result {
            Ok(text) => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "utterance transcribed");
                if !text.trim().is_empty() {
                    ctx.push_downstream(Frame::transcript_final(text)).await?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "speech recognition failed");
                ctx.push_upstream(Frame::error(format!("speech recognition failed: {e}")))
                    .await
            }
        }
    }
}

#[async_trait]
impl Stage for RecognitionStage {
    fn name(&self) -> &'static str {
        "recognition"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &StageContext,
    ) -> Result<(), FrameError> {
        if direction == FrameDirection::Upstream {
            return ctx.push_upstream(frame).await;
        }

        match frame {
            Frame::AudioChunk { bytes, .. } => {
                if !self.in_turn {
                    return Ok(());
                }
                let room = self.max_samples().saturating_sub(self.buffer.len());
                let samples = pcm16_from_bytes(&bytes);
                if samples.len() > room && !self.truncated {
                    warn!(max_secs = MAX_UTTERANCE_SECS, "utterance too long, truncating");
                    self.truncated = true;
                }
                self.buffer.extend(samples.into_iter().take(room));
                Ok(())
            }
            Frame::TurnStart => {
                self.in_turn = true;
                self.buffer.clear();
                self.truncated = false;
                ctx.push_downstream(Frame::TurnStart).await
            }
            Frame::TurnEnd => {
                self.in_turn = false;
                self.finish_utterance(ctx).await?;
                ctx.push_downstream(Frame::TurnEnd).await
            }
            other => ctx.push_downstream(other).await,
        }
    }
}

/// Speaks assistant text one sentence at a time. Text frames are forwarded
/// unchanged ahead of their audio so the client can show captions.
pub struct SynthesisStage {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    pending: String,
}

impl SynthesisStage {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synthesizer,
            pending: String::new(),
        }
    }

    async fn speak(&self, text: &str, ctx: &StageContext) -> Result<(), FrameError> {
        let text = strip_markdown(text);
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(FrameError::Cancelled),
            result = self.synthesizer.synthesize(text.to_string()) => result,
        };

        match result {
            Ok(audio) if !audio.is_empty() => {
                ctx.push_downstream(Frame::audio(audio, self.synthesizer.sample_rate()))
                    .await
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "speech synthesis failed, skipping sentence");
                Ok(())
            }
        }
    }

    async fn speak_complete_sentences(&mut self, ctx: &StageContext) -> Result<(), FrameError> {
        while let Some(end) = sentence_boundary(&self.pending) {
            let sentence: String = self.pending.drain(..end).collect();
            self.speak(&sentence, ctx).await?;
        }
        Ok(())
    }

    async fn speak_rest(&mut self, ctx: &StageContext) -> Result<(), FrameError> {
        let rest = std::mem::take(&mut self.pending);
        self.speak(&rest, ctx).await
    }
}

#[async_trait]
impl Stage for SynthesisStage {
    fn name(&self) -> &'static str {
        "synthesis"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &StageContext,
    ) -> Result<(), FrameError> {
        if direction == FrameDirection::Upstream {
            return ctx.push_upstream(frame).await;
        }

        match frame {
            Frame::TextDelta { text } => {
                self.pending.push_str(&text);
                ctx.push_downstream(Frame::TextDelta { text }).await?;
                self.speak_complete_sentences(ctx).await
            }
            Frame::TurnStart => {
                self.pending.clear();
                ctx.push_downstream(Frame::TurnStart).await
            }
            Frame::TurnEnd => {
                self.speak_rest(ctx).await?;
                ctx.push_downstream(Frame::TurnEnd).await
            }
            Frame::Error { message } => {
                self.pending.clear();
                ctx.push_downstream(Frame::Error { message }).await?;
                self.speak(APOLOGY, ctx).await
            }
            other => ctx.push_downstream(other).await,
        }
    }

    async fn flush(&mut self, ctx: &StageContext) -> Result<(), FrameError> {
        self.speak_rest(ctx).await
    }
}

/// Last stage before the transport: frames leave through the pipeline's
/// output port. Keeps per-turn statistics for the log.
#[derive(Default)]
pub struct TransportOutputStage {
    turn_started: Option<Instant>,
    audio_bytes: usize,
    fragments: usize,
}

impl TransportOutputStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for TransportOutputStage {
    fn name(&self) -> &'static str {
        "transport_output"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &StageContext,
    ) -> Result<(), FrameError> {
        if direction == FrameDirection::Downstream {
            match &frame {
                Frame::TurnStart => {
                    self.turn_started = Some(Instant::now());
                    self.audio_bytes = 0;
                    self.fragments = 0;
                }
                Frame::AudioChunk { bytes, .. } => self.audio_bytes += bytes.len(),
                Frame::TextDelta { .. } => self.fragments += 1,
                Frame::TurnEnd => {
                    if let Some(started) = self.turn_started.take() {
                        info!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            fragments = self.fragments,
                            audio_bytes = self.audio_bytes,
                            "assistant turn delivered"
                        );
                    }
                }
                _ => {}
            }
        }
        ctx.push(frame, direction).await
    }
}
