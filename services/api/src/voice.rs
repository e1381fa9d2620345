//! Voice pipeline assembly.
//!
//! `VoiceStack` holds the collaborators shared by all voice sessions and
//! builds one pipeline per session:
//!
//! ```text
//! transport input -> recognition -> user turns -> reasoning bridge
//!     -> assistant turns -> synthesis -> transport output
//! ```

use crate::registry::{PipelineFactory, SessionSeed, Teardown};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn};
use voxrelay_core::aggregator::TranscriptAggregator;
use voxrelay_core::audio::RECOGNITION_SAMPLE_RATE;
use voxrelay_core::bridge::{DEFAULT_TURN_TIMEOUT, ReasoningTransport, RemoteReasoningBridge};
use voxrelay_core::frames::Frame;
use voxrelay_core::pipeline::{PipelineHandle, SessionLifecycle};
use voxrelay_core::speech::{SpeechRecognizer, SpeechSynthesizer};
use voxrelay_core::stages::{
    RecognitionStage, SynthesisStage, TransportInputStage, TransportOutputStage,
};
use voxrelay_core::FramePipeline;

pub struct VoiceStack {
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    reasoning: Arc<dyn ReasoningTransport>,
    recognition_rate: u32,
    turn_timeout: Duration,
    greeting: Option<String>,
}

impl VoiceStack {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        reasoning: Arc<dyn ReasoningTransport>,
    ) -> Self {
        Self {
            recognizer,
            synthesizer,
            reasoning,
            recognition_rate: RECOGNITION_SAMPLE_RATE,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            greeting: None,
        }
    }

    pub fn with_recognition_rate(mut self, rate: u32) -> Self {
        self.recognition_rate = rate;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// Injected as the first user turn when the client reports it is ready.
    pub fn with_greeting(mut self, greeting: Option<String>) -> Self {
        self.greeting = greeting;
        self
    }

    pub fn synthesis_rate(&self) -> u32 {
        self.synthesizer.sample_rate()
    }
}

impl PipelineFactory for VoiceStack {
    fn build(&self, seed: SessionSeed) -> FramePipeline {
        let span = info_span!("session", session_id = %seed.id, transport = %seed.transport);
        let turns = TranscriptAggregator::new(seed.conversation.clone());
        let bridge = RemoteReasoningBridge::new(self.reasoning.clone(), seed.id.clone())
            .with_timeout(self.turn_timeout);

        FramePipeline::builder()
            .span(span)
            .stage(TransportInputStage::new(self.recognition_rate))
            .stage(RecognitionStage::new(
                self.recognizer.clone(),
                self.recognition_rate,
            ))
            .stage(turns.user())
            .stage(bridge)
            .stage(turns.assistant())
            .stage(SynthesisStage::new(self.synthesizer.clone()))
            .stage(TransportOutputStage::new())
            .lifecycle(VoiceLifecycle {
                session_id: seed.id,
                teardown: seed.teardown,
                greeting: self.greeting.clone(),
            })
            .build()
    }
}

/// Reacts to transport events for one voice session.
struct VoiceLifecycle {
    session_id: String,
    teardown: Teardown,
    greeting: Option<String>,
}

impl VoiceLifecycle {
    fn end_session(&self, pipeline: &PipelineHandle, reason: &str) {
        info!(session_id = %self.session_id, reason, "ending session");
        pipeline.cancel();
        self.teardown.request();
    }
}

#[async_trait]
impl SessionLifecycle for VoiceLifecycle {
    async fn on_connected(&self, _pipeline: &PipelineHandle) {
        info!(session_id = %self.session_id, "client connected");
    }

    async fn on_disconnected(&self, pipeline: &PipelineHandle) {
        self.end_session(pipeline, "client disconnected");
    }

    async fn on_participant_left(&self, pipeline: &PipelineHandle) {
        self.end_session(pipeline, "participant left");
    }

    async fn on_ready(&self, pipeline: &PipelineHandle) {
        let Some(greeting) = &self.greeting else {
            return;
        };
        if let Err(e) = pipeline.queue_frame(Frame::transcript_final(greeting.clone())).await {
            warn!(session_id = %self.session_id, error = %e, "could not queue greeting");
        }
    }
}
