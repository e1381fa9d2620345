//! Turn Aggregation
//!
//! The user side collapses recognition output into one `TranscriptFinal` per
//! turn and records it; the assistant side accumulates reply fragments and
//! records the finished reply. Both write to the session's shared
//! `Conversation`, so history stays ordered user, assistant, user, ...

use crate::conversation::{ChatMessage, Conversation};
use crate::frames::{Frame, FrameDirection};
use crate::stage::{FrameError, Stage, StageContext};
use async_trait::async_trait;
use tracing::debug;

/// Creates the paired user and assistant aggregators for one session.
#[derive(Debug, Clone)]
pub struct TranscriptAggregator {
    conversation: Conversation,
}

impl TranscriptAggregator {
    pub fn new(conversation: Conversation) -> Self {
        Self { conversation }
    }

    pub fn user(&self) -> UserTurnAggregator {
        UserTurnAggregator {
            conversation: self.conversation.clone(),
            in_turn: false,
            finals: Vec::new(),
            partial: String::new(),
        }
    }

    pub fn assistant(&self) -> AssistantTurnAggregator {
        AssistantTurnAggregator {
            conversation: self.conversation.clone(),
            reply: None,
            failed: false,
        }
    }
}

/// Sits after recognition. Consumes the user's turn markers so that further
/// downstream `TurnStart`/`TurnEnd` only ever bracket assistant turns.
///
/// Inside a `TurnStart..TurnEnd` bracket, final segments are joined and each
/// interim result replaces the previous one; the turn is emitted as a single
/// `TranscriptFinal` when it ends, falling back to the last interim result if
/// no segment was finalized. A `TranscriptFinal` outside a bracket (typed
/// text, an injected greeting) is a complete turn on its own.
pub struct UserTurnAggregator {
    conversation: Conversation,
    in_turn: bool,
    finals: Vec<String>,
    partial: String,
}

impl UserTurnAggregator {
    fn turn_text(&mut self) -> String {
        let partial = std::mem::take(&mut self.partial);
        let finals = std::mem::take(&mut self.finals);
        if finals.is_empty() {
            partial.trim().to_string()
        } else {
            finals.join(" ")
        }
    }

    async fn commit(&mut self, text: &str, ctx: &StageContext) -> Result<(), FrameError> {
        let text = text.trim();
        if text.is_empty() {
            debug!("dropping empty transcript");
            return Ok(());
        }
        self.conversation.push(ChatMessage::user(text));
        ctx.push_downstream(Frame::transcript_final(text)).await
    }
}

#[async_trait]
impl Stage for UserTurnAggregator {
    fn name(&self) -> &'static str {
        "user_aggregator"
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
            Frame::TurnStart => {
                self.in_turn = true;
                self.finals.clear();
                self.partial.clear();
                Ok(())
            }
            Frame::TurnEnd => {
                if !std::mem::take(&mut self.in_turn) {
                    return Ok(());
                }
                let text = self.turn_text();
                self.commit(&text, ctx).await
            }
            Frame::TranscriptPartial { text } => {
                self.partial.clone_from(&text);
                ctx.push_downstream(Frame::TranscriptPartial { text }).await
            }
            Frame::TranscriptFinal { text } if self.in_turn => {
                self.partial.clear();
                let text = text.trim();
                if !text.is_empty() {
                    self.finals.push(text.to_string());
                }
                Ok(())
            }
            Frame::TranscriptFinal { text } => {
                self.partial.clear();
                self.commit(&text, ctx).await
            }
            other => ctx.push_downstream(other).await,
        }
    }
}

/// Sits after the reasoning bridge and records each finished assistant reply.
/// A reply that ended with an `Error` frame is not recorded.
pub struct AssistantTurnAggregator {
    conversation: Conversation,
    reply: Option<String>,
    failed: bool,
}

impl AssistantTurnAggregator {
    fn finish_turn(&mut self) {
        let reply = self.reply.take().unwrap_or_default();
        let failed = std::mem::take(&mut self.failed);
        let reply = reply.trim();
        if failed {
            debug!("assistant turn failed, not recorded");
        } else if !reply.is_empty() {
            self.conversation.push(ChatMessage::assistant(reply));
        }
    }
}

#[async_trait]
impl Stage for AssistantTurnAggregator {
    fn name(&self) -> &'static str {
        "assistant_aggregator"
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
                    self.reply = Some(String::new());
                    self.failed = false;
                }
                Frame::TextDelta { text } => {
                    self.reply.get_or_insert_with(String::new).push_str(text);
                }
                Frame::Error { .. } if self.reply.is_some() => self.failed = true,
                Frame::TurnEnd => self.finish_turn(),
                _ => {}
            }
        }
        ctx.push(frame, direction).await
    }

    async fn flush(&mut self, _ctx: &StageContext) -> Result<(), FrameError> {
        if self.reply.is_some() {
            self.finish_turn();
        }
        Ok(())
    }
}
