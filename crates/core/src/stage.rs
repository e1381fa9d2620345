//! Stage abstraction and the bounded channels that connect stages.

use crate::frames::{Frame, FrameDirection};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a frame could not be delivered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("pipeline was cancelled")]
    Cancelled,
    #[error("frame channel closed")]
    Closed,
}

pub type FrameReceiver = mpsc::Receiver<Frame>;

/// Sending half of a bounded frame channel.
///
/// Audio frames never wait: when the buffer is full the frame is dropped and
/// counted. Every other kind waits for capacity, and the wait ends as soon as
/// the owning pipeline is cancelled.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
}

/// Creates a bounded frame channel tied to a pipeline's cancellation token.
pub fn frame_channel(capacity: usize, cancel: CancellationToken) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FrameSender {
            tx,
            cancel,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

impl FrameSender {
    pub async fn send(&self, frame: Frame) -> Result<(), FrameError> {
        if self.cancel.is_cancelled() {
            return Err(FrameError::Cancelled);
        }

        if frame.is_audio() {
            return match self.tx.try_send(frame) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(dropped, "frame buffer full, dropping audio chunk");
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(FrameError::Closed),
            };
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FrameError::Cancelled),
            sent = self.tx.send(frame) => sent.map_err(|_| FrameError::Closed),
        }
    }

    /// Number of audio frames dropped on this channel so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Everything a stage can reach while processing a frame.
#[derive(Debug, Clone)]
pub struct StageContext {
    downstream: FrameSender,
    upstream: FrameSender,
    cancel: CancellationToken,
}

impl StageContext {
    pub fn new(downstream: FrameSender, upstream: FrameSender, cancel: CancellationToken) -> Self {
        Self {
            downstream,
            upstream,
            cancel,
        }
    }

    pub async fn push(&self, frame: Frame, direction: FrameDirection) -> Result<(), FrameError> {
        match direction {
            FrameDirection::Downstream => self.downstream.send(frame).await,
            FrameDirection::Upstream => self.upstream.send(frame).await,
        }
    }

    pub async fn push_downstream(&self, frame: Frame) -> Result<(), FrameError> {
        self.downstream.send(frame).await
    }

    pub async fn push_upstream(&self, frame: Frame) -> Result<(), FrameError> {
        self.upstream.send(frame).await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels the whole pipeline this stage belongs to.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// One processing unit of a `FramePipeline`.
///
/// `process` must match every frame kind: kinds the stage does not act on are
/// pushed on unchanged in the direction they arrived. Any work that waits on
/// I/O must also wait on `ctx.cancel_token()` so that cancellation is observed
/// at the next suspension point.
#[async_trait]
pub trait Stage: Send + 'static {
    fn name(&self) -> &'static str;

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &StageContext,
    ) -> Result<(), FrameError>;

    /// Called once when the inbound stream ends normally. Not called on cancel.
    async fn flush(&mut self, _ctx: &StageContext) -> Result<(), FrameError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_audio_is_dropped_when_buffer_full() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = frame_channel(1, cancel);

        tx.send(Frame::audio(vec![1u8, 0], 16000)).await.unwrap();
        tx.send(Frame::audio(vec![2u8, 0], 16000)).await.unwrap();

        assert_eq!(tx.dropped_frames(), 1);
        assert_eq!(rx.recv().await, Some(Frame::audio(vec![1u8, 0], 16000)));
    }

    #[tokio::test]
    async fn test_text_waits_and_gives_up_on_cancel() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = frame_channel(1, cancel.clone());
        tx.send(Frame::text_delta("first")).await.unwrap();

        let blocked = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(Frame::text_delta("second")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("send should return after cancel")
            .unwrap();
        assert_eq!(result, Err(FrameError::Cancelled));
    }

    #[tokio::test]
    async fn test_send_on_closed_channel() {
        let (tx, rx) = frame_channel(4, CancellationToken::new());
        drop(rx);
        assert_eq!(tx.send(Frame::TurnEnd).await, Err(FrameError::Closed));
        assert_eq!(
            tx.send(Frame::audio(vec![0u8; 2], 16000)).await,
            Err(FrameError::Closed)
        );
    }

    #[tokio::test]
    async fn test_context_routes_by_direction() {
        let cancel = CancellationToken::new();
        let (down_tx, mut down_rx) = frame_channel(4, cancel.clone());
        let (up_tx, mut up_rx) = frame_channel(4, cancel.clone());
        let ctx = StageContext::new(down_tx, up_tx, cancel);

        ctx.push(Frame::TurnStart, FrameDirection::Downstream).await.unwrap();
        ctx.push(Frame::error("bad"), FrameDirection::Upstream).await.unwrap();

        assert_eq!(down_rx.recv().await, Some(Frame::TurnStart));
        assert_eq!(up_rx.recv().await, Some(Frame::error("bad")));
    }
}
