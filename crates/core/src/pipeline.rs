//! Frame Pipeline Assembly
//!
//! A `FramePipeline` is an ordered chain of stages. Each stage runs as its own
//! task and is connected to its neighbours by one bounded channel per
//! direction. All tasks share one `CancellationToken`, which is the pipeline's
//! control channel: cancelling it makes every stage return at its next
//! suspension point.
//!
//! ```text
//!  input ──▶ [stage 0] ──▶ [stage 1] ──▶ ... ──▶ [stage n] ──▶ output
//! upstream ◀──────────◀───────────◀─── ... ◀───────────
//! ```

use crate::frames::{Frame, FrameDirection};
use crate::stage::{FrameError, FrameReceiver, FrameSender, Stage, StageContext, frame_channel};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle events a transport reports for its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    ParticipantLeft,
    /// The client finished its own setup and is ready to talk.
    Ready,
}

/// Handles returned to lifecycle handlers so they can act on their pipeline.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    input: FrameSender,
    cancel: CancellationToken,
}

impl PipelineHandle {
    pub async fn queue_frame(&self, frame: Frame) -> Result<(), FrameError> {
        if matches!(frame, Frame::Cancel) {
            self.cancel.cancel();
            return Ok(());
        }
        self.input.send(frame).await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// One handler per transport event, bound when the pipeline is built.
#[async_trait]
pub trait SessionLifecycle: Send + Sync + 'static {
    async fn on_connected(&self, _pipeline: &PipelineHandle) {}
    async fn on_disconnected(&self, _pipeline: &PipelineHandle) {}
    async fn on_participant_left(&self, _pipeline: &PipelineHandle) {}
    async fn on_ready(&self, _pipeline: &PipelineHandle) {}
}

struct NoLifecycle;

impl SessionLifecycle for NoLifecycle {}

/// Outcome of `FramePipeline::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Tasks that had not returned within the grace period and were aborted.
    pub aborted: usize,
}

pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    capacity: usize,
    cancel: CancellationToken,
    span: Span,
    lifecycle: Box<dyn SessionLifecycle>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Span every stage task runs in.
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn lifecycle(mut self, lifecycle: impl SessionLifecycle) -> Self {
        self.lifecycle = Box::new(lifecycle);
        self
    }

    /// Wires the channels and spawns one task per stage plus the lifecycle
    /// task. Must be called from within a tokio runtime.
    pub fn build(self) -> FramePipeline {
        let Self {
            stages,
            capacity,
            cancel,
            span,
            lifecycle,
        } = self;

        let (input, mut next_down_rx) = frame_channel(capacity, cancel.clone());
        let (mut prev_up_tx, upstream) = frame_channel(capacity, cancel.clone());
        let mut tasks = Vec::with_capacity(stages.len() + 1);

        for stage in stages {
            let (down_tx, down_rx_for_next) = frame_channel(capacity, cancel.clone());
            let (up_tx_for_next, up_rx) = frame_channel(capacity, cancel.clone());
            let ctx = StageContext::new(down_tx, prev_up_tx, cancel.clone());
            let stage_span = tracing::debug_span!(parent: &span, "stage", name = stage.name());
            let down_rx = std::mem::replace(&mut next_down_rx, down_rx_for_next);
            tasks.push(tokio::spawn(
                run_stage(stage, down_rx, up_rx, ctx).instrument(stage_span),
            ));
            prev_up_tx = up_tx_for_next;
        }

        // Nothing feeds the last stage from the output side.
        drop(prev_up_tx);

        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = PipelineHandle {
            input: input.clone(),
            cancel: cancel.clone(),
        };
        tasks.push(tokio::spawn(
            run_lifecycle(lifecycle, events_rx, handle, cancel.clone()).instrument(span),
        ));

        FramePipeline {
            input,
            output: Some(next_down_rx),
            upstream: Some(upstream),
            events,
            cancel,
            tasks,
        }
    }
}

/// A running chain of stages.
pub struct FramePipeline {
    input: FrameSender,
    output: Option<FrameReceiver>,
    upstream: Option<FrameReceiver>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FramePipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            cancel: CancellationToken::new(),
            span: Span::none(),
            lifecycle: Box::new(NoLifecycle),
        }
    }

    /// Sender feeding the first stage.
    pub fn input(&self) -> FrameSender {
        self.input.clone()
    }

    /// Frames leaving the last stage. Can be taken once.
    pub fn take_output(&mut self) -> Option<FrameReceiver> {
        self.output.take()
    }

    /// Frames pushed upstream out of the first stage. Can be taken once.
    pub fn take_upstream(&mut self) -> Option<FrameReceiver> {
        self.upstream.take()
    }

    pub fn events(&self) -> mpsc::Sender<TransportEvent> {
        self.events.clone()
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            input: self.input.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queues a frame at the pipeline input. `Cancel` skips the data path and
    /// fires the control token directly.
    pub async fn queue_frame(&self, frame: Frame) -> Result<(), FrameError> {
        self.handle().queue_frame(frame).await
    }

    /// Cancels every stage and waits up to `grace` for their tasks to return.
    /// Tasks still running after that are aborted.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        let mut report = ShutdownReport::default();
        for mut task in std::mem::take(&mut self.tasks) {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                report.aborted += 1;
            }
        }
        if report.aborted > 0 {
            warn!(aborted = report.aborted, "stage tasks ignored cancellation and were aborted");
        }
        report
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_stage(
    mut stage: Box<dyn Stage>,
    mut down_rx: FrameReceiver,
    mut up_rx: FrameReceiver,
    ctx: StageContext,
) {
    let mut upstream_open = true;
    loop {
        let (frame, direction) = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => break,
            frame = down_rx.recv() => match frame {
                Some(frame) => (frame, FrameDirection::Downstream),
                None => {
                    if let Err(e) = stage.flush(&ctx).await {
                        debug!(error = %e, "flush interrupted");
                    }
                    break;
                }
            },
            frame = up_rx.recv(), if upstream_open => match frame {
                Some(frame) => (frame, FrameDirection::Upstream),
                None => {
                    upstream_open = false;
                    continue;
                }
            },
        };

        if matches!(frame, Frame::Cancel) {
            info!("cancel frame received, stopping pipeline");
            ctx.cancel();
            break;
        }

        if let Err(e) = stage.process(frame, direction, &ctx).await {
            debug!(error = %e, "stage stopped");
            break;
        }
    }
    debug!("stage task finished");
}

async fn run_lifecycle(
    lifecycle: Box<dyn SessionLifecycle>,
    mut events: mpsc::Receiver<TransportEvent>,
    pipeline: PipelineHandle,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        debug!(?event, "transport event");
        match event {
            TransportEvent::Connected => lifecycle.on_connected(&pipeline).await,
            TransportEvent::Disconnected => lifecycle.on_disconnected(&pipeline).await,
            TransportEvent::ParticipantLeft => lifecycle.on_participant_left(&pipeline).await,
            TransportEvent::Ready => lifecycle.on_ready(&pipeline).await,
        }
    }
}
