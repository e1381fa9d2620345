//! Remote Reasoning Bridge
//!
//! Turns each final user transcript into one streaming call to the remote
//! reasoning service and re-emits the reply as ordered `TextDelta` frames,
//! bracketed by `TurnStart` and `TurnEnd`.

use crate::frames::{Frame, FrameDirection};
use crate::protocol::{LineDecoder, StreamEvent, parse_record};
use crate::stage::{FrameError, Stage, StageContext};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use serde_json::json;
use std::collections::VecDeque;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("could not reach reasoning service: {0}")]
    Connect(String),
    #[error("reasoning service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reasoning service did not finish within {0:?}")]
    Timeout(Duration),
    #[error("reasoning service reported an error: {0}")]
    Upstream(String),
    #[error("reply ended with an unreadable record: {0}")]
    MalformedTerminal(String),
    #[error("reasoning service sent a line longer than {0} bytes")]
    LineTooLong(usize),
}

/// One reasoning call: the user's utterance within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BridgeError>> + Send>>;

/// Opens the raw byte stream of one reasoning call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningTransport: Send + Sync {
    async fn open(&self, request: &TurnRequest) -> Result<ByteStream, BridgeError>;
}

/// Posts turns to a text relay endpoint over HTTP.
pub struct HttpReasoningTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpReasoningTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReasoningTransport for HttpReasoningTransport {
    async fn open(&self, request: &TurnRequest) -> Result<ByteStream, BridgeError> {
        // The service owns the history for this session id.
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "message": request.message,
                "session_id": request.session_id,
                "history": [],
            }))
            .send()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| BridgeError::Connect(e.to_string()))),
        ))
    }
}

/// Serves a fixed body. Used by tests and offline runs.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    reply: Result<Vec<Bytes>, BridgeError>,
}

impl ScriptedTransport {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self { reply: Ok(chunks) }
    }

    /// One chunk per line, each terminated by `\n`.
    pub fn lines(lines: &[&str]) -> Self {
        Self::new(
            lines
                .iter()
                .map(|line| Bytes::from(format!("{line}\n")))
                .collect(),
        )
    }

    /// A reply streaming `fragments` as text records and then a done record.
    pub fn replying(fragments: &[&str]) -> Self {
        let mut records: Vec<String> = fragments
            .iter()
            .map(|f| StreamEvent::text(*f).to_record())
            .collect();
        records.push(StreamEvent::Done { session_id: None }.to_record());
        Self::new(records.into_iter().map(Bytes::from).collect())
    }

    pub fn failing(error: BridgeError) -> Self {
        Self { reply: Err(error) }
    }
}

#[async_trait]
impl ReasoningTransport for ScriptedTransport {
    async fn open(&self, _request: &TurnRequest) -> Result<ByteStream, BridgeError> {
        let chunks = self.reply.clone()?;
        Ok(Box::pin(stream::iter(
            chunks.into_iter().map(Ok::<Bytes, BridgeError>),
        )))
    }
}

/// What a turn yields, in order: zero or more fragments, then exactly one of
/// `Completed` or `Failed`. A cancelled turn just ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Fragment(String),
    Completed,
    Failed(BridgeError),
}

/// Bridge between a voice session and the remote reasoning service.
#[derive(Clone)]
pub struct RemoteReasoningBridge {
    transport: Arc<dyn ReasoningTransport>,
    session_id: String,
    timeout: Duration,
}

impl RemoteReasoningBridge {
    pub fn new(transport: Arc<dyn ReasoningTransport>, session_id: impl Into<String>) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
            timeout: DEFAULT_TURN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Streams the reply to one utterance.
    ///
    /// Nothing is sent until the stream is first polled. Each call opens a new
    /// request; a stream cannot be resumed. Once `cancel` fires the stream ends
    /// without yielding anything further, and dropping it closes the request.
    pub fn stream_turn(
        &self,
        utterance: impl Into<String>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = BridgeEvent> + Send + 'static {
        let state = TurnState::Pending {
            transport: self.transport.clone(),
            request: TurnRequest {
                session_id: self.session_id.clone(),
                message: utterance.into(),
            },
            cancel,
            timeout: self.timeout,
        };
        stream::unfold(state, next_event)
    }
}

enum TurnState {
    Pending {
        transport: Arc<dyn ReasoningTransport>,
        request: TurnRequest,
        cancel: CancellationToken,
        timeout: Duration,
    },
    Streaming(Box<OpenTurn>),
    Finished,
}

struct OpenTurn {
    body: ByteStream,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    cancel: CancellationToken,
    timeout: Duration,
    deadline: Instant,
    eof: bool,
    /// The last non-blank line that failed to parse, cleared by any good record.
    last_malformed: Option<String>,
}

async fn next_event(state: TurnState) -> Option<(BridgeEvent, TurnState)> {
    let mut turn = match state {
        TurnState::Finished => return None,
        TurnState::Streaming(turn) => turn,
        TurnState::Pending {
            transport,
            request,
            cancel,
            timeout,
        } => {
            let deadline = Instant::now() + timeout;
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = sleep_until(deadline) => Err(BridgeError::Timeout(timeout)),
                opened = transport.open(&request) => opened,
            };
            match opened {
                Ok(body) => Box::new(OpenTurn {
                    body,
                    decoder: LineDecoder::new(),
                    ready: VecDeque::new(),
                    cancel,
                    timeout,
                    deadline,
                    eof: false,
                    last_malformed: None,
                }),
                Err(e) => return Some((BridgeEvent::Failed(e), TurnState::Finished)),
            }
        }
    };

    loop {
        if turn.cancel.is_cancelled() {
            return None;
        }

        while let Some(line) = turn.ready.pop_front() {
            match parse_record(&line) {
                Ok(None) => {}
                Ok(Some(StreamEvent::Text { content })) => {
                    turn.last_malformed = None;
                    if !content.is_empty() {
                        return Some((BridgeEvent::Fragment(content), TurnState::Streaming(turn)));
                    }
                }
                Ok(Some(StreamEvent::Done { .. })) => {
                    return Some((BridgeEvent::Completed, TurnState::Finished));
                }
                Ok(Some(StreamEvent::Error { error })) => {
                    return Some((
                        BridgeEvent::Failed(BridgeError::Upstream(error)),
                        TurnState::Finished,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed reasoning record");
                    turn.last_malformed = Some(e.to_string());
                }
            }
        }

        if turn.eof {
            let event = match turn.last_malformed.take() {
                Some(reason) => BridgeEvent::Failed(BridgeError::MalformedTerminal(reason)),
                None => BridgeEvent::Completed,
            };
            return Some((event, TurnState::Finished));
        }

        let chunk = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return None,
            _ = sleep_until(turn.deadline) => {
                return Some((BridgeEvent::Failed(BridgeError::Timeout(turn.timeout)), TurnState::Finished));
            }
            chunk = turn.body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => match turn.decoder.push(&bytes) {
                Ok(lines) => turn.ready.extend(lines),
                Err(e) => {
                    warn!(error = %e, "abandoning reply with an oversized record");
                    return Some((
                        BridgeEvent::Failed(BridgeError::LineTooLong(e.limit)),
                        TurnState::Finished,
                    ));
                }
            },
            Some(Err(e)) => return Some((BridgeEvent::Failed(e), TurnState::Finished)),
            None => {
                let tail = turn.decoder.finish();
                turn.ready.extend(tail);
                turn.eof = true;
            }
        }
    }
}

#[async_trait]
impl Stage for RemoteReasoningBridge {
    fn name(&self) -> &'static str {
        "reasoning_bridge"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: FrameDirection,
        ctx: &StageContext,
    ) -> Result<(), FrameError> {
        let text = match (&frame, direction) {
            (Frame::TranscriptFinal { text }, FrameDirection::Downstream) => text.clone(),
            _ => return ctx.push(frame, direction).await,
        };

        ctx.push_downstream(frame).await?;
        ctx.push_downstream(Frame::TurnStart).await?;

        let mut fragments = 0usize;
        let mut events = pin!(self.stream_turn(text, ctx.cancel_token().clone()));
        while let Some(event) = events.next().await {
            match event {
                BridgeEvent::Fragment(text) => {
                    fragments += 1;
                    ctx.push_downstream(Frame::text_delta(text)).await?;
                }
                BridgeEvent::Completed => {
                    debug!(fragments, "reasoning turn completed");
                    break;
                }
                BridgeEvent::Failed(e) => {
                    warn!(session_id = %self.session_id, error = %e, "reasoning turn failed");
                    ctx.push_downstream(Frame::error(e.to_string())).await?;
                    break;
                }
            }
        }

        if ctx.is_cancelled() {
            info!(session_id = %self.session_id, "reasoning turn cancelled");
            return Err(FrameError::Cancelled);
        }
        ctx.push_downstream(Frame::TurnEnd).await
    }
}
