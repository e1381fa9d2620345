//! Manages the WebSocket connection lifecycle for a socket-transport voice session.

use super::protocol::{ClientMessage, ServerMessage};
use crate::registry::{Session, TransportKind};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;
use voxrelay_core::audio::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, decode_base64, is_supported_rate};
use voxrelay_core::frames::Frame;
use voxrelay_core::{FrameError, FrameReceiver, TransportEvent};

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Creates a socket session for the connection and runs it until either side
/// goes away.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("ws_session", %session_id);

    async move {
        let (socket_tx, socket_rx) = socket.split();
        let socket_tx: SocketSink = Arc::new(Mutex::new(socket_tx));

        let session = match state.registry.create(session_id.clone(), TransportKind::Socket) {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "could not create session");
                let _ = send_msg(
                    &mut *socket_tx.lock().await,
                    ServerMessage::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                return;
            }
        };

        let started = ServerMessage::SessionStarted {
            session_id: session_id.clone(),
        };
        if send_msg(&mut *socket_tx.lock().await, started).await.is_err() {
            warn!("client went away before the session started");
            state.registry.destroy(&session_id).await;
            return;
        }
        session.notify(TransportEvent::Connected).await;
        info!("socket session started");

        let writer = spawn_writer(&session, socket_tx.clone());
        if let Err(e) = run_reader(&state, &session, socket_tx, socket_rx, writer).await {
            error!(error = ?e, "socket session ended with error");
        }

        session.notify(TransportEvent::Disconnected).await;
        state.registry.destroy(&session_id).await;
        info!("socket session finished");
    }
    .instrument(span)
    .await
}

/// Forwards everything the pipeline produces to the client until the
/// pipeline's output closes.
fn spawn_writer(session: &Session, socket_tx: SocketSink) -> JoinHandle<()> {
    let output = session.take_output();
    let upstream = session.take_upstream();
    tokio::spawn(
        async move {
            let (Some(mut output), mut upstream) = (output, upstream) else {
                warn!("session output already taken");
                return;
            };
            loop {
                let frame = tokio::select! {
                    frame = output.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                    Some(frame) = recv_upstream(&mut upstream) => frame,
                };
                let Some(message) = ServerMessage::from_frame(frame) else {
                    continue;
                };
                if let Err(e) = send_msg(&mut *socket_tx.lock().await, message).await {
                    debug!(error = %e, "client socket closed, stopping writer");
                    break;
                }
            }
            let _ = socket_tx.lock().await.close().await;
        }
        .in_current_span(),
    )
}

/// Upstream frames that reach the transport are only errors worth showing.
async fn recv_upstream(upstream: &mut Option<FrameReceiver>) -> Option<Frame> {
    loop {
        let frame = match upstream.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        };
        match frame {
            Some(frame @ Frame::Error { .. }) => return Some(frame),
            Some(other) => debug!(kind = %other.kind(), "ignoring upstream frame"),
            None => *upstream = None,
        }
    }
}

/// The main event loop for reading client messages.
async fn run_reader(
    state: &AppState,
    session: &Session,
    socket_tx: SocketSink,
    mut socket_rx: SplitStream<WebSocket>,
    mut writer: JoinHandle<()>,
) -> Result<()> {
    let input = session.input();
    let input_rate = state.config.input_sample_rate;

    loop {
        let frame = tokio::select! {
            _ = &mut writer => {
                info!("session pipeline stopped, closing connection");
                return Ok(());
            }
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Audio { data, sample_rate }) => {
                        let rate = sample_rate.unwrap_or(input_rate);
                        if !is_supported_rate(rate) {
                            warn!(sample_rate = rate, "rejecting audio with unsupported sample rate");
                            send_msg(
                                &mut *socket_tx.lock().await,
                                ServerMessage::Error {
                                    message: format!(
                                        "unsupported sample rate {rate} Hz (expected {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE})"
                                    ),
                                },
                            )
                            .await?;
                            continue;
                        }
                        match decode_base64(&data) {
                            Ok(bytes) => Frame::audio(bytes, rate),
                            Err(e) => {
                                warn!(error = %e, "dropping undecodable audio message");
                                continue;
                            }
                        }
                    }
                    Ok(ClientMessage::TurnStart) => Frame::TurnStart,
                    Ok(ClientMessage::TurnEnd) => Frame::TurnEnd,
                    Ok(ClientMessage::UserText { text }) => Frame::transcript_final(text),
                    Ok(ClientMessage::ClientReady) => {
                        session.notify(TransportEvent::Ready).await;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed client message");
                        send_msg(
                            &mut *socket_tx.lock().await,
                            ServerMessage::Error {
                                message: format!("invalid message: {e}"),
                            },
                        )
                        .await?;
                        continue;
                    }
                },
                Some(Ok(Message::Binary(data))) => Frame::audio(data, input_rate),
                Some(Ok(Message::Close(_))) | None => {
                    info!("client closed the connection");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "error receiving from client socket");
                    break;
                }
            },
        };

        match input.send(frame).await {
            Ok(()) => {}
            Err(FrameError::Cancelled | FrameError::Closed) => {
                info!("session pipeline no longer accepts input");
                break;
            }
        }
    }

    writer.abort();
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
