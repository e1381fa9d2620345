//! Axum Handlers for the REST API
//!
//! Voice connection setup, peer-to-peer signaling, voice session management
//! and the text relay. It uses `utoipa` doc comments to generate OpenAPI
//! documentation.

use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    agents,
    models::{
        AgentList, ChatResponse, ConnectResponse, ErrorResponse, HealthResponse, StatusResponse,
        VoiceSessionInfo,
    },
    registry::{RegistryError, TransportKind},
    room::RoomProvisioner,
    signaling::{CandidateRequest, OfferAnswer, OfferRequest, SignalingError},
    state::AppState,
    text_relay::{RelayError, RelayRequest, TextSessionInfo},
};

pub enum ApiError {
    BadRequest(String),
    NotFound {
        message: String,
        session_id: Option<String>,
    },
    Conflict(String),
    Unavailable(String),
    InternalServerError(anyhow::Error),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound {
            message: message.into(),
            session_id: None,
        }
    }

    fn signaling(err: SignalingError) -> Self {
        match err {
            SignalingError::MissingField(_) | SignalingError::InvalidDescription(_) => {
                ApiError::BadRequest(err.to_string())
            }
            SignalingError::UnknownConnection(_) => ApiError::not_found(err.to_string()),
            SignalingError::InvalidState { .. } => ApiError::Conflict(err.to_string()),
            SignalingError::Registry(RegistryError::AlreadyExists(_)) => {
                ApiError::Conflict(err.to_string())
            }
            SignalingError::Registry(_) => ApiError::not_found(err.to_string()),
        }
    }

    fn relay(err: RelayError) -> Self {
        match err {
            RelayError::UnknownAgent(_) | RelayError::EmptyMessage => {
                ApiError::BadRequest(err.to_string())
            }
            RelayError::Upstream(message) => {
                ApiError::InternalServerError(anyhow::anyhow!(message))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, session_id) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message, None),
            ApiError::NotFound {
                message,
                session_id,
            } => (StatusCode::NOT_FOUND, message, session_id),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message, None),
            ApiError::Unavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message, None),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (StatusCode::INTERNAL_SERVER_ERROR, message, None)
            }
        };
        (status, Json(ErrorResponse { error, session_id })).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn room_provisioner(state: &AppState) -> Result<&Arc<dyn RoomProvisioner>, ApiError> {
    state
        .rooms
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("managed rooms are not configured".to_string()))
}

/// Report service health and the configured transport.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "voice_backend".to_string(),
        transport: state.config.transport,
    })
}

/// Tell a client how to connect with the configured transport.
#[utoipa::path(
    post,
    path = "/connect",
    responses(
        (status = 200, description = "Connection details", body = ConnectResponse),
        (status = 503, description = "Managed rooms are not configured", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn connect(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let transport = state.config.transport;
    let response = match transport {
        TransportKind::ManagedRoom => {
            let rooms = room_provisioner(&state)?;
            let room = rooms.create_room().await?;
            let token = rooms.issue_token(&room).await?;
            ConnectResponse {
                room_url: Some(room.url),
                token: Some(token),
                ..ConnectResponse::new(transport)
            }
        }
        TransportKind::Socket => ConnectResponse {
            ws_url: Some(state.config.public_ws_url.clone()),
            ..ConnectResponse::new(transport)
        },
        TransportKind::PeerToPeer => ConnectResponse {
            offer_url: Some("/api/offer".to_string()),
            ice_servers: Some(state.signaling.ice_servers().to_vec()),
            ..ConnectResponse::new(transport)
        },
    };
    Ok(Json(response))
}

/// Provision a managed room and start its voice session server side.
#[utoipa::path(
    post,
    path = "/connect/room",
    responses(
        (status = 200, description = "Room details with the new session id", body = ConnectResponse),
        (status = 503, description = "Managed rooms are not configured", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn connect_room(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let rooms = room_provisioner(&state)?;
    let room = rooms.create_room().await?;
    let token = rooms.issue_token(&room).await?;

    let session_id = Uuid::new_v4().to_string();
    state
        .registry
        .create(session_id.clone(), TransportKind::ManagedRoom)
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    info!(%session_id, room = %room.name, "room session started");

    Ok(Json(ConnectResponse {
        room_url: Some(room.url),
        token: Some(token),
        session_id: Some(session_id),
        ..ConnectResponse::new(TransportKind::ManagedRoom)
    }))
}

/// Accept a peer-to-peer offer and return the answer.
#[utoipa::path(
    post,
    path = "/api/offer",
    request_body = OfferRequest,
    responses(
        (status = 200, description = "Local answer", body = OfferAnswer),
        (status = 400, description = "Missing or invalid session description", body = ErrorResponse),
        (status = 409, description = "Session is being replaced concurrently", body = ErrorResponse)
    )
)]
pub async fn offer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OfferRequest>,
) -> Result<Json<OfferAnswer>, ApiError> {
    let answer = state
        .signaling
        .offer(payload)
        .await
        .map_err(ApiError::signaling)?;
    Ok(Json(answer))
}

/// Trickle one ICE candidate. A null candidate ends the trickle.
#[utoipa::path(
    patch,
    path = "/api/offer",
    request_body = CandidateRequest,
    responses(
        (status = 200, description = "Candidate accepted", body = StatusResponse),
        (status = 400, description = "Malformed candidate", body = ErrorResponse),
        (status = 404, description = "Unknown connection", body = ErrorResponse),
        (status = 409, description = "Connection is closed", body = ErrorResponse)
    )
)]
pub async fn add_candidate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CandidateRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .signaling
        .add_candidate(payload)
        .map_err(ApiError::signaling)?;
    Ok(Json(StatusResponse::ok()))
}

/// Close a peer connection and destroy its session.
#[utoipa::path(
    delete,
    path = "/api/offer/{pc_id}",
    params(("pc_id" = String, Path, description = "Peer connection id")),
    responses(
        (status = 200, description = "Connection closed", body = StatusResponse),
        (status = 404, description = "Unknown connection", body = ErrorResponse)
    )
)]
pub async fn close_connection(
    State(state): State<Arc<AppState>>,
    Path(pc_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .signaling
        .close(&pc_id)
        .await
        .map_err(ApiError::signaling)?;
    Ok(Json(StatusResponse::ok()))
}

/// Get a live voice session.
#[utoipa::path(
    get,
    path = "/voice/sessions/{id}",
    params(("id" = String, Path, description = "Voice session id")),
    responses(
        (status = 200, description = "Session details", body = VoiceSessionInfo),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn get_voice_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VoiceSessionInfo>, ApiError> {
    let session = state.registry.get(&id).ok_or_else(|| ApiError::NotFound {
        message: "Session not found".to_string(),
        session_id: Some(id.clone()),
    })?;
    let peer_state = session
        .peer()
        .map(|peer| peer.lock().map(|p| p.state()).unwrap_or_else(|p| p.into_inner().state()));

    Ok(Json(VoiceSessionInfo {
        session_id: session.id().to_string(),
        transport: session.transport(),
        pc_id: session.connection_id().map(str::to_string),
        peer_state,
        created_at: session.created_at(),
        conversation: session.conversation().snapshot(),
    }))
}

/// Evict a voice session. Idempotent.
#[utoipa::path(
    delete,
    path = "/voice/sessions/{id}",
    params(("id" = String, Path, description = "Voice session id")),
    responses(
        (status = 200, description = "Session is gone", body = StatusResponse)
    )
)]
pub async fn delete_voice_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<StatusResponse> {
    state.registry.destroy(&id).await;
    Json(StatusResponse::deleted(None))
}

/// Stream a text reply as server-sent events.
#[utoipa::path(
    post,
    path = "/api/chat/stream",
    request_body = RelayRequest,
    responses(
        (status = 200, description = "`data: {json}` events ending with `done` or `error`", content_type = "text/event-stream", body = String),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    )
)]
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RelayRequest>,
) -> Result<Response, ApiError> {
    let events = state.text_relay.send(payload).map_err(ApiError::relay)?;
    let events = events.map(|event| Ok::<Event, Infallible>(Event::default().data(event.to_json())));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

/// Return a complete text reply.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = RelayRequest,
    responses(
        (status = 200, description = "Reply text, or `Error: ...` when the reply failed", body = ChatResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    )
)]
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RelayRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let session_id = payload.session_id.clone();
    let response = match state.text_relay.complete(payload).await {
        Ok(reply) => reply,
        Err(RelayError::Upstream(message)) => {
            warn!(%session_id, error = %message, "chat reply failed");
            format!("Error: {message}")
        }
        Err(e) => return Err(ApiError::relay(e)),
    };
    Ok(Json(ChatResponse {
        response,
        session_id,
    }))
}

/// List the available agents.
#[utoipa::path(
    get,
    path = "/api/agents",
    responses(
        (status = 200, description = "Agent catalog", body = AgentList)
    )
)]
pub async fn list_agents() -> Json<AgentList> {
    Json(AgentList {
        agents: agents::all().to_vec(),
    })
}

/// Get a text session's history.
#[utoipa::path(
    get,
    path = "/api/session/{id}",
    params(("id" = String, Path, description = "Text session id")),
    responses(
        (status = 200, description = "Session history", body = TextSessionInfo),
        (status = 404, description = "Session not found", body = ErrorResponse)
    )
)]
pub async fn get_text_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TextSessionInfo>, ApiError> {
    state
        .text_relay
        .info(&id)
        .map(Json)
        .ok_or(ApiError::NotFound {
            message: "Session not found".to_string(),
            session_id: Some(id),
        })
}

/// Delete a text session's history.
#[utoipa::path(
    delete,
    path = "/api/session/{id}",
    params(("id" = String, Path, description = "Text session id")),
    responses(
        (status = 200, description = "Session deleted", body = StatusResponse)
    )
)]
pub async fn delete_text_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<StatusResponse> {
    state.text_relay.delete(&id);
    Json(StatusResponse::deleted(Some(id)))
}
