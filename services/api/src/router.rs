//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    agents::Agent,
    handlers,
    models::{
        AgentList, ChatResponse, ConnectResponse, ErrorResponse, HealthResponse, StatusResponse,
        VoiceSessionInfo,
    },
    registry::TransportKind,
    signaling::{CandidatePayload, CandidateRequest, IceServer, OfferAnswer, OfferRequest, PeerState},
    state::AppState,
    text_relay::{RelayRequest, TextSessionInfo},
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::connect,
        handlers::connect_room,
        handlers::offer,
        handlers::add_candidate,
        handlers::close_connection,
        handlers::get_voice_session,
        handlers::delete_voice_session,
        handlers::chat_stream,
        handlers::chat,
        handlers::list_agents,
        handlers::get_text_session,
        handlers::delete_text_session,
    ),
    components(
        schemas(
            HealthResponse, ConnectResponse, StatusResponse, ErrorResponse, ChatResponse,
            AgentList, Agent, VoiceSessionInfo, TransportKind, PeerState, IceServer,
            OfferRequest, OfferAnswer, CandidateRequest, CandidatePayload,
            RelayRequest, TextSessionInfo
        )
    ),
    tags(
        (name = "Voice Relay API", description = "Voice session setup and text relay for the voice assistant backend")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/connect", post(handlers::connect))
        .route("/connect/room", post(handlers::connect_room))
        .route(
            "/api/offer",
            post(handlers::offer).patch(handlers::add_candidate),
        )
        .route("/api/offer/{pc_id}", delete(handlers::close_connection))
        .route("/ws", get(ws_handler))
        .route(
            "/voice/sessions/{id}",
            get(handlers::get_voice_session).delete(handlers::delete_voice_session),
        )
        .route("/api/chat/stream", post(handlers::chat_stream))
        .route("/api/chat", post(handlers::chat))
        .route("/api/agents", get(handlers::list_agents))
        .route(
            "/api/session/{id}",
            get(handlers::get_text_session).delete(handlers::delete_text_session),
        )
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
