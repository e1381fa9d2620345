//! API Models
//!
//! Request and response bodies of the HTTP surface, with `utoipa` schemas for
//! the OpenAPI document. Bodies owned by a single component (signaling, text
//! relay) live next to that component.

use crate::agents::Agent;
use crate::registry::TransportKind;
use crate::signaling::{IceServer, PeerState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use voxrelay_core::conversation::ChatMessage;

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    #[schema(example = "voice_backend")]
    pub service: String,
    pub transport: TransportKind,
}

/// How a client should connect, depending on the configured transport.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ConnectResponse {
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServer>>,
}

impl ConnectResponse {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            room_url: None,
            token: None,
            session_id: None,
            ws_url: None,
            offer_url: None,
            ice_servers: None,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    #[schema(example = "ok")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            session_id: None,
        }
    }

    pub fn deleted(session_id: Option<String>) -> Self {
        Self {
            status: "deleted".to_string(),
            session_id,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct AgentList {
    pub agents: Vec<Agent>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct VoiceSessionInfo {
    pub session_id: String,
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_state: Option<PeerState>,
    pub created_at: DateTime<Utc>,
    #[schema(value_type = Vec<Object>)]
    pub conversation: Vec<ChatMessage>,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
