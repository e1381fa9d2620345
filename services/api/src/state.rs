//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session
//! registry, the ingress endpoints and the service clients shared by all
//! handlers.

use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::room::RoomProvisioner;
use crate::signaling::SignalingEndpoint;
use crate::text_relay::TextRelayEndpoint;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub signaling: Arc<SignalingEndpoint>,
    pub text_relay: TextRelayEndpoint,
    /// Present when managed rooms are configured.
    pub rooms: Option<Arc<dyn RoomProvisioner>>,
}
