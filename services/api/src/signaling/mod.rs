//! Peer-to-peer signaling: offer/answer and trickle ICE.
//!
//! Every accepted offer creates a `PeerToPeer` session in the registry, keyed
//! by session id and by the connection id that trickle requests carry.

pub mod peer;
pub mod sdp;

pub use peer::{
    CandidateOutcome, CandidatePayload, IceCandidate, IceServer, PeerConnection, PeerState,
};
pub use sdp::MediaIdentity;

use crate::registry::{RegistryError, Session, SessionRegistry};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use voxrelay_core::TransportEvent;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),
    #[error("cannot {action} while connection is {state}")]
    InvalidState {
        state: PeerState,
        action: &'static str,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct OfferRequest {
    pub sdp: Option<String>,
    /// Defaults to `"offer"`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub session_id: Option<String>,
    /// Existing connection this offer replaces.
    pub pc_id: Option<String>,
    #[serde(default)]
    pub restart_pc: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OfferAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub pc_id: String,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CandidateRequest {
    pub pc_id: Option<String>,
    /// `null` or absent marks the end of candidates.
    pub candidate: Option<CandidatePayload>,
}

/// Times one offer retries registration after losing a race to a concurrent
/// offer for the same session.
const MAX_OFFER_ATTEMPTS: usize = 8;

fn lock_peer(peer: &Mutex<PeerConnection>) -> MutexGuard<'_, PeerConnection> {
    peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SignalingEndpoint {
    registry: Arc<SessionRegistry>,
    ice_servers: Vec<IceServer>,
    identity: MediaIdentity,
}

impl SignalingEndpoint {
    pub fn new(registry: Arc<SessionRegistry>, ice_servers: Vec<IceServer>) -> Self {
        Self {
            registry,
            ice_servers,
            identity: MediaIdentity::generate(),
        }
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Accepts a remote offer and returns the local answer.
    ///
    /// The request is fully validated before anything is torn down or
    /// created. An offer naming a live session or connection replaces it.
    /// Concurrent offers for one session id also replace each other, so the
    /// last one to register wins; only after `MAX_OFFER_ATTEMPTS` lost races
    /// does an offer fail with a registry conflict.
    pub async fn offer(&self, request: OfferRequest) -> Result<OfferAnswer, SignalingError> {
        let sdp = request
            .sdp
            .filter(|sdp| !sdp.trim().is_empty())
            .ok_or(SignalingError::MissingField("sdp"))?;
        let kind = request.kind.as_deref().unwrap_or("offer");
        if kind != "offer" {
            return Err(SignalingError::InvalidDescription(format!(
                "expected an offer, got '{kind}'"
            )));
        }
        let offer =
            sdp::parse_offer(&sdp).map_err(|e| SignalingError::InvalidDescription(e.to_string()))?;

        let mut session_id = request.session_id;
        if let Some(old_pc_id) = &request.pc_id {
            if let Some(previous) = self.registry.get_by_connection_id(old_pc_id) {
                info!(pc_id = %old_pc_id, restart = request.restart_pc, "replacing peer connection");
                session_id.get_or_insert_with(|| previous.id().to_string());
                self.registry.destroy(previous.id()).await;
            }
        }
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut attempt = 1;
        loop {
            if self.registry.get(&session_id).is_some() {
                info!(%session_id, "new offer replaces existing session");
                self.registry.destroy(&session_id).await;
            }

            let pc_id = Uuid::new_v4().to_string();
            let mut peer = PeerConnection::new(pc_id.clone(), self.ice_servers.clone());
            let answer = peer.apply_offer(offer.clone(), &self.identity)?;

            let session = match self.registry.create_peer(session_id.clone(), peer) {
                Ok(session) => session,
                Err(RegistryError::AlreadyExists(_)) if attempt < MAX_OFFER_ATTEMPTS => {
                    debug!(%session_id, attempt, "concurrent offer registered first, replacing it");
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(peer) = session.peer() {
                let applied = lock_peer(peer).begin_negotiation()?;
                info!(%session_id, %pc_id, applied, "offer accepted");
            }

            return Ok(OfferAnswer {
                sdp: answer,
                kind: "answer".to_string(),
                session_id,
                pc_id,
                ice_servers: self.ice_servers.clone(),
            });
        }
    }

    /// Adds one trickled candidate. A missing candidate is the end-of-candidates
    /// signal and succeeds without touching any connection.
    pub fn add_candidate(
        &self,
        request: CandidateRequest,
    ) -> Result<Option<CandidateOutcome>, SignalingError> {
        let Some(payload) = request.candidate else {
            return Ok(None);
        };
        let pc_id = request.pc_id.ok_or(SignalingError::MissingField("pc_id"))?;
        let candidate = payload.into_candidate()?;
        let session = self.peer_session(&pc_id)?;
        let peer = session
            .peer()
            .ok_or_else(|| SignalingError::UnknownConnection(pc_id.clone()))?;
        let outcome = lock_peer(peer).add_candidate(candidate)?;
        debug!(%pc_id, ?outcome, "candidate received");
        Ok(Some(outcome))
    }

    /// Reported by the media plane once the connection is established.
    pub async fn mark_connected(&self, pc_id: &str) -> Result<(), SignalingError> {
        let session = self.peer_session(pc_id)?;
        if let Some(peer) = session.peer() {
            lock_peer(peer).mark_connected()?;
        }
        session.notify(TransportEvent::Connected).await;
        Ok(())
    }

    /// Closes the connection and destroys its session.
    pub async fn close(&self, pc_id: &str) -> Result<(), SignalingError> {
        let session = self.peer_session(pc_id)?;
        if let Some(peer) = session.peer() {
            lock_peer(peer).close();
        }
        info!(%pc_id, session_id = %session.id(), "peer connection closed");
        self.registry.destroy(session.id()).await;
        Ok(())
    }

    /// Marks the connection failed and destroys its session.
    pub async fn fail(&self, pc_id: &str) -> Result<(), SignalingError> {
        let session = self.peer_session(pc_id)?;
        if let Some(peer) = session.peer() {
            lock_peer(peer).fail();
        }
        warn!(%pc_id, session_id = %session.id(), "peer connection failed");
        self.registry.destroy(session.id()).await;
        Ok(())
    }

    fn peer_session(&self, pc_id: &str) -> Result<Arc<Session>, SignalingError> {
        self.registry
            .get_by_connection_id(pc_id)
            .ok_or_else(|| SignalingError::UnknownConnection(pc_id.to_string()))
    }
}
