//! Per-connection negotiation state.

use super::SignalingError;
use super::sdp::{MediaIdentity, SessionDescription, build_answer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    HasLocalOffer,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::HasLocalOffer => "has_local_offer",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Closed => "closed",
            PeerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A STUN or TURN server offered to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IceServer {
    pub urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(urls: impl Into<String>) -> Self {
        Self {
            urls: urls.into(),
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, credential: Option<String>) -> Self {
        self.username = username;
        self.credential = credential;
        self
    }
}

/// A normalised remote ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u32,
    pub protocol: String,
    pub priority: u64,
    pub ip: String,
    pub port: u16,
    pub kind: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

impl IceCandidate {
    /// The `a=candidate` attribute value for this candidate.
    pub fn to_sdp_attribute(&self) -> String {
        format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.ip,
            self.port,
            self.kind
        )
    }
}

/// Candidate as sent by browsers in a trickle request. Fields are loosely
/// typed here and validated by `into_candidate`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CandidatePayload {
    pub foundation: Option<String>,
    /// Numeric component id, or `"rtp"`/`"rtcp"`.
    #[schema(value_type = Option<Object>)]
    pub component: Option<Value>,
    pub protocol: Option<String>,
    pub priority: Option<u64>,
    #[serde(alias = "address")]
    pub ip: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u32>,
}

impl CandidatePayload {
    pub fn into_candidate(self) -> Result<IceCandidate, SignalingError> {
        let component = match self.component {
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(SignalingError::MissingField("component"))?,
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "rtp" => 1,
                "rtcp" => 2,
                other => other
                    .parse()
                    .map_err(|_| SignalingError::MissingField("component"))?,
            },
            _ => return Err(SignalingError::MissingField("component")),
        };

        Ok(IceCandidate {
            foundation: self
                .foundation
                .ok_or(SignalingError::MissingField("foundation"))?,
            component,
            protocol: self
                .protocol
                .ok_or(SignalingError::MissingField("protocol"))?
                .to_ascii_lowercase(),
            priority: self.priority.ok_or(SignalingError::MissingField("priority"))?,
            ip: self.ip.ok_or(SignalingError::MissingField("ip"))?,
            port: self.port.ok_or(SignalingError::MissingField("port"))?,
            kind: self.kind.ok_or(SignalingError::MissingField("type"))?,
            sdp_mid: self.sdp_mid,
            sdp_mline_index: self.sdp_mline_index,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Held until negotiation starts.
    Queued,
    Applied,
}

/// One peer connection's descriptions and candidates.
#[derive(Debug)]
pub struct PeerConnection {
    pc_id: String,
    ice_servers: Vec<IceServer>,
    local_description: Option<String>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    applied_candidates: Vec<IceCandidate>,
    state: PeerState,
}

impl PeerConnection {
    pub fn new(pc_id: impl Into<String>, ice_servers: Vec<IceServer>) -> Self {
        Self {
            pc_id: pc_id.into(),
            ice_servers,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            applied_candidates: Vec::new(),
            state: PeerState::New,
        }
    }

    pub fn pc_id(&self) -> &str {
        &self.pc_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn applied_candidates(&self) -> &[IceCandidate] {
        &self.applied_candidates
    }

    fn invalid(&self, action: &'static str) -> SignalingError {
        SignalingError::InvalidState {
            state: self.state,
            action,
        }
    }

    /// Stores the remote offer and produces the local answer.
    pub fn apply_offer(
        &mut self,
        offer: SessionDescription,
        identity: &MediaIdentity,
    ) -> Result<String, SignalingError> {
        if self.state != PeerState::New {
            return Err(self.invalid("apply offer"));
        }
        let answer = build_answer(&offer, identity);
        self.remote_description = Some(offer);
        self.local_description = Some(answer.clone());
        self.state = PeerState::HasLocalOffer;
        Ok(answer)
    }

    /// Moves to `Negotiating` and applies every candidate queued so far.
    /// Returns how many were applied.
    pub fn begin_negotiation(&mut self) -> Result<usize, SignalingError> {
        if self.state != PeerState::HasLocalOffer {
            return Err(self.invalid("begin negotiation"));
        }
        self.state = PeerState::Negotiating;
        let drained = self.pending_candidates.len();
        self.applied_candidates.extend(self.pending_candidates.drain(..));
        debug!(pc_id = %self.pc_id, drained, "negotiation started");
        Ok(drained)
    }

    pub fn add_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, SignalingError> {
        match self.state {
            PeerState::New | PeerState::HasLocalOffer => {
                self.pending_candidates.push_back(candidate);
                Ok(CandidateOutcome::Queued)
            }
            PeerState::Negotiating | PeerState::Connected => {
                self.applied_candidates.push(candidate);
                Ok(CandidateOutcome::Applied)
            }
            PeerState::Closed | PeerState::Failed => Err(self.invalid("add candidate")),
        }
    }

    pub fn mark_connected(&mut self) -> Result<(), SignalingError> {
        if self.state != PeerState::Negotiating {
            return Err(self.invalid("mark connected"));
        }
        self.state = PeerState::Connected;
        Ok(())
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if self.state != PeerState::Closed {
            self.pending_candidates.clear();
            self.state = PeerState::Closed;
        }
    }

    /// Moves a live connection to `Failed`; terminal states are left alone.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.pending_candidates.clear();
            self.state = PeerState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::sdp::parse_offer;
    use serde_json::json;

    fn candidate(port: u16) -> IceCandidate {
        IceCandidate {
            foundation: "1".into(),
            component: 1,
            protocol: "udp".into(),
            priority: 2122260223,
            ip: "192.0.2.10".into(),
            port,
            kind: "host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn offered() -> PeerConnection {
        let mut peer = PeerConnection::new("pc-1", vec![IceServer::new("stun:stun.example.org")]);
        let offer = parse_offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n").unwrap();
        peer.apply_offer(offer, &MediaIdentity::generate()).unwrap();
        peer
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut peer = offered();
        assert_eq!(peer.state(), PeerState::HasLocalOffer);
        assert!(peer.local_description().unwrap().contains("a=mid:0"));
        assert!(peer.remote_description().is_some());

        peer.begin_negotiation().unwrap();
        assert_eq!(peer.state(), PeerState::Negotiating);
        peer.mark_connected().unwrap();
        assert_eq!(peer.state(), PeerState::Connected);
        peer.close();
        assert_eq!(peer.state(), PeerState::Closed);
    }

    #[test]
    fn test_candidate_before_negotiation_is_queued_then_applied() {
        let mut peer = offered();
        assert_eq!(peer.add_candidate(candidate(50000)).unwrap(), CandidateOutcome::Queued);
        assert_eq!(peer.add_candidate(candidate(50001)).unwrap(), CandidateOutcome::Queued);
        assert_eq!(peer.pending_candidates(), 2);
        assert!(peer.applied_candidates().is_empty());

        assert_eq!(peer.begin_negotiation().unwrap(), 2);
        assert_eq!(peer.pending_candidates(), 0);
        let ports: Vec<u16> = peer.applied_candidates().iter().map(|c| c.port).collect();
        assert_eq!(ports, vec![50000, 50001]);

        assert_eq!(peer.add_candidate(candidate(50002)).unwrap(), CandidateOutcome::Applied);
        assert_eq!(peer.applied_candidates().len(), 3);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut peer = PeerConnection::new("pc-1", Vec::new());
        assert!(matches!(
            peer.begin_negotiation(),
            Err(SignalingError::InvalidState { state: PeerState::New, .. })
        ));
        assert!(peer.mark_connected().is_err());

        let mut peer = offered();
        let second = parse_offer("v=0\r\nm=audio 9 RTP/AVP 0\r\n").unwrap();
        assert!(peer.apply_offer(second, &MediaIdentity::generate()).is_err());
    }

    #[test]
    fn test_terminal_states_reject_candidates() {
        let mut peer = offered();
        peer.fail();
        assert_eq!(peer.state(), PeerState::Failed);
        assert!(peer.add_candidate(candidate(1)).is_err());

        // Closing a failed connection is allowed; failing a closed one is not.
        peer.close();
        assert_eq!(peer.state(), PeerState::Closed);
        peer.fail();
        assert_eq!(peer.state(), PeerState::Closed);
    }

    #[test]
    fn test_candidate_payload_normalisation() {
        let payload: CandidatePayload = serde_json::from_value(json!({
            "foundation": "842163049",
            "component": "rtp",
            "protocol": "UDP",
            "priority": 1677729535,
            "address": "198.51.100.7",
            "port": 61665,
            "type": "srflx",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();

        let candidate = payload.into_candidate().unwrap();
        assert_eq!(
            candidate.to_sdp_attribute(),
            "candidate:842163049 1 udp 1677729535 198.51.100.7 61665 typ srflx"
        );
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    }

    #[test]
    fn test_candidate_payload_missing_fields() {
        let payload: CandidatePayload =
            serde_json::from_value(json!({"foundation": "1", "component": 1})).unwrap();
        assert!(matches!(
            payload.into_candidate(),
            Err(SignalingError::MissingField("protocol"))
        ));
    }
}
