//! Session Registry
//!
//! The process-wide table of live voice sessions. Sessions are indexed by id
//! and, for peer-to-peer sessions, by connection id as well. Both indexes sit
//! behind one lock so a lookup never sees one entry without the other.

use crate::signaling::PeerConnection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use voxrelay_core::conversation::Conversation;
use voxrelay_core::{FramePipeline, FrameReceiver, FrameSender, TransportEvent};

/// How a voice client is connected to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum TransportKind {
    #[serde(rename = "daily")]
    ManagedRoom,
    #[serde(rename = "websocket")]
    Socket,
    #[serde(rename = "smallwebrtc")]
    PeerToPeer,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::ManagedRoom => "daily",
            TransportKind::Socket => "websocket",
            TransportKind::PeerToPeer => "smallwebrtc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "managed_room" | "daily" => Ok(TransportKind::ManagedRoom),
            "socket" | "websocket" => Ok(TransportKind::Socket),
            "peer_to_peer" | "smallwebrtc" | "webrtc" => Ok(TransportKind::PeerToPeer),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session '{0}' already exists")]
    AlreadyExists(String),
    #[error("session '{0}' not found")]
    UnknownSession(String),
    #[error("connection '{0}' not found")]
    UnknownConnection(String),
}

/// Everything a factory needs to build the pipeline for a new session.
pub struct SessionSeed {
    pub id: String,
    pub transport: TransportKind,
    pub conversation: Conversation,
    pub teardown: Teardown,
}

/// Builds the frame pipeline of each new session.
pub trait PipelineFactory: Send + Sync + 'static {
    fn build(&self, seed: SessionSeed) -> FramePipeline;
}

/// Lets code running inside a session ask for that session to be destroyed.
#[derive(Clone)]
pub struct Teardown {
    registry: Weak<SessionRegistry>,
    session_id: String,
}

impl Teardown {
    /// Schedules `destroy` on a separate task, so a stage or lifecycle handler
    /// can call it without waiting on its own shutdown.
    pub fn request(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            registry.destroy(&session_id).await;
        });
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// One live voice session.
pub struct Session {
    id: String,
    transport: TransportKind,
    connection_id: Option<String>,
    conversation: Conversation,
    input: FrameSender,
    events: mpsc::Sender<TransportEvent>,
    output: Mutex<Option<FrameReceiver>>,
    upstream: Mutex<Option<FrameReceiver>>,
    peer: Option<Arc<Mutex<PeerConnection>>>,
    pipeline: tokio::sync::Mutex<Option<FramePipeline>>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Where the transport writes inbound frames.
    pub fn input(&self) -> FrameSender {
        self.input.clone()
    }

    /// Frames for the transport to deliver. Taken once by the transport writer.
    pub fn take_output(&self) -> Option<FrameReceiver> {
        lock_slot(&self.output).take()
    }

    pub fn take_upstream(&self) -> Option<FrameReceiver> {
        lock_slot(&self.upstream).take()
    }

    pub fn peer(&self) -> Option<&Arc<Mutex<PeerConnection>>> {
        self.peer.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Reports a transport event to the session's lifecycle handlers.
    pub async fn notify(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session_id = %self.id, ?event, "session already stopped, event ignored");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

fn lock_slot<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Indexes {
    sessions: HashMap<String, Arc<Session>>,
    connections: HashMap<String, Arc<Session>>,
}

pub struct SessionRegistry {
    indexes: Mutex<Indexes>,
    factory: Arc<dyn PipelineFactory>,
    shutdown_grace: Duration,
    self_ref: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn PipelineFactory>, shutdown_grace: Duration) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            indexes: Mutex::new(Indexes::default()),
            factory,
            shutdown_grace,
            self_ref: self_ref.clone(),
        })
    }

    // The indexes are only ever changed together inside one critical section;
    // a poisoned lock means that invariant may be broken.
    fn lock(&self) -> MutexGuard<'_, Indexes> {
        self.indexes
            .lock()
            .expect("session registry lock poisoned; indexes may be inconsistent")
    }

    /// Creates a session and starts its pipeline.
    pub fn create(
        &self,
        id: impl Into<String>,
        transport: TransportKind,
    ) -> Result<Arc<Session>, RegistryError> {
        self.insert(id.into(), transport, None)
    }

    /// Creates a peer-to-peer session indexed by the peer's connection id too.
    pub fn create_peer(
        &self,
        id: impl Into<String>,
        peer: PeerConnection,
    ) -> Result<Arc<Session>, RegistryError> {
        self.insert(id.into(), TransportKind::PeerToPeer, Some(peer))
    }

    fn insert(
        &self,
        id: String,
        transport: TransportKind,
        peer: Option<PeerConnection>,
    ) -> Result<Arc<Session>, RegistryError> {
        let connection_id = peer.as_ref().map(|p| p.pc_id().to_string());
        let mut indexes = self.lock();
        if indexes.sessions.contains_key(&id) {
            return Err(RegistryError::AlreadyExists(id));
        }
        if let Some(pc_id) = &connection_id {
            if indexes.connections.contains_key(pc_id) {
                return Err(RegistryError::AlreadyExists(pc_id.clone()));
            }
        }

        let conversation = Conversation::new();
        let mut pipeline = self.factory.build(SessionSeed {
            id: id.clone(),
            transport,
            conversation: conversation.clone(),
            teardown: Teardown {
                registry: self.self_ref.clone(),
                session_id: id.clone(),
            },
        });

        let session = Arc::new(Session {
            id: id.clone(),
            transport,
            connection_id: connection_id.clone(),
            conversation,
            input: pipeline.input(),
            events: pipeline.events(),
            output: Mutex::new(pipeline.take_output()),
            upstream: Mutex::new(pipeline.take_upstream()),
            peer: peer.map(|p| Arc::new(Mutex::new(p))),
            pipeline: tokio::sync::Mutex::new(Some(pipeline)),
            created_at: Utc::now(),
        });

        indexes.sessions.insert(id.clone(), session.clone());
        if let Some(pc_id) = connection_id {
            indexes.connections.insert(pc_id, session.clone());
        }
        info!(session_id = %id, %transport, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn get_by_connection_id(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.lock().connections.get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tears a session down: cancels its pipeline, waits for in-flight work up
    /// to the grace period, closes its peer connection and removes both index
    /// entries at once.
    ///
    /// Unknown or already destroyed ids are a no-op. A caller racing another
    /// `destroy` of the same id waits for that one to finish. Returns whether
    /// this call did the teardown.
    pub async fn destroy(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };

        let mut slot = session.pipeline.lock().await;
        let Some(pipeline) = slot.take() else {
            return false;
        };

        let report = pipeline.shutdown(self.shutdown_grace).await;
        if report.aborted > 0 {
            warn!(session_id = %id, aborted = report.aborted, "session stages did not stop in time");
        }
        if let Some(peer) = &session.peer {
            lock_slot(peer).close();
        }

        {
            let mut indexes = self.lock();
            let removed = indexes.sessions.remove(id);
            assert!(
                removed.is_some_and(|s| Arc::ptr_eq(&s, &session)),
                "session index out of sync for '{id}'"
            );
            if let Some(pc_id) = &session.connection_id {
                let removed = indexes.connections.remove(pc_id);
                assert!(
                    removed.is_some_and(|s| Arc::ptr_eq(&s, &session)),
                    "connection index out of sync for '{pc_id}'"
                );
            }
        }
        drop(slot);

        info!(
            session_id = %id,
            dropped_audio = session.input.dropped_frames(),
            "session destroyed"
        );
        true
    }

    /// Destroys every live session. Used on process shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.lock().sessions.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "destroying remaining sessions");
        futures::future::join_all(ids.iter().map(|id| self.destroy(id))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{IceServer, PeerState};
    use async_trait::async_trait;
    use voxrelay_core::frames::{Frame, FrameDirection};
    use voxrelay_core::pipeline::{PipelineHandle, SessionLifecycle};
    use voxrelay_core::stage::{FrameError, Stage, StageContext};

    struct Echo;

    #[async_trait]
    impl Stage for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn process(
            &mut self,
            frame: Frame,
            direction: FrameDirection,
            ctx: &StageContext,
        ) -> Result<(), FrameError> {
            ctx.push(frame, direction).await
        }
    }

    struct LeaveOnDisconnect(Teardown);

    #[async_trait]
    impl SessionLifecycle for LeaveOnDisconnect {
        async fn on_disconnected(&self, _pipeline: &PipelineHandle) {
            self.0.request();
        }
    }

    struct EchoFactory;

    impl PipelineFactory for EchoFactory {
        fn build(&self, seed: SessionSeed) -> FramePipeline {
            FramePipeline::builder()
                .stage(Echo)
                .lifecycle(LeaveOnDisconnect(seed.teardown))
                .build()
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(Arc::new(EchoFactory), Duration::from_millis(200))
    }

    fn peer(pc_id: &str) -> PeerConnection {
        PeerConnection::new(pc_id, vec![IceServer::new("stun:stun.example.org")])
    }

    #[test]
    fn test_transport_kind_names() {
        assert_eq!("daily".parse::<TransportKind>(), Ok(TransportKind::ManagedRoom));
        assert_eq!("WebSocket".parse::<TransportKind>(), Ok(TransportKind::Socket));
        assert!("pigeon".parse::<TransportKind>().is_err());
        assert_eq!(
            serde_json::to_string(&TransportKind::PeerToPeer).unwrap(),
            "\"smallwebrtc\""
        );
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = registry();
        let session = registry.create("s1", TransportKind::Socket).unwrap();

        assert_eq!(session.id(), "s1");
        assert!(Arc::ptr_eq(&registry.get("s1").unwrap(), &session));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_existing_session() {
        let registry = registry();
        let first = registry.create("s1", TransportKind::Socket).unwrap();

        let err = registry.create("s1", TransportKind::ManagedRoom).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyExists("s1".into()));
        let current = registry.get("s1").unwrap();
        assert!(Arc::ptr_eq(&current, &first));
        assert_eq!(current.transport(), TransportKind::Socket);
    }

    #[tokio::test]
    async fn test_peer_session_is_indexed_by_connection() {
        let registry = registry();
        let session = registry.create_peer("s1", peer("pc-1")).unwrap();

        assert_eq!(session.connection_id(), Some("pc-1"));
        assert!(Arc::ptr_eq(&registry.get_by_connection_id("pc-1").unwrap(), &session));
    }

    #[tokio::test]
    async fn test_destroy_removes_both_indexes_and_is_idempotent() {
        let registry = registry();
        let session = registry.create_peer("s1", peer("pc-1")).unwrap();
        let output_closed = session.take_output().unwrap();

        assert!(registry.destroy("s1").await);
        assert!(registry.get("s1").is_none());
        assert!(registry.get_by_connection_id("pc-1").is_none());
        assert_eq!(lock_slot(session.peer().unwrap()).state(), PeerState::Closed);
        assert!(session.input().send(Frame::TurnStart).await.is_err());
        drop(output_closed);

        assert!(!registry.destroy("s1").await);
        assert!(!registry.destroy("never-existed").await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_destroy_tears_down_once() {
        let registry = registry();
        registry.create("s1", TransportKind::Socket).unwrap();

        let (a, b) = tokio::join!(registry.destroy("s1"), registry.destroy("s1"));
        assert!(a ^ b, "exactly one caller performs the teardown");
        assert!(registry.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_event_destroys_session() {
        let registry = registry();
        let session = registry.create("s1", TransportKind::Socket).unwrap();

        session.notify(TransportEvent::Disconnected).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.get("s1").is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should be destroyed after disconnect");
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let registry = registry();
        registry.create("a", TransportKind::Socket).unwrap();
        registry.create_peer("b", peer("pc-b")).unwrap();

        registry.shutdown_all().await;
        assert!(registry.is_empty());
        assert!(registry.get_by_connection_id("pc-b").is_none());
    }
}
