//! Text Relay
//!
//! The text-only chat entry point. Each client-chosen session id keeps its own
//! message history and agent binding, independent of any voice session. A
//! reply is streamed as chunk-protocol events and recorded in the history
//! only when it completes without error.

use crate::agents;
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, info};
use utoipa::ToSchema;
use voxrelay_core::conversation::ChatMessage;
use voxrelay_core::llm_client::{ReasoningEngine, ReasoningEvent, ReplyStream};
use voxrelay_core::protocol::StreamEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("{0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RelayRequest {
    pub message: String,
    pub session_id: String,
    /// Overrides the agent's prompt when the session is created.
    pub system_prompt: Option<String>,
    pub agent_id: Option<String>,
}

impl RelayRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: session_id.into(),
            system_prompt: None,
            agent_id: None,
        }
    }
}

/// The persona a text session answers as, fixed when the session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBinding {
    pub agent_id: Option<String>,
    pub system_prompt: String,
}

impl AgentBinding {
    fn resolve(request: &RelayRequest) -> Result<Self, RelayError> {
        if let Some(prompt) = request.system_prompt.as_ref().filter(|p| !p.trim().is_empty()) {
            return Ok(Self {
                agent_id: None,
                system_prompt: prompt.clone(),
            });
        }
        let agent = match &request.agent_id {
            Some(id) => agents::find(id).ok_or_else(|| RelayError::UnknownAgent(id.clone()))?,
            None => agents::default_agent(),
        };
        Ok(Self::from_agent(agent))
    }

    fn from_agent(agent: &agents::Agent) -> Self {
        Self {
            agent_id: Some(agent.id.to_string()),
            system_prompt: agent.prompt.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TextSessionInfo {
    pub session_id: String,
    pub message_count: usize,
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<ChatMessage>,
}

struct TextSession {
    binding: AgentBinding,
    messages: Vec<ChatMessage>,
    last_active: u64,
}

/// Sessions plus a logical clock ordering their activity.
#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, TextSession>,
    clock: u64,
}

impl Sessions {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

type SessionTable = Arc<Mutex<Sessions>>;

fn lock_table(table: &SessionTable) -> MutexGuard<'_, Sessions> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct TextRelayEndpoint {
    engine: Arc<dyn ReasoningEngine>,
    sessions: SessionTable,
    capacity: usize,
}

enum RelayState {
    Start {
        request: RelayRequest,
        binding: Option<AgentBinding>,
    },
    Streaming {
        session_id: String,
        reply: String,
        events: ReplyStream,
    },
    Finished,
}

impl TextRelayEndpoint {
    pub fn new(engine: Arc<dyn ReasoningEngine>, capacity: usize) -> Self {
        Self {
            engine,
            sessions: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Streams the reply to one user message.
    ///
    /// The request is validated here; nothing touches the session table until
    /// the returned stream is first polled. The agent binding is only resolved
    /// for a session that does not exist yet, so `agent_id` and
    /// `system_prompt` are ignored for an existing one. The stream yields text
    /// events and ends with exactly one `done` or `error` event.
    pub fn send(
        &self,
        request: RelayRequest,
    ) -> Result<impl Stream<Item = StreamEvent> + Send + use<>, RelayError> {
        if request.message.trim().is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        let binding = if lock_table(&self.sessions).by_id.contains_key(&request.session_id) {
            None
        } else {
            Some(AgentBinding::resolve(&request)?)
        };
        let engine = self.engine.clone();
        let sessions = self.sessions.clone();
        let capacity = self.capacity;

        let start = RelayState::Start { request, binding };
        Ok(stream::unfold(start, move |state| {
            let engine = engine.clone();
            let sessions = sessions.clone();
            async move {
                match state {
                    RelayState::Start { request, binding } => {
                        let (prompt, history) =
                            match record_user_message(&sessions, capacity, &request, binding) {
                                Ok(recorded) => recorded,
                                Err(e) => {
                                    return Some((StreamEvent::error(e.to_string()), RelayState::Finished));
                                }
                            };
                        let session_id = request.session_id;
                        match engine.stream_reply(&prompt, &history).await {
                            Ok(events) => {
                                advance(&sessions, session_id, String::new(), events).await
                            }
                            Err(e) => {
                                error!(%session_id, error = %e, "reasoning call failed");
                                Some((StreamEvent::error(e.to_string()), RelayState::Finished))
                            }
                        }
                    }
                    RelayState::Streaming {
                        session_id,
                        reply,
                        events,
                    } => advance(&sessions, session_id, reply, events).await,
                    RelayState::Finished => None,
                }
            }
        }))
    }

    /// Runs one exchange to completion and returns the full reply.
    pub async fn complete(&self, request: RelayRequest) -> Result<String, RelayError> {
        let events = self.send(request)?;
        futures::pin_mut!(events);
        let mut reply = String::new();
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Text { content } => reply.push_str(&content),
                StreamEvent::Done { .. } => break,
                StreamEvent::Error { error } => return Err(RelayError::Upstream(error)),
            }
        }
        Ok(reply)
    }

    /// Removes a session's history. Returns whether it existed.
    pub fn delete(&self, session_id: &str) -> bool {
        let removed = lock_table(&self.sessions).by_id.remove(session_id).is_some();
        if removed {
            info!(%session_id, "text session deleted");
        }
        removed
    }

    pub fn info(&self, session_id: &str) -> Option<TextSessionInfo> {
        lock_table(&self.sessions)
            .by_id
            .get(session_id)
            .map(|session| TextSessionInfo {
                session_id: session_id.to_string(),
                message_count: session.messages.len(),
                messages: session.messages.clone(),
            })
    }

    /// The agent a session is bound to, if it exists.
    pub fn binding(&self, session_id: &str) -> Option<AgentBinding> {
        lock_table(&self.sessions)
            .by_id
            .get(session_id)
            .map(|session| session.binding.clone())
    }

    pub fn len(&self) -> usize {
        lock_table(&self.sessions).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Finds or creates the session, appends the user message and returns the
/// prompt and history for the reasoning call.
///
/// A session that disappeared since `send` looked is created from the
/// request, which is resolved again if no binding was carried over.
fn record_user_message(
    sessions: &SessionTable,
    capacity: usize,
    request: &RelayRequest,
    binding: Option<AgentBinding>,
) -> Result<(String, Vec<ChatMessage>), RelayError> {
    let mut table = lock_table(sessions);
    let exists = table.by_id.contains_key(&request.session_id);
    let binding = match binding {
        Some(binding) => Some(binding),
        None if !exists => Some(AgentBinding::resolve(request)?),
        None => None,
    };
    let now = table.tick();
    if !exists && table.by_id.len() >= capacity {
        let oldest = table
            .by_id
            .iter()
            .min_by_key(|(_, session)| session.last_active)
            .map(|(id, _)| id.clone());
        if let Some(oldest) = oldest {
            table.by_id.remove(&oldest);
            info!(evicted = %oldest, capacity, "text session table full, evicted least recently active");
        }
    }

    let session = table
        .by_id
        .entry(request.session_id.clone())
        .or_insert_with(|| {
            info!(session_id = %request.session_id, "text session created");
            TextSession {
                binding: binding.unwrap_or_else(|| AgentBinding::from_agent(agents::default_agent())),
                messages: Vec::new(),
                last_active: now,
            }
        });
    session.last_active = now;
    session.messages.push(ChatMessage::user(request.message.clone()));
    Ok((session.binding.system_prompt.clone(), session.messages.clone()))
}

async fn advance(
    sessions: &SessionTable,
    session_id: String,
    mut reply: String,
    mut events: ReplyStream,
) -> Option<(StreamEvent, RelayState)> {
    loop {
        match events.next().await {
            Some(ReasoningEvent::Text(text)) => {
                if text.is_empty() {
                    continue;
                }
                reply.push_str(&text);
                let next = RelayState::Streaming {
                    session_id,
                    reply,
                    events,
                };
                return Some((StreamEvent::text(text), next));
            }
            Some(ReasoningEvent::Done) | None => {
                if !reply.is_empty() {
                    let mut table = lock_table(sessions);
                    let now = table.tick();
                    if let Some(session) = table.by_id.get_mut(&session_id) {
                        session.messages.push(ChatMessage::assistant(reply));
                        session.last_active = now;
                    }
                }
                return Some((StreamEvent::done(session_id), RelayState::Finished));
            }
            Some(ReasoningEvent::Error(message)) => {
                error!(%session_id, error = %message, "reasoning reply failed");
                return Some((StreamEvent::error(message), RelayState::Finished));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use voxrelay_core::conversation::Role;
    use voxrelay_core::llm_client::ScriptedEngine;

    struct Unreachable;

    #[async_trait]
    impl ReasoningEngine for Unreachable {
        async fn stream_reply(
            &self,
            _system_prompt: &str,
            _history: &[ChatMessage],
        ) -> anyhow::Result<ReplyStream> {
            anyhow::bail!("connection refused")
        }
    }

    async fn collect(relay: &TextRelayEndpoint, request: RelayRequest) -> Vec<StreamEvent> {
        relay.send(request).unwrap().collect().await
    }

    #[tokio::test]
    async fn test_send_streams_and_records_reply() {
        let relay = TextRelayEndpoint::new(Arc::new(ScriptedEngine::replying(&["hi"])), 8);

        let events = collect(&relay, RelayRequest::new("s1", "hello")).await;

        assert_eq!(events, vec![StreamEvent::text("hi"), StreamEvent::done("s1")]);
        let info = relay.info("s1").unwrap();
        assert_eq!(info.message_count, 2);
        assert_eq!(
            info.messages,
            vec![ChatMessage::user("hello"), ChatMessage::assistant("hi")]
        );
    }

    #[tokio::test]
    async fn test_error_record_is_not_appended() {
        let engine = ScriptedEngine::new(vec![ReasoningEvent::Error("boom".into())]);
        let relay = TextRelayEndpoint::new(Arc::new(engine), 8);

        let events = collect(&relay, RelayRequest::new("s1", "hello")).await;

        assert_eq!(events, vec![StreamEvent::error("boom")]);
        let info = relay.info("s1").unwrap();
        assert_eq!(info.messages, vec![ChatMessage::user("hello")]);
    }

    #[tokio::test]
    async fn test_failed_call_yields_single_error_event() {
        let relay = TextRelayEndpoint::new(Arc::new(Unreachable), 8);

        let events = collect(&relay, RelayRequest::new("s1", "hello")).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.contains("refused")));
    }

    #[tokio::test]
    async fn test_history_grows_across_calls() {
        let engine = Arc::new(ScriptedEngine::replying(&["ok"]));
        let relay = TextRelayEndpoint::new(engine.clone(), 8);

        collect(&relay, RelayRequest::new("s1", "one")).await;
        collect(&relay, RelayRequest::new("s1", "two")).await;

        let calls = engine.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].len(), 3);
        assert_eq!(calls[1][2], ChatMessage::user("two"));
        let roles: Vec<Role> = relay.info("s1").unwrap().messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_send_is_lazy_and_validates_up_front() {
        let relay = TextRelayEndpoint::new(Arc::new(ScriptedEngine::replying(&["x"])), 8);

        let pending = relay.send(RelayRequest::new("s1", "hello")).unwrap();
        assert!(relay.info("s1").is_none());
        drop(pending);
        assert!(relay.is_empty());

        let unknown = RelayRequest {
            agent_id: Some("weather-bot".into()),
            ..RelayRequest::new("s2", "hello")
        };
        assert!(matches!(relay.send(unknown), Err(RelayError::UnknownAgent(_))));
        assert!(matches!(
            relay.send(RelayRequest::new("s2", "  ")),
            Err(RelayError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn test_binding_is_fixed_at_creation() {
        let relay = TextRelayEndpoint::new(Arc::new(ScriptedEngine::replying(&["x"])), 8);

        let tutor = RelayRequest {
            agent_id: Some("language-tutor".into()),
            ..RelayRequest::new("s1", "hola")
        };
        collect(&relay, tutor).await;
        let support = RelayRequest {
            agent_id: Some("customer-support".into()),
            ..RelayRequest::new("s1", "again")
        };
        collect(&relay, support).await;

        assert_eq!(
            relay.binding("s1").unwrap().agent_id.as_deref(),
            Some("language-tutor")
        );

        let custom = RelayRequest {
            system_prompt: Some("Answer in one word.".into()),
            ..RelayRequest::new("s2", "hi")
        };
        collect(&relay, custom).await;
        let binding = relay.binding("s2").unwrap();
        assert_eq!(binding.agent_id, None);
        assert_eq!(binding.system_prompt, "Answer in one word.");
    }

    #[tokio::test]
    async fn test_agent_is_only_checked_when_creating_a_session() {
        let relay = TextRelayEndpoint::new(Arc::new(ScriptedEngine::replying(&["x"])), 8);
        collect(&relay, RelayRequest::new("s1", "hello")).await;

        let stale = RelayRequest {
            agent_id: Some("weather-bot".into()),
            ..RelayRequest::new("s1", "again")
        };
        let events = collect(&relay, stale).await;

        assert_eq!(events.last(), Some(&StreamEvent::done("s1")));
        assert_eq!(relay.info("s1").unwrap().message_count, 4);
        assert_eq!(
            relay.binding("s1").unwrap().agent_id.as_deref(),
            Some(agents::DEFAULT_AGENT_ID)
        );
    }

    #[tokio::test]
    async fn test_session_deleted_before_poll_is_recreated_from_request() {
        let engine = Arc::new(ScriptedEngine::replying(&["x"]));
        let relay = TextRelayEndpoint::new(engine.clone(), 8);
        collect(&relay, RelayRequest::new("s1", "hello")).await;

        let unknown = RelayRequest {
            agent_id: Some("weather-bot".into()),
            ..RelayRequest::new("s1", "again")
        };
        let pending = relay.send(unknown).unwrap();
        relay.delete("s1");
        let events: Vec<StreamEvent> = pending.collect().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { error } if error.contains("weather-bot")));
        assert!(relay.info("s1").is_none());
        assert_eq!(engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_and_delete() {
        let relay = TextRelayEndpoint::new(Arc::new(ScriptedEngine::replying(&["a", "b"])), 8);
        assert_eq!(relay.complete(RelayRequest::new("s1", "q")).await.unwrap(), "ab");

        assert!(relay.delete("s1"));
        assert!(!relay.delete("s1"));
        assert!(relay.info("s1").is_none());

        let failing = TextRelayEndpoint::new(Arc::new(Unreachable), 8);
        assert!(matches!(
            failing.complete(RelayRequest::new("s1", "q")).await,
            Err(RelayError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_full_table_evicts_least_recently_active() {
        let relay = TextRelayEndpoint::new(Arc::new(ScriptedEngine::replying(&["x"])), 2);

        collect(&relay, RelayRequest::new("a", "1")).await;
        collect(&relay, RelayRequest::new("b", "1")).await;
        collect(&relay, RelayRequest::new("a", "2")).await;
        collect(&relay, RelayRequest::new("c", "1")).await;

        assert_eq!(relay.len(), 2);
        assert!(relay.info("a").is_some());
        assert!(relay.info("b").is_none());
        assert!(relay.info("c").is_some());
    }
}
