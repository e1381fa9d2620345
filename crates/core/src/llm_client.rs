use crate::conversation::{ChatMessage, Role};
use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, future, stream};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Events yielded while a reasoning engine streams a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasoningEvent {
    Text(String),
    Done,
    Error(String),
}

/// A reply stream. It ends after the first `Done` or `Error`.
pub type ReplyStream = Pin<Box<dyn Stream<Item = ReasoningEvent> + Send>>;

/// Produces assistant replies for a conversation.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Starts streaming a reply to `history`, whose last entry is the user's message.
    async fn stream_reply(&self, system_prompt: &str, history: &[ChatMessage]) -> Result<ReplyStream>;
}

/// An implementation of `ReasoningEngine` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

fn to_request_messages(
    system_prompt: &str,
    history: &[ChatMessage],
) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt.to_string())
                .build()?
                .into(),
        );
    }
    for message in history {
        let content = message.content.clone();
        let request = match message.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()?
                .into(),
        };
        messages.push(request);
    }
    Ok(messages)
}

/// Turns raw content deltas into a reply stream: empty deltas are skipped, the
/// stream ends with `Done`, and nothing follows an `Error`.
fn reply_events<S>(deltas: S) -> ReplyStream
where
    S: Stream<Item = Result<Option<String>, OpenAIError>> + Send + 'static,
{
    let events = deltas
        .filter_map(|delta| async move {
            match delta {
                Ok(Some(text)) if !text.is_empty() => Some(ReasoningEvent::Text(text)),
                Ok(_) => None,
                Err(e) => Some(ReasoningEvent::Error(e.to_string())),
            }
        })
        .chain(stream::once(async { ReasoningEvent::Done }))
        .scan(false, |ended, event| {
            if *ended {
                return future::ready(None);
            }
            *ended = !matches!(event, ReasoningEvent::Text(_));
            future::ready(Some(event))
        });
    Box::pin(events)
}

#[async_trait]
impl ReasoningEngine for OpenAICompatibleClient {
    async fn stream_reply(&self, system_prompt: &str, history: &[ChatMessage]) -> Result<ReplyStream> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(to_request_messages(system_prompt, history)?)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        Ok(reply_events(stream.map(|result| {
            result.map(|response| {
                response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
            })
        })))
    }
}

/// A `ReasoningEngine` that replays a fixed script and records every history
/// it was asked to continue. Used by tests and local runs without an API key.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    events: Vec<ReasoningEvent>,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedEngine {
    pub fn new(events: Vec<ReasoningEvent>) -> Self {
        Self {
            events,
            calls: Arc::default(),
        }
    }

    /// Streams `fragments` as text and then completes.
    pub fn replying(fragments: &[&str]) -> Self {
        let mut events: Vec<_> = fragments
            .iter()
            .map(|f| ReasoningEvent::Text(f.to_string()))
            .collect();
        events.push(ReasoningEvent::Done);
        Self::new(events)
    }

    /// Histories passed to `stream_reply`, in call order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    async fn stream_reply(&self, _system_prompt: &str, history: &[ChatMessage]) -> Result<ReplyStream> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(history.to_vec());
        }
        Ok(Box::pin(stream::iter(self.events.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_events_skip_empty_and_end_with_done() {
        let deltas = stream::iter(vec![
            Ok(Some("Hel".to_string())),
            Ok(None),
            Ok(Some(String::new())),
            Ok(Some("lo".to_string())),
        ]);
        let events: Vec<_> = reply_events(deltas).collect().await;
        assert_eq!(
            events,
            vec![
                ReasoningEvent::Text("Hel".into()),
                ReasoningEvent::Text("lo".into()),
                ReasoningEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_reply_events_stop_after_error() {
        let deltas = stream::iter(vec![
            Ok(Some("partial".to_string())),
            Err(OpenAIError::InvalidArgument("rate limited".into())),
            Ok(Some("ignored".to_string())),
        ]);
        let events: Vec<_> = reply_events(deltas).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ReasoningEvent::Text("partial".into()));
        assert!(matches!(&events[1], ReasoningEvent::Error(msg) if msg.contains("rate limited")));
    }

    #[test]
    fn test_request_messages_keep_order_and_roles() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello"), ChatMessage::user("news?")];
        let messages = to_request_messages("You are terse.", &history).unwrap();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(messages[3], ChatCompletionRequestMessage::User(_)));
    }

    #[tokio::test]
    async fn test_scripted_engine_records_history() {
        let engine = ScriptedEngine::replying(&["a", "b"]);
        let history = vec![ChatMessage::user("question")];
        let events: Vec<_> = engine.stream_reply("", &history).await.unwrap().collect().await;

        assert_eq!(events.last(), Some(&ReasoningEvent::Done));
        assert_eq!(engine.calls(), vec![history]);
    }
}
