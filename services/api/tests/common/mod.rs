#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tracing::Level;
use voxrelay_api::{
    config::Config,
    registry::{SessionRegistry, TransportKind},
    router::create_router,
    signaling::SignalingEndpoint,
    state::AppState,
    text_relay::TextRelayEndpoint,
    voice::VoiceStack,
};
use voxrelay_core::{
    bridge::ScriptedTransport,
    llm_client::ScriptedEngine,
    speech::{ScriptedRecognizer, SilenceSynthesizer},
};

pub fn test_config(transport: TransportKind) -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        transport,
        openai_api_key: "test-key".into(),
        openai_api_base: "http://127.0.0.1:9/v1".into(),
        chat_model: "test-model".into(),
        stt_model: "whisper-1".into(),
        tts_model: "tts-1".into(),
        tts_voice: "alloy".into(),
        chat_backend_url: "http://127.0.0.1:9/api/chat/stream".into(),
        chat_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(200),
        max_text_sessions: 16,
        input_sample_rate: 16000,
        stun_urls: vec!["stun:stun.example.org:3478".into()],
        turn_urls: vec![],
        turn_username: None,
        turn_credential: None,
        daily_api_key: None,
        daily_api_url: "http://127.0.0.1:9".into(),
        public_ws_url: "ws://localhost:7860/ws".into(),
        greeting_prompt: None,
        log_level: Level::INFO,
    }
}

/// Application state wired to scripted collaborators.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub engine: ScriptedEngine,
}

impl TestApp {
    pub fn new(transport: TransportKind, engine: ScriptedEngine, voice_reply: &[&str]) -> Self {
        let config = test_config(transport);
        let stack = VoiceStack::new(
            Arc::new(ScriptedRecognizer::new(Vec::<String>::new())),
            Arc::new(SilenceSynthesizer::default()),
            Arc::new(ScriptedTransport::replying(voice_reply)),
        );
        let registry = SessionRegistry::new(Arc::new(stack), config.shutdown_grace);
        let signaling = Arc::new(SignalingEndpoint::new(
            registry.clone(),
            config.ice_servers(),
        ));
        let text_relay = TextRelayEndpoint::new(Arc::new(engine.clone()), config.max_text_sessions);

        let state = Arc::new(AppState {
            config: Arc::new(config),
            registry,
            signaling,
            text_relay,
            rooms: None,
        });
        Self { state, engine }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router().oneshot(request).await.unwrap()
    }

    pub async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let response = self.request(method, uri, body).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

pub async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub const OFFER_SDP: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n";
