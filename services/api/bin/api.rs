//! Main Entrypoint for the Voice Relay API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the speech, reasoning and room clients.
//! 3. Building the session registry and the ingress endpoints.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and tearing every session down on shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use voxrelay_api::{
    config::Config,
    registry::SessionRegistry,
    room::{DailyRoomProvisioner, RoomProvisioner},
    router::create_router,
    signaling::SignalingEndpoint,
    state::AppState,
    text_relay::TextRelayEndpoint,
    voice::VoiceStack,
};
use voxrelay_core::{
    bridge::HttpReasoningTransport,
    llm_client::OpenAICompatibleClient,
    speech::{OpenAiRecognizer, OpenAiSynthesizer},
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let openai_config = OpenAIConfig::new()
        .with_api_key(&config.openai_api_key)
        .with_api_base(&config.openai_api_base);

    let voice_stack = VoiceStack::new(
        Arc::new(OpenAiRecognizer::new(
            openai_config.clone(),
            config.stt_model.clone(),
        )),
        Arc::new(OpenAiSynthesizer::new(
            openai_config.clone(),
            &config.tts_model,
            &config.tts_voice,
        )),
        Arc::new(HttpReasoningTransport::new(config.chat_backend_url.clone())),
    )
    .with_recognition_rate(config.input_sample_rate)
    .with_turn_timeout(config.chat_timeout)
    .with_greeting(config.greeting_prompt.clone());
    info!(
        synthesis_rate = voice_stack.synthesis_rate(),
        "Voice pipeline configured."
    );

    let registry = SessionRegistry::new(Arc::new(voice_stack), config.shutdown_grace);
    let signaling = Arc::new(SignalingEndpoint::new(
        registry.clone(),
        config.ice_servers(),
    ));
    let text_relay = TextRelayEndpoint::new(
        Arc::new(OpenAICompatibleClient::new(
            openai_config,
            config.chat_model.clone(),
        )),
        config.max_text_sessions,
    );
    let rooms = config.daily_api_key.as_ref().map(|key| {
        Arc::new(DailyRoomProvisioner::new(config.daily_api_url.clone(), key.clone()))
            as Arc<dyn RoomProvisioner>
    });
    if rooms.is_none() {
        info!("No room API key set; managed rooms are disabled.");
    }

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        registry: registry.clone(),
        signaling,
        text_relay,
        rooms,
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        transport = %config.transport,
        model = %config.chat_model,
        reasoning_url = %config.chat_backend_url,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(sessions = registry.len(), "Server stopped. Closing live sessions...");
    registry.shutdown_all().await;
    info!("Server has shut down.");
    Ok(())
}
