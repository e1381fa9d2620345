use crate::registry::TransportKind;
use crate::signaling::IceServer;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;
use voxrelay_core::audio::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, is_supported_rate};

/// Injected as the first user turn when a voice client reports ready.
/// Setting `GREETING_PROMPT` to an empty value turns the greeting off.
pub const DEFAULT_GREETING: &str =
    "Start by greeting the user and asking what news they would like to hear about.";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub transport: TransportKind,
    pub openai_api_key: String,
    pub openai_api_base: String,
    pub chat_model: String,
    pub stt_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub chat_backend_url: String,
    pub chat_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_text_sessions: usize,
    pub input_sample_rate: u32,
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    pub daily_api_key: Option<String>,
    pub daily_api_url: String,
    pub public_ws_url: String,
    pub greeting_prompt: Option<String>,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn greeting_var() -> Option<String> {
    match std::env::var("GREETING_PROMPT") {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value),
        Err(_) => Some(DEFAULT_GREETING.to_string()),
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var_or(name, default)
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn list_var(name: &str, default: &str) -> Vec<String> {
    var_or(name, default)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:7860")?;

        let transport_str = var_or("TRANSPORT_TYPE", "peer_to_peer");
        let transport = transport_str
            .parse::<TransportKind>()
            .map_err(|e| ConfigError::InvalidValue("TRANSPORT_TYPE".to_string(), e))?;

        let openai_api_key = optional_var("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let max_text_sessions = parse_var::<usize>("MAX_TEXT_SESSIONS", "1024")?;
        if max_text_sessions == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_TEXT_SESSIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let input_sample_rate = parse_var::<u32>("INPUT_SAMPLE_RATE", "16000")?;
        if !is_supported_rate(input_sample_rate) {
            return Err(ConfigError::InvalidValue(
                "INPUT_SAMPLE_RATE".to_string(),
                format!("must be between {MIN_SAMPLE_RATE} and {MAX_SAMPLE_RATE} Hz"),
            ));
        }

        Ok(Self {
            bind_address,
            transport,
            openai_api_key,
            openai_api_base: var_or("OPENAI_API_BASE", "https://api.openai.com/v1"),
            chat_model: var_or("CHAT_MODEL", "gpt-4o"),
            stt_model: var_or("STT_MODEL", "whisper-1"),
            tts_model: var_or("TTS_MODEL", "tts-1"),
            tts_voice: var_or("TTS_VOICE", "alloy"),
            chat_backend_url: var_or("CHAT_BACKEND_URL", "http://127.0.0.1:7860/api/chat/stream"),
            chat_timeout: Duration::from_secs(parse_var::<u64>("CHAT_TIMEOUT", "60")?),
            shutdown_grace: Duration::from_millis(parse_var::<u64>("SHUTDOWN_GRACE_MS", "500")?),
            max_text_sessions,
            input_sample_rate,
            stun_urls: list_var("STUN_URLS", "stun:stun.l.google.com:19302"),
            turn_urls: list_var("TURN_URLS", ""),
            turn_username: optional_var("TURN_USERNAME"),
            turn_credential: optional_var("TURN_CREDENTIAL"),
            daily_api_key: optional_var("DAILY_API_KEY"),
            daily_api_url: var_or("DAILY_API_URL", "https://api.daily.co/v1"),
            public_ws_url: var_or("PUBLIC_WS_URL", "ws://localhost:7860/ws"),
            greeting_prompt: greeting_var(),
            log_level,
        })
    }

    /// STUN servers first, then TURN servers carrying the shared credentials.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let stun = self.stun_urls.iter().map(IceServer::new);
        let turn = self.turn_urls.iter().map(|url| {
            IceServer::new(url)
                .with_credentials(self.turn_username.clone(), self.turn_credential.clone())
        });
        stun.chain(turn).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ALL_VARS: &[&str] = &[
        "BIND_ADDRESS",
        "TRANSPORT_TYPE",
        "OPENAI_API_KEY",
        "OPENAI_API_BASE",
        "CHAT_MODEL",
        "STT_MODEL",
        "TTS_MODEL",
        "TTS_VOICE",
        "CHAT_BACKEND_URL",
        "CHAT_TIMEOUT",
        "SHUTDOWN_GRACE_MS",
        "MAX_TEXT_SESSIONS",
        "INPUT_SAMPLE_RATE",
        "STUN_URLS",
        "TURN_URLS",
        "TURN_USERNAME",
        "TURN_CREDENTIAL",
        "DAILY_API_KEY",
        "DAILY_API_URL",
        "PUBLIC_WS_URL",
        "GREETING_PROMPT",
        "RUST_LOG",
    ];

    fn clear_env_vars() {
        for var in ALL_VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:7860");
        assert_eq!(config.transport, TransportKind::PeerToPeer);
        assert_eq!(config.openai_api_key, "test-openai-key");
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.stt_model, "whisper-1");
        assert_eq!(config.tts_voice, "alloy");
        assert_eq!(config.chat_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_millis(500));
        assert_eq!(config.max_text_sessions, 1024);
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.turn_urls.is_empty());
        assert_eq!(config.daily_api_key, None);
        assert_eq!(config.greeting_prompt.as_deref(), Some(DEFAULT_GREETING));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("TRANSPORT_TYPE", "websocket");
            env::set_var("OPENAI_API_KEY", "custom-key");
            env::set_var("CHAT_MODEL", "gpt-4o-mini");
            env::set_var("CHAT_TIMEOUT", "5");
            env::set_var("MAX_TEXT_SESSIONS", "3");
            env::set_var("STUN_URLS", "stun:a.example:3478, stun:b.example:3478");
            env::set_var("TURN_URLS", "turn:t.example:3478");
            env::set_var("TURN_USERNAME", "user");
            env::set_var("TURN_CREDENTIAL", "secret");
            env::set_var("GREETING_PROMPT", "Say hello.");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.transport, TransportKind::Socket);
        assert_eq!(config.chat_model, "gpt-4o-mini");
        assert_eq!(config.chat_timeout, Duration::from_secs(5));
        assert_eq!(config.max_text_sessions, 3);
        assert_eq!(config.stun_urls, vec!["stun:a.example:3478", "stun:b.example:3478"]);
        assert_eq!(config.turn_urls, vec!["turn:t.example:3478"]);
        assert_eq!(config.turn_username.as_deref(), Some("user"));
        assert_eq!(config.greeting_prompt.as_deref(), Some("Say hello."));
        assert_eq!(config.log_level, Level::DEBUG);

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0], IceServer::new("stun:a.example:3478"));
        assert_eq!(servers[2].urls, "turn:t.example:3478");
        assert_eq!(servers[2].username.as_deref(), Some("user"));
        assert_eq!(servers[2].credential.as_deref(), Some("secret"));
    }

    #[test]
    #[serial]
    fn test_config_transport_aliases() {
        for (value, expected) in [
            ("daily", TransportKind::ManagedRoom),
            ("managed_room", TransportKind::ManagedRoom),
            ("socket", TransportKind::Socket),
            ("smallwebrtc", TransportKind::PeerToPeer),
        ] {
            clear_env_vars();
            set_minimal_env();
            unsafe {
                env::set_var("TRANSPORT_TYPE", value);
            }
            let config = Config::from_env().expect("Config should load successfully");
            assert_eq!(config.transport, expected, "TRANSPORT_TYPE={value}");
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_values() {
        for (var, value) in [
            ("BIND_ADDRESS", "not-a-valid-address"),
            ("TRANSPORT_TYPE", "carrier-pigeon"),
            ("RUST_LOG", "not-a-level"),
            ("CHAT_TIMEOUT", "soon"),
            ("MAX_TEXT_SESSIONS", "0"),
            ("INPUT_SAMPLE_RATE", "0"),
            ("INPUT_SAMPLE_RATE", "400000"),
        ] {
            clear_env_vars();
            set_minimal_env();
            unsafe {
                env::set_var(var, value);
            }
            match Config::from_env().unwrap_err() {
                ConfigError::InvalidValue(name, _) => assert_eq!(name, var),
                other => panic!("Expected InvalidValue for {var}, got {other:?}"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_empty_greeting_disables_it() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("GREETING_PROMPT", "  ");
        }

        let config = Config::from_env().expect("Config should load successfully");
        assert_eq!(config.greeting_prompt, None);
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => {
                assert!(msg.contains("OPENAI_API_KEY"));
            }
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }
}
