//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_UPSTREAM__VOICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why a double underscore:
//! Several keys contain single underscores (`flush_threshold_bytes`), so nested
//! sections are separated with `__` in environment variable names.

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// Placeholder substituted with the conversation topic in persona templates.
pub const TOPIC_PLACEHOLDER: &str = "{topic}";

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: Automatically implements common traits:
///   - `Debug`: Allows printing with {:?} for debugging
///   - `Clone`: Allows making copies of the struct
///   - `Serialize` / `Deserialize`: Convert to and from TOML, JSON, etc.
///
/// ## Why separate config structs:
/// The relay, the upstream service, the client capture policy and the persona
/// copy change for different reasons, so each gets its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub capture: CaptureConfig,
    pub persona: PersonaConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to
/// - `port`: TCP port number to listen on
/// - `heartbeat_interval_secs`: How often the relay pings each client socket
/// - `client_timeout_secs`: Silence after which a client socket is dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Hosted realtime speech service settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the realtime service (without query string)
/// - `model`: Realtime model, appended as `?model=...`
/// - `api_key_env`: Name of the environment variable holding the API key
/// - `voice`: Voice identity for synthesized replies
/// - `transcription_model`: Speech-to-text model for the user's audio
/// - `turn_detection`: Server-side turn-detection policy
///
/// The API key itself is never stored in configuration; it is read from the
/// environment each time a session connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub model: String,
    pub api_key_env: String,
    pub voice: String,
    pub transcription_model: String,
    pub turn_detection: String,
}

/// Client-side capture buffering policy.
///
/// ## Tuning guidelines:
/// - Smaller threshold / interval: lower latency, more (smaller) transmissions
/// - Larger threshold / interval: fewer transmissions, more delay per blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Flush as soon as this many bytes are buffered
    pub flush_threshold_bytes: usize,
    /// Flush whatever is buffered at this period
    pub flush_interval_ms: u64,
    /// Sample rate the capture device is opened with
    pub sample_rate: u32,
}

/// Assistant persona instructions sent upstream at session start.
///
/// Both templates are plain strings; `topic_template` must contain `{topic}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub topic_template: String,
    pub generic_template: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: 8192,  // 4096 PCM16 samples
            flush_interval_ms: 1000,      // Caps worst-case latency under low volume
            sample_rate: 24000,           // Realtime service PCM16 rate
        }
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            topic_template: "You are a podcast assistant. \
                The user wants to talk about \"{topic}\". \
                Ask up to 4 engaging follow-up questions to help create a short podcast. \
                Be warm, curious, and conversational."
                .to_string(),
            generic_template: "You are a podcast assistant. Ask the user what topic they’re \
                interested in, then ask up to 4 engaging follow-up questions."
                .to_string(),
        }
    }
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 3000,
                heartbeat_interval_secs: 5,
                client_timeout_secs: 30,
            },
            upstream: UpstreamConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                voice: "shimmer".to_string(),
                transcription_model: "whisper-1".to_string(),
                turn_detection: "server_vad".to_string(),
            },
            capture: CaptureConfig::default(),
            persona: PersonaConfig::default(),
        }
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=4000`: Override server port
    /// - `APP_UPSTREAM__VOICE=alloy`: Override the reply voice
    /// - `APP_CAPTURE__FLUSH_INTERVAL_MS=500`: Flush twice a second
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Heartbeat interval is shorter than the client timeout
    /// - Upstream URL uses a WebSocket scheme
    /// - Flush threshold and interval are non-zero
    /// - The topic template actually mentions the topic
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0
            || self.server.heartbeat_interval_secs >= self.server.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be non-zero and shorter than the client timeout"
            ));
        }

        if !(self.upstream.url.starts_with("ws://") || self.upstream.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Upstream URL must start with ws:// or wss://, got '{}'",
                self.upstream.url
            ));
        }

        if self.upstream.model.is_empty() || self.upstream.voice.is_empty() {
            return Err(anyhow::anyhow!("Upstream model and voice must be set"));
        }

        if self.capture.flush_threshold_bytes == 0 {
            return Err(anyhow::anyhow!("Flush threshold must be greater than 0"));
        }

        if self.capture.flush_interval_ms == 0 {
            return Err(anyhow::anyhow!("Flush interval must be greater than 0"));
        }

        if !self.persona.topic_template.contains(TOPIC_PLACEHOLDER) {
            return Err(anyhow::anyhow!(
                "Persona topic template must contain {}",
                TOPIC_PLACEHOLDER
            ));
        }

        Ok(())
    }

    /// Full upstream endpoint including the model query parameter.
    pub fn upstream_endpoint(&self) -> String {
        format!("{}?model={}", self.upstream.url, self.upstream.model)
    }
}
