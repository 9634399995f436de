//! # Upstream Channels
//!
//! The realtime speech service is reached through the [`UpstreamConnector`] seam.
//! A connector hands back an [`UpstreamChannel`]: a boxed sink for frames going
//! upstream and a boxed stream of frames coming back. The production connector
//! ([`RealtimeConnector`]) speaks WebSocket through tokio-tungstenite.
//!
//! ## Handshake Headers:
//! - `Authorization: Bearer <key>` (key read from the configured env var)
//! - `OpenAI-Beta: realtime=v1`

use crate::config::{AppConfig, UpstreamConfig};
use crate::error::{AppError, AppResult};
use crate::relay::{ConnectionId, RelayFrame};
use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::env;
use std::pin::Pin;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Frames going to the realtime service.
pub type UpstreamSink = Pin<Box<dyn Sink<RelayFrame, Error = AppError> + Send>>;

/// Frames (or a runtime failure) coming back from the realtime service.
pub type UpstreamStream = Pin<Box<dyn Stream<Item = AppResult<RelayFrame>> + Send>>;

/// An established upstream connection, split into its two directions.
pub struct UpstreamChannel {
    pub sink: UpstreamSink,
    pub stream: UpstreamStream,
}

/// Opens one upstream channel per session.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: lets the manager hold any connector as `Arc<dyn UpstreamConnector>`
/// - **Send + Sync**: the connector is shared by every session task
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Establish the channel. Errors are `UpstreamConnect`; there is no retry.
    async fn connect(&self, connection_id: &ConnectionId) -> AppResult<UpstreamChannel>;

    /// Connector name for logging
    fn name(&self) -> &str;
}

/// Initial configuration control message, sent once when a session connects.
///
/// Serializes as:
/// ```json
/// {"type":"session.update","session":{"voice":"shimmer","instructions":"...",
///  "input_audio_transcription":{"model":"whisper-1"},"turn_detection":{"type":"server_vad"}}}
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum UpstreamControl {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
}

/// Voice, transcription and turn-detection settings plus the persona instructions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub voice: String,
    pub instructions: String,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: TurnDetection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionSettings {
    pub fn new(upstream: &UpstreamConfig, instructions: String) -> Self {
        Self {
            voice: upstream.voice.clone(),
            instructions,
            input_audio_transcription: TranscriptionSettings {
                model: upstream.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                kind: upstream.turn_detection.clone(),
            },
        }
    }

    /// Render the `session.update` text frame.
    pub fn to_frame(&self) -> AppResult<RelayFrame> {
        let control = UpstreamControl::SessionUpdate {
            session: self.clone(),
        };
        Ok(RelayFrame::Text(serde_json::to_string(&control)?))
    }
}

impl From<RelayFrame> for Message {
    fn from(frame: RelayFrame) -> Self {
        match frame {
            RelayFrame::Text(text) => Message::Text(text),
            RelayFrame::Binary(data) => Message::Binary(data),
        }
    }
}

/// WebSocket connector for the hosted realtime service.
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    endpoint: String,
    api_key_env: String,
}

impl RealtimeConnector {
    pub fn new(endpoint: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key_env: api_key_env.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.upstream_endpoint(), config.upstream.api_key_env.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn connect(&self, connection_id: &ConnectionId) -> AppResult<UpstreamChannel> {
        let api_key = env::var(&self.api_key_env).map_err(|_| {
            AppError::UpstreamConnect(format!("{} is not set", self.api_key_env))
        })?;

        let mut request = self.endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| AppError::UpstreamConnect(format!("Invalid API key header: {}", e)))?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(
            connection_id = %connection_id,
            status = %response.status(),
            "Upstream handshake complete"
        );

        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(|e| AppError::UpstreamRuntime(e.to_string()))
            .with(|frame: RelayFrame| future::ready(Ok::<Message, AppError>(frame.into())));

        // Control frames (ping/pong/close) are handled by tungstenite itself.
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(RelayFrame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(RelayFrame::Binary(data))),
                Ok(_) => None,
                Err(e) => Some(Err(AppError::UpstreamRuntime(e.to_string()))),
            })
        });

        Ok(UpstreamChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn name(&self) -> &str {
        "realtime-websocket"
    }
}
