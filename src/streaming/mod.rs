//! Streaming transport to the live audio service
//!
//! A persistent WebSocket carries PCM16 microphone frames up and synthesized
//! model audio down.
//!
//! # Architecture
//!
//! ```text
//! CaptureHandle ──▶ LiveSession::send ──▶ outbound queue ──▶ writer task ──▶ WebSocket
//!                                                                              │
//! Controller ◀── mpsc<TransportEvent> ◀── reader task ◀────────────────────────┘
//! ```
//!
//! # Failure Strategy
//!
//! - The handshake retries transient failures 3 times with exponential backoff
//! - Rejections by the service (bad key, bad model) are not retried
//! - Mid-session failures surface as a single `Error` or `Closed` event; the
//!   transport never reconnects on its own

mod protocol;
mod realtime_client;

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::audio::{EncodedChunk, CAPTURE_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

pub use protocol::{
    model_resource, Blob, ClientMessage, Content, GenerationConfig, Part, RealtimeInput,
    ServerContent, ServerMessage, Setup, SpeechConfig, LIVE_API_URL,
};
pub use realtime_client::{GeminiConnector, GeminiSession};

/// Default live model
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Kore";

/// Errors that can occur while opening a live session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("API key not configured. Set GEMINI_API_KEY environment variable.")]
    MissingApiKey,
    #[error("Failed to connect to the live service: {0}")]
    HandshakeFailed(String),
}

/// Inbound events from an open session, in remote order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One piece of synthesized audio
    AudioChunk(EncodedChunk),
    /// The model stopped talking mid-utterance; queued audio is stale
    Interrupted,
    /// Remote end closed the connection
    Closed { reason: Option<String> },
    /// Connection failed mid-session
    Error(String),
}

/// Everything needed to open one live session
#[derive(Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub instruction: Option<String>,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub connect_timeout: Duration,
    pub setup_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl LiveConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instruction: None,
            input_sample_rate: CAPTURE_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }

    pub fn with_instruction(mut self, instruction: Option<String>) -> Self {
        self.instruction = instruction.filter(|s| !s.trim().is_empty());
        self
    }
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("instruction", &self.instruction.as_ref().map(|s| s.len()))
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Outbound half of an open session
pub trait LiveSession: Send {
    /// Queue a chunk for sending. Never blocks; a chunk that cannot be
    /// queued is dropped.
    fn send(&mut self, chunk: EncodedChunk);

    /// Best-effort close. Safe to call more than once.
    fn close(&mut self);
}

/// A session that completed its handshake
pub struct OpenedSession {
    pub session: Box<dyn LiveSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession").finish_non_exhaustive()
    }
}

/// Opens live sessions. The returned future must be `'static` so the
/// controller can spawn it.
pub trait LiveConnector: Send + Sync {
    fn open(&self, config: LiveConfig) -> BoxFuture<'static, Result<OpenedSession, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = TransportError::HandshakeFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_live_config_debug_redacts_key() {
        let config = LiveConfig::new("secret-key");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains(DEFAULT_LIVE_MODEL));
    }

    #[test]
    fn test_blank_instruction_dropped() {
        let config = LiveConfig::new("k").with_instruction(Some("   ".into()));
        assert!(config.instruction.is_none());

        let config = LiveConfig::new("k").with_instruction(Some("Be brief".into()));
        assert_eq!(config.instruction.as_deref(), Some("Be brief"));
    }
}
