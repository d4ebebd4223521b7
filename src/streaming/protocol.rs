//! Gemini Live API protocol types
//!
//! JSON messages exchanged over the `BidiGenerateContent` WebSocket. The
//! `Content`/`Part`/`Blob` shapes are shared with the REST clients in
//! `services`.
//!
//! # Protocol Overview
//!
//! 1. Connect to `LIVE_API_URL?key=...`
//! 2. Send `setup` (model, response modality, voice, system instruction)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive model audio via `serverContent.modelTurn.parts[].inlineData`
//! 6. `serverContent.interrupted` means the model was cut off

use serde::{Deserialize, Serialize};

use super::{LiveConfig, TransportEvent};
use crate::audio::EncodedChunk;

/// Gemini Live WebSocket endpoint
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Prefix a bare model id with `models/`.
pub fn model_resource(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

/// Inline binary payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64-encoded bytes
    pub data: String,
}

impl Blob {
    pub fn from_chunk(chunk: &EncodedChunk) -> Self {
        Self {
            mime_type: chunk.mime_type(),
            data: chunk.to_base64(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn inline(blob: Blob) -> Self {
        Self {
            text: None,
            inline_data: Some(blob),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn instruction(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SpeechConfig {
    pub fn prebuilt(voice: impl Into<String>) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.into(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

impl GenerationConfig {
    /// Spoken responses with a prebuilt voice
    pub fn audio(voice: impl Into<String>) -> Self {
        Self {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(SpeechConfig::prebuilt(voice)),
        }
    }
}

/// Session configuration, the first message on the socket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn setup(config: &LiveConfig) -> Self {
        Self::Setup(Setup {
            model: model_resource(&config.model),
            generation_config: GenerationConfig::audio(config.voice.clone()),
            system_instruction: config.instruction.as_deref().map(Content::instruction),
        })
    }

    pub fn realtime_audio(chunk: &EncodedChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob::from_chunk(chunk)],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// One server frame. Exactly one field is normally set; unknown fields are
/// ignored so newer message kinds do not break parsing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into transport events: audio parts in order, then the
    /// interruption marker.
    pub fn into_events(self, default_rate: u32) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(go_away) = &self.go_away {
            log::warn!(
                "Live service is going away (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        let Some(content) = self.server_content else {
            return events;
        };

        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for blob in parts.into_iter().filter_map(|part| part.inline_data) {
            match EncodedChunk::from_base64(&blob.mime_type, &blob.data, default_rate) {
                Ok(chunk) => events.push(TransportEvent::AudioChunk(chunk)),
                Err(e) => log::warn!("Skipping inline data ({}): {}", blob.mime_type, e),
            }
        }

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            log::debug!("Model turn complete");
        }

        events
    }
}
