//! One-shot text-to-speech

use super::{GenerateContentRequest, GenerateContentResponse, RestEndpoint, ServiceError};
use crate::audio::{EncodedChunk, OUTPUT_SAMPLE_RATE};
use crate::settings::AppSettings;
use crate::streaming::{Content, GenerationConfig, Part};

pub struct SpeechSynthesisClient {
    endpoint: RestEndpoint,
    model: String,
    voice: String,
}

impl SpeechSynthesisClient {
    pub fn new(settings: &AppSettings, api_key: Option<String>) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: RestEndpoint::new(settings, api_key)?,
            model: settings.tts_model.clone(),
            voice: settings.voice_name.clone(),
        })
    }

    /// Speak `text` with the configured voice. Returns PCM16 audio, 24 kHz
    /// unless the response says otherwise.
    pub async fn synthesize(&self, text: &str) -> Result<EncodedChunk, ServiceError> {
        self.synthesize_with_voice(text, &self.voice).await
    }

    pub async fn synthesize_with_voice(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<EncodedChunk, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::EmptyRequest);
        }

        log::info!("Synthesizing {} chars with voice {}", text.len(), voice);

        let response = self
            .endpoint
            .generate(&self.model, &build_request(text, voice))
            .await?;
        let chunk = parse_audio(response)?;

        log::info!("Synthesized {:.2}s of audio", chunk.duration_secs());
        Ok(chunk)
    }
}

fn build_request(text: &str, voice: &str) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: None,
            parts: vec![Part::text(text)],
        }],
        generation_config: Some(GenerationConfig::audio(voice)),
        ..Default::default()
    }
}

fn parse_audio(response: GenerateContentResponse) -> Result<EncodedChunk, ServiceError> {
    let blob = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts.into_iter().next())
        .and_then(|part| part.inline_data)
        .ok_or(ServiceError::NoAudio)?;

    if blob.data.is_empty() {
        return Err(ServiceError::NoAudio);
    }

    EncodedChunk::from_base64(&blob.mime_type, &blob.data, OUTPUT_SAMPLE_RATE)
        .map_err(|e| ServiceError::Parse(e.to_string()))
}
