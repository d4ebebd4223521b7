//! Request/response clients for the REST side of the API
//!
//! Text replies (with optional search grounding) and one-shot speech
//! synthesis. Both POST to `models/{model}:generateContent` and share the
//! response types below.

mod speech;
mod text;

pub use speech::SpeechSynthesisClient;
pub use text::{
    Attachment, Citation, GeneratedText, Role, TextGenerationClient, TextRequest, Turn,
    EMPTY_REPLY_FALLBACK,
};

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::settings::AppSettings;
use crate::streaming::{Content, GenerationConfig};

/// Errors from the REST clients
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("API key not configured. Set GEMINI_API_KEY environment variable.")]
    MissingApiKey,
    #[error("Nothing to send")]
    EmptyRequest,
    #[error("Network error: {0}")]
    Network(String),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Failed to parse API response: {0}")]
    Parse(String),
    #[error("No audio data received")]
    NoAudio,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Tool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_search: Option<GoogleSearch>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct GoogleSearch {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GroundingChunk {
    #[serde(default)]
    pub web: Option<WebSource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WebSource {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// API error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Connection details shared by both clients
#[derive(Debug, Clone)]
pub(crate) struct RestEndpoint {
    http: Client,
    base_url: String,
    api_key: String,
}

impl RestEndpoint {
    pub fn new(settings: &AppSettings, api_key: Option<String>) -> Result<Self, ServiceError> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or(ServiceError::MissingApiKey)?;

        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: settings.rest_endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, model: &str) -> String {
        format!(
            "{}/{}:generateContent",
            self.base_url,
            crate::streaming::model_resource(model)
        )
    }

    pub async fn generate(
        &self,
        model: &str,
        body: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ServiceError> {
        let response = self
            .http
            .post(self.url(model))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        let status = response.status();

        if status.is_success() {
            response
                .json::<GenerateContentResponse>()
                .await
                .map_err(|e| ServiceError::Parse(e.to_string()))
        } else {
            let error_text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ApiErrorResponse>(&error_text) {
                Ok(error_response) => error_response.error.message,
                Err(_) => error_text,
            };

            log::error!("API error ({}): {}", status.as_u16(), message);

            Err(ServiceError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key() {
        let settings = AppSettings::default();
        assert!(matches!(
            RestEndpoint::new(&settings, None),
            Err(ServiceError::MissingApiKey)
        ));
        assert!(matches!(
            RestEndpoint::new(&settings, Some(String::new())),
            Err(ServiceError::MissingApiKey)
        ));
    }

    #[test]
    fn test_endpoint_url() {
        let settings = AppSettings {
            rest_endpoint: "http://localhost:9000/v1beta/".into(),
            ..Default::default()
        };
        let endpoint = RestEndpoint::new(&settings, Some("k".into())).unwrap();
        assert_eq!(
            endpoint.url("gemini-2.5-flash"),
            "http://localhost:9000/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn test_search_tool_serialization() {
        let tool = Tool {
            google_search: Some(GoogleSearch {}),
        };
        assert_eq!(serde_json::to_string(&tool).unwrap(), r#"{"googleSearch":{}}"#);
    }

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::Api {
            status: 403,
            message: "API key not valid".into(),
        };
        assert_eq!(err.to_string(), "API error (403): API key not valid");
    }
}
