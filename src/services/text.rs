//! Text replies with optional web-search grounding

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::{
    GenerateContentRequest, GenerateContentResponse, GoogleSearch, RestEndpoint, ServiceError,
    Tool,
};
use crate::settings::AppSettings;
use crate::streaming::{Blob, Content, Part};

/// Reply text used when the model returns no text parts
pub const EMPTY_REPLY_FALLBACK: &str = "I didn't get a response. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One earlier message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// File sent inline with the new user turn
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextRequest {
    pub history: Vec<Turn>,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub system_instruction: Option<String>,
    pub search_enabled: bool,
}

impl TextRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachment.is_none()
    }
}

/// Web source backing part of a grounded reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedText {
    pub text: String,
    pub citations: Vec<Citation>,
}

pub struct TextGenerationClient {
    endpoint: RestEndpoint,
    model: String,
}

impl TextGenerationClient {
    pub fn new(settings: &AppSettings, api_key: Option<String>) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: RestEndpoint::new(settings, api_key)?,
            model: settings.text_model.clone(),
        })
    }

    pub async fn generate(&self, request: &TextRequest) -> Result<GeneratedText, ServiceError> {
        if request.is_empty() {
            return Err(ServiceError::EmptyRequest);
        }

        log::info!(
            "Text request: {} history turns, attachment: {}, search: {}",
            request.history.len(),
            request.attachment.is_some(),
            request.search_enabled
        );

        let response = self
            .endpoint
            .generate(&self.model, &build_request(request))
            .await?;
        let reply = parse_reply(response);

        log::info!(
            "Text reply: {} chars, {} citations",
            reply.text.len(),
            reply.citations.len()
        );
        Ok(reply)
    }
}

fn build_request(request: &TextRequest) -> GenerateContentRequest {
    let mut contents: Vec<Content> = request
        .history
        .iter()
        .map(|turn| Content {
            role: Some(turn.role.as_str().to_string()),
            parts: vec![Part::text(turn.text.clone())],
        })
        .collect();

    let mut parts = Vec::new();
    if !request.text.trim().is_empty() {
        parts.push(Part::text(request.text.clone()));
    }
    if let Some(attachment) = &request.attachment {
        parts.push(Part::inline(Blob {
            mime_type: attachment.mime_type.clone(),
            data: STANDARD.encode(&attachment.data),
        }));
    }
    contents.push(Content {
        role: Some(Role::User.as_str().to_string()),
        parts,
    });

    let tools = if request.search_enabled {
        vec![Tool {
            google_search: Some(GoogleSearch {}),
        }]
    } else {
        Vec::new()
    };

    GenerateContentRequest {
        contents,
        system_instruction: request
            .system_instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(Content::instruction),
        tools,
        generation_config: None,
    }
}

fn parse_reply(response: GenerateContentResponse) -> GeneratedText {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return GeneratedText {
            text: EMPTY_REPLY_FALLBACK.to_string(),
            citations: Vec::new(),
        };
    };

    let text: String = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect();

    let citations = candidate
        .grounding_metadata
        .map(|meta| meta.grounding_chunks)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|chunk| chunk.web)
        .filter_map(|web| match (web.title, web.uri) {
            (Some(title), Some(uri)) => Some(Citation { title, uri }),
            _ => None,
        })
        .collect();

    GeneratedText {
        text: if text.is_empty() {
            EMPTY_REPLY_FALLBACK.to_string()
        } else {
            text
        },
        citations,
    }
}
