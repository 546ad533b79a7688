pub mod genkit;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Input of the multimodal answer flow. At most one of `question_image` and
/// `question_audio` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub question_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_audio: Option<String>,
    pub user_prefers_audio_reply: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub text_response: Option<String>,
    #[serde(default)]
    pub image_response: Option<String>,
    #[serde(default)]
    pub audio_response: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    pub context: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub summary: String,
    #[serde(default)]
    pub progress: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptsRequest {
    pub input: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concepts {
    #[serde(default)]
    pub concepts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Network(String),
    Http { status: u16, message: String },
    RateLimited(String),
    InvalidResponse(String),
    Provider(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(message) => write!(f, "Network error: {message}"),
            Self::Http { status, message } => {
                write!(f, "Backend returned status {status}: {message}")
            }
            Self::RateLimited(message) => write!(f, "Rate limited: {message}"),
            Self::InvalidResponse(message) => write!(f, "Invalid backend response: {message}"),
            Self::Provider(message) => write!(f, "Backend error: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, BackendError>;

    async fn summarize(&self, context: String) -> Result<Summary, BackendError>;

    async fn identify_concepts(&self, input: String) -> Result<Concepts, BackendError>;
}
