use serde::{Deserialize, Serialize};

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct OllamaOptions {
    pub temperature: f32,
}

// --- Response types ---

/// One line of the NDJSON chat stream. Non-streaming responses use the
/// same shape with `done: true` and the full message content.
#[derive(Debug, Deserialize)]
pub struct OllamaChatChunk {
    pub message: Option<OllamaChunkMessage>,
    #[serde(default)]
    pub done: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChunkMessage {
    pub content: Option<String>,
}

// --- Model list ---

#[derive(Debug, Deserialize)]
pub struct OllamaTagsResponse {
    #[serde(default)]
    pub models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaModelTag {
    pub name: String,
}

// --- Error body ---

#[derive(Debug, Deserialize)]
pub struct OllamaErrorResponse {
    pub error: String,
}
