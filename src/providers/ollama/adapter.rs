use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use super::models::*;
use super::stream::pump_ndjson_stream;
use crate::providers::traits::ChatTransport;
use crate::providers::types::{
    ChatMessage, ChatRequest, ProviderInfo, StreamEvent, ToolOutput, TransportError,
};

/// Shown when the model catalog cannot be fetched, so the picker is never
/// empty on a cold start with the daemon down.
const FALLBACK_MODELS: &[&str] = &[
    "devstral:24b",
    "llama3.3:70b",
    "llama3.2:latest",
    "qwen3:32b",
    "qwq:32b",
    "gemma3:27b",
    "deepseek-r1:14b",
    "qwen2.5vl:32b",
];

/// Transport over the native Ollama HTTP API, with optional companion
/// endpoints for retrieval queries and tool execution.
pub struct OllamaTransport {
    client: Client,
    base_url: Url,
    rag_url: Option<Url>,
    tools_url: Option<Url>,
    model_cache: Mutex<Option<Vec<String>>>,
}

impl OllamaTransport {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: Client::new(),
            base_url,
            rag_url: None,
            tools_url: None,
            model_cache: Mutex::new(None),
        }
    }

    pub fn with_rag_backend(mut self, rag_url: Url) -> Self {
        self.rag_url = Some(rag_url);
        self
    }

    pub fn with_tools_backend(mut self, tools_url: Url) -> Self {
        self.tools_url = Some(tools_url);
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::RequestFailed(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn build_messages(request: &ChatRequest) -> Vec<OllamaMessage> {
        let mut result = Vec::new();

        if let Some(prompt) = &request.system_prompt {
            result.push(OllamaMessage {
                role: "system".to_string(),
                content: prompt.clone(),
                images: None,
            });
        }

        for msg in &request.messages {
            result.push(OllamaMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content.clone(),
                images: msg.image.as_deref().and_then(normalize_image),
            });
        }

        result
    }

    fn build_chat_request(request: &ChatRequest, stream: bool) -> OllamaChatRequest {
        OllamaChatRequest {
            model: request.model.clone(),
            messages: Self::build_messages(request),
            stream,
            options: Some(OllamaOptions {
                temperature: request.temperature,
            }),
        }
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OllamaErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    async fn post_chat(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.endpoint("api/chat")?;
        let body = Self::build_chat_request(request, stream);

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        Ok(response)
    }

    async fn fetch_models(&self) -> Result<Vec<String>, TransportError> {
        let url = self.endpoint("api/tags")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::RequestFailed(format!(
                "HTTP {}: model list unavailable",
                response.status().as_u16()
            )));
        }

        let tags: OllamaTagsResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// Strip a data-URI prefix and verify the payload is valid base64. Invalid
/// payloads are dropped rather than sent to the backend.
fn normalize_image(image: &str) -> Option<Vec<String>> {
    let payload = image
        .split_once("base64,")
        .map(|(_, data)| data)
        .unwrap_or(image);

    match base64::engine::general_purpose::STANDARD.decode(payload) {
        Ok(_) => Some(vec![payload.to_string()]),
        Err(e) => {
            tracing::warn!("Dropping invalid image payload: {}", e);
            None
        }
    }
}

#[async_trait]
impl ChatTransport for OllamaTransport {
    async fn send_request(&self, request: ChatRequest) -> Result<String, TransportError> {
        let response = self.post_chat(&request, false).await?;

        let chunk: OllamaChatChunk = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        if let Some(error) = chunk.error {
            return Err(TransportError::RequestFailed(error));
        }

        chunk
            .message
            .and_then(|m| m.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TransportError::InvalidResponse("No content in response".to_string()))
    }

    async fn open_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), TransportError> {
        let response = self.post_chat(&request, true).await?;
        pump_ndjson_stream(response, tx).await;
        Ok(())
    }

    async fn rag_query(&self, query: &str, model: &str) -> Result<String, TransportError> {
        let base = self
            .rag_url
            .as_ref()
            .ok_or(TransportError::NotConfigured("RAG"))?;
        let url = base
            .join("rag/query")
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "query": query, "model": model }))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        body.get("response")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::InvalidResponse("RAG response missing text".to_string())
            })
    }

    async fn list_providers(&self) -> Result<Vec<ProviderInfo>, TransportError> {
        Ok(vec![ProviderInfo {
            id: "ollama".to_string(),
            display_name: "Ollama".to_string(),
        }])
    }

    async fn list_models(
        &self,
        provider: &str,
        force_refresh: bool,
    ) -> Result<Vec<String>, TransportError> {
        if provider != "ollama" {
            return Err(TransportError::RequestFailed(format!(
                "Unknown provider: {}",
                provider
            )));
        }

        let mut cache = self.model_cache.lock().await;
        if !force_refresh {
            if let Some(models) = cache.as_ref() {
                return Ok(models.clone());
            }
        }

        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => {
                *cache = Some(models.clone());
                Ok(models)
            }
            Ok(_) => Ok(FALLBACK_MODELS.iter().map(|m| m.to_string()).collect()),
            Err(e) => {
                tracing::warn!("Model list fetch failed, using fallback list: {}", e);
                Ok(FALLBACK_MODELS.iter().map(|m| m.to_string()).collect())
            }
        }
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, TransportError> {
        let base = self
            .tools_url
            .as_ref()
            .ok_or(TransportError::NotConfigured("Tool"))?;
        let url = base
            .join("tools/call")
            .map_err(|e| TransportError::RequestFailed(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "name": name, "arguments": arguments }))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}
