use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, ProviderInfo, StreamEvent, ToolOutput, TransportError};

/// Boundary between the session engine and whatever carries requests to a
/// model backend. Implementations own serialization, wire formats and
/// endpoint details; the engine only sees typed requests and events.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Single-shot completion. Returns the full response text.
    async fn send_request(&self, request: ChatRequest) -> Result<String, TransportError>;

    /// Streaming completion. Emits any number of `Fragment`s followed by
    /// exactly one terminal `Final` or `Error` on `tx`, then returns.
    /// Errors after the stream is open are reported on the channel, not
    /// through the return value.
    async fn open_stream(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), TransportError>;

    /// Retrieval-augmented single-shot query against an indexed document
    /// collection.
    async fn rag_query(&self, query: &str, model: &str) -> Result<String, TransportError>;

    async fn list_providers(&self) -> Result<Vec<ProviderInfo>, TransportError>;

    /// Models available under a provider. Implementations may cache;
    /// `force_refresh` bypasses the cache.
    async fn list_models(
        &self,
        provider: &str,
        force_refresh: bool,
    ) -> Result<Vec<String>, TransportError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutput, TransportError>;
}
