pub mod ollama;
pub mod traits;
pub mod types;

pub use ollama::OllamaTransport;
pub use traits::ChatTransport;
pub use types::{
    ChatMessage, ChatRequest, ProviderInfo, StreamEvent, ToolContent, ToolOutput, TransportError,
};
