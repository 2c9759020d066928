pub mod models;
pub mod providers;
pub mod services;

pub use models::{
    AssistantContent, BlockKind, ChatTurn, ContentBlock, ConversationMeta, ModelSettings,
    ParsedContent, Role, StoredChatTurn, UserContent,
};
pub use providers::{ChatTransport, OllamaTransport, TransportError};
pub use services::{
    ChatSession, ConversationStore, MemoryStore, SessionError, SessionEvent, SqliteStore,
};
