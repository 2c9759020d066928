pub mod content;
pub mod conversation;
pub mod settings;
pub mod turn;

pub use content::{BlockKind, ContentBlock, ParsedContent};
pub use conversation::ConversationMeta;
pub use settings::ModelSettings;
pub use turn::{AssistantContent, ChatTurn, Role, StoredChatTurn, UserContent};
