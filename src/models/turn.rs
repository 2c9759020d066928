use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content::ParsedContent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// What the user sent for one turn. The image is an opaque data URI; this
/// crate never decodes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserContent {
    Text(String),
    TextWithImage { text: String, image: String },
}

impl UserContent {
    pub fn text(&self) -> &str {
        match self {
            UserContent::Text(t) => t,
            UserContent::TextWithImage { text, .. } => text,
        }
    }

    pub fn image(&self) -> Option<&str> {
        match self {
            UserContent::Text(_) => None,
            UserContent::TextWithImage { image, .. } => Some(image.as_str()),
        }
    }
}

/// The assistant side of a turn across its lifecycle.
///
/// `Streaming` holds the raw interim buffer while fragments arrive;
/// `Parsed` is the immutable finalized form. `image` is a generated-image
/// payload that only ever lives in memory (never persisted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssistantContent {
    Pending,
    Streaming(String),
    Parsed {
        content: ParsedContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
    Error(String),
}

impl AssistantContent {
    /// The string form re-sent to the model as history. Always the raw
    /// content, never the structured blocks.
    pub fn resend_text(&self) -> &str {
        match self {
            AssistantContent::Pending => "",
            AssistantContent::Streaming(s) => s,
            AssistantContent::Parsed { content, .. } => &content.raw_content,
            AssistantContent::Error(s) => s,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AssistantContent::Pending)
    }
}

/// One exchange: what the user sent and what the assistant answered.
///
/// The assistant field is only mutable while this is the most recent turn
/// and a stream is in flight; after finalization it changes only by
/// explicit user action (delete/clear).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user: UserContent,
    pub assistant: AssistantContent,
}

impl ChatTurn {
    pub fn pending(user: UserContent) -> Self {
        Self {
            user,
            assistant: AssistantContent::Pending,
        }
    }

    /// Copy with any generated-image payload removed. Images are
    /// session-only and must never reach storage.
    pub fn without_image(&self) -> Self {
        let assistant = match &self.assistant {
            AssistantContent::Parsed { content, .. } => AssistantContent::Parsed {
                content: content.clone(),
                image: None,
            },
            other => other.clone(),
        };
        Self {
            user: self.user.clone(),
            assistant,
        }
    }
}

/// Persisted form of a turn. The timestamp is the logical write time,
/// strictly monotonic within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChatTurn {
    #[serde(flatten)]
    pub turn: ChatTurn,
    pub timestamp: DateTime<Utc>,
}
