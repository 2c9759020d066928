use serde::{Deserialize, Serialize};

/// The lexical category of one classified region of assistant output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Text,
    Code,
    Command,
    Json,
    Xml,
    Table,
    Math,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Text => "text",
            BlockKind::Code => "code",
            BlockKind::Command => "command",
            BlockKind::Json => "json",
            BlockKind::Xml => "xml",
            BlockKind::Table => "table",
            BlockKind::Math => "math",
        }
    }
}

/// One contiguous, typed unit of assistant output.
///
/// `content` keeps original whitespace for code-like kinds and is trimmed
/// for `Text`. `language` is set for `Code`/`Command`; `title` is a derived
/// human label and never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub kind: BlockKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ContentBlock {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Text,
            content: content.into(),
            language: None,
            title: None,
        }
    }
}

/// The classified form of one completed assistant turn.
///
/// `raw_content` is the unparsed string the blocks were derived from. It is
/// what gets re-sent to the model as conversation history; the blocks exist
/// only for rendering and are never the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedContent {
    pub blocks: Vec<ContentBlock>,
    pub raw_content: String,
}

impl ParsedContent {
    /// Fallback form: the whole input as a single text block.
    pub fn plain(raw: &str) -> Self {
        Self {
            blocks: vec![ContentBlock::text(raw.trim())],
            raw_content: raw.to_string(),
        }
    }
}
