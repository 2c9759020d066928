use serde::{Deserialize, Serialize};

pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;

/// Per-session generation settings.
///
/// An empty system prompt is omitted from outgoing requests. RAG is
/// mutually exclusive with image-attached sends; the session controller
/// enforces that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    pub system_prompt: String,
    pub temperature: f32,
    pub rag_enabled: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            temperature: 0.7,
            rag_enabled: false,
        }
    }
}

impl ModelSettings {
    /// The system prompt as sent over the wire, or `None` when blank.
    pub fn effective_system_prompt(&self) -> Option<String> {
        let trimmed = self.system_prompt.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn clamped_temperature(&self) -> f32 {
        self.temperature.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
    }
}
