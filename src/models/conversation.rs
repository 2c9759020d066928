use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one persisted conversation, derived from its stored turns.
///
/// Exactly one of these exists per (model identity, conversation id) pair
/// with at least one turn; empty conversations are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub model_identity: String,
    pub conversation_id: String,
    pub title: String,
    pub last_message_preview: String,
    pub timestamp: DateTime<Utc>,
    pub message_count: usize,
}

/// Truncate text to a short title for conversation lists.
pub fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.len() > 50 {
        let boundary = first_line
            .char_indices()
            .take_while(|(i, _)| *i < 47)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(47);
        format!("{}...", &first_line[..boundary])
    } else {
        first_line.to_string()
    }
}

/// Truncate text to a one-line preview.
pub fn truncate_preview(text: &str) -> String {
    const MAX: usize = 100;
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.chars().count() > MAX {
        first_line.chars().take(MAX).collect()
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_title_short() {
        assert_eq!(truncate_title("Hello"), "Hello");
    }

    #[test]
    fn test_truncate_title_long() {
        let long = "a".repeat(80);
        let title = truncate_title(&long);
        assert!(title.ends_with("..."));
        assert!(title.len() <= 50);
    }

    #[test]
    fn test_truncate_title_first_line_only() {
        assert_eq!(truncate_title("What is 2+2?\nAnd 3+3?"), "What is 2+2?");
    }

    #[test]
    fn test_truncate_title_multibyte_boundary() {
        let text = "é".repeat(60);
        let title = truncate_title(&text);
        assert!(title.ends_with("..."));
    }
}
