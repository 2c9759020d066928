use crate::models::ParsedContent;
use crate::services::classifier::classify;

/// Models whose reasoning should stay visible, matched against the base
/// model name (after any provider prefix).
const THINKING_MODELS: &[&str] = &["deepseek-r1", "think", "reasoning", "cot"];

fn is_thinking_model(model: &str) -> bool {
    let base = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    THINKING_MODELS.iter().any(|m| base.contains(m))
}

/// Clean reasoning markup out of a model response before display.
///
/// Regular models get `<think>`/`<reasoning>` sections removed and
/// `<answer>` tags unwrapped; thinking models keep the content with the
/// tags reformatted as labels. Runs of three or more newlines collapse to
/// two either way. Unclosed sections are left untouched.
pub fn clean_response(text: &str, model: Option<&str>) -> String {
    if text.is_empty() {
        return String::new();
    }

    let thinking = model.is_some_and(is_thinking_model);
    let cleaned = if thinking {
        text.replace("<think>", "\n\n\u{1f4ad} *Thinking:*\n")
            .replace("</think>", "\n\n")
            .replace("<reasoning>", "\n\n\u{1f4a1} *Reasoning:*\n")
            .replace("</reasoning>", "\n\n")
            .replace("<answer>", "\n\n\u{2705} *Answer:*\n")
            .replace("</answer>", "")
    } else {
        let cleaned = strip_sections(text, "<think>", "</think>");
        let cleaned = strip_sections(&cleaned, "<reasoning>", "</reasoning>");
        cleaned.replace("<answer>", "").replace("</answer>", "")
    };

    collapse_newlines(&cleaned).trim().to_string()
}

/// Clean then classify. The blocks come from the cleaned text; the raw
/// string is kept as-is so resent history matches what the model produced.
pub fn clean_and_classify(raw: &str, model: Option<&str>) -> ParsedContent {
    let cleaned = clean_response(raw, model);
    ParsedContent {
        blocks: classify(&cleaned).blocks,
        raw_content: raw.to_string(),
    }
}

/// Remove every `open`..`close` span, tags included. A span missing its
/// closing tag is kept.
fn strip_sections(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(open) {
        let Some(end) = rest[start..].find(close) else {
            break;
        };
        out.push_str(&rest[..start]);
        rest = &rest[start + end + close.len()..];
    }
    out.push_str(rest);
    out
}

fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            run += 1;
            if run <= 2 {
                out.push(ch);
            }
        } else {
            run = 0;
            out.push(ch);
        }
    }
    out
}
