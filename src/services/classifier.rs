use crate::models::{BlockKind, ContentBlock, ParsedContent};

/// Fence languages that render as runnable commands rather than code.
const SHELL_LANGUAGES: &[&str] = &["bash", "sh", "zsh", "fish", "cmd", "powershell"];

/// Classify raw assistant output into an ordered sequence of typed blocks.
///
/// Pure and total: never panics, and the worst case is a single text block
/// holding the whole (trimmed) input. `raw_content` always equals `raw`,
/// so classifying the same raw string twice yields identical results.
pub fn classify(raw: &str) -> ParsedContent {
    let lines: Vec<&str> = raw.lines().collect();
    let mut scanner = Scanner::new(&lines);
    scanner.run();

    let mut blocks = scanner.blocks;
    if blocks.is_empty() {
        blocks.push(ContentBlock::text(raw.trim()));
    }

    ParsedContent {
        blocks,
        raw_content: raw.to_string(),
    }
}

/// Line-oriented scanner. Probes are attempted in a fixed precedence order
/// at each line boundary (fence, JSON, XML, command, math, table, text);
/// the first match fully consumes its region before scanning resumes.
struct Scanner<'a> {
    lines: &'a [&'a str],
    pos: usize,
    blocks: Vec<ContentBlock>,
}

impl<'a> Scanner<'a> {
    fn new(lines: &'a [&'a str]) -> Self {
        Self {
            lines,
            pos: 0,
            blocks: Vec::new(),
        }
    }

    fn run(&mut self) {
        while self.pos < self.lines.len() {
            let line = self.lines[self.pos];

            if is_fence_open(line) {
                self.consume_fence();
            } else if is_json_start(line) {
                if !self.try_consume_json() {
                    self.consume_text();
                }
            } else if is_xml_start(line) {
                if !self.try_consume_xml() {
                    self.consume_text();
                }
            } else if is_command_line(line) {
                self.consume_command();
            } else if is_math_line(line) {
                self.consume_math();
            } else if is_table_row(line) {
                if !self.try_consume_table() {
                    self.consume_text();
                }
            } else {
                self.consume_text();
            }
        }
    }

    /// Fenced code: everything until a closing fence (or end of input) is
    /// kept verbatim. Shell-family languages become command blocks.
    fn consume_fence(&mut self) {
        let opener = self.lines[self.pos].trim_start();
        let token = opener.trim_start_matches('`').trim();
        let language = if token.is_empty() {
            "text".to_string()
        } else {
            token.to_lowercase()
        };
        self.pos += 1;

        let start = self.pos;
        while self.pos < self.lines.len() && !self.lines[self.pos].trim().starts_with("```") {
            self.pos += 1;
        }
        let content = self.lines[start..self.pos].join("\n");
        if self.pos < self.lines.len() {
            // Consume the closing fence line.
            self.pos += 1;
        }

        let kind = if SHELL_LANGUAGES.contains(&language.as_str()) {
            BlockKind::Command
        } else {
            BlockKind::Code
        };
        let title = fence_title(&language, kind);
        self.blocks.push(ContentBlock {
            kind,
            content,
            language: Some(language),
            title: Some(title),
        });
    }

    /// JSON: forward brace/bracket balance scan that ignores brackets inside
    /// string literals. The candidate region must parse as valid JSON;
    /// otherwise the opening line falls through to plain text.
    fn try_consume_json(&mut self) -> bool {
        let mut brace = 0i32;
        let mut bracket = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (offset, line) in self.lines[self.pos..].iter().enumerate() {
            for ch in line.chars() {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == '"' {
                        in_string = false;
                    }
                    continue;
                }
                match ch {
                    '"' => in_string = true,
                    '{' => brace += 1,
                    '}' => brace -= 1,
                    '[' => bracket += 1,
                    ']' => bracket -= 1,
                    _ => {}
                }
            }
            // Strings do not span lines in valid JSON.
            in_string = false;
            escaped = false;

            if brace == 0 && bracket == 0 {
                end = Some(self.pos + offset);
                break;
            }
        }

        let Some(end) = end else {
            // Depth never returned to zero: the region is truncated. Fall
            // back to one text block so no content is dropped.
            self.fall_back_to_text(self.lines.len());
            return true;
        };

        let candidate = self.lines[self.pos..=end].join("\n");
        if serde_json::from_str::<serde_json::Value>(&candidate).is_err() {
            return false;
        }

        self.blocks.push(ContentBlock {
            kind: BlockKind::Json,
            content: candidate,
            language: None,
            title: Some("JSON".to_string()),
        });
        self.pos = end + 1;
        true
    }

    /// XML/HTML: maintain a stack of open tag names; the region ends when
    /// the stack returns to empty. No schema validation beyond tag-name
    /// matching.
    fn try_consume_xml(&mut self) -> bool {
        let mut stack: Vec<String> = Vec::new();
        let mut tags_seen = 0usize;
        let mut end = None;

        for (offset, line) in self.lines[self.pos..].iter().enumerate() {
            tags_seen += scan_tags(line, &mut stack);
            if offset == 0 && tags_seen == 0 {
                // Tag-like start but no complete tag on the line.
                return false;
            }
            if stack.is_empty() {
                end = Some(self.pos + offset);
                break;
            }
        }

        let Some(end) = end else {
            // Unterminated tag stack at end of input.
            self.fall_back_to_text(self.lines.len());
            return true;
        };

        self.blocks.push(ContentBlock {
            kind: BlockKind::Xml,
            content: self.lines[self.pos..=end].join("\n"),
            language: None,
            title: Some("XML".to_string()),
        });
        self.pos = end + 1;
        true
    }

    fn consume_command(&mut self) {
        let line = self.lines[self.pos];
        self.blocks.push(ContentBlock {
            kind: BlockKind::Command,
            content: line[2..].to_string(),
            language: Some("bash".to_string()),
            title: Some("Command".to_string()),
        });
        self.pos += 1;
    }

    fn consume_math(&mut self) {
        self.blocks.push(ContentBlock {
            kind: BlockKind::Math,
            content: self.lines[self.pos].to_string(),
            language: None,
            title: Some("Math".to_string()),
        });
        self.pos += 1;
    }

    /// Tables need at least two consecutive row lines to commit; a lone
    /// candidate row is not a table.
    fn try_consume_table(&mut self) -> bool {
        let mut end = self.pos;
        while end < self.lines.len() && is_table_row(self.lines[end]) {
            end += 1;
        }
        if end - self.pos < 2 {
            return false;
        }

        self.blocks.push(ContentBlock {
            kind: BlockKind::Table,
            content: self.lines[self.pos..end].join("\n"),
            language: None,
            title: Some("Table".to_string()),
        });
        self.pos = end;
        true
    }

    /// Plain text: the current line plus every immediately-following
    /// non-special line, trimmed into one block.
    fn consume_text(&mut self) {
        let start = self.pos;
        self.pos += 1;
        while self.pos < self.lines.len() && !is_special_line(self.lines[self.pos]) {
            self.pos += 1;
        }
        let text = self.lines[start..self.pos].join("\n");
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.blocks.push(ContentBlock::text(trimmed));
        }
    }

    /// Degrade an unterminated region into one text block running to `end`.
    fn fall_back_to_text(&mut self, end: usize) {
        let text = self.lines[self.pos..end].join("\n");
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.blocks.push(ContentBlock::text(trimmed));
        }
        self.pos = end;
    }
}

fn is_special_line(line: &str) -> bool {
    is_fence_open(line)
        || is_json_start(line)
        || is_xml_start(line)
        || is_command_line(line)
        || is_math_line(line)
        || is_table_row(line)
}

fn is_fence_open(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn is_json_start(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('{') || t.starts_with('[')
}

fn is_xml_start(line: &str) -> bool {
    let t = line.trim_start();
    if !t.starts_with('<') || t.starts_with("<!--") {
        return false;
    }
    t.chars().nth(1).is_some_and(|c| c.is_ascii_alphabetic())
}

fn is_command_line(line: &str) -> bool {
    line.starts_with("$ ") || line.starts_with("# ")
}

fn is_math_line(line: &str) -> bool {
    (line.contains("\\[") && line.contains("\\]")) || line.matches("$$").count() >= 2
}

fn is_table_row(line: &str) -> bool {
    if !line.contains('|') {
        return false;
    }
    line.split('|').filter(|cell| !cell.trim().is_empty()).count() >= 2
}

/// Extract tags from one line and apply them to the open-tag stack.
/// Returns the number of complete tags encountered.
fn scan_tags(line: &str, stack: &mut Vec<String>) -> usize {
    let mut seen = 0;
    let mut rest = line;

    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            break;
        };
        let token = &after[..close];
        rest = &after[close + 1..];

        if token.starts_with('!') || token.starts_with('?') {
            continue;
        }
        seen += 1;

        if let Some(name) = token.strip_prefix('/') {
            let name = tag_name(name);
            // A closing tag pops only when it matches the innermost open tag.
            if stack.last().map(String::as_str) == Some(name.as_str()) {
                stack.pop();
            }
        } else if !token.ends_with('/') {
            let name = tag_name(token);
            if !name.is_empty() {
                stack.push(name);
            }
        }
    }

    seen
}

fn tag_name(token: &str) -> String {
    token
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
        .collect()
}

fn fence_title(language: &str, kind: BlockKind) -> String {
    let label = match kind {
        BlockKind::Command => "Command",
        _ => "Code",
    };
    if language == "text" {
        return label.to_string();
    }
    let mut chars = language.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    format!("{} {}", capitalized, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_single_block() {
        let parsed = classify("Hello world.\nSecond line.");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);
        assert_eq!(parsed.blocks[0].content, "Hello world.\nSecond line.");
    }

    #[test]
    fn test_empty_input() {
        let parsed = classify("");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);
        assert_eq!(parsed.blocks[0].content, "");
        assert_eq!(parsed.raw_content, "");
    }

    #[test]
    fn test_fenced_code_python() {
        let parsed = classify("```python\nprint(1)\n```");
        assert_eq!(parsed.blocks.len(), 1);
        let block = &parsed.blocks[0];
        assert_eq!(block.kind, BlockKind::Code);
        assert_eq!(block.content, "print(1)");
        assert_eq!(block.language.as_deref(), Some("python"));
        assert_eq!(block.title.as_deref(), Some("Python Code"));
    }

    #[test]
    fn test_fenced_code_bash_is_command() {
        let parsed = classify("```bash\nls -la\n```");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Command);
        assert_eq!(parsed.blocks[0].content, "ls -la");
        assert_eq!(parsed.blocks[0].language.as_deref(), Some("bash"));
    }

    #[test]
    fn test_fence_without_language_defaults_to_text() {
        let parsed = classify("```\nanything\n```");
        assert_eq!(parsed.blocks[0].kind, BlockKind::Code);
        assert_eq!(parsed.blocks[0].language.as_deref(), Some("text"));
    }

    #[test]
    fn test_unterminated_fence_runs_to_end() {
        let parsed = classify("```rust\nfn main() {}\nlet x = 1;");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Code);
        assert_eq!(parsed.blocks[0].content, "fn main() {}\nlet x = 1;");
    }

    #[test]
    fn test_code_preserves_interior_whitespace() {
        let parsed = classify("```python\ndef f():\n    return 1\n```");
        assert_eq!(parsed.blocks[0].content, "def f():\n    return 1");
    }

    #[test]
    fn test_json_object() {
        let parsed = classify("{\"a\": 1}");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Json);
        let value: serde_json::Value = serde_json::from_str(&parsed.blocks[0].content).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_json_multiline_with_braces_in_strings() {
        let input = "{\n  \"text\": \"curly } inside\",\n  \"path\": \"a\\\\b\"\n}";
        let parsed = classify(input);
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Json);
        assert_eq!(parsed.blocks[0].content, input);
    }

    #[test]
    fn test_invalid_json_falls_back_to_text() {
        let parsed = classify("{not valid");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);
        assert_eq!(parsed.blocks[0].content, "{not valid");
    }

    #[test]
    fn test_unterminated_json_region_becomes_text() {
        let parsed = classify("{\n  \"a\": 1,\n  \"b\": 2");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);
        assert!(parsed.blocks[0].content.contains("\"b\": 2"));
    }

    #[test]
    fn test_json_array() {
        let parsed = classify("[1, 2, 3]");
        assert_eq!(parsed.blocks[0].kind, BlockKind::Json);
    }

    #[test]
    fn test_xml_block() {
        let parsed = classify("<config>\n  <name>test</name>\n</config>");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Xml);
        assert_eq!(
            parsed.blocks[0].content,
            "<config>\n  <name>test</name>\n</config>"
        );
    }

    #[test]
    fn test_xml_self_closing_tags_ignored() {
        let parsed = classify("<root>\n  <item value=\"1\"/>\n</root>");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Xml);
    }

    #[test]
    fn test_unterminated_xml_becomes_text() {
        let parsed = classify("<div>\n  <p>hello</p>");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);
        assert!(parsed.blocks[0].content.contains("hello"));
    }

    #[test]
    fn test_html_comment_is_not_xml() {
        let parsed = classify("<!-- just a comment -->");
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);
    }

    #[test]
    fn test_command_prefix_stripped() {
        let parsed = classify("$ ls -la");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Command);
        assert_eq!(parsed.blocks[0].content, "ls -la");
    }

    #[test]
    fn test_hash_command_prefix() {
        let parsed = classify("# apt install curl");
        assert_eq!(parsed.blocks[0].kind, BlockKind::Command);
        assert_eq!(parsed.blocks[0].content, "apt install curl");
    }

    #[test]
    fn test_math_bracket_pair() {
        let parsed = classify("\\[ x^2 + y^2 = z^2 \\]");
        assert_eq!(parsed.blocks[0].kind, BlockKind::Math);
        assert_eq!(parsed.blocks[0].content, "\\[ x^2 + y^2 = z^2 \\]");
    }

    #[test]
    fn test_math_dollar_delimiters() {
        let parsed = classify("$$e = mc^2$$");
        assert_eq!(parsed.blocks[0].kind, BlockKind::Math);
    }

    #[test]
    fn test_table_requires_two_rows() {
        let parsed = classify("a|b|c");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);

        let parsed = classify("a|b|c\n1|2|3");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Table);
        assert_eq!(parsed.blocks[0].content, "a|b|c\n1|2|3");
    }

    #[test]
    fn test_rejected_table_row_joins_following_text() {
        // A lone candidate row falls through to text and absorbs the
        // following non-special line into the same block.
        let parsed = classify("just | one\nplain line");
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].kind, BlockKind::Text);
        assert_eq!(parsed.blocks[0].content, "just | one\nplain line");
    }

    #[test]
    fn test_mixed_document_order_preserved() {
        let input = "Here is some code:\n```python\nx = 1\n```\nAnd data:\n{\"k\": true}\nDone.";
        let parsed = classify(input);
        let kinds: Vec<BlockKind> = parsed.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::Text,
                BlockKind::Code,
                BlockKind::Text,
                BlockKind::Json,
                BlockKind::Text
            ]
        );
        assert_eq!(parsed.blocks[0].content, "Here is some code:");
        assert_eq!(parsed.blocks[4].content, "Done.");
    }

    #[test]
    fn test_round_trip_accounts_for_all_content() {
        let input = "intro line\n```sh\necho hi\n```\n$ whoami\ntail line";
        let parsed = classify(input);
        let joined: String = parsed
            .blocks
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        for needle in ["intro line", "echo hi", "whoami", "tail line"] {
            assert!(joined.contains(needle), "missing {:?}", needle);
        }
    }

    #[test]
    fn test_classify_is_idempotent() {
        let input = "text\n```bash\nls\n```\n{\"a\": [1, 2]}";
        let first = classify(input);
        let second = classify(&first.raw_content);
        assert_eq!(first, second);
    }

    #[test]
    fn test_raw_content_always_preserved() {
        let input = "  padded text  ";
        let parsed = classify(input);
        assert_eq!(parsed.raw_content, input);
        assert_eq!(parsed.blocks[0].content, "padded text");
    }
}
