use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::OllamaChatChunk;
use crate::providers::types::StreamEvent;

/// What a single NDJSON line amounts to.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    Fragment(String),
    /// Terminal chunk. Carries the full response text when the backend
    /// included one, which overrides the accumulated fragments.
    Done(Option<String>),
    Error(String),
    Skip,
}

/// Interpret one line of the Ollama chat stream.
pub fn parse_chunk_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skip;
    }

    match serde_json::from_str::<OllamaChatChunk>(line) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return LineOutcome::Error(error);
            }
            let content = chunk.message.and_then(|m| m.content).unwrap_or_default();
            if chunk.done {
                let authoritative = (!content.is_empty()).then_some(content);
                LineOutcome::Done(authoritative)
            } else if content.is_empty() {
                LineOutcome::Skip
            } else {
                LineOutcome::Fragment(content)
            }
        }
        Err(e) => {
            tracing::warn!("Failed to parse stream chunk: {}", e);
            LineOutcome::Skip
        }
    }
}

/// Drive an NDJSON response body, translating each line into stream
/// events on `tx`. Always ends with exactly one terminal event.
pub async fn pump_ndjson_stream(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut stream = response.bytes_stream();
    let mut byte_buf: Vec<u8> = Vec::new();
    let mut buffer = String::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return;
            }
        };

        byte_buf.extend_from_slice(&bytes);

        // Decode as much valid UTF-8 as possible; a multi-byte character
        // split across network chunks stays buffered until complete.
        let decoded = match std::str::from_utf8(&byte_buf) {
            Ok(s) => {
                let decoded = s.to_string();
                byte_buf.clear();
                decoded
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to == 0 {
                    continue;
                }
                let decoded = String::from_utf8_lossy(&byte_buf[..valid_up_to]).into_owned();
                byte_buf.drain(..valid_up_to);
                decoded
            }
        };

        buffer.push_str(&decoded.replace("\r\n", "\n"));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].to_string();
            buffer.drain(..line_end + 1);

            match parse_chunk_line(&line) {
                LineOutcome::Fragment(text) => {
                    if tx.send(StreamEvent::Fragment(text)).await.is_err() {
                        return; // receiver dropped
                    }
                }
                LineOutcome::Done(text) => {
                    let _ = tx.send(StreamEvent::Final { text, image: None }).await;
                    return;
                }
                LineOutcome::Error(message) => {
                    let _ = tx.send(StreamEvent::Error(message)).await;
                    return;
                }
                LineOutcome::Skip => {}
            }
        }
    }

    // Trailing line without a newline, then whatever the body ended on.
    match parse_chunk_line(&buffer) {
        LineOutcome::Fragment(text) => {
            let _ = tx.send(StreamEvent::Fragment(text)).await;
            // Body ended without a done marker; treat what arrived as
            // complete rather than dropping the response.
            let _ = tx
                .send(StreamEvent::Final {
                    text: None,
                    image: None,
                })
                .await;
        }
        LineOutcome::Done(text) => {
            let _ = tx.send(StreamEvent::Final { text, image: None }).await;
        }
        LineOutcome::Error(message) => {
            let _ = tx.send(StreamEvent::Error(message)).await;
        }
        LineOutcome::Skip => {
            let _ = tx
                .send(StreamEvent::Final {
                    text: None,
                    image: None,
                })
                .await;
        }
    }
}
