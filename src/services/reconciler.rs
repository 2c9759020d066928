use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::ParsedContent;
use crate::providers::StreamEvent;
use crate::services::cleaner::clean_and_classify;

/// How long after the first unflushed fragment an interim render fires.
/// The deadline is not reset by later fragments, so UI latency stays
/// bounded regardless of fragment rate.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub debounce: Duration,
    /// Model identity producing the stream, used to decide how reasoning
    /// markup is cleaned at finalization.
    pub model: Option<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            model: None,
        }
    }
}

/// Output of the reconciler, tagged with the stream generation so the
/// session controller can discard updates from a stream it has abandoned.
#[derive(Debug, Clone)]
pub enum ReconcilerUpdate {
    /// Raw accumulated buffer for interim display while streaming.
    Interim { generation: u64, text: String },
    /// The stream ended normally; the buffer was classified exactly once.
    Finalized {
        generation: u64,
        content: ParsedContent,
        image: Option<String>,
    },
    /// The transport reported an error; no classification was attempted.
    Errored { generation: u64, message: String },
    /// The stream was cancelled or the channel closed without a terminal
    /// event; nothing was finalized.
    Cancelled { generation: u64 },
}

impl ReconcilerUpdate {
    pub fn generation(&self) -> u64 {
        match self {
            ReconcilerUpdate::Interim { generation, .. }
            | ReconcilerUpdate::Finalized { generation, .. }
            | ReconcilerUpdate::Errored { generation, .. }
            | ReconcilerUpdate::Cancelled { generation } => *generation,
        }
    }
}

/// Own one in-flight assistant turn: accumulate fragments in arrival order,
/// emit debounced interim renders, and classify the full buffer exactly
/// once at end of stream.
///
/// Terminates on the first terminal stream event, on cancellation, or when
/// the event channel closes. A pending debounce flush never outlives the
/// pump, so no stale timer can touch a turn that has moved on.
pub async fn run_reconciler(
    mut events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    config: ReconcilerConfig,
    generation: u64,
    updates: mpsc::Sender<ReconcilerUpdate>,
) {
    let mut buffer = String::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let flush = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = updates.send(ReconcilerUpdate::Cancelled { generation }).await;
                return;
            }
            _ = flush => {
                deadline = None;
                let update = ReconcilerUpdate::Interim {
                    generation,
                    text: buffer.clone(),
                };
                if updates.send(update).await.is_err() {
                    return;
                }
            }
            event = events.recv() => {
                match event {
                    Some(StreamEvent::Fragment(text)) => {
                        buffer.push_str(&text);
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + config.debounce);
                        }
                    }
                    Some(StreamEvent::Final { text, image }) => {
                        // The transport's authoritative final payload wins
                        // over the locally accumulated buffer.
                        let raw = text.unwrap_or(buffer);
                        let update = ReconcilerUpdate::Finalized {
                            generation,
                            content: clean_and_classify(&raw, config.model.as_deref()),
                            image,
                        };
                        let _ = updates.send(update).await;
                        return;
                    }
                    Some(StreamEvent::Error(message)) => {
                        let _ = updates
                            .send(ReconcilerUpdate::Errored { generation, message })
                            .await;
                        return;
                    }
                    None => {
                        // Channel closed without a terminal event: the
                        // transport went away mid-stream.
                        let _ = updates.send(ReconcilerUpdate::Cancelled { generation }).await;
                        return;
                    }
                }
            }
        }
    }
}
