use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{AssistantContent, ChatTurn, ModelSettings, UserContent};
use crate::providers::{ChatMessage, ChatRequest, ChatTransport, StreamEvent, TransportError};
use crate::services::cleaner::clean_and_classify;
use crate::services::kv::StoreError;
use crate::services::reconciler::{run_reconciler, ReconcilerConfig, ReconcilerUpdate};
use crate::services::store::{ConversationStore, WriteOutcome};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No model selected")]
    NoModelSelected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the session surfaces to its caller after applying an update.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AssistantInterim { text: String },
    AssistantFinalized,
    AssistantErrored { message: String },
    StreamCancelled,
    StorageWarning { message: String },
}

/// Orchestrates one conversation: owns the live turn list and is its only
/// mutator. Turn state changes happen exclusively inside `next_event()`,
/// on the caller's task; background work only feeds the update channel.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    store: ConversationStore,
    settings: ModelSettings,
    model: Option<String>,
    conversation_id: String,
    turns: Vec<ChatTurn>,
    cancel: CancellationToken,
    generation: u64,
    update_tx: mpsc::Sender<ReconcilerUpdate>,
    update_rx: mpsc::Receiver<ReconcilerUpdate>,
    pending_events: VecDeque<SessionEvent>,
    reconciler_config: ReconcilerConfig,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>, store: ConversationStore) -> Self {
        let (update_tx, update_rx) = mpsc::channel(64);
        let conversation_id = store.create_conversation();
        Self {
            transport,
            store,
            settings: ModelSettings::default(),
            model: None,
            conversation_id,
            turns: Vec::new(),
            cancel: CancellationToken::new(),
            generation: 0,
            update_tx,
            update_rx,
            pending_events: VecDeque::new(),
            reconciler_config: ReconcilerConfig::default(),
        }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut ModelSettings {
        &mut self.settings
    }

    /// Select the model identity for subsequent sends. Abandons any
    /// in-flight stream and starts a fresh conversation.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.abandon_inflight();
        self.model = Some(model.into());
        self.conversation_id = self.store.create_conversation();
        self.turns.clear();
    }

    /// Submit a user turn. Appends a pending turn immediately; the
    /// assistant side fills in through `next_event()`.
    pub fn send(&mut self, text: String, image: Option<String>) -> Result<(), SessionError> {
        let model = self.model.clone().ok_or(SessionError::NoModelSelected)?;

        self.abandon_inflight();
        let generation = self.generation;
        let cancel = self.cancel.clone();

        let user = match image {
            Some(image) => UserContent::TextWithImage { text, image },
            None => UserContent::Text(text),
        };
        let rag_eligible = self.settings.rag_enabled && user.image().is_none();
        self.turns.push(ChatTurn::pending(user));

        let request = self.build_request(&model);
        let updates = self.update_tx.clone();
        let transport = self.transport.clone();

        if rag_eligible {
            let query = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = updates.send(ReconcilerUpdate::Cancelled { generation }).await;
                    }
                    result = transport.rag_query(&query, &request.model) => {
                        let update = match result {
                            Ok(text) => ReconcilerUpdate::Finalized {
                                generation,
                                content: clean_and_classify(&text, Some(&request.model)),
                                image: None,
                            },
                            Err(e) => ReconcilerUpdate::Errored {
                                generation,
                                message: e.to_string(),
                            },
                        };
                        let _ = updates.send(update).await;
                    }
                }
            });
        } else {
            let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(64);
            let config = ReconcilerConfig {
                model: Some(model.clone()),
                ..self.reconciler_config.clone()
            };
            tokio::spawn(run_reconciler(event_rx, cancel, config, generation, updates));
            tokio::spawn(async move {
                if let Err(e) = transport.open_stream(request, event_tx.clone()).await {
                    let _ = event_tx.send(StreamEvent::Error(e.to_string())).await;
                }
            });
        }

        Ok(())
    }

    /// Stop the in-flight stream, if any. The pending turn reverts to its
    /// pre-stream state when the cancellation lands in `next_event()`.
    pub fn cancel_streaming(&self) {
        self.cancel.cancel();
    }

    pub fn start_new_conversation(&mut self) {
        self.abandon_inflight();
        self.conversation_id = self.store.create_conversation();
        self.turns.clear();
    }

    /// Switch to a stored conversation and make it current.
    pub async fn load_existing(
        &mut self,
        model: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.abandon_inflight();
        let model = model.into();
        let conversation_id = conversation_id.into();

        self.turns = self.store.load_conversation(&model, &conversation_id).await?;
        self.store.set_current(&model, &conversation_id).await?;
        self.model = Some(model);
        self.conversation_id = conversation_id;
        Ok(())
    }

    /// Delete the current conversation's stored record and start fresh.
    pub async fn delete_conversation(&mut self) -> Result<(), SessionError> {
        self.abandon_inflight();
        if let Some(model) = &self.model {
            self.store
                .delete_conversation(model, &self.conversation_id)
                .await?;
        }
        self.conversation_id = self.store.create_conversation();
        self.turns.clear();
        Ok(())
    }

    /// Drop the live turns but keep the same conversation identity.
    pub async fn clear_conversation(&mut self) -> Result<(), SessionError> {
        self.abandon_inflight();
        if let Some(model) = &self.model {
            self.store
                .delete_conversation(model, &self.conversation_id)
                .await?;
        }
        self.turns.clear();
        Ok(())
    }

    /// Wait for the next update and apply it. Updates tagged with an
    /// abandoned generation are discarded without touching any turn.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.pending_events.pop_front() {
            return Some(event);
        }

        loop {
            let update = self.update_rx.recv().await?;
            if update.generation() != self.generation {
                continue;
            }

            match update {
                ReconcilerUpdate::Interim { text, .. } => {
                    if let Some(turn) = self.turns.last_mut() {
                        turn.assistant = AssistantContent::Streaming(text.clone());
                    }
                    return Some(SessionEvent::AssistantInterim { text });
                }
                ReconcilerUpdate::Finalized { content, image, .. } => {
                    if let Some(turn) = self.turns.last_mut() {
                        turn.assistant = AssistantContent::Parsed { content, image };
                    }
                    self.persist_last_turn().await;
                    return Some(SessionEvent::AssistantFinalized);
                }
                ReconcilerUpdate::Errored { message, .. } => {
                    if let Some(turn) = self.turns.last_mut() {
                        turn.assistant = AssistantContent::Error(message.clone());
                    }
                    self.persist_last_turn().await;
                    return Some(SessionEvent::AssistantErrored { message });
                }
                ReconcilerUpdate::Cancelled { .. } => {
                    if let Some(turn) = self.turns.last_mut() {
                        if !matches!(
                            turn.assistant,
                            AssistantContent::Parsed { .. } | AssistantContent::Error(_)
                        ) {
                            turn.assistant = AssistantContent::Pending;
                        }
                    }
                    return Some(SessionEvent::StreamCancelled);
                }
            }
        }
    }

    /// Full history as the transport sees it: prior turns re-sent as raw
    /// text, unfinished assistant sides omitted.
    fn build_request(&self, model: &str) -> ChatRequest {
        let mut messages = Vec::new();
        for turn in &self.turns {
            messages.push(ChatMessage {
                role: crate::models::Role::User,
                content: turn.user.text().to_string(),
                image: turn.user.image().map(str::to_string),
            });
            if !turn.assistant.is_pending() {
                let text = turn.assistant.resend_text();
                if !text.is_empty() {
                    messages.push(ChatMessage::assistant(text));
                }
            }
        }

        ChatRequest {
            model: model.to_string(),
            messages,
            system_prompt: self.settings.effective_system_prompt(),
            temperature: self.settings.clamped_temperature(),
        }
    }

    /// Append the finalized last turn to storage. Storage trouble never
    /// fails the turn; it degrades to a `StorageWarning`.
    async fn persist_last_turn(&mut self) {
        let (Some(model), Some(turn)) = (self.model.clone(), self.turns.last().cloned()) else {
            return;
        };

        match self
            .store
            .append_turn(&model, &self.conversation_id, &turn)
            .await
        {
            Ok(WriteOutcome::Persisted) | Ok(WriteOutcome::PersistedAfterEviction) => {
                if let Err(e) = self.store.set_current(&model, &self.conversation_id).await {
                    tracing::warn!("Failed to update current conversation pointer: {}", e);
                }
            }
            Ok(WriteOutcome::Lost(message)) => {
                self.pending_events
                    .push_back(SessionEvent::StorageWarning { message });
            }
            Err(e) => {
                tracing::error!("Failed to persist turn: {}", e);
                self.pending_events.push_back(SessionEvent::StorageWarning {
                    message: e.to_string(),
                });
            }
        }
    }

    fn abandon_inflight(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::models::BlockKind;
    use crate::providers::{ProviderInfo, ToolOutput};
    use crate::services::classifier::classify;
    use crate::services::kv::MemoryStore;

    /// Scripted transport: each `open_stream` call plays the next script.
    /// An empty script leaves the stream open until cancellation.
    struct MockTransport {
        scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
        rag_answer: String,
        streamed: AtomicBool,
    }

    impl MockTransport {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                rag_answer: "From the documents: 42.".to_string(),
                streamed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_request(&self, _request: ChatRequest) -> Result<String, TransportError> {
            Ok("single shot".to_string())
        }

        async fn open_stream(
            &self,
            _request: ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), TransportError> {
            self.streamed.store(true, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(events) => {
                    for event in events {
                        let _ = tx.send(event).await;
                    }
                    Ok(())
                }
                None => {
                    // Hold the sender open forever; only cancellation
                    // can end this stream.
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        async fn rag_query(&self, _query: &str, _model: &str) -> Result<String, TransportError> {
            Ok(self.rag_answer.clone())
        }

        async fn list_providers(&self) -> Result<Vec<ProviderInfo>, TransportError> {
            Ok(vec![])
        }

        async fn list_models(
            &self,
            _provider: &str,
            _force_refresh: bool,
        ) -> Result<Vec<String>, TransportError> {
            Ok(vec!["test-model".to_string()])
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: serde_json::Value,
        ) -> Result<ToolOutput, TransportError> {
            Ok(ToolOutput {
                content: vec![],
                is_error: false,
            })
        }
    }

    fn session_with(scripts: Vec<Vec<StreamEvent>>) -> (ChatSession, Arc<MockTransport>) {
        let store = ConversationStore::new(Arc::new(MemoryStore::new()));
        let transport = Arc::new(MockTransport::new(scripts));
        let mut session = ChatSession::new(transport.clone(), store);
        session.set_model("test-model");
        (session, transport)
    }

    async fn drive_to_terminal(session: &mut ChatSession) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
                .await
                .expect("session made no progress")
                .expect("update channel closed");
            match event {
                SessionEvent::AssistantInterim { .. } => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_send_without_model_fails() {
        let store = ConversationStore::new(Arc::new(MemoryStore::new()));
        let mut session = ChatSession::new(Arc::new(MockTransport::new(vec![])), store);
        let err = session.send("hi".to_string(), None).unwrap_err();
        assert!(matches!(err, SessionError::NoModelSelected));
    }

    #[tokio::test]
    async fn test_streamed_answer_finalizes_and_persists() {
        let (mut session, _transport) = session_with(vec![vec![
            StreamEvent::Fragment("The answ".to_string()),
            StreamEvent::Fragment("er is 4.".to_string()),
            StreamEvent::Final {
                text: None,
                image: None,
            },
        ]]);

        session.send("What is 2 + 2?".to_string(), None).unwrap();
        let event = drive_to_terminal(&mut session).await;
        assert_eq!(event, SessionEvent::AssistantFinalized);

        let turn = session.turns().last().unwrap();
        match &turn.assistant {
            AssistantContent::Parsed { content, .. } => {
                assert_eq!(content.raw_content, "The answer is 4.");
                assert_eq!(content.blocks.len(), 1);
                assert_eq!(content.blocks[0].kind, BlockKind::Text);
            }
            other => panic!("expected Parsed, got {:?}", other),
        }

        // The turn reached storage under the current conversation.
        let stored = session
            .store
            .load_conversation("test-model", session.conversation_id())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].assistant.resend_text(), "The answer is 4.");
        assert_eq!(
            session.store.get_current("test-model").await.unwrap().as_deref(),
            Some(session.conversation_id())
        );
    }

    #[tokio::test]
    async fn test_thinking_model_reasoning_kept_visible() {
        let (mut session, _transport) = session_with(vec![vec![
            StreamEvent::Fragment("<think>carry the one</think>".to_string()),
            StreamEvent::Fragment("The answer is 4.".to_string()),
            StreamEvent::Final {
                text: None,
                image: None,
            },
        ]]);
        session.set_model("deepseek-r1:14b");

        session.send("What is 2 + 2?".to_string(), None).unwrap();
        let event = drive_to_terminal(&mut session).await;
        assert_eq!(event, SessionEvent::AssistantFinalized);

        match &session.turns().last().unwrap().assistant {
            AssistantContent::Parsed { content, .. } => {
                assert!(content.raw_content.contains("<think>"));
                let joined: String = content
                    .blocks
                    .iter()
                    .map(|b| b.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                assert!(joined.contains("*Thinking:*"));
                assert!(joined.contains("carry the one"));
                assert!(joined.contains("The answer is 4."));
            }
            other => panic!("expected Parsed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_becomes_assistant_error() {
        let (mut session, _transport) = session_with(vec![vec![
            StreamEvent::Fragment("partial".to_string()),
            StreamEvent::Error("connection refused".to_string()),
        ]]);

        session.send("hello".to_string(), None).unwrap();
        let event = drive_to_terminal(&mut session).await;
        assert_eq!(
            event,
            SessionEvent::AssistantErrored {
                message: "connection refused".to_string()
            }
        );
        assert_eq!(
            session.turns().last().unwrap().assistant,
            AssistantContent::Error("connection refused".to_string())
        );
    }

    #[tokio::test]
    async fn test_rag_path_skips_streaming() {
        let (mut session, transport) = session_with(vec![]);
        session.settings_mut().rag_enabled = true;

        session.send("what do the docs say".to_string(), None).unwrap();
        let event = drive_to_terminal(&mut session).await;
        assert_eq!(event, SessionEvent::AssistantFinalized);

        assert!(!transport.streamed.load(Ordering::SeqCst));
        match &session.turns().last().unwrap().assistant {
            AssistantContent::Parsed { content, .. } => {
                assert_eq!(content.raw_content, "From the documents: 42.");
            }
            other => panic!("expected Parsed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rag_disabled_for_image_turns() {
        let (mut session, _transport) = session_with(vec![vec![
            StreamEvent::Fragment("a cat".to_string()),
            StreamEvent::Final {
                text: None,
                image: None,
            },
        ]]);
        session.settings_mut().rag_enabled = true;

        session
            .send("what is this".to_string(), Some("aGk=".to_string()))
            .unwrap();
        let event = drive_to_terminal(&mut session).await;
        assert_eq!(event, SessionEvent::AssistantFinalized);
        match &session.turns().last().unwrap().assistant {
            AssistantContent::Parsed { content, .. } => {
                assert_eq!(content.raw_content, "a cat");
            }
            other => panic!("expected Parsed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_leaves_turn_pending() {
        // Empty script list: the stream hangs until cancelled.
        let (mut session, _transport) = session_with(vec![]);

        session.send("slow question".to_string(), None).unwrap();
        session.cancel_streaming();

        let event = drive_to_terminal(&mut session).await;
        assert_eq!(event, SessionEvent::StreamCancelled);
        assert!(session.turns().last().unwrap().assistant.is_pending());

        // Nothing was persisted for the cancelled turn.
        let stored = session
            .store
            .load_conversation("test-model", session.conversation_id())
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_stale_updates_discarded_after_new_conversation() {
        let (mut session, _transport) = session_with(vec![
            vec![
                StreamEvent::Fragment("old stream".to_string()),
                StreamEvent::Final {
                    text: None,
                    image: None,
                },
            ],
            vec![
                StreamEvent::Fragment("fresh".to_string()),
                StreamEvent::Final {
                    text: None,
                    image: None,
                },
            ],
        ]);

        session.send("first".to_string(), None).unwrap();
        // Abandon before draining any updates from the first stream.
        session.start_new_conversation();
        session.send("second".to_string(), None).unwrap();

        let event = drive_to_terminal(&mut session).await;
        assert_eq!(event, SessionEvent::AssistantFinalized);
        assert_eq!(session.turns().len(), 1);
        match &session.turns()[0].assistant {
            AssistantContent::Parsed { content, .. } => {
                assert_eq!(content.raw_content, "fresh");
            }
            other => panic!("expected Parsed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_history_resent_as_raw_text() {
        let (mut session, _transport) = session_with(vec![
            vec![StreamEvent::Final {
                text: Some("```rust\nfn main() {}\n```".to_string()),
                image: None,
            }],
        ]);

        session.send("show me main".to_string(), None).unwrap();
        drive_to_terminal(&mut session).await;

        let request = session.build_request("test-model");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "```rust\nfn main() {}\n```");
    }

    #[tokio::test]
    async fn test_load_existing_restores_turns() {
        let store = ConversationStore::new(Arc::new(MemoryStore::new()));
        let id = store.create_conversation();
        store
            .append_turn(
                "test-model",
                &id,
                &ChatTurn {
                    user: UserContent::Text("earlier question".to_string()),
                    assistant: AssistantContent::Parsed {
                        content: classify("earlier answer"),
                        image: None,
                    },
                },
            )
            .await
            .unwrap();

        let mut session = ChatSession::new(Arc::new(MockTransport::new(vec![])), store);
        session.load_existing("test-model", id.clone()).await.unwrap();

        assert_eq!(session.model(), Some("test-model"));
        assert_eq!(session.conversation_id(), id);
        assert_eq!(session.turns().len(), 1);
        assert_eq!(
            session
                .store
                .get_current("test-model")
                .await
                .unwrap()
                .as_deref(),
            Some(id.as_str())
        );
    }
}
