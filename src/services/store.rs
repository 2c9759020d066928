use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::models::conversation::{truncate_preview, truncate_title};
use crate::models::{AssistantContent, ChatTurn, ConversationMeta, StoredChatTurn};
use crate::services::kv::{KeyValueStore, StoreError};

/// Fixed namespace for everything this crate persists.
const STORAGE_PREFIX: &str = "chat-";
/// Suffix of the per-model "current conversation" pointer key.
const CURRENT_SUFFIX: &str = "-current";
/// Length of a canonical uuid string, used to split conversation keys.
const UUID_LEN: usize = 36;

/// Result of an append: whether the turn reached durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted,
    /// The first write hit capacity; old conversations were evicted and
    /// the retry succeeded.
    PersistedAfterEviction,
    /// Both the write and the post-eviction retry failed. The in-memory
    /// turn list stays authoritative for the session.
    Lost(String),
}

/// Durable mapping from (model identity, conversation id) to an ordered
/// list of stored turns, plus a current-conversation pointer per model.
///
/// Every write is a full-array replace under a single key. Concurrent
/// writers race with last-writer-wins semantics; all access in this design
/// comes from one event loop, so that is accepted.
#[derive(Clone)]
pub struct ConversationStore {
    kv: Arc<dyn KeyValueStore>,
}

impl ConversationStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Allocate a fresh conversation id. Nothing is written until the
    /// first turn is appended; empty conversations are never persisted.
    pub fn create_conversation(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Append one turn, rewriting the whole stored array. Generated-image
    /// payloads are dropped and the timestamp is forced monotonic within
    /// the conversation. On storage pressure, evicts and retries once.
    pub async fn append_turn(
        &self,
        model_identity: &str,
        conversation_id: &str,
        turn: &ChatTurn,
    ) -> Result<WriteOutcome, StoreError> {
        let key = conversation_key(model_identity, conversation_id);
        let mut turns = self.read_turns(&key).await;

        let mut timestamp = Utc::now();
        if let Some(last) = turns.last() {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + Duration::milliseconds(1);
            }
        }
        turns.push(StoredChatTurn {
            turn: turn.without_image(),
            timestamp,
        });

        let encoded = serde_json::to_string(&turns)
            .map_err(|e| StoreError::Backend(format!("failed to encode turns: {}", e)))?;

        match self.kv.set(&key, &encoded).await {
            Ok(()) => Ok(WriteOutcome::Persisted),
            Err(StoreError::Full) => {
                tracing::warn!("Storage full while appending turn, evicting old conversations");
                self.evict_on_pressure().await?;
                match self.kv.set(&key, &encoded).await {
                    Ok(()) => Ok(WriteOutcome::PersistedAfterEviction),
                    Err(e) => {
                        tracing::error!("Append failed even after eviction: {}", e);
                        Ok(WriteOutcome::Lost(format!(
                            "Conversation could not be saved: {}",
                            e
                        )))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Ordered turns for display/resubmission; timestamps are stripped.
    pub async fn load_conversation(
        &self,
        model_identity: &str,
        conversation_id: &str,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let key = conversation_key(model_identity, conversation_id);
        Ok(self
            .read_turns(&key)
            .await
            .into_iter()
            .map(|stored| stored.turn)
            .collect())
    }

    /// Every stored conversation across all model identities, newest
    /// first. Deduplicates by (model identity, conversation id) in case
    /// the backend enumeration yields a logical conversation twice.
    pub async fn list_all_conversations(&self) -> Result<Vec<ConversationMeta>, StoreError> {
        let keys = self.kv.keys_with_prefix(STORAGE_PREFIX).await?;
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut metas = Vec::new();

        for key in keys {
            let Some((model_identity, conversation_id)) = split_conversation_key(&key) else {
                continue;
            };
            if !seen.insert((model_identity.clone(), conversation_id.clone())) {
                continue;
            }

            let turns = self.read_turns(&key).await;
            let Some(last) = turns.last() else {
                continue;
            };

            let first_user = turns
                .first()
                .map(|t| t.turn.user.text())
                .unwrap_or_default();
            let last_text = match &last.turn.assistant {
                AssistantContent::Pending | AssistantContent::Streaming(_) => last.turn.user.text(),
                other => other.resend_text(),
            };

            metas.push(ConversationMeta {
                title: truncate_title(first_user),
                last_message_preview: truncate_preview(last_text),
                timestamp: last.timestamp,
                message_count: turns.len(),
                model_identity,
                conversation_id,
            });
        }

        metas.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(metas)
    }

    /// Remove a conversation; clears the current pointer if it named it.
    pub async fn delete_conversation(
        &self,
        model_identity: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        self.kv
            .remove(&conversation_key(model_identity, conversation_id))
            .await?;
        if self.get_current(model_identity).await?.as_deref() == Some(conversation_id) {
            self.kv.remove(&current_key(model_identity)).await?;
        }
        Ok(())
    }

    pub async fn set_current(
        &self,
        model_identity: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        self.kv
            .set(&current_key(model_identity), conversation_id)
            .await
    }

    pub async fn get_current(&self, model_identity: &str) -> Result<Option<String>, StoreError> {
        self.kv.get(&current_key(model_identity)).await
    }

    /// Drop the oldest ~third of stored conversations, oldest by latest
    /// turn timestamp, so the most recent conversations always survive
    /// storage pressure.
    pub async fn evict_on_pressure(&self) -> Result<(), StoreError> {
        let mut metas = self.list_all_conversations().await?;
        if metas.is_empty() {
            return Ok(());
        }

        // list_all_conversations is newest-first; evict from the tail.
        let evict_count = metas.len().div_ceil(3);
        for meta in metas.split_off(metas.len() - evict_count) {
            tracing::warn!(
                "Evicting conversation {} ({})",
                meta.conversation_id,
                meta.title
            );
            self.delete_conversation(&meta.model_identity, &meta.conversation_id)
                .await?;
        }
        Ok(())
    }

    async fn read_turns(&self, key: &str) -> Vec<StoredChatTurn> {
        match self.kv.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Corrupt conversation record under {}: {}", key, e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read conversation record {}: {}", key, e);
                Vec::new()
            }
        }
    }
}

fn conversation_key(model_identity: &str, conversation_id: &str) -> String {
    format!("{}{}-{}", STORAGE_PREFIX, model_identity, conversation_id)
}

fn current_key(model_identity: &str) -> String {
    format!("{}{}{}", STORAGE_PREFIX, model_identity, CURRENT_SUFFIX)
}

/// Split a conversation key back into (model identity, conversation id).
/// The id is always a canonical uuid at the end of the key, so the split
/// point is fixed even when the model identity itself contains dashes.
fn split_conversation_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(STORAGE_PREFIX)?;
    if rest.ends_with(CURRENT_SUFFIX) {
        return None;
    }
    if rest.len() < UUID_LEN + 2 {
        return None;
    }
    let (head, id) = rest.split_at(rest.len() - UUID_LEN);
    let model = head.strip_suffix('-')?;
    if Uuid::parse_str(id).is_err() || model.is_empty() {
        return None;
    }
    Some((model.to_string(), id.to_string()))
}
