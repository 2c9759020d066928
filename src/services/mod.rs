pub mod classifier;
pub mod cleaner;
pub mod kv;
pub mod reconciler;
pub mod session;
pub mod store;

pub use classifier::classify;
pub use cleaner::{clean_and_classify, clean_response};
pub use kv::{KeyValueStore, MemoryStore, SqliteStore, StoreError};
pub use reconciler::{run_reconciler, ReconcilerConfig, ReconcilerUpdate};
pub use session::{ChatSession, SessionError, SessionEvent};
pub use store::{ConversationStore, WriteOutcome};
