//! In-memory per-conversation message log.
//!
//! Every published message is appended to its pair's log with a fresh,
//! broker-wide increasing id and the broker's clock as its canonical
//! timestamp. The history endpoint serves a log most-recent-first.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use pairchat_proto::address::{PairKey, Role};
use pairchat_proto::wire::WireMessage;

/// Default maximum number of messages kept per conversation.
const DEFAULT_MAX_LOG_SIZE: usize = 10_000;

struct Logs {
    next_id: u64,
    by_pair: HashMap<PairKey, Vec<WireMessage>>,
}

/// Per-pair append-only logs with oldest-first eviction past a cap.
pub struct ConversationStore {
    logs: RwLock<Logs>,
    max_log_size: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// An empty store with the default per-pair cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_log_size(DEFAULT_MAX_LOG_SIZE)
    }

    /// An empty store keeping at most `max_log_size` messages per pair.
    #[must_use]
    pub fn with_max_log_size(max_log_size: usize) -> Self {
        Self {
            logs: RwLock::new(Logs {
                next_id: 1,
                by_pair: HashMap::new(),
            }),
            max_log_size: max_log_size.max(1),
        }
    }

    /// Append a message stamped with the current time and return the
    /// stored copy.
    pub async fn append(&self, pair: &PairKey, content: String, sender: Role) -> WireMessage {
        self.append_at(pair, content, sender, Utc::now()).await
    }

    /// Append a message with an explicit timestamp. Used to seed history.
    pub async fn append_at(
        &self,
        pair: &PairKey,
        content: String,
        sender: Role,
        created_at: DateTime<Utc>,
    ) -> WireMessage {
        let mut logs = self.logs.write().await;
        let id = logs.next_id;
        logs.next_id += 1;
        let stored = WireMessage {
            id: Some(id),
            content,
            sender,
            created_at: Some(created_at),
        };
        let log = logs.by_pair.entry(pair.clone()).or_default();
        log.push(stored.clone());
        if log.len() > self.max_log_size {
            log.remove(0);
        }
        drop(logs);
        stored
    }

    /// The pair's log, most recent first.
    pub async fn history(&self, pair: &PairKey) -> Vec<WireMessage> {
        let logs = self.logs.read().await;
        logs.by_pair
            .get(pair)
            .map(|log| log.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages stored for `pair`.
    pub async fn len(&self, pair: &PairKey) -> usize {
        self.logs.read().await.by_pair.get(pair).map_or(0, Vec::len)
    }
}
