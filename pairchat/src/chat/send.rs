//! Optimistic send pipeline.
//!
//! A submitted message is shown immediately as a provisional entry, then
//! published. A publish that fails removes the entry again. A publish that
//! succeeds leaves the entry until the server's echo replaces it. An echo
//! missed while the channel was down is picked up by the history catch-up
//! after reconnecting. An echo that never arrives at all leaves the entry
//! provisional; there is no timeout cleanup.

use chrono::Utc;

use pairchat_proto::address::PairKey;
use pairchat_proto::wire::WireMessage;

use super::history::HistorySource;
use super::store::{Epoch, LocalId, ProvisionalMessage, SharedStore};
use super::{ChatEvent, ChatSession, NotReady, SendError};
use crate::connection::ConnectionState;

/// A provisional entry between being shown and being published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// The entry's local id.
    pub local_id: LocalId,
    /// Conversation it was sent in.
    pub pair: PairKey,
    /// Store activation it belongs to.
    pub epoch: Epoch,
}

impl PendingSend {
    /// Remove the entry, unless the store has since moved to another
    /// conversation. Returns whether anything was removed.
    pub fn rollback(&self, store: &SharedStore) -> bool {
        let mut guard = store.lock();
        if guard.ensure_current(self.epoch).is_err() {
            return false;
        }
        guard.remove_provisional(self.local_id).is_some()
    }
}

impl<H: HistorySource + 'static> ChatSession<H> {
    /// Send `content` to the active conversation.
    ///
    /// The provisional entry is in the store before this starts publishing,
    /// so a renderer sees it without waiting for the network.
    ///
    /// # Errors
    ///
    /// - [`SendError::NotReady`] when the content is blank, no conversation
    ///   is active, or the channel is not connected. Nothing is shown.
    /// - [`SendError::Publish`] when publishing fails. The provisional
    ///   entry has been removed again.
    pub async fn submit(&self, content: &str) -> Result<LocalId, SendError> {
        if content.trim().is_empty() {
            return Err(NotReady::EmptyContent.into());
        }
        let state = self.connection.state();
        if state != ConnectionState::Connected {
            return Err(NotReady::NotConnected(state).into());
        }

        let sender = self.participant.role;
        let pending = self.show_provisional(content, sender)?;
        self.emit(ChatEvent::ProvisionalAdded {
            local_id: pending.local_id,
        });

        let wire = WireMessage::outgoing(content, sender);
        match self.connection.publish(&wire).await {
            Ok(()) => {
                tracing::debug!(local_id = %pending.local_id, pair = %pending.pair, "message published");
                Ok(pending.local_id)
            }
            Err(e) => {
                tracing::warn!(local_id = %pending.local_id, err = %e, "publish failed, rolling back");
                if pending.rollback(&self.store) {
                    self.emit(ChatEvent::RolledBack {
                        local_id: pending.local_id,
                    });
                }
                Err(e.into())
            }
        }
    }

    fn show_provisional(
        &self,
        content: &str,
        sender: pairchat_proto::address::Role,
    ) -> Result<PendingSend, NotReady> {
        let mut store = self.store.lock();
        let pair = store.pair().cloned().ok_or(NotReady::NoConversation)?;
        let epoch = store.epoch();
        let local_id = LocalId::new();
        store
            .push_provisional(
                epoch,
                ProvisionalMessage {
                    local_id,
                    content: content.to_string(),
                    sender,
                    created_at: Utc::now(),
                },
            )
            .map_err(|_| NotReady::NoConversation)?;
        Ok(PendingSend {
            local_id,
            pair,
            epoch,
        })
    }
}
