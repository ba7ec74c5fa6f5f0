//! The conversation log: an ordered, deduplicated sequence of messages for
//! exactly one pair at a time.
//!
//! Messages are an explicit two-variant union. A [`ProvisionalMessage`] is a
//! local optimistic echo identified by a [`LocalId`] (a UUID, so it can never
//! collide with a numeric [`ServerId`]). A [`ConfirmedMessage`] carries the
//! server's permanent id and canonical timestamp.
//!
//! # Invariants
//!
//! - No two confirmed entries share a server id.
//! - Confirmed entries are ordered by `created_at`; backfilled history sits
//!   in front of anything that arrived live. Provisional entries are
//!   appended where they were sent, since their local clock may disagree
//!   with the server's.
//! - The store belongs to one pair per [`Epoch`]. Replacing the pair bumps
//!   the epoch; writers holding an older epoch are refused.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use pairchat_proto::address::{PairKey, Role};
use pairchat_proto::wire::WireMessage;

/// Store handle shared between the session, the send pipeline and the
/// inbound reconciliation task. The lock is never held across an `.await`.
pub type SharedStore = Arc<Mutex<MessageStore>>;

/// Identifier of a provisional message, local to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(Uuid);

impl LocalId {
    /// A fresh time-ordered local id (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Permanent server-assigned message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message shown optimistically before the server has confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalMessage {
    /// Local identifier.
    pub local_id: LocalId,
    /// Message text.
    pub content: String,
    /// Which side sent it (always the local participant).
    pub sender: Role,
    /// Local clock at the time of sending.
    pub created_at: DateTime<Utc>,
}

/// A message acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedMessage {
    /// Permanent server id.
    pub server_id: ServerId,
    /// Message text.
    pub content: String,
    /// Which side sent it.
    pub sender: Role,
    /// Canonical server timestamp.
    pub created_at: DateTime<Utc>,
}

/// A wire record that cannot become a [`ConfirmedMessage`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IncompleteMessage {
    /// The record carries no server id.
    #[error("message has no server id")]
    MissingId,
    /// The record carries no timestamp and no fallback was given.
    #[error("message {0} has no createdAt")]
    MissingTimestamp(ServerId),
}

impl ConfirmedMessage {
    /// Convert a wire record. A missing `createdAt` is replaced by
    /// `fallback` when one is given (live delivery uses the arrival time).
    ///
    /// # Errors
    ///
    /// Returns [`IncompleteMessage`] if the id is missing, or the timestamp
    /// is missing and there is no fallback.
    pub fn from_wire(
        wire: WireMessage,
        fallback: Option<DateTime<Utc>>,
    ) -> Result<Self, IncompleteMessage> {
        let server_id = ServerId(wire.id.ok_or(IncompleteMessage::MissingId)?);
        let created_at = wire
            .created_at
            .or(fallback)
            .ok_or(IncompleteMessage::MissingTimestamp(server_id))?;
        Ok(Self {
            server_id,
            content: wire.content,
            sender: wire.sender,
            created_at,
        })
    }
}

/// One entry of the conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Optimistic local echo awaiting its server copy.
    Provisional(ProvisionalMessage),
    /// Server-confirmed message.
    Confirmed(ConfirmedMessage),
}

impl Message {
    /// Message text.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Provisional(m) => &m.content,
            Self::Confirmed(m) => &m.content,
        }
    }

    /// Sender role.
    #[must_use]
    pub const fn sender(&self) -> Role {
        match self {
            Self::Provisional(m) => m.sender,
            Self::Confirmed(m) => m.sender,
        }
    }

    /// Timestamp used for ordering.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Provisional(m) => m.created_at,
            Self::Confirmed(m) => m.created_at,
        }
    }

    /// Server id, for confirmed entries.
    #[must_use]
    pub const fn server_id(&self) -> Option<ServerId> {
        match self {
            Self::Provisional(_) => None,
            Self::Confirmed(m) => Some(m.server_id),
        }
    }

    /// Local id, for provisional entries.
    #[must_use]
    pub const fn local_id(&self) -> Option<LocalId> {
        match self {
            Self::Provisional(m) => Some(m.local_id),
            Self::Confirmed(_) => None,
        }
    }

    /// Whether the server has not confirmed this entry yet.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

/// Identifies one activation of the store. Bumped on every pair switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(u64);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A write addressed to an activation that has since been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("store epoch {stale} was superseded by {current}")]
pub struct StaleEpoch {
    /// Epoch the writer was holding.
    pub stale: Epoch,
    /// Epoch currently active.
    pub current: Epoch,
}

/// Ordered, deduplicated log for the active pair.
#[derive(Debug, Default)]
pub struct MessageStore {
    pair: Option<PairKey>,
    epoch: Epoch,
    messages: Vec<Message>,
    confirmed_ids: HashSet<ServerId>,
}

impl MessageStore {
    /// An empty store bound to no conversation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a new empty store for sharing.
    #[must_use]
    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    /// The conversation this store currently represents.
    #[must_use]
    pub const fn pair(&self) -> Option<&PairKey> {
        self.pair.as_ref()
    }

    /// Current activation epoch.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Entries in display order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a confirmed entry with `id` is present.
    #[must_use]
    pub fn contains_server_id(&self, id: ServerId) -> bool {
        self.confirmed_ids.contains(&id)
    }

    /// Replace the whole store with an empty log for `pair` (or none) and
    /// start a new epoch. Everything from the previous pair is dropped.
    pub fn reset(&mut self, pair: Option<PairKey>) -> Epoch {
        self.epoch = Epoch(self.epoch.0 + 1);
        self.pair = pair;
        self.messages.clear();
        self.confirmed_ids.clear();
        self.epoch
    }

    /// Check that `epoch` is still the active one.
    ///
    /// # Errors
    ///
    /// Returns [`StaleEpoch`] if the store has been reset since.
    pub const fn ensure_current(&self, epoch: Epoch) -> Result<(), StaleEpoch> {
        if self.epoch.0 == epoch.0 {
            Ok(())
        } else {
            Err(StaleEpoch {
                stale: epoch,
                current: self.epoch,
            })
        }
    }

    /// Merge backfilled history in front of every existing entry.
    ///
    /// `history` must be in ascending order already; it is stable-sorted
    /// again in case the server returned equal-ish timestamps out of order.
    /// Ids already present are skipped. Returns the number of entries added.
    ///
    /// # Errors
    ///
    /// Returns [`StaleEpoch`] if the store moved to another activation while
    /// the history was in flight; the history is discarded.
    pub fn merge_history(
        &mut self,
        epoch: Epoch,
        mut history: Vec<ConfirmedMessage>,
    ) -> Result<usize, StaleEpoch> {
        self.ensure_current(epoch)?;
        history.sort_by_key(|m| m.created_at);

        let mut merged = Vec::with_capacity(history.len() + self.messages.len());
        for message in history {
            if self.confirmed_ids.insert(message.server_id) {
                merged.push(Message::Confirmed(message));
            }
        }
        let added = merged.len();
        merged.append(&mut self.messages);
        self.messages = merged;
        Ok(added)
    }

    /// Append a provisional entry at the end of the log.
    ///
    /// # Errors
    ///
    /// Returns [`StaleEpoch`] if `epoch` is no longer active.
    pub fn push_provisional(
        &mut self,
        epoch: Epoch,
        message: ProvisionalMessage,
    ) -> Result<(), StaleEpoch> {
        self.ensure_current(epoch)?;
        self.messages.push(Message::Provisional(message));
        Ok(())
    }

    /// Remove the provisional entry `id`, if it is still present.
    pub fn remove_provisional(&mut self, id: LocalId) -> Option<ProvisionalMessage> {
        let index = self
            .messages
            .iter()
            .position(|m| m.local_id() == Some(id))?;
        match self.messages.remove(index) {
            Message::Provisional(p) => Some(p),
            Message::Confirmed(_) => None,
        }
    }

    /// Index of the oldest provisional entry with this sender and content.
    pub(crate) fn find_provisional(&self, sender: Role, content: &str) -> Option<usize> {
        self.messages.iter().position(|m| match m {
            Message::Provisional(p) => p.sender == sender && p.content == content,
            Message::Confirmed(_) => false,
        })
    }

    /// Confirmed entries with this sender and content.
    pub(crate) fn confirmed_matching<'a>(
        &'a self,
        sender: Role,
        content: &'a str,
    ) -> impl Iterator<Item = &'a ConfirmedMessage> + 'a {
        self.messages.iter().filter_map(move |m| match m {
            Message::Confirmed(c) if c.sender == sender && c.content == content => Some(c),
            _ => None,
        })
    }

    /// Swap the provisional entry at `index` for `confirmed`. The entry keeps
    /// its position when the server timestamp still fits between the
    /// confirmed entries around it; otherwise it moves to its place in
    /// `created_at` order. Returns the replaced provisional.
    pub(crate) fn replace_provisional(
        &mut self,
        index: usize,
        confirmed: ConfirmedMessage,
    ) -> Option<ProvisionalMessage> {
        if !self.messages.get(index)?.is_provisional() {
            return None;
        }

        let at = confirmed.created_at;
        let after_prev = self.messages[..index]
            .iter()
            .rev()
            .find(|m| !m.is_provisional())
            .is_none_or(|prev| prev.created_at() <= at);
        let before_next = self.messages[index + 1..]
            .iter()
            .find(|m| !m.is_provisional())
            .is_none_or(|next| at <= next.created_at());

        let replaced = if after_prev && before_next {
            self.confirmed_ids.insert(confirmed.server_id);
            std::mem::replace(&mut self.messages[index], Message::Confirmed(confirmed))
        } else {
            let removed = self.messages.remove(index);
            self.insert_confirmed(confirmed);
            removed
        };
        match replaced {
            Message::Provisional(p) => Some(p),
            Message::Confirmed(_) => None,
        }
    }

    /// Insert a confirmed entry keeping confirmed entries in `created_at`
    /// order; entries with an equal timestamp stay ahead of it. Provisional
    /// entries carry local clock readings and do not decide the position.
    /// Returns the insertion index.
    pub(crate) fn insert_confirmed(&mut self, confirmed: ConfirmedMessage) -> usize {
        self.confirmed_ids.insert(confirmed.server_id);
        let mut index = self.messages.len();
        for (i, m) in self.messages.iter().enumerate().rev() {
            if let Message::Confirmed(c) = m {
                if c.created_at <= confirmed.created_at {
                    break;
                }
                index = i;
            }
        }
        self.messages.insert(index, Message::Confirmed(confirmed));
        index
    }
}
