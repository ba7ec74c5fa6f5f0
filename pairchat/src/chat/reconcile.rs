//! Reconciliation of live deliveries against the conversation log.
//!
//! Every message arriving on the channel goes through [`Reconciler::apply`],
//! which decides, in this order:
//!
//! 1. **Duplicate (same id)**: a confirmed entry with the same server id is
//!    already present. Id matching always wins over the heuristic below.
//! 2. **Replace**: a provisional entry with the same sender and content
//!    exists; the oldest one is replaced by the confirmed copy. It keeps its
//!    slot unless the server timestamp no longer fits there.
//! 3. **Duplicate (nearby copy)**: a confirmed entry with the same sender
//!    and content lies within the tolerance window of the incoming
//!    timestamp. This is a heuristic: a genuinely repeated message inside the
//!    window that has no provisional counterpart will be dropped.
//! 4. **Append**: otherwise insert as confirmed, in timestamp order.
//!
//! [`run_inbound`] drives the decisions for one activation. It is the only
//! consumer of the channel, so deliveries are applied one at a time in
//! arrival order. [`run_catch_up`] re-fetches history after each automatic
//! reconnect and feeds it through the same decisions, so messages published
//! while the channel was down are not lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::{mpsc, watch};

use pairchat_proto::address::PairKey;
use pairchat_proto::wire::WireMessage;

use super::ChatEvent;
use super::history::{HistoryLoader, HistorySource};
use super::store::{ConfirmedMessage, Epoch, LocalId, MessageStore, ServerId, SharedStore};
use crate::connection::{ConnectionState, ConnectionStatus};

/// Why an incoming message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// A confirmed entry with the same server id exists.
    SameId,
    /// A confirmed entry with the same sender and content exists within
    /// the tolerance window.
    NearbyCopy {
        /// The entry it was taken to duplicate.
        of: ServerId,
    },
}

/// What [`Reconciler::apply`] did with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A provisional entry was superseded in place.
    Replaced {
        /// The provisional entry that was replaced.
        local_id: LocalId,
        /// The confirmed id that replaced it.
        server_id: ServerId,
    },
    /// Inserted as a new confirmed entry at `index`.
    Appended {
        /// The new entry's id.
        server_id: ServerId,
        /// Position it was inserted at.
        index: usize,
    },
    /// Dropped as a duplicate delivery.
    Duplicate {
        /// The incoming message's id.
        server_id: ServerId,
        /// Why it was considered a duplicate.
        reason: DuplicateReason,
    },
}

/// Applies the replace / ignore / append rules.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    tolerance: TimeDelta,
}

impl Reconciler {
    /// Create a reconciler with the given content+time dedup window.
    #[must_use]
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance: TimeDelta::from_std(tolerance).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Apply one incoming confirmed message to `store`.
    pub fn apply(&self, store: &mut MessageStore, incoming: ConfirmedMessage) -> Outcome {
        let server_id = incoming.server_id;

        if store.contains_server_id(server_id) {
            return Outcome::Duplicate {
                server_id,
                reason: DuplicateReason::SameId,
            };
        }

        if let Some(index) = store.find_provisional(incoming.sender, &incoming.content)
            && let Some(replaced) = store.replace_provisional(index, incoming.clone())
        {
            return Outcome::Replaced {
                local_id: replaced.local_id,
                server_id,
            };
        }

        let nearby = store
            .confirmed_matching(incoming.sender, &incoming.content)
            .find(|existing| (existing.created_at - incoming.created_at).abs() <= self.tolerance)
            .map(|existing| existing.server_id);
        if let Some(of) = nearby {
            return Outcome::Duplicate {
                server_id,
                reason: DuplicateReason::NearbyCopy { of },
            };
        }

        let index = store.insert_confirmed(incoming);
        Outcome::Appended { server_id, index }
    }
}

/// Consume live deliveries for one activation until the channel closes or
/// the store moves to another epoch.
pub async fn run_inbound(
    store: SharedStore,
    epoch: Epoch,
    mut inbound: mpsc::Receiver<WireMessage>,
    reconciler: Reconciler,
    events: mpsc::Sender<ChatEvent>,
) {
    while let Some(wire) = inbound.recv().await {
        let incoming = match ConfirmedMessage::from_wire(wire, Some(Utc::now())) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(err = %e, "dropping live message that cannot be confirmed");
                continue;
            }
        };

        let outcome = {
            let mut guard = store.lock();
            if guard.ensure_current(epoch).is_err() {
                tracing::debug!(%epoch, "store moved on, stopping inbound consumer");
                break;
            }
            reconciler.apply(&mut guard, incoming)
        };

        let event = match outcome {
            Outcome::Replaced {
                local_id,
                server_id,
            } => {
                tracing::debug!(%local_id, %server_id, "provisional message confirmed");
                Some(ChatEvent::Confirmed {
                    local_id,
                    server_id,
                })
            }
            Outcome::Appended { server_id, index } => {
                tracing::debug!(%server_id, index, "message appended");
                Some(ChatEvent::Appended { server_id })
            }
            Outcome::Duplicate { server_id, reason } => {
                tracing::debug!(%server_id, ?reason, "duplicate delivery ignored");
                None
            }
        };
        if let Some(event) = event {
            let _ = events.try_send(event);
        }
    }
    tracing::debug!(%epoch, "inbound consumer finished");
}

/// Re-fetch the history of `pair` every time the channel comes back after
/// an interruption, and reconcile it into the store.
///
/// The first `Connected` seen is the initial connect, whose history was
/// already merged by activation. Stops when the channel is closed, the
/// status sender is gone, or the store moves to another epoch.
pub async fn run_catch_up<H: HistorySource>(
    store: SharedStore,
    epoch: Epoch,
    pair: PairKey,
    history: Arc<HistoryLoader<H>>,
    mut status: watch::Receiver<ConnectionStatus>,
    reconciler: Reconciler,
    events: mpsc::Sender<ChatEvent>,
) {
    let mut connected_before = status.borrow_and_update().state == ConnectionState::Connected;

    while status.changed().await.is_ok() {
        let state = status.borrow_and_update().state;
        match state {
            ConnectionState::Connected if connected_before => {}
            ConnectionState::Connected => {
                connected_before = true;
                continue;
            }
            ConnectionState::Disconnected => break,
            ConnectionState::Connecting | ConnectionState::Reconnecting => continue,
        }

        let records = history.load(&pair).await;
        let fetched = records.len();
        let mut added = 0;
        let mut confirmed = Vec::new();
        {
            let mut guard = store.lock();
            if guard.ensure_current(epoch).is_err() {
                tracing::debug!(%epoch, "store moved on, stopping catch-up");
                break;
            }
            for record in records {
                match reconciler.apply(&mut guard, record) {
                    Outcome::Replaced {
                        local_id,
                        server_id,
                    } => confirmed.push(ChatEvent::Confirmed {
                        local_id,
                        server_id,
                    }),
                    Outcome::Appended { .. } => added += 1,
                    Outcome::Duplicate { .. } => {}
                }
            }
        }

        tracing::info!(pair = %pair, fetched, added, confirmed = confirmed.len(), "caught up after reconnect");
        for event in confirmed {
            let _ = events.try_send(event);
        }
        if added > 0 {
            let _ = events.try_send(ChatEvent::CaughtUp { count: added });
        }
    }
    tracing::debug!(%epoch, "catch-up task finished");
}
