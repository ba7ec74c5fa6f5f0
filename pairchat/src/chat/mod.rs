//! Chat application layer.
//!
//! [`ChatSession`] ties the pieces together for one local participant:
//! resolving the active conversation, backfilling its history, keeping a
//! live channel subscribed to it, reconciling deliveries into the
//! [`store::MessageStore`], and sending with optimistic local echo.
//!
//! Switching conversations is an atomic replacement: the old channel is
//! closed, the store is reset to a new epoch, then history is loaded and a
//! new channel opened. Work still in flight for the old pair is discarded by
//! the epoch check.

pub mod history;
pub mod reconcile;
pub mod send;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use pairchat_proto::address::PairKey;

use crate::connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus, Credential,
    PublishError,
};
use crate::resolver::{self, CounterpartRef, Participant, ResolutionError};

use history::{HistoryLoader, HistorySource};
use reconcile::Reconciler;
use store::{LocalId, Message, MessageStore, ServerId, SharedStore};

pub use send::PendingSend;

/// Change notifications for whoever renders the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The store was emptied and now represents `pair`.
    Reset {
        /// The new active conversation, or `None` when closed.
        pair: Option<PairKey>,
    },
    /// History was merged in front of the log.
    Backfilled {
        /// Number of entries added.
        count: usize,
    },
    /// History fetched after a reconnect added messages missed while the
    /// channel was down.
    CaughtUp {
        /// Number of entries added.
        count: usize,
    },
    /// A provisional entry was appended by the send pipeline.
    ProvisionalAdded {
        /// Its local id.
        local_id: LocalId,
    },
    /// A provisional entry was replaced by its confirmed copy.
    Confirmed {
        /// The provisional id that was replaced.
        local_id: LocalId,
        /// Its permanent id.
        server_id: ServerId,
    },
    /// A confirmed message from the channel was added.
    Appended {
        /// Its permanent id.
        server_id: ServerId,
    },
    /// A provisional entry was removed because publishing failed.
    RolledBack {
        /// The removed entry's local id.
        local_id: LocalId,
    },
}

/// Why a message was not accepted for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotReady {
    /// The content is empty or whitespace only.
    #[error("message is empty")]
    EmptyContent,

    /// No conversation is active.
    #[error("no active conversation")]
    NoConversation,

    /// The channel is not connected.
    #[error("channel is {0}")]
    NotConnected(ConnectionState),
}

/// Errors returned by [`ChatSession::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The send was refused before anything was shown.
    #[error("not ready to send: {0}")]
    NotReady(#[from] NotReady),

    /// Publishing failed; the provisional entry was rolled back.
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
}

/// Chat-level tunables.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Window within which a confirmed copy with the same sender and
    /// content is treated as a duplicate delivery.
    pub dedup_tolerance: Duration,
    /// Capacity of the [`ChatEvent`] channel.
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            dedup_tolerance: Duration::from_millis(5000),
            event_buffer: 64,
        }
    }
}

/// One participant's view of their active conversation.
pub struct ChatSession<H> {
    participant: Participant,
    credential: Credential,
    history: Arc<HistoryLoader<H>>,
    connection: ConnectionManager,
    store: SharedStore,
    reconciler: Reconciler,
    events: mpsc::Sender<ChatEvent>,
    inbound_task: Option<JoinHandle<()>>,
    catch_up_task: Option<JoinHandle<()>>,
}

impl<H: HistorySource + 'static> ChatSession<H> {
    /// Create a session with no active conversation.
    ///
    /// Returns the session and the receiver of its [`ChatEvent`]s.
    pub fn new(
        participant: Participant,
        credential: Credential,
        history: H,
        connection: ConnectionConfig,
        chat: &ChatConfig,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (events, events_rx) = mpsc::channel(chat.event_buffer.max(1));
        let session = Self {
            participant,
            credential,
            history: Arc::new(HistoryLoader::new(history)),
            connection: ConnectionManager::new(connection),
            store: MessageStore::shared(),
            reconciler: Reconciler::new(chat.dedup_tolerance),
            events,
            inbound_task: None,
            catch_up_task: None,
        };
        (session, events_rx)
    }

    /// The local participant.
    pub const fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Resolve the conversation with `counterpart` and make it active.
    ///
    /// When the counterpart cannot be resolved, any active conversation is
    /// closed and nothing is loaded or connected.
    ///
    /// # Errors
    ///
    /// Returns the [`ResolutionError`] when no pair key can be formed.
    pub async fn open_conversation(
        &mut self,
        counterpart: &CounterpartRef,
    ) -> Result<PairKey, ResolutionError> {
        match resolver::resolve(&self.participant, counterpart) {
            Ok(pair) => {
                self.activate(pair.clone()).await;
                Ok(pair)
            }
            Err(e) => {
                tracing::info!(err = %e, "conversation unresolved, waiting");
                self.close().await;
                Err(e)
            }
        }
    }

    /// Make `pair` the active conversation.
    ///
    /// Closes the previous channel, resets the store, backfills history,
    /// then opens a channel subscribed to `pair`. A history failure only
    /// means an empty backfill. History is fetched again after every
    /// automatic reconnect.
    pub async fn activate(&mut self, pair: PairKey) {
        self.teardown().await;

        let epoch = self.store.lock().reset(Some(pair.clone()));
        self.emit(ChatEvent::Reset {
            pair: Some(pair.clone()),
        });
        tracing::info!(pair = %pair, %epoch, "activating conversation");

        let history = self.history.load(&pair).await;
        let merged = self.store.lock().merge_history(epoch, history);
        match merged {
            Ok(count) => self.emit(ChatEvent::Backfilled { count }),
            Err(e) => {
                tracing::debug!(err = %e, "activation superseded during backfill");
                return;
            }
        }

        let inbound = self.connection.open(pair.clone(), self.credential.clone()).await;
        self.inbound_task = Some(tokio::spawn(reconcile::run_inbound(
            SharedStore::clone(&self.store),
            epoch,
            inbound,
            self.reconciler,
            self.events.clone(),
        )));
        self.catch_up_task = Some(tokio::spawn(reconcile::run_catch_up(
            SharedStore::clone(&self.store),
            epoch,
            pair,
            Arc::clone(&self.history),
            self.connection.status(),
            self.reconciler,
            self.events.clone(),
        )));
    }

    /// Close the active conversation and empty the store.
    pub async fn close(&mut self) {
        self.teardown().await;
        let had_pair = self.store.lock().pair().is_some();
        self.store.lock().reset(None);
        if had_pair {
            self.emit(ChatEvent::Reset { pair: None });
        }
    }

    async fn teardown(&mut self) {
        self.connection.close().await;
        for task in [self.inbound_task.take(), self.catch_up_task.take()].into_iter().flatten() {
            task.abort();
        }
    }

    /// The active conversation, if any.
    pub fn active_pair(&self) -> Option<PairKey> {
        self.store.lock().pair().cloned()
    }

    /// Snapshot of the log in display order.
    pub fn messages(&self) -> Vec<Message> {
        self.store.lock().messages().to_vec()
    }

    /// Shared handle to the log, for renderers that want to lock it
    /// themselves.
    pub fn store(&self) -> SharedStore {
        SharedStore::clone(&self.store)
    }

    /// Current channel state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribe to channel status changes.
    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.status()
    }

    fn emit(&self, event: ChatEvent) {
        if self.events.try_send(event).is_err() {
            tracing::debug!("event receiver full or gone, dropping event");
        }
    }
}

impl<H> Drop for ChatSession<H> {
    fn drop(&mut self) {
        for task in [self.inbound_task.take(), self.catch_up_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}
