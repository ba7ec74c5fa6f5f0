//! Live channel management for the active conversation.
//!
//! The [`ConnectionManager`] owns at most one live channel, always bound to
//! exactly one [`PairKey`]. Opening a channel first closes the previous one.
//! Each channel is driven by a background supervisor task that connects,
//! subscribes to the pair's topic, forwards deliveries, sends heart-beats,
//! and reconnects after transport loss:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                                  | transport loss / missed heart-beats
//!                                  v
//!                             Reconnecting -> Connected
//! ```
//!
//! [`ConnectionManager::close`] moves any state to `Disconnected` and stops
//! reconnection. Authentication failures are reported as
//! [`ConnectionFault::Auth`] and retried on a doubling delay up to a bounded
//! number of attempts, unlike transient failures which retry forever at a
//! fixed delay.

mod stomp;
mod supervisor;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use pairchat_proto::address::PairKey;
use pairchat_proto::wire::{self, WireError, WireMessage};

use supervisor::{Command, Supervisor};

/// How long [`ConnectionManager::close`] waits for a graceful `DISCONNECT`
/// before aborting the supervisor.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Bearer credential presented at connect time and on history requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Lifecycle state of the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel, and none being established.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and subscribed.
    Connected,
    /// Lost the connection; retrying.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// The most recent failure seen by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFault {
    /// Transient network or protocol failure.
    Transport(String),
    /// The server rejected the credential.
    Auth(String),
}

/// Observable channel status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// The conversation the channel is bound to, if any.
    pub pair: Option<PairKey>,
    /// Last failure since the channel was last connected.
    pub fault: Option<ConnectionFault>,
}

impl ConnectionStatus {
    const fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            pair: None,
            fault: None,
        }
    }
}

/// Errors from a single connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The server rejected the credential (HTTP 401/403 on upgrade, or an
    /// `ERROR` frame in answer to `CONNECT`).
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The configured connect timeout expired.
    #[error("connect timed out")]
    Timeout,

    /// The endpoint could not be reached or the socket failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server violated the STOMP handshake.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Errors returned by [`ConnectionManager::publish`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// There is no connected channel to publish on.
    #[error("not connected")]
    NotConnected,

    /// The message could not be serialized.
    #[error("encode failed: {0}")]
    Encode(#[from] WireError),

    /// The socket rejected the write.
    #[error("transport rejected publish: {0}")]
    Transport(String),
}

/// Tunables for the live channel.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the broker (`ws://host:port/ws`).
    pub endpoint: String,
    /// Fixed delay between reconnection attempts after transport loss.
    pub reconnect_delay: Duration,
    /// Heart-beat interval offered to the server in both directions.
    pub heartbeat: Duration,
    /// Optional bound on one connect + handshake attempt.
    pub connect_timeout: Option<Duration>,
    /// Consecutive authentication failures tolerated before giving up.
    pub auth_max_attempts: u32,
    /// Capacity of the inbound delivery and command channels.
    pub channel_capacity: usize,
}

impl ConnectionConfig {
    /// Configuration with default tunables for `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect_delay: Duration::from_secs(3),
            heartbeat: Duration::from_secs(4),
            connect_timeout: None,
            auth_max_attempts: 3,
            channel_capacity: 256,
        }
    }

    /// Delay before the next attempt after `failures` consecutive
    /// authentication rejections: the reconnect delay, doubled per failure.
    #[must_use]
    pub fn auth_backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.reconnect_delay.saturating_mul(1 << shift)
    }
}

/// A running channel for one pair.
struct LiveChannel {
    pair: PairKey,
    commands: mpsc::Sender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owner of the (at most one) live channel.
pub struct ConnectionManager {
    config: ConnectionConfig,
    status: Arc<watch::Sender<ConnectionStatus>>,
    live: Option<LiveChannel>,
}

impl ConnectionManager {
    /// Create a manager with no channel.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::disconnected());
        Self {
            config,
            status: Arc::new(status),
            live: None,
        }
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// The pair the channel is bound to, if one is open.
    #[must_use]
    pub fn pair(&self) -> Option<&PairKey> {
        self.live.as_ref().map(|l| &l.pair)
    }

    /// The tunables in use.
    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open a channel for `pair`, closing any existing one first.
    ///
    /// Returns the receiver of live deliveries for this channel. It yields
    /// messages across reconnects and closes when the channel is closed.
    pub async fn open(
        &mut self,
        pair: PairKey,
        credential: Credential,
    ) -> mpsc::Receiver<WireMessage> {
        self.close().await;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(self.config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.status.send_modify(|s| {
            s.state = ConnectionState::Connecting;
            s.pair = Some(pair.clone());
            s.fault = None;
        });
        tracing::info!(pair = %pair, endpoint = %self.config.endpoint, "opening channel");

        let supervisor = Supervisor {
            config: self.config.clone(),
            pair: pair.clone(),
            credential,
            status: Arc::clone(&self.status),
            commands: command_rx,
            inbound: inbound_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        self.live = Some(LiveChannel {
            pair,
            commands: command_tx,
            shutdown: Some(shutdown_tx),
            task,
        });
        inbound_rx
    }

    /// Close the channel, if any. Idempotent.
    ///
    /// After this returns the state is `Disconnected` and no reconnection
    /// will happen.
    pub async fn close(&mut self) {
        if let Some(mut live) = self.live.take() {
            if let Some(shutdown) = live.shutdown.take() {
                let _ = shutdown.send(());
            }
            if tokio::time::timeout(CLOSE_GRACE, &mut live.task).await.is_err() {
                tracing::warn!(pair = %live.pair, "channel did not stop in time, aborting");
                live.task.abort();
                let _ = (&mut live.task).await;
            }
            tracing::info!(pair = %live.pair, "channel closed");
        }
        self.status.send_replace(ConnectionStatus::disconnected());
    }

    /// Publish `message` to the open pair's destination.
    ///
    /// Resolves once the frame has been written to the socket. This does
    /// not mean the server accepted it; that is signalled by the echo.
    ///
    /// # Errors
    ///
    /// - [`PublishError::NotConnected`] when no channel is connected.
    /// - [`PublishError::Encode`] if the message cannot be serialized.
    /// - [`PublishError::Transport`] if the socket write fails.
    pub async fn publish(&self, message: &WireMessage) -> Result<(), PublishError> {
        let live = self.live.as_ref().ok_or(PublishError::NotConnected)?;
        if self.state() != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        let body = wire::encode(message)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        live.commands
            .send(Command::Publish {
                body,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PublishError::NotConnected)?;
        reply_rx.await.map_err(|_| PublishError::NotConnected)?
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .field("pair", &self.pair())
            .finish()
    }
}
