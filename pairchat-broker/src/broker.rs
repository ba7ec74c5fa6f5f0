//! Broker core: shared state, STOMP WebSocket handler, subscription
//! registry, fan-out, and the history endpoint.
//!
//! A client connects to `/ws`, sends `CONNECT` with a bearer token, then
//! subscribes to `chat/{a}/{b}` and publishes to `send/chat/{a}/{b}`. Every
//! accepted publish is stored (assigning its permanent id and timestamp)
//! and delivered to every subscriber of the pair's topic, the publisher
//! included. `GET /history/{a}/{b}` serves the stored log most-recent-first.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tokio::time::{Instant, Interval};

use pairchat_proto::address::{PairKey, ParticipantId};
use pairchat_proto::stomp::{self, Command, Frame, HeartBeat};
use pairchat_proto::wire;

use crate::store::ConversationStore;

/// Default maximum accepted `SEND` body size in bytes (64 KB).
const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;

/// Default heart-beat interval the broker offers.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(4);

/// How long a finished session's writer may take to flush.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

/// One topic subscription held by a connection.
struct Subscription {
    connection: u64,
    id: String,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared broker state.
pub struct BrokerState {
    /// Maps connection id to the channel feeding its WebSocket writer.
    connections: RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    /// Subscriptions per conversation.
    subscriptions: RwLock<HashMap<PairKey, Vec<Subscription>>>,
    /// Message log backing deliveries and history.
    pub store: ConversationStore,
    /// Accepted bearer tokens; empty accepts any.
    tokens: HashSet<String>,
    heartbeat: Duration,
    max_body_size: usize,
    next_connection: AtomicU64,
    discard_publishes: AtomicBool,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    /// Broker state accepting any token, with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(
            Vec::new(),
            DEFAULT_HEARTBEAT,
            DEFAULT_MAX_BODY_SIZE,
            ConversationStore::new(),
        )
    }

    /// Broker state with an explicit token allow-list and limits.
    #[must_use]
    pub fn with_config(
        tokens: impl IntoIterator<Item = String>,
        heartbeat: Duration,
        max_body_size: usize,
        store: ConversationStore,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            store,
            tokens: tokens.into_iter().collect(),
            heartbeat,
            max_body_size,
            next_connection: AtomicU64::new(1),
            discard_publishes: AtomicBool::new(false),
        }
    }

    /// Whether `token` may connect or read history.
    #[must_use]
    pub fn authorize(&self, token: Option<&str>) -> bool {
        self.tokens.is_empty() || token.is_some_and(|t| self.tokens.contains(t))
    }

    /// Number of live subscriptions to `pair`'s topic.
    pub async fn subscriber_count(&self, pair: &PairKey) -> usize {
        self.subscriptions
            .read()
            .await
            .get(pair)
            .map_or(0, Vec::len)
    }

    /// Number of open STOMP sessions.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// When set, `SEND` frames are accepted but neither stored nor
    /// delivered. Simulates a broker that loses messages.
    pub fn set_discard_publishes(&self, discard: bool) {
        self.discard_publishes.store(discard, Ordering::Relaxed);
    }

    /// Send a WebSocket Close frame to every connection.
    ///
    /// Each writer task forwards the close and stops, which ends the
    /// session on both sides. Useful for graceful shutdown and testing.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (connection, sender) in conns.iter() {
            tracing::info!(connection, "closing connection");
            let _ = sender.send(Message::Close(None));
        }
    }

    async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(connection, sender);
        connection
    }

    async fn unregister(&self, connection: u64) {
        self.connections.write().await.remove(&connection);
        let mut subs = self.subscriptions.write().await;
        for list in subs.values_mut() {
            list.retain(|s| s.connection != connection);
        }
        subs.retain(|_, list| !list.is_empty());
    }

    async fn subscribe(&self, pair: PairKey, subscription: Subscription) {
        let mut subs = self.subscriptions.write().await;
        let list = subs.entry(pair).or_default();
        list.retain(|s| !(s.connection == subscription.connection && s.id == subscription.id));
        list.push(subscription);
    }

    async fn unsubscribe(&self, connection: u64, id: &str) {
        let mut subs = self.subscriptions.write().await;
        for list in subs.values_mut() {
            list.retain(|s| !(s.connection == connection && s.id == id));
        }
        subs.retain(|_, list| !list.is_empty());
    }

    /// Deliver a stored message to every subscriber of `pair`.
    async fn fan_out(&self, pair: &PairKey, message: &wire::WireMessage) {
        let body = match wire::encode(message) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode delivery");
                return;
            }
        };
        let topic = pair.topic();
        let message_id = message.id.map(|id| id.to_string()).unwrap_or_default();
        let subs = self.subscriptions.read().await;
        let Some(list) = subs.get(pair) else {
            return;
        };
        for sub in list {
            let frame = Frame::new(Command::Message)
                .with_header("destination", topic.as_str())
                .with_header("subscription", sub.id.as_str())
                .with_header("message-id", message_id.as_str())
                .with_header("content-type", "application/json")
                .with_body(body.as_str());
            let _ = sub.sender.send(text(&frame));
        }
        tracing::debug!(pair = %pair, message_id = %message_id, subscribers = list.len(), "delivered");
    }
}

fn text(frame: &Frame) -> Message {
    Message::Text(frame.encode().into())
}

fn error_frame(reason: &str) -> Message {
    text(&Frame::new(Command::Error).with_header("message", reason))
}

/// What the reader loop should do after a frame.
enum Flow {
    Continue,
    Close,
}

/// Handles an upgraded WebSocket connection for one STOMP session.
///
/// The connection lifecycle:
/// 1. Wait for `CONNECT` and check its bearer token.
/// 2. Answer `CONNECTED` with the negotiated heart-beat.
/// 3. Process `SUBSCRIBE`/`UNSUBSCRIBE`/`SEND`/`DISCONNECT` frames.
/// 4. On disconnect, drop the connection's subscriptions.
pub async fn handle_socket(socket: WebSocket, state: Arc<BrokerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(connect) = wait_for_connect(&mut ws_receiver).await else {
        tracing::warn!("connection closed before CONNECT");
        return;
    };

    let token = connect
        .header("Authorization")
        .or_else(|| connect.header("authorization"))
        .and_then(|value| value.strip_prefix("Bearer "));
    if !state.authorize(token) {
        tracing::warn!("rejecting CONNECT with invalid credential");
        let _ = ws_sender.send(error_frame("authentication failed")).await;
        let _ = ws_sender.close().await;
        return;
    }

    let requested = match connect.header("heart-beat").map(HeartBeat::parse).transpose() {
        Ok(hb) => hb.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "malformed heart-beat header");
            let _ = ws_sender.send(error_frame("malformed heart-beat")).await;
            return;
        }
    };
    let offered = HeartBeat::symmetric(state.heartbeat);
    let negotiated = offered.negotiate(requested);
    let connected = Frame::new(Command::Connected)
        .with_header("version", "1.2")
        .with_header("heart-beat", offered.to_header());
    if ws_sender.send(text(&connected)).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(tx.clone()).await;
    tracing::info!(connection, outgoing_hb = ?negotiated.outgoing, "session connected");

    let mut write_task = tokio::spawn(async move {
        let mut beat = negotiated.outgoing.map(|every| {
            tokio::time::interval_at(Instant::now() + every, every)
        });
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let closing = matches!(msg, Message::Close(_));
                    if ws_sender.send(msg).await.is_err() || closing {
                        break;
                    }
                }
                () = tick(beat.as_mut()) => {
                    if ws_sender.send(Message::Text(stomp::HEARTBEAT.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(body) => {
                    if let Flow::Close =
                        handle_text(connection, body.as_str(), &tx, &reader_state).await
                    {
                        break;
                    }
                }
                Message::Close(_) => {
                    tracing::info!(connection, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            // Dropping the registry's senders lets the writer flush a queued
            // ERROR or RECEIPT and stop on its own.
            state.unregister(connection).await;
            if tokio::time::timeout(FLUSH_GRACE, &mut write_task).await.is_err() {
                write_task.abort();
            }
        }
        _ = &mut write_task => {
            read_task.abort();
            state.unregister(connection).await;
        }
    }

    tracing::info!(connection, "session closed");
}

/// Waits for the first frame, expecting `CONNECT` (or `STOMP`).
async fn wait_for_connect(
    receiver: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Frame> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(body) => match Frame::decode(body.as_str()) {
                Ok(None) => {}
                Ok(Some(frame)) if matches!(frame.command, Command::Connect | Command::Stomp) => {
                    return Some(frame);
                }
                Ok(Some(frame)) => {
                    tracing::warn!(command = %frame.command, "expected CONNECT");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode CONNECT");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Handles one text frame from a connected session.
async fn handle_text(
    connection: u64,
    body: &str,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<BrokerState>,
) -> Flow {
    let frame = match Frame::decode(body) {
        Ok(Some(frame)) => frame,
        Ok(None) => return Flow::Continue,
        Err(e) => {
            tracing::warn!(connection, error = %e, "malformed frame");
            let _ = tx.send(error_frame("malformed frame"));
            return Flow::Close;
        }
    };

    let flow = match frame.command {
        Command::Subscribe => {
            let (Some(id), Some(destination)) = (frame.header("id"), frame.header("destination"))
            else {
                let _ = tx.send(error_frame("SUBSCRIBE requires id and destination"));
                return Flow::Close;
            };
            match PairKey::from_topic(destination) {
                Ok(pair) => {
                    state
                        .subscribe(
                            pair.clone(),
                            Subscription {
                                connection,
                                id: id.to_string(),
                                sender: tx.clone(),
                            },
                        )
                        .await;
                    tracing::info!(connection, pair = %pair, "subscribed");
                    Flow::Continue
                }
                Err(e) => {
                    tracing::warn!(connection, destination, error = %e, "unknown destination");
                    let _ = tx.send(error_frame("unknown destination"));
                    Flow::Close
                }
            }
        }
        Command::Unsubscribe => {
            if let Some(id) = frame.header("id") {
                state.unsubscribe(connection, id).await;
            }
            Flow::Continue
        }
        Command::Send => handle_send(connection, &frame, tx, state).await,
        Command::Disconnect => Flow::Close,
        other => {
            tracing::warn!(connection, command = %other, "unexpected frame from client");
            Flow::Continue
        }
    };

    if let Some(receipt) = frame.header("receipt") {
        let _ = tx.send(text(
            &Frame::new(Command::Receipt).with_header("receipt-id", receipt),
        ));
    }
    flow
}

async fn handle_send(
    connection: u64,
    frame: &Frame,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<BrokerState>,
) -> Flow {
    let Some(pair) = frame
        .header("destination")
        .and_then(|d| PairKey::from_publish_destination(d).ok())
    else {
        let _ = tx.send(error_frame("unknown destination"));
        return Flow::Close;
    };

    if frame.body.len() > state.max_body_size {
        tracing::warn!(
            connection,
            size = frame.body.len(),
            max = state.max_body_size,
            "body exceeds size limit"
        );
        let _ = tx.send(error_frame("body too large"));
        return Flow::Close;
    }

    let incoming = match wire::decode(&frame.body) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(connection, error = %e, "undecodable message body");
            let _ = tx.send(error_frame("malformed message body"));
            return Flow::Close;
        }
    };

    if state.discard_publishes.load(Ordering::Relaxed) {
        tracing::debug!(connection, pair = %pair, "discarding publish");
        return Flow::Continue;
    }

    let stored = state.store.append(&pair, incoming.content, incoming.sender).await;
    state.fan_out(&pair, &stored).await;
    Flow::Continue
}

/// Wait for the next tick, or forever if heart-beats are off.
async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// `GET /history/{a}/{b}`: the pair's log, most recent first.
async fn history_handler(
    State(state): State<Arc<BrokerState>>,
    Path((first, second)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if !state.authorize(token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let pair = ParticipantId::new(first)
        .and_then(|a| ParticipantId::new(second).map(|b| (a, b)))
        .and_then(|(a, b)| PairKey::new(a, b));
    match pair {
        Ok(pair) => axum::Json(state.store.history(&pair).await).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<Arc<BrokerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Starts the broker on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(BrokerState::new())).await
}

/// Starts the broker with a pre-configured [`BrokerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BrokerState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/history/{first}/{second}", axum::routing::get(history_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "broker server error");
        }
    });

    Ok((bound_addr, handle))
}
