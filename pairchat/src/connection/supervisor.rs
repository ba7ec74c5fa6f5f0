//! Background task that keeps one pair's channel alive.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use pairchat_proto::address::PairKey;
use pairchat_proto::stomp::{self, Command as StompCommand, Frame};
use pairchat_proto::wire::{self, WireMessage};

use super::stomp::{StompLink, WsSink, SUBSCRIPTION_ID, establish, send_frame};
use super::{
    ConnectError, ConnectionConfig, ConnectionFault, ConnectionState, ConnectionStatus,
    Credential, PublishError,
};

/// Missed incoming heart-beat intervals tolerated before the connection is
/// considered lost.
const HEARTBEAT_GRACE: u32 = 2;

/// Requests from the manager to the running channel.
pub(super) enum Command {
    Publish {
        body: String,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
}

/// How a connected session ended.
enum SessionEnd {
    /// Close was requested.
    Shutdown,
    /// Nobody consumes deliveries any more.
    Abandoned,
    /// The connection was lost and should be re-established.
    Lost(String),
}

pub(super) struct Supervisor {
    pub config: ConnectionConfig,
    pub pair: PairKey,
    pub credential: Credential,
    pub status: Arc<watch::Sender<ConnectionStatus>>,
    pub commands: mpsc::Receiver<Command>,
    pub inbound: mpsc::Sender<WireMessage>,
    pub shutdown: oneshot::Receiver<()>,
}

impl Supervisor {
    /// Connect, serve, and reconnect until shut down or authentication is
    /// given up on.
    pub async fn run(mut self) {
        let mut auth_failures = 0u32;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = &mut self.shutdown => break,
                attempt = establish(&self.config, &self.pair, &self.credential) => attempt,
            };

            let (delay, fault) = match attempt {
                Ok(link) => {
                    auth_failures = 0;
                    self.set_status(ConnectionState::Connected, None);
                    tracing::info!(pair = %self.pair, "channel connected");
                    match self.serve(link).await {
                        SessionEnd::Shutdown | SessionEnd::Abandoned => break,
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(pair = %self.pair, reason = %reason, "connection lost");
                            (self.config.reconnect_delay, ConnectionFault::Transport(reason))
                        }
                    }
                }
                Err(ConnectError::Auth(reason)) => {
                    auth_failures += 1;
                    tracing::warn!(
                        pair = %self.pair,
                        attempt = auth_failures,
                        max = self.config.auth_max_attempts,
                        reason = %reason,
                        "authentication rejected"
                    );
                    if auth_failures >= self.config.auth_max_attempts {
                        tracing::error!(pair = %self.pair, "giving up after repeated authentication failures");
                        self.set_status(
                            ConnectionState::Disconnected,
                            Some(ConnectionFault::Auth(reason)),
                        );
                        return;
                    }
                    (
                        self.config.auth_backoff(auth_failures),
                        ConnectionFault::Auth(reason),
                    )
                }
                Err(e) => {
                    tracing::warn!(pair = %self.pair, err = %e, "connect attempt failed");
                    (self.config.reconnect_delay, ConnectionFault::Transport(e.to_string()))
                }
            };

            self.set_status(ConnectionState::Reconnecting, Some(fault));
            tracing::debug!(pair = %self.pair, delay_ms = delay.as_millis(), "scheduling reconnect");
            if !self.wait(delay).await {
                break;
            }
        }

        self.set_status(ConnectionState::Disconnected, None);
        tracing::debug!(pair = %self.pair, "supervisor stopped");
    }

    fn set_status(&self, state: ConnectionState, fault: Option<ConnectionFault>) {
        self.status.send_modify(|s| {
            s.state = state;
            s.fault = fault;
        });
    }

    /// Sleep for `delay`, refusing publishes meanwhile. Returns `false` if
    /// shutdown was requested.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return false,
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Publish { reply, .. }) => {
                        let _ = reply.send(Err(PublishError::NotConnected));
                    }
                    None => return false,
                },
            }
        }
    }

    /// Drive a connected session until it ends.
    async fn serve(&mut self, link: StompLink) -> SessionEnd {
        let StompLink {
            mut sink,
            mut reader,
            heartbeat,
        } = link;
        let destination = self.pair.publish_destination();

        let mut outgoing = heartbeat.outgoing.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let silence_limit = heartbeat.incoming.map(|every| every * HEARTBEAT_GRACE);
        let mut watchdog = heartbeat.incoming.map(|every| {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => {
                    disconnect(&mut sink).await;
                    return SessionEnd::Shutdown;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Publish { body, reply }) => {
                        let frame = Frame::new(StompCommand::Send)
                            .with_header("destination", destination.as_str())
                            .with_header("content-type", "application/json")
                            .with_body(body);
                        let result = send_frame(&mut sink, &frame)
                            .await
                            .map_err(|e| PublishError::Transport(e.to_string()));
                        let failed = result.is_err();
                        let _ = reply.send(result);
                        if failed {
                            return SessionEnd::Lost("publish write failed".to_string());
                        }
                    }
                    None => {
                        disconnect(&mut sink).await;
                        return SessionEnd::Shutdown;
                    }
                },
                message = reader.next() => {
                    last_heard = Instant::now();
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(end) = self.handle_text(text.as_str()).await {
                                return end;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Lost("closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    }
                }
                () = tick(outgoing.as_mut()) => {
                    if let Err(e) = sink.send(Message::Text(stomp::HEARTBEAT.to_string().into())).await {
                        return SessionEnd::Lost(format!("heart-beat write failed: {e}"));
                    }
                }
                () = tick(watchdog.as_mut()) => {
                    if let Some(limit) = silence_limit
                        && last_heard.elapsed() > limit
                    {
                        return SessionEnd::Lost("server heart-beats missed".to_string());
                    }
                }
            }
        }
    }

    /// Handle one text message from the server. Returns `Some` when the
    /// session must end.
    async fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        let frame = match Frame::decode(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(err = %e, "ignoring malformed frame");
                return None;
            }
        };
        match frame.command {
            StompCommand::Message => {
                if frame.header("subscription").is_some_and(|id| id != SUBSCRIPTION_ID) {
                    tracing::debug!("ignoring delivery for another subscription");
                    return None;
                }
                match wire::decode(&frame.body) {
                    Ok(message) => {
                        if self.inbound.send(message).await.is_err() {
                            return Some(SessionEnd::Abandoned);
                        }
                    }
                    Err(e) => tracing::warn!(err = %e, "dropping undecodable delivery"),
                }
                None
            }
            StompCommand::Error => {
                let reason = frame.header("message").unwrap_or("server error").to_string();
                Some(SessionEnd::Lost(reason))
            }
            other => {
                tracing::debug!(command = %other, "ignoring frame");
                None
            }
        }
    }
}

/// Best-effort graceful close: unsubscribe, disconnect, close the socket.
async fn disconnect(sink: &mut WsSink) {
    let unsubscribe = Frame::new(StompCommand::Unsubscribe).with_header("id", SUBSCRIPTION_ID);
    let _ = send_frame(sink, &unsubscribe).await;
    let _ = send_frame(sink, &Frame::new(StompCommand::Disconnect)).await;
    let _ = sink.close().await;
}

/// Wait for the next tick, or forever if the interval is disabled.
async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
