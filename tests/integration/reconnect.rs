// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Recovery of the live channel after the transport drops.
//!
//! ## Disconnect simulation
//!
//! `BrokerState::close_all_connections` sends a WebSocket Close to every
//! session, which ends them on both sides the way a broker restart would.
//! Heart-beat loss is simulated with a bare WebSocket server that completes
//! the STOMP handshake and then never writes again. Messages published
//! during an outage are written straight into the broker's log, which is
//! what a peer's publish looks like to a client that is not subscribed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use pairchat::chat::history::HttpHistory;
use pairchat::chat::{ChatConfig, ChatSession};
use pairchat::connection::{
    ConnectionConfig, ConnectionFault, ConnectionManager, ConnectionState, ConnectionStatus,
    Credential,
};
use pairchat::resolver::{CounterpartRef, Participant};
use pairchat_broker::broker::{BrokerState, start_server_with_state};
use pairchat_proto::address::{PairKey, ParticipantId, Role};
use pairchat_proto::stomp::{Command, Frame};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

fn pid(id: &str) -> ParticipantId {
    ParticipantId::new(id).unwrap()
}

async fn wait_for_state(
    status: &mut watch::Receiver<ConnectionStatus>,
    state: ConnectionState,
) -> ConnectionStatus {
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap()
        .clone()
}

async fn wait_subscribers(state: &BrokerState, pair: &PairKey, expected: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while state.subscriber_count(pair).await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected} subscribers"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A WebSocket server that answers `CONNECT` with the given heart-beat
/// header, then only reads.
async fn start_silent_server(heart_beat: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // CONNECT
                let _ = ws.next().await;
                let connected = Frame::new(Command::Connected)
                    .with_header("version", "1.2")
                    .with_header("heart-beat", heart_beat);
                let _ = ws.send(Message::Text(connected.encode().into())).await;
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    addr
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn session_resubscribes_after_broker_drops_it() {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let credential = Credential::new("dev-token");
    let history = HttpHistory::new(
        &format!("http://{addr}/"),
        credential.clone(),
        pid("t1"),
        Duration::from_secs(2),
    )
    .unwrap();
    let mut connection = ConnectionConfig::new(format!("ws://{addr}/ws"));
    connection.reconnect_delay = Duration::from_millis(300);
    let (mut therapist, _events) = ChatSession::new(
        Participant::new(Role::A, pid("t1")),
        credential,
        history,
        connection,
        &ChatConfig::default(),
    );
    let mut status = therapist.connection_status();

    let pair = therapist
        .open_conversation(&CounterpartRef::Assigned("p1".to_string()))
        .await
        .unwrap();
    wait_for_state(&mut status, ConnectionState::Connected).await;
    wait_subscribers(&state, &pair, 1).await;

    therapist.submit("before").await.unwrap();
    wait_until("first echo", || {
        therapist.messages().iter().all(|m| !m.is_provisional())
    })
    .await;

    state.close_all_connections().await;
    let dropped = wait_for_state(&mut status, ConnectionState::Reconnecting).await;
    assert!(matches!(dropped.fault, Some(ConnectionFault::Transport(_))));
    assert!(therapist.submit("while down").await.is_err());

    let restored = wait_for_state(&mut status, ConnectionState::Connected).await;
    assert_eq!(restored.fault, None);
    assert_eq!(restored.pair.as_ref(), Some(&pair));
    wait_subscribers(&state, &pair, 1).await;

    therapist.submit("after").await.unwrap();
    wait_until("second echo", || {
        let messages = therapist.messages();
        messages.len() == 2 && messages.iter().all(|m| !m.is_provisional())
    })
    .await;
    let contents: Vec<_> = therapist
        .messages()
        .iter()
        .map(|m| m.content().to_string())
        .collect();
    assert_eq!(contents, vec!["before", "after"]);
    therapist.close().await;
}

#[tokio::test]
async fn messages_logged_during_outage_are_fetched_after_reconnect() {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let credential = Credential::new("dev-token");
    let history = HttpHistory::new(
        &format!("http://{addr}/"),
        credential.clone(),
        pid("t1"),
        Duration::from_secs(2),
    )
    .unwrap();
    let mut connection = ConnectionConfig::new(format!("ws://{addr}/ws"));
    connection.reconnect_delay = Duration::from_millis(300);
    let (mut therapist, _events) = ChatSession::new(
        Participant::new(Role::A, pid("t1")),
        credential,
        history,
        connection,
        &ChatConfig::default(),
    );
    let mut status = therapist.connection_status();

    let pair = therapist
        .open_conversation(&CounterpartRef::Assigned("p1".to_string()))
        .await
        .unwrap();
    wait_for_state(&mut status, ConnectionState::Connected).await;
    wait_subscribers(&state, &pair, 1).await;

    state.close_all_connections().await;
    wait_for_state(&mut status, ConnectionState::Reconnecting).await;
    // Logged by the broker but never delivered to the dropped session.
    state
        .store
        .append(&pair, "while you were away".to_string(), Role::B)
        .await;

    wait_for_state(&mut status, ConnectionState::Connected).await;
    wait_until("missed message", || {
        therapist
            .messages()
            .iter()
            .any(|m| m.content() == "while you were away" && !m.is_provisional())
    })
    .await;
    assert_eq!(therapist.messages().len(), 1);
    therapist.close().await;
}

#[tokio::test]
async fn silent_server_is_detected_by_heartbeat() {
    let addr = start_silent_server("100,100").await;
    let mut config = ConnectionConfig::new(format!("ws://{addr}/ws"));
    config.heartbeat = Duration::from_millis(100);
    config.reconnect_delay = Duration::from_secs(30);
    let mut manager = ConnectionManager::new(config);
    let mut status = manager.status();

    let pair = PairKey::new(pid("t1"), pid("p1")).unwrap();
    let _inbound = manager.open(pair, Credential::new("t")).await;

    let lost = wait_for_state(&mut status, ConnectionState::Reconnecting).await;
    assert_eq!(
        lost.fault,
        Some(ConnectionFault::Transport(
            "server heart-beats missed".to_string()
        ))
    );
    manager.close().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
