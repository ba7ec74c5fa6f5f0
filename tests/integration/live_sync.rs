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

//! End-to-end conversation sync against an in-process broker.
//!
//! Each test starts a broker on an ephemeral port, opens one or two
//! `ChatSession`s against it, and checks what ends up in their logs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use pairchat::chat::history::HttpHistory;
use pairchat::chat::store::ServerId;
use pairchat::chat::{ChatConfig, ChatEvent, ChatSession, NotReady, SendError};
use pairchat::connection::{ConnectionConfig, ConnectionState, Credential};
use pairchat::resolver::{CounterpartRef, Participant};
use pairchat_broker::broker::{BrokerState, start_server_with_state};
use pairchat_proto::address::{PairKey, ParticipantId, Role};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

async fn start_broker() -> (Arc<BrokerState>, SocketAddr) {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("broker should start");
    (state, addr)
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::new(id).unwrap()
}

fn pair_of(a: &str, b: &str) -> PairKey {
    PairKey::new(pid(a), pid(b)).unwrap()
}

fn session_with_history_url(
    ws_addr: SocketAddr,
    history_url: &str,
    role: Role,
    id: &str,
) -> (ChatSession<HttpHistory>, mpsc::Receiver<ChatEvent>) {
    let credential = Credential::new("dev-token");
    let history = HttpHistory::new(
        history_url,
        credential.clone(),
        pid(id),
        Duration::from_secs(2),
    )
    .unwrap();
    let mut connection = ConnectionConfig::new(format!("ws://{ws_addr}/ws"));
    connection.reconnect_delay = Duration::from_millis(100);
    ChatSession::new(
        Participant::new(role, pid(id)),
        credential,
        history,
        connection,
        &ChatConfig::default(),
    )
}

fn session(
    addr: SocketAddr,
    role: Role,
    id: &str,
) -> (ChatSession<HttpHistory>, mpsc::Receiver<ChatEvent>) {
    session_with_history_url(addr, &format!("http://{addr}/"), role, id)
}

/// Poll `check` until it holds or the wait budget runs out.
async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
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

async fn open(session: &mut ChatSession<HttpHistory>, counterpart: &str) -> PairKey {
    let pair = session
        .open_conversation(&CounterpartRef::Assigned(counterpart.to_string()))
        .await
        .unwrap();
    wait_until("connection", || {
        session.connection_state() == ConnectionState::Connected
    })
    .await;
    pair
}

fn contents(session: &ChatSession<HttpHistory>) -> Vec<String> {
    session
        .messages()
        .iter()
        .map(|m| m.content().to_string())
        .collect()
}

fn all_confirmed(session: &ChatSession<HttpHistory>, count: usize) -> bool {
    let messages = session.messages();
    messages.len() == count && messages.iter().all(|m| !m.is_provisional())
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn sent_message_is_replaced_by_its_echo() {
    let (_state, addr) = start_broker().await;
    let (mut therapist, mut events) = session(addr, Role::A, "t1");
    open(&mut therapist, "p1").await;

    therapist.submit("Hola").await.unwrap();
    wait_until("echo", || all_confirmed(&therapist, 1)).await;

    let messages = therapist.messages();
    assert_eq!(messages[0].content(), "Hola");
    assert_eq!(messages[0].sender(), Role::A);
    assert_eq!(messages[0].server_id(), Some(ServerId(1)));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, ChatEvent::ProvisionalAdded { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        ChatEvent::Confirmed { server_id: ServerId(1), .. }
    )));
    therapist.close().await;
}

#[tokio::test]
async fn history_is_backfilled_in_chronological_order() {
    let (state, addr) = start_broker().await;
    let pair = pair_of("t1", "p1");
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    state
        .store
        .append_at(&pair, "m1".into(), Role::B, t0)
        .await;
    state
        .store
        .append_at(&pair, "m2".into(), Role::A, t0 + chrono::Duration::seconds(5))
        .await;

    let (mut therapist, _events) = session(addr, Role::A, "t1");
    open(&mut therapist, "p1").await;

    assert_eq!(contents(&therapist), vec!["m1", "m2"]);
    assert!(therapist.messages().iter().all(|m| !m.is_provisional()));
    therapist.close().await;
}

#[tokio::test]
async fn send_before_connecting_is_not_ready() {
    let (_state, addr) = start_broker().await;
    let (therapist, _events) = session(addr, Role::A, "t1");

    let result = therapist.submit("too early").await;
    assert!(matches!(
        result,
        Err(SendError::NotReady(NotReady::NotConnected(
            ConnectionState::Disconnected
        )))
    ));
    assert!(therapist.messages().is_empty());
}

#[tokio::test]
async fn identical_quick_sends_are_both_kept() {
    let (_state, addr) = start_broker().await;
    let (mut therapist, _events) = session(addr, Role::A, "t1");
    open(&mut therapist, "p1").await;

    therapist.submit("ok").await.unwrap();
    therapist.submit("ok").await.unwrap();
    wait_until("both echoes", || all_confirmed(&therapist, 2)).await;

    let ids: Vec<_> = therapist
        .messages()
        .iter()
        .map(|m| m.server_id().unwrap())
        .collect();
    assert_eq!(ids, vec![ServerId(1), ServerId(2)]);
    therapist.close().await;
}

#[tokio::test]
async fn both_participants_see_the_same_conversation() {
    let (state, addr) = start_broker().await;
    let (mut therapist, _te) = session(addr, Role::A, "t1");
    let (mut patient, _pe) = session(addr, Role::B, "p1");
    let pair = open(&mut therapist, "p1").await;
    assert_eq!(open(&mut patient, "t1").await, pair);
    wait_subscribers(&state, &pair, 2).await;

    therapist.submit("how are you?").await.unwrap();
    wait_until("patient receives", || all_confirmed(&patient, 1)).await;
    assert_eq!(patient.messages()[0].sender(), Role::A);

    patient.submit("fine").await.unwrap();
    wait_until("therapist receives", || all_confirmed(&therapist, 2)).await;
    wait_until("patient echo", || all_confirmed(&patient, 2)).await;

    assert_eq!(contents(&therapist), vec!["how are you?", "fine"]);
    assert_eq!(contents(&patient), contents(&therapist));

    therapist.close().await;
    patient.close().await;
}

#[tokio::test]
async fn other_conversations_never_leak_in() {
    let (state, addr) = start_broker().await;
    let (mut first, _fe) = session(addr, Role::A, "t1");
    let (mut second, _se) = session(addr, Role::B, "p2");
    let first_pair = open(&mut first, "p1").await;
    let second_pair = open(&mut second, "t1").await;
    assert_ne!(first_pair, second_pair);
    wait_subscribers(&state, &second_pair, 1).await;

    first.submit("private").await.unwrap();
    wait_until("echo", || all_confirmed(&first, 1)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(second.messages().is_empty());
    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn switching_counterpart_replaces_the_log() {
    let (state, addr) = start_broker().await;
    state
        .store
        .append(&pair_of("t1", "p2"), "earlier with p2".into(), Role::B)
        .await;

    let (mut therapist, _events) = session(addr, Role::A, "t1");
    open(&mut therapist, "p1").await;
    therapist.submit("to p1").await.unwrap();
    wait_until("echo", || all_confirmed(&therapist, 1)).await;

    let pair = open(&mut therapist, "p2").await;
    assert_eq!(therapist.active_pair(), Some(pair));
    assert_eq!(contents(&therapist), vec!["earlier with p2"]);
    therapist.close().await;
}

#[tokio::test]
async fn unavailable_history_still_goes_live() {
    let (_state, addr) = start_broker().await;
    let (mut therapist, _events) =
        session_with_history_url(addr, "http://127.0.0.1:1/", Role::A, "t1");
    open(&mut therapist, "p1").await;
    assert!(therapist.messages().is_empty());

    therapist.submit("still works").await.unwrap();
    wait_until("echo", || all_confirmed(&therapist, 1)).await;
    therapist.close().await;
}

#[tokio::test]
async fn unassigned_counterpart_opens_nothing() {
    let (state, addr) = start_broker().await;
    let (mut therapist, _events) = session(addr, Role::A, "t1");

    let result = therapist
        .open_conversation(&CounterpartRef::from_option(None))
        .await;
    assert!(result.is_err());
    assert_eq!(therapist.active_pair(), None);
    assert_eq!(therapist.connection_state(), ConnectionState::Disconnected);
    assert_eq!(state.connection_count().await, 0);
}

#[tokio::test]
async fn lost_echo_leaves_message_provisional() {
    let (state, addr) = start_broker().await;
    let (mut therapist, _events) = session(addr, Role::A, "t1");
    open(&mut therapist, "p1").await;
    state.set_discard_publishes(true);

    therapist.submit("into the void").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let messages = therapist.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_provisional());
    therapist.close().await;
}
