// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Credential rejection: the channel retries with backoff a bounded number
//! of times, then stops in `Disconnected` with an authentication fault.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use pairchat::connection::{
    ConnectionConfig, ConnectionFault, ConnectionManager, ConnectionState, ConnectionStatus,
    Credential,
};
use pairchat_broker::broker::{BrokerState, start_server_with_state};
use pairchat_broker::store::ConversationStore;
use pairchat_proto::address::{PairKey, ParticipantId};

fn pair() -> PairKey {
    PairKey::new(
        ParticipantId::new("t1").unwrap(),
        ParticipantId::new("p1").unwrap(),
    )
    .unwrap()
}

async fn guarded_broker() -> (Arc<BrokerState>, String) {
    let state = Arc::new(BrokerState::with_config(
        vec!["right".to_string()],
        Duration::from_secs(4),
        64 * 1024,
        ConversationStore::new(),
    ));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (state, format!("ws://{addr}/ws"))
}

async fn wait_for(
    status: &mut watch::Receiver<ConnectionStatus>,
    check: impl FnMut(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(check))
        .await
        .expect("timed out waiting for status")
        .unwrap()
        .clone()
}

#[tokio::test]
async fn rejected_credential_gives_up_after_max_attempts() {
    let (state, endpoint) = guarded_broker().await;
    let mut config = ConnectionConfig::new(endpoint);
    config.reconnect_delay = Duration::from_millis(50);
    config.auth_max_attempts = 3;
    let mut manager = ConnectionManager::new(config);
    let mut status = manager.status();

    let _inbound = manager.open(pair(), Credential::new("wrong")).await;

    let retrying = wait_for(&mut status, |s| s.state == ConnectionState::Reconnecting).await;
    assert!(matches!(retrying.fault, Some(ConnectionFault::Auth(_))));

    let final_status = wait_for(&mut status, |s| {
        s.state == ConnectionState::Disconnected && s.fault.is_some()
    })
    .await;
    assert!(matches!(final_status.fault, Some(ConnectionFault::Auth(_))));
    assert_eq!(state.subscriber_count(&pair()).await, 0);

    // Nothing left running: the state stays put.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    manager.close().await;
}

#[tokio::test]
async fn accepted_credential_connects() {
    let (state, endpoint) = guarded_broker().await;
    let mut manager = ConnectionManager::new(ConnectionConfig::new(endpoint));
    let mut status = manager.status();

    let _inbound = manager.open(pair(), Credential::new("right")).await;
    let connected = wait_for(&mut status, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(connected.fault, None);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while state.subscriber_count(&pair()).await != 1 {
        assert!(tokio::time::Instant::now() < deadline, "never subscribed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    manager.close().await;
}
