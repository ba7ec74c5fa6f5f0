//! Property-based tests for reconciliation.
//!
//! Uses proptest to verify, over arbitrary delivery sequences:
//! 1. A server id never appears twice in the log.
//! 2. Confirmed entries stay in ascending timestamp order.
//! 3. Re-delivering everything a second time changes nothing.
//! 4. History merged after live deliveries never duplicates them.
//! 5. With local sends interleaved, and local clocks that may lag the
//!    server, confirmed entries still stay unique and in timestamp order.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use pairchat::chat::reconcile::{Outcome, Reconciler};
use pairchat::chat::store::{
    ConfirmedMessage, LocalId, Message, MessageStore, ProvisionalMessage, ServerId,
};
use pairchat_proto::address::{PairKey, ParticipantId, Role};
use proptest::prelude::*;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

fn fresh_store() -> MessageStore {
    let mut store = MessageStore::new();
    store.reset(Some(
        PairKey::new(
            ParticipantId::new("t1").unwrap(),
            ParticipantId::new("p1").unwrap(),
        )
        .unwrap(),
    ));
    store
}

/// Deliveries drawn from a small space so ids, contents and timestamps
/// collide often.
fn arb_delivery() -> impl Strategy<Value = ConfirmedMessage> {
    (
        1u64..30,
        prop::sample::select(vec!["ok", "hi", "thanks"]),
        prop::bool::ANY,
        0i64..120,
    )
        .prop_map(|(id, content, from_a, secs)| ConfirmedMessage {
            server_id: ServerId(id),
            content: content.to_string(),
            sender: if from_a { Role::A } else { Role::B },
            created_at: base() + TimeDelta::seconds(secs),
        })
}

/// One thing that can happen to the log: a local send or a server delivery.
#[derive(Debug, Clone)]
enum Step {
    Send(ProvisionalMessage),
    Deliver(ConfirmedMessage),
}

fn arb_send() -> impl Strategy<Value = ProvisionalMessage> {
    (prop::sample::select(vec!["ok", "hi", "thanks"]), 0i64..120).prop_map(|(content, secs)| {
        ProvisionalMessage {
            local_id: LocalId::new(),
            content: content.to_string(),
            sender: Role::A,
            created_at: base() + TimeDelta::seconds(secs),
        }
    })
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        1 => arb_send().prop_map(Step::Send),
        2 => arb_delivery().prop_map(Step::Deliver),
    ]
}

fn confirmed_times(store: &MessageStore) -> Vec<DateTime<Utc>> {
    store
        .messages()
        .iter()
        .filter(|m| !m.is_provisional())
        .map(Message::created_at)
        .collect()
}

fn snapshot(store: &MessageStore) -> Vec<(Option<ServerId>, String, DateTime<Utc>)> {
    store
        .messages()
        .iter()
        .map(|m| (m.server_id(), m.content().to_string(), m.created_at()))
        .collect()
}

proptest! {
    #[test]
    fn server_ids_are_unique_and_ordered(deliveries in prop::collection::vec(arb_delivery(), 0..40)) {
        let reconciler = Reconciler::new(Duration::from_millis(5000));
        let mut store = fresh_store();
        for delivery in deliveries {
            reconciler.apply(&mut store, delivery);
        }

        let ids: Vec<_> = store.messages().iter().filter_map(Message::server_id).collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        prop_assert_eq!(unique.len(), ids.len());

        let times: Vec<_> = store.messages().iter().map(Message::created_at).collect();
        prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn redelivery_is_idempotent(deliveries in prop::collection::vec(arb_delivery(), 0..40)) {
        let reconciler = Reconciler::new(Duration::from_millis(5000));
        let mut store = fresh_store();
        for delivery in deliveries.clone() {
            reconciler.apply(&mut store, delivery);
        }
        let once = snapshot(&store);

        for delivery in deliveries {
            let outcome = reconciler.apply(&mut store, delivery);
            let is_duplicate = matches!(outcome, Outcome::Duplicate { .. });
            prop_assert!(is_duplicate);
        }
        prop_assert_eq!(snapshot(&store), once);
    }

    #[test]
    fn history_after_live_never_duplicates(deliveries in prop::collection::vec(arb_delivery(), 0..30)) {
        let reconciler = Reconciler::new(Duration::from_millis(5000));
        let mut store = fresh_store();
        let epoch = store.epoch();
        for delivery in deliveries.clone() {
            reconciler.apply(&mut store, delivery);
        }
        let before = store.len();

        let mut seen = std::collections::HashSet::new();
        let history: Vec<_> = deliveries
            .into_iter()
            .filter(|d| store.contains_server_id(d.server_id) && seen.insert(d.server_id))
            .collect();
        let added = store.merge_history(epoch, history).unwrap();
        prop_assert_eq!(added, 0);
        prop_assert_eq!(store.len(), before);
    }

    #[test]
    fn local_sends_never_break_confirmed_order(steps in prop::collection::vec(arb_step(), 0..50)) {
        let reconciler = Reconciler::new(Duration::from_millis(5000));
        let mut store = fresh_store();
        let epoch = store.epoch();
        let mut sent = 0;
        for step in steps {
            match step {
                Step::Send(message) => {
                    store.push_provisional(epoch, message).unwrap();
                    sent += 1;
                }
                Step::Deliver(delivery) => {
                    reconciler.apply(&mut store, delivery);
                }
            }
        }

        let ids: Vec<_> = store.messages().iter().filter_map(Message::server_id).collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        prop_assert_eq!(unique.len(), ids.len());

        let times = confirmed_times(&store);
        prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));

        let pending = store.messages().iter().filter(|m| m.is_provisional()).count();
        prop_assert!(pending <= sent);
    }
}
