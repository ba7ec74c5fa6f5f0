//! Property-based tests for the STOMP frame codec and addressing.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never causes a panic in `Frame::decode`.
//! 2. Header values with any characters survive encode → decode on
//!    escaping commands.
//! 3. Any valid pair key maps to a topic that parses back to the same key.

use pairchat_proto::address::{PairKey, ParticipantId};
use pairchat_proto::stomp::{Command, Frame};
use proptest::prelude::*;

/// Strategy for identifiers that are valid destination segments.
fn arb_participant() -> impl Strategy<Value = ParticipantId> {
    "[a-zA-Z0-9_.-]{1,24}".prop_map(|s| ParticipantId::new(s).unwrap())
}

proptest! {
    #[test]
    fn decode_never_panics(text in any::<String>()) {
        let _ = Frame::decode(&text);
    }

    #[test]
    fn decode_never_panics_on_frame_like_input(
        command in prop::sample::select(vec!["SEND", "MESSAGE", "CONNECTED", "ERROR"]),
        head in "[a-z:\\\\\r\n]{0,40}",
        body in "[^\u{0}]{0,40}",
    ) {
        let text = format!("{command}\n{head}\n\n{body}\0");
        let _ = Frame::decode(&text);
    }

    #[test]
    fn escaped_header_values_survive(value in "[^\u{0}]{0,64}", body in "[^\u{0}]{0,64}") {
        let frame = Frame::new(Command::Message)
            .with_header("destination", "chat/a/b")
            .with_header("x-note", value.clone())
            .with_body(body.clone());
        let decoded = Frame::decode(&frame.encode()).unwrap().unwrap();
        prop_assert_eq!(decoded.header("x-note"), Some(value.as_str()));
        prop_assert_eq!(decoded.body, body);
    }

    #[test]
    fn topic_parses_back_to_key(a in arb_participant(), b in arb_participant()) {
        prop_assume!(a != b);
        let key = PairKey::new(a, b).unwrap();
        prop_assert_eq!(PairKey::from_topic(&key.topic()).unwrap(), key.clone());
        prop_assert_eq!(
            PairKey::from_publish_destination(&key.publish_destination()).unwrap(),
            key
        );
    }
}
