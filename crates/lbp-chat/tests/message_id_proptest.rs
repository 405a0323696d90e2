//! Property tests for [`lbp_chat::generate_message_id`]'s determinism.

use chrono::{TimeZone, Utc};
use lbp_chat::generate_message_id;
use lbp_core::Role;
use proptest::prelude::*;

fn arb_role() -> impl Strategy<Value = Role> {
    prop_oneof![
        Just(Role::System),
        Just(Role::User),
        Just(Role::Assistant),
        Just(Role::Model),
    ]
}

fn arb_timestamp() -> impl Strategy<Value = chrono::DateTime<Utc>> {
    (0i64..2_000_000_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

proptest! {
    #[test]
    fn same_inputs_always_produce_the_same_id(
        idx in proptest::array::uniform16(any::<u8>()),
        content in ".{0,200}",
        role in arb_role(),
        ts in arb_timestamp(),
    ) {
        let idx = uuid::Uuid::from_bytes(idx);
        let a = generate_message_id(idx, &content, role, ts);
        let b = generate_message_id(idx, &content, role, ts);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn id_is_a_40_char_lowercase_hex_string(
        idx in proptest::array::uniform16(any::<u8>()),
        content in ".{0,200}",
        role in arb_role(),
        ts in arb_timestamp(),
    ) {
        let idx = uuid::Uuid::from_bytes(idx);
        let id = generate_message_id(idx, &content, role, ts);
        prop_assert_eq!(id.len(), 40);
        prop_assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn differing_content_almost_always_changes_the_id(
        idx in proptest::array::uniform16(any::<u8>()),
        content_a in ".{1,100}",
        content_b in ".{1,100}",
        role in arb_role(),
        ts in arb_timestamp(),
    ) {
        prop_assume!(content_a != content_b);
        let idx = uuid::Uuid::from_bytes(idx);
        let a = generate_message_id(idx, &content_a, role, ts);
        let b = generate_message_id(idx, &content_b, role, ts);
        prop_assert_ne!(a, b);
    }
}
