//! Property tests for convergence under hostile delivery.

use chatsync_engine::{Direction, WindowKey};
use chatsync_protocol::{MsgId, PeerId};
use chatsync_testkit::fixtures::{contact, contact_peer, standard_harness};
use chatsync_testkit::generators::{
    apply_event, event_sequence_strategy, fault_sequence_strategy, PropTestConfig,
};
use chatsync_testkit::Harness;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

/// Everything observable about the local store, in a comparable form.
fn store_summary(harness: &Harness) -> Vec<(PeerId, Vec<(MsgId, bool)>, BTreeSet<MsgId>)> {
    let store = harness.sync().context().store();
    store
        .conversations()
        .map(|(peer, conversation)| {
            let messages = store
                .messages_in(*peer)
                .iter()
                .map(|stored| (stored.message.id, stored.message.outgoing))
                .collect();
            (*peer, messages, conversation.unread.clone())
        })
        .collect()
}

/// Delivers whatever is pending and forces a final reconciliation so a
/// trailing lost batch is recovered too.
fn recover(harness: &mut Harness) {
    harness.settle();
    let timeout = harness.sync().config().no_updates_timeout;
    harness.advance(timeout + Duration::from_secs(1));
    harness.settle();
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn duplicated_delivery_matches_clean_delivery(events in event_sequence_strategy(1, 25)) {
        let mut clean = standard_harness();
        let mut doubled = standard_harness();
        for event in &events {
            apply_event(clean.server(), event).unwrap();
            apply_event(doubled.server(), event).unwrap();
        }

        clean.deliver_pushes();
        clean.settle();
        doubled.duplicate_pushes();
        doubled.settle();

        prop_assert_eq!(store_summary(&clean), store_summary(&doubled));
        prop_assert_eq!(
            clean.sync().context().sequence().pts(),
            doubled.sync().context().sequence().pts()
        );
    }

    #[test]
    fn faulty_delivery_converges(
        events in event_sequence_strategy(1, 30),
        faults in fault_sequence_strategy(30),
    ) {
        let mut harness = standard_harness();
        for event in &events {
            apply_event(harness.server(), event).unwrap();
        }
        harness.deliver_with_faults(&faults);
        recover(&mut harness);

        prop_assert!(harness.sync().phase().is_live());
        let divergence = harness.divergence();
        prop_assert!(divergence.is_empty(), "{:?}", divergence);
        prop_assert_eq!(
            harness.sync().context().sequence().seq(),
            harness.server().state().seq
        );
    }

    #[test]
    fn interleaved_sends_and_faults_converge(
        rounds in prop::collection::vec(
            (event_sequence_strategy(0, 5), fault_sequence_strategy(6), any::<bool>()),
            1..6,
        ),
    ) {
        let mut harness = standard_harness();
        for (events, faults, send) in &rounds {
            for event in events {
                apply_event(harness.server(), event).unwrap();
            }
            if *send {
                harness.send(contact_peer(0), "ping").unwrap();
                harness.run_until_idle();
            }
            harness.deliver_with_faults(faults);
        }
        recover(&mut harness);

        prop_assert!(harness.sync().context().pending().is_empty());
        let divergence = harness.divergence();
        prop_assert!(divergence.is_empty(), "{:?}", divergence);
    }

    #[test]
    fn resident_items_stay_bounded(
        moves in prop::collection::vec((0usize..40, -3i32..=3), 1..60),
    ) {
        let mut harness = standard_harness();
        let peer = contact_peer(1);
        for _ in 0..40 {
            harness.server().post_message(peer, contact(1), "m", None).unwrap();
        }
        harness.settle();

        let key = WindowKey::history(peer);
        harness.load_more(key, Direction::Backward, true);
        harness.run_until_idle();

        let bound = harness.sync().config().loader.max_resident();
        for (index, delta) in moves {
            harness.viewport_changed(key, index, delta);
            harness.run_until_idle();
            let window = harness.sync().context().windows().window(&key).unwrap();
            prop_assert!(window.resident().len() <= bound);
            prop_assert!(window.resident().iter().all(|id| window.contains(*id)));
        }
    }
}
