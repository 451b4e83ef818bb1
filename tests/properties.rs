//! Property tests for counter invariants.

use proptest::prelude::*;
use std::sync::Arc;
use unread_store::{UnreadBadge, UnreadMap, UnreadStore};

#[derive(Clone, Debug)]
enum Op {
    Increment(usize, i64),
    Reset(usize),
    ResetBulk(Vec<usize>),
    Track(Vec<usize>),
}

const CONVERSATIONS: [&str; 5] = ["c0", "c1", "c2", "c3", "c4"];

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..CONVERSATIONS.len(), -20i64..20).prop_map(|(c, step)| Op::Increment(c, step)),
        (0..CONVERSATIONS.len()).prop_map(Op::Reset),
        prop::collection::vec(0..CONVERSATIONS.len(), 0..4).prop_map(Op::ResetBulk),
        prop::collection::vec(0..CONVERSATIONS.len(), 0..4).prop_map(Op::Track),
    ]
}

fn ids(indices: &[usize]) -> Vec<&'static str> {
    indices.iter().map(|i| CONVERSATIONS[*i]).collect()
}

fn apply(store: &UnreadStore, profile_id: &str, op: &Op) {
    match op {
        Op::Increment(c, step) => store.increment(profile_id, CONVERSATIONS[*c], *step),
        Op::Reset(c) => store.reset(profile_id, CONVERSATIONS[*c]),
        Op::ResetBulk(cs) => store.reset_bulk(profile_id, &ids(cs)),
        Op::Track(cs) => store.ensure_tracked_keys(profile_id, &ids(cs)),
    }
}

/// Reference model: signed arithmetic, clamped after every step.
fn model(ops: &[Op]) -> UnreadMap {
    let mut counts: std::collections::HashMap<&str, i64> = Default::default();
    for op in ops {
        match op {
            Op::Increment(c, step) => {
                let entry = counts.entry(CONVERSATIONS[*c]).or_insert(0);
                *entry = (*entry + step).max(0);
            }
            Op::Reset(c) => {
                counts.insert(CONVERSATIONS[*c], 0);
            }
            Op::ResetBulk(cs) => {
                for c in cs {
                    counts.insert(CONVERSATIONS[*c], 0);
                }
            }
            Op::Track(cs) => {
                for c in cs {
                    counts.entry(CONVERSATIONS[*c]).or_insert(0);
                }
            }
        }
    }
    counts.into_iter().map(|(k, v)| (k, v as u64)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_counts_match_clamped_model(ops in prop::collection::vec(op(), 0..60)) {
        let store = UnreadStore::in_memory().unwrap();
        for op in &ops {
            apply(&store, "p1", op);
        }
        prop_assert_eq!(store.get_snapshot("p1"), model(&ops));
    }

    #[test]
    fn prop_total_matches_exposed_map(ops in prop::collection::vec(op(), 0..60)) {
        let store = Arc::new(UnreadStore::in_memory().unwrap());
        let badge = UnreadBadge::with_profile(store.clone(), Some("p1"));

        for op in &ops {
            apply(&store, "p1", op);
            let exposed = badge.unread_map();
            let sum: u64 = exposed.iter().map(|(_, v)| v).sum();
            prop_assert_eq!(badge.total_unread(), sum);
        }
        store.flush();
        prop_assert_eq!(badge.unread_map(), store.get_snapshot("p1"));
    }

    #[test]
    fn prop_other_profile_untouched(
        before in prop::collection::vec(op(), 0..20),
        ops in prop::collection::vec(op(), 0..40),
    ) {
        let store = UnreadStore::in_memory().unwrap();
        for op in &before {
            apply(&store, "b", op);
        }
        let expected = store.get_snapshot("b");
        let receiver = store.subscribe_channel("b", 8);
        let _ = receiver.try_recv();

        for op in &ops {
            apply(&store, "a", op);
        }

        prop_assert_eq!(store.get_snapshot("b"), expected);
        prop_assert!(receiver.try_recv().is_err());
    }
}
