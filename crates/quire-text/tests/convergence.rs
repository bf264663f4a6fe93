//! Property-based convergence tests.
//!
//! Histories are produced by replicas editing concurrently and syncing at
//! random points, so every generated operation is one a real site could
//! have authored.

use proptest::prelude::*;
use quire_core::VectorClock;
use quire_text::{Attributes, CrdtDocument, Operation, Replica};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

const SITES: [&str; 3] = ["alice", "bob", "carol"];

/// An edit history plus the minimum observed version at a point within it.
struct History {
    log: Vec<Operation>,
    checkpoint: usize,
    checkpoint_mov: VectorClock,
}

fn random_history(seed: u64, steps: usize) -> History {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut replicas: Vec<Replica> = SITES.iter().map(|s| Replica::new(*s)).collect();
    let mut log: Vec<Operation> = Vec::new();
    let mut checkpoint = 0;
    let mut checkpoint_mov = VectorClock::new();

    for step in 0..steps {
        if step == steps / 2 {
            checkpoint = log.len();
            checkpoint_mov =
                VectorClock::meet(replicas.iter().map(|r| r.vector_clock())).unwrap_or_default();
        }

        let r = rng.gen_range(0..replicas.len());
        let len = replicas[r].document().len();
        let ops = match rng.gen_range(0..11) {
            0..=4 => {
                let pos = rng.gen_range(0..=len);
                let run = ["a", "bc", "xyz", "abcd"][rng.gen_range(0..4)];
                replicas[r].insert(pos, run).unwrap()
            }
            // Another site types at the same anchor before either has synced,
            // so a sibling meets a chain several levels deep.
            10 => {
                let other = (r + 1) % replicas.len();
                let mut ops = replicas[r].insert(0, "pqr").unwrap();
                ops.extend(replicas[other].insert(0, "s").unwrap());
                let tail = replicas[other].document().len();
                ops.extend(replicas[other].insert(tail, "tu").unwrap());
                ops
            }
            5 | 6 if len > 0 => {
                let pos = rng.gen_range(0..len);
                let count = rng.gen_range(1..=(len - pos).min(2));
                replicas[r].delete(pos, count).unwrap()
            }
            7 if len > 0 => {
                let start = rng.gen_range(0..len);
                let end = rng.gen_range(start + 1..=len);
                let name = ["bold", "italic", "color"][rng.gen_range(0..3)];
                let value = match rng.gen_range(0..3) {
                    0 => Value::Null,
                    1 => json!(true),
                    _ => json!(rng.gen_range(0..5)),
                };
                let mut attrs = Attributes::new();
                attrs.insert(name.to_string(), value);
                vec![replicas[r].format(start, end, attrs).unwrap()]
            }
            _ => {
                for op in &log {
                    replicas[r].receive(op).unwrap();
                }
                Vec::new()
            }
        };
        log.extend(ops);
    }

    History {
        log,
        checkpoint,
        checkpoint_mov,
    }
}

fn replay<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> CrdtDocument {
    let mut doc = CrdtDocument::new();
    for op in ops {
        doc.apply_operation(op).unwrap();
    }
    doc
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn any_delivery_order_converges(seed in any::<u64>(), shuffle in any::<u64>()) {
        let history = random_history(seed, 60);
        let in_order = replay(&history.log);

        let mut rng = StdRng::seed_from_u64(shuffle);
        let mut delivered = history.log.clone();
        let duplicates: Vec<Operation> = history
            .log
            .choose_multiple(&mut rng, history.log.len() / 3)
            .cloned()
            .collect();
        delivered.extend(duplicates);
        delivered.shuffle(&mut rng);
        let shuffled = replay(&delivered);

        prop_assert_eq!(in_order.pending_count(), 0);
        prop_assert_eq!(shuffled.pending_count(), 0);
        prop_assert_eq!(in_order.text(), shuffled.text());
        prop_assert_eq!(in_order.visible_units(), shuffled.visible_units());
        prop_assert_eq!(in_order.vector_clock(), shuffled.vector_clock());
    }

    #[test]
    fn duplicates_are_rejected(seed in any::<u64>()) {
        let history = random_history(seed, 30);
        let mut doc = replay(&history.log);
        let before = doc.to_state();
        for op in &history.log {
            prop_assert!(!doc.apply_operation(op).unwrap());
        }
        prop_assert_eq!(doc.to_state(), before);
    }

    #[test]
    fn collection_at_the_observed_version_is_invisible(seed in any::<u64>()) {
        let history = random_history(seed, 60);
        let full = replay(&history.log);

        let mut collected = replay(&history.log[..history.checkpoint]);
        collected.garbage_collect_tombstones(&history.checkpoint_mov);
        for op in &history.log[history.checkpoint..] {
            collected.apply_operation(op).unwrap();
        }

        prop_assert_eq!(collected.pending_count(), 0);
        prop_assert!(collected.unit_count() <= full.unit_count());
        prop_assert_eq!(collected.visible_units(), full.visible_units());
    }

    #[test]
    fn state_roundtrip_preserves_behavior(seed in any::<u64>()) {
        let history = random_history(seed, 60);
        let prefix = &history.log[..history.checkpoint];

        let original = replay(prefix);
        let json = original.to_state().to_json().unwrap();
        let mut restored =
            CrdtDocument::from_state(quire_text::CrdtState::from_json(&json).unwrap()).unwrap();
        let mut original = original;

        for op in &history.log {
            prop_assert_eq!(
                original.apply_operation(op).unwrap(),
                restored.apply_operation(op).unwrap()
            );
        }
        prop_assert_eq!(original.visible_units(), restored.visible_units());
    }
}
