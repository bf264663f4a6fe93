//! Property-based tests for the lattice laws the clocks and registers rely on:
//!  - Commutativity: a ⊔ b = b ⊔ a
//!  - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//!  - Idempotence:  a ⊔ a = a

use proptest::prelude::*;
use quire_core::{DotSet, Lattice, LwwRegister, OpId, VectorClock};

fn clock_strategy() -> impl Strategy<Value = VectorClock> {
    prop::collection::btree_map("[a-d]", 0u64..20, 0..4)
        .prop_map(|entries| VectorClock::from_entries(entries))
}

// A stamp identifies exactly one write, so the value is derived from it.
fn register_strategy() -> impl Strategy<Value = LwwRegister<String>> {
    ("[a-c]", 1u64..10).prop_map(|(site, counter)| {
        let value = format!("{}{}", site, counter);
        LwwRegister::with_value(value, OpId::new(site, counter))
    })
}

proptest! {
    #[test]
    fn clock_join_is_commutative(a in clock_strategy(), b in clock_strategy()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn clock_join_is_associative(
        a in clock_strategy(),
        b in clock_strategy(),
        c in clock_strategy()
    ) {
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
    }

    #[test]
    fn clock_join_is_idempotent(a in clock_strategy()) {
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn clock_min_is_dominated_by_both(a in clock_strategy(), b in clock_strategy()) {
        let min = a.min_with(&b);
        prop_assert!(a.dominates(&min));
        prop_assert!(b.dominates(&min));
    }

    #[test]
    fn register_join_is_commutative(a in register_strategy(), b in register_strategy()) {
        let ab = a.join(&b);
        let ba = b.join(&a);
        prop_assert_eq!(ab.get(), ba.get());
    }

    #[test]
    fn register_join_is_idempotent(a in register_strategy()) {
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn dot_set_is_order_insensitive(mut counters in prop::collection::vec(1u64..30, 0..30)) {
        let mut forward = DotSet::new();
        for c in &counters {
            forward.insert(&OpId::new("A", *c));
        }
        counters.reverse();
        let mut backward = DotSet::new();
        for c in &counters {
            backward.insert(&OpId::new("A", *c));
        }
        prop_assert_eq!(forward, backward);
    }
}
