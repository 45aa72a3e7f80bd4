//! Property tests for the compressed interval set against a plain model.

use std::collections::BTreeSet;

use proptest::prelude::*;

use plenum::IntervalSet;

#[derive(Debug, Clone)]
enum Op {
    Insert(u64),
    Erase(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..256).prop_map(Op::Insert),
        (0u64..256).prop_map(Op::Erase),
    ]
}

proptest! {
    #[test]
    fn behaves_like_a_set(ops in proptest::collection::vec(op_strategy(), 0..512)) {
        let mut set = IntervalSet::new();
        let mut model = BTreeSet::new();
        for op in ops {
            match op {
                Op::Insert(value) => {
                    prop_assert_eq!(set.insert(value), model.insert(value));
                }
                Op::Erase(value) => {
                    prop_assert_eq!(set.erase(value), model.remove(&value));
                }
            }
        }
        prop_assert_eq!(set.len(), model.len() as u64);
        for value in 0u64..256 {
            prop_assert_eq!(set.contains(value), model.contains(&value));
        }
        prop_assert_eq!(set.lower(), model.iter().next().copied());
        prop_assert_eq!(set.upper(), model.iter().next_back().copied());
    }

    #[test]
    fn wire_round_trip(values in proptest::collection::btree_set(0u64..1024, 0..128)) {
        let mut set = IntervalSet::new();
        for &value in &values {
            set.insert(value);
        }
        let bytes = plenum_wire::to_bytes(&set);
        let back: IntervalSet = plenum_wire::from_bytes(&bytes).unwrap();
        prop_assert_eq!(back, set);
    }

    #[test]
    fn intersection_matches_the_model(
        a in proptest::collection::btree_set(0u64..128, 0..64),
        b in proptest::collection::btree_set(0u64..128, 0..64),
    ) {
        let mut set_a = IntervalSet::new();
        for &value in &a {
            set_a.insert(value);
        }
        let mut set_b = IntervalSet::new();
        for &value in &b {
            set_b.insert(value);
        }
        let both = set_a.intersect(&set_b);
        for value in 0u64..128 {
            prop_assert_eq!(both.contains(value), a.contains(&value) && b.contains(&value));
        }
    }
}
