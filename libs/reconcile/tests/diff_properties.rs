//! Property tests for the keyed set difference used by the volume engines.

use std::collections::{BTreeMap, BTreeSet};

use bmcsync_reconcile::{diff_keyed_sets, union_keyed_sets};
use proptest::prelude::*;

fn keyed_sets() -> impl Strategy<Value = BTreeMap<String, BTreeSet<u8>>> {
    prop::collection::btree_map(
        prop::sample::select(vec![
            "ArrayControllers-0".to_string(),
            "ArrayControllers-1".to_string(),
            "RAID.Integrated.1-1".to_string(),
        ]),
        prop::collection::btree_set(0u8..16, 0..8),
        0..3,
    )
}

fn is_subset(a: &BTreeMap<String, BTreeSet<u8>>, b: &BTreeMap<String, BTreeSet<u8>>) -> bool {
    a.iter().all(|(k, ids)| match b.get(k) {
        Some(other) => ids.is_subset(other),
        None => ids.is_empty(),
    })
}

proptest! {
    #[test]
    fn diff_contains_exactly_elements_absent_from_b(a in keyed_sets(), b in keyed_sets()) {
        let diff = diff_keyed_sets(&a, &b);

        for (key, ids) in &a {
            let expected: BTreeSet<u8> = ids
                .iter()
                .filter(|id| !b.get(key).is_some_and(|other| other.contains(id)))
                .copied()
                .collect();
            let actual = diff.get(key).cloned().unwrap_or_default();
            prop_assert_eq!(actual, expected);
        }

        for key in diff.keys() {
            prop_assert!(a.contains_key(key));
        }
    }

    #[test]
    fn diff_empty_iff_subset(a in keyed_sets(), b in keyed_sets()) {
        prop_assert_eq!(diff_keyed_sets(&a, &b).is_empty(), is_subset(&a, &b));
    }

    #[test]
    fn applying_diff_eliminates_it(a in keyed_sets(), b in keyed_sets()) {
        let created = diff_keyed_sets(&a, &b);
        let merged = union_keyed_sets(&b, &created);
        prop_assert!(diff_keyed_sets(&a, &merged).is_empty());
    }
}
