use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::error::Error;
use crate::layout;
use crate::table::ShmTable;

/// 4-byte aligned backing buffer for a table region.
fn region(max_slots: usize) -> Vec<u32> {
    vec![0u32; layout::region_size(max_slots).div_ceil(4)]
}

fn bytes_mut(words: &mut [u32]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 4) }
}

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Get(Vec<u8>),
    Remove(Vec<u8>),
}

/// Keys drawn from a deliberately small space so collision chains,
/// evictions and sibling promotion all happen constantly.
fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        "[a-c]{1,2}".prop_map(String::into_bytes),
        "[a-z]{1,8}".prop_map(String::into_bytes),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (key_strategy(), prop::collection::vec(any::<u8>(), 0..96))
            .prop_map(|(k, v)| Op::Put(k, v)),
        key_strategy().prop_map(Op::Get),
        key_strategy().prop_map(Op::Remove),
    ]
}

proptest! {
    /// The table must agree with a plain map under arbitrary
    /// interleavings of put/get/remove, with the structural invariants
    /// holding after every operation. The region is sized so the ring
    /// cannot fill (capacity failures are exercised by unit tests).
    #[test]
    fn behaves_like_a_map(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let mut mem = region(512);
        let mut table = ShmTable::create(bytes_mut(&mut mem)).unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(key, value) => {
                    table.put(&key, &value).unwrap();
                    model.insert(key, value);
                }
                Op::Get(key) => match model.get(&key) {
                    Some(value) => prop_assert_eq!(&table.get(&key).unwrap(), value),
                    None => prop_assert!(matches!(table.get(&key), Err(Error::NotFound))),
                },
                Op::Remove(key) => match model.remove(&key) {
                    Some(_) => table.remove(&key).unwrap(),
                    None => {
                        prop_assert!(matches!(table.remove(&key), Err(Error::NotFound)))
                    }
                },
            }
            table.check_invariants();
        }

        prop_assert_eq!(table.len(), model.len());

        // A full cursor pass yields exactly the model's entries.
        let mut seen: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut cursor = 0;
        while let Some(entry) = table.get_next(&mut cursor).unwrap() {
            seen.insert(entry.key, entry.value);
        }
        prop_assert_eq!(seen, model);
    }

    /// Keys past the inline width are stored truncated with an MD5
    /// fingerprint; shared prefixes must not confuse lookups.
    #[test]
    fn long_keys_round_trip(
        entries in prop::collection::btree_map(
            "prefix-[a-f]{12,24}",
            prop::collection::vec(any::<u8>(), 0..64),
            1..16,
        )
    ) {
        let mut mem = region(256);
        let mut table = ShmTable::create(bytes_mut(&mut mem)).unwrap();

        for (key, value) in &entries {
            table.put(key.as_bytes(), value).unwrap();
        }
        table.check_invariants();

        prop_assert_eq!(table.len(), entries.len());
        for (key, value) in &entries {
            prop_assert_eq!(&table.get(key.as_bytes()).unwrap(), value);
        }
    }
}
