use std::sync::Arc;

use identmap_rs::{Equality, Error, IdentityMap, Strength, DEFAULT_LOAD_FACTOR};

#[test]
fn test_insert_get_remove_identity() {
    let mut m: IdentityMap<String, u32> = IdentityMap::with_capacity(16);
    assert!(m.is_empty());

    let a = Arc::new("a".to_string());
    let b = Arc::new("b".to_string());

    // insert new
    assert_eq!(m.insert(a.clone(), 1), None);
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(&a), Some(1));

    // insert another
    assert_eq!(m.insert(b.clone(), 2), None);
    assert_eq!(m.len(), 2);
    assert_eq!(m.get(&b), Some(2));

    // update existing
    assert_eq!(m.insert(a.clone(), 10), Some(1));
    assert_eq!(m.get(&a), Some(10));
    assert_eq!(m.len(), 2);

    // remove existing
    assert_eq!(m.remove(&b), Some(2));
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(&b), None);
    assert_eq!(m.remove(&b), None);
}

#[test]
fn test_identity_mode_keeps_equal_keys_apart() {
    let mut m: IdentityMap<String, &str> = IdentityMap::new();
    assert_eq!(m.equality(), Equality::Identity);

    let first = Arc::new("same".to_string());
    let second = Arc::new("same".to_string());
    assert_eq!(first, second);

    m.insert(first.clone(), "first");
    m.insert(second.clone(), "second");
    assert_eq!(m.len(), 2);
    assert_eq!(m.get(&first), Some("first"));
    assert_eq!(m.get(&second), Some("second"));
}

#[test]
fn test_value_mode_merges_equal_keys() {
    let mut m: IdentityMap<String, &str> = IdentityMap::new();
    m.use_value_equality().unwrap();
    assert_eq!(m.equality(), Equality::Value);

    let first = Arc::new("same".to_string());
    let second = Arc::new("same".to_string());

    assert_eq!(m.insert(first.clone(), "first"), None);
    assert_eq!(m.insert(second.clone(), "second"), Some("first"));
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(&first), Some("second"));
    assert_eq!(m.remove(&second), Some("second"));
    assert!(m.is_empty());
}

#[test]
fn test_round_trip_all_modes() {
    for strength in [Strength::Weak, Strength::Soft] {
        for equality in [Equality::Identity, Equality::Value] {
            let mut m: IdentityMap<u64, u64> = IdentityMap::with_strength(strength);
            if equality == Equality::Value {
                m.use_value_equality().unwrap();
            }
            let keys: Vec<Arc<u64>> = (0..200).map(Arc::new).collect();
            for k in &keys {
                assert_eq!(m.insert(k.clone(), **k * 3), None);
            }
            assert_eq!(m.len(), 200, "{strength:?}/{equality:?}");
            for k in &keys {
                assert_eq!(m.get(k), Some(**k * 3), "{strength:?}/{equality:?}");
            }
            for k in keys.iter().step_by(2) {
                assert_eq!(m.remove(k), Some(**k * 3));
            }
            assert_eq!(m.len(), 100);
            for (i, k) in keys.iter().enumerate() {
                assert_eq!(m.contains_key(k), i % 2 == 1);
            }
        }
    }
}

#[test]
fn test_null_key() {
    let mut m: IdentityMap<String, i32> = IdentityMap::new();
    assert!(!m.contains_null_key());
    assert_eq!(m.get_null(), None);

    assert_eq!(m.insert_null(7), None);
    assert!(m.contains_null_key());
    assert_eq!(m.get_null(), Some(7));
    assert_eq!(m.insert_null(9), Some(7));
    assert_eq!(m.len(), 1);

    let k = Arc::new("k".to_string());
    m.insert(k.clone(), 1);
    let keys: Vec<_> = m.keys().collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&None));

    assert_eq!(m.remove_null(), Some(9));
    assert_eq!(m.get_null(), None);
    assert_eq!(m.get(&k), Some(1));

    // The null key survives purges.
    m.insert_null(1);
    assert_eq!(m.purge(), 0);
    assert_eq!(m.get_null(), Some(1));
}

#[test]
fn test_resize_keeps_entries() {
    let mut m: IdentityMap<usize, usize> = IdentityMap::with_capacity(2);
    let initial = m.capacity();
    let keys: Vec<Arc<usize>> = (0..1_000).map(Arc::new).collect();
    for k in &keys {
        m.insert(k.clone(), **k);
    }
    assert!(m.capacity() > initial);
    assert!((m.len() as f32) <= m.capacity() as f32 * DEFAULT_LOAD_FACTOR);
    for k in &keys {
        assert_eq!(m.get(k), Some(**k));
    }
}

#[test]
fn test_iter_traversal() {
    let mut m: IdentityMap<u64, u64> = IdentityMap::with_capacity(8);
    let keys: Vec<Arc<u64>> = (0..50).map(Arc::new).collect();
    for k in &keys {
        m.insert(k.clone(), **k * 2);
    }

    let mut sum_keys = 0u64;
    let mut sum_vals = 0u64;
    for (k, v) in m.iter() {
        sum_keys += *k.unwrap();
        sum_vals += v;
    }
    assert_eq!(sum_keys, (0..50).sum());
    assert_eq!(sum_vals, (0..50).map(|i| i * 2).sum());
    assert_eq!(m.values().count(), 50);
}

#[test]
fn test_equality_change_requires_empty_map() {
    let mut m: IdentityMap<String, i32> = IdentityMap::new();
    let k = Arc::new("k".to_string());
    m.insert(k.clone(), 1);

    let err = m.use_value_equality().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert_eq!(m.equality(), Equality::Identity);

    m.remove(&k);
    m.use_value_equality().unwrap();
    m.use_identity_equality().unwrap();
    assert_eq!(m.equality(), Equality::Identity);
}

#[test]
fn test_equality_change_after_keys_dropped() {
    let mut m: IdentityMap<String, i32> = IdentityMap::new();
    let k = Arc::new("gone".to_string());
    m.insert(k.clone(), 1);
    drop(k);

    // Only reclaimed entries remain, so the mode may change.
    m.use_value_equality().unwrap();
    assert!(m.is_empty());
    assert_eq!(m.reclaimed_count(), 1);
}

#[test]
fn test_clear() {
    let mut m: IdentityMap<u64, String> = IdentityMap::with_capacity(16);
    let keys: Vec<Arc<u64>> = (0..3).map(Arc::new).collect();
    for k in &keys {
        m.insert(k.clone(), k.to_string());
    }
    m.insert_null("null".to_string());
    assert_eq!(m.len(), 4);

    let before = m.modification_stamp();
    m.clear();
    assert!(m.is_empty());
    assert_ne!(m.modification_stamp(), before);
    for k in &keys {
        assert_eq!(m.get(k), None);
    }
    assert_eq!(m.get_null(), None);

    // Clearing an empty map changes nothing.
    let stamp = m.modification_stamp();
    m.clear();
    assert_eq!(m.modification_stamp(), stamp);
}

#[test]
fn test_config_validation() {
    let bad = IdentityMap::<u8, u8, ahash::RandomState>::with_config(
        16,
        0.0,
        Strength::Weak,
        ahash::RandomState::new(),
    );
    assert!(matches!(bad, Err(Error::InvalidArgument { .. })));

    let bad = IdentityMap::<u8, u8, ahash::RandomState>::with_config(
        16,
        f32::NAN,
        Strength::Weak,
        ahash::RandomState::new(),
    );
    assert!(matches!(bad, Err(Error::InvalidArgument { .. })));

    let bad = IdentityMap::<u8, u8, ahash::RandomState>::with_config(
        usize::MAX,
        0.75,
        Strength::Weak,
        ahash::RandomState::new(),
    );
    assert!(matches!(bad, Err(Error::InvalidArgument { .. })));

    let ok = IdentityMap::<u8, u8, ahash::RandomState>::with_config(
        100,
        0.5,
        Strength::Soft,
        ahash::RandomState::new(),
    )
    .unwrap();
    assert_eq!(ok.capacity(), 128);
    assert_eq!(ok.strength(), Strength::Soft);
}

#[test]
fn test_value_holding_its_own_key_stays_alive() {
    let mut m: IdentityMap<String, Arc<String>> = IdentityMap::new();
    let k = Arc::new("self".to_string());
    m.insert(k.clone(), k.clone());
    drop(k);

    assert_eq!(m.purge(), 0);
    assert_eq!(m.len(), 1);
    assert_eq!(m.iter().count(), 1);
}
