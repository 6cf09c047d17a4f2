use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use identmap_rs::{Error, IdentityMap, Stamped, StampedHashMap, StampedMap};

#[test]
fn test_cursor_walks_live_entries() {
    let mut m: IdentityMap<u32, u32> = IdentityMap::with_capacity(4);
    let keys: Vec<Arc<u32>> = (0..20).map(Arc::new).collect();
    for k in &keys {
        m.insert(k.clone(), **k);
    }
    m.insert_null(100);

    let mut cursor = m.cursor();
    let mut seen = Vec::new();
    while let Some((k, v)) = cursor.next(&m).unwrap() {
        match k {
            Some(k) => assert_eq!(*k, v),
            None => assert_eq!(v, 100),
        }
        seen.push(v);
    }
    seen.sort_unstable();
    let mut expected: Vec<u32> = (0..20).collect();
    expected.push(100);
    assert_eq!(seen, expected);

    // Exhausted cursors stay exhausted.
    assert_eq!(cursor.next(&m).unwrap(), None);
}

#[test]
fn test_cursor_fails_fast_after_insert() {
    let mut m: IdentityMap<u32, u32> = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..4).map(Arc::new).collect();
    for k in &keys {
        m.insert(k.clone(), **k);
    }

    let mut cursor = m.cursor();
    assert!(cursor.next(&m).unwrap().is_some());

    let extra = Arc::new(99);
    m.insert(extra.clone(), 99);
    match cursor.next(&m) {
        Err(Error::ConcurrentModification { expected, actual }) => {
            assert_eq!(expected, cursor.expected_stamp());
            assert_eq!(actual, m.modification_stamp());
        }
        other => panic!("expected concurrent modification, got {other:?}"),
    }
}

#[test]
fn test_cursor_survives_value_update() {
    let mut m: IdentityMap<u32, u32> = IdentityMap::new();
    let keys: Vec<Arc<u32>> = (0..4).map(Arc::new).collect();
    for k in &keys {
        m.insert(k.clone(), 0);
    }

    let mut cursor = m.cursor();
    assert!(cursor.next(&m).unwrap().is_some());

    // Replacing a value is not a structural change.
    m.insert(keys[0].clone(), 1);
    assert!(cursor.next(&m).is_ok());
}

#[test]
fn test_cursor_fails_fast_after_purge() {
    let mut m: IdentityMap<u32, u32> = IdentityMap::new();
    let kept = Arc::new(1);
    let dropped = Arc::new(2);
    m.insert(kept.clone(), 1);
    m.insert(dropped.clone(), 2);

    let mut cursor = m.cursor();
    drop(dropped);
    assert_eq!(m.purge(), 1);
    assert!(matches!(cursor.next(&m), Err(Error::ConcurrentModification { .. })));
}

#[test]
fn test_stamps_never_repeat() {
    let mut m: IdentityMap<u32, u32> = IdentityMap::new();
    let mut stamps = HashSet::new();
    assert!(stamps.insert(m.modification_stamp()));

    let k = Arc::new(1);
    for _ in 0..50 {
        m.insert(k.clone(), 1);
        assert!(stamps.insert(m.modification_stamp()));
        m.remove(&k);
        assert!(stamps.insert(m.modification_stamp()));
    }
}

#[test]
fn test_stamps_unique_across_structures_and_threads() {
    let handles: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || {
                let mut stamps = Vec::new();
                let mut a: IdentityMap<u32, u32> = IdentityMap::new();
                let mut b: StampedHashMap<u32, u32> = StampedHashMap::new();
                let k = Arc::new(t);
                for i in 0..100 {
                    a.insert(k.clone(), i);
                    a.remove(&k);
                    stamps.push(a.modification_stamp());
                    StampedMap::insert(&mut b, i, i);
                    stamps.push(b.modification_stamp());
                }
                stamps
            })
        })
        .collect();

    let mut all = HashSet::new();
    for h in handles {
        for s in h.join().unwrap() {
            assert!(all.insert(s), "stamp {s} issued twice");
        }
    }
}
