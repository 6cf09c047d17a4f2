use std::sync::Arc;

use identmap_rs::{IdentityMap, Strength};

#[test]
fn test_purge_accounting() {
    let mut m: IdentityMap<String, u32> = IdentityMap::with_capacity(64);
    let a = Arc::new("a".to_string());
    let b = Arc::new("b".to_string());
    let c = Arc::new("c".to_string());
    m.insert(a.clone(), 1);
    m.insert(b.clone(), 2);
    m.insert(c.clone(), 3);

    drop(b);
    // Not purged yet: still counted, never returned.
    assert_eq!(m.len(), 3);
    assert_eq!(m.iter().count(), 2);

    assert_eq!(m.purge(), 1);
    assert_eq!(m.len(), 2);
    assert_eq!(m.reclaimed_count(), 1);
    assert_eq!(m.get(&a), Some(1));
    assert_eq!(m.get(&c), Some(3));

    // Nothing left to purge.
    assert_eq!(m.purge(), 0);
    assert_eq!(m.reclaimed_count(), 1);
}

#[test]
fn test_purge_bumps_stamp_only_when_removing() {
    let mut m: IdentityMap<u8, u8> = IdentityMap::new();
    let k = Arc::new(1u8);
    m.insert(k.clone(), 1);

    let stamp = m.modification_stamp();
    assert_eq!(m.purge(), 0);
    assert_eq!(m.modification_stamp(), stamp);

    drop(k);
    assert_eq!(m.purge(), 1);
    assert_ne!(m.modification_stamp(), stamp);
}

#[test]
fn test_writes_sweep_eventually() {
    let mut m: IdentityMap<usize, usize> = IdentityMap::with_capacity(16);
    for i in 0..8 {
        m.insert(Arc::new(i), i);
    }
    assert_eq!(m.reclaimed_count(), 0);

    // Enough writes to pass one sweep interval without growing the table.
    let live: Vec<Arc<usize>> = (0..4).map(Arc::new).collect();
    for _ in 0..5 {
        for k in &live {
            m.insert(k.clone(), 0);
        }
    }
    assert_eq!(m.reclaimed_count(), 8);
    assert_eq!(m.len(), 4);
}

#[test]
fn test_resize_drops_cleared_entries() {
    let mut m: IdentityMap<usize, usize> = IdentityMap::with_capacity(8);
    let live: Vec<Arc<usize>> = (0..2).map(Arc::new).collect();
    for k in &live {
        m.insert(k.clone(), 1);
    }
    for i in 0..5 {
        m.insert(Arc::new(100 + i), 0);
    }

    // The seventh entry crosses the threshold of an eight-bucket table while its
    // own key is still alive; the four earlier orphans are dropped by the resize.
    assert_eq!(m.capacity(), 16);
    assert_eq!(m.reclaimed_count(), 4);
    assert_eq!(m.len(), 3);
    assert_eq!(m.purge(), 1);
}

#[test]
fn test_soft_keys_survive_until_pressure() {
    let mut m: IdentityMap<String, u32> = IdentityMap::with_strength(Strength::Soft);
    let kept = Arc::new("kept".to_string());
    m.insert(kept.clone(), 1);
    m.insert(Arc::new("orphan".to_string()), 2);

    // The map alone owns "orphan", which keeps it reachable.
    assert_eq!(m.purge(), 0);
    assert_eq!(m.iter().count(), 2);

    assert_eq!(m.reclaim_soft_references(), 1);
    assert_eq!(m.purge(), 1);
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(&kept), Some(1));
    assert_eq!(m.reclaimed_count(), 1);
}

#[test]
fn test_soft_release_then_weak_semantics() {
    let mut m: IdentityMap<String, u32> = IdentityMap::with_strength(Strength::Soft);
    let shared = Arc::new("shared".to_string());
    m.insert(shared.clone(), 7);

    // Shared keys are not released, but once released they behave weakly.
    assert_eq!(m.reclaim_soft_references(), 0);
    drop(shared);
    assert_eq!(m.purge(), 0);
    assert_eq!(m.reclaim_soft_references(), 1);
    assert_eq!(m.purge(), 1);
    assert!(m.is_empty());
}

#[test]
fn test_weak_map_has_nothing_to_release() {
    let mut m: IdentityMap<u32, u32> = IdentityMap::new();
    let k = Arc::new(1);
    m.insert(k.clone(), 1);
    assert_eq!(m.reclaim_soft_references(), 0);
    assert_eq!(m.get(&k), Some(1));
}

#[test]
fn test_reused_allocation_is_a_new_key() {
    let mut m: IdentityMap<u64, &str> = IdentityMap::new();
    for _ in 0..32 {
        let k = Arc::new(5u64);
        assert_eq!(m.get(&k), None);
        m.insert(k.clone(), "v");
        assert_eq!(m.get(&k), Some("v"));
    }
}
