// Store behavior suite.
//
// Each test documents what behavior is being verified and which
// invariants are assumed or asserted. The core invariants exercised:
// - Consistency: fetch(k) == v iff v's reverse bucket lists k.
// - Cascades: the death of a value, or of an encapsulated key target,
//   removes every forward, reverse and scalar_lookup entry it implies.
// - Strength: values and object keys are held weakly unless the options
//   ask for strong references.
// - Conflicts: a linked key only moves to another value through relink
//   with the right acknowledgment; failures change nothing.
use ref_store::{
    Heap, IdentityRemap, KeyStatus, Selector, Store, StoreError, StoreOptions, StoreStats,
};

fn empty() -> StoreStats {
    StoreStats::default()
}

// Test: bidirectional consistency across several associations.
// Assumes: keys_for lists the reverse bucket of a value.
// Verifies: every stored pair is visible from both directions.
#[test]
fn stored_pairs_are_visible_both_ways() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v1 = heap.alloc(1u32);
    let v2 = heap.alloc(2u32);
    let o = heap.alloc("object key");

    s.store("a", &v1, StoreOptions::default()).unwrap();
    s.store("b", &v1, StoreOptions::default()).unwrap();
    s.store(&o, &v2, StoreOptions::default()).unwrap();

    assert_eq!(s.fetch("a"), Some(v1.clone()));
    assert_eq!(s.fetch("b"), Some(v1.clone()));
    assert_eq!(s.fetch(&o), Some(v2.clone()));
    assert_eq!(s.keys_for(v1.id()), vec![Selector::str("a"), Selector::str("b")]);
    assert_eq!(s.keys_for(v2.id()), vec![Selector::Object(o.id())]);
    assert_eq!(
        s.stats(),
        StoreStats {
            forward: 3,
            reverse: 2,
            scalar_lookup: 3
        }
    );
    assert_eq!(*s.fetch("a").unwrap().payload::<u32>().unwrap(), 1);
}

// Test: fetch on unknown keys.
// Assumes: fetch never creates keys.
// Verifies: misses are None and leave every table untouched.
#[test]
fn fetch_miss_does_not_mutate() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let o = heap.alloc(());
    assert!(s.fetch("nope").is_none());
    assert!(s.fetch(&o).is_none());
    assert!(s.fetch(o.id()).is_none());
    assert_eq!(s.stats(), empty());
    assert_eq!(heap.live_objects(), 1);
}

// Test: cascading cleanup on value death.
// Assumes: values are weak by default.
// Verifies: after the value's last owner goes, the key is unknown, the
// reverse bucket is gone and the key object itself was destroyed.
#[test]
fn value_death_removes_association() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v = heap.alloc(());
    let id = v.id();
    s.store("k", &v, StoreOptions::default()).unwrap();
    s.store("j", &v, StoreOptions::default()).unwrap();
    assert_eq!(heap.strong_count(id), 1);

    drop(v);
    assert!(s.fetch("k").is_none());
    assert!(s.fetch("j").is_none());
    assert!(!s.has_value(id));
    assert_eq!(s.stats(), empty());
    assert_eq!(heap.live_objects(), 0);
    assert_eq!(heap.tracked_objects(), 0);
}

// Test: cascading cleanup on encapsulated-target death.
// Assumes: object keys hold their target weakly by default.
// Verifies: no residue in forward, reverse or scalar_lookup; the value
// survives and carries no stale action.
#[test]
fn key_target_death_removes_association() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let o = heap.alloc("target");
    let v = heap.alloc("value");
    let oid = o.id();
    s.store(&o, &v, StoreOptions::default()).unwrap();
    assert_eq!(heap.strong_count(oid), 1);

    drop(o);
    assert!(s.fetch(oid).is_none());
    assert!(!s.contains_key(oid));
    assert_eq!(s.stats(), empty());
    assert!(heap.is_live(v.id()));
    assert_eq!(heap.action_count(v.id()), 0);
    assert_eq!(heap.tracked_objects(), 0);
    // Only the value is left on the heap.
    assert_eq!(heap.live_objects(), 1);
}

// Test: strong object keys.
// Assumes: strong_key makes the key own its target.
// Verifies: the target outlives its external owners until the
// association ends, then is released.
#[test]
fn strong_key_keeps_target_until_value_dies() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let o = heap.alloc(());
    let v = heap.alloc(());
    let target = o.downgrade();
    s.store(&o, &v, StoreOptions::new().strong_key(true)).unwrap();

    drop(o);
    assert!(target.is_live());
    assert_eq!(s.fetch(target.id()), Some(v.clone()));

    drop(v);
    assert!(!target.is_live());
    assert_eq!(s.stats(), empty());
    assert_eq!(heap.live_objects(), 0);
}

// Test: weak-by-default values.
// Assumes: the forward entry is downgraded after store.
// Verifies: the store adds no strong count to the value.
#[test]
fn values_are_weak_by_default() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v = heap.alloc(());
    let w = v.downgrade();
    s.store("k", &v, StoreOptions::default()).unwrap();
    assert_eq!(heap.strong_count(v.id()), 1);
    drop(v);
    assert!(!w.is_live());
}

// Test: strong values.
// Assumes: strong_value keeps a strong forward entry.
// Verifies: the value survives its external owners and dies on unlink.
#[test]
fn strong_value_lives_until_unlinked() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v = heap.alloc(5i64);
    let w = v.downgrade();
    s.store("k", &v, StoreOptions::new().strong_value(true)).unwrap();
    assert_eq!(heap.strong_count(v.id()), 2);

    drop(v);
    assert!(w.is_live());
    assert_eq!(*s.fetch("k").unwrap().payload::<i64>().unwrap(), 5);

    assert!(s.unlink("k"));
    assert!(!w.is_live());
    assert_eq!(s.stats(), empty());
    assert_eq!(heap.live_objects(), 0);
}

// Test: idempotent store.
// Assumes: resolve_or_create_key returns the existing key object.
// Verifies: the second call reports Existing and changes nothing.
#[test]
fn storing_the_same_pair_twice_is_a_noop() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v = heap.alloc(());
    let o = heap.alloc(());
    assert_eq!(s.store("k", &v, StoreOptions::default()), Ok(KeyStatus::Created));
    assert_eq!(s.store(&o, &v, StoreOptions::default()), Ok(KeyStatus::Created));
    let stats = s.stats();
    let objects = heap.live_objects();
    let actions = (heap.action_count(v.id()), heap.action_count(o.id()));

    assert_eq!(s.store("k", &v, StoreOptions::default()), Ok(KeyStatus::Existing));
    assert_eq!(s.store(&o, &v, StoreOptions::default()), Ok(KeyStatus::Existing));
    assert_eq!(s.stats(), stats);
    assert_eq!(heap.live_objects(), objects);
    assert_eq!((heap.action_count(v.id()), heap.action_count(o.id())), actions);
}

// Test: conflict detection.
// Assumes: relinking without acknowledgment is always a conflict.
// Verifies: store and a wrongly acknowledged relink both fail without
// mutation; the right acknowledgment moves the key.
#[test]
fn relinking_requires_acknowledgment() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v1 = heap.alloc(1);
    let v2 = heap.alloc(2);
    let wrong = heap.alloc(3);
    s.store("k", &v1, StoreOptions::default()).unwrap();
    let before = s.stats();

    assert_eq!(
        s.store("k", &v2, StoreOptions::default()),
        Err(StoreError::KeyConflict {
            key: Selector::str("k"),
            existing: Some(v1.id()),
            requested: v2.id(),
        })
    );
    assert_eq!(
        s.relink("k", &v2, &wrong, StoreOptions::default()),
        Err(StoreError::KeyConflict {
            key: Selector::str("k"),
            existing: Some(v1.id()),
            requested: v2.id(),
        })
    );
    assert_eq!(s.stats(), before);
    assert_eq!(s.fetch("k"), Some(v1.clone()));

    assert_eq!(
        s.relink("k", &v2, &v1, StoreOptions::default()),
        Ok(KeyStatus::Created)
    );
    assert_eq!(s.fetch("k"), Some(v2.clone()));
    assert!(!s.has_value(v1.id()));
    assert_eq!(heap.action_count(v1.id()), 0);
    assert_eq!(s.keys_for(v2.id()), vec![Selector::str("k")]);
}

// Test: relink on a key with no association.
// Assumes: the acknowledged value must be the live association.
// Verifies: KeyConflict with no existing value.
#[test]
fn relink_of_unlinked_key_conflicts() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v = heap.alloc(());
    let old = heap.alloc(());
    assert_eq!(
        s.relink("k", &v, &old, StoreOptions::default()),
        Err(StoreError::KeyConflict {
            key: Selector::str("k"),
            existing: None,
            requested: v.id(),
        })
    );
    assert!(s.is_empty());
}

// Test: relink of an object key whose target only the key keeps alive.
// Assumes: unlinking drops the old key object and its hold on the target.
// Verifies: the target survives the move, so the key ends up linked to
// the new value instead of vanishing with an error.
#[test]
fn relink_keeps_key_target_alive_across_the_move() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let o = heap.alloc("target");
    let oid = o.id();
    let v1 = heap.alloc(1);
    let v2 = heap.alloc(2);
    let strong_key = StoreOptions::default().strong_key(true);
    s.store(oid, &v1, strong_key).unwrap();
    drop(o);
    assert!(heap.is_live(oid));

    assert_eq!(s.relink(oid, &v2, &v1, strong_key), Ok(KeyStatus::Created));
    assert_eq!(s.fetch(oid), Some(v2.clone()));
    assert!(heap.is_live(oid));
    assert!(s.keys_for(v1.id()).is_empty());
    assert_eq!(s.keys_for(v2.id()), vec![Selector::Object(oid)]);
    assert_eq!(
        s.stats(),
        StoreStats {
            forward: 1,
            reverse: 1,
            scalar_lookup: 1
        }
    );
}

// Test: handles from another heap sharing a slot id with local objects.
// Assumes: slot ids are unique only within one heap.
// Verifies: the foreign handle misses on every lookup and is rejected by
// store and relink; the local association is untouched.
#[test]
fn foreign_handles_never_match_local_keys() {
    let heap = Heap::new();
    let other = Heap::new();
    let o = heap.alloc(());
    let v = heap.alloc(());
    let foreign = other.alloc(());
    let foreign_value = other.alloc(());
    assert_eq!(foreign.id(), o.id());
    assert_eq!(foreign_value.id(), v.id());
    let s = Store::new(&heap);
    s.store(&o, &v, StoreOptions::default()).unwrap();

    assert_eq!(s.fetch(&foreign), None);
    assert!(!s.contains_key(&foreign));
    assert!(!s.unlink(&foreign));
    assert_eq!(
        s.store(&foreign, &v, StoreOptions::default()),
        Err(StoreError::ForeignObject(foreign.id()))
    );
    assert_eq!(
        s.relink(&foreign, &v, &v, StoreOptions::default()),
        Err(StoreError::ForeignObject(foreign.id()))
    );
    assert_eq!(
        s.relink(&o, &v, &foreign_value, StoreOptions::default()),
        Err(StoreError::ForeignObject(foreign_value.id()))
    );
    assert_eq!(s.purge(&foreign_value), 0);

    assert_eq!(s.fetch(&o), Some(v.clone()));
    assert_eq!(s.len(), 1);
    assert_eq!(heap.action_count(o.id()), 2);
}

// Test: explicit unlink of an object key.
// Assumes: unlink ends the association and the key object with it.
// Verifies: target-side actions are withdrawn and a second unlink misses.
#[test]
fn unlink_object_key_withdraws_target_actions() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let o = heap.alloc(());
    let v = heap.alloc(());
    s.store(&o, &v, StoreOptions::new().strong_key(true)).unwrap();
    assert_eq!(heap.strong_count(o.id()), 2);

    assert!(s.unlink(&o));
    assert!(!s.unlink(&o));
    assert_eq!(heap.strong_count(o.id()), 1);
    assert_eq!(heap.action_count(o.id()), 0);
    assert_eq!(heap.action_count(v.id()), 0);
    assert_eq!(s.stats(), empty());
    assert_eq!(heap.live_objects(), 2);
}

// Test: purge removes every key of one value.
// Assumes: keys_for reflects the reverse bucket.
// Verifies: the count returned and the emptied tables.
#[test]
fn purge_removes_all_keys_of_a_value() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v = heap.alloc(());
    let other = heap.alloc(());
    let o = heap.alloc(());
    s.store("a", &v, StoreOptions::default()).unwrap();
    s.store("b", &v, StoreOptions::default()).unwrap();
    s.store(&o, &v, StoreOptions::default()).unwrap();
    s.store("c", &other, StoreOptions::default()).unwrap();

    assert_eq!(s.purge(&v), 3);
    assert_eq!(s.purge(&v), 0);
    assert!(!s.has_value(v.id()));
    assert_eq!(s.len(), 1);
    assert_eq!(s.fetch("c"), Some(other.clone()));
    assert_eq!(heap.action_count(o.id()), 0);
}

// Test: reentrant cascade through the reverse table.
// Assumes: a strong key owns its target; the target is itself a value
// in the same store.
// Verifies: removing one bucket from reverse, during the resulting
// cascade, removes a second bucket from reverse; both removals apply.
#[test]
fn nested_removals_from_reverse_both_apply() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let t = heap.alloc("target and value");
    let v = heap.alloc("value");
    s.store(&t, &v, StoreOptions::new().strong_key(true)).unwrap();
    s.store("b", &t, StoreOptions::default()).unwrap();
    drop(t);
    assert_eq!(s.stats().reverse, 2);

    // v dies -> its bucket leaves reverse -> the key dies and releases t ->
    // t's bucket leaves reverse inside the outer removal.
    drop(v);
    assert_eq!(s.stats(), empty());
    assert_eq!(heap.live_objects(), 0);
    assert_eq!(heap.tracked_objects(), 0);
    assert!(heap.max_cascade_depth() >= 3);

    // The table is still in working order.
    let w = heap.alloc(());
    s.store("again", &w, StoreOptions::default()).unwrap();
    assert_eq!(s.fetch("again"), Some(w.clone()));
}

// Test: value destruction cascading through another value's payload.
// Assumes: payloads drop after the slot is unlinked.
// Verifies: both associations disappear.
#[test]
fn payload_cascade_cleans_inner_value() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let inner = heap.alloc(());
    let inner_id = inner.id();
    s.store("inner", &inner, StoreOptions::default()).unwrap();
    let outer = heap.alloc(inner);
    s.store("outer", &outer, StoreOptions::default()).unwrap();

    drop(outer);
    assert!(!heap.is_live(inner_id));
    assert_eq!(s.stats(), empty());
}

// Test: dropping the store.
// Assumes: the store owns its tables; objects outlive it.
// Verifies: strong references held by the store are released and no
// action survives on objects that outlive it.
#[test]
fn dropping_store_releases_strong_references() {
    let heap = Heap::new();
    let o = heap.alloc(());
    let v = heap.alloc(());
    {
        let s = Store::new(&heap);
        s.store(&o, &v, StoreOptions::new().strong_key(true).strong_value(true))
            .unwrap();
        assert_eq!(heap.strong_count(o.id()), 2);
        assert_eq!(heap.strong_count(v.id()), 2);
    }
    assert_eq!(heap.strong_count(o.id()), 1);
    assert_eq!(heap.strong_count(v.id()), 1);
    assert_eq!(heap.tracked_objects(), 0);
    assert_eq!(heap.live_objects(), 2);
}

// Test: duplication on the same heap.
// Assumes: identities missing from the remap are reused.
// Verifies: remapped values are used; strength flags carry over.
#[test]
fn duplicate_preserves_associations_and_strength() {
    let heap = Heap::new();
    let s = Store::new(&heap);
    let v1 = heap.alloc(1);
    let v1b = heap.alloc(10);
    let v2 = heap.alloc(2);
    let o = heap.alloc(());
    s.store("s", &v1, StoreOptions::default()).unwrap();
    s.store(&o, &v2, StoreOptions::new().strong_key(true).strong_value(true))
        .unwrap();

    let mut remap = IdentityRemap::new();
    remap.insert(v1.id(), v1b.clone());
    let copy = s.duplicate(&heap, &remap).unwrap();
    drop(remap);

    assert_eq!(copy.fetch("s"), Some(v1b.clone()));
    assert_eq!(copy.fetch(&o), Some(v2.clone()));
    assert_eq!(copy.stats(), s.stats());
    // Local handle plus one key per store.
    assert_eq!(heap.strong_count(o.id()), 3);
    assert_eq!(heap.strong_count(v2.id()), 3);
    assert_eq!(heap.strong_count(v1b.id()), 1);

    // The copy is independent of the original.
    drop(s);
    assert_eq!(copy.len(), 2);
    drop(v1b);
    assert!(copy.fetch("s").is_none());
    assert_eq!(copy.len(), 1);
}

// Test: duplication onto a fresh heap.
// Assumes: every identity is remapped to the new heap.
// Verifies: the copy cascades on the new objects; unmapped identities
// from another heap are rejected.
#[test]
fn duplicate_onto_another_heap() {
    let old = Heap::new();
    let new = Heap::new();
    let s = Store::new(&old);
    let o = old.alloc(());
    let v = old.alloc(());
    s.store(&o, &v, StoreOptions::default()).unwrap();

    let mut remap = IdentityRemap::new();
    let o2 = new.alloc(());
    let v2 = new.alloc(());
    remap.insert(o.id(), o2.clone());
    remap.insert(v.id(), v2.clone());
    assert_eq!(remap.len(), 2);

    let copy = s.duplicate(&new, &remap).unwrap();
    drop(remap);
    assert_eq!(copy.fetch(&o2), Some(v2.clone()));
    drop(o2);
    assert!(copy.is_empty());
    assert_eq!(new.live_objects(), 1);

    let partial = IdentityRemap::new();
    assert_eq!(
        s.duplicate(&new, &partial).unwrap_err(),
        StoreError::ForeignObject(v.id())
    );
}
