//! Key identities.
//!
//! A simple key is identified by its string bytes and holds nothing
//! outside itself. An encapsulating key is identified by a wrapped object
//! and holds a reference to it, strong or weak. Each key registers its own
//! teardown with the action engine when it is created:
//!
//! - simple key: on its own death, remove its `scalar_lookup` and
//!   `forward` entries;
//! - encapsulating key: on its own death, and on the death of the wrapped
//!   target, run `teardown`, which removes every trace of the key from the
//!   store. Whichever side dies first does the work; the second call finds
//!   the target already taken and returns.

use crate::action::{Action, Operation, TargetId};
use crate::error::StoreError;
use crate::object::{Heap, ObjectId, Strong};
use crate::store::StoreInner;
use crate::table::{Held, Selector, Table};
use core::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

pub(crate) struct SimpleKey {
    name: Rc<str>,
}

pub(crate) struct EncapsulatingKey {
    target_id: ObjectId,
    // Taken exactly once, by the first teardown.
    target: RefCell<Option<Held>>,
    // Reverse bucket the key is linked into; identifies the link action
    // registered on the target.
    linked: RefCell<Option<Weak<Table>>>,
    store: Weak<StoreInner>,
}

/// Payload of a key object on the heap.
pub(crate) enum KeyObject {
    Simple(SimpleKey),
    Encapsulating(EncapsulatingKey),
}

impl KeyObject {
    /// Selector under which the key is found in `scalar_lookup`,
    /// `forward` and reverse buckets.
    pub(crate) fn identity(&self) -> Selector {
        match self {
            KeyObject::Simple(k) => Selector::Str(k.name.clone()),
            KeyObject::Encapsulating(k) => Selector::Object(k.target_id),
        }
    }

    pub(crate) fn is_encapsulating(&self) -> bool {
        matches!(self, KeyObject::Encapsulating(_))
    }

    pub(crate) fn holds_target_strongly(&self) -> bool {
        match self {
            KeyObject::Simple(_) => false,
            KeyObject::Encapsulating(k) => k
                .target
                .borrow()
                .as_ref()
                .is_some_and(Held::is_strong),
        }
    }
}

impl core::fmt::Debug for KeyObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KeyObject::Simple(k) => f.debug_tuple("SimpleKey").field(&k.name).finish(),
            KeyObject::Encapsulating(k) => f
                .debug_struct("EncapsulatingKey")
                .field("target", &k.target_id)
                .field("strong", &self.holds_target_strongly())
                .finish(),
        }
    }
}

pub(crate) fn create_simple_key(store: &StoreInner, name: &str) -> Result<Strong, StoreError> {
    let name: Rc<str> = Rc::from(name);
    let identity = Selector::Str(name.clone());
    let key = store.heap.alloc(KeyObject::Simple(SimpleKey { name }));
    store.heap.add_actions(
        key.id(),
        [
            Action::remove_from(&store.scalar_lookup, identity.clone()),
            Action::remove_from(&store.forward, identity.clone()),
        ],
    )?;
    let old = store
        .scalar_lookup
        .insert(identity, Held::Weak(key.downgrade()));
    drop(old);
    trace!(key = ?key.id(), "simple key created");
    Ok(key)
}

pub(crate) fn create_encapsulating_key(
    store: &Rc<StoreInner>,
    target: &Strong,
    strong: bool,
) -> Result<Strong, StoreError> {
    let heap = &store.heap;
    heap.check_owned(target)?;
    let target_id = target.id();
    let key = heap.alloc(KeyObject::Encapsulating(EncapsulatingKey {
        target_id,
        target: RefCell::new(Some(Held::Strong(target.clone()))),
        linked: RefCell::new(None),
        store: Rc::downgrade(store),
    }));
    let key_selector = Selector::Object(key.id());
    heap.add_action(
        key.id(),
        Action::callback(release_encapsulating_key, key_selector.clone()),
    )?;
    heap.add_action(
        target_id,
        Action::callback(encapsulated_target_destroyed, key_selector),
    )?;

    let old = store
        .scalar_lookup
        .insert(Selector::Object(target_id), Held::Weak(key.downgrade()));
    drop(old);
    if !strong {
        weaken(&key);
    }
    trace!(key = ?key.id(), target = ?target_id, strong, "encapsulating key created");
    Ok(key)
}

/// Downgrade an encapsulating key's reference to its target.
pub(crate) fn weaken(key: &Strong) {
    let Some(obj) = key.payload::<KeyObject>() else {
        return;
    };
    let KeyObject::Encapsulating(k) = &*obj else {
        return;
    };
    let old = {
        let mut target = k.target.borrow_mut();
        let weak = match target.as_ref() {
            Some(Held::Strong(s)) => Held::Weak(s.downgrade()),
            _ => return,
        };
        target.replace(weak)
    };
    // May have been the target's last owner.
    drop(old);
}

/// Make the target's death remove the key from `bucket`. No-op for simple
/// keys.
pub(crate) fn link_value(heap: &Heap, key: &Strong, bucket: &Rc<Table>) -> Result<(), StoreError> {
    let Some(obj) = key.payload::<KeyObject>() else {
        return Err(StoreError::DeadObject(key.id()));
    };
    let KeyObject::Encapsulating(k) = &*obj else {
        return Ok(());
    };
    let identity = Selector::Object(k.target_id);
    let previous = k.linked.replace(Some(Rc::downgrade(bucket)));
    if let Some(prev) = previous {
        if !Weak::ptr_eq(&prev, &Rc::downgrade(bucket)) {
            heap.del_action(k.target_id, TargetId::table_weak(&prev), &identity);
        }
    }
    heap.add_action(k.target_id, Action::remove_from(bucket, identity))?;
    Ok(())
}

fn release_encapsulating_key(heap: &Heap, key: ObjectId, _: &Selector) -> Result<(), StoreError> {
    match heap.payload::<KeyObject>(key) {
        Some(obj) => teardown(heap, key, &obj),
        None => Ok(()),
    }
}

fn encapsulated_target_destroyed(
    heap: &Heap,
    target: ObjectId,
    selector: &Selector,
) -> Result<(), StoreError> {
    let Some(key) = selector.object_id() else {
        return Err(StoreError::SelectorMismatch {
            operation: Operation::InvokeCallback,
            selector: selector.clone(),
        });
    };
    let Some(obj) = heap.payload::<KeyObject>(key) else {
        debug!(target = ?target, key = ?key, "key already gone");
        return Ok(());
    };
    trace!(target = ?target, key = ?key, "encapsulated target destroyed");
    // The key no longer needs to tear itself down when it dies.
    heap.del_action(
        key,
        TargetId::callback(release_encapsulating_key),
        &Selector::Object(key),
    );
    teardown(heap, key, &obj)
}

fn teardown(heap: &Heap, key: ObjectId, obj: &KeyObject) -> Result<(), StoreError> {
    let KeyObject::Encapsulating(k) = obj else {
        return Ok(());
    };
    let target = k.target.borrow_mut().take();
    let Some(target) = target else {
        return Ok(());
    };
    let identity = obj.identity();

    heap.del_action(
        k.target_id,
        TargetId::callback(encapsulated_target_destroyed),
        &Selector::Object(key),
    );
    let linked = k.linked.borrow_mut().take();
    if let Some(bucket) = linked {
        heap.del_action(k.target_id, TargetId::table_weak(&bucket), &identity);
    }

    let Some(store) = k.store.upgrade() else {
        debug!(key = ?key, "store already gone; releasing target only");
        drop(target);
        return Ok(());
    };

    let mut removed = Vec::new();
    // A newer key may own the identity by now; leave its entries alone.
    let ours = store
        .scalar_lookup
        .object_id_of(&identity)
        .map_or(true, |id| id == key);
    if ours {
        if let Some(value) = store.forward.object_id_of(&identity) {
            store.detach(value, &identity, &mut removed);
        }
        removed.extend(store.scalar_lookup.remove(&identity));
        removed.extend(store.forward.remove(&identity));
    }
    trace!(key = ?key, removed = removed.len(), "encapsulating key torn down");
    drop(store);
    drop(removed);
    drop(target);
    Ok(())
}
