//! Bidirectional reference store.
//!
//! Three tables make up a store:
//!
//! - `forward`: key identity -> value (weak unless `strong_value`),
//! - `reverse`: value identity -> bucket, a table of key identity -> key
//!   object (strong),
//! - `scalar_lookup`: key identity -> key object (weak), the registry that
//!   keeps one key object per identity.
//!
//! Reverse buckets own the key objects, so a key lives exactly as long as
//! its association. Everything else is torn down by cleanup actions:
//!
//! - value dies -> its bucket leaves `reverse` -> its keys die -> each key
//!   removes its `forward` and `scalar_lookup` entries;
//! - encapsulated target dies -> the key tears itself out of its bucket,
//!   `forward` and `scalar_lookup`.
//!
//! Invariant: `forward[k] == v` iff `reverse[v][k]` is the key object of `k`.

use crate::action::{Action, TargetId};
use crate::error::StoreError;
use crate::key::{self, KeyObject};
use crate::object::{Heap, ObjectId, Strong};
use crate::table::{Held, Selector, Table};
use hashbrown::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

/// Per-call reference strength.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreOptions {
    /// An object key keeps its target alive.
    pub strong_key: bool,
    /// The store keeps the value alive.
    pub strong_value: bool,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strong_key(mut self, yes: bool) -> Self {
        self.strong_key = yes;
        self
    }

    pub fn strong_value(mut self, yes: bool) -> Self {
        self.strong_value = yes;
        self
    }
}

/// Raw key accepted by the store: a string, or an object by identity.
///
/// A `Handle` from another heap never matches a key of this store; a bare
/// `Object` id is trusted to belong to the store's heap.
#[derive(Copy, Clone, Debug)]
pub enum LookupKey<'a> {
    Str(&'a str),
    Object(ObjectId),
    Handle(&'a Strong),
}

impl LookupKey<'_> {
    pub fn identity(&self) -> Selector {
        match self {
            LookupKey::Str(s) => Selector::str(s),
            LookupKey::Object(id) => Selector::Object(*id),
            LookupKey::Handle(h) => Selector::Object(h.id()),
        }
    }
}

impl<'a> From<&'a str> for LookupKey<'a> {
    fn from(s: &'a str) -> Self {
        LookupKey::Str(s)
    }
}

impl<'a> From<&'a String> for LookupKey<'a> {
    fn from(s: &'a String) -> Self {
        LookupKey::Str(s)
    }
}

impl<'a> From<&'a Strong> for LookupKey<'a> {
    fn from(h: &'a Strong) -> Self {
        LookupKey::Handle(h)
    }
}

impl From<ObjectId> for LookupKey<'_> {
    fn from(id: ObjectId) -> Self {
        LookupKey::Object(id)
    }
}

/// Whether `store` found an existing key object or created one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyStatus {
    Existing,
    Created,
}

/// Entry counts of the three tables.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreStats {
    pub forward: usize,
    pub reverse: usize,
    pub scalar_lookup: usize,
}

/// Old identity -> new object mapping used by `Store::duplicate`.
#[derive(Debug, Default)]
pub struct IdentityRemap {
    map: HashMap<ObjectId, Strong>,
}

impl IdentityRemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, old: ObjectId, new: Strong) -> Option<Strong> {
        self.map.insert(old, new)
    }

    pub fn get(&self, old: ObjectId) -> Option<&Strong> {
        self.map.get(&old)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

pub(crate) struct StoreInner {
    pub(crate) heap: Heap,
    pub(crate) forward: Rc<Table>,
    pub(crate) reverse: Rc<Table>,
    pub(crate) scalar_lookup: Rc<Table>,
}

impl StoreInner {
    /// Live key object registered for `identity`.
    pub(crate) fn resolve_key(&self, identity: &Selector) -> Option<Strong> {
        self.scalar_lookup.get(identity)?.upgrade()
    }

    /// Identity of `key` on this store's heap; `None` for a handle
    /// allocated by another heap.
    fn local_identity(&self, key: LookupKey<'_>) -> Option<Selector> {
        match key {
            LookupKey::Handle(h) if !self.heap.owns(h) => None,
            key => Some(key.identity()),
        }
    }

    /// Canonical key lookup. An existing key already linked to something
    /// other than `expected` is a conflict.
    pub(crate) fn resolve_or_create_key(
        self: &Rc<Self>,
        key: LookupKey<'_>,
        expected: Option<ObjectId>,
        options: StoreOptions,
    ) -> Result<(Strong, KeyStatus), StoreError> {
        if let LookupKey::Handle(h) = key {
            self.heap.check_owned(h)?;
        }
        let identity = key.identity();
        if let Some(existing) = self.resolve_key(&identity) {
            if let (Some(expected), Some(linked)) = (expected, self.forward.object_id_of(&identity)) {
                if linked != expected {
                    return Err(StoreError::KeyConflict {
                        key: identity,
                        existing: Some(linked),
                        requested: expected,
                    });
                }
            }
            return Ok((existing, KeyStatus::Existing));
        }

        let created = match key {
            LookupKey::Str(s) => key::create_simple_key(self, s)?,
            LookupKey::Handle(target) => {
                key::create_encapsulating_key(self, target, options.strong_key)?
            }
            LookupKey::Object(id) => {
                let target = self.heap.strong(id).ok_or(StoreError::DeadObject(id))?;
                key::create_encapsulating_key(self, &target, options.strong_key)?
            }
        };
        Ok((created, KeyStatus::Created))
    }

    /// Reverse bucket of `value`, created on first use.
    fn bucket_for(&self, value: &Selector) -> Rc<Table> {
        if let Some(bucket) = self.reverse.get(value).and_then(|h| h.as_table().cloned()) {
            return bucket;
        }
        let bucket = Table::new("bucket");
        let old = self.reverse.insert(value.clone(), Held::Table(bucket.clone()));
        drop(old);
        bucket
    }

    /// Remove `identity` from `value`'s bucket, and the bucket from
    /// `reverse` once it is empty. Removed entries are collected for the
    /// caller to drop once every table is consistent again.
    pub(crate) fn detach(&self, value: ObjectId, identity: &Selector, removed: &mut Vec<Held>) {
        let value_selector = Selector::Object(value);
        let Some(bucket) = self
            .reverse
            .get(&value_selector)
            .and_then(|h| h.as_table().cloned())
        else {
            return;
        };
        removed.extend(bucket.remove(identity));
        if bucket.is_empty() {
            self.heap
                .del_action(value, TargetId::table(&self.reverse), &value_selector);
            removed.extend(self.reverse.remove(&value_selector));
        }
    }

    fn unlink_identity(&self, identity: &Selector) -> bool {
        let Some(value) = self.forward.object_id_of(identity) else {
            return false;
        };
        let mut removed = Vec::new();
        self.detach(value, identity, &mut removed);
        removed.extend(self.forward.remove(identity));
        trace!(key = ?identity, value = ?value, "unlink");
        // Key objects die here and clean up `scalar_lookup` themselves.
        drop(removed);
        true
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Values outlive the store; take back the actions that name it.
        for selector in self.reverse.selectors() {
            if let Some(value) = selector.object_id() {
                self.heap
                    .del_action(value, TargetId::table(&self.reverse), &selector);
            }
        }
    }
}

/// Association store between keys (strings or objects) and value objects
/// on one heap.
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Store {
    pub fn new(heap: &Heap) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                heap: heap.clone(),
                forward: Table::new("forward"),
                reverse: Table::new("reverse"),
                scalar_lookup: Table::new("scalar_lookup"),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Rc<StoreInner> {
        &self.inner
    }

    pub fn heap(&self) -> &Heap {
        &self.inner.heap
    }

    /// Link `key` to `value`.
    ///
    /// Storing the pair that is already linked is a no-op. Storing a
    /// different value under a linked key fails with `KeyConflict` and
    /// changes nothing; use `relink` to replace an association.
    pub fn store<'a>(
        &self,
        key: impl Into<LookupKey<'a>>,
        value: &Strong,
        options: StoreOptions,
    ) -> Result<KeyStatus, StoreError> {
        let key = key.into();
        let inner = &self.inner;
        inner.heap.check_owned(value)?;
        if !inner.heap.is_live(value.id()) {
            return Err(StoreError::DeadObject(value.id()));
        }
        let (key_obj, status) = inner.resolve_or_create_key(key, Some(value.id()), options)?;
        let identity = key.identity();
        if status == KeyStatus::Existing && inner.forward.contains(&identity) {
            trace!(key = ?identity, value = ?value.id(), "already linked");
            return Ok(status);
        }

        let value_selector = Selector::Object(value.id());
        let bucket = inner.bucket_for(&value_selector);
        let old_key = bucket.insert(identity.clone(), Held::Strong(key_obj.clone()));
        let old_value = inner
            .forward
            .insert(identity.clone(), Held::Strong(value.clone()));
        inner.heap.add_action(
            value.id(),
            Action::remove_from(&inner.reverse, value_selector),
        )?;
        key::link_value(&inner.heap, &key_obj, &bucket)?;
        if !options.strong_value {
            inner.forward.weaken(&identity);
        }
        debug!(key = ?identity, value = ?value.id(), ?status, "stored");
        drop(old_key);
        drop(old_value);
        Ok(status)
    }

    /// Currently associated value, if the key is linked and the value is
    /// alive.
    pub fn fetch<'a>(&self, key: impl Into<LookupKey<'a>>) -> Option<Strong> {
        let identity = self.inner.local_identity(key.into())?;
        if !self.inner.scalar_lookup.contains(&identity) {
            return None;
        }
        self.inner.forward.get(&identity)?.upgrade()
    }

    /// Replace the association of a linked key, acknowledging `expected` as
    /// its current value. Fails with `KeyConflict`, changing nothing, when
    /// `expected` is not the live association. Key and value strength of
    /// the new association come from `options`.
    pub fn relink<'a>(
        &self,
        key: impl Into<LookupKey<'a>>,
        value: &Strong,
        expected: &Strong,
        options: StoreOptions,
    ) -> Result<KeyStatus, StoreError> {
        let key = key.into();
        if let LookupKey::Handle(h) = key {
            self.inner.heap.check_owned(h)?;
        }
        self.inner.heap.check_owned(value)?;
        self.inner.heap.check_owned(expected)?;
        let identity = key.identity();
        let linked = self.inner.forward.object_id_of(&identity);
        if linked != Some(expected.id()) || self.inner.resolve_key(&identity).is_none() {
            return Err(StoreError::KeyConflict {
                key: identity,
                existing: linked,
                requested: value.id(),
            });
        }
        if expected.id() == value.id() {
            return Ok(KeyStatus::Existing);
        }
        // The unlink may drop the last owner of an encapsulated target;
        // hold it until the new key exists.
        let target = match key {
            LookupKey::Object(id) => {
                let target = self.inner.heap.strong(id).ok_or(StoreError::DeadObject(id))?;
                Some(target)
            }
            _ => None,
        };
        // Linked -> Unlinked -> Linked.
        self.inner.unlink_identity(&identity);
        let status = match &target {
            Some(t) => self.store(t, value, options),
            None => self.store(key, value, options),
        };
        drop(target);
        status
    }

    /// Remove the association of `key`. Returns false if it had none.
    pub fn unlink<'a>(&self, key: impl Into<LookupKey<'a>>) -> bool {
        match self.inner.local_identity(key.into()) {
            Some(identity) => self.inner.unlink_identity(&identity),
            None => false,
        }
    }

    /// Remove every association to `value`; returns how many there were.
    pub fn purge(&self, value: &Strong) -> usize {
        if !self.inner.heap.owns(value) {
            return 0;
        }
        let mut purged = 0;
        for identity in self.keys_for(value.id()) {
            if self.inner.unlink_identity(&identity) {
                purged += 1;
            }
        }
        purged
    }

    /// Identities of the keys linked to `value`, sorted.
    pub fn keys_for(&self, value: ObjectId) -> Vec<Selector> {
        let mut keys = self
            .inner
            .reverse
            .get(&Selector::Object(value))
            .and_then(|h| h.as_table().map(|b| b.selectors()))
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn contains_key<'a>(&self, key: impl Into<LookupKey<'a>>) -> bool {
        let Some(identity) = self.inner.local_identity(key.into()) else {
            return false;
        };
        self.inner.scalar_lookup.contains(&identity) && self.inner.forward.contains(&identity)
    }

    /// Whether `value` has a reverse bucket.
    pub fn has_value(&self, value: ObjectId) -> bool {
        self.inner.reverse.contains(&Selector::Object(value))
    }

    pub fn len(&self) -> usize {
        self.inner.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.forward.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            forward: self.inner.forward.len(),
            reverse: self.inner.reverse.len(),
            scalar_lookup: self.inner.scalar_lookup.len(),
        }
    }

    /// Rebuild every association in a new store on `heap`, mapping object
    /// identities through `remap`. Identities missing from the remap are
    /// reused as they are. Key and value strength carry over; associations
    /// whose value or target is gone are skipped.
    pub fn duplicate(&self, heap: &Heap, remap: &IdentityRemap) -> Result<Store, StoreError> {
        let copy = Store::new(heap);
        let mut forward = self.inner.forward.entries();
        forward.sort_by(|a, b| a.0.cmp(&b.0));
        for (identity, held) in forward {
            let Some(old_value) = held.object_id() else {
                continue;
            };
            let value = match remap.get(old_value) {
                Some(v) => v.clone(),
                None => match held.upgrade() {
                    Some(v) => v,
                    None => continue,
                },
            };
            let options = StoreOptions::new().strong_value(held.is_strong());
            match &identity {
                Selector::Str(name) => {
                    copy.store(&**name, &value, options)?;
                }
                Selector::Object(old_target) => {
                    let strong_key = self
                        .inner
                        .resolve_key(&identity)
                        .and_then(|k| k.payload::<KeyObject>())
                        .is_some_and(|k| k.is_encapsulating() && k.holds_target_strongly());
                    let target = match remap.get(*old_target) {
                        Some(t) => t.clone(),
                        None => match self.inner.heap.strong(*old_target) {
                            Some(t) => t,
                            None => continue,
                        },
                    };
                    copy.store(&target, &value, options.strong_key(strong_key))?;
                }
                Selector::Index(_) => continue,
            }
        }
        debug!(associations = copy.len(), "store duplicated");
        Ok(copy)
    }
}

impl core::fmt::Debug for Store {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Store").field("stats", &self.stats()).finish()
    }
}
