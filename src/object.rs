//! Host object model: a single-threaded arena of reference-counted objects.
//!
//! Every object lives in a `SlotMap` slot carrying its payload and a
//! `StrongCount`. `Strong` handles own one count each (through a linear
//! token); `WeakRef` handles own nothing and upgrade only while the count
//! is positive. When the last `Strong` goes away the object is finalized:
//! its cleanup actions fire, the slot is unlinked, and only then is the
//! payload dropped, so payload drops may cascade into further
//! finalizations without observing a half-removed slot.

use crate::error::StoreError;
use crate::hooks::{self, DestroyHook};
use crate::action::ActionList;
use crate::reentrancy::CascadeDepth;
use crate::refcount::{StrongCount, Token};
use core::any::Any;
use core::cell::RefCell;
use core::hash::{Hash, Hasher};
use slotmap::{DefaultKey, SecondaryMap, SlotMap};
use std::rc::{Rc, Weak};
use tracing::{error, trace};

/// Stable, generational identity of a heap object. A stale id never
/// aliases an object allocated later in the same slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ObjectId(DefaultKey);

impl ObjectId {
    pub(crate) fn key(&self) -> DefaultKey {
        self.0
    }
}

struct Slot {
    strong: StrongCount,
    payload: Rc<dyn Any>,
    // Set once the action list has fired; later actions would never run.
    actions_closed: bool,
}

pub(crate) struct HeapInner {
    objects: RefCell<SlotMap<DefaultKey, Slot>>,
    // Side tables keyed by the same generational keys as `objects`.
    pub(crate) actions: RefCell<SecondaryMap<DefaultKey, ActionList>>,
    pub(crate) hooks: RefCell<SecondaryMap<DefaultKey, Vec<DestroyHook>>>,
    pub(crate) depth: CascadeDepth,
}

/// Handle to an object arena. Cloning shares the arena.
#[derive(Clone)]
pub struct Heap {
    inner: Rc<HeapInner>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(HeapInner {
                objects: RefCell::new(SlotMap::with_key()),
                actions: RefCell::new(SecondaryMap::new()),
                hooks: RefCell::new(SecondaryMap::new()),
                depth: CascadeDepth::new(),
            }),
        }
    }

    fn from_inner(inner: Rc<HeapInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &HeapInner {
        &self.inner
    }

    /// Allocate a new object with a strong count of one.
    pub fn alloc<T: Any>(&self, payload: T) -> Strong {
        let payload: Rc<dyn Any> = Rc::new(payload);
        let (key, token) = {
            let mut objects = self.inner.objects.borrow_mut();
            let key = objects.insert(Slot {
                strong: StrongCount::new(),
                payload,
                actions_closed: false,
            });
            (key, objects[key].strong.acquire())
        };
        trace!(object = ?ObjectId(key), "alloc");
        Strong {
            heap: self.inner.clone(),
            id: ObjectId(key),
            token: Some(token),
        }
    }

    /// Mint a new strong handle for a live object.
    pub fn strong(&self, id: ObjectId) -> Option<Strong> {
        let token = {
            let objects = self.inner.objects.borrow();
            let slot = objects.get(id.0)?;
            if slot.strong.get() == 0 {
                // Finalizing: the object is already dead to the outside.
                return None;
            }
            slot.strong.acquire()
        };
        Some(Strong {
            heap: self.inner.clone(),
            id,
            token: Some(token),
        })
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.strong_count(id) > 0
    }

    /// Current strong count; zero for destroyed or finalizing objects.
    pub fn strong_count(&self, id: ObjectId) -> usize {
        self.inner
            .objects
            .borrow()
            .get(id.0)
            .map(|s| s.strong.get())
            .unwrap_or(0)
    }

    /// Whether actions attached to `id` can still fire: true for live
    /// objects and for objects whose action list is firing.
    pub(crate) fn accepts_actions(&self, id: ObjectId) -> bool {
        self.inner
            .objects
            .borrow()
            .get(id.0)
            .is_some_and(|s| !s.actions_closed)
    }

    pub(crate) fn close_actions(&self, id: ObjectId) {
        if let Some(slot) = self.inner.objects.borrow_mut().get_mut(id.0) {
            slot.actions_closed = true;
        }
    }

    /// Number of allocated slots, including objects mid-finalization.
    pub fn live_objects(&self) -> usize {
        self.inner.objects.borrow().len()
    }

    /// Borrow an object's payload. Still available while the object is
    /// being finalized, so cleanup callbacks can read it.
    pub fn payload<T: Any>(&self, id: ObjectId) -> Option<Rc<T>> {
        let payload = self.inner.objects.borrow().get(id.0)?.payload.clone();
        payload.downcast::<T>().ok()
    }

    /// Whether `object` was allocated by this heap.
    pub fn owns(&self, object: &Strong) -> bool {
        Rc::ptr_eq(&self.inner, &object.heap)
    }

    pub(crate) fn check_owned(&self, object: &Strong) -> Result<(), StoreError> {
        if self.owns(object) {
            Ok(())
        } else {
            Err(StoreError::ForeignObject(object.id))
        }
    }

    /// Release a strong handle, reporting fatal conditions instead of
    /// panicking the way `Drop` has to.
    pub fn release(&self, object: Strong) -> Result<(), StoreError> {
        self.check_owned(&object)?;
        object.release()
    }

    /// Deepest destruction cascade observed on this heap.
    pub fn max_cascade_depth(&self) -> u32 {
        self.inner.depth.max()
    }

    fn finalize(&self, id: ObjectId) -> Result<(), StoreError> {
        let depth = self.inner.depth.enter();
        trace!(object = ?id, depth = depth.level(), "finalize");
        let result = hooks::notify_destroyed(self, id);

        // Unlink before drop: the payload may own the last handles to
        // other objects and cascade into nested finalizations.
        let slot = self.inner.objects.borrow_mut().remove(id.0);
        let leftover = self.inner.actions.borrow_mut().remove(id.0);
        drop(leftover);
        drop(slot);
        result
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.live_objects())
            .finish()
    }
}

/// Owning handle to a heap object. Clone increments the object's strong
/// count; dropping the last handle finalizes the object.
pub struct Strong {
    heap: Rc<HeapInner>,
    id: ObjectId,
    // Taken exactly once, by release or drop.
    token: Option<Token<'static, StrongCount>>,
}

impl Strong {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn heap(&self) -> Heap {
        Heap::from_inner(self.heap.clone())
    }

    pub fn downgrade(&self) -> WeakRef {
        WeakRef {
            heap: Rc::downgrade(&self.heap),
            id: self.id,
        }
    }

    pub fn payload<T: Any>(&self) -> Option<Rc<T>> {
        self.heap().payload(self.id)
    }

    pub fn strong_count(&self) -> usize {
        self.heap().strong_count(self.id)
    }

    /// Give up this handle; finalizes the object if it was the last one.
    pub fn release(mut self) -> Result<(), StoreError> {
        self.release_token()
    }

    fn release_token(&mut self) -> Result<(), StoreError> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };
        let reached_zero = {
            let objects = self.heap.objects.borrow();
            match objects.get(self.id.0) {
                Some(slot) => slot
                    .strong
                    .release(token)
                    .map_err(|_| StoreError::NegativeRefcount(self.id))?,
                None => {
                    core::mem::forget(token);
                    return Err(StoreError::DeadObject(self.id));
                }
            }
        };
        if reached_zero {
            Heap::from_inner(self.heap.clone()).finalize(self.id)
        } else {
            Ok(())
        }
    }
}

impl Clone for Strong {
    fn clone(&self) -> Self {
        let token = {
            let objects = self.heap.objects.borrow();
            let slot = objects
                .get(self.id.0)
                .expect("slot must exist while a Strong handle is live");
            slot.strong.acquire()
        };
        Self {
            heap: self.heap.clone(),
            id: self.id,
            token: Some(token),
        }
    }
}

impl Drop for Strong {
    fn drop(&mut self) {
        if let Err(e) = self.release_token() {
            error!(object = ?self.id, error = %e, "fatal error while releasing object");
            if !std::thread::panicking() {
                panic!("fatal error while releasing {:?}: {}", self.id, e);
            }
        }
    }
}

impl PartialEq for Strong {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.heap, &other.heap) && self.id == other.id
    }
}

impl Eq for Strong {}

impl Hash for Strong {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.heap) as usize).hash(state);
        self.id.hash(state);
    }
}

impl core::fmt::Debug for Strong {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Strong").field(&self.id).finish()
    }
}

/// Non-owning handle. Does not keep the object (or its heap) alive.
#[derive(Clone)]
pub struct WeakRef {
    heap: Weak<HeapInner>,
    id: ObjectId,
}

impl WeakRef {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Strong> {
        let inner = self.heap.upgrade()?;
        Heap::from_inner(inner).strong(self.id)
    }

    pub fn is_live(&self) -> bool {
        self.heap
            .upgrade()
            .map(|inner| Heap::from_inner(inner).is_live(self.id))
            .unwrap_or(false)
    }
}

impl PartialEq for WeakRef {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.heap, &other.heap) && self.id == other.id
    }
}

impl Eq for WeakRef {}

impl core::fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("WeakRef").field(&self.id).finish()
    }
}
