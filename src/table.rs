//! Containers that cleanup actions mutate.
//!
//! `Table` is a map keyed by `Selector`; `Sequence` is an indexable list
//! whose slots can be vacated in place. Both are shared as `Rc` and use
//! interior mutability. Removal always unlinks first and hands the removed
//! entry back to the caller, so the interior borrow is released before the
//! entry is dropped. That drop may finalize objects whose cleanup actions
//! remove further entries from the very same container.

use crate::object::{ObjectId, Strong, WeakRef};
use core::cell::RefCell;
use hashbrown::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Key of a container entry, and the selector half of an action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
    /// Object identity.
    Object(ObjectId),
    /// Byte-equal string.
    Str(Rc<str>),
    /// Position in a `Sequence`.
    Index(usize),
}

impl Selector {
    pub fn str(s: &str) -> Self {
        Selector::Str(Rc::from(s))
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Selector::Object(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<ObjectId> for Selector {
    fn from(id: ObjectId) -> Self {
        Selector::Object(id)
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        Selector::str(s)
    }
}

/// A reference held by a container entry.
#[derive(Clone, Debug)]
pub enum Held {
    Strong(Strong),
    Weak(WeakRef),
    Table(Rc<Table>),
}

impl Held {
    /// Identity of the referenced object, known even after it died.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Held::Strong(s) => Some(s.id()),
            Held::Weak(w) => Some(w.id()),
            Held::Table(_) => None,
        }
    }

    pub fn upgrade(&self) -> Option<Strong> {
        match self {
            Held::Strong(s) => Some(s.clone()),
            Held::Weak(w) => w.upgrade(),
            Held::Table(_) => None,
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, Held::Strong(_))
    }

    pub fn as_table(&self) -> Option<&Rc<Table>> {
        match self {
            Held::Table(t) => Some(t),
            _ => None,
        }
    }
}

/// Selector-keyed map container.
pub struct Table {
    label: &'static str,
    entries: RefCell<HashMap<Selector, Held>>,
}

impl Table {
    pub fn new(label: &'static str) -> Rc<Self> {
        Rc::new(Self {
            label,
            entries: RefCell::new(HashMap::new()),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn contains(&self, selector: &Selector) -> bool {
        self.entries.borrow().contains_key(selector)
    }

    /// Clone of the entry; cloning a strong entry adds a strong count.
    pub fn get(&self, selector: &Selector) -> Option<Held> {
        self.entries.borrow().get(selector).cloned()
    }

    /// Identity of the object an entry refers to, without touching its
    /// strong count.
    pub fn object_id_of(&self, selector: &Selector) -> Option<ObjectId> {
        self.entries.borrow().get(selector).and_then(Held::object_id)
    }

    /// Insert, returning the replaced entry for the caller to drop.
    pub fn insert(&self, selector: Selector, held: Held) -> Option<Held> {
        self.entries.borrow_mut().insert(selector, held)
    }

    /// Unlink an entry and hand it back undropped.
    pub fn remove(&self, selector: &Selector) -> Option<Held> {
        self.entries.borrow_mut().remove(selector)
    }

    /// Downgrade a strong entry to weak. Returns false if the entry is
    /// missing or not strong.
    pub fn weaken(&self, selector: &Selector) -> bool {
        let old = {
            let mut entries = self.entries.borrow_mut();
            let weak = match entries.get(selector) {
                Some(Held::Strong(s)) => Held::Weak(s.downgrade()),
                _ => return false,
            };
            entries.insert(selector.clone(), weak)
        };
        // May be the last strong handle.
        drop(old);
        true
    }

    pub fn selectors(&self) -> Vec<Selector> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<(Selector, Held)> {
        self.entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl core::fmt::Debug for Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Table")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

/// Indexable container; clearing a slot leaves it vacant.
#[derive(Debug, Default)]
pub struct Sequence {
    slots: RefCell<Vec<Option<Held>>>,
}

impl Sequence {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Append and return the new index.
    pub fn push(&self, held: Held) -> usize {
        let mut slots = self.slots.borrow_mut();
        slots.push(Some(held));
        slots.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Held> {
        self.slots.borrow().get(index).and_then(|s| s.clone())
    }

    /// Vacate a slot, handing back its entry.
    pub fn clear(&self, index: usize) -> Option<Held> {
        self.slots.borrow_mut().get_mut(index).and_then(Option::take)
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }
}

/// Result of releasing a keepalive pin.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeepaliveOutcome {
    /// Other owners remain; `net_change` is how their number moved while
    /// the container was pinned.
    Retained { net_change: isize },
    /// The pin was the last owner and the container has been freed.
    Released,
}

/// Extra strong reference held on a container for the duration of one
/// mutating call, so a cascade that drops every other owner cannot free
/// it mid-mutation.
pub struct Keepalive<T> {
    pinned: Rc<T>,
    before: usize,
}

impl<T> Keepalive<T> {
    pub fn pin(container: Rc<T>) -> Self {
        let before = Rc::strong_count(&container) - 1;
        Self {
            pinned: container,
            before,
        }
    }

    pub fn get(&self) -> &T {
        &self.pinned
    }

    /// Drop the pin and report what became of the container.
    pub fn finish(self) -> KeepaliveOutcome {
        let after = Rc::strong_count(&self.pinned) - 1;
        let net_change = after as isize - self.before as isize;
        trace!(before = self.before, after, "keepalive released");
        drop(self.pinned);
        if after == 0 {
            KeepaliveOutcome::Released
        } else {
            KeepaliveOutcome::Retained { net_change }
        }
    }
}
