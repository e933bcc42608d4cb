//! ActionList engine: per-object, ordered, de-duplicated cleanup actions.
//!
//! Invariants
//! - At most one action per `(target, selector)` pair is live in a list;
//!   adding a duplicate is a no-op.
//! - A list exists in the heap's side table only while it has live
//!   actions, or while it is firing.
//! - `trigger_all` runs once per object, at finalization. Each action is
//!   taken out of its slot (leaving it inert) before it runs, with no
//!   borrow of the side table held, so an action may remove or nullify
//!   entries of the list being walked. The list itself is dropped only
//!   after the walk. Once it is dropped the object accepts no further
//!   actions.
//! - A fatal error stops the walk; the remaining actions are discarded.

use crate::error::StoreError;
use crate::object::{Heap, ObjectId};
use crate::table::{Keepalive, KeepaliveOutcome, Selector, Sequence, Table};
use std::rc::{Rc, Weak};
use tracing::{debug, error, trace};

/// Direct cleanup step for teardown that a single removal cannot express.
/// Called with the finalizing object and the action's selector.
pub type ActionCallback = fn(&Heap, ObjectId, &Selector) -> Result<(), StoreError>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    RemoveByIdentity,
    RemoveByIndex,
    InvokeCallback,
}

/// Outcome of `Heap::del_action`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeletionStatus {
    NotFound,
    Deleted,
    /// The last action went away and the list was dropped.
    ListNowEmpty,
}

/// Reference from an action to the container it mutates.
pub enum ContainerRef<T> {
    Strong(Rc<T>),
    Weak(Weak<T>),
}

impl<T> ContainerRef<T> {
    fn upgrade(&self) -> Option<Rc<T>> {
        match self {
            ContainerRef::Strong(rc) => Some(rc.clone()),
            ContainerRef::Weak(w) => w.upgrade(),
        }
    }

    fn as_ptr(&self) -> *const () {
        match self {
            ContainerRef::Strong(rc) => Rc::as_ptr(rc) as *const (),
            ContainerRef::Weak(w) => Weak::as_ptr(w) as *const (),
        }
    }

    fn strengthen(self) -> Self {
        match self {
            ContainerRef::Weak(w) => match w.upgrade() {
                Some(rc) => ContainerRef::Strong(rc),
                None => ContainerRef::Weak(w),
            },
            strong => strong,
        }
    }
}

enum Target {
    Map(ContainerRef<Table>),
    Sequence(ContainerRef<Sequence>),
    Callback(ActionCallback),
}

/// Identity of an action target: a container allocation or a callback.
///
/// A weakly held container keeps its allocation, so the identity stays
/// unique for as long as any action names it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TargetId(*const ());

impl TargetId {
    pub fn table(table: &Rc<Table>) -> Self {
        TargetId(Rc::as_ptr(table) as *const ())
    }

    pub fn table_weak(table: &Weak<Table>) -> Self {
        TargetId(Weak::as_ptr(table) as *const ())
    }

    pub fn sequence(seq: &Rc<Sequence>) -> Self {
        TargetId(Rc::as_ptr(seq) as *const ())
    }

    pub fn callback(f: ActionCallback) -> Self {
        TargetId(f as *const ())
    }
}

/// One scheduled cleanup step.
pub struct Action {
    target: Target,
    selector: Selector,
}

impl Action {
    /// Remove `selector` from `table`. The table is held weakly.
    pub fn remove_from(table: &Rc<Table>, selector: Selector) -> Self {
        Self {
            target: Target::Map(ContainerRef::Weak(Rc::downgrade(table))),
            selector,
        }
    }

    /// Vacate slot `index` of `seq`. The sequence is held weakly.
    pub fn clear_index(seq: &Rc<Sequence>, index: usize) -> Self {
        Self {
            target: Target::Sequence(ContainerRef::Weak(Rc::downgrade(seq))),
            selector: Selector::Index(index),
        }
    }

    pub fn callback(f: ActionCallback, selector: Selector) -> Self {
        Self {
            target: Target::Callback(f),
            selector,
        }
    }

    /// Keep the target container alive for as long as the action exists.
    pub fn holding_container(mut self) -> Self {
        self.target = match self.target {
            Target::Map(c) => Target::Map(c.strengthen()),
            Target::Sequence(c) => Target::Sequence(c.strengthen()),
            cb => cb,
        };
        self
    }

    pub fn operation(&self) -> Operation {
        match self.target {
            Target::Map(_) => Operation::RemoveByIdentity,
            Target::Sequence(_) => Operation::RemoveByIndex,
            Target::Callback(_) => Operation::InvokeCallback,
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn target_id(&self) -> TargetId {
        match &self.target {
            Target::Map(c) => TargetId(c.as_ptr()),
            Target::Sequence(c) => TargetId(c.as_ptr()),
            Target::Callback(f) => TargetId::callback(*f),
        }
    }

    pub fn holds_container_weakly(&self) -> bool {
        matches!(
            self.target,
            Target::Map(ContainerRef::Weak(_)) | Target::Sequence(ContainerRef::Weak(_))
        )
    }

    fn matches(&self, target: TargetId, selector: &Selector) -> bool {
        self.target_id() == target && self.selector == *selector
    }

    fn selector_fits(&self) -> bool {
        match self.target {
            Target::Map(_) => !matches!(self.selector, Selector::Index(_)),
            Target::Sequence(_) => matches!(self.selector, Selector::Index(_)),
            Target::Callback(_) => true,
        }
    }

    /// Reject actions that could never do anything meaningful.
    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        let alive = match &self.target {
            Target::Map(c) => c.upgrade().is_some(),
            Target::Sequence(c) => c.upgrade().is_some(),
            Target::Callback(_) => true,
        };
        if !alive {
            return Err(StoreError::MissingContainer);
        }
        if !self.selector_fits() {
            return Err(StoreError::SelectorMismatch {
                operation: self.operation(),
                selector: self.selector.clone(),
            });
        }
        Ok(())
    }

    /// Run the action. Container mutations report what became of the
    /// container once its pin was released.
    fn fire(self, heap: &Heap, object: ObjectId) -> Result<Option<KeepaliveOutcome>, StoreError> {
        if !self.selector_fits() {
            return Err(StoreError::SelectorMismatch {
                operation: self.operation(),
                selector: self.selector,
            });
        }
        let outcome = match self.target {
            Target::Map(container) => {
                let Some(table) = container.upgrade() else {
                    debug!(object = ?object, selector = ?self.selector, "container already gone");
                    return Ok(None);
                };
                // Only the pin may keep the container alive from here on.
                drop(container);
                let pin = Keepalive::pin(table);
                let removed = pin.get().remove(&self.selector);
                trace!(object = ?object, container = pin.get().label(), selector = ?self.selector, hit = removed.is_some(), "remove");
                // The removed entry may own the last handle to objects
                // whose own actions mutate this table again.
                drop(removed);
                pin.finish()
            }
            Target::Sequence(container) => {
                let Some(seq) = container.upgrade() else {
                    debug!(object = ?object, selector = ?self.selector, "sequence already gone");
                    return Ok(None);
                };
                drop(container);
                let Selector::Index(index) = self.selector else {
                    unreachable!("selector kind checked above");
                };
                let pin = Keepalive::pin(seq);
                let removed = pin.get().clear(index);
                drop(removed);
                pin.finish()
            }
            Target::Callback(f) => return f(heap, object, &self.selector).map(|()| None),
        };
        Ok(Some(outcome))
    }
}

impl core::fmt::Debug for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Action")
            .field("operation", &self.operation())
            .field("selector", &self.selector)
            .field("target", &self.target_id())
            .finish()
    }
}

/// Ordered action list of one object. Slots are `None` once their action
/// fired or was nullified during firing.
#[derive(Debug, Default)]
pub(crate) struct ActionList {
    slots: Vec<Option<Action>>,
    firing: bool,
}

impl ActionList {
    /// Append unless an equivalent action is present; a rejected
    /// duplicate is handed back so it can be dropped outside any borrow.
    pub(crate) fn add(&mut self, action: Action) -> Result<(), Action> {
        let target = action.target_id();
        if self
            .slots
            .iter()
            .flatten()
            .any(|a| a.matches(target, &action.selector))
        {
            return Err(action);
        }
        self.slots.push(Some(action));
        Ok(())
    }

    pub(crate) fn remove(
        &mut self,
        target: TargetId,
        selector: &Selector,
    ) -> (DeletionStatus, Option<Action>) {
        let Some(pos) = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|a| a.matches(target, selector)))
        else {
            return (DeletionStatus::NotFound, None);
        };
        if self.firing {
            // Nullify in place; the walk still indexes this list.
            return (DeletionStatus::Deleted, self.slots[pos].take());
        }
        let removed = self.slots.remove(pos);
        let status = if self.live_len() == 0 {
            DeletionStatus::ListNowEmpty
        } else {
            DeletionStatus::Deleted
        };
        (status, removed)
    }

    pub(crate) fn live_len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn take_next(&mut self, cursor: &mut usize) -> Option<Action> {
        while *cursor < self.slots.len() {
            let i = *cursor;
            *cursor += 1;
            if let Some(action) = self.slots[i].take() {
                return Some(action);
            }
        }
        None
    }
}

/// Fire every action registered on `object`, in registration order.
pub(crate) fn trigger_all(heap: &Heap, object: ObjectId) -> Result<(), StoreError> {
    let actions = &heap.inner().actions;
    match actions.borrow_mut().get_mut(object.key()) {
        Some(list) => list.firing = true,
        None => {
            heap.close_actions(object);
            return Ok(());
        }
    }

    let depth = heap.inner().depth.current();
    let mut cursor = 0;
    let mut result = Ok(());
    loop {
        let next = match actions.borrow_mut().get_mut(object.key()) {
            Some(list) => list.take_next(&mut cursor),
            None => None,
        };
        let Some(action) = next else { break };
        trace!(object = ?object, depth, action = ?action, "fire");
        match action.fire(heap, object) {
            Ok(Some(KeepaliveOutcome::Released)) => {
                trace!(object = ?object, "container released after removal");
            }
            Ok(_) => {}
            Err(e) => {
                error!(object = ?object, depth, error = %e, "cleanup action failed; abandoning remaining actions");
                result = Err(e);
                break;
            }
        }
    }

    // Second pass: the list is freed only after the walk.
    heap.close_actions(object);
    let list = actions.borrow_mut().remove(object.key());
    drop(list);
    result
}
