//! Lifecycle hooks: attaching cleanup actions and destroy callbacks to
//! heap objects, and the notification run when an object is finalized.

use crate::action::{self, Action, ActionList, DeletionStatus, TargetId};
use crate::error::StoreError;
use crate::object::{Heap, ObjectId};
use crate::table::Selector;
use tracing::{debug, trace};

/// Closure run once after an object's cleanup actions.
pub type DestroyHook = Box<dyn FnOnce(&Heap, ObjectId)>;

impl Heap {
    /// Attach a cleanup action to `object`. Returns `Ok(false)` when an
    /// equivalent action was already attached.
    ///
    /// Actions may be added while the object's list is firing; they run in
    /// the same walk. Once the walk is over (destroy hooks included) the
    /// object is dead to new actions.
    pub fn add_action(&self, object: ObjectId, action: Action) -> Result<bool, StoreError> {
        if !self.accepts_actions(object) {
            return Err(StoreError::DeadObject(object));
        }
        action.validate()?;
        let rejected = {
            let mut actions = self.inner().actions.borrow_mut();
            if !actions.contains_key(object.key()) {
                actions.insert(object.key(), ActionList::default());
            }
            match actions.get_mut(object.key()) {
                Some(list) => list.add(action).err(),
                None => return Err(StoreError::DeadObject(object)),
            }
        };
        let added = rejected.is_none();
        trace!(object = ?object, added, "add_action");
        // A duplicate may hold its container strongly.
        drop(rejected);
        Ok(added)
    }

    pub fn add_actions<I>(&self, object: ObjectId, actions: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = Action>,
    {
        for a in actions {
            self.add_action(object, a)?;
        }
        Ok(())
    }

    /// Remove the action identified by `(target, selector)` from `object`.
    pub fn del_action(
        &self,
        object: ObjectId,
        target: TargetId,
        selector: &Selector,
    ) -> DeletionStatus {
        let (status, removed, emptied) = {
            let mut actions = self.inner().actions.borrow_mut();
            let Some(list) = actions.get_mut(object.key()) else {
                return DeletionStatus::NotFound;
            };
            let (status, removed) = list.remove(target, selector);
            let emptied = if status == DeletionStatus::ListNowEmpty {
                actions.remove(object.key())
            } else {
                None
            };
            (status, removed, emptied)
        };
        trace!(object = ?object, ?status, "del_action");
        drop(removed);
        drop(emptied);
        status
    }

    /// Number of live actions attached to `object`.
    pub fn action_count(&self, object: ObjectId) -> usize {
        self.inner()
            .actions
            .borrow()
            .get(object.key())
            .map(ActionList::live_len)
            .unwrap_or(0)
    }

    /// Number of objects that currently own an action list.
    pub fn tracked_objects(&self) -> usize {
        self.inner().actions.borrow().len()
    }

    /// Run `hook` once `object` is finalized, after its cleanup actions.
    pub fn on_destroy<F>(&self, object: ObjectId, hook: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Heap, ObjectId) + 'static,
    {
        if !self.is_live(object) {
            return Err(StoreError::DeadObject(object));
        }
        let mut hooks = self.inner().hooks.borrow_mut();
        if !hooks.contains_key(object.key()) {
            hooks.insert(object.key(), Vec::new());
        }
        if let Some(list) = hooks.get_mut(object.key()) {
            list.push(Box::new(hook));
        }
        Ok(())
    }

    /// Drop every destroy hook attached to `object` without running them.
    pub fn cancel_hook(&self, object: ObjectId) -> bool {
        let removed = self.inner().hooks.borrow_mut().remove(object.key());
        let had = removed.as_ref().is_some_and(|h| !h.is_empty());
        drop(removed);
        had
    }
}

/// Finalization notification: cleanup actions first, then destroy hooks.
/// Hooks run even when an action failed; the action error is returned.
pub(crate) fn notify_destroyed(heap: &Heap, object: ObjectId) -> Result<(), StoreError> {
    let result = action::trigger_all(heap, object);
    let hooks = heap.inner().hooks.borrow_mut().remove(object.key());
    if let Some(hooks) = hooks {
        debug!(object = ?object, count = hooks.len(), "running destroy hooks");
        for hook in hooks {
            hook(heap, object);
        }
    }
    result
}
