//! Error taxonomy shared by the action engine and the store.
//!
//! Every variant is fatal for the operation that produced it. Benign misses
//! (unknown key, absent action, container already gone) are reported through
//! `Option`/`bool`/`DeletionStatus` return values instead.

use crate::action::Operation;
use crate::object::ObjectId;
use crate::table::Selector;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A key already linked to one value was asked to link to another
    /// without acknowledging the current association. `existing` is `None`
    /// when a relink named an association that does not exist.
    #[error("key {key:?} is linked to {existing:?}; refusing to relink it to {requested:?}")]
    KeyConflict {
        key: Selector,
        existing: Option<ObjectId>,
        requested: ObjectId,
    },

    /// A strong count was asked to drop below zero.
    #[error("negative reference count on {0:?}")]
    NegativeRefcount(ObjectId),

    /// An action names a container that no longer exists.
    #[error("action target container is not alive")]
    MissingContainer,

    /// The selector kind cannot be applied by the action's operation.
    #[error("{operation:?} cannot use selector {selector:?}")]
    SelectorMismatch {
        operation: Operation,
        selector: Selector,
    },

    /// The object has already been destroyed (or is being finalized).
    #[error("{0:?} is not a live object")]
    DeadObject(ObjectId),

    /// The object was allocated by a different heap.
    #[error("{0:?} belongs to a different heap")]
    ForeignObject(ObjectId),
}
